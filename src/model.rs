//! Protocol data structures and their wire forms

use std::mem;

use bytes::Bytes;

use crate::ber::{BerError, BerReader, BerWriter, TAG_BOOLEAN, TAG_SET};
use crate::error::Error;
use crate::framing::{
    RawMessage, OP_ABANDON_REQUEST, OP_ADD_REQUEST, OP_ADD_RESPONSE, OP_BIND_REQUEST,
    OP_BIND_RESPONSE, OP_COMPARE_REQUEST, OP_COMPARE_RESPONSE, OP_DELETE_REQUEST,
    OP_DELETE_RESPONSE, OP_EXTENDED_REQUEST, OP_EXTENDED_RESPONSE, OP_INTERMEDIATE_RESPONSE,
    OP_MODIFY_DN_REQUEST, OP_MODIFY_DN_RESPONSE, OP_MODIFY_REQUEST, OP_MODIFY_RESPONSE,
    OP_SEARCH_REQUEST, OP_SEARCH_RESULT_DONE, OP_SEARCH_RESULT_ENTRY, OP_SEARCH_RESULT_REFERENCE,
    OP_UNBIND_REQUEST, TAG_CONTROLS,
};

pub const LDAP_VERSION_2: i32 = 2;
pub const LDAP_VERSION_3: i32 = 3;

// context-specific tags used inside protocol ops
const TAG_AUTH_SIMPLE: u8 = 0x80;
const TAG_AUTH_SASL: u8 = 0xA3;
const TAG_SERVER_SASL_CREDS: u8 = 0x87;
const TAG_REFERRAL: u8 = 0xA3;
const TAG_EXTENDED_REQUEST_NAME: u8 = 0x80;
const TAG_EXTENDED_REQUEST_VALUE: u8 = 0x81;
const TAG_EXTENDED_RESPONSE_NAME: u8 = 0x8A;
const TAG_EXTENDED_RESPONSE_VALUE: u8 = 0x8B;
const TAG_INTERMEDIATE_NAME: u8 = 0x80;
const TAG_INTERMEDIATE_VALUE: u8 = 0x81;

/// LDAP result code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    CompareFalse,
    CompareTrue,
    AuthMethodNotSupported,
    StrongerAuthRequired,
    Referral,
    AdminLimitExceeded,
    UnavailableCriticalExtension,
    ConfidentialityRequired,
    SaslBindInProgress,
    NoSuchAttribute,
    UndefinedAttributeType,
    InappropriateMatching,
    ConstraintViolation,
    AttributeOrValueExists,
    InvalidAttributeSyntax,
    NoSuchObject,
    AliasProblem,
    InvalidDnSyntax,
    AliasDereferencingProblem,
    InappropriateAuthentication,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    LoopDetect,
    NamingViolation,
    ObjectClassViolation,
    NotAllowedOnNonLeaf,
    NotAllowedOnRdn,
    EntryAlreadyExists,
    ObjectClassModsProhibited,
    AffectsMultipleDsas,
    Other(u32),
}

impl ResultCode {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => ResultCode::Success,
            1 => ResultCode::OperationsError,
            2 => ResultCode::ProtocolError,
            3 => ResultCode::TimeLimitExceeded,
            4 => ResultCode::SizeLimitExceeded,
            5 => ResultCode::CompareFalse,
            6 => ResultCode::CompareTrue,
            7 => ResultCode::AuthMethodNotSupported,
            8 => ResultCode::StrongerAuthRequired,
            10 => ResultCode::Referral,
            11 => ResultCode::AdminLimitExceeded,
            12 => ResultCode::UnavailableCriticalExtension,
            13 => ResultCode::ConfidentialityRequired,
            14 => ResultCode::SaslBindInProgress,
            16 => ResultCode::NoSuchAttribute,
            17 => ResultCode::UndefinedAttributeType,
            18 => ResultCode::InappropriateMatching,
            19 => ResultCode::ConstraintViolation,
            20 => ResultCode::AttributeOrValueExists,
            21 => ResultCode::InvalidAttributeSyntax,
            32 => ResultCode::NoSuchObject,
            33 => ResultCode::AliasProblem,
            34 => ResultCode::InvalidDnSyntax,
            36 => ResultCode::AliasDereferencingProblem,
            48 => ResultCode::InappropriateAuthentication,
            49 => ResultCode::InvalidCredentials,
            50 => ResultCode::InsufficientAccessRights,
            51 => ResultCode::Busy,
            52 => ResultCode::Unavailable,
            53 => ResultCode::UnwillingToPerform,
            54 => ResultCode::LoopDetect,
            64 => ResultCode::NamingViolation,
            65 => ResultCode::ObjectClassViolation,
            66 => ResultCode::NotAllowedOnNonLeaf,
            67 => ResultCode::NotAllowedOnRdn,
            68 => ResultCode::EntryAlreadyExists,
            69 => ResultCode::ObjectClassModsProhibited,
            71 => ResultCode::AffectsMultipleDsas,
            other => ResultCode::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::CompareFalse => 5,
            ResultCode::CompareTrue => 6,
            ResultCode::AuthMethodNotSupported => 7,
            ResultCode::StrongerAuthRequired => 8,
            ResultCode::Referral => 10,
            ResultCode::AdminLimitExceeded => 11,
            ResultCode::UnavailableCriticalExtension => 12,
            ResultCode::ConfidentialityRequired => 13,
            ResultCode::SaslBindInProgress => 14,
            ResultCode::NoSuchAttribute => 16,
            ResultCode::UndefinedAttributeType => 17,
            ResultCode::InappropriateMatching => 18,
            ResultCode::ConstraintViolation => 19,
            ResultCode::AttributeOrValueExists => 20,
            ResultCode::InvalidAttributeSyntax => 21,
            ResultCode::NoSuchObject => 32,
            ResultCode::AliasProblem => 33,
            ResultCode::InvalidDnSyntax => 34,
            ResultCode::AliasDereferencingProblem => 36,
            ResultCode::InappropriateAuthentication => 48,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Busy => 51,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::LoopDetect => 54,
            ResultCode::NamingViolation => 64,
            ResultCode::ObjectClassViolation => 65,
            ResultCode::NotAllowedOnNonLeaf => 66,
            ResultCode::NotAllowedOnRdn => 67,
            ResultCode::EntryAlreadyExists => 68,
            ResultCode::ObjectClassModsProhibited => 69,
            ResultCode::AffectsMultipleDsas => 71,
            ResultCode::Other(other) => other,
        }
    }
}

impl Default for ResultCode {
    fn default() -> Self {
        ResultCode::Success
    }
}

/// Request or response control
#[derive(Clone, Debug, PartialEq)]
pub struct Control {
    /// Control type OID
    pub oid: String,
    /// Criticality, false when absent
    pub criticality: bool,
    /// Encoded control value
    pub value: Option<Bytes>,
}

impl Control {
    pub fn new(oid: impl Into<String>) -> Self {
        Control {
            oid: oid.into(),
            criticality: false,
            value: None,
        }
    }

    pub fn critical(mut self) -> Self {
        self.criticality = true;
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// LDAP attribute definition
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    /// Attribute name
    pub name: String,
    /// Attribute values
    pub values: Vec<Bytes>,
}

pub type Attributes = Vec<Attribute>;

/// Common result fields shared by all result responses
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    /// Referral URIs, v3 only on the wire
    pub referrals: Vec<String>,
    /// Controls attached to the message carrying this result
    pub controls: Vec<Control>,
}

impl LdapResult {
    pub fn new(result_code: ResultCode) -> Self {
        LdapResult {
            result_code,
            ..Default::default()
        }
    }

    pub fn success() -> Self {
        LdapResult::new(ResultCode::Success)
    }

    pub fn with_diagnostic(mut self, message: impl Into<String>) -> Self {
        self.diagnostic_message = message.into();
        self
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    pub fn is_success(&self) -> bool {
        self.result_code == ResultCode::Success
    }
}

/// Bind response
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindResult {
    pub result: LdapResult,
    pub server_sasl_credentials: Option<Bytes>,
}

/// Extended response
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtendedResult {
    pub result: LdapResult,
    pub name: Option<String>,
    pub value: Option<Bytes>,
}

/// Intermediate response
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntermediateResponse {
    pub name: Option<String>,
    pub value: Option<Bytes>,
}

/// Search result entry
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchEntry {
    pub object_name: String,
    pub attributes: Attributes,
}

/// Search result reference, v3 only on the wire
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchReference {
    pub uris: Vec<String>,
}

/// A response element produced by a request handler or received from a server
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// Plain result, its response tag follows from the request op
    Result(LdapResult),
    Bind(BindResult),
    Extended(ExtendedResult),
    Intermediate(IntermediateResponse),
    SearchEntry(SearchEntry),
    SearchReference(SearchReference),
}

impl Response {
    /// Result fields, for the response kinds that carry them
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            Response::Result(r) => Some(r),
            Response::Bind(b) => Some(&b.result),
            Response::Extended(e) => Some(&e.result),
            _ => None,
        }
    }

    /// Moves the embedded controls out for message-level encoding
    pub(crate) fn take_controls(&mut self) -> Vec<Control> {
        match self {
            Response::Result(r) => mem::take(&mut r.controls),
            Response::Bind(b) => mem::take(&mut b.result.controls),
            Response::Extended(e) => mem::take(&mut e.result.controls),
            _ => Vec::new(),
        }
    }

    /// Decodes a complete message into a typed response plus its
    /// message-level controls.
    pub fn decode(mut msg: RawMessage) -> Result<(Response, Vec<Control>), Error> {
        let r = &mut msg.body;
        let response = match msg.op_tag {
            OP_BIND_RESPONSE => {
                r.read_start_sequence_tagged(OP_BIND_RESPONSE)?;
                let result = read_result_fields(r)?;
                let server_sasl_credentials =
                    if r.has_next_element() && r.peek_type()? == TAG_SERVER_SASL_CREDS {
                        Some(r.read_octet_string_tagged(TAG_SERVER_SASL_CREDS)?)
                    } else {
                        None
                    };
                r.read_end_sequence()?;
                Response::Bind(BindResult {
                    result,
                    server_sasl_credentials,
                })
            }
            OP_SEARCH_RESULT_ENTRY => {
                r.read_start_sequence_tagged(OP_SEARCH_RESULT_ENTRY)?;
                let object_name = r.read_string()?;
                let mut attributes = Vec::new();
                r.read_start_sequence()?;
                while r.has_next_element() {
                    attributes.push(read_attribute(r)?);
                }
                r.read_end_sequence()?;
                r.read_end_sequence()?;
                Response::SearchEntry(SearchEntry {
                    object_name,
                    attributes,
                })
            }
            OP_SEARCH_RESULT_REFERENCE => {
                r.read_start_sequence_tagged(OP_SEARCH_RESULT_REFERENCE)?;
                let mut uris = Vec::new();
                while r.has_next_element() {
                    uris.push(r.read_string()?);
                }
                r.read_end_sequence()?;
                Response::SearchReference(SearchReference { uris })
            }
            OP_EXTENDED_RESPONSE => {
                r.read_start_sequence_tagged(OP_EXTENDED_RESPONSE)?;
                let result = read_result_fields(r)?;
                let mut name = None;
                let mut value = None;
                if r.has_next_element() && r.peek_type()? == TAG_EXTENDED_RESPONSE_NAME {
                    name = Some(r.read_string_tagged(TAG_EXTENDED_RESPONSE_NAME)?);
                }
                if r.has_next_element() && r.peek_type()? == TAG_EXTENDED_RESPONSE_VALUE {
                    value = Some(r.read_octet_string_tagged(TAG_EXTENDED_RESPONSE_VALUE)?);
                }
                r.read_end_sequence()?;
                Response::Extended(ExtendedResult { result, name, value })
            }
            OP_INTERMEDIATE_RESPONSE => {
                r.read_start_sequence_tagged(OP_INTERMEDIATE_RESPONSE)?;
                let mut name = None;
                let mut value = None;
                if r.has_next_element() && r.peek_type()? == TAG_INTERMEDIATE_NAME {
                    name = Some(r.read_string_tagged(TAG_INTERMEDIATE_NAME)?);
                }
                if r.has_next_element() && r.peek_type()? == TAG_INTERMEDIATE_VALUE {
                    value = Some(r.read_octet_string_tagged(TAG_INTERMEDIATE_VALUE)?);
                }
                r.read_end_sequence()?;
                Response::Intermediate(IntermediateResponse { name, value })
            }
            OP_SEARCH_RESULT_DONE | OP_MODIFY_RESPONSE | OP_ADD_RESPONSE | OP_DELETE_RESPONSE
            | OP_MODIFY_DN_RESPONSE | OP_COMPARE_RESPONSE => {
                r.read_start_sequence_tagged(msg.op_tag)?;
                let result = read_result_fields(r)?;
                r.read_end_sequence()?;
                Response::Result(result)
            }
            _ => return Err(Error::InvalidResponse),
        };

        let controls = if r.has_next_element() && r.peek_type()? == TAG_CONTROLS {
            read_controls(r)?
        } else {
            Vec::new()
        };
        r.read_end_sequence()?;
        Ok((response, controls))
    }
}

/// A request a client sends
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    SimpleBind {
        version: i32,
        name: String,
        password: Bytes,
    },
    SaslBind {
        version: i32,
        name: String,
        mechanism: String,
        credentials: Option<Bytes>,
    },
    Extended {
        name: String,
        value: Option<Bytes>,
    },
    Unbind,
    Abandon {
        message_id: i32,
    },
}

/// Message body to encode
#[derive(Clone, Debug, PartialEq)]
pub enum MessageBody {
    Request(Request),
    Response {
        /// Op tag of the request being answered, selects the response tag
        request_tag: u8,
        response: Response,
    },
}

/// A complete outbound message
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundMessage {
    pub message_id: i32,
    pub body: MessageBody,
    pub controls: Vec<Control>,
}

impl OutboundMessage {
    pub fn request(message_id: i32, request: Request) -> Self {
        OutboundMessage {
            message_id,
            body: MessageBody::Request(request),
            controls: Vec::new(),
        }
    }

    pub fn response(message_id: i32, request_tag: u8, mut response: Response) -> Self {
        let controls = response.take_controls();
        OutboundMessage {
            message_id,
            body: MessageBody::Response {
                request_tag,
                response,
            },
            controls,
        }
    }

    /// Unsolicited notification, message ID zero by definition
    pub fn unsolicited(notice: ExtendedResult) -> Self {
        OutboundMessage::response(0, OP_EXTENDED_REQUEST, Response::Extended(notice))
    }

    /// Encodes the message envelope and body. Controls are dropped for
    /// protocol version 2, which predates them.
    pub(crate) fn encode(&self, w: &mut BerWriter, version: i32) -> Result<(), Error> {
        w.write_start_sequence();
        w.write_integer(i64::from(self.message_id));
        match &self.body {
            MessageBody::Request(request) => encode_request(w, request)?,
            MessageBody::Response {
                request_tag,
                response,
            } => encode_response(w, *request_tag, response, version)?,
        }
        if version != LDAP_VERSION_2 && !self.controls.is_empty() {
            w.write_start_sequence_tagged(TAG_CONTROLS);
            for control in &self.controls {
                write_control(w, control)?;
            }
            w.write_end_sequence()?;
        }
        w.write_end_sequence()?;
        Ok(())
    }
}

/// Response op tag answering the given request op tag
pub fn response_tag_for(request_tag: u8) -> Option<u8> {
    match request_tag {
        OP_BIND_REQUEST => Some(OP_BIND_RESPONSE),
        OP_SEARCH_REQUEST => Some(OP_SEARCH_RESULT_DONE),
        OP_MODIFY_REQUEST => Some(OP_MODIFY_RESPONSE),
        OP_ADD_REQUEST => Some(OP_ADD_RESPONSE),
        OP_DELETE_REQUEST => Some(OP_DELETE_RESPONSE),
        OP_MODIFY_DN_REQUEST => Some(OP_MODIFY_DN_RESPONSE),
        OP_COMPARE_REQUEST => Some(OP_COMPARE_RESPONSE),
        OP_EXTENDED_REQUEST => Some(OP_EXTENDED_RESPONSE),
        _ => None,
    }
}

fn encode_request(w: &mut BerWriter, request: &Request) -> Result<(), BerError> {
    match request {
        Request::SimpleBind {
            version,
            name,
            password,
        } => {
            w.write_start_sequence_tagged(OP_BIND_REQUEST);
            w.write_integer(i64::from(*version));
            w.write_octet_string(name.as_bytes());
            w.write_octet_string_tagged(TAG_AUTH_SIMPLE, password);
            w.write_end_sequence()?;
        }
        Request::SaslBind {
            version,
            name,
            mechanism,
            credentials,
        } => {
            w.write_start_sequence_tagged(OP_BIND_REQUEST);
            w.write_integer(i64::from(*version));
            w.write_octet_string(name.as_bytes());
            w.write_start_sequence_tagged(TAG_AUTH_SASL);
            w.write_octet_string(mechanism.as_bytes());
            if let Some(credentials) = credentials {
                w.write_octet_string(credentials);
            }
            w.write_end_sequence()?;
            w.write_end_sequence()?;
        }
        Request::Extended { name, value } => {
            w.write_start_sequence_tagged(OP_EXTENDED_REQUEST);
            w.write_octet_string_tagged(TAG_EXTENDED_REQUEST_NAME, name.as_bytes());
            if let Some(value) = value {
                w.write_octet_string_tagged(TAG_EXTENDED_REQUEST_VALUE, value);
            }
            w.write_end_sequence()?;
        }
        Request::Unbind => w.write_null_tagged(OP_UNBIND_REQUEST),
        Request::Abandon { message_id } => {
            w.write_integer_tagged(OP_ABANDON_REQUEST, i64::from(*message_id))
        }
    }
    Ok(())
}

fn encode_response(
    w: &mut BerWriter,
    request_tag: u8,
    response: &Response,
    version: i32,
) -> Result<(), Error> {
    match response {
        Response::Result(result) => {
            let tag = response_tag_for(request_tag).ok_or(Error::UnsupportedResponseType(request_tag))?;
            w.write_start_sequence_tagged(tag);
            write_result_fields(w, result, version)?;
            w.write_end_sequence()?;
        }
        Response::Bind(bind) => {
            if request_tag != OP_BIND_REQUEST {
                return Err(Error::UnsupportedResponseType(request_tag));
            }
            w.write_start_sequence_tagged(OP_BIND_RESPONSE);
            write_result_fields(w, &bind.result, version)?;
            if let Some(credentials) = &bind.server_sasl_credentials {
                w.write_octet_string_tagged(TAG_SERVER_SASL_CREDS, credentials);
            }
            w.write_end_sequence()?;
        }
        Response::Extended(extended) => {
            if request_tag != OP_EXTENDED_REQUEST {
                return Err(Error::UnsupportedResponseType(request_tag));
            }
            w.write_start_sequence_tagged(OP_EXTENDED_RESPONSE);
            write_result_fields(w, &extended.result, version)?;
            if let Some(name) = &extended.name {
                w.write_octet_string_tagged(TAG_EXTENDED_RESPONSE_NAME, name.as_bytes());
            }
            if let Some(value) = &extended.value {
                w.write_octet_string_tagged(TAG_EXTENDED_RESPONSE_VALUE, value);
            }
            w.write_end_sequence()?;
        }
        Response::Intermediate(intermediate) => {
            w.write_start_sequence_tagged(OP_INTERMEDIATE_RESPONSE);
            if let Some(name) = &intermediate.name {
                w.write_octet_string_tagged(TAG_INTERMEDIATE_NAME, name.as_bytes());
            }
            if let Some(value) = &intermediate.value {
                w.write_octet_string_tagged(TAG_INTERMEDIATE_VALUE, value);
            }
            w.write_end_sequence()?;
        }
        Response::SearchEntry(entry) => {
            if request_tag != OP_SEARCH_REQUEST {
                return Err(Error::UnsupportedResponseType(request_tag));
            }
            w.write_start_sequence_tagged(OP_SEARCH_RESULT_ENTRY);
            w.write_octet_string(entry.object_name.as_bytes());
            w.write_start_sequence();
            for attribute in &entry.attributes {
                w.write_start_sequence();
                w.write_octet_string(attribute.name.as_bytes());
                w.write_start_sequence_tagged(TAG_SET);
                for value in &attribute.values {
                    w.write_octet_string(value);
                }
                w.write_end_sequence()?;
                w.write_end_sequence()?;
            }
            w.write_end_sequence()?;
            w.write_end_sequence()?;
        }
        Response::SearchReference(reference) => {
            if request_tag != OP_SEARCH_REQUEST {
                return Err(Error::UnsupportedResponseType(request_tag));
            }
            w.write_start_sequence_tagged(OP_SEARCH_RESULT_REFERENCE);
            for uri in &reference.uris {
                w.write_octet_string(uri.as_bytes());
            }
            w.write_end_sequence()?;
        }
    }
    Ok(())
}

fn write_result_fields(w: &mut BerWriter, result: &LdapResult, version: i32) -> Result<(), BerError> {
    w.write_enumerated(result.result_code.code() as i32);
    w.write_octet_string(result.matched_dn.as_bytes());
    w.write_octet_string(result.diagnostic_message.as_bytes());
    // referrals postdate v2
    if version != LDAP_VERSION_2 && !result.referrals.is_empty() {
        w.write_start_sequence_tagged(TAG_REFERRAL);
        for referral in &result.referrals {
            w.write_octet_string(referral.as_bytes());
        }
        w.write_end_sequence()?;
    }
    Ok(())
}

fn write_control(w: &mut BerWriter, control: &Control) -> Result<(), BerError> {
    w.write_start_sequence();
    w.write_octet_string(control.oid.as_bytes());
    if control.criticality {
        w.write_boolean(true);
    }
    if let Some(value) = &control.value {
        w.write_octet_string(value);
    }
    w.write_end_sequence()
}

fn read_result_fields(r: &mut BerReader) -> Result<LdapResult, BerError> {
    let result_code = ResultCode::from_code(r.read_enumerated()? as u32);
    let matched_dn = r.read_string()?;
    let diagnostic_message = r.read_string()?;
    let mut referrals = Vec::new();
    if r.has_next_element() && r.peek_type()? == TAG_REFERRAL {
        r.read_start_sequence_tagged(TAG_REFERRAL)?;
        while r.has_next_element() {
            referrals.push(r.read_string()?);
        }
        r.read_end_sequence()?;
    }
    Ok(LdapResult {
        result_code,
        matched_dn,
        diagnostic_message,
        referrals,
        controls: Vec::new(),
    })
}

fn read_attribute(r: &mut BerReader) -> Result<Attribute, BerError> {
    r.read_start_sequence()?;
    let name = r.read_string()?;
    let mut values = Vec::new();
    r.read_start_sequence_tagged(TAG_SET)?;
    while r.has_next_element() {
        values.push(r.read_octet_string()?);
    }
    r.read_end_sequence()?;
    r.read_end_sequence()?;
    Ok(Attribute { name, values })
}

pub(crate) fn read_controls(r: &mut BerReader) -> Result<Vec<Control>, BerError> {
    let mut controls = Vec::new();
    r.read_start_sequence_tagged(TAG_CONTROLS)?;
    while r.has_next_element() {
        r.read_start_sequence()?;
        let oid = r.read_string()?;
        let mut criticality = false;
        let mut value = None;
        if r.has_next_element() && r.peek_type()? == TAG_BOOLEAN {
            criticality = r.read_boolean()?;
        }
        if r.has_next_element() {
            value = Some(r.read_octet_string()?);
        }
        r.read_end_sequence()?;
        controls.push(Control {
            oid,
            criticality,
            value,
        });
    }
    r.read_end_sequence()?;
    Ok(controls)
}
