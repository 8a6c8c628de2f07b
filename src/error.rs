//! LDAP errors

use std::{error, fmt, io, sync::Arc};

use futures::channel::mpsc::SendError;

use crate::ber::BerError;
use crate::channel::ChannelError;
use crate::model::{Control, LdapResult, ResultCode};

/// LDAP operation error
#[derive(Debug, Clone, Default)]
pub struct OperationError {
    /// Result code
    pub result_code: ResultCode,
    /// Matched DN
    pub matched_dn: String,
    /// Diagnostic message
    pub diagnostic_message: String,
    /// Referral URIs
    pub referrals: Vec<String>,
    /// Controls to attach to the response reporting this error
    pub controls: Vec<Control>,
    /// Underlying error, kept for diagnostics, never sent on the wire
    pub cause: Option<Arc<Error>>,
}

impl OperationError {
    pub fn new(result_code: ResultCode) -> Self {
        OperationError {
            result_code,
            ..Default::default()
        }
    }

    pub fn with_diagnostic(mut self, message: impl Into<String>) -> Self {
        self.diagnostic_message = message.into();
        self
    }

    pub fn with_matched_dn(mut self, dn: impl Into<String>) -> Self {
        self.matched_dn = dn.into();
        self
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    pub fn with_cause(mut self, cause: Error) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Result fields for the response that reports this error
    pub fn to_result(&self) -> LdapResult {
        LdapResult {
            result_code: self.result_code,
            matched_dn: self.matched_dn.clone(),
            diagnostic_message: self.diagnostic_message.clone(),
            referrals: self.referrals.clone(),
            controls: self.controls.clone(),
        }
    }
}

impl From<LdapResult> for OperationError {
    fn from(r: LdapResult) -> Self {
        OperationError {
            result_code: r.result_code,
            matched_dn: r.matched_dn,
            diagnostic_message: r.diagnostic_message,
            referrals: r.referrals,
            controls: r.controls,
            cause: None,
        }
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LDAP operation failed: {:?}", self.result_code)
    }
}

impl error::Error for OperationError {}

/// LDAP errors
///
/// Cloneable so a single outcome can be handed to every waiter of a shared
/// operation result.
#[derive(Debug, Clone)]
pub enum Error {
    Io(Arc<io::Error>),
    Ber(BerError),
    ElementTooLarge { size: usize, limit: usize },
    Channel(Arc<ChannelError>),
    Send(SendError),
    OperationFailed(OperationError),
    UnsupportedResponseType(u8),
    InvalidResponse,
    ConnectionClosed,
    ConnectTimeout,
    OperationTimeout,
    OperationCancelled,
    WaitTimeout,
    #[cfg(tls)]
    TlsNotConfigured,
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<BerError> for Error {
    fn from(e: BerError) -> Self {
        Error::Ber(e)
    }
}

impl From<ChannelError> for Error {
    fn from(e: ChannelError) -> Self {
        Error::Channel(Arc::new(e))
    }
}

impl From<SendError> for Error {
    fn from(e: SendError) -> Self {
        Error::Send(e)
    }
}

impl From<OperationError> for Error {
    fn from(e: OperationError) -> Self {
        Error::OperationFailed(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{}", e),
            Error::Ber(e) => write!(f, "{}", e),
            Error::ElementTooLarge { size, limit } => {
                write!(f, "Element of {} bytes exceeds the limit of {} bytes", size, limit)
            }
            Error::Channel(e) => write!(f, "{}", e),
            Error::Send(e) => write!(f, "{}", e),
            Error::OperationFailed(e) => write!(f, "LDAP operation failed: {:?}", e.result_code),
            Error::UnsupportedResponseType(tag) => {
                write!(f, "No response type for request tag 0x{:02X}", tag)
            }
            Error::InvalidResponse => write!(f, "Invalid response"),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::ConnectTimeout => write!(f, "Connect timed out"),
            Error::OperationTimeout => write!(f, "Operation timed out"),
            Error::OperationCancelled => write!(f, "Operation cancelled"),
            Error::WaitTimeout => write!(f, "Result wait timed out"),
            #[cfg(tls)]
            Error::TlsNotConfigured => write!(f, "TLS acceptor is not configured"),
        }
    }
}

impl Error {
    /// Whether this error invalidates the connection it occurred on
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Ber(_)
                | Error::ElementTooLarge { .. }
                | Error::Channel(_)
                | Error::ConnectionClosed
        )
    }
}
