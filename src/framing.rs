//! LDAP message framing and shallow envelope decoding

use bytes::Bytes;

use crate::ber::{BerError, BerReader};

pub const OP_BIND_REQUEST: u8 = 0x60;
pub const OP_BIND_RESPONSE: u8 = 0x61;
pub const OP_UNBIND_REQUEST: u8 = 0x42;
pub const OP_SEARCH_REQUEST: u8 = 0x63;
pub const OP_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const OP_SEARCH_RESULT_DONE: u8 = 0x65;
pub const OP_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const OP_MODIFY_REQUEST: u8 = 0x66;
pub const OP_MODIFY_RESPONSE: u8 = 0x67;
pub const OP_ADD_REQUEST: u8 = 0x68;
pub const OP_ADD_RESPONSE: u8 = 0x69;
pub const OP_DELETE_REQUEST: u8 = 0x4A;
pub const OP_DELETE_RESPONSE: u8 = 0x6B;
pub const OP_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const OP_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const OP_COMPARE_REQUEST: u8 = 0x6E;
pub const OP_COMPARE_RESPONSE: u8 = 0x6F;
pub const OP_ABANDON_REQUEST: u8 = 0x50;
pub const OP_EXTENDED_REQUEST: u8 = 0x77;
pub const OP_EXTENDED_RESPONSE: u8 = 0x78;
pub const OP_INTERMEDIATE_RESPONSE: u8 = 0x79;

/// Message-level controls, context constructed `[0]`
pub const TAG_CONTROLS: u8 = 0xA0;

/// A framed LDAP message with its envelope fields decoded and the complete
/// element retained for full decoding by the consumer.
///
/// Only the fields a connection pipeline routes on are extracted up front:
/// the message ID, the protocol op tag and, for the requests that carry them,
/// the bind version and target DN. [`body`](Self::body) is positioned just
/// after the message ID with the envelope scope open, so a consumer reads the
/// protocol op, any controls, and closes the envelope itself.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub message_id: i32,
    pub op_tag: u8,
    /// Requested protocol version, bind requests only.
    pub version: Option<i32>,
    /// Entry the operation targets, where the operation names one.
    pub target_dn: Option<Bytes>,
    pub body: BerReader,
}

impl RawMessage {
    /// Decodes the envelope of one complete LDAP message.
    pub fn decode(packet: Bytes) -> Result<RawMessage, BerError> {
        let mut r = BerReader::new(packet);
        r.read_start_sequence()?;
        let message_id = envelope_int(r.read_integer()?)?;
        r.mark();

        let op_tag = r.peek_type()?;
        let mut version = None;
        let mut target_dn = None;
        match op_tag {
            OP_BIND_REQUEST => {
                r.read_start_sequence_tagged(OP_BIND_REQUEST)?;
                version = Some(envelope_int(r.read_integer()?)?);
                target_dn = Some(r.read_octet_string()?);
            }
            // the delete request is its DN, there is no inner sequence
            OP_DELETE_REQUEST => {
                target_dn = Some(r.read_octet_string_tagged(OP_DELETE_REQUEST)?);
            }
            OP_SEARCH_REQUEST
            | OP_MODIFY_REQUEST
            | OP_ADD_REQUEST
            | OP_MODIFY_DN_REQUEST
            | OP_COMPARE_REQUEST => {
                r.read_start_sequence_tagged(op_tag)?;
                target_dn = Some(r.read_octet_string()?);
            }
            _ => {}
        }

        // rewind so the body still hands over every field
        r.reset();
        Ok(RawMessage {
            message_id,
            op_tag,
            version,
            target_dn,
            body: r,
        })
    }

    /// Target DN decoded as text.
    pub fn target_dn_utf8(&self) -> Option<String> {
        self.target_dn
            .as_ref()
            .map(|dn| String::from_utf8_lossy(dn).into_owned())
    }
}

fn envelope_int(value: i64) -> Result<i32, BerError> {
    i32::try_from(value).map_err(|_| BerError::IntegerWidth(8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::BerWriter;

    fn message(f: impl FnOnce(&mut BerWriter)) -> Bytes {
        let mut w = BerWriter::new();
        f(&mut w);
        w.take()
    }

    fn bind_request(id: i64, version: i64, dn: &[u8]) -> Bytes {
        message(|w| {
            w.write_start_sequence();
            w.write_integer(id);
            w.write_start_sequence_tagged(OP_BIND_REQUEST);
            w.write_integer(version);
            w.write_octet_string(dn);
            w.write_octet_string_tagged(0x80, b"secret");
            w.write_end_sequence().unwrap();
            w.write_end_sequence().unwrap();
        })
    }

    #[test]
    fn bind_envelope_fields() {
        let msg = RawMessage::decode(bind_request(7, 3, b"cn=admin,dc=example")).unwrap();
        assert_eq!(msg.message_id, 7);
        assert_eq!(msg.op_tag, OP_BIND_REQUEST);
        assert_eq!(msg.version, Some(3));
        assert_eq!(msg.target_dn_utf8().as_deref(), Some("cn=admin,dc=example"));
    }

    #[test]
    fn body_hands_over_every_field() {
        let mut msg = RawMessage::decode(bind_request(7, 3, b"cn=admin")).unwrap();
        // the shallow decode must not have consumed anything past the id
        msg.body.read_start_sequence_tagged(OP_BIND_REQUEST).unwrap();
        assert_eq!(msg.body.read_integer().unwrap(), 3);
        assert_eq!(&msg.body.read_octet_string().unwrap()[..], b"cn=admin");
        assert_eq!(&msg.body.read_octet_string_tagged(0x80).unwrap()[..], b"secret");
        msg.body.read_end_sequence().unwrap();
        msg.body.read_end_sequence().unwrap();
    }

    #[test]
    fn delete_request_dn_is_the_op_contents() {
        let packet = message(|w| {
            w.write_start_sequence();
            w.write_integer(4);
            w.write_octet_string_tagged(OP_DELETE_REQUEST, b"uid=gone,dc=example");
            w.write_end_sequence().unwrap();
        });
        let mut msg = RawMessage::decode(packet).unwrap();
        assert_eq!(msg.op_tag, OP_DELETE_REQUEST);
        assert_eq!(msg.version, None);
        assert_eq!(msg.target_dn_utf8().as_deref(), Some("uid=gone,dc=example"));
        // and the body still reads it in full
        assert_eq!(
            &msg.body.read_octet_string_tagged(OP_DELETE_REQUEST).unwrap()[..],
            b"uid=gone,dc=example"
        );
    }

    #[test]
    fn ops_without_a_dn_leave_it_unset() {
        let packet = message(|w| {
            w.write_start_sequence();
            w.write_integer(2);
            w.write_null_tagged(OP_UNBIND_REQUEST);
            w.write_end_sequence().unwrap();
        });
        let msg = RawMessage::decode(packet).unwrap();
        assert_eq!(msg.op_tag, OP_UNBIND_REQUEST);
        assert_eq!(msg.version, None);
        assert!(msg.target_dn.is_none());

        let packet = message(|w| {
            w.write_start_sequence();
            w.write_integer(3);
            w.write_integer_tagged(OP_ABANDON_REQUEST, 2);
            w.write_end_sequence().unwrap();
        });
        let msg = RawMessage::decode(packet).unwrap();
        assert_eq!(msg.op_tag, OP_ABANDON_REQUEST);
        assert!(msg.target_dn.is_none());
    }

    #[test]
    fn search_request_dn_is_extracted() {
        let packet = message(|w| {
            w.write_start_sequence();
            w.write_integer(9);
            w.write_start_sequence_tagged(OP_SEARCH_REQUEST);
            w.write_octet_string(b"ou=people,dc=example");
            w.write_enumerated(2);
            w.write_end_sequence().unwrap();
            w.write_end_sequence().unwrap();
        });
        let msg = RawMessage::decode(packet).unwrap();
        assert_eq!(msg.target_dn_utf8().as_deref(), Some("ou=people,dc=example"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(RawMessage::decode(Bytes::from_static(&[0x02, 0x01, 0x01])).is_err());
        let packet = message(|w| {
            w.write_start_sequence();
            w.write_octet_string(b"not an id");
            w.write_end_sequence().unwrap();
        });
        assert!(RawMessage::decode(packet).is_err());
    }
}
