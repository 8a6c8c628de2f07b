use bytes::{BufMut, BytesMut};
use log::{error, trace};
use tokio_util::codec::{Decoder, Encoder};

use crate::ber::{peek_element, BerWriter};
use crate::error::Error;
use crate::framing::RawMessage;
use crate::model::{OutboundMessage, LDAP_VERSION_3};

/// Frames, encodes and shallow-decodes LDAP messages.
///
/// Decoding yields one [`RawMessage`] per complete top-level element and
/// leaves partial elements buffered. Encoding reuses one writer, so a
/// long-lived codec settles into steady-state allocations.
pub struct LdapCodec {
    // inbound content-length ceiling, zero for unlimited
    max_element_size: usize,
    version: i32,
    writer: BerWriter,
}

impl LdapCodec {
    pub fn new(max_element_size: usize) -> Self {
        LdapCodec {
            max_element_size,
            version: LDAP_VERSION_3,
            writer: BerWriter::new(),
        }
    }

    /// Protocol version applied to subsequent encodes
    pub fn set_version(&mut self, version: i32) {
        self.version = version;
    }

    pub fn version(&self) -> i32 {
        self.version
    }
}

impl Default for LdapCodec {
    fn default() -> Self {
        LdapCodec::new(0)
    }
}

impl Decoder for LdapCodec {
    type Item = RawMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (total, content) = match peek_element(src) {
            Ok(Some(lens)) => lens,
            Ok(None) => {
                trace!("Incomplete element header, {} bytes buffered", src.len());
                return Ok(None);
            }
            Err(e) => {
                error!("Framing error: {}", e);
                return Err(e.into());
            }
        };
        // checked as soon as the length is known, before buffering contents
        if self.max_element_size > 0 && content > self.max_element_size {
            error!(
                "Inbound element of {} bytes exceeds the limit of {} bytes",
                content, self.max_element_size
            );
            return Err(Error::ElementTooLarge {
                size: content,
                limit: self.max_element_size,
            });
        }
        if src.len() < total {
            trace!("Incomplete element: {} of {} bytes", src.len(), total);
            src.reserve(total - src.len());
            return Ok(None);
        }
        let packet = src.split_to(total).freeze();
        let msg = RawMessage::decode(packet)?;
        trace!(
            "Decoded message {}, op 0x{:02X}, {} bytes",
            msg.message_id,
            msg.op_tag,
            total
        );
        Ok(Some(msg))
    }
}

impl Encoder<OutboundMessage> for LdapCodec {
    type Error = Error;

    fn encode(&mut self, item: OutboundMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.writer.clear();
        item.encode(&mut self.writer, self.version)?;
        let encoded = self.writer.as_bytes();
        dst.reserve(encoded.len());
        dst.put_slice(encoded);
        trace!("Encoded message {}: {} bytes", item.message_id, encoded.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{OP_BIND_REQUEST, OP_UNBIND_REQUEST};
    use crate::model::{Control, LdapResult, Request, Response, LDAP_VERSION_2};
    use bytes::Bytes;

    fn encoded(msg: OutboundMessage) -> BytesMut {
        let mut codec = LdapCodec::default();
        let mut dst = BytesMut::new();
        codec.encode(msg, &mut dst).unwrap();
        dst
    }

    fn bind(id: i32) -> OutboundMessage {
        OutboundMessage::request(
            id,
            Request::SimpleBind {
                version: 3,
                name: "cn=admin".into(),
                password: Bytes::from_static(b"secret"),
            },
        )
    }

    #[test]
    fn byte_at_a_time_framing_matches_whole_buffer() {
        let bytes = encoded(bind(1));

        let mut codec = LdapCodec::default();
        let mut whole = bytes.clone();
        let from_whole = codec.decode(&mut whole).unwrap().unwrap();

        let mut codec = LdapCodec::default();
        let mut buf = BytesMut::new();
        let mut from_dribble = None;
        for (i, b) in bytes.iter().enumerate() {
            buf.put_u8(*b);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < bytes.len() {
                assert!(decoded.is_none(), "complete message after {} bytes", i + 1);
            } else {
                from_dribble = decoded;
            }
        }
        let from_dribble = from_dribble.expect("dribbled message");

        assert_eq!(from_whole.message_id, from_dribble.message_id);
        assert_eq!(from_whole.op_tag, from_dribble.op_tag);
        assert_eq!(from_whole.version, from_dribble.version);
        assert_eq!(from_whole.target_dn, from_dribble.target_dn);
    }

    #[test]
    fn back_to_back_messages_are_split() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded(bind(1)));
        buf.extend_from_slice(&encoded(bind(2)));

        let mut codec = LdapCodec::default();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.message_id, 1);
        assert_eq!(second.message_id, 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn trailing_partial_element_is_retained() {
        let second = encoded(bind(2));
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded(bind(1)));
        buf.extend_from_slice(&second[..5]);

        let mut codec = LdapCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().message_id, 1);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&second[5..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().message_id, 2);
    }

    #[test]
    fn oversized_element_is_fatal() {
        let mut codec = LdapCodec::new(16);
        // header declares 300 content bytes, none of which ever arrive
        let mut buf = BytesMut::from(&[0x30u8, 0x82, 0x01, 0x2C][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::ElementTooLarge { size: 300, limit: 16 })
        ));
    }

    #[test]
    fn garbage_length_is_fatal() {
        let mut codec = LdapCodec::default();
        let mut buf = BytesMut::from(&[0x30u8, 0x80][..]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Ber(_))));
    }

    #[test]
    fn bind_request_op_is_not_a_valid_response() {
        let raw = {
            let mut codec = LdapCodec::default();
            let mut buf = encoded(bind(1));
            codec.decode(&mut buf).unwrap().unwrap()
        };
        assert_eq!(raw.op_tag, OP_BIND_REQUEST);
        assert!(matches!(Response::decode(raw), Err(Error::InvalidResponse)));
    }

    #[test]
    fn version_gates_message_controls() {
        let mut response = Response::Result(LdapResult::success());
        if let Response::Result(r) = &mut response {
            r.controls = vec![Control::new("1.2.3.4")];
        }
        let msg = OutboundMessage::response(1, crate::framing::OP_ADD_REQUEST, response);

        let mut codec = LdapCodec::default();
        let mut v3 = BytesMut::new();
        codec.encode(msg.clone(), &mut v3).unwrap();

        codec.set_version(LDAP_VERSION_2);
        let mut v2 = BytesMut::new();
        codec.encode(msg, &mut v2).unwrap();
        assert!(v2.len() < v3.len());
    }

    #[test]
    fn unbind_round_trips_through_codec() {
        let mut codec = LdapCodec::default();
        let mut buf = encoded(OutboundMessage::request(3, Request::Unbind));
        let raw = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(raw.op_tag, OP_UNBIND_REQUEST);
        assert_eq!(raw.message_id, 3);
    }
}
