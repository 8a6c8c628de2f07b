//! Streaming ASN.1 BER encoding and decoding

mod reader;
mod writer;

pub use reader::BerReader;
pub use writer::BerWriter;

/// Universal BOOLEAN tag
pub const TAG_BOOLEAN: u8 = 0x01;
/// Universal INTEGER tag
pub const TAG_INTEGER: u8 = 0x02;
/// Universal OCTET STRING tag
pub const TAG_OCTET_STRING: u8 = 0x04;
/// Universal NULL tag
pub const TAG_NULL: u8 = 0x05;
/// Universal ENUMERATED tag
pub const TAG_ENUMERATED: u8 = 0x0A;
/// Universal constructed SEQUENCE tag
pub const TAG_SEQUENCE: u8 = 0x30;
/// Universal constructed SET tag
pub const TAG_SET: u8 = 0x31;

/// Boolean TRUE content octet
pub(crate) const BOOLEAN_TRUE: u8 = 0xFF;

/// BER codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BerError {
    #[error("unexpected end of contents, {needed} more bytes required")]
    UnexpectedEnd { needed: usize },
    #[error("unexpected tag: expected 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedTag { expected: u8, actual: u8 },
    #[error("indefinite lengths are not supported")]
    IndefiniteLength,
    #[error("element length uses {0} length bytes, at most 4 are supported")]
    LengthOverflow(usize),
    #[error("integer content of {0} bytes exceeds the supported width")]
    IntegerWidth(usize),
    #[error("invalid {kind} content of {len} bytes")]
    InvalidContent { kind: &'static str, len: usize },
    #[error("sequence write not started")]
    SequenceNotStarted,
    #[error("sequence read not started")]
    SequenceReadNotStarted,
}

/// Parses the header of the first element in `buf` without consuming it.
///
/// Returns `Ok(Some((total, content)))` once the tag and length octets are
/// fully buffered, where `total` is the complete element size including the
/// header and `content` the declared content length. Returns `Ok(None)` when
/// more header bytes are needed, and an error for length encodings that can
/// never be valid (indefinite or wider than 4 length bytes).
pub fn peek_element(buf: &[u8]) -> Result<Option<(usize, usize)>, BerError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let first = buf[1];
    if first & 0x80 == 0 {
        let content = first as usize;
        return Ok(Some((2 + content, content)));
    }
    let n = (first & 0x7F) as usize;
    if n == 0 {
        return Err(BerError::IndefiniteLength);
    }
    if n > 4 {
        return Err(BerError::LengthOverflow(n));
    }
    if buf.len() < 2 + n {
        return Ok(None);
    }
    let mut content: u64 = 0;
    for b in &buf[2..2 + n] {
        content = (content << 8) | u64::from(*b);
    }
    let total = content
        .checked_add(2 + n as u64)
        .filter(|t| usize::try_from(*t).is_ok())
        .ok_or(BerError::LengthOverflow(n))?;
    Ok(Some((total as usize, content as usize)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_short_form() {
        assert_eq!(peek_element(&[0x04, 0x03, 1, 2, 3]).unwrap(), Some((5, 3)));
        assert_eq!(peek_element(&[0x04, 0x00]).unwrap(), Some((2, 0)));
    }

    #[test]
    fn peek_long_form() {
        let mut buf = vec![0x30, 0x81, 0x80];
        buf.extend(std::iter::repeat(0).take(128));
        assert_eq!(peek_element(&buf).unwrap(), Some((3 + 128, 128)));
        assert_eq!(peek_element(&[0x30, 0x82, 0x01, 0x00]).unwrap(), Some((4 + 256, 256)));
    }

    #[test]
    fn peek_incomplete_header() {
        assert_eq!(peek_element(&[]).unwrap(), None);
        assert_eq!(peek_element(&[0x30]).unwrap(), None);
        assert_eq!(peek_element(&[0x30, 0x82]).unwrap(), None);
        assert_eq!(peek_element(&[0x30, 0x82, 0x01]).unwrap(), None);
    }

    #[test]
    fn peek_rejects_bad_lengths() {
        assert_eq!(peek_element(&[0x30, 0x80]), Err(BerError::IndefiniteLength));
        assert_eq!(
            peek_element(&[0x30, 0x85, 0, 0, 0, 0, 1]),
            Err(BerError::LengthOverflow(5))
        );
    }
}
