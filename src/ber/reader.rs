//! BER element reader

use bytes::Bytes;

use super::{peek_element, BerError, TAG_BOOLEAN, TAG_ENUMERATED, TAG_INTEGER, TAG_NULL, TAG_OCTET_STRING, TAG_SEQUENCE};

#[derive(Debug, Clone)]
struct Mark {
    pos: usize,
    ends: Vec<usize>,
}

/// Cursor-style reader over a complete BER-encoded buffer.
///
/// Entering a constructed element with [`read_start_sequence`] bounds all
/// further reads to that element until the matching [`read_end_sequence`],
/// which discards any unread contents. Octet string reads hand out
/// reference-counted slices of the underlying buffer, so a decoded message
/// stays valid independently of the reader.
///
/// [`read_start_sequence`]: Self::read_start_sequence
/// [`read_end_sequence`]: Self::read_end_sequence
#[derive(Debug, Clone)]
pub struct BerReader {
    buf: Bytes,
    pos: usize,
    // innermost scope last, each entry is an absolute end offset
    ends: Vec<usize>,
    mark: Option<Mark>,
}

impl BerReader {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        BerReader {
            buf: buf.into(),
            pos: 0,
            ends: Vec::new(),
            mark: None,
        }
    }

    /// Absolute read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left in the innermost open scope.
    pub fn remaining(&self) -> usize {
        self.limit() - self.pos
    }

    /// Remembers the current position and scope nesting for [`reset`](Self::reset).
    pub fn mark(&mut self) {
        self.mark = Some(Mark {
            pos: self.pos,
            ends: self.ends.clone(),
        });
    }

    /// Rewinds to the most recent [`mark`](Self::mark), if any. The mark stays
    /// set, so resetting is repeatable.
    pub fn reset(&mut self) {
        if let Some(mark) = &self.mark {
            self.pos = mark.pos;
            self.ends = mark.ends.clone();
        }
    }

    /// Tag of the next element, without consuming anything.
    pub fn peek_type(&self) -> Result<u8, BerError> {
        if self.pos < self.limit() {
            Ok(self.buf[self.pos])
        } else {
            Err(BerError::UnexpectedEnd { needed: 1 })
        }
    }

    /// Content length of the next element, without consuming anything.
    pub fn peek_length(&self) -> Result<usize, BerError> {
        self.peek_header().map(|(_, content)| content)
    }

    /// Whether a complete element (header and contents) is available in the
    /// current scope.
    pub fn element_available(&self) -> bool {
        match self.peek_header() {
            Ok((header, content)) => header + content <= self.limit() - self.pos,
            Err(_) => false,
        }
    }

    /// Whether the innermost open sequence has unread contents.
    pub fn has_next_element(&self) -> bool {
        self.pos < self.limit()
    }

    pub fn read_boolean(&mut self) -> Result<bool, BerError> {
        self.read_boolean_tagged(TAG_BOOLEAN)
    }

    pub fn read_boolean_tagged(&mut self, tag: u8) -> Result<bool, BerError> {
        let len = self.read_header(Some(tag))?;
        if len != 1 {
            return Err(BerError::InvalidContent { kind: "boolean", len });
        }
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value != 0)
    }

    pub fn read_integer(&mut self) -> Result<i64, BerError> {
        self.read_integer_tagged(TAG_INTEGER)
    }

    /// Reads a two's-complement integer of one to eight content octets.
    pub fn read_integer_tagged(&mut self, tag: u8) -> Result<i64, BerError> {
        let len = self.read_header(Some(tag))?;
        if len == 0 || len > 8 {
            return Err(BerError::IntegerWidth(len));
        }
        let mut value: i64 = if self.buf[self.pos] & 0x80 != 0 { -1 } else { 0 };
        for b in &self.buf[self.pos..self.pos + len] {
            value = (value << 8) | i64::from(*b);
        }
        self.pos += len;
        Ok(value)
    }

    pub fn read_enumerated(&mut self) -> Result<i32, BerError> {
        let value = self.read_integer_tagged(TAG_ENUMERATED)?;
        i32::try_from(value).map_err(|_| BerError::IntegerWidth(8))
    }

    pub fn read_octet_string(&mut self) -> Result<Bytes, BerError> {
        self.read_octet_string_tagged(TAG_OCTET_STRING)
    }

    pub fn read_octet_string_tagged(&mut self, tag: u8) -> Result<Bytes, BerError> {
        let len = self.read_header(Some(tag))?;
        let value = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(value)
    }

    pub fn read_string(&mut self) -> Result<String, BerError> {
        self.read_string_tagged(TAG_OCTET_STRING)
    }

    pub fn read_string_tagged(&mut self, tag: u8) -> Result<String, BerError> {
        let value = self.read_octet_string_tagged(tag)?;
        Ok(String::from_utf8_lossy(&value).into_owned())
    }

    pub fn read_null(&mut self) -> Result<(), BerError> {
        self.read_null_tagged(TAG_NULL)
    }

    pub fn read_null_tagged(&mut self, tag: u8) -> Result<(), BerError> {
        let len = self.read_header(Some(tag))?;
        if len != 0 {
            return Err(BerError::InvalidContent { kind: "null", len });
        }
        Ok(())
    }

    pub fn read_start_sequence(&mut self) -> Result<(), BerError> {
        self.read_start_sequence_tagged(TAG_SEQUENCE)
    }

    /// Enters a constructed element, bounding further reads to its contents.
    pub fn read_start_sequence_tagged(&mut self, tag: u8) -> Result<(), BerError> {
        let len = self.read_header(Some(tag))?;
        self.ends.push(self.pos + len);
        Ok(())
    }

    /// Leaves the innermost constructed element, discarding unread contents.
    pub fn read_end_sequence(&mut self) -> Result<(), BerError> {
        let end = self.ends.pop().ok_or(BerError::SequenceReadNotStarted)?;
        self.pos = end;
        Ok(())
    }

    /// Skips over the next element, header and contents.
    pub fn skip_element(&mut self) -> Result<(), BerError> {
        let len = self.read_header(None)?;
        self.pos += len;
        Ok(())
    }

    fn limit(&self) -> usize {
        self.ends.last().copied().unwrap_or(self.buf.len())
    }

    fn peek_header(&self) -> Result<(usize, usize), BerError> {
        let avail = self.limit() - self.pos;
        match peek_element(&self.buf[self.pos..self.limit()])? {
            Some((total, content)) => Ok((total - content, content)),
            None => Err(BerError::UnexpectedEnd {
                needed: 2usize.saturating_sub(avail).max(1),
            }),
        }
    }

    /// Consumes the next element header, leaving the cursor on the contents.
    fn read_header(&mut self, expected: Option<u8>) -> Result<usize, BerError> {
        let actual = self.peek_type()?;
        if let Some(expected) = expected {
            if actual != expected {
                return Err(BerError::UnexpectedTag { expected, actual });
            }
        }
        let (header, content) = self.peek_header()?;
        let avail = self.limit() - self.pos;
        if header + content > avail {
            return Err(BerError::UnexpectedEnd {
                needed: header + content - avail,
            });
        }
        self.pos += header;
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::super::BerWriter;
    use super::*;

    fn reader_for(f: impl FnOnce(&mut BerWriter)) -> BerReader {
        let mut w = BerWriter::new();
        f(&mut w);
        BerReader::new(w.as_bytes().to_vec())
    }

    #[test]
    fn primitive_round_trip() {
        let mut r = reader_for(|w| {
            w.write_boolean(true);
            w.write_integer(-32769);
            w.write_enumerated(49);
            w.write_octet_string(b"uid=admin");
            w.write_null();
        });
        assert!(r.read_boolean().unwrap());
        assert_eq!(r.read_integer().unwrap(), -32769);
        assert_eq!(r.read_enumerated().unwrap(), 49);
        assert_eq!(&r.read_octet_string().unwrap()[..], b"uid=admin");
        r.read_null().unwrap();
        assert!(!r.has_next_element());
    }

    #[test]
    fn integer_boundaries_survive_round_trip() {
        for value in [0, 1, -1, 127, 128, 255, 256, -128, -129, 32767, 32768, i64::MIN, i64::MAX] {
            let mut r = reader_for(|w| w.write_integer(value));
            assert_eq!(r.read_integer().unwrap(), value, "value {value}");
        }
    }

    #[test]
    fn tag_mismatch_is_reported() {
        let mut r = reader_for(|w| w.write_integer(5));
        assert_eq!(
            r.read_octet_string(),
            Err(BerError::UnexpectedTag { expected: 0x04, actual: 0x02 })
        );
        // nothing was consumed
        assert_eq!(r.read_integer().unwrap(), 5);
    }

    #[test]
    fn truncated_contents_are_reported() {
        let mut r = BerReader::new(vec![0x04, 0x05, b'a', b'b']);
        assert_eq!(r.read_octet_string(), Err(BerError::UnexpectedEnd { needed: 3 }));
    }

    #[test]
    fn sequence_scopes_bound_reads() {
        let mut r = reader_for(|w| {
            w.write_start_sequence();
            w.write_integer(1);
            w.write_end_sequence().unwrap();
            w.write_integer(2);
        });
        r.read_start_sequence().unwrap();
        assert!(r.has_next_element());
        assert_eq!(r.read_integer().unwrap(), 1);
        assert!(!r.has_next_element());
        // the trailing integer is outside the scope
        assert!(r.read_integer().is_err());
        r.read_end_sequence().unwrap();
        assert_eq!(r.read_integer().unwrap(), 2);
    }

    #[test]
    fn end_sequence_discards_unread_contents() {
        let mut r = reader_for(|w| {
            w.write_start_sequence();
            w.write_integer(1);
            w.write_octet_string(b"skipped");
            w.write_end_sequence().unwrap();
            w.write_boolean(true);
        });
        r.read_start_sequence().unwrap();
        assert_eq!(r.read_integer().unwrap(), 1);
        r.read_end_sequence().unwrap();
        assert!(r.read_boolean().unwrap());
    }

    #[test]
    fn end_sequence_without_start_fails() {
        let mut r = reader_for(|w| w.write_null());
        assert_eq!(r.read_end_sequence(), Err(BerError::SequenceReadNotStarted));
    }

    #[test]
    fn mark_and_reset_restore_scope_state() {
        let mut r = reader_for(|w| {
            w.write_start_sequence();
            w.write_integer(7);
            w.write_start_sequence_tagged(0x60);
            w.write_integer(3);
            w.write_octet_string(b"cn=x");
            w.write_end_sequence().unwrap();
            w.write_end_sequence().unwrap();
        });
        r.read_start_sequence().unwrap();
        assert_eq!(r.read_integer().unwrap(), 7);
        r.mark();
        r.read_start_sequence_tagged(0x60).unwrap();
        assert_eq!(r.read_integer().unwrap(), 3);
        r.reset();
        // back in the outer scope, the whole inner element is readable again
        assert_eq!(r.peek_type().unwrap(), 0x60);
        r.read_start_sequence_tagged(0x60).unwrap();
        assert_eq!(r.read_integer().unwrap(), 3);
        assert_eq!(&r.read_octet_string().unwrap()[..], b"cn=x");
    }

    #[test]
    fn skip_element_passes_whole_element() {
        let mut r = reader_for(|w| {
            w.write_start_sequence();
            w.write_integer(1);
            w.write_end_sequence().unwrap();
            w.write_integer(9);
        });
        r.skip_element().unwrap();
        assert_eq!(r.read_integer().unwrap(), 9);
    }

    #[test]
    fn element_available_tracks_partial_input() {
        let r = BerReader::new(vec![0x04, 0x03, b'a']);
        assert!(!r.element_available());
        let r = BerReader::new(vec![0x04, 0x03, b'a', b'b', b'c']);
        assert!(r.element_available());
        let r = BerReader::new(Vec::new());
        assert!(!r.element_available());
    }

    #[test]
    fn strings_decode_lossily() {
        let mut r = BerReader::new(vec![0x04, 0x02, 0xFF, 0xFE]);
        let s = r.read_string().unwrap();
        assert_eq!(s.chars().count(), 2);
    }
}
