//! BER element writer

use std::mem;

use bytes::{BufMut, Bytes, BytesMut};

use super::{BerError, BOOLEAN_TRUE, TAG_BOOLEAN, TAG_ENUMERATED, TAG_INTEGER, TAG_NULL, TAG_OCTET_STRING, TAG_SEQUENCE};

/// Incremental writer producing definite-length BER elements.
///
/// Sequence contents are staged in per-depth scratch buffers so that the
/// length octets can be emitted before the contents once the sequence is
/// closed. Scratch buffers are recycled across elements, so a single writer
/// reused for many messages settles into steady-state allocations.
#[derive(Debug, Default)]
pub struct BerWriter {
    root: BytesMut,
    // one open tag per nesting level, scratch[d] backs the sequence at depth d + 1
    tags: Vec<u8>,
    scratch: Vec<BytesMut>,
}

impl BerWriter {
    pub fn new() -> Self {
        BerWriter::default()
    }

    /// Discards all written data, keeping buffers for reuse.
    pub fn clear(&mut self) {
        self.root.clear();
        self.tags.clear();
        for buf in &mut self.scratch {
            buf.clear();
        }
    }

    /// Completed top-level encoding written so far.
    ///
    /// Contents staged inside still-open sequences are not included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.root
    }

    /// Splits off the completed encoding, leaving the writer empty.
    pub fn take(&mut self) -> Bytes {
        self.root.split().freeze()
    }

    /// Number of currently open sequences.
    pub fn depth(&self) -> usize {
        self.tags.len()
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_boolean_tagged(TAG_BOOLEAN, value);
    }

    pub fn write_boolean_tagged(&mut self, tag: u8, value: bool) {
        let buf = self.current();
        buf.put_u8(tag);
        buf.put_u8(1);
        buf.put_u8(if value { BOOLEAN_TRUE } else { 0x00 });
    }

    pub fn write_integer(&mut self, value: i64) {
        self.write_integer_tagged(TAG_INTEGER, value);
    }

    pub fn write_integer_tagged(&mut self, tag: u8, value: i64) {
        let buf = self.current();
        buf.put_u8(tag);
        put_integer(buf, value);
    }

    pub fn write_enumerated(&mut self, value: i32) {
        self.write_integer_tagged(TAG_ENUMERATED, i64::from(value));
    }

    pub fn write_octet_string(&mut self, value: &[u8]) {
        self.write_octet_string_tagged(TAG_OCTET_STRING, value);
    }

    pub fn write_octet_string_tagged(&mut self, tag: u8, value: &[u8]) {
        let buf = self.current();
        buf.put_u8(tag);
        put_length(buf, value.len());
        buf.put_slice(value);
    }

    pub fn write_null(&mut self) {
        self.write_null_tagged(TAG_NULL);
    }

    /// Writes an empty element, used for NULL and for bodyless protocol ops.
    pub fn write_null_tagged(&mut self, tag: u8) {
        let buf = self.current();
        buf.put_u8(tag);
        buf.put_u8(0);
    }

    /// Appends an already encoded element verbatim.
    pub fn write_raw(&mut self, encoded: &[u8]) {
        self.current().put_slice(encoded);
    }

    pub fn write_start_sequence(&mut self) {
        self.write_start_sequence_tagged(TAG_SEQUENCE);
    }

    /// Opens a constructed element with the given tag.
    ///
    /// Contents go to a scratch buffer until the matching
    /// [`write_end_sequence`](Self::write_end_sequence) call.
    pub fn write_start_sequence_tagged(&mut self, tag: u8) {
        self.tags.push(tag);
        let depth = self.tags.len();
        if self.scratch.len() < depth {
            self.scratch.push(BytesMut::with_capacity(64));
        }
    }

    /// Closes the innermost open sequence, emitting its header and contents
    /// into the enclosing scope.
    pub fn write_end_sequence(&mut self) -> Result<(), BerError> {
        let tag = self.tags.pop().ok_or(BerError::SequenceNotStarted)?;
        let depth = self.tags.len();
        let contents = mem::take(&mut self.scratch[depth]);
        let buf = self.current();
        buf.put_u8(tag);
        put_length(buf, contents.len());
        buf.put_slice(&contents);
        // hand the allocation back for the next sequence at this depth
        let mut contents = contents;
        contents.clear();
        self.scratch[depth] = contents;
        Ok(())
    }

    fn current(&mut self) -> &mut BytesMut {
        match self.tags.len() {
            0 => &mut self.root,
            depth => &mut self.scratch[depth - 1],
        }
    }
}

/// Emits definite-form length octets, short form below 128.
fn put_length(buf: &mut BytesMut, len: usize) {
    debug_assert!(len <= u32::MAX as usize);
    if len < 0x80 {
        buf.put_u8(len as u8);
        return;
    }
    let be = (len as u32).to_be_bytes();
    let skip = be.iter().position(|b| *b != 0).unwrap_or(3);
    buf.put_u8(0x80 | (4 - skip) as u8);
    buf.put_slice(&be[skip..]);
}

/// Emits length octets and the minimal two's-complement contents.
fn put_integer(buf: &mut BytesMut, value: i64) {
    let mut width = 1;
    let mut v = value;
    while v < -0x80 || v > 0x7F {
        width += 1;
        v >>= 8;
    }
    buf.put_u8(width as u8);
    for i in (0..width).rev() {
        buf.put_u8((value >> (i * 8)) as u8);
    }
}
