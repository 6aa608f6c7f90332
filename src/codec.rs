//! Byte-level (de)serialization shared by every PDU format in the stack.
//!
//! Adapted from the teacher's `bytes::{ToBytes, FromBytes, ByteReader,
//! ByteWriter}` (`rubble/src/bytes.rs`). The teacher is zero-copy and
//! lifetime-scoped because its PDUs never leave the stack frame they were
//! decoded in; CourierStack's PDUs cross `tokio::sync::mpsc` channels
//! between the dispatcher thread and application callbacks, so `ByteReader`
//! borrows its input but `Decode` impls produce owned values, and
//! `ByteWriter` writes into a growable `Vec<u8>` instead of a fixed slice.
//!
//! Bluetooth wire fields are little-endian except SDP data elements, which
//! are big-endian (§4.1) — `ByteReader`/`ByteWriter` expose both.

use crate::error::CodecError;
use byteorder::{ByteOrder, BigEndian, LittleEndian};

/// Cursor over a borrowed byte slice. Never panics; every read that would
/// run past the end returns [`CodecError::TooShort`].
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn bytes_left(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_left() == 0
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.bytes_left() < n {
            Err(CodecError::TooShort { need: n, have: self.bytes_left() })
        } else {
            Ok(())
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u16_le(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        let v = LittleEndian::read_u16(&self.buf[self.pos..]);
        self.pos += 2;
        Ok(v)
    }

    pub fn read_u16_be(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        let v = BigEndian::read_u16(&self.buf[self.pos..]);
        self.pos += 2;
        Ok(v)
    }

    pub fn read_u32_le(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        let v = LittleEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        self.need(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    /// Reads exactly `n` bytes and returns them as an owned `Vec`.
    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>, CodecError> {
        self.need(n)?;
        let v = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(v)
    }

    /// Reads every remaining byte as an owned `Vec`.
    pub fn read_rest(&mut self) -> Vec<u8> {
        let v = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        v
    }

    pub fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }

    /// Errors if any bytes remain; used at the top level of a decode to
    /// enforce "parsing didn't consume the entire buffer" (spec.md §8).
    pub fn finish(&self) -> Result<(), CodecError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CodecError::IncompleteParse)
        }
    }
}

/// Growable output buffer. Unlike the teacher's fixed-capacity
/// `ByteWriter`, this never runs out of space; callers that need bounded
/// PDUs (ATT responses truncated to MTU) truncate explicitly before
/// writing, as spec.md's PDU-by-PDU truncation rules require.
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap) }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        let mut tmp = [0u8; 2];
        LittleEndian::write_u16(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_u16_be(&mut self, v: u16) {
        let mut tmp = [0u8; 2];
        BigEndian::write_u16(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_u32_le(&mut self, v: u32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Writes `data`, truncating to `max_len` if necessary. Used for
    /// notification/indication payloads and read responses, which silently
    /// truncate to the negotiated MTU rather than erroring (spec.md §4.4.4).
    pub fn write_slice_truncate(&mut self, data: &[u8], max_len: usize) {
        let data = if data.len() > max_len { &data[..max_len] } else { data };
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    /// Overwrites a previously-written byte at `offset`, used to patch a
    /// length prefix after the payload it describes has been written.
    pub fn patch_u8(&mut self, offset: usize, v: u8) {
        self.buf[offset] = v;
    }
}

/// Encodes `self` onto the wire. Implementations never fail: any bound
/// (MTU, fixed field width) must be enforced by the caller before encoding.
pub trait Encode {
    fn encode(&self, w: &mut ByteWriter);

    fn encoded(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        self.encode(&mut w);
        w.into_vec()
    }
}

/// Decodes `Self` from a reader. Must never panic on malformed input —
/// every failure path returns `CodecError` (spec.md §4.1).
pub trait Decode<'a>: Sized {
    fn decode(r: &mut ByteReader<'a>) -> Result<Self, CodecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_u16_le() {
        let mut w = ByteWriter::new();
        w.write_u16_le(0xBEEF);
        let bytes = w.into_vec();
        assert_eq!(bytes, vec![0xEF, 0xBE]);
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.read_u16_le().unwrap(), 0xBEEF);
        r.finish().unwrap();
    }

    #[test]
    fn short_read_errors_instead_of_panicking() {
        let bytes = [0x01];
        let mut r = ByteReader::new(&bytes);
        assert!(matches!(r.read_u16_le(), Err(CodecError::TooShort { .. })));
    }

    #[test]
    fn truncates_oversized_slices() {
        let mut w = ByteWriter::new();
        w.write_slice_truncate(&[1, 2, 3, 4, 5], 3);
        assert_eq!(w.into_vec(), vec![1, 2, 3]);
    }
}
