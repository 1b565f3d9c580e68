// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire formats.
//!
//! Everything that touches bytes lives here: the Clause 20.2 tag-length-value
//! codec for application data, the NPDU and APDU layouts, and the virtual
//! link control frames of each data link. Encoders compute their exact size
//! up front and write in one pass; decoders borrow the input slice and
//! bounds-check every read before trusting any length field.

pub mod apdu;
pub mod bvlc4;
pub mod bvlc6;
pub mod bvlcsc;
pub mod ethernet;
pub mod npdu;
pub mod primitives;
pub mod tag;
pub mod value;

use byteorder::{ByteOrder, NetworkEndian};

use crate::error::{DecodeError, DecodeResult};

/// A frame or PDU that can be written to the wire.
///
/// `encode` appends exactly `encoded_len()` bytes; callers reserve once and
/// write once.
pub trait Encodable {
    fn encoded_len(&self) -> usize;
    fn encode(&self, buf: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        debug_assert_eq!(buf.len(), buf.capacity());
        buf
    }
}

/// A frame or PDU that can be read off the wire.
pub trait Decodable: Sized {
    fn decode(buf: &[u8]) -> DecodeResult<Self>;
}

/// A cursor over a borrowed byte slice.
///
/// Every read is bounds-checked and fails with [`DecodeError::Truncated`]
/// rather than touching memory past the input.
#[derive(Debug, Clone)]
pub struct BufferReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BufferReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Offset consumed so far.
    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn peek_u8(&self) -> DecodeResult<u8> {
        self.buf.get(self.pos).copied().ok_or(DecodeError::Truncated)
    }

    pub fn read_u8(&mut self) -> DecodeResult<u8> {
        let b = self.peek_u8()?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> DecodeResult<u16> {
        Ok(NetworkEndian::read_u16(self.read_bytes(2)?))
    }

    pub fn read_u24(&mut self) -> DecodeResult<u32> {
        Ok(NetworkEndian::read_u24(self.read_bytes(3)?))
    }

    pub fn read_u32(&mut self) -> DecodeResult<u32> {
        Ok(NetworkEndian::read_u32(self.read_bytes(4)?))
    }

    pub fn read_bytes(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> DecodeResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Everything not yet consumed.
    pub fn into_rest(self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn reader_consumes_in_order() {
        let mut r = BufferReader::new(&[0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(r.peek_u8().unwrap(), 0x01);
        assert_eq!(r.read_u8().unwrap(), 0x01);
        assert_eq!(r.read_u16().unwrap(), 0x0203);
        assert_eq!(r.remaining(), 2);
        assert_eq!(r.into_rest(), &[0x04, 0x05]);
    }

    #[test]
    fn reader_rejects_short_reads() {
        let mut r = BufferReader::new(&[0x01]);
        assert_matches!(r.read_u16(), Err(DecodeError::Truncated));
        // A failed read consumes nothing.
        assert_eq!(r.read_u8().unwrap(), 0x01);
        assert_matches!(r.read_u8(), Err(DecodeError::Truncated));
    }

    #[test]
    fn read_u24_is_big_endian() {
        let mut r = BufferReader::new(&[0x01, 0x02, 0x03]);
        assert_eq!(r.read_u24().unwrap(), 0x010203);
    }
}
