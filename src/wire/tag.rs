// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The Clause 20.2.1 tag grammar.
//!
//! Every encoded datum starts with a tag octet: a 4-bit tag number (0xF
//! escapes to an extension octet), one class bit (application or context
//! specific), and a 3-bit length/value/type field. LVT values 0..4 are
//! literal content lengths, 5 switches to extended length octets (with 254
//! and 255 escaping to 16- and 32-bit lengths), 6 and 7 are the opening and
//! closing markers that delimit constructed data.

use crate::error::{DecodeError, DecodeResult};
use crate::types::limits::MAX_DECODE_LEN;
use crate::wire::BufferReader;

const CLASS_BIT: u8 = 0x08;
const EXTENDED_NUMBER: u8 = 0xF;
const LVT_EXTENDED: u8 = 5;
const LVT_OPENING: u8 = 6;
const LVT_CLOSING: u8 = 7;

/// Application-tag numbers of the primitive types (Clause 20.2.1.4).
pub mod app_tag {
    pub const NULL: u8 = 0;
    pub const BOOLEAN: u8 = 1;
    pub const UNSIGNED: u8 = 2;
    pub const SIGNED: u8 = 3;
    pub const REAL: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const OCTET_STRING: u8 = 6;
    pub const CHARACTER_STRING: u8 = 7;
    pub const BIT_STRING: u8 = 8;
    pub const ENUMERATED: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const OBJECT_ID: u8 = 12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Application,
    Context,
}

/// The length/value/type half of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lvt {
    /// Content length in bytes. For application-tagged Boolean the "length"
    /// carries the value itself and no content octets follow.
    Length(u32),
    Opening,
    Closing,
}

/// One decoded tag octet (plus any extension octets).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub class: TagClass,
    pub number: u8,
    pub lvt: Lvt,
}

/// Precomputed single-octet headers for application tags with number <= 14
/// and literal length <= 4, the overwhelmingly common case on the hot path.
/// Indexed `[number][length]`.
pub(crate) const SMALL_APP_HEADER: [[u8; 5]; 15] = {
    let mut table = [[0u8; 5]; 15];
    let mut n = 0;
    while n < 15 {
        let mut l = 0;
        while l < 5 {
            table[n][l] = ((n as u8) << 4) | (l as u8);
            l += 1;
        }
        n += 1;
    }
    table
};

impl Tag {
    pub fn application(number: u8, length: u32) -> Tag {
        Tag { class: TagClass::Application, number, lvt: Lvt::Length(length) }
    }

    pub fn context(number: u8, length: u32) -> Tag {
        Tag { class: TagClass::Context, number, lvt: Lvt::Length(length) }
    }

    pub fn opening(number: u8) -> Tag {
        Tag { class: TagClass::Context, number, lvt: Lvt::Opening }
    }

    pub fn closing(number: u8) -> Tag {
        Tag { class: TagClass::Context, number, lvt: Lvt::Closing }
    }

    pub fn is_opening(&self) -> bool {
        self.lvt == Lvt::Opening
    }

    pub fn is_closing(&self) -> bool {
        self.lvt == Lvt::Closing
    }

    pub fn is_context(&self) -> bool {
        self.class == TagClass::Context
    }

    /// Content length; opening/closing tags delimit zero content themselves.
    pub fn length(&self) -> u32 {
        match self.lvt {
            Lvt::Length(len) => len,
            Lvt::Opening | Lvt::Closing => 0,
        }
    }

    /// Bytes this tag header occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        let number_ext = if self.number > 14 { 1 } else { 0 };
        let length_ext = match self.lvt {
            Lvt::Length(len) if len > MAX_SMALL_LENGTH_U32 => match len {
                5..=253 => 1,
                254..=65535 => 3,
                _ => 5,
            },
            _ => 0,
        };
        1 + number_ext + length_ext
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let lvt_bits = match self.lvt {
            Lvt::Length(len) if len <= MAX_SMALL_LENGTH_U32 => len as u8,
            Lvt::Length(_) => LVT_EXTENDED,
            Lvt::Opening => LVT_OPENING,
            Lvt::Closing => LVT_CLOSING,
        };
        let class_bit = match self.class {
            TagClass::Application => 0,
            TagClass::Context => CLASS_BIT,
        };
        if self.class == TagClass::Application && self.number <= 14 && lvt_bits <= 4 {
            buf.push(SMALL_APP_HEADER[self.number as usize][lvt_bits as usize]);
        } else if self.number <= 14 {
            buf.push((self.number << 4) | class_bit | lvt_bits);
        } else {
            buf.push((EXTENDED_NUMBER << 4) | class_bit | lvt_bits);
            buf.push(self.number);
        }
        if let Lvt::Length(len) = self.lvt {
            if len > MAX_SMALL_LENGTH_U32 {
                match len {
                    5..=253 => buf.push(len as u8),
                    254..=65535 => {
                        buf.push(254);
                        buf.extend_from_slice(&(len as u16).to_be_bytes());
                    }
                    _ => {
                        buf.push(255);
                        buf.extend_from_slice(&len.to_be_bytes());
                    }
                }
            }
        }
    }

    pub fn decode(r: &mut BufferReader<'_>) -> DecodeResult<Tag> {
        let head = r.read_u8()?;
        let class =
            if head & CLASS_BIT != 0 { TagClass::Context } else { TagClass::Application };
        let mut number = head >> 4;
        if number == EXTENDED_NUMBER {
            number = r.read_u8()?;
            if number == 255 {
                return Err(DecodeError::InvalidTag);
            }
        }
        let lvt = match head & 0x07 {
            LVT_OPENING => Lvt::Opening,
            LVT_CLOSING => Lvt::Closing,
            LVT_EXTENDED => {
                let len = match r.read_u8()? {
                    254 => r.read_u16()? as u32,
                    255 => r.read_u32()?,
                    b => b as u32,
                };
                if len > MAX_DECODE_LEN {
                    return Err(DecodeError::LengthTooLarge(len));
                }
                Lvt::Length(len)
            }
            small => Lvt::Length(small as u32),
        };
        if lvt == Lvt::Opening || lvt == Lvt::Closing {
            if class == TagClass::Application {
                // Opening/closing markers are context-class by definition.
                return Err(DecodeError::InvalidTag);
            }
        }
        Ok(Tag { class, number, lvt })
    }
}

const MAX_SMALL_LENGTH_U32: u32 = 4;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::BufferReader;
    use assert_matches::assert_matches;

    fn round_trip(tag: Tag) -> Vec<u8> {
        let mut buf = Vec::new();
        tag.encode(&mut buf);
        assert_eq!(buf.len(), tag.encoded_len());
        let mut r = BufferReader::new(&buf);
        assert_eq!(Tag::decode(&mut r).unwrap(), tag);
        assert!(r.is_empty());
        buf
    }

    #[test]
    fn small_application_headers_are_single_octet() {
        assert_eq!(round_trip(Tag::application(2, 1)), vec![0x21]);
        assert_eq!(round_trip(Tag::application(4, 4)), vec![0x44]);
        assert_eq!(round_trip(Tag::application(0, 0)), vec![0x00]);
    }

    #[test]
    fn context_headers_set_the_class_bit() {
        assert_eq!(round_trip(Tag::context(0, 1)), vec![0x09]);
        assert_eq!(round_trip(Tag::context(3, 2)), vec![0x3A]);
    }

    #[test]
    fn opening_and_closing_markers() {
        assert_eq!(round_trip(Tag::opening(1)), vec![0x1E]);
        assert_eq!(round_trip(Tag::closing(1)), vec![0x1F]);
    }

    #[test]
    fn extended_tag_numbers() {
        assert_eq!(round_trip(Tag::context(33, 1)), vec![0xF9, 33]);
        assert_eq!(round_trip(Tag::application(254, 0)), vec![0xF0, 254]);
    }

    #[test]
    fn extended_lengths() {
        assert_eq!(round_trip(Tag::application(6, 5)), vec![0x65, 5]);
        assert_eq!(round_trip(Tag::application(6, 253)), vec![0x65, 253]);
        assert_eq!(round_trip(Tag::application(6, 254)), vec![0x65, 254, 0x00, 0xFE]);
        assert_eq!(round_trip(Tag::application(6, 65535)), vec![0x65, 254, 0xFF, 0xFF]);
        assert_eq!(
            round_trip(Tag::application(6, 65536)),
            vec![0x65, 255, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn rejects_oversized_length() {
        // 2 MiB length claim.
        let buf = [0x65u8, 255, 0x00, 0x20, 0x00, 0x00];
        let mut r = BufferReader::new(&buf);
        assert_matches!(Tag::decode(&mut r), Err(DecodeError::LengthTooLarge(_)));
    }

    #[test]
    fn rejects_application_opening_marker() {
        // LVT 6 without the class bit.
        let mut r = BufferReader::new(&[0x16]);
        assert_matches!(Tag::decode(&mut r), Err(DecodeError::InvalidTag));
    }

    #[test]
    fn rejects_reserved_extended_number() {
        let mut r = BufferReader::new(&[0xF8, 255, 0x00]);
        assert_matches!(Tag::decode(&mut r), Err(DecodeError::InvalidTag));
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut r = BufferReader::new(&[0x65]);
        assert_matches!(Tag::decode(&mut r), Err(DecodeError::Truncated));
    }

    #[test]
    fn small_header_table_matches_manual_encoding() {
        for n in 0..15u8 {
            for l in 0..5u8 {
                assert_eq!(SMALL_APP_HEADER[n as usize][l as usize], (n << 4) | l);
            }
        }
    }
}
