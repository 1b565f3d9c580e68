// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Application data values: primitives plus context-tagged constructed
//! sequences, with the reader/writer the service codecs are built from.

use crate::error::{DecodeError, DecodeResult};
use crate::types::limits::{MAX_LIST_ITEMS, MAX_NESTING};
use crate::types::ObjectId;
use crate::wire::primitives::{
    self, BitString, CharacterString, Date, Time, UNSIGNED_SMALL,
};
use crate::wire::tag::{app_tag, Lvt, Tag, TagClass};
use crate::wire::{BufferReader, Decodable, Encodable};

/// One application datum.
///
/// `Constructed` holds a context tag number and the values between its
/// opening and closing markers. `ContextPrimitive` keeps the raw content of
/// a context-tagged primitive, whose type is only known to the service that
/// defined the tag; keeping the octets uninterpreted is what makes
/// `encode(decode(b)) == b` hold for arbitrary service payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(CharacterString),
    BitString(BitString),
    Enumerated(u32),
    Date(Date),
    Time(Time),
    ObjectId(ObjectId),
    Constructed(u8, Vec<Value>),
    ContextPrimitive { number: u8, content: Vec<u8> },
}

impl Value {
    pub fn string(text: impl Into<String>) -> Value {
        Value::CharacterString(CharacterString::utf8(text))
    }

    /// The numeric magnitude for COV increment comparisons, if this value
    /// has one.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Unsigned(v) => Some(v as f64),
            Value::Signed(v) => Some(v as f64),
            Value::Real(v) => Some(v as f64),
            Value::Double(v) => Some(v),
            Value::Enumerated(v) => Some(v as f64),
            _ => None,
        }
    }

    fn content_len(&self) -> usize {
        match self {
            Value::Null | Value::Boolean(_) => 0,
            Value::Unsigned(v) => primitives::unsigned_len(*v),
            Value::Signed(v) => primitives::signed_len(*v),
            Value::Real(_) => 4,
            Value::Double(_) => 8,
            Value::OctetString(data) => data.len(),
            Value::CharacterString(s) => s.content_len(),
            Value::BitString(b) => b.content_len(),
            Value::Enumerated(v) => primitives::unsigned_len(*v as u64),
            Value::Date(_) | Value::Time(_) => 4,
            Value::ObjectId(_) => 4,
            Value::Constructed(_, items) => {
                items.iter().map(Encodable::encoded_len).sum::<usize>()
            }
            Value::ContextPrimitive { content, .. } => content.len(),
        }
    }

    fn put_content(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null | Value::Boolean(_) => {}
            Value::Unsigned(v) => primitives::put_unsigned(buf, *v),
            Value::Signed(v) => primitives::put_signed(buf, *v),
            Value::Real(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Value::Double(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Value::OctetString(data) => buf.extend_from_slice(data),
            Value::CharacterString(s) => s.put_content(buf),
            Value::BitString(b) => b.put_content(buf),
            Value::Enumerated(v) => primitives::put_unsigned(buf, *v as u64),
            Value::Date(d) => d.put_content(buf),
            Value::Time(t) => t.put_content(buf),
            Value::ObjectId(id) => buf.extend_from_slice(&id.raw().to_be_bytes()),
            Value::Constructed(_, items) => {
                for item in items {
                    item.encode(buf);
                }
            }
            Value::ContextPrimitive { content, .. } => buf.extend_from_slice(content),
        }
    }

    fn tag(&self) -> Tag {
        match self {
            Value::Null => Tag::application(app_tag::NULL, 0),
            // The LVT field of an application Boolean carries the value.
            Value::Boolean(v) => Tag::application(app_tag::BOOLEAN, *v as u32),
            Value::Unsigned(_) => {
                Tag::application(app_tag::UNSIGNED, self.content_len() as u32)
            }
            Value::Signed(_) => Tag::application(app_tag::SIGNED, self.content_len() as u32),
            Value::Real(_) => Tag::application(app_tag::REAL, 4),
            Value::Double(_) => Tag::application(app_tag::DOUBLE, 8),
            Value::OctetString(_) => {
                Tag::application(app_tag::OCTET_STRING, self.content_len() as u32)
            }
            Value::CharacterString(_) => {
                Tag::application(app_tag::CHARACTER_STRING, self.content_len() as u32)
            }
            Value::BitString(_) => {
                Tag::application(app_tag::BIT_STRING, self.content_len() as u32)
            }
            Value::Enumerated(_) => {
                Tag::application(app_tag::ENUMERATED, self.content_len() as u32)
            }
            Value::Date(_) => Tag::application(app_tag::DATE, 4),
            Value::Time(_) => Tag::application(app_tag::TIME, 4),
            Value::ObjectId(_) => Tag::application(app_tag::OBJECT_ID, 4),
            Value::Constructed(n, _) => Tag::opening(*n),
            Value::ContextPrimitive { number, content } => {
                Tag::context(*number, content.len() as u32)
            }
        }
    }

    fn decode_with_depth(r: &mut BufferReader<'_>, depth: usize) -> DecodeResult<Value> {
        let tag = Tag::decode(r)?;
        Value::decode_after_tag(tag, r, depth)
    }

    fn decode_after_tag(
        tag: Tag,
        r: &mut BufferReader<'_>,
        depth: usize,
    ) -> DecodeResult<Value> {
        match tag.lvt {
            Lvt::Closing => Err(DecodeError::InvalidTag),
            Lvt::Opening => {
                if depth >= MAX_NESTING {
                    return Err(DecodeError::NestingTooDeep);
                }
                let mut items = Vec::new();
                loop {
                    let next = Tag::decode(r)?;
                    if next.is_closing() {
                        if next.number != tag.number {
                            return Err(DecodeError::UnexpectedTag {
                                expected: tag.number,
                                actual: next.number,
                            });
                        }
                        return Ok(Value::Constructed(tag.number, items));
                    }
                    if items.len() >= MAX_LIST_ITEMS {
                        return Err(DecodeError::CountLimitExceeded);
                    }
                    items.push(Value::decode_after_tag(next, r, depth + 1)?);
                }
            }
            Lvt::Length(len) => {
                if tag.class == TagClass::Application && tag.number == app_tag::BOOLEAN {
                    // The application Boolean keeps its value in the LVT
                    // field; no content octets follow.
                    return match len {
                        0 => Ok(Value::Boolean(false)),
                        1 => Ok(Value::Boolean(true)),
                        _ => Err(DecodeError::OutOfRange),
                    };
                }
                let content = r.read_bytes(len as usize)?;
                match tag.class {
                    TagClass::Context => Ok(Value::ContextPrimitive {
                        number: tag.number,
                        content: content.to_vec(),
                    }),
                    TagClass::Application => Value::parse_application(tag.number, len, content),
                }
            }
        }
    }

    fn parse_application(number: u8, lvt_len: u32, content: &[u8]) -> DecodeResult<Value> {
        Ok(match number {
            app_tag::NULL => {
                if lvt_len != 0 {
                    return Err(DecodeError::OutOfRange);
                }
                Value::Null
            }
            // Handled before content extraction; kept for completeness.
            app_tag::BOOLEAN => Value::Boolean(lvt_len == 1),
            app_tag::UNSIGNED => Value::Unsigned(primitives::parse_unsigned(content)?),
            app_tag::SIGNED => Value::Signed(primitives::parse_signed(content)?),
            app_tag::REAL => Value::Real(primitives::parse_real(content)?),
            app_tag::DOUBLE => Value::Double(primitives::parse_double(content)?),
            app_tag::OCTET_STRING => Value::OctetString(content.to_vec()),
            app_tag::CHARACTER_STRING => {
                Value::CharacterString(CharacterString::parse(content)?)
            }
            app_tag::BIT_STRING => Value::BitString(BitString::parse(content)?),
            app_tag::ENUMERATED => {
                let v = primitives::parse_unsigned(content)?;
                if v > u32::MAX as u64 {
                    return Err(DecodeError::OutOfRange);
                }
                Value::Enumerated(v as u32)
            }
            app_tag::DATE => Value::Date(Date::parse(content)?),
            app_tag::TIME => Value::Time(Time::parse(content)?),
            app_tag::OBJECT_ID => Value::ObjectId(primitives::parse_object_id(content)?),
            other => return Err(DecodeError::UnknownPduType(other)),
        })
    }
}

impl Encodable for Value {
    fn encoded_len(&self) -> usize {
        match self {
            // Boolean's LVT is its value, not a length; the content is empty
            // either way, so the tag length is the whole story.
            Value::Boolean(_) => 1,
            Value::Constructed(n, items) => {
                let open = Tag::opening(*n).encoded_len();
                let close = Tag::closing(*n).encoded_len();
                open + items.iter().map(Encodable::encoded_len).sum::<usize>() + close
            }
            _ => self.tag().encoded_len() + self.content_len(),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        if let Value::Unsigned(v) = self {
            if *v <= 255 {
                buf.extend_from_slice(&UNSIGNED_SMALL[*v as usize]);
                return;
            }
        }
        self.tag().encode(buf);
        self.put_content(buf);
        if let Value::Constructed(n, _) = self {
            Tag::closing(*n).encode(buf);
        }
    }
}

impl Decodable for Value {
    fn decode(buf: &[u8]) -> DecodeResult<Value> {
        let mut r = BufferReader::new(buf);
        let v = Value::decode_with_depth(&mut r, 0)?;
        if !r.is_empty() {
            return Err(DecodeError::InvalidTag);
        }
        Ok(v)
    }
}

/// Writer for service payloads: application values and context-tagged
/// fields appended to a growing buffer.
pub struct TlvWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> TlvWriter<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        TlvWriter { buf }
    }

    pub fn application(&mut self, value: &Value) {
        value.encode(self.buf);
    }

    pub fn open(&mut self, number: u8) {
        Tag::opening(number).encode(self.buf);
    }

    pub fn close(&mut self, number: u8) {
        Tag::closing(number).encode(self.buf);
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn context_unsigned(&mut self, number: u8, value: u64) {
        let len = primitives::unsigned_len(value);
        Tag::context(number, len as u32).encode(self.buf);
        primitives::put_unsigned(self.buf, value);
    }

    pub fn context_signed(&mut self, number: u8, value: i64) {
        let len = primitives::signed_len(value);
        Tag::context(number, len as u32).encode(self.buf);
        primitives::put_signed(self.buf, value);
    }

    pub fn context_enumerated(&mut self, number: u8, value: u32) {
        self.context_unsigned(number, value as u64);
    }

    pub fn context_boolean(&mut self, number: u8, value: bool) {
        Tag::context(number, 1).encode(self.buf);
        self.buf.push(value as u8);
    }

    pub fn context_real(&mut self, number: u8, value: f32) {
        Tag::context(number, 4).encode(self.buf);
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn context_object_id(&mut self, number: u8, id: ObjectId) {
        Tag::context(number, 4).encode(self.buf);
        self.buf.extend_from_slice(&id.raw().to_be_bytes());
    }

    pub fn context_octets(&mut self, number: u8, data: &[u8]) {
        Tag::context(number, data.len() as u32).encode(self.buf);
        self.buf.extend_from_slice(data);
    }

    pub fn context_string(&mut self, number: u8, s: &CharacterString) {
        Tag::context(number, s.content_len() as u32).encode(self.buf);
        s.put_content(self.buf);
    }

    pub fn context_bit_string(&mut self, number: u8, b: &BitString) {
        Tag::context(number, b.content_len() as u32).encode(self.buf);
        b.put_content(self.buf);
    }

    pub fn context_date(&mut self, number: u8, d: &Date) {
        Tag::context(number, 4).encode(self.buf);
        d.put_content(self.buf);
    }

    pub fn context_time(&mut self, number: u8, t: &Time) {
        Tag::context(number, 4).encode(self.buf);
        t.put_content(self.buf);
    }
}

/// Reader for service payloads.
///
/// The `expect_*` methods fail with [`DecodeError::UnexpectedTag`] naming
/// the context tag they wanted; the `opt_*` methods peek first and leave the
/// cursor untouched when the optional field is absent.
pub struct TlvReader<'a> {
    r: BufferReader<'a>,
}

impl<'a> TlvReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        TlvReader { r: BufferReader::new(buf) }
    }

    pub fn is_empty(&self) -> bool {
        self.r.is_empty()
    }

    pub fn peek_tag(&self) -> DecodeResult<Option<Tag>> {
        if self.r.is_empty() {
            return Ok(None);
        }
        let mut probe = self.r.clone();
        Tag::decode(&mut probe).map(Some)
    }

    fn peek_context(&self, number: u8) -> DecodeResult<Option<Tag>> {
        match self.peek_tag()? {
            Some(tag) if tag.is_context() && tag.number == number => Ok(Some(tag)),
            _ => Ok(None),
        }
    }

    fn unexpected(&self, expected: u8) -> DecodeError {
        match self.peek_tag() {
            Ok(Some(tag)) => DecodeError::UnexpectedTag { expected, actual: tag.number },
            _ => DecodeError::Truncated,
        }
    }

    /// Reads one complete value, primitive or constructed.
    pub fn read_value(&mut self) -> DecodeResult<Value> {
        Value::decode_with_depth(&mut self.r, 0)
    }

    /// Reads values until the buffer is exhausted or `closing` is reached
    /// (the closing tag is not consumed).
    pub fn read_values_until_close(&mut self, closing: u8) -> DecodeResult<Vec<Value>> {
        let mut out = Vec::new();
        loop {
            match self.peek_tag()? {
                None => return Ok(out),
                Some(tag) if tag.is_closing() && tag.number == closing => return Ok(out),
                Some(_) => {
                    if out.len() >= MAX_LIST_ITEMS {
                        return Err(DecodeError::CountLimitExceeded);
                    }
                    out.push(self.read_value()?);
                }
            }
        }
    }

    fn read_context_content(&mut self, number: u8) -> DecodeResult<&'a [u8]> {
        match self.peek_context(number)? {
            Some(tag) => {
                Tag::decode(&mut self.r)?;
                self.r.read_bytes(tag.length() as usize)
            }
            None => Err(self.unexpected(number)),
        }
    }

    pub fn expect_context_unsigned(&mut self, number: u8) -> DecodeResult<u64> {
        primitives::parse_unsigned(self.read_context_content(number)?)
    }

    pub fn expect_context_enumerated(&mut self, number: u8) -> DecodeResult<u32> {
        let v = self.expect_context_unsigned(number)?;
        if v > u32::MAX as u64 {
            return Err(DecodeError::OutOfRange);
        }
        Ok(v as u32)
    }

    pub fn expect_context_object_id(&mut self, number: u8) -> DecodeResult<ObjectId> {
        primitives::parse_object_id(self.read_context_content(number)?)
    }

    pub fn expect_context_octets(&mut self, number: u8) -> DecodeResult<Vec<u8>> {
        Ok(self.read_context_content(number)?.to_vec())
    }

    pub fn expect_context_string(&mut self, number: u8) -> DecodeResult<CharacterString> {
        CharacterString::parse(self.read_context_content(number)?)
    }

    pub fn expect_context_boolean(&mut self, number: u8) -> DecodeResult<bool> {
        let content = self.read_context_content(number)?;
        match content {
            [0] => Ok(false),
            [1] => Ok(true),
            _ => Err(DecodeError::OutOfRange),
        }
    }

    pub fn expect_context_date(&mut self, number: u8) -> DecodeResult<Date> {
        Date::parse(self.read_context_content(number)?)
    }

    pub fn expect_context_time(&mut self, number: u8) -> DecodeResult<Time> {
        Time::parse(self.read_context_content(number)?)
    }

    pub fn opt_context_unsigned(&mut self, number: u8) -> DecodeResult<Option<u64>> {
        match self.peek_context(number)? {
            Some(_) => self.expect_context_unsigned(number).map(Some),
            None => Ok(None),
        }
    }

    pub fn opt_context_enumerated(&mut self, number: u8) -> DecodeResult<Option<u32>> {
        match self.peek_context(number)? {
            Some(_) => self.expect_context_enumerated(number).map(Some),
            None => Ok(None),
        }
    }

    pub fn opt_context_boolean(&mut self, number: u8) -> DecodeResult<Option<bool>> {
        match self.peek_context(number)? {
            Some(_) => self.expect_context_boolean(number).map(Some),
            None => Ok(None),
        }
    }

    pub fn opt_context_object_id(&mut self, number: u8) -> DecodeResult<Option<ObjectId>> {
        match self.peek_context(number)? {
            Some(_) => self.expect_context_object_id(number).map(Some),
            None => Ok(None),
        }
    }

    pub fn opt_context_string(&mut self, number: u8) -> DecodeResult<Option<CharacterString>> {
        match self.peek_context(number)? {
            Some(_) => self.expect_context_string(number).map(Some),
            None => Ok(None),
        }
    }

    /// True when the next tag opens constructed data under `number`; the
    /// opening tag is consumed.
    pub fn expect_opening(&mut self, number: u8) -> DecodeResult<()> {
        match self.peek_tag()? {
            Some(tag) if tag.is_opening() && tag.number == number => {
                Tag::decode(&mut self.r)?;
                Ok(())
            }
            _ => Err(self.unexpected(number)),
        }
    }

    pub fn expect_closing(&mut self, number: u8) -> DecodeResult<()> {
        match self.peek_tag()? {
            Some(tag) if tag.is_closing() && tag.number == number => {
                Tag::decode(&mut self.r)?;
                Ok(())
            }
            _ => Err(self.unexpected(number)),
        }
    }

    pub fn at_opening(&self, number: u8) -> bool {
        matches!(self.peek_tag(), Ok(Some(tag)) if tag.is_opening() && tag.number == number)
    }

    pub fn at_closing(&self, number: u8) -> bool {
        matches!(self.peek_tag(), Ok(Some(tag)) if tag.is_closing() && tag.number == number)
    }

    /// Raw octets of everything left unread.
    pub fn rest(&self) -> &'a [u8] {
        self.r.rest()
    }

    /// Consumes and returns everything up to (not including) the closing tag
    /// `number`, verbatim.
    pub fn raw_until_close(&mut self, number: u8) -> DecodeResult<&'a [u8]> {
        let start = self.r.clone();
        let mut consumed = 0usize;
        let mut depth = 0usize;
        loop {
            match self.peek_tag()? {
                None => return Err(DecodeError::Truncated),
                Some(tag) if depth == 0 && tag.is_closing() && tag.number == number => {
                    let mut r = start;
                    return r.read_bytes(consumed);
                }
                Some(tag) => {
                    let before = self.r.offset();
                    Tag::decode(&mut self.r)?;
                    match tag.lvt {
                        Lvt::Opening => {
                            depth += 1;
                            if depth > MAX_NESTING {
                                return Err(DecodeError::NestingTooDeep);
                            }
                        }
                        Lvt::Closing => {
                            if depth == 0 {
                                return Err(DecodeError::UnexpectedTag {
                                    expected: number,
                                    actual: tag.number,
                                });
                            }
                            depth -= 1;
                        }
                        Lvt::Length(len) => {
                            let boolean_app = tag.class == TagClass::Application
                                && tag.number == app_tag::BOOLEAN;
                            if !boolean_app {
                                self.r.read_bytes(len as usize)?;
                            }
                        }
                    }
                    consumed += self.r.offset() - before;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn round_trip(v: Value) -> Vec<u8> {
        let buf = v.to_bytes();
        assert_eq!(buf.len(), v.encoded_len(), "{:?}", v);
        let decoded = Value::decode(&buf).unwrap();
        assert_eq!(decoded, v);
        // Byte-exact in the other direction as well.
        assert_eq!(decoded.to_bytes(), buf);
        buf
    }

    #[test]
    fn primitive_round_trips() {
        round_trip(Value::Null);
        round_trip(Value::Boolean(true));
        round_trip(Value::Boolean(false));
        round_trip(Value::Unsigned(0));
        round_trip(Value::Unsigned(3_000_000));
        round_trip(Value::Signed(-42));
        round_trip(Value::Real(22.5));
        round_trip(Value::Double(-1.25e300));
        round_trip(Value::OctetString(vec![1, 2, 3]));
        round_trip(Value::string("pump room"));
        round_trip(Value::BitString(BitString::from_bits(&[true, false, true])));
        round_trip(Value::Enumerated(85));
        round_trip(Value::Date(Date::new(2024, 2, 29, 4).unwrap()));
        round_trip(Value::Time(Time::new(16, 20, 0, 0).unwrap()));
        round_trip(Value::ObjectId(ObjectId::new(0, 1).unwrap()));
    }

    #[test]
    fn known_wire_forms() {
        // Real 72.0 from the Clause 20 examples.
        assert_eq!(round_trip(Value::Real(72.0)), [0x44, 0x42, 0x90, 0x00, 0x00]);
        assert_eq!(round_trip(Value::Unsigned(72)), [0x21, 72]);
        assert_eq!(round_trip(Value::Boolean(true)), [0x11]);
        assert_eq!(round_trip(Value::Null), [0x00]);
        assert_eq!(
            round_trip(Value::ObjectId(ObjectId::new(8, 1234).unwrap())),
            [0xC4, 0x02, 0x00, 0x04, 0xD2]
        );
    }

    #[test]
    fn boolean_consumes_no_content_octets() {
        // The value after a Boolean must not lose its first octet.
        let mut buf = Vec::new();
        Value::Boolean(true).encode(&mut buf);
        Value::Unsigned(7).encode(&mut buf);
        let mut r = TlvReader::new(&buf);
        assert_eq!(r.read_value().unwrap(), Value::Boolean(true));
        assert_eq!(r.read_value().unwrap(), Value::Unsigned(7));
        assert!(r.is_empty());
    }

    #[test]
    fn constructed_round_trip() {
        let v = Value::Constructed(
            3,
            vec![Value::Real(1.0), Value::Constructed(0, vec![Value::Unsigned(9)])],
        );
        let buf = round_trip(v);
        // opening(3) ... closing(3)
        assert_eq!(buf[0], 0x3E);
        assert_eq!(*buf.last().unwrap(), 0x3F);
    }

    #[test]
    fn context_primitive_keeps_octets() {
        // Context tag 1, length 2, arbitrary content.
        let buf = [0x1A, 0xBE, 0xEF];
        let v = Value::decode(&buf).unwrap();
        assert_eq!(v, Value::ContextPrimitive { number: 1, content: vec![0xBE, 0xEF] });
        assert_eq!(v.to_bytes(), buf);
    }

    #[test]
    fn nesting_limit_enforced() {
        let mut buf = Vec::new();
        for _ in 0..40 {
            Tag::opening(0).encode(&mut buf);
        }
        assert_matches!(Value::decode(&buf), Err(DecodeError::NestingTooDeep));
    }

    #[test]
    fn deep_but_legal_nesting_is_fine() {
        let mut v = Value::Unsigned(1);
        for _ in 0..31 {
            v = Value::Constructed(0, vec![v]);
        }
        round_trip(v);
    }

    #[test]
    fn mismatched_closing_tag() {
        let mut buf = Vec::new();
        Tag::opening(2).encode(&mut buf);
        Tag::closing(3).encode(&mut buf);
        assert_matches!(
            Value::decode(&buf),
            Err(DecodeError::UnexpectedTag { expected: 2, actual: 3 })
        );
    }

    #[test]
    fn trailing_garbage_rejected() {
        let mut buf = Value::Null.to_bytes();
        buf.push(0x00);
        assert_matches!(Value::decode(&buf), Err(DecodeError::InvalidTag));
    }

    #[test]
    fn writer_reader_context_fields() {
        let mut buf = Vec::new();
        let mut w = TlvWriter::new(&mut buf);
        w.context_object_id(0, ObjectId::new(2, 1).unwrap());
        w.context_unsigned(1, 85);
        w.open(3);
        w.application(&Value::Real(11.0));
        w.close(3);

        let mut r = TlvReader::new(&buf);
        assert_eq!(r.expect_context_object_id(0).unwrap(), ObjectId::new(2, 1).unwrap());
        assert_eq!(r.expect_context_unsigned(1).unwrap(), 85);
        r.expect_opening(3).unwrap();
        assert_eq!(r.read_value().unwrap(), Value::Real(11.0));
        r.expect_closing(3).unwrap();
        assert!(r.is_empty());
    }

    #[test]
    fn reader_optional_fields() {
        let mut buf = Vec::new();
        let mut w = TlvWriter::new(&mut buf);
        w.context_unsigned(2, 7);
        let mut r = TlvReader::new(&buf);
        assert_eq!(r.opt_context_unsigned(0).unwrap(), None);
        assert_eq!(r.opt_context_unsigned(2).unwrap(), Some(7));
        assert!(r.is_empty());
    }

    #[test]
    fn reader_unexpected_tag_names_both() {
        let mut buf = Vec::new();
        TlvWriter::new(&mut buf).context_unsigned(4, 1);
        let mut r = TlvReader::new(&buf);
        assert_matches!(
            r.expect_context_unsigned(1),
            Err(DecodeError::UnexpectedTag { expected: 1, actual: 4 })
        );
    }

    #[test]
    fn raw_until_close_spans_nested_data() {
        let mut buf = Vec::new();
        let mut w = TlvWriter::new(&mut buf);
        w.open(3);
        w.application(&Value::Unsigned(1));
        w.open(0);
        w.application(&Value::Real(2.0));
        w.close(0);
        w.close(3);

        let mut r = TlvReader::new(&buf);
        r.expect_opening(3).unwrap();
        let inner = r.raw_until_close(3).unwrap().to_vec();
        r.expect_closing(3).unwrap();
        assert!(r.is_empty());

        let mut rr = TlvReader::new(&inner);
        assert_eq!(rr.read_value().unwrap(), Value::Unsigned(1));
        assert_eq!(rr.read_value().unwrap(), Value::Constructed(0, vec![Value::Real(2.0)]));
    }

    #[test]
    fn item_count_cap() {
        let mut buf = Vec::new();
        Tag::opening(0).encode(&mut buf);
        for _ in 0..=MAX_LIST_ITEMS {
            Value::Null.encode(&mut buf);
        }
        Tag::closing(0).encode(&mut buf);
        assert_matches!(Value::decode(&buf), Err(DecodeError::CountLimitExceeded));
    }
}
