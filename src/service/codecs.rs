// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed request and response bodies for the application services.
//!
//! Each type encodes to (and decodes from) the `service data` octets that
//! ride in a Confirmed/Unconfirmed-Request or ComplexACK. Context tag
//! numbers follow the Clause 21 productions.

use crate::error::{DecodeError, DecodeResult};
use crate::types::limits::MAX_LIST_ITEMS;
use crate::types::{ObjectId, ObjectType, PropertyId};
use crate::wire::primitives::{BitString, CharacterString, Date, Time};
use crate::wire::value::{TlvReader, TlvWriter, Value};

/// A service body that can be written to and read from service-data octets.
pub trait ServiceCodec: Sized {
    fn write(&self, w: &mut TlvWriter<'_>);
    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self>;

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write(&mut TlvWriter::new(&mut buf));
        buf
    }

    fn decode(buf: &[u8]) -> DecodeResult<Self> {
        let mut r = TlvReader::new(buf);
        let out = Self::read(&mut r)?;
        if !r.is_empty() {
            return Err(DecodeError::InvalidTag);
        }
        Ok(out)
    }
}

/// `propertyIdentifier [0] / propertyArrayIndex [1]` pair used throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyReference {
    pub property: PropertyId,
    pub array_index: Option<u32>,
}

impl PropertyReference {
    pub fn new(property: PropertyId) -> PropertyReference {
        PropertyReference { property, array_index: None }
    }

    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_enumerated(0, self.property);
        if let Some(idx) = self.array_index {
            w.context_unsigned(1, idx as u64);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<PropertyReference> {
        Ok(PropertyReference {
            property: r.expect_context_enumerated(0)?,
            array_index: r.opt_context_unsigned(1)?.map(|v| v as u32),
        })
    }
}

/// One property-and-value element of a COV or write-multiple list.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyValue {
    pub property: PropertyId,
    pub array_index: Option<u32>,
    pub value: Vec<Value>,
    pub priority: Option<u8>,
}

impl PropertyValue {
    pub fn new(property: PropertyId, value: Value) -> PropertyValue {
        PropertyValue { property, array_index: None, value: vec![value], priority: None }
    }

    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_enumerated(0, self.property);
        if let Some(idx) = self.array_index {
            w.context_unsigned(1, idx as u64);
        }
        w.open(2);
        for v in &self.value {
            w.application(v);
        }
        w.close(2);
        if let Some(priority) = self.priority {
            w.context_unsigned(3, priority as u64);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<PropertyValue> {
        let property = r.expect_context_enumerated(0)?;
        let array_index = r.opt_context_unsigned(1)?.map(|v| v as u32);
        r.expect_opening(2)?;
        let value = r.read_values_until_close(2)?;
        r.expect_closing(2)?;
        let priority = r.opt_context_unsigned(3)?.map(|v| v as u8);
        Ok(PropertyValue { property, array_index, value, priority })
    }
}

/// BACnetTimeStamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeStamp {
    Time(Time),
    Sequence(u32),
    DateTime(Date, Time),
}

impl TimeStamp {
    fn write(&self, w: &mut TlvWriter<'_>) {
        match self {
            TimeStamp::Time(t) => w.context_time(0, t),
            TimeStamp::Sequence(n) => w.context_unsigned(1, *n as u64),
            TimeStamp::DateTime(d, t) => {
                w.open(2);
                w.application(&Value::Date(*d));
                w.application(&Value::Time(*t));
                w.close(2);
            }
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<TimeStamp> {
        if r.at_opening(2) {
            r.expect_opening(2)?;
            let date = match r.read_value()? {
                Value::Date(d) => d,
                _ => return Err(DecodeError::OutOfRange),
            };
            let time = match r.read_value()? {
                Value::Time(t) => t,
                _ => return Err(DecodeError::OutOfRange),
            };
            r.expect_closing(2)?;
            return Ok(TimeStamp::DateTime(date, time));
        }
        if let Some(tag) = r.peek_tag()? {
            if tag.is_context() && tag.number == 0 {
                return Ok(TimeStamp::Time(r.expect_context_time(0)?));
            }
            if tag.is_context() && tag.number == 1 {
                return Ok(TimeStamp::Sequence(r.expect_context_unsigned(1)? as u32));
            }
        }
        Err(DecodeError::InvalidTag)
    }
}

// --- ReadProperty -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPropertyRequest {
    pub object: ObjectId,
    pub property: PropertyId,
    pub array_index: Option<u32>,
}

impl ServiceCodec for ReadPropertyRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_object_id(0, self.object);
        w.context_enumerated(1, self.property);
        if let Some(idx) = self.array_index {
            w.context_unsigned(2, idx as u64);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        Ok(ReadPropertyRequest {
            object: r.expect_context_object_id(0)?,
            property: r.expect_context_enumerated(1)?,
            array_index: r.opt_context_unsigned(2)?.map(|v| v as u32),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyAck {
    pub object: ObjectId,
    pub property: PropertyId,
    pub array_index: Option<u32>,
    pub value: Vec<Value>,
}

impl ServiceCodec for ReadPropertyAck {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_object_id(0, self.object);
        w.context_enumerated(1, self.property);
        if let Some(idx) = self.array_index {
            w.context_unsigned(2, idx as u64);
        }
        w.open(3);
        for v in &self.value {
            w.application(v);
        }
        w.close(3);
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let object = r.expect_context_object_id(0)?;
        let property = r.expect_context_enumerated(1)?;
        let array_index = r.opt_context_unsigned(2)?.map(|v| v as u32);
        r.expect_opening(3)?;
        let value = r.read_values_until_close(3)?;
        r.expect_closing(3)?;
        Ok(ReadPropertyAck { object, property, array_index, value })
    }
}

// --- WriteProperty ----------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct WritePropertyRequest {
    pub object: ObjectId,
    pub property: PropertyId,
    pub array_index: Option<u32>,
    pub value: Vec<Value>,
    pub priority: Option<u8>,
}

impl ServiceCodec for WritePropertyRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_object_id(0, self.object);
        w.context_enumerated(1, self.property);
        if let Some(idx) = self.array_index {
            w.context_unsigned(2, idx as u64);
        }
        w.open(3);
        for v in &self.value {
            w.application(v);
        }
        w.close(3);
        if let Some(priority) = self.priority {
            w.context_unsigned(4, priority as u64);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let object = r.expect_context_object_id(0)?;
        let property = r.expect_context_enumerated(1)?;
        let array_index = r.opt_context_unsigned(2)?.map(|v| v as u32);
        r.expect_opening(3)?;
        let value = r.read_values_until_close(3)?;
        r.expect_closing(3)?;
        let priority = r.opt_context_unsigned(4)?.map(|v| v as u8);
        Ok(WritePropertyRequest { object, property, array_index, value, priority })
    }
}

// --- ReadPropertyMultiple ---------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAccessSpecification {
    pub object: ObjectId,
    pub properties: Vec<PropertyReference>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyMultipleRequest {
    pub specs: Vec<ReadAccessSpecification>,
}

impl ServiceCodec for ReadPropertyMultipleRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        for spec in &self.specs {
            w.context_object_id(0, spec.object);
            w.open(1);
            for p in &spec.properties {
                p.write(w);
            }
            w.close(1);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let mut specs = Vec::new();
        while !r.is_empty() {
            if specs.len() >= MAX_LIST_ITEMS {
                return Err(DecodeError::CountLimitExceeded);
            }
            let object = r.expect_context_object_id(0)?;
            r.expect_opening(1)?;
            let mut properties = Vec::new();
            while !r.at_closing(1) {
                if properties.len() >= MAX_LIST_ITEMS {
                    return Err(DecodeError::CountLimitExceeded);
                }
                properties.push(PropertyReference::read(r)?);
            }
            r.expect_closing(1)?;
            specs.push(ReadAccessSpecification { object, properties });
        }
        Ok(ReadPropertyMultipleRequest { specs })
    }
}

/// One property's outcome inside a read-access result.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult {
    Value(Vec<Value>),
    Error { class: u32, code: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadAccessResult {
    pub object: ObjectId,
    pub results: Vec<(PropertyReference, ReadResult)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyMultipleAck {
    pub results: Vec<ReadAccessResult>,
}

impl ServiceCodec for ReadPropertyMultipleAck {
    fn write(&self, w: &mut TlvWriter<'_>) {
        for result in &self.results {
            w.context_object_id(0, result.object);
            w.open(1);
            for (reference, outcome) in &result.results {
                w.context_enumerated(2, reference.property);
                if let Some(idx) = reference.array_index {
                    w.context_unsigned(3, idx as u64);
                }
                match outcome {
                    ReadResult::Value(values) => {
                        w.open(4);
                        for v in values {
                            w.application(v);
                        }
                        w.close(4);
                    }
                    ReadResult::Error { class, code } => {
                        w.open(5);
                        w.application(&Value::Enumerated(*class));
                        w.application(&Value::Enumerated(*code));
                        w.close(5);
                    }
                }
            }
            w.close(1);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let mut results = Vec::new();
        while !r.is_empty() {
            if results.len() >= MAX_LIST_ITEMS {
                return Err(DecodeError::CountLimitExceeded);
            }
            let object = r.expect_context_object_id(0)?;
            r.expect_opening(1)?;
            let mut object_results = Vec::new();
            while !r.at_closing(1) {
                if object_results.len() >= MAX_LIST_ITEMS {
                    return Err(DecodeError::CountLimitExceeded);
                }
                let property = r.expect_context_enumerated(2)?;
                let array_index = r.opt_context_unsigned(3)?.map(|v| v as u32);
                let reference = PropertyReference { property, array_index };
                let outcome = if r.at_opening(4) {
                    r.expect_opening(4)?;
                    let values = r.read_values_until_close(4)?;
                    r.expect_closing(4)?;
                    ReadResult::Value(values)
                } else {
                    r.expect_opening(5)?;
                    let values = r.read_values_until_close(5)?;
                    r.expect_closing(5)?;
                    match values.as_slice() {
                        [Value::Enumerated(class), Value::Enumerated(code)] => {
                            ReadResult::Error { class: *class, code: *code }
                        }
                        _ => return Err(DecodeError::OutOfRange),
                    }
                };
                object_results.push((reference, outcome));
            }
            r.expect_closing(1)?;
            results.push(ReadAccessResult { object, results: object_results });
        }
        Ok(ReadPropertyMultipleAck { results })
    }
}

// --- WritePropertyMultiple --------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct WriteAccessSpecification {
    pub object: ObjectId,
    pub values: Vec<PropertyValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WritePropertyMultipleRequest {
    pub specs: Vec<WriteAccessSpecification>,
}

impl ServiceCodec for WritePropertyMultipleRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        for spec in &self.specs {
            w.context_object_id(0, spec.object);
            w.open(1);
            for value in &spec.values {
                value.write(w);
            }
            w.close(1);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let mut specs = Vec::new();
        while !r.is_empty() {
            if specs.len() >= MAX_LIST_ITEMS {
                return Err(DecodeError::CountLimitExceeded);
            }
            let object = r.expect_context_object_id(0)?;
            r.expect_opening(1)?;
            let mut values = Vec::new();
            while !r.at_closing(1) {
                if values.len() >= MAX_LIST_ITEMS {
                    return Err(DecodeError::CountLimitExceeded);
                }
                values.push(PropertyValue::read(r)?);
            }
            r.expect_closing(1)?;
            specs.push(WriteAccessSpecification { object, values });
        }
        Ok(WritePropertyMultipleRequest { specs })
    }
}

// --- ReadRange --------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadRangeSelector {
    All,
    ByPosition { reference: u32, count: i32 },
    BySequence { reference: u32, count: i32 },
    ByTime { date: Date, time: Time, count: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRangeRequest {
    pub object: ObjectId,
    pub property: PropertyId,
    pub array_index: Option<u32>,
    pub selector: ReadRangeSelector,
}

impl ServiceCodec for ReadRangeRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_object_id(0, self.object);
        w.context_enumerated(1, self.property);
        if let Some(idx) = self.array_index {
            w.context_unsigned(2, idx as u64);
        }
        match self.selector {
            ReadRangeSelector::All => {}
            ReadRangeSelector::ByPosition { reference, count } => {
                w.open(3);
                w.application(&Value::Unsigned(reference as u64));
                w.application(&Value::Signed(count as i64));
                w.close(3);
            }
            ReadRangeSelector::BySequence { reference, count } => {
                w.open(6);
                w.application(&Value::Unsigned(reference as u64));
                w.application(&Value::Signed(count as i64));
                w.close(6);
            }
            ReadRangeSelector::ByTime { date, time, count } => {
                w.open(7);
                w.application(&Value::Date(date));
                w.application(&Value::Time(time));
                w.application(&Value::Signed(count as i64));
                w.close(7);
            }
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let object = r.expect_context_object_id(0)?;
        let property = r.expect_context_enumerated(1)?;
        let array_index = r.opt_context_unsigned(2)?.map(|v| v as u32);
        let selector = if r.at_opening(3) {
            r.expect_opening(3)?;
            let reference = match r.read_value()? {
                Value::Unsigned(v) => v as u32,
                _ => return Err(DecodeError::OutOfRange),
            };
            let count = match r.read_value()? {
                Value::Signed(v) => v as i32,
                _ => return Err(DecodeError::OutOfRange),
            };
            r.expect_closing(3)?;
            ReadRangeSelector::ByPosition { reference, count }
        } else if r.at_opening(6) {
            r.expect_opening(6)?;
            let reference = match r.read_value()? {
                Value::Unsigned(v) => v as u32,
                _ => return Err(DecodeError::OutOfRange),
            };
            let count = match r.read_value()? {
                Value::Signed(v) => v as i32,
                _ => return Err(DecodeError::OutOfRange),
            };
            r.expect_closing(6)?;
            ReadRangeSelector::BySequence { reference, count }
        } else if r.at_opening(7) {
            r.expect_opening(7)?;
            let date = match r.read_value()? {
                Value::Date(d) => d,
                _ => return Err(DecodeError::OutOfRange),
            };
            let time = match r.read_value()? {
                Value::Time(t) => t,
                _ => return Err(DecodeError::OutOfRange),
            };
            let count = match r.read_value()? {
                Value::Signed(v) => v as i32,
                _ => return Err(DecodeError::OutOfRange),
            };
            r.expect_closing(7)?;
            ReadRangeSelector::ByTime { date, time, count }
        } else {
            ReadRangeSelector::All
        };
        Ok(ReadRangeRequest { object, property, array_index, selector })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadRangeAck {
    pub object: ObjectId,
    pub property: PropertyId,
    pub array_index: Option<u32>,
    pub result_flags: BitString,
    pub item_count: u32,
    pub items: Vec<Value>,
    pub first_sequence: Option<u32>,
}

impl ServiceCodec for ReadRangeAck {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_object_id(0, self.object);
        w.context_enumerated(1, self.property);
        if let Some(idx) = self.array_index {
            w.context_unsigned(2, idx as u64);
        }
        w.context_bit_string(3, &self.result_flags);
        w.context_unsigned(4, self.item_count as u64);
        w.open(5);
        for item in &self.items {
            w.application(item);
        }
        w.close(5);
        if let Some(seq) = self.first_sequence {
            w.context_unsigned(6, seq as u64);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let object = r.expect_context_object_id(0)?;
        let property = r.expect_context_enumerated(1)?;
        let array_index = r.opt_context_unsigned(2)?.map(|v| v as u32);
        let result_flags = BitString::parse(&r.expect_context_octets(3)?)?;
        let item_count = r.expect_context_unsigned(4)? as u32;
        r.expect_opening(5)?;
        let items = r.read_values_until_close(5)?;
        r.expect_closing(5)?;
        let first_sequence = r.opt_context_unsigned(6)?.map(|v| v as u32);
        Ok(ReadRangeAck {
            object,
            property,
            array_index,
            result_flags,
            item_count,
            items,
            first_sequence,
        })
    }
}

// --- Object lifecycle -------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CreateObjectRequest {
    /// Either a bare type (instance assigned by the server) or a full id.
    pub specifier: CreateObjectSpecifier,
    pub initial_values: Vec<PropertyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateObjectSpecifier {
    Type(ObjectType),
    Id(ObjectId),
}

impl ServiceCodec for CreateObjectRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.open(0);
        match self.specifier {
            CreateObjectSpecifier::Type(t) => w.context_enumerated(0, t as u32),
            CreateObjectSpecifier::Id(id) => w.context_object_id(1, id),
        }
        w.close(0);
        if !self.initial_values.is_empty() {
            w.open(1);
            for value in &self.initial_values {
                value.write(w);
            }
            w.close(1);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        r.expect_opening(0)?;
        let specifier = match r.peek_tag()? {
            Some(tag) if tag.is_context() && tag.number == 0 => {
                CreateObjectSpecifier::Type(r.expect_context_enumerated(0)? as ObjectType)
            }
            _ => CreateObjectSpecifier::Id(r.expect_context_object_id(1)?),
        };
        r.expect_closing(0)?;
        let mut initial_values = Vec::new();
        if r.at_opening(1) {
            r.expect_opening(1)?;
            while !r.at_closing(1) {
                if initial_values.len() >= MAX_LIST_ITEMS {
                    return Err(DecodeError::CountLimitExceeded);
                }
                initial_values.push(PropertyValue::read(r)?);
            }
            r.expect_closing(1)?;
        }
        Ok(CreateObjectRequest { specifier, initial_values })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteObjectRequest {
    pub object: ObjectId,
}

impl ServiceCodec for DeleteObjectRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.application(&Value::ObjectId(self.object));
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        match r.read_value()? {
            Value::ObjectId(object) => Ok(DeleteObjectRequest { object }),
            _ => Err(DecodeError::OutOfRange),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListElementRequest {
    pub object: ObjectId,
    pub property: PropertyId,
    pub array_index: Option<u32>,
    pub elements: Vec<Value>,
}

impl ServiceCodec for ListElementRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_object_id(0, self.object);
        w.context_enumerated(1, self.property);
        if let Some(idx) = self.array_index {
            w.context_unsigned(2, idx as u64);
        }
        w.open(3);
        for e in &self.elements {
            w.application(e);
        }
        w.close(3);
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let object = r.expect_context_object_id(0)?;
        let property = r.expect_context_enumerated(1)?;
        let array_index = r.opt_context_unsigned(2)?.map(|v| v as u32);
        r.expect_opening(3)?;
        let elements = r.read_values_until_close(3)?;
        r.expect_closing(3)?;
        Ok(ListElementRequest { object, property, array_index, elements })
    }
}

// --- Atomic file access -----------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAccess {
    Stream { start: i32, count: u32 },
    Record { start: i32, count: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicReadFileRequest {
    pub file: ObjectId,
    pub access: FileAccess,
}

impl ServiceCodec for AtomicReadFileRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.application(&Value::ObjectId(self.file));
        let (tag, start, count) = match self.access {
            FileAccess::Stream { start, count } => (0, start, count),
            FileAccess::Record { start, count } => (1, start, count),
        };
        w.open(tag);
        w.application(&Value::Signed(start as i64));
        w.application(&Value::Unsigned(count as u64));
        w.close(tag);
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let file = match r.read_value()? {
            Value::ObjectId(id) => id,
            _ => return Err(DecodeError::OutOfRange),
        };
        let tag = if r.at_opening(0) { 0 } else { 1 };
        r.expect_opening(tag)?;
        let start = match r.read_value()? {
            Value::Signed(v) => v as i32,
            _ => return Err(DecodeError::OutOfRange),
        };
        let count = match r.read_value()? {
            Value::Unsigned(v) => v as u32,
            _ => return Err(DecodeError::OutOfRange),
        };
        r.expect_closing(tag)?;
        let access = match tag {
            0 => FileAccess::Stream { start, count },
            _ => FileAccess::Record { start, count },
        };
        Ok(AtomicReadFileRequest { file, access })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicReadFileAck {
    pub end_of_file: bool,
    pub start: i32,
    /// Stream data, or concatenated records for record access.
    pub data: Vec<Vec<u8>>,
    pub record_access: bool,
}

impl ServiceCodec for AtomicReadFileAck {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.application(&Value::Boolean(self.end_of_file));
        if self.record_access {
            w.open(1);
            w.application(&Value::Signed(self.start as i64));
            w.application(&Value::Unsigned(self.data.len() as u64));
            for record in &self.data {
                w.application(&Value::OctetString(record.clone()));
            }
            w.close(1);
        } else {
            w.open(0);
            w.application(&Value::Signed(self.start as i64));
            w.application(&Value::OctetString(
                self.data.first().cloned().unwrap_or_default(),
            ));
            w.close(0);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let end_of_file = match r.read_value()? {
            Value::Boolean(b) => b,
            _ => return Err(DecodeError::OutOfRange),
        };
        if r.at_opening(0) {
            r.expect_opening(0)?;
            let start = match r.read_value()? {
                Value::Signed(v) => v as i32,
                _ => return Err(DecodeError::OutOfRange),
            };
            let data = match r.read_value()? {
                Value::OctetString(d) => d,
                _ => return Err(DecodeError::OutOfRange),
            };
            r.expect_closing(0)?;
            Ok(AtomicReadFileAck {
                end_of_file,
                start,
                data: vec![data],
                record_access: false,
            })
        } else {
            r.expect_opening(1)?;
            let start = match r.read_value()? {
                Value::Signed(v) => v as i32,
                _ => return Err(DecodeError::OutOfRange),
            };
            let count = match r.read_value()? {
                Value::Unsigned(v) => v as usize,
                _ => return Err(DecodeError::OutOfRange),
            };
            if count > MAX_LIST_ITEMS {
                return Err(DecodeError::CountLimitExceeded);
            }
            let mut data = Vec::with_capacity(count);
            for _ in 0..count {
                match r.read_value()? {
                    Value::OctetString(record) => data.push(record),
                    _ => return Err(DecodeError::OutOfRange),
                }
            }
            r.expect_closing(1)?;
            Ok(AtomicReadFileAck { end_of_file, start, data, record_access: true })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicWriteFileRequest {
    pub file: ObjectId,
    pub start: i32,
    pub data: Vec<Vec<u8>>,
    pub record_access: bool,
}

impl ServiceCodec for AtomicWriteFileRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.application(&Value::ObjectId(self.file));
        if self.record_access {
            w.open(1);
            w.application(&Value::Signed(self.start as i64));
            w.application(&Value::Unsigned(self.data.len() as u64));
            for record in &self.data {
                w.application(&Value::OctetString(record.clone()));
            }
            w.close(1);
        } else {
            w.open(0);
            w.application(&Value::Signed(self.start as i64));
            w.application(&Value::OctetString(
                self.data.first().cloned().unwrap_or_default(),
            ));
            w.close(0);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let file = match r.read_value()? {
            Value::ObjectId(id) => id,
            _ => return Err(DecodeError::OutOfRange),
        };
        if r.at_opening(0) {
            r.expect_opening(0)?;
            let start = match r.read_value()? {
                Value::Signed(v) => v as i32,
                _ => return Err(DecodeError::OutOfRange),
            };
            let data = match r.read_value()? {
                Value::OctetString(d) => d,
                _ => return Err(DecodeError::OutOfRange),
            };
            r.expect_closing(0)?;
            Ok(AtomicWriteFileRequest { file, start, data: vec![data], record_access: false })
        } else {
            r.expect_opening(1)?;
            let start = match r.read_value()? {
                Value::Signed(v) => v as i32,
                _ => return Err(DecodeError::OutOfRange),
            };
            let count = match r.read_value()? {
                Value::Unsigned(v) => v as usize,
                _ => return Err(DecodeError::OutOfRange),
            };
            if count > MAX_LIST_ITEMS {
                return Err(DecodeError::CountLimitExceeded);
            }
            let mut data = Vec::with_capacity(count);
            for _ in 0..count {
                match r.read_value()? {
                    Value::OctetString(record) => data.push(record),
                    _ => return Err(DecodeError::OutOfRange),
                }
            }
            r.expect_closing(1)?;
            Ok(AtomicWriteFileRequest { file, start, data, record_access: true })
        }
    }
}

/// AtomicWriteFile-ACK: the start position actually written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicWriteFileAck {
    pub start: i32,
    pub record_access: bool,
}

impl ServiceCodec for AtomicWriteFileAck {
    fn write(&self, w: &mut TlvWriter<'_>) {
        let tag = if self.record_access { 1 } else { 0 };
        w.context_signed(tag, self.start as i64);
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        match r.peek_tag()? {
            Some(tag) if tag.is_context() && tag.number == 0 => {
                let content = r.expect_context_octets(0)?;
                Ok(AtomicWriteFileAck {
                    start: crate::wire::primitives::parse_signed(&content)? as i32,
                    record_access: false,
                })
            }
            _ => {
                let content = r.expect_context_octets(1)?;
                Ok(AtomicWriteFileAck {
                    start: crate::wire::primitives::parse_signed(&content)? as i32,
                    record_access: true,
                })
            }
        }
    }
}

// --- COV subscription services ---------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeCovRequest {
    pub process_id: u32,
    pub object: ObjectId,
    /// `None` cancels the subscription.
    pub issue_confirmed: Option<bool>,
    pub lifetime_seconds: Option<u32>,
}

impl ServiceCodec for SubscribeCovRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_unsigned(0, self.process_id as u64);
        w.context_object_id(1, self.object);
        if let Some(confirmed) = self.issue_confirmed {
            w.context_boolean(2, confirmed);
        }
        if let Some(lifetime) = self.lifetime_seconds {
            w.context_unsigned(3, lifetime as u64);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        Ok(SubscribeCovRequest {
            process_id: r.expect_context_unsigned(0)? as u32,
            object: r.expect_context_object_id(1)?,
            issue_confirmed: r.opt_context_boolean(2)?,
            lifetime_seconds: r.opt_context_unsigned(3)?.map(|v| v as u32),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscribeCovPropertyRequest {
    pub process_id: u32,
    pub object: ObjectId,
    pub issue_confirmed: Option<bool>,
    pub lifetime_seconds: Option<u32>,
    pub monitored_property: PropertyReference,
    pub cov_increment: Option<f32>,
}

impl ServiceCodec for SubscribeCovPropertyRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_unsigned(0, self.process_id as u64);
        w.context_object_id(1, self.object);
        if let Some(confirmed) = self.issue_confirmed {
            w.context_boolean(2, confirmed);
        }
        if let Some(lifetime) = self.lifetime_seconds {
            w.context_unsigned(3, lifetime as u64);
        }
        w.open(4);
        self.monitored_property.write(w);
        w.close(4);
        if let Some(increment) = self.cov_increment {
            w.context_real(5, increment);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let process_id = r.expect_context_unsigned(0)? as u32;
        let object = r.expect_context_object_id(1)?;
        let issue_confirmed = r.opt_context_boolean(2)?;
        let lifetime_seconds = r.opt_context_unsigned(3)?.map(|v| v as u32);
        r.expect_opening(4)?;
        let monitored_property = PropertyReference::read(r)?;
        r.expect_closing(4)?;
        let cov_increment = match r.peek_tag()? {
            Some(tag) if tag.is_context() && tag.number == 5 => {
                let content = r.expect_context_octets(5)?;
                Some(crate::wire::primitives::parse_real(&content)?)
            }
            _ => None,
        };
        Ok(SubscribeCovPropertyRequest {
            process_id,
            object,
            issue_confirmed,
            lifetime_seconds,
            monitored_property,
            cov_increment,
        })
    }
}

/// One object's property list in a Subscribe-COV-Property-Multiple request.
#[derive(Debug, Clone, PartialEq)]
pub struct CovSubscriptionSpec {
    pub object: ObjectId,
    pub properties: Vec<CovPropertySpec>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CovPropertySpec {
    pub property: PropertyId,
    pub array_index: Option<u32>,
    pub cov_increment: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeCovPropertyMultipleRequest {
    pub process_id: u32,
    pub issue_confirmed: Option<bool>,
    pub lifetime_seconds: Option<u32>,
    pub specs: Vec<CovSubscriptionSpec>,
}

impl ServiceCodec for SubscribeCovPropertyMultipleRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_unsigned(0, self.process_id as u64);
        if let Some(confirmed) = self.issue_confirmed {
            w.context_boolean(1, confirmed);
        }
        if let Some(lifetime) = self.lifetime_seconds {
            w.context_unsigned(2, lifetime as u64);
        }
        w.open(3);
        for spec in &self.specs {
            w.context_object_id(0, spec.object);
            w.open(1);
            for p in &spec.properties {
                w.context_enumerated(0, p.property);
                if let Some(idx) = p.array_index {
                    w.context_unsigned(1, idx as u64);
                }
                if let Some(increment) = p.cov_increment {
                    w.context_real(2, increment);
                }
            }
            w.close(1);
        }
        w.close(3);
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let process_id = r.expect_context_unsigned(0)? as u32;
        let issue_confirmed = r.opt_context_boolean(1)?;
        let lifetime_seconds = r.opt_context_unsigned(2)?.map(|v| v as u32);
        r.expect_opening(3)?;
        let mut specs = Vec::new();
        while !r.at_closing(3) {
            if specs.len() >= MAX_LIST_ITEMS {
                return Err(DecodeError::CountLimitExceeded);
            }
            let object = r.expect_context_object_id(0)?;
            r.expect_opening(1)?;
            let mut properties = Vec::new();
            while !r.at_closing(1) {
                if properties.len() >= MAX_LIST_ITEMS {
                    return Err(DecodeError::CountLimitExceeded);
                }
                let property = r.expect_context_enumerated(0)?;
                let array_index = r.opt_context_unsigned(1)?.map(|v| v as u32);
                let cov_increment = match r.peek_tag()? {
                    Some(tag) if tag.is_context() && tag.number == 2 => {
                        let content = r.expect_context_octets(2)?;
                        Some(crate::wire::primitives::parse_real(&content)?)
                    }
                    _ => None,
                };
                properties.push(CovPropertySpec { property, array_index, cov_increment });
            }
            r.expect_closing(1)?;
            specs.push(CovSubscriptionSpec { object, properties });
        }
        r.expect_closing(3)?;
        Ok(SubscribeCovPropertyMultipleRequest {
            process_id,
            issue_confirmed,
            lifetime_seconds,
            specs,
        })
    }
}

/// COVNotification body, shared by the confirmed and unconfirmed forms.
#[derive(Debug, Clone, PartialEq)]
pub struct CovNotification {
    pub process_id: u32,
    pub initiating_device: ObjectId,
    pub monitored_object: ObjectId,
    pub time_remaining_seconds: u32,
    pub values: Vec<PropertyValue>,
}

impl ServiceCodec for CovNotification {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_unsigned(0, self.process_id as u64);
        w.context_object_id(1, self.initiating_device);
        w.context_object_id(2, self.monitored_object);
        w.context_unsigned(3, self.time_remaining_seconds as u64);
        w.open(4);
        for value in &self.values {
            value.write(w);
        }
        w.close(4);
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let process_id = r.expect_context_unsigned(0)? as u32;
        let initiating_device = r.expect_context_object_id(1)?;
        let monitored_object = r.expect_context_object_id(2)?;
        let time_remaining_seconds = r.expect_context_unsigned(3)? as u32;
        r.expect_opening(4)?;
        let mut values = Vec::new();
        while !r.at_closing(4) {
            if values.len() >= MAX_LIST_ITEMS {
                return Err(DecodeError::CountLimitExceeded);
            }
            values.push(PropertyValue::read(r)?);
        }
        r.expect_closing(4)?;
        Ok(CovNotification {
            process_id,
            initiating_device,
            monitored_object,
            time_remaining_seconds,
            values,
        })
    }
}

// --- Event services ---------------------------------------------------------

/// EventNotification body, shared by the confirmed and unconfirmed forms.
#[derive(Debug, Clone, PartialEq)]
pub struct EventNotification {
    pub process_id: u32,
    pub initiating_device: ObjectId,
    pub event_object: ObjectId,
    pub timestamp: TimeStamp,
    pub notification_class: u32,
    pub priority: u8,
    pub event_type: u32,
    pub message_text: Option<CharacterString>,
    pub notify_type: u32,
    pub ack_required: Option<bool>,
    pub from_state: Option<u32>,
    pub to_state: u32,
    /// Raw notification-parameters octets, kept uninterpreted.
    pub event_values: Option<Vec<u8>>,
}

impl ServiceCodec for EventNotification {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_unsigned(0, self.process_id as u64);
        w.context_object_id(1, self.initiating_device);
        w.context_object_id(2, self.event_object);
        w.open(3);
        self.timestamp.write(w);
        w.close(3);
        w.context_unsigned(4, self.notification_class as u64);
        w.context_unsigned(5, self.priority as u64);
        w.context_enumerated(6, self.event_type);
        if let Some(text) = &self.message_text {
            w.context_string(7, text);
        }
        w.context_enumerated(8, self.notify_type);
        if let Some(ack) = self.ack_required {
            w.context_boolean(9, ack);
        }
        if let Some(from) = self.from_state {
            w.context_enumerated(10, from);
        }
        w.context_enumerated(11, self.to_state);
        if let Some(values) = &self.event_values {
            w.open(12);
            w.raw(values);
            w.close(12);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let process_id = r.expect_context_unsigned(0)? as u32;
        let initiating_device = r.expect_context_object_id(1)?;
        let event_object = r.expect_context_object_id(2)?;
        r.expect_opening(3)?;
        let timestamp = TimeStamp::read(r)?;
        r.expect_closing(3)?;
        let notification_class = r.expect_context_unsigned(4)? as u32;
        let priority = r.expect_context_unsigned(5)? as u8;
        let event_type = r.expect_context_enumerated(6)?;
        let message_text = r.opt_context_string(7)?;
        let notify_type = r.expect_context_enumerated(8)?;
        let ack_required = r.opt_context_boolean(9)?;
        let from_state = r.opt_context_enumerated(10)?;
        let to_state = r.expect_context_enumerated(11)?;
        let event_values = if r.at_opening(12) {
            r.expect_opening(12)?;
            let raw = r.raw_until_close(12)?.to_vec();
            r.expect_closing(12)?;
            Some(raw)
        } else {
            None
        };
        Ok(EventNotification {
            process_id,
            initiating_device,
            event_object,
            timestamp,
            notification_class,
            priority,
            event_type,
            message_text,
            notify_type,
            ack_required,
            from_state,
            to_state,
            event_values,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcknowledgeAlarmRequest {
    pub process_id: u32,
    pub event_object: ObjectId,
    pub event_state_acknowledged: u32,
    pub timestamp: TimeStamp,
    pub acknowledgment_source: CharacterString,
    pub time_of_acknowledgment: TimeStamp,
}

impl ServiceCodec for AcknowledgeAlarmRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_unsigned(0, self.process_id as u64);
        w.context_object_id(1, self.event_object);
        w.context_enumerated(2, self.event_state_acknowledged);
        w.open(3);
        self.timestamp.write(w);
        w.close(3);
        w.context_string(4, &self.acknowledgment_source);
        w.open(5);
        self.time_of_acknowledgment.write(w);
        w.close(5);
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let process_id = r.expect_context_unsigned(0)? as u32;
        let event_object = r.expect_context_object_id(1)?;
        let event_state_acknowledged = r.expect_context_enumerated(2)?;
        r.expect_opening(3)?;
        let timestamp = TimeStamp::read(r)?;
        r.expect_closing(3)?;
        let acknowledgment_source = r.expect_context_string(4)?;
        r.expect_opening(5)?;
        let time_of_acknowledgment = TimeStamp::read(r)?;
        r.expect_closing(5)?;
        Ok(AcknowledgeAlarmRequest {
            process_id,
            event_object,
            event_state_acknowledged,
            timestamp,
            acknowledgment_source,
            time_of_acknowledgment,
        })
    }
}

/// GetAlarmSummary has an empty request; this is the ACK.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmSummary {
    pub object: ObjectId,
    pub alarm_state: u32,
    pub acknowledged_transitions: BitString,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetAlarmSummaryAck {
    pub summaries: Vec<AlarmSummary>,
}

impl ServiceCodec for GetAlarmSummaryAck {
    fn write(&self, w: &mut TlvWriter<'_>) {
        for s in &self.summaries {
            w.application(&Value::ObjectId(s.object));
            w.application(&Value::Enumerated(s.alarm_state));
            w.application(&Value::BitString(s.acknowledged_transitions.clone()));
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let mut summaries = Vec::new();
        while !r.is_empty() {
            if summaries.len() >= MAX_LIST_ITEMS {
                return Err(DecodeError::CountLimitExceeded);
            }
            let object = match r.read_value()? {
                Value::ObjectId(id) => id,
                _ => return Err(DecodeError::OutOfRange),
            };
            let alarm_state = match r.read_value()? {
                Value::Enumerated(v) => v,
                _ => return Err(DecodeError::OutOfRange),
            };
            let acknowledged_transitions = match r.read_value()? {
                Value::BitString(b) => b,
                _ => return Err(DecodeError::OutOfRange),
            };
            summaries.push(AlarmSummary { object, alarm_state, acknowledged_transitions });
        }
        Ok(GetAlarmSummaryAck { summaries })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetEnrollmentSummaryRequest {
    /// 0 all, 1 acked, 2 not-acked.
    pub acknowledgment_filter: u32,
    pub notification_class_filter: Option<u32>,
}

impl ServiceCodec for GetEnrollmentSummaryRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_enumerated(0, self.acknowledgment_filter);
        if let Some(class) = self.notification_class_filter {
            w.context_unsigned(6, class as u64);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        Ok(GetEnrollmentSummaryRequest {
            acknowledgment_filter: r.expect_context_enumerated(0)?,
            notification_class_filter: r.opt_context_unsigned(6)?.map(|v| v as u32),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentSummary {
    pub object: ObjectId,
    pub event_type: u32,
    pub event_state: u32,
    pub priority: u8,
    pub notification_class: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetEnrollmentSummaryAck {
    pub summaries: Vec<EnrollmentSummary>,
}

impl ServiceCodec for GetEnrollmentSummaryAck {
    fn write(&self, w: &mut TlvWriter<'_>) {
        for s in &self.summaries {
            w.application(&Value::ObjectId(s.object));
            w.application(&Value::Enumerated(s.event_type));
            w.application(&Value::Enumerated(s.event_state));
            w.application(&Value::Unsigned(s.priority as u64));
            if let Some(class) = s.notification_class {
                w.application(&Value::Unsigned(class as u64));
            }
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        use crate::wire::tag::app_tag;
        let mut summaries = Vec::new();
        while !r.is_empty() {
            if summaries.len() >= MAX_LIST_ITEMS {
                return Err(DecodeError::CountLimitExceeded);
            }
            let object = match r.read_value()? {
                Value::ObjectId(id) => id,
                _ => return Err(DecodeError::OutOfRange),
            };
            let event_type = match r.read_value()? {
                Value::Enumerated(v) => v,
                _ => return Err(DecodeError::OutOfRange),
            };
            let event_state = match r.read_value()? {
                Value::Enumerated(v) => v,
                _ => return Err(DecodeError::OutOfRange),
            };
            let priority = match r.read_value()? {
                Value::Unsigned(v) => v as u8,
                _ => return Err(DecodeError::OutOfRange),
            };
            // The optional notification class is an unsigned; the next
            // summary would open with an object identifier.
            let notification_class = match r.peek_tag()? {
                Some(tag) if !tag.is_context() && tag.number == app_tag::UNSIGNED => {
                    match r.read_value()? {
                        Value::Unsigned(v) => Some(v as u32),
                        _ => return Err(DecodeError::OutOfRange),
                    }
                }
                _ => None,
            };
            summaries.push(EnrollmentSummary {
                object,
                event_type,
                event_state,
                priority,
                notification_class,
            });
        }
        Ok(GetEnrollmentSummaryAck { summaries })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetEventInformationRequest {
    pub last_received: Option<ObjectId>,
}

impl ServiceCodec for GetEventInformationRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        if let Some(id) = self.last_received {
            w.context_object_id(0, id);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        Ok(GetEventInformationRequest { last_received: r.opt_context_object_id(0)? })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventSummary {
    pub object: ObjectId,
    pub event_state: u32,
    pub acknowledged_transitions: BitString,
    pub event_timestamps: [TimeStamp; 3],
    pub notify_type: u32,
    pub event_enable: BitString,
    pub event_priorities: [u32; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetEventInformationAck {
    pub summaries: Vec<EventSummary>,
    pub more_events: bool,
}

impl ServiceCodec for GetEventInformationAck {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.open(0);
        for s in &self.summaries {
            w.context_object_id(0, s.object);
            w.context_enumerated(1, s.event_state);
            w.context_bit_string(2, &s.acknowledged_transitions);
            w.open(3);
            for ts in &s.event_timestamps {
                ts.write(w);
            }
            w.close(3);
            w.context_enumerated(4, s.notify_type);
            w.context_bit_string(5, &s.event_enable);
            w.open(6);
            for p in &s.event_priorities {
                w.application(&Value::Unsigned(*p as u64));
            }
            w.close(6);
        }
        w.close(0);
        w.context_boolean(1, self.more_events);
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        r.expect_opening(0)?;
        let mut summaries = Vec::new();
        while !r.at_closing(0) {
            if summaries.len() >= MAX_LIST_ITEMS {
                return Err(DecodeError::CountLimitExceeded);
            }
            let object = r.expect_context_object_id(0)?;
            let event_state = r.expect_context_enumerated(1)?;
            let acknowledged_transitions =
                BitString::parse(&r.expect_context_octets(2)?)?;
            r.expect_opening(3)?;
            let timestamps =
                [TimeStamp::read(r)?, TimeStamp::read(r)?, TimeStamp::read(r)?];
            r.expect_closing(3)?;
            let notify_type = r.expect_context_enumerated(4)?;
            let event_enable = BitString::parse(&r.expect_context_octets(5)?)?;
            r.expect_opening(6)?;
            let mut priorities = [0u32; 3];
            for p in &mut priorities {
                *p = match r.read_value()? {
                    Value::Unsigned(v) => v as u32,
                    _ => return Err(DecodeError::OutOfRange),
                };
            }
            r.expect_closing(6)?;
            summaries.push(EventSummary {
                object,
                event_state,
                acknowledged_transitions,
                event_timestamps: timestamps,
                notify_type,
                event_enable,
                event_priorities: priorities,
            });
        }
        r.expect_closing(0)?;
        let more_events = r.expect_context_boolean(1)?;
        Ok(GetEventInformationAck { summaries, more_events })
    }
}

// --- Device management ------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCommunicationControlRequest {
    pub time_duration_minutes: Option<u16>,
    /// 0 enable, 1 disable, 2 disable-initiation.
    pub state: u32,
    pub password: Option<CharacterString>,
}

impl ServiceCodec for DeviceCommunicationControlRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        if let Some(minutes) = self.time_duration_minutes {
            w.context_unsigned(0, minutes as u64);
        }
        w.context_enumerated(1, self.state);
        if let Some(password) = &self.password {
            w.context_string(2, password);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        Ok(DeviceCommunicationControlRequest {
            time_duration_minutes: r.opt_context_unsigned(0)?.map(|v| v as u16),
            state: r.expect_context_enumerated(1)?,
            password: r.opt_context_string(2)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReinitializeDeviceRequest {
    /// 0 coldstart, 1 warmstart, … (Clause 16.4).
    pub state: u32,
    pub password: Option<CharacterString>,
}

impl ServiceCodec for ReinitializeDeviceRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_enumerated(0, self.state);
        if let Some(password) = &self.password {
            w.context_string(1, password);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        Ok(ReinitializeDeviceRequest {
            state: r.expect_context_enumerated(0)?,
            password: r.opt_context_string(1)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSynchronizationRequest {
    pub date: Date,
    pub time: Time,
}

impl ServiceCodec for TimeSynchronizationRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.application(&Value::Date(self.date));
        w.application(&Value::Time(self.time));
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let date = match r.read_value()? {
            Value::Date(d) => d,
            _ => return Err(DecodeError::OutOfRange),
        };
        let time = match r.read_value()? {
            Value::Time(t) => t,
            _ => return Err(DecodeError::OutOfRange),
        };
        Ok(TimeSynchronizationRequest { date, time })
    }
}

// --- Text, private transfer, groups ----------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TextMessageRequest {
    pub source_device: ObjectId,
    /// Numeric [0] or named [1] message class.
    pub message_class: Option<TextMessageClass>,
    /// 0 normal, 1 urgent.
    pub priority: u32,
    pub message: CharacterString,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextMessageClass {
    Numeric(u32),
    Named(CharacterString),
}

impl ServiceCodec for TextMessageRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_object_id(0, self.source_device);
        if let Some(class) = &self.message_class {
            w.open(1);
            match class {
                TextMessageClass::Numeric(n) => w.context_unsigned(0, *n as u64),
                TextMessageClass::Named(s) => w.context_string(1, s),
            }
            w.close(1);
        }
        w.context_enumerated(2, self.priority);
        w.context_string(3, &self.message);
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let source_device = r.expect_context_object_id(0)?;
        let message_class = if r.at_opening(1) {
            r.expect_opening(1)?;
            let class = match r.peek_tag()? {
                Some(tag) if tag.is_context() && tag.number == 0 => {
                    TextMessageClass::Numeric(r.expect_context_unsigned(0)? as u32)
                }
                _ => TextMessageClass::Named(r.expect_context_string(1)?),
            };
            r.expect_closing(1)?;
            Some(class)
        } else {
            None
        };
        Ok(TextMessageRequest {
            source_device,
            message_class,
            priority: r.expect_context_enumerated(2)?,
            message: r.expect_context_string(3)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateTransferRequest {
    pub vendor_id: u16,
    pub service_number: u32,
    /// Raw service parameters, vendor-defined.
    pub parameters: Option<Vec<u8>>,
}

impl ServiceCodec for PrivateTransferRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_unsigned(0, self.vendor_id as u64);
        w.context_unsigned(1, self.service_number as u64);
        if let Some(parameters) = &self.parameters {
            w.open(2);
            w.raw(parameters);
            w.close(2);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let vendor_id = r.expect_context_unsigned(0)? as u16;
        let service_number = r.expect_context_unsigned(1)? as u32;
        let parameters = if r.at_opening(2) {
            r.expect_opening(2)?;
            let raw = r.raw_until_close(2)?.to_vec();
            r.expect_closing(2)?;
            Some(raw)
        } else {
            None
        };
        Ok(PrivateTransferRequest { vendor_id, service_number, parameters })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteGroupRequest {
    pub group_number: u32,
    pub write_priority: u8,
    pub changes: Vec<GroupChannelValue>,
    pub inhibit_delay: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupChannelValue {
    pub channel: u16,
    pub overriding_priority: Option<u8>,
    pub value: Value,
}

impl ServiceCodec for WriteGroupRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_unsigned(0, self.group_number as u64);
        w.context_unsigned(1, self.write_priority as u64);
        w.open(2);
        for change in &self.changes {
            w.context_unsigned(0, change.channel as u64);
            if let Some(priority) = change.overriding_priority {
                w.context_unsigned(1, priority as u64);
            }
            w.application(&change.value);
        }
        w.close(2);
        if let Some(inhibit) = self.inhibit_delay {
            w.context_boolean(3, inhibit);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let group_number = r.expect_context_unsigned(0)? as u32;
        let write_priority = r.expect_context_unsigned(1)? as u8;
        r.expect_opening(2)?;
        let mut changes = Vec::new();
        while !r.at_closing(2) {
            if changes.len() >= MAX_LIST_ITEMS {
                return Err(DecodeError::CountLimitExceeded);
            }
            let channel = r.expect_context_unsigned(0)? as u16;
            let overriding_priority = r.opt_context_unsigned(1)?.map(|v| v as u8);
            let value = r.read_value()?;
            changes.push(GroupChannelValue { channel, overriding_priority, value });
        }
        r.expect_closing(2)?;
        let inhibit_delay = r.opt_context_boolean(3)?;
        Ok(WriteGroupRequest { group_number, write_priority, changes, inhibit_delay })
    }
}

// --- Discovery --------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WhoIsRequest {
    pub low_limit: Option<u32>,
    pub high_limit: Option<u32>,
}

impl WhoIsRequest {
    pub fn matches(&self, instance: u32) -> bool {
        match (self.low_limit, self.high_limit) {
            (Some(low), Some(high)) => (low..=high).contains(&instance),
            (None, None) => true,
            // Half-open limits are malformed; answer anyway.
            _ => true,
        }
    }
}

impl ServiceCodec for WhoIsRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        if let (Some(low), Some(high)) = (self.low_limit, self.high_limit) {
            w.context_unsigned(0, low as u64);
            w.context_unsigned(1, high as u64);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        Ok(WhoIsRequest {
            low_limit: r.opt_context_unsigned(0)?.map(|v| v as u32),
            high_limit: r.opt_context_unsigned(1)?.map(|v| v as u32),
        })
    }
}

/// Segmentation-supported enumeration carried in I-Am.
pub mod segmentation {
    pub const BOTH: u32 = 0;
    pub const TRANSMIT: u32 = 1;
    pub const RECEIVE: u32 = 2;
    pub const NONE: u32 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAmRequest {
    pub device: ObjectId,
    pub max_apdu_length: u32,
    pub segmentation_supported: u32,
    pub vendor_id: u16,
}

impl ServiceCodec for IAmRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.application(&Value::ObjectId(self.device));
        w.application(&Value::Unsigned(self.max_apdu_length as u64));
        w.application(&Value::Enumerated(self.segmentation_supported));
        w.application(&Value::Unsigned(self.vendor_id as u64));
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let device = match r.read_value()? {
            Value::ObjectId(id) => id,
            _ => return Err(DecodeError::OutOfRange),
        };
        let max_apdu_length = match r.read_value()? {
            Value::Unsigned(v) => v as u32,
            _ => return Err(DecodeError::OutOfRange),
        };
        let segmentation_supported = match r.read_value()? {
            Value::Enumerated(v) => v,
            _ => return Err(DecodeError::OutOfRange),
        };
        let vendor_id = match r.read_value()? {
            Value::Unsigned(v) => v as u16,
            _ => return Err(DecodeError::OutOfRange),
        };
        Ok(IAmRequest { device, max_apdu_length, segmentation_supported, vendor_id })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhoHasRequest {
    pub low_limit: Option<u32>,
    pub high_limit: Option<u32>,
    pub object: WhoHasObject,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WhoHasObject {
    Id(ObjectId),
    Name(CharacterString),
}

impl ServiceCodec for WhoHasRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        if let (Some(low), Some(high)) = (self.low_limit, self.high_limit) {
            w.context_unsigned(0, low as u64);
            w.context_unsigned(1, high as u64);
        }
        match &self.object {
            WhoHasObject::Id(id) => w.context_object_id(2, *id),
            WhoHasObject::Name(name) => w.context_string(3, name),
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let low_limit = r.opt_context_unsigned(0)?.map(|v| v as u32);
        let high_limit = r.opt_context_unsigned(1)?.map(|v| v as u32);
        let object = match r.peek_tag()? {
            Some(tag) if tag.is_context() && tag.number == 2 => {
                WhoHasObject::Id(r.expect_context_object_id(2)?)
            }
            _ => WhoHasObject::Name(r.expect_context_string(3)?),
        };
        Ok(WhoHasRequest { low_limit, high_limit, object })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IHaveRequest {
    pub device: ObjectId,
    pub object: ObjectId,
    pub object_name: CharacterString,
}

impl ServiceCodec for IHaveRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.application(&Value::ObjectId(self.device));
        w.application(&Value::ObjectId(self.object));
        w.application(&Value::CharacterString(self.object_name.clone()));
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let device = match r.read_value()? {
            Value::ObjectId(id) => id,
            _ => return Err(DecodeError::OutOfRange),
        };
        let object = match r.read_value()? {
            Value::ObjectId(id) => id,
            _ => return Err(DecodeError::OutOfRange),
        };
        let object_name = match r.read_value()? {
            Value::CharacterString(s) => s,
            _ => return Err(DecodeError::OutOfRange),
        };
        Ok(IHaveRequest { device, object, object_name })
    }
}

/// Who-Am-I (135-2020): an unconfigured device soliciting its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct WhoAmIRequest {
    pub vendor_id: u16,
    pub model_name: CharacterString,
    pub serial_number: CharacterString,
}

impl ServiceCodec for WhoAmIRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.application(&Value::Unsigned(self.vendor_id as u64));
        w.application(&Value::CharacterString(self.model_name.clone()));
        w.application(&Value::CharacterString(self.serial_number.clone()));
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let vendor_id = match r.read_value()? {
            Value::Unsigned(v) => v as u16,
            _ => return Err(DecodeError::OutOfRange),
        };
        let model_name = match r.read_value()? {
            Value::CharacterString(s) => s,
            _ => return Err(DecodeError::OutOfRange),
        };
        let serial_number = match r.read_value()? {
            Value::CharacterString(s) => s,
            _ => return Err(DecodeError::OutOfRange),
        };
        Ok(WhoAmIRequest { vendor_id, model_name, serial_number })
    }
}

/// You-Are (135-2020): assigns identity to a Who-Am-I sender.
#[derive(Debug, Clone, PartialEq)]
pub struct YouAreRequest {
    pub vendor_id: u16,
    pub model_name: CharacterString,
    pub serial_number: CharacterString,
    pub device: Option<ObjectId>,
    pub device_mac: Option<Vec<u8>>,
}

impl ServiceCodec for YouAreRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.application(&Value::Unsigned(self.vendor_id as u64));
        w.application(&Value::CharacterString(self.model_name.clone()));
        w.application(&Value::CharacterString(self.serial_number.clone()));
        if let Some(device) = self.device {
            w.application(&Value::ObjectId(device));
        }
        if let Some(mac) = &self.device_mac {
            w.application(&Value::OctetString(mac.clone()));
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let vendor_id = match r.read_value()? {
            Value::Unsigned(v) => v as u16,
            _ => return Err(DecodeError::OutOfRange),
        };
        let model_name = match r.read_value()? {
            Value::CharacterString(s) => s,
            _ => return Err(DecodeError::OutOfRange),
        };
        let serial_number = match r.read_value()? {
            Value::CharacterString(s) => s,
            _ => return Err(DecodeError::OutOfRange),
        };
        let mut device = None;
        let mut device_mac = None;
        if !r.is_empty() {
            if let Value::ObjectId(id) = r.read_value()? {
                device = Some(id);
            } else {
                return Err(DecodeError::OutOfRange);
            }
        }
        if !r.is_empty() {
            if let Value::OctetString(mac) = r.read_value()? {
                device_mac = Some(mac);
            } else {
                return Err(DecodeError::OutOfRange);
            }
        }
        Ok(YouAreRequest { vendor_id, model_name, serial_number, device, device_mac })
    }
}

// --- Virtual terminal -------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtOpenRequest {
    pub vt_class: u32,
    pub local_session_id: u8,
}

impl ServiceCodec for VtOpenRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.application(&Value::Enumerated(self.vt_class));
        w.application(&Value::Unsigned(self.local_session_id as u64));
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let vt_class = match r.read_value()? {
            Value::Enumerated(v) => v,
            _ => return Err(DecodeError::OutOfRange),
        };
        let local_session_id = match r.read_value()? {
            Value::Unsigned(v) => v as u8,
            _ => return Err(DecodeError::OutOfRange),
        };
        Ok(VtOpenRequest { vt_class, local_session_id })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtCloseRequest {
    pub session_ids: Vec<u8>,
}

impl ServiceCodec for VtCloseRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        for id in &self.session_ids {
            w.application(&Value::Unsigned(*id as u64));
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let mut session_ids = Vec::new();
        while !r.is_empty() {
            if session_ids.len() >= MAX_LIST_ITEMS {
                return Err(DecodeError::CountLimitExceeded);
            }
            match r.read_value()? {
                Value::Unsigned(v) => session_ids.push(v as u8),
                _ => return Err(DecodeError::OutOfRange),
            }
        }
        Ok(VtCloseRequest { session_ids })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtDataRequest {
    pub session_id: u8,
    pub data: Vec<u8>,
    pub flag: u8,
}

impl ServiceCodec for VtDataRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.application(&Value::Unsigned(self.session_id as u64));
        w.application(&Value::OctetString(self.data.clone()));
        w.application(&Value::Unsigned(self.flag as u64));
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let session_id = match r.read_value()? {
            Value::Unsigned(v) => v as u8,
            _ => return Err(DecodeError::OutOfRange),
        };
        let data = match r.read_value()? {
            Value::OctetString(d) => d,
            _ => return Err(DecodeError::OutOfRange),
        };
        let flag = match r.read_value()? {
            Value::Unsigned(v) => v as u8,
            _ => return Err(DecodeError::OutOfRange),
        };
        Ok(VtDataRequest { session_id, data, flag })
    }
}

// --- Audit ------------------------------------------------------------------

/// AuditNotification (confirmed and unconfirmed forms): records are carried
/// as raw constructed values, the audit content model being outside the
/// core.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditNotificationRequest {
    pub notifications: Vec<Value>,
}

impl ServiceCodec for AuditNotificationRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.open(0);
        for n in &self.notifications {
            w.application(n);
        }
        w.close(0);
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        r.expect_opening(0)?;
        let notifications = r.read_values_until_close(0)?;
        r.expect_closing(0)?;
        Ok(AuditNotificationRequest { notifications })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditLogQueryRequest {
    pub log_object: ObjectId,
    pub start_at_sequence: Option<u64>,
    pub requested_count: Option<u32>,
}

impl ServiceCodec for AuditLogQueryRequest {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_object_id(0, self.log_object);
        if let Some(seq) = self.start_at_sequence {
            w.context_unsigned(1, seq);
        }
        if let Some(count) = self.requested_count {
            w.context_unsigned(2, count as u64);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        Ok(AuditLogQueryRequest {
            log_object: r.expect_context_object_id(0)?,
            start_at_sequence: r.opt_context_unsigned(1)?,
            requested_count: r.opt_context_unsigned(2)?.map(|v| v as u32),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditLogQueryAck {
    pub log_object: ObjectId,
    pub records: Vec<Value>,
    pub first_sequence: Option<u64>,
}

impl ServiceCodec for AuditLogQueryAck {
    fn write(&self, w: &mut TlvWriter<'_>) {
        w.context_object_id(0, self.log_object);
        w.open(1);
        for record in &self.records {
            w.application(record);
        }
        w.close(1);
        if let Some(seq) = self.first_sequence {
            w.context_unsigned(2, seq);
        }
    }

    fn read(r: &mut TlvReader<'_>) -> DecodeResult<Self> {
        let log_object = r.expect_context_object_id(0)?;
        r.expect_opening(1)?;
        let records = r.read_values_until_close(1)?;
        r.expect_closing(1)?;
        let first_sequence = r.opt_context_unsigned(2)?;
        Ok(AuditLogQueryAck { log_object, records, first_sequence })
    }
}
