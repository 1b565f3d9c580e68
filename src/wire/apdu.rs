// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The eight APDU shapes of Clause 20.1, dispatched on the high nibble of
//! the first octet.

use crate::error::{DecodeError, DecodeResult, ServiceError};
use crate::wire::value::{TlvReader, TlvWriter, Value};
use crate::wire::{BufferReader, Decodable, Encodable};

pub const PDU_TYPE_CONFIRMED_REQUEST: u8 = 0x0;
pub const PDU_TYPE_UNCONFIRMED_REQUEST: u8 = 0x1;
pub const PDU_TYPE_SIMPLE_ACK: u8 = 0x2;
pub const PDU_TYPE_COMPLEX_ACK: u8 = 0x3;
pub const PDU_TYPE_SEGMENT_ACK: u8 = 0x4;
pub const PDU_TYPE_ERROR: u8 = 0x5;
pub const PDU_TYPE_REJECT: u8 = 0x6;
pub const PDU_TYPE_ABORT: u8 = 0x7;

const FLAG_SEGMENTED: u8 = 0x08;
const FLAG_MORE_FOLLOWS: u8 = 0x04;
const FLAG_SEGMENTED_RESPONSE_ACCEPTED: u8 = 0x02;
const FLAG_NEGATIVE_ACK: u8 = 0x02;
const FLAG_FROM_SERVER: u8 = 0x01;

/// Reject reasons (Clause 18.8).
pub mod reject_reason {
    pub const OTHER: u8 = 0;
    pub const BUFFER_OVERFLOW: u8 = 1;
    pub const INCONSISTENT_PARAMETERS: u8 = 2;
    pub const INVALID_PARAMETER_DATA_TYPE: u8 = 3;
    pub const INVALID_TAG: u8 = 4;
    pub const MISSING_REQUIRED_PARAMETER: u8 = 5;
    pub const PARAMETER_OUT_OF_RANGE: u8 = 6;
    pub const TOO_MANY_ARGUMENTS: u8 = 7;
    pub const UNDEFINED_ENUMERATION: u8 = 8;
    pub const UNRECOGNIZED_SERVICE: u8 = 9;
}

/// Abort reasons (Clause 18.9).
pub mod abort_reason {
    pub const OTHER: u8 = 0;
    pub const BUFFER_OVERFLOW: u8 = 1;
    pub const INVALID_APDU_IN_THIS_STATE: u8 = 2;
    pub const PREEMPTED_BY_HIGHER_PRIORITY_TASK: u8 = 3;
    pub const SEGMENTATION_NOT_SUPPORTED: u8 = 4;
    pub const SECURITY_ERROR: u8 = 5;
    pub const WINDOW_SIZE_OUT_OF_RANGE: u8 = 7;
    pub const OUT_OF_RESOURCES: u8 = 9;
    pub const TSM_TIMEOUT: u8 = 10;
    pub const APDU_TOO_LONG: u8 = 11;
}

/// Maximum APDU length a peer accepts (Clause 20.1.2.5 encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum MaxApdu {
    Up50 = 0,
    #[default]
    Up128 = 1,
    Up206 = 2,
    Up480 = 3,
    Up1024 = 4,
    Up1476 = 5,
}

impl MaxApdu {
    pub fn from_code(code: u8) -> DecodeResult<MaxApdu> {
        Ok(match code & 0x0F {
            0 => MaxApdu::Up50,
            1 => MaxApdu::Up128,
            2 => MaxApdu::Up206,
            3 => MaxApdu::Up480,
            4 => MaxApdu::Up1024,
            5 => MaxApdu::Up1476,
            other => return Err(DecodeError::UnknownPduType(other)),
        })
    }

    pub fn bytes(self) -> usize {
        match self {
            MaxApdu::Up50 => 50,
            MaxApdu::Up128 => 128,
            MaxApdu::Up206 => 206,
            MaxApdu::Up480 => 480,
            MaxApdu::Up1024 => 1024,
            MaxApdu::Up1476 => 1476,
        }
    }

    /// Largest table entry not exceeding `bytes`.
    pub fn fitting(bytes: usize) -> MaxApdu {
        [MaxApdu::Up1476, MaxApdu::Up1024, MaxApdu::Up480, MaxApdu::Up206, MaxApdu::Up128]
            .into_iter()
            .find(|m| m.bytes() <= bytes)
            .unwrap_or(MaxApdu::Up50)
    }
}

/// Maximum segments a requester will accept (Clause 20.1.2.4 encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxSegments {
    #[default]
    Unspecified = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
    Sixteen = 4,
    ThirtyTwo = 5,
    SixtyFour = 6,
    MoreThanSixtyFour = 7,
}

impl MaxSegments {
    pub fn from_code(code: u8) -> MaxSegments {
        match code & 0x07 {
            1 => MaxSegments::Two,
            2 => MaxSegments::Four,
            3 => MaxSegments::Eight,
            4 => MaxSegments::Sixteen,
            5 => MaxSegments::ThirtyTwo,
            6 => MaxSegments::SixtyFour,
            7 => MaxSegments::MoreThanSixtyFour,
            _ => MaxSegments::Unspecified,
        }
    }

    /// Segment budget for planning; `Unspecified` plans conservatively.
    pub fn count(self) -> usize {
        match self {
            MaxSegments::Unspecified => 2,
            MaxSegments::Two => 2,
            MaxSegments::Four => 4,
            MaxSegments::Eight => 8,
            MaxSegments::Sixteen => 16,
            MaxSegments::ThirtyTwo => 32,
            MaxSegments::SixtyFour => 64,
            MaxSegments::MoreThanSixtyFour => usize::MAX,
        }
    }
}

/// Sequence number and window carried by a segment of a request or ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub sequence_number: u8,
    pub proposed_window_size: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedRequest {
    pub segmented_response_accepted: bool,
    pub max_segments: MaxSegments,
    pub max_apdu: MaxApdu,
    pub invoke_id: u8,
    /// Present when this APDU is one segment of a larger request.
    pub segment: Option<SegmentInfo>,
    pub more_follows: bool,
    pub service_choice: u8,
    pub service_data: Vec<u8>,
}

impl ConfirmedRequest {
    pub fn new(invoke_id: u8, service_choice: u8, service_data: Vec<u8>) -> ConfirmedRequest {
        ConfirmedRequest {
            segmented_response_accepted: true,
            max_segments: MaxSegments::MoreThanSixtyFour,
            max_apdu: MaxApdu::Up1476,
            invoke_id,
            segment: None,
            more_follows: false,
            service_choice,
            service_data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexAck {
    pub invoke_id: u8,
    pub segment: Option<SegmentInfo>,
    pub more_follows: bool,
    pub service_choice: u8,
    pub service_data: Vec<u8>,
}

impl ComplexAck {
    pub fn new(invoke_id: u8, service_choice: u8, service_data: Vec<u8>) -> ComplexAck {
        ComplexAck { invoke_id, segment: None, more_follows: false, service_choice, service_data }
    }
}

/// One application-layer protocol data unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    ConfirmedRequest(ConfirmedRequest),
    UnconfirmedRequest {
        service_choice: u8,
        service_data: Vec<u8>,
    },
    SimpleAck {
        invoke_id: u8,
        service_choice: u8,
    },
    ComplexAck(ComplexAck),
    SegmentAck {
        negative_ack: bool,
        from_server: bool,
        invoke_id: u8,
        sequence_number: u8,
        actual_window_size: u8,
    },
    Error {
        invoke_id: u8,
        service_choice: u8,
        error: ServiceError,
    },
    Reject {
        invoke_id: u8,
        reason: u8,
    },
    Abort {
        from_server: bool,
        invoke_id: u8,
        reason: u8,
    },
}

impl Apdu {
    /// The invoke id, for every shape that carries one.
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest(req) => Some(req.invoke_id),
            Apdu::UnconfirmedRequest { .. } => None,
            Apdu::SimpleAck { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
            Apdu::ComplexAck(ack) => Some(ack.invoke_id),
        }
    }
}

fn error_body_len(error: &ServiceError) -> usize {
    Value::Enumerated(error.class as u32).encoded_len()
        + Value::Enumerated(error.code as u32).encoded_len()
}

impl Encodable for Apdu {
    fn encoded_len(&self) -> usize {
        match self {
            Apdu::ConfirmedRequest(req) => {
                4 + if req.segment.is_some() { 2 } else { 0 } + req.service_data.len()
            }
            Apdu::UnconfirmedRequest { service_data, .. } => 2 + service_data.len(),
            Apdu::SimpleAck { .. } => 3,
            Apdu::ComplexAck(ack) => {
                3 + if ack.segment.is_some() { 2 } else { 0 } + ack.service_data.len()
            }
            Apdu::SegmentAck { .. } => 4,
            Apdu::Error { error, .. } => 3 + error_body_len(error),
            Apdu::Reject { .. } => 3,
            Apdu::Abort { .. } => 3,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Apdu::ConfirmedRequest(req) => {
                let mut head = PDU_TYPE_CONFIRMED_REQUEST << 4;
                if req.segment.is_some() {
                    head |= FLAG_SEGMENTED;
                }
                if req.more_follows {
                    head |= FLAG_MORE_FOLLOWS;
                }
                if req.segmented_response_accepted {
                    head |= FLAG_SEGMENTED_RESPONSE_ACCEPTED;
                }
                buf.push(head);
                buf.push(((req.max_segments as u8) << 4) | req.max_apdu as u8);
                buf.push(req.invoke_id);
                if let Some(seg) = &req.segment {
                    buf.push(seg.sequence_number);
                    buf.push(seg.proposed_window_size);
                }
                buf.push(req.service_choice);
                buf.extend_from_slice(&req.service_data);
            }
            Apdu::UnconfirmedRequest { service_choice, service_data } => {
                buf.push(PDU_TYPE_UNCONFIRMED_REQUEST << 4);
                buf.push(*service_choice);
                buf.extend_from_slice(service_data);
            }
            Apdu::SimpleAck { invoke_id, service_choice } => {
                buf.push(PDU_TYPE_SIMPLE_ACK << 4);
                buf.push(*invoke_id);
                buf.push(*service_choice);
            }
            Apdu::ComplexAck(ack) => {
                let mut head = PDU_TYPE_COMPLEX_ACK << 4;
                if ack.segment.is_some() {
                    head |= FLAG_SEGMENTED;
                }
                if ack.more_follows {
                    head |= FLAG_MORE_FOLLOWS;
                }
                buf.push(head);
                buf.push(ack.invoke_id);
                if let Some(seg) = &ack.segment {
                    buf.push(seg.sequence_number);
                    buf.push(seg.proposed_window_size);
                }
                buf.push(ack.service_choice);
                buf.extend_from_slice(&ack.service_data);
            }
            Apdu::SegmentAck {
                negative_ack,
                from_server,
                invoke_id,
                sequence_number,
                actual_window_size,
            } => {
                let mut head = PDU_TYPE_SEGMENT_ACK << 4;
                if *negative_ack {
                    head |= FLAG_NEGATIVE_ACK;
                }
                if *from_server {
                    head |= FLAG_FROM_SERVER;
                }
                buf.push(head);
                buf.push(*invoke_id);
                buf.push(*sequence_number);
                buf.push(*actual_window_size);
            }
            Apdu::Error { invoke_id, service_choice, error } => {
                buf.push(PDU_TYPE_ERROR << 4);
                buf.push(*invoke_id);
                buf.push(*service_choice);
                let mut w = TlvWriter::new(buf);
                w.application(&Value::Enumerated(error.class as u32));
                w.application(&Value::Enumerated(error.code as u32));
            }
            Apdu::Reject { invoke_id, reason } => {
                buf.push(PDU_TYPE_REJECT << 4);
                buf.push(*invoke_id);
                buf.push(*reason);
            }
            Apdu::Abort { from_server, invoke_id, reason } => {
                let mut head = PDU_TYPE_ABORT << 4;
                if *from_server {
                    head |= FLAG_FROM_SERVER;
                }
                buf.push(head);
                buf.push(*invoke_id);
                buf.push(*reason);
            }
        }
    }
}

impl Decodable for Apdu {
    fn decode(buf: &[u8]) -> DecodeResult<Apdu> {
        let mut r = BufferReader::new(buf);
        let head = r.read_u8()?;
        match head >> 4 {
            PDU_TYPE_CONFIRMED_REQUEST => {
                let sizes = r.read_u8()?;
                let invoke_id = r.read_u8()?;
                let segment = if head & FLAG_SEGMENTED != 0 {
                    Some(SegmentInfo {
                        sequence_number: r.read_u8()?,
                        proposed_window_size: r.read_u8()?,
                    })
                } else {
                    None
                };
                let service_choice = r.read_u8()?;
                Ok(Apdu::ConfirmedRequest(ConfirmedRequest {
                    segmented_response_accepted: head & FLAG_SEGMENTED_RESPONSE_ACCEPTED != 0,
                    max_segments: MaxSegments::from_code(sizes >> 4),
                    max_apdu: MaxApdu::from_code(sizes)?,
                    invoke_id,
                    segment,
                    more_follows: head & FLAG_MORE_FOLLOWS != 0,
                    service_choice,
                    service_data: r.into_rest().to_vec(),
                }))
            }
            PDU_TYPE_UNCONFIRMED_REQUEST => Ok(Apdu::UnconfirmedRequest {
                service_choice: r.read_u8()?,
                service_data: r.into_rest().to_vec(),
            }),
            PDU_TYPE_SIMPLE_ACK => Ok(Apdu::SimpleAck {
                invoke_id: r.read_u8()?,
                service_choice: r.read_u8()?,
            }),
            PDU_TYPE_COMPLEX_ACK => {
                let invoke_id = r.read_u8()?;
                let segment = if head & FLAG_SEGMENTED != 0 {
                    Some(SegmentInfo {
                        sequence_number: r.read_u8()?,
                        proposed_window_size: r.read_u8()?,
                    })
                } else {
                    None
                };
                let service_choice = r.read_u8()?;
                Ok(Apdu::ComplexAck(ComplexAck {
                    invoke_id,
                    segment,
                    more_follows: head & FLAG_MORE_FOLLOWS != 0,
                    service_choice,
                    service_data: r.into_rest().to_vec(),
                }))
            }
            PDU_TYPE_SEGMENT_ACK => Ok(Apdu::SegmentAck {
                negative_ack: head & FLAG_NEGATIVE_ACK != 0,
                from_server: head & FLAG_FROM_SERVER != 0,
                invoke_id: r.read_u8()?,
                sequence_number: r.read_u8()?,
                actual_window_size: r.read_u8()?,
            }),
            PDU_TYPE_ERROR => {
                let invoke_id = r.read_u8()?;
                let service_choice = r.read_u8()?;
                let mut t = TlvReader::new(r.into_rest());
                let error = read_error_body(&mut t)?;
                Ok(Apdu::Error { invoke_id, service_choice, error })
            }
            PDU_TYPE_REJECT => Ok(Apdu::Reject {
                invoke_id: r.read_u8()?,
                reason: r.read_u8()?,
            }),
            PDU_TYPE_ABORT => Ok(Apdu::Abort {
                from_server: head & FLAG_FROM_SERVER != 0,
                invoke_id: r.read_u8()?,
                reason: r.read_u8()?,
            }),
            other => Err(DecodeError::UnknownPduType(other)),
        }
    }
}

/// Pulls error-class and error-code out of an Error-PDU body. The services
/// with constructed error productions nest the pair inside a context tag;
/// unwrap one level if that is what arrived.
fn read_error_body(t: &mut TlvReader<'_>) -> DecodeResult<ServiceError> {
    fn class_code(values: &[Value]) -> Option<ServiceError> {
        match values {
            [Value::Enumerated(class), Value::Enumerated(code), ..] => {
                Some(ServiceError { class: *class as u16, code: *code as u16 })
            }
            _ => None,
        }
    }
    let first = t.read_value()?;
    match first {
        Value::Enumerated(class) => {
            let code = match t.read_value()? {
                Value::Enumerated(code) => code,
                _ => return Err(DecodeError::OutOfRange),
            };
            Ok(ServiceError { class: class as u16, code: code as u16 })
        }
        Value::Constructed(_, items) => class_code(&items).ok_or(DecodeError::OutOfRange),
        _ => Err(DecodeError::OutOfRange),
    }
}
