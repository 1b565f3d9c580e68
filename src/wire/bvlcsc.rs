// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Annex AB BVLC frames for BACnet Secure Connect.
//!
//! Header: `function (u8) | control (u8) | message id (u16 BE)` followed by
//! the optional 6-octet origin and destination VMACs, the optional
//! destination- and data-option lists, then the function payload. Option
//! lists are self-delimiting: each option is `type | length (u16) | data`,
//! with the high bit of the type octet flagging that another option follows.

use uuid::Uuid;

use crate::error::{DecodeError, DecodeResult};
use crate::wire::{BufferReader, Decodable, Encodable};

/// A 6-octet Secure Connect virtual MAC.
pub type ScVmac = [u8; 6];

/// Broadcast destination VMAC.
pub const SC_BROADCAST: ScVmac = [0xFF; 6];

const FLAG_DEST_VMAC: u8 = 0x80;
const FLAG_ORIGIN_VMAC: u8 = 0x40;
const FLAG_DATA_OPTIONS: u8 = 0x10;
const FLAG_DEST_OPTIONS: u8 = 0x08;
const FLAG_MORE_FOLLOWS: u8 = 0x04;
const FLAG_NACK: u8 = 0x02;

const OPTION_MORE: u8 = 0x80;

/// Caps on attacker-controlled list sizes.
pub const MAX_HEADER_OPTIONS: usize = 32;
pub const MAX_OPTION_DATA: usize = 512;
pub const MAX_RESOLUTION_URIS: usize = 16;

/// BVLC-SC function codes (Annex AB.2.3).
pub mod function {
    pub const RESULT: u8 = 0x00;
    pub const ENCAPSULATED_NPDU: u8 = 0x01;
    pub const ADDRESS_RESOLUTION: u8 = 0x02;
    pub const ADDRESS_RESOLUTION_ACK: u8 = 0x03;
    pub const ADVERTISEMENT: u8 = 0x04;
    pub const ADVERTISEMENT_SOLICITATION: u8 = 0x05;
    pub const CONNECT_REQUEST: u8 = 0x06;
    pub const CONNECT_ACCEPT: u8 = 0x07;
    pub const DISCONNECT_REQUEST: u8 = 0x08;
    pub const DISCONNECT_ACK: u8 = 0x09;
    pub const HEARTBEAT_REQUEST: u8 = 0x0A;
    pub const HEARTBEAT_ACK: u8 = 0x0B;
    pub const PROPRIETARY: u8 = 0x0C;
}

/// Error classes/codes for Result NAKs raised by this stack.
pub mod nak {
    /// Communication / VMAC not registered here.
    pub const CLASS_COMMUNICATION: u16 = 7;
    pub const CODE_VMAC_MISMATCH: u16 = 133;
    pub const CODE_NODE_DUPLICATE_VMAC: u16 = 134;
    pub const CODE_NODE_NOT_CONNECTED: u16 = 135;
    pub const CODE_OUT_OF_RESOURCES: u16 = 136;
    pub const CODE_UNEXPECTED_DATA: u16 = 46;
}

/// One header option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderOption {
    pub option_type: u8,
    pub data: Vec<u8>,
}

/// The error block of a NAK Result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScError {
    pub header_marker: u8,
    pub class: u16,
    pub code: u16,
    pub details: String,
}

/// Connect-Request / Connect-Accept parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams {
    pub vmac: ScVmac,
    pub uuid: Uuid,
    pub max_bvlc_len: u16,
    pub max_npdu_len: u16,
}

/// Function-specific payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScPayload {
    Result { acked_function: u8, error: Option<ScError> },
    EncapsulatedNpdu(Vec<u8>),
    AddressResolution,
    AddressResolutionAck { uris: Vec<String> },
    Advertisement { hub_status: u8, accepts_direct: bool, max_bvlc_len: u16, max_npdu_len: u16 },
    AdvertisementSolicitation,
    ConnectRequest(ConnectParams),
    ConnectAccept(ConnectParams),
    DisconnectRequest,
    DisconnectAck,
    HeartbeatRequest,
    HeartbeatAck,
    Proprietary { vendor_id: u16, function: u8, data: Vec<u8> },
}

impl ScPayload {
    pub fn function(&self) -> u8 {
        use function::*;
        match self {
            ScPayload::Result { .. } => RESULT,
            ScPayload::EncapsulatedNpdu(_) => ENCAPSULATED_NPDU,
            ScPayload::AddressResolution => ADDRESS_RESOLUTION,
            ScPayload::AddressResolutionAck { .. } => ADDRESS_RESOLUTION_ACK,
            ScPayload::Advertisement { .. } => ADVERTISEMENT,
            ScPayload::AdvertisementSolicitation => ADVERTISEMENT_SOLICITATION,
            ScPayload::ConnectRequest(_) => CONNECT_REQUEST,
            ScPayload::ConnectAccept(_) => CONNECT_ACCEPT,
            ScPayload::DisconnectRequest => DISCONNECT_REQUEST,
            ScPayload::DisconnectAck => DISCONNECT_ACK,
            ScPayload::HeartbeatRequest => HEARTBEAT_REQUEST,
            ScPayload::HeartbeatAck => HEARTBEAT_ACK,
            ScPayload::Proprietary { .. } => PROPRIETARY,
        }
    }

    fn len(&self) -> usize {
        match self {
            ScPayload::Result { error, .. } => {
                2 + error.as_ref().map(|e| 5 + e.details.len()).unwrap_or(0)
            }
            ScPayload::EncapsulatedNpdu(npdu) => npdu.len(),
            ScPayload::AddressResolution
            | ScPayload::AdvertisementSolicitation
            | ScPayload::DisconnectRequest
            | ScPayload::DisconnectAck
            | ScPayload::HeartbeatRequest
            | ScPayload::HeartbeatAck => 0,
            ScPayload::AddressResolutionAck { uris } => {
                if uris.is_empty() {
                    0
                } else {
                    uris.iter().map(String::len).sum::<usize>() + uris.len() - 1
                }
            }
            ScPayload::Advertisement { .. } => 6,
            ScPayload::ConnectRequest(_) | ScPayload::ConnectAccept(_) => 26,
            ScPayload::Proprietary { data, .. } => 3 + data.len(),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            ScPayload::Result { acked_function, error } => {
                buf.push(*acked_function);
                match error {
                    None => buf.push(0x00),
                    Some(e) => {
                        buf.push(0x01);
                        buf.push(e.header_marker);
                        buf.extend_from_slice(&e.class.to_be_bytes());
                        buf.extend_from_slice(&e.code.to_be_bytes());
                        buf.extend_from_slice(e.details.as_bytes());
                    }
                }
            }
            ScPayload::EncapsulatedNpdu(npdu) => buf.extend_from_slice(npdu),
            ScPayload::AddressResolution
            | ScPayload::AdvertisementSolicitation
            | ScPayload::DisconnectRequest
            | ScPayload::DisconnectAck
            | ScPayload::HeartbeatRequest
            | ScPayload::HeartbeatAck => {}
            ScPayload::AddressResolutionAck { uris } => {
                buf.extend_from_slice(uris.join(" ").as_bytes())
            }
            ScPayload::Advertisement {
                hub_status,
                accepts_direct,
                max_bvlc_len,
                max_npdu_len,
            } => {
                buf.push(*hub_status);
                buf.push(*accepts_direct as u8);
                buf.extend_from_slice(&max_bvlc_len.to_be_bytes());
                buf.extend_from_slice(&max_npdu_len.to_be_bytes());
            }
            ScPayload::ConnectRequest(p) | ScPayload::ConnectAccept(p) => {
                buf.extend_from_slice(&p.vmac);
                buf.extend_from_slice(p.uuid.as_bytes());
                buf.extend_from_slice(&p.max_bvlc_len.to_be_bytes());
                buf.extend_from_slice(&p.max_npdu_len.to_be_bytes());
            }
            ScPayload::Proprietary { vendor_id, function, data } => {
                buf.extend_from_slice(&vendor_id.to_be_bytes());
                buf.push(*function);
                buf.extend_from_slice(data);
            }
        }
    }

    fn decode(func: u8, r: &mut BufferReader<'_>) -> DecodeResult<ScPayload> {
        use function::*;
        Ok(match func {
            RESULT => {
                let acked_function = r.read_u8()?;
                let error = match r.read_u8()? {
                    0x00 => None,
                    0x01 => Some(ScError {
                        header_marker: r.read_u8()?,
                        class: r.read_u16()?,
                        code: r.read_u16()?,
                        details: String::from_utf8(r.rest().to_vec())
                            .map_err(|_| DecodeError::InvalidCharset(0))?,
                    }),
                    other => return Err(DecodeError::UnknownPduType(other)),
                };
                ScPayload::Result { acked_function, error }
            }
            ENCAPSULATED_NPDU => ScPayload::EncapsulatedNpdu(r.rest().to_vec()),
            ADDRESS_RESOLUTION => ScPayload::AddressResolution,
            ADDRESS_RESOLUTION_ACK => {
                let text = std::str::from_utf8(r.rest())
                    .map_err(|_| DecodeError::InvalidCharset(0))?;
                let uris: Vec<String> = if text.is_empty() {
                    Vec::new()
                } else {
                    text.split(' ').map(str::to_owned).collect()
                };
                if uris.len() > MAX_RESOLUTION_URIS {
                    return Err(DecodeError::CountLimitExceeded);
                }
                ScPayload::AddressResolutionAck { uris }
            }
            ADVERTISEMENT => ScPayload::Advertisement {
                hub_status: r.read_u8()?,
                accepts_direct: r.read_u8()? != 0,
                max_bvlc_len: r.read_u16()?,
                max_npdu_len: r.read_u16()?,
            },
            ADVERTISEMENT_SOLICITATION => ScPayload::AdvertisementSolicitation,
            CONNECT_REQUEST => ScPayload::ConnectRequest(read_connect_params(r)?),
            CONNECT_ACCEPT => ScPayload::ConnectAccept(read_connect_params(r)?),
            DISCONNECT_REQUEST => ScPayload::DisconnectRequest,
            DISCONNECT_ACK => ScPayload::DisconnectAck,
            HEARTBEAT_REQUEST => ScPayload::HeartbeatRequest,
            HEARTBEAT_ACK => ScPayload::HeartbeatAck,
            PROPRIETARY => ScPayload::Proprietary {
                vendor_id: r.read_u16()?,
                function: r.read_u8()?,
                data: r.rest().to_vec(),
            },
            other => return Err(DecodeError::UnknownPduType(other)),
        })
    }
}

fn read_connect_params(r: &mut BufferReader<'_>) -> DecodeResult<ConnectParams> {
    let vmac: ScVmac = r.read_array()?;
    let uuid_bytes: [u8; 16] = r.read_array()?;
    Ok(ConnectParams {
        vmac,
        uuid: Uuid::from_bytes(uuid_bytes),
        max_bvlc_len: r.read_u16()?,
        max_npdu_len: r.read_u16()?,
    })
}

/// A complete BVLC-SC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScFrame {
    pub message_id: u16,
    pub origin: Option<ScVmac>,
    pub destination: Option<ScVmac>,
    pub more_follows: bool,
    pub is_nack: bool,
    pub dest_options: Vec<HeaderOption>,
    pub data_options: Vec<HeaderOption>,
    pub payload: ScPayload,
}

impl ScFrame {
    pub fn new(message_id: u16, payload: ScPayload) -> ScFrame {
        ScFrame {
            message_id,
            origin: None,
            destination: None,
            more_follows: false,
            is_nack: false,
            dest_options: Vec::new(),
            data_options: Vec::new(),
            payload,
        }
    }

    pub fn with_origin(mut self, vmac: ScVmac) -> ScFrame {
        self.origin = Some(vmac);
        self
    }

    pub fn with_destination(mut self, vmac: ScVmac) -> ScFrame {
        self.destination = Some(vmac);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination == Some(SC_BROADCAST)
    }

    fn control(&self) -> u8 {
        let mut control = 0;
        if self.destination.is_some() {
            control |= FLAG_DEST_VMAC;
        }
        if self.origin.is_some() {
            control |= FLAG_ORIGIN_VMAC;
        }
        if !self.data_options.is_empty() {
            control |= FLAG_DATA_OPTIONS;
        }
        if !self.dest_options.is_empty() {
            control |= FLAG_DEST_OPTIONS;
        }
        if self.more_follows {
            control |= FLAG_MORE_FOLLOWS;
        }
        if self.is_nack {
            control |= FLAG_NACK;
        }
        control
    }
}

fn options_len(options: &[HeaderOption]) -> usize {
    options.iter().map(|o| 3 + o.data.len()).sum()
}

fn encode_options(buf: &mut Vec<u8>, options: &[HeaderOption]) {
    for (i, option) in options.iter().enumerate() {
        let more = if i + 1 < options.len() { OPTION_MORE } else { 0 };
        buf.push(option.option_type & !OPTION_MORE | more);
        buf.extend_from_slice(&(option.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&option.data);
    }
}

fn decode_options(r: &mut BufferReader<'_>) -> DecodeResult<Vec<HeaderOption>> {
    let mut options = Vec::new();
    loop {
        let marker = r.read_u8()?;
        let len = r.read_u16()? as usize;
        if len > MAX_OPTION_DATA {
            return Err(DecodeError::LengthTooLarge(len as u32));
        }
        if options.len() >= MAX_HEADER_OPTIONS {
            return Err(DecodeError::CountLimitExceeded);
        }
        options.push(HeaderOption {
            option_type: marker & !OPTION_MORE,
            data: r.read_bytes(len)?.to_vec(),
        });
        if marker & OPTION_MORE == 0 {
            return Ok(options);
        }
    }
}

impl Encodable for ScFrame {
    fn encoded_len(&self) -> usize {
        4 + self.origin.map_or(0, |_| 6)
            + self.destination.map_or(0, |_| 6)
            + options_len(&self.dest_options)
            + options_len(&self.data_options)
            + self.payload.len()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.payload.function());
        buf.push(self.control());
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        if let Some(origin) = &self.origin {
            buf.extend_from_slice(origin);
        }
        if let Some(dest) = &self.destination {
            buf.extend_from_slice(dest);
        }
        encode_options(buf, &self.dest_options);
        encode_options(buf, &self.data_options);
        self.payload.encode(buf);
    }
}

impl Decodable for ScFrame {
    fn decode(buf: &[u8]) -> DecodeResult<ScFrame> {
        let mut r = BufferReader::new(buf);
        let func = r.read_u8()?;
        let control = r.read_u8()?;
        let message_id = r.read_u16()?;
        let origin =
            if control & FLAG_ORIGIN_VMAC != 0 { Some(r.read_array()?) } else { None };
        let destination =
            if control & FLAG_DEST_VMAC != 0 { Some(r.read_array()?) } else { None };
        let dest_options = if control & FLAG_DEST_OPTIONS != 0 {
            decode_options(&mut r)?
        } else {
            Vec::new()
        };
        let data_options = if control & FLAG_DATA_OPTIONS != 0 {
            decode_options(&mut r)?
        } else {
            Vec::new()
        };
        let payload = ScPayload::decode(func, &mut r)?;
        Ok(ScFrame {
            message_id,
            origin,
            destination,
            more_follows: control & FLAG_MORE_FOLLOWS != 0,
            is_nack: control & FLAG_NACK != 0,
            dest_options,
            data_options,
            payload,
        })
    }
}

/// The addressing header alone, for forwarding decisions that must not pay
/// for a payload copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScHeader {
    pub function: u8,
    pub message_id: u16,
    pub origin: Option<ScVmac>,
    pub destination: Option<ScVmac>,
}

impl ScHeader {
    /// Decodes only the fixed header and VMACs; options and payload are left
    /// untouched in the buffer.
    pub fn peek(buf: &[u8]) -> DecodeResult<ScHeader> {
        let mut r = BufferReader::new(buf);
        let function = r.read_u8()?;
        let control = r.read_u8()?;
        let message_id = r.read_u16()?;
        let origin =
            if control & FLAG_ORIGIN_VMAC != 0 { Some(r.read_array()?) } else { None };
        let destination =
            if control & FLAG_DEST_VMAC != 0 { Some(r.read_array()?) } else { None };
        Ok(ScHeader { function, message_id, origin, destination })
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination == Some(SC_BROADCAST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const VMAC_1: ScVmac = [0x02, 0x01, 0x01, 0x01, 0x01, 0x01];
    const VMAC_2: ScVmac = [0x02, 0x02, 0x02, 0x02, 0x02, 0x02];

    fn round_trip(frame: ScFrame) -> Vec<u8> {
        let buf = frame.to_bytes();
        assert_eq!(buf.len(), frame.encoded_len(), "{:?}", frame);
        let decoded = ScFrame::decode(&buf).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.to_bytes(), buf);
        buf
    }

    #[test]
    fn heartbeat_wire_form() {
        let buf = round_trip(ScFrame::new(0x1234, ScPayload::HeartbeatRequest));
        assert_eq!(buf, [0x0A, 0x00, 0x12, 0x34]);
    }

    #[test]
    fn encapsulated_npdu_with_vmacs() {
        let frame = ScFrame::new(7, ScPayload::EncapsulatedNpdu(vec![0x01, 0x00, 0xAA]))
            .with_origin(VMAC_1)
            .with_destination(VMAC_2);
        let buf = round_trip(frame);
        assert_eq!(buf[1], FLAG_DEST_VMAC | FLAG_ORIGIN_VMAC);
        assert_eq!(&buf[4..10], &VMAC_1);
        assert_eq!(&buf[10..16], &VMAC_2);
    }

    #[test]
    fn all_payloads_round_trip() {
        round_trip(ScFrame::new(1, ScPayload::Result {
            acked_function: function::CONNECT_REQUEST,
            error: None,
        }));
        let mut nak = ScFrame::new(2, ScPayload::Result {
            acked_function: function::ENCAPSULATED_NPDU,
            error: Some(ScError {
                header_marker: 0,
                class: nak::CLASS_COMMUNICATION,
                code: nak::CODE_VMAC_MISMATCH,
                details: "origin mismatch".to_owned(),
            }),
        });
        nak.is_nack = true;
        round_trip(nak);
        round_trip(ScFrame::new(3, ScPayload::AddressResolution));
        round_trip(ScFrame::new(4, ScPayload::AddressResolutionAck {
            uris: vec!["wss://10.0.0.7:4443".to_owned(), "ws://10.0.0.7:8080".to_owned()],
        }));
        round_trip(ScFrame::new(5, ScPayload::AddressResolutionAck { uris: vec![] }));
        round_trip(ScFrame::new(6, ScPayload::Advertisement {
            hub_status: 1,
            accepts_direct: true,
            max_bvlc_len: 4096,
            max_npdu_len: 1497,
        }));
        round_trip(ScFrame::new(7, ScPayload::AdvertisementSolicitation));
        let params = ConnectParams {
            vmac: VMAC_1,
            uuid: Uuid::from_bytes([0xAB; 16]),
            max_bvlc_len: 4096,
            max_npdu_len: 1497,
        };
        round_trip(ScFrame::new(8, ScPayload::ConnectRequest(params)));
        round_trip(ScFrame::new(9, ScPayload::ConnectAccept(params)));
        round_trip(ScFrame::new(10, ScPayload::DisconnectRequest));
        round_trip(ScFrame::new(11, ScPayload::DisconnectAck));
        round_trip(ScFrame::new(12, ScPayload::HeartbeatRequest));
        round_trip(ScFrame::new(13, ScPayload::HeartbeatAck));
        round_trip(ScFrame::new(14, ScPayload::Proprietary {
            vendor_id: 555,
            function: 9,
            data: vec![1, 2, 3],
        }));
    }

    #[test]
    fn header_options_round_trip() {
        let mut frame = ScFrame::new(20, ScPayload::EncapsulatedNpdu(vec![0xAA]));
        frame.dest_options = vec![HeaderOption { option_type: 1, data: vec![] }];
        frame.data_options = vec![
            HeaderOption { option_type: 2, data: vec![5, 6] },
            HeaderOption { option_type: 3, data: vec![7] },
        ];
        round_trip(frame);
    }

    #[test]
    fn option_data_cap() {
        let mut buf = vec![function::ENCAPSULATED_NPDU, FLAG_DATA_OPTIONS, 0, 1];
        buf.push(0x01);
        buf.extend_from_slice(&(MAX_OPTION_DATA as u16 + 1).to_be_bytes());
        buf.extend(std::iter::repeat(0).take(MAX_OPTION_DATA + 1));
        assert_matches!(ScFrame::decode(&buf), Err(DecodeError::LengthTooLarge(_)));
    }

    #[test]
    fn option_count_cap() {
        let mut buf = vec![function::ENCAPSULATED_NPDU, FLAG_DATA_OPTIONS, 0, 1];
        for _ in 0..(MAX_HEADER_OPTIONS + 1) {
            buf.push(0x01 | OPTION_MORE);
            buf.extend_from_slice(&0u16.to_be_bytes());
        }
        buf.push(0x01);
        buf.extend_from_slice(&0u16.to_be_bytes());
        assert_matches!(ScFrame::decode(&buf), Err(DecodeError::CountLimitExceeded));
    }

    #[test]
    fn uri_count_cap() {
        let uris = vec!["ws://h".to_owned(); MAX_RESOLUTION_URIS + 1];
        let frame = ScFrame::new(1, ScPayload::AddressResolutionAck { uris });
        let buf = frame.to_bytes();
        assert_matches!(ScFrame::decode(&buf), Err(DecodeError::CountLimitExceeded));
    }

    #[test]
    fn header_peek_skips_payload() {
        let frame = ScFrame::new(99, ScPayload::EncapsulatedNpdu(vec![0u8; 1024]))
            .with_origin(VMAC_1)
            .with_destination(SC_BROADCAST);
        let buf = frame.to_bytes();
        let header = ScHeader::peek(&buf).unwrap();
        assert_eq!(header.function, function::ENCAPSULATED_NPDU);
        assert_eq!(header.message_id, 99);
        assert_eq!(header.origin, Some(VMAC_1));
        assert!(header.is_broadcast());
    }

    #[test]
    fn truncated_frames() {
        assert_matches!(ScFrame::decode(&[0x0A, 0x00]), Err(DecodeError::Truncated));
        assert_matches!(
            ScFrame::decode(&[0x01, FLAG_ORIGIN_VMAC, 0, 1, 1, 2, 3]),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn unknown_function_rejected() {
        assert_matches!(
            ScFrame::decode(&[0x0D, 0x00, 0x00, 0x01]),
            Err(DecodeError::UnknownPduType(0x0D))
        );
    }
}
