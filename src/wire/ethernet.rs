// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Clause 7 framing: IEEE 802.3 with an 802.2 LLC header.
//!
//! `dst (6) | src (6) | length (u16 BE) | DSAP 0x82 | SSAP 0x82 | UI 0x03 |
//! NPDU`, where the length field counts the LLC header plus the NPDU.
//! Frames shorter than the 802.3 minimum are padded on encode and the
//! padding is stripped on decode using the length field.

use crate::error::{DecodeError, DecodeResult};
use crate::wire::{BufferReader, Encodable};

pub const ETHERNET_MAC_LEN: usize = 6;
const HEADER_LEN: usize = 14;
const LLC: [u8; 3] = [0x82, 0x82, 0x03];
/// Minimum 802.3 frame length without the frame check sequence.
const MIN_FRAME_LEN: usize = 60;
/// The length field is an 802.3 length, not an EtherType, so it must stay
/// below the EtherType range.
const MAX_LLC_LENGTH: usize = 1500;

pub const ETHERNET_BROADCAST: [u8; 6] = [0xFF; 6];

/// A BACnet Ethernet frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub npdu: Vec<u8>,
}

impl EthernetFrame {
    pub fn new(dst: [u8; 6], src: [u8; 6], npdu: Vec<u8>) -> EthernetFrame {
        EthernetFrame { dst, src, npdu }
    }

    /// Whether the NPDU fits the 802.3 length field.
    pub fn payload_fits(npdu_len: usize) -> bool {
        LLC.len() + npdu_len <= MAX_LLC_LENGTH
    }

    pub fn decode(buf: &[u8]) -> DecodeResult<EthernetFrame> {
        if buf.len() < MIN_FRAME_LEN {
            return Err(DecodeError::Truncated);
        }
        let mut r = BufferReader::new(buf);
        let dst: [u8; 6] = r.read_array()?;
        let src: [u8; 6] = r.read_array()?;
        let length = r.read_u16()? as usize;
        if length < LLC.len() || length > MAX_LLC_LENGTH || length > r.remaining() {
            return Err(DecodeError::OutOfRange);
        }
        let llc: [u8; 3] = r.read_array()?;
        if llc != LLC {
            return Err(DecodeError::InvalidTag);
        }
        let npdu = r.read_bytes(length - LLC.len())?.to_vec();
        // Whatever remains is 802.3 padding.
        Ok(EthernetFrame { dst, src, npdu })
    }
}

impl Encodable for EthernetFrame {
    fn encoded_len(&self) -> usize {
        (HEADER_LEN + LLC.len() + self.npdu.len()).max(MIN_FRAME_LEN)
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.dst);
        buf.extend_from_slice(&self.src);
        buf.extend_from_slice(&((LLC.len() + self.npdu.len()) as u16).to_be_bytes());
        buf.extend_from_slice(&LLC);
        buf.extend_from_slice(&self.npdu);
        let written = HEADER_LEN + LLC.len() + self.npdu.len();
        if written < MIN_FRAME_LEN {
            buf.resize(buf.len() + (MIN_FRAME_LEN - written), 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const DST: [u8; 6] = [0, 1, 2, 3, 4, 5];
    const SRC: [u8; 6] = [6, 7, 8, 9, 10, 11];

    #[test]
    fn short_frame_is_padded_and_recovered() {
        let frame = EthernetFrame::new(DST, SRC, vec![0x01, 0x00, 0xAA]);
        let buf = frame.to_bytes();
        assert_eq!(buf.len(), MIN_FRAME_LEN);
        assert_eq!(u16::from_be_bytes([buf[12], buf[13]]), 6);
        assert_eq!(&buf[14..17], &LLC);
        assert_eq!(EthernetFrame::decode(&buf).unwrap(), frame);
    }

    #[test]
    fn long_frame_is_not_padded() {
        let frame = EthernetFrame::new(DST, SRC, vec![0xAB; 100]);
        let buf = frame.to_bytes();
        assert_eq!(buf.len(), HEADER_LEN + 3 + 100);
        assert_eq!(EthernetFrame::decode(&buf).unwrap(), frame);
    }

    #[test]
    fn undersized_frames_rejected_before_length_parse() {
        let frame = EthernetFrame::new(DST, SRC, vec![0x01]);
        let mut buf = frame.to_bytes();
        buf.truncate(59);
        assert_matches!(EthernetFrame::decode(&buf), Err(DecodeError::Truncated));
    }

    #[test]
    fn rejects_ethertype_frames() {
        // 0x0800 (IPv4 EtherType) in the length field.
        let mut buf = EthernetFrame::new(DST, SRC, vec![0x01]).to_bytes();
        buf[12] = 0x08;
        buf[13] = 0x00;
        assert_matches!(EthernetFrame::decode(&buf), Err(DecodeError::OutOfRange));
    }

    #[test]
    fn rejects_wrong_llc() {
        let mut buf = EthernetFrame::new(DST, SRC, vec![0x01]).to_bytes();
        buf[14] = 0xAA;
        assert_matches!(EthernetFrame::decode(&buf), Err(DecodeError::InvalidTag));
    }

    #[test]
    fn rejects_length_past_buffer() {
        let mut buf = EthernetFrame::new(DST, SRC, vec![0x01]).to_bytes();
        buf[12] = 0x01;
        buf[13] = 0xF4; // claims 500 octets in a 60-octet frame
        assert_matches!(EthernetFrame::decode(&buf), Err(DecodeError::OutOfRange));
    }

    #[test]
    fn payload_fits_respects_llc_overhead() {
        assert!(EthernetFrame::payload_fits(1497));
        assert!(!EthernetFrame::payload_fits(1498));
    }
}
