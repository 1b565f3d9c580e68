// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Annex J BACnet Virtual Link Control frames for BACnet/IP over UDP/IPv4.
//!
//! Frame layout: `0x81 | function (u8) | length (u16 BE) | payload`, where
//! the length counts the whole frame including the four header octets.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{DecodeError, DecodeResult};
use crate::wire::{BufferReader, Decodable, Encodable};

pub const BVLC4_TYPE: u8 = 0x81;
const HEADER_LEN: usize = 4;
/// 6-octet B/IP address: IPv4 plus port.
const BIP_ADDR_LEN: usize = 6;

/// Result codes carried by BVLC-Result.
pub mod result_code {
    pub const SUCCESS: u16 = 0x0000;
    pub const WRITE_BDT_NAK: u16 = 0x0010;
    pub const READ_BDT_NAK: u16 = 0x0020;
    pub const REGISTER_FOREIGN_DEVICE_NAK: u16 = 0x0030;
    pub const READ_FDT_NAK: u16 = 0x0040;
    pub const DELETE_FDT_ENTRY_NAK: u16 = 0x0050;
    pub const DISTRIBUTE_BROADCAST_NAK: u16 = 0x0060;
}

mod function {
    pub const RESULT: u8 = 0x00;
    pub const WRITE_BDT: u8 = 0x01;
    pub const READ_BDT: u8 = 0x02;
    pub const READ_BDT_ACK: u8 = 0x03;
    pub const FORWARDED_NPDU: u8 = 0x04;
    pub const REGISTER_FOREIGN_DEVICE: u8 = 0x05;
    pub const READ_FDT: u8 = 0x06;
    pub const READ_FDT_ACK: u8 = 0x07;
    pub const DELETE_FDT_ENTRY: u8 = 0x08;
    pub const DISTRIBUTE_BROADCAST_TO_NETWORK: u8 = 0x09;
    pub const ORIGINAL_UNICAST_NPDU: u8 = 0x0A;
    pub const ORIGINAL_BROADCAST_NPDU: u8 = 0x0B;
}

/// One Broadcast Distribution Table entry: peer BBMD address plus the
/// distribution mask that selects directed versus local broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdtEntry {
    pub address: SocketAddrV4,
    pub mask: [u8; 4],
}

impl BdtEntry {
    /// An all-ones mask, meaning the peer re-broadcasts locally.
    pub fn unicast(address: SocketAddrV4) -> BdtEntry {
        BdtEntry { address, mask: [0xFF; 4] }
    }
}

/// One Foreign Device Table entry as carried by Read-FDT-Ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdtEntry {
    pub address: SocketAddrV4,
    pub ttl_seconds: u16,
    pub remaining_seconds: u16,
}

/// An Annex J frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bvlc4 {
    Result(u16),
    WriteBdt(Vec<BdtEntry>),
    ReadBdt,
    ReadBdtAck(Vec<BdtEntry>),
    ForwardedNpdu { origin: SocketAddrV4, npdu: Vec<u8> },
    RegisterForeignDevice { ttl_seconds: u16 },
    ReadFdt,
    ReadFdtAck(Vec<FdtEntry>),
    DeleteFdtEntry(SocketAddrV4),
    DistributeBroadcastToNetwork(Vec<u8>),
    OriginalUnicastNpdu(Vec<u8>),
    OriginalBroadcastNpdu(Vec<u8>),
}

fn put_bip_addr(buf: &mut Vec<u8>, addr: &SocketAddrV4) {
    buf.extend_from_slice(&addr.ip().octets());
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

fn read_bip_addr(r: &mut BufferReader<'_>) -> DecodeResult<SocketAddrV4> {
    let octets: [u8; 4] = r.read_array()?;
    let port = r.read_u16()?;
    Ok(SocketAddrV4::new(Ipv4Addr::from(octets), port))
}

impl Bvlc4 {
    fn function(&self) -> u8 {
        match self {
            Bvlc4::Result(_) => function::RESULT,
            Bvlc4::WriteBdt(_) => function::WRITE_BDT,
            Bvlc4::ReadBdt => function::READ_BDT,
            Bvlc4::ReadBdtAck(_) => function::READ_BDT_ACK,
            Bvlc4::ForwardedNpdu { .. } => function::FORWARDED_NPDU,
            Bvlc4::RegisterForeignDevice { .. } => function::REGISTER_FOREIGN_DEVICE,
            Bvlc4::ReadFdt => function::READ_FDT,
            Bvlc4::ReadFdtAck(_) => function::READ_FDT_ACK,
            Bvlc4::DeleteFdtEntry(_) => function::DELETE_FDT_ENTRY,
            Bvlc4::DistributeBroadcastToNetwork(_) => {
                function::DISTRIBUTE_BROADCAST_TO_NETWORK
            }
            Bvlc4::OriginalUnicastNpdu(_) => function::ORIGINAL_UNICAST_NPDU,
            Bvlc4::OriginalBroadcastNpdu(_) => function::ORIGINAL_BROADCAST_NPDU,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Bvlc4::Result(_) => 2,
            Bvlc4::WriteBdt(entries) | Bvlc4::ReadBdtAck(entries) => entries.len() * 10,
            Bvlc4::ReadBdt | Bvlc4::ReadFdt => 0,
            Bvlc4::ForwardedNpdu { npdu, .. } => BIP_ADDR_LEN + npdu.len(),
            Bvlc4::RegisterForeignDevice { .. } => 2,
            Bvlc4::ReadFdtAck(entries) => entries.len() * 10,
            Bvlc4::DeleteFdtEntry(_) => BIP_ADDR_LEN,
            Bvlc4::DistributeBroadcastToNetwork(npdu)
            | Bvlc4::OriginalUnicastNpdu(npdu)
            | Bvlc4::OriginalBroadcastNpdu(npdu) => npdu.len(),
        }
    }
}

impl Encodable for Bvlc4 {
    fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body_len()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(BVLC4_TYPE);
        buf.push(self.function());
        buf.extend_from_slice(&(self.encoded_len() as u16).to_be_bytes());
        match self {
            Bvlc4::Result(code) => buf.extend_from_slice(&code.to_be_bytes()),
            Bvlc4::WriteBdt(entries) | Bvlc4::ReadBdtAck(entries) => {
                for e in entries {
                    put_bip_addr(buf, &e.address);
                    buf.extend_from_slice(&e.mask);
                }
            }
            Bvlc4::ReadBdt | Bvlc4::ReadFdt => {}
            Bvlc4::ForwardedNpdu { origin, npdu } => {
                put_bip_addr(buf, origin);
                buf.extend_from_slice(npdu);
            }
            Bvlc4::RegisterForeignDevice { ttl_seconds } => {
                buf.extend_from_slice(&ttl_seconds.to_be_bytes())
            }
            Bvlc4::ReadFdtAck(entries) => {
                for e in entries {
                    put_bip_addr(buf, &e.address);
                    buf.extend_from_slice(&e.ttl_seconds.to_be_bytes());
                    buf.extend_from_slice(&e.remaining_seconds.to_be_bytes());
                }
            }
            Bvlc4::DeleteFdtEntry(addr) => put_bip_addr(buf, addr),
            Bvlc4::DistributeBroadcastToNetwork(npdu)
            | Bvlc4::OriginalUnicastNpdu(npdu)
            | Bvlc4::OriginalBroadcastNpdu(npdu) => buf.extend_from_slice(npdu),
        }
    }
}

impl Decodable for Bvlc4 {
    fn decode(buf: &[u8]) -> DecodeResult<Bvlc4> {
        let mut r = BufferReader::new(buf);
        if r.read_u8()? != BVLC4_TYPE {
            return Err(DecodeError::InvalidTag);
        }
        let func = r.read_u8()?;
        let length = r.read_u16()? as usize;
        if length != buf.len() || length < HEADER_LEN {
            return Err(DecodeError::Truncated);
        }
        Ok(match func {
            function::RESULT => Bvlc4::Result(r.read_u16()?),
            function::WRITE_BDT => Bvlc4::WriteBdt(read_bdt(&mut r)?),
            function::READ_BDT => Bvlc4::ReadBdt,
            function::READ_BDT_ACK => Bvlc4::ReadBdtAck(read_bdt(&mut r)?),
            function::FORWARDED_NPDU => Bvlc4::ForwardedNpdu {
                origin: read_bip_addr(&mut r)?,
                npdu: r.into_rest().to_vec(),
            },
            function::REGISTER_FOREIGN_DEVICE => {
                Bvlc4::RegisterForeignDevice { ttl_seconds: r.read_u16()? }
            }
            function::READ_FDT => Bvlc4::ReadFdt,
            function::READ_FDT_ACK => {
                let mut entries = Vec::new();
                while !r.is_empty() {
                    entries.push(FdtEntry {
                        address: read_bip_addr(&mut r)?,
                        ttl_seconds: r.read_u16()?,
                        remaining_seconds: r.read_u16()?,
                    });
                }
                Bvlc4::ReadFdtAck(entries)
            }
            function::DELETE_FDT_ENTRY => Bvlc4::DeleteFdtEntry(read_bip_addr(&mut r)?),
            function::DISTRIBUTE_BROADCAST_TO_NETWORK => {
                Bvlc4::DistributeBroadcastToNetwork(r.into_rest().to_vec())
            }
            function::ORIGINAL_UNICAST_NPDU => {
                Bvlc4::OriginalUnicastNpdu(r.into_rest().to_vec())
            }
            function::ORIGINAL_BROADCAST_NPDU => {
                Bvlc4::OriginalBroadcastNpdu(r.into_rest().to_vec())
            }
            other => return Err(DecodeError::UnknownPduType(other)),
        })
    }
}

fn read_bdt(r: &mut BufferReader<'_>) -> DecodeResult<Vec<BdtEntry>> {
    let mut entries = Vec::new();
    while !r.is_empty() {
        let address = read_bip_addr(r)?;
        let mask: [u8; 4] = r.read_array()?;
        entries.push(BdtEntry { address, mask });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn addr(d: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, d), port)
    }

    fn round_trip(frame: Bvlc4) -> Vec<u8> {
        let buf = frame.to_bytes();
        assert_eq!(buf.len(), frame.encoded_len());
        let decoded = Bvlc4::decode(&buf).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.to_bytes(), buf);
        buf
    }

    #[test]
    fn unicast_npdu_wire_form() {
        let buf = round_trip(Bvlc4::OriginalUnicastNpdu(vec![0x01, 0x04, 0xAA]));
        assert_eq!(buf, [0x81, 0x0A, 0x00, 0x07, 0x01, 0x04, 0xAA]);
    }

    #[test]
    fn all_functions_round_trip() {
        round_trip(Bvlc4::Result(result_code::WRITE_BDT_NAK));
        round_trip(Bvlc4::WriteBdt(vec![BdtEntry::unicast(addr(1, 47808))]));
        round_trip(Bvlc4::ReadBdt);
        round_trip(Bvlc4::ReadBdtAck(vec![
            BdtEntry::unicast(addr(1, 47808)),
            BdtEntry { address: addr(2, 47809), mask: [255, 255, 255, 0] },
        ]));
        round_trip(Bvlc4::ForwardedNpdu { origin: addr(9, 47808), npdu: vec![0x01, 0x00] });
        round_trip(Bvlc4::RegisterForeignDevice { ttl_seconds: 60 });
        round_trip(Bvlc4::ReadFdt);
        round_trip(Bvlc4::ReadFdtAck(vec![FdtEntry {
            address: addr(7, 47808),
            ttl_seconds: 60,
            remaining_seconds: 42,
        }]));
        round_trip(Bvlc4::DeleteFdtEntry(addr(7, 47808)));
        round_trip(Bvlc4::DistributeBroadcastToNetwork(vec![0x01, 0x00]));
        round_trip(Bvlc4::OriginalBroadcastNpdu(vec![0x01, 0x00]));
    }

    #[test]
    fn length_field_must_match() {
        let mut buf = Bvlc4::ReadBdt.to_bytes();
        buf.push(0x00);
        assert_matches!(Bvlc4::decode(&buf), Err(DecodeError::Truncated));
        let buf = [0x81, 0x02, 0x00, 0x03];
        assert_matches!(Bvlc4::decode(&buf), Err(DecodeError::Truncated));
    }

    #[test]
    fn rejects_foreign_type_octet() {
        assert_matches!(
            Bvlc4::decode(&[0x82, 0x0A, 0x00, 0x04]),
            Err(DecodeError::InvalidTag)
        );
    }

    #[test]
    fn rejects_unknown_function() {
        assert_matches!(
            Bvlc4::decode(&[0x81, 0x0C, 0x00, 0x04]),
            Err(DecodeError::UnknownPduType(0x0C))
        );
    }

    #[test]
    fn undersized_frame_is_truncated() {
        assert_matches!(Bvlc4::decode(&[0x81, 0x0A]), Err(DecodeError::Truncated));
    }
}
