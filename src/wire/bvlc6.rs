// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Annex U BVLL frames for BACnet/IPv6.
//!
//! The frame is `0x82 | function (u8) | length (u16 BE) | body`. Stations
//! are addressed by 3-octet virtual MACs; every function's body begins with
//! the sender's VMAC. Where a concrete transport address appears (forwarding,
//! foreign devices) it is the 18-octet B/IPv6 form: 16 address octets plus
//! the port.

use std::net::{Ipv6Addr, SocketAddrV6};

use crate::error::{DecodeError, DecodeResult};
use crate::wire::{BufferReader, Decodable, Encodable};

pub const BVLC6_TYPE: u8 = 0x82;
const HEADER_LEN: usize = 4;

/// A 3-octet Annex U virtual MAC.
pub type Vmac6 = [u8; 3];

/// Result codes carried by BVLC-Result.
pub mod result_code {
    pub const SUCCESS: u16 = 0x0000;
    pub const ADDRESS_RESOLUTION_NAK: u16 = 0x0030;
    pub const VIRTUAL_ADDRESS_RESOLUTION_NAK: u16 = 0x0060;
    pub const REGISTER_FOREIGN_DEVICE_NAK: u16 = 0x0090;
    pub const DELETE_FDT_ENTRY_NAK: u16 = 0x00A0;
    pub const DISTRIBUTE_BROADCAST_NAK: u16 = 0x00B0;
}

mod function {
    pub const RESULT: u8 = 0x00;
    pub const ORIGINAL_UNICAST_NPDU: u8 = 0x01;
    pub const ORIGINAL_BROADCAST_NPDU: u8 = 0x02;
    pub const ADDRESS_RESOLUTION: u8 = 0x03;
    pub const FORWARDED_ADDRESS_RESOLUTION: u8 = 0x04;
    pub const ADDRESS_RESOLUTION_ACK: u8 = 0x05;
    pub const VIRTUAL_ADDRESS_RESOLUTION: u8 = 0x06;
    pub const VIRTUAL_ADDRESS_RESOLUTION_ACK: u8 = 0x07;
    pub const FORWARDED_NPDU: u8 = 0x08;
    pub const REGISTER_FOREIGN_DEVICE: u8 = 0x09;
    pub const DELETE_FDT_ENTRY: u8 = 0x0A;
    pub const SECURE_BVLL: u8 = 0x0B;
    pub const DISTRIBUTE_BROADCAST_TO_NETWORK: u8 = 0x0C;
}

/// An Annex U frame. `vmac` is always the original sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bvlc6 {
    Result { vmac: Vmac6, code: u16 },
    OriginalUnicastNpdu { vmac: Vmac6, dest_vmac: Vmac6, npdu: Vec<u8> },
    OriginalBroadcastNpdu { vmac: Vmac6, npdu: Vec<u8> },
    AddressResolution { vmac: Vmac6, target_vmac: Vmac6 },
    ForwardedAddressResolution { vmac: Vmac6, target_vmac: Vmac6, origin: SocketAddrV6 },
    AddressResolutionAck { vmac: Vmac6, dest_vmac: Vmac6 },
    VirtualAddressResolution { vmac: Vmac6 },
    VirtualAddressResolutionAck { vmac: Vmac6, dest_vmac: Vmac6 },
    ForwardedNpdu { vmac: Vmac6, origin: SocketAddrV6, npdu: Vec<u8> },
    RegisterForeignDevice { vmac: Vmac6, ttl_seconds: u16 },
    DeleteFdtEntry { vmac: Vmac6, entry: SocketAddrV6 },
    SecureBvll { vmac: Vmac6, payload: Vec<u8> },
    DistributeBroadcastToNetwork { vmac: Vmac6, npdu: Vec<u8> },
}

fn put_bip6_addr(buf: &mut Vec<u8>, addr: &SocketAddrV6) {
    buf.extend_from_slice(&addr.ip().octets());
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

fn read_bip6_addr(r: &mut BufferReader<'_>) -> DecodeResult<SocketAddrV6> {
    let octets: [u8; 16] = r.read_array()?;
    let port = r.read_u16()?;
    Ok(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
}

impl Bvlc6 {
    /// The sender VMAC every function carries.
    pub fn source_vmac(&self) -> Vmac6 {
        match self {
            Bvlc6::Result { vmac, .. }
            | Bvlc6::OriginalUnicastNpdu { vmac, .. }
            | Bvlc6::OriginalBroadcastNpdu { vmac, .. }
            | Bvlc6::AddressResolution { vmac, .. }
            | Bvlc6::ForwardedAddressResolution { vmac, .. }
            | Bvlc6::AddressResolutionAck { vmac, .. }
            | Bvlc6::VirtualAddressResolution { vmac }
            | Bvlc6::VirtualAddressResolutionAck { vmac, .. }
            | Bvlc6::ForwardedNpdu { vmac, .. }
            | Bvlc6::RegisterForeignDevice { vmac, .. }
            | Bvlc6::DeleteFdtEntry { vmac, .. }
            | Bvlc6::SecureBvll { vmac, .. }
            | Bvlc6::DistributeBroadcastToNetwork { vmac, .. } => *vmac,
        }
    }

    fn function(&self) -> u8 {
        match self {
            Bvlc6::Result { .. } => function::RESULT,
            Bvlc6::OriginalUnicastNpdu { .. } => function::ORIGINAL_UNICAST_NPDU,
            Bvlc6::OriginalBroadcastNpdu { .. } => function::ORIGINAL_BROADCAST_NPDU,
            Bvlc6::AddressResolution { .. } => function::ADDRESS_RESOLUTION,
            Bvlc6::ForwardedAddressResolution { .. } => function::FORWARDED_ADDRESS_RESOLUTION,
            Bvlc6::AddressResolutionAck { .. } => function::ADDRESS_RESOLUTION_ACK,
            Bvlc6::VirtualAddressResolution { .. } => function::VIRTUAL_ADDRESS_RESOLUTION,
            Bvlc6::VirtualAddressResolutionAck { .. } => {
                function::VIRTUAL_ADDRESS_RESOLUTION_ACK
            }
            Bvlc6::ForwardedNpdu { .. } => function::FORWARDED_NPDU,
            Bvlc6::RegisterForeignDevice { .. } => function::REGISTER_FOREIGN_DEVICE,
            Bvlc6::DeleteFdtEntry { .. } => function::DELETE_FDT_ENTRY,
            Bvlc6::SecureBvll { .. } => function::SECURE_BVLL,
            Bvlc6::DistributeBroadcastToNetwork { .. } => {
                function::DISTRIBUTE_BROADCAST_TO_NETWORK
            }
        }
    }

    fn body_len(&self) -> usize {
        3 + match self {
            Bvlc6::Result { .. } => 2,
            Bvlc6::OriginalUnicastNpdu { npdu, .. } => 3 + npdu.len(),
            Bvlc6::OriginalBroadcastNpdu { npdu, .. } => npdu.len(),
            Bvlc6::AddressResolution { .. } => 3,
            Bvlc6::ForwardedAddressResolution { .. } => 3 + 18,
            Bvlc6::AddressResolutionAck { .. } => 3,
            Bvlc6::VirtualAddressResolution { .. } => 0,
            Bvlc6::VirtualAddressResolutionAck { .. } => 3,
            Bvlc6::ForwardedNpdu { npdu, .. } => 18 + npdu.len(),
            Bvlc6::RegisterForeignDevice { .. } => 2,
            Bvlc6::DeleteFdtEntry { .. } => 18,
            Bvlc6::SecureBvll { payload, .. } => payload.len(),
            Bvlc6::DistributeBroadcastToNetwork { npdu, .. } => npdu.len(),
        }
    }
}

impl Encodable for Bvlc6 {
    fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body_len()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(BVLC6_TYPE);
        buf.push(self.function());
        buf.extend_from_slice(&(self.encoded_len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.source_vmac());
        match self {
            Bvlc6::Result { code, .. } => buf.extend_from_slice(&code.to_be_bytes()),
            Bvlc6::OriginalUnicastNpdu { dest_vmac, npdu, .. } => {
                buf.extend_from_slice(dest_vmac);
                buf.extend_from_slice(npdu);
            }
            Bvlc6::OriginalBroadcastNpdu { npdu, .. } => buf.extend_from_slice(npdu),
            Bvlc6::AddressResolution { target_vmac, .. } => {
                buf.extend_from_slice(target_vmac)
            }
            Bvlc6::ForwardedAddressResolution { target_vmac, origin, .. } => {
                buf.extend_from_slice(target_vmac);
                put_bip6_addr(buf, origin);
            }
            Bvlc6::AddressResolutionAck { dest_vmac, .. }
            | Bvlc6::VirtualAddressResolutionAck { dest_vmac, .. } => {
                buf.extend_from_slice(dest_vmac)
            }
            Bvlc6::VirtualAddressResolution { .. } => {}
            Bvlc6::ForwardedNpdu { origin, npdu, .. } => {
                put_bip6_addr(buf, origin);
                buf.extend_from_slice(npdu);
            }
            Bvlc6::RegisterForeignDevice { ttl_seconds, .. } => {
                buf.extend_from_slice(&ttl_seconds.to_be_bytes())
            }
            Bvlc6::DeleteFdtEntry { entry, .. } => put_bip6_addr(buf, entry),
            Bvlc6::SecureBvll { payload, .. } => buf.extend_from_slice(payload),
            Bvlc6::DistributeBroadcastToNetwork { npdu, .. } => buf.extend_from_slice(npdu),
        }
    }
}

impl Decodable for Bvlc6 {
    fn decode(buf: &[u8]) -> DecodeResult<Bvlc6> {
        let mut r = BufferReader::new(buf);
        if r.read_u8()? != BVLC6_TYPE {
            return Err(DecodeError::InvalidTag);
        }
        let func = r.read_u8()?;
        let length = r.read_u16()? as usize;
        if length != buf.len() || length < HEADER_LEN + 3 {
            return Err(DecodeError::Truncated);
        }
        let vmac: Vmac6 = r.read_array()?;
        Ok(match func {
            function::RESULT => Bvlc6::Result { vmac, code: r.read_u16()? },
            function::ORIGINAL_UNICAST_NPDU => Bvlc6::OriginalUnicastNpdu {
                vmac,
                dest_vmac: r.read_array()?,
                npdu: r.into_rest().to_vec(),
            },
            function::ORIGINAL_BROADCAST_NPDU => {
                Bvlc6::OriginalBroadcastNpdu { vmac, npdu: r.into_rest().to_vec() }
            }
            function::ADDRESS_RESOLUTION => {
                Bvlc6::AddressResolution { vmac, target_vmac: r.read_array()? }
            }
            function::FORWARDED_ADDRESS_RESOLUTION => Bvlc6::ForwardedAddressResolution {
                vmac,
                target_vmac: r.read_array()?,
                origin: read_bip6_addr(&mut r)?,
            },
            function::ADDRESS_RESOLUTION_ACK => {
                Bvlc6::AddressResolutionAck { vmac, dest_vmac: r.read_array()? }
            }
            function::VIRTUAL_ADDRESS_RESOLUTION => Bvlc6::VirtualAddressResolution { vmac },
            function::VIRTUAL_ADDRESS_RESOLUTION_ACK => {
                Bvlc6::VirtualAddressResolutionAck { vmac, dest_vmac: r.read_array()? }
            }
            function::FORWARDED_NPDU => Bvlc6::ForwardedNpdu {
                vmac,
                origin: read_bip6_addr(&mut r)?,
                npdu: r.into_rest().to_vec(),
            },
            function::REGISTER_FOREIGN_DEVICE => {
                Bvlc6::RegisterForeignDevice { vmac, ttl_seconds: r.read_u16()? }
            }
            function::DELETE_FDT_ENTRY => {
                Bvlc6::DeleteFdtEntry { vmac, entry: read_bip6_addr(&mut r)? }
            }
            function::SECURE_BVLL => {
                Bvlc6::SecureBvll { vmac, payload: r.into_rest().to_vec() }
            }
            function::DISTRIBUTE_BROADCAST_TO_NETWORK => {
                Bvlc6::DistributeBroadcastToNetwork { vmac, npdu: r.into_rest().to_vec() }
            }
            other => return Err(DecodeError::UnknownPduType(other)),
        })
    }
}
