// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NPDU header and the Clause 6 network-layer messages.

use crate::addr::{Address, MacAddr};
use crate::error::{DecodeError, DecodeResult};
use crate::types::limits::MAX_NETWORK_LIST;
use crate::types::NetworkPriority;
use crate::wire::BufferReader;

pub const NPDU_VERSION: u8 = 0x01;

const CONTROL_NETWORK_MESSAGE: u8 = 0x80;
const CONTROL_DESTINATION: u8 = 0x20;
const CONTROL_SOURCE: u8 = 0x08;
const CONTROL_EXPECTING_REPLY: u8 = 0x04;

/// Reasons carried by Reject-Message-To-Network.
pub mod reject_reason {
    pub const OTHER: u8 = 0;
    pub const NOT_DIRECTLY_CONNECTED: u8 = 1;
    pub const ROUTER_BUSY: u8 = 2;
    pub const UNKNOWN_MESSAGE_TYPE: u8 = 3;
    pub const MESSAGE_TOO_LONG: u8 = 4;
    pub const SECURITY_ERROR: u8 = 5;
    pub const ADDRESSING_ERROR: u8 = 6;
    pub const HOP_COUNT_EXCEEDED: u8 = 7;
}

/// A decoded NPDU header. The payload (APDU octets or a network-message
/// body) is returned alongside by [`Npdu::decode`] and supplied separately
/// to [`Npdu::encode_with`], so routed frames can be forwarded without
/// copying their payload into an intermediate value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Npdu {
    pub priority: NetworkPriority,
    pub expecting_reply: bool,
    /// DNET/DLEN/DADR. A broadcast MAC with a concrete network is a remote
    /// broadcast; network 0xFFFF is the global broadcast.
    pub destination: Option<Address>,
    /// SNET/SLEN/SADR as reported by the first router on the path.
    pub source: Option<Address>,
    pub hop_count: Option<u8>,
    /// `Some((message_type, vendor_id))` when the payload is a network
    /// message rather than an APDU. The vendor id accompanies proprietary
    /// message types (0x80 and above).
    pub network_message: Option<(u8, Option<u16>)>,
}

impl Npdu {
    /// Plain application NPDU addressed to the local network.
    pub fn application(expecting_reply: bool, priority: NetworkPriority) -> Npdu {
        Npdu { priority, expecting_reply, ..Default::default() }
    }

    /// Network-message NPDU.
    pub fn network(message_type: u8) -> Npdu {
        Npdu {
            network_message: Some((message_type, None)),
            ..Default::default()
        }
    }

    pub fn is_network_message(&self) -> bool {
        self.network_message.is_some()
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = 2;
        if let Some(dest) = &self.destination {
            len += 3 + dest.mac.len();
        }
        if let Some(src) = &self.source {
            len += 3 + src.mac.len();
        }
        if self.hop_count.is_some() {
            len += 1;
        }
        if let Some((_, vendor)) = &self.network_message {
            len += 1 + if vendor.is_some() { 2 } else { 0 };
        }
        len
    }

    fn control(&self) -> u8 {
        let mut control = self.priority as u8;
        if self.network_message.is_some() {
            control |= CONTROL_NETWORK_MESSAGE;
        }
        if self.destination.is_some() {
            control |= CONTROL_DESTINATION;
        }
        if self.source.is_some() {
            control |= CONTROL_SOURCE;
        }
        if self.expecting_reply {
            control |= CONTROL_EXPECTING_REPLY;
        }
        control
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(NPDU_VERSION);
        buf.push(self.control());
        if let Some(dest) = &self.destination {
            buf.extend_from_slice(&dest.network.to_be_bytes());
            buf.push(dest.mac.len() as u8);
            buf.extend_from_slice(dest.mac.as_bytes());
        }
        if let Some(src) = &self.source {
            buf.extend_from_slice(&src.network.to_be_bytes());
            buf.push(src.mac.len() as u8);
            buf.extend_from_slice(src.mac.as_bytes());
        }
        if let Some(hops) = self.hop_count {
            buf.push(hops);
        }
        if let Some((message_type, vendor)) = &self.network_message {
            buf.push(*message_type);
            if let Some(vendor) = vendor {
                buf.extend_from_slice(&vendor.to_be_bytes());
            }
        }
    }

    /// Header plus payload in one pre-sized buffer.
    pub fn encode_with(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len() + payload.len());
        self.encode(&mut buf);
        buf.extend_from_slice(payload);
        buf
    }

    /// Decodes the header, returning it and the payload that follows.
    pub fn decode(buf: &[u8]) -> DecodeResult<(Npdu, &[u8])> {
        let mut r = BufferReader::new(buf);
        let version = r.read_u8()?;
        if version != NPDU_VERSION {
            return Err(DecodeError::UnknownPduType(version));
        }
        let control = r.read_u8()?;
        let mut npdu = Npdu {
            priority: NetworkPriority::from_bits(control),
            expecting_reply: control & CONTROL_EXPECTING_REPLY != 0,
            ..Default::default()
        };
        if control & CONTROL_DESTINATION != 0 {
            npdu.destination = Some(read_spec_address(&mut r)?);
        }
        if control & CONTROL_SOURCE != 0 {
            let source = read_spec_address(&mut r)?;
            // A source with a broadcast MAC or broadcast network is nonsense.
            if source.mac.is_broadcast() || source.is_global_broadcast() {
                return Err(DecodeError::OutOfRange);
            }
            npdu.source = Some(source);
        }
        if npdu.destination.is_some() {
            npdu.hop_count = Some(r.read_u8()?);
        }
        if control & CONTROL_NETWORK_MESSAGE != 0 {
            let message_type = r.read_u8()?;
            let vendor = if message_type >= 0x80 { Some(r.read_u16()?) } else { None };
            npdu.network_message = Some((message_type, vendor));
        }
        Ok((npdu, r.into_rest()))
    }
}

fn read_spec_address(r: &mut BufferReader<'_>) -> DecodeResult<Address> {
    let network = r.read_u16()?;
    let len = r.read_u8()? as usize;
    if len > 8 {
        return Err(DecodeError::OutOfRange);
    }
    let mac = MacAddr::new(r.read_bytes(len)?).unwrap();
    Ok(Address::new(network, mac))
}

/// Network-message type codes (Clause 6.2.4).
pub mod message_type {
    pub const WHO_IS_ROUTER_TO_NETWORK: u8 = 0x00;
    pub const I_AM_ROUTER_TO_NETWORK: u8 = 0x01;
    pub const I_COULD_BE_ROUTER_TO_NETWORK: u8 = 0x02;
    pub const REJECT_MESSAGE_TO_NETWORK: u8 = 0x03;
    pub const ROUTER_BUSY_TO_NETWORK: u8 = 0x04;
    pub const ROUTER_AVAILABLE_TO_NETWORK: u8 = 0x05;
    pub const INITIALIZE_ROUTING_TABLE: u8 = 0x06;
    pub const INITIALIZE_ROUTING_TABLE_ACK: u8 = 0x07;
    pub const ESTABLISH_CONNECTION_TO_NETWORK: u8 = 0x08;
    pub const DISCONNECT_CONNECTION_TO_NETWORK: u8 = 0x09;
    pub const WHAT_IS_NETWORK_NUMBER: u8 = 0x12;
    pub const NETWORK_NUMBER_IS: u8 = 0x13;
}

/// One port entry in an Initialize-Routing-Table exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTableEntry {
    pub network: u16,
    pub port_id: u8,
    pub port_info: Vec<u8>,
}

/// The Clause 6 network messages the stack speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    /// Empty network asks about every network.
    WhoIsRouterToNetwork(Option<u16>),
    IAmRouterToNetwork(Vec<u16>),
    ICouldBeRouterToNetwork { network: u16, performance_index: u8 },
    RejectMessageToNetwork { reason: u8, network: u16 },
    RouterBusyToNetwork(Vec<u16>),
    RouterAvailableToNetwork(Vec<u16>),
    InitializeRoutingTable(Vec<RoutingTableEntry>),
    InitializeRoutingTableAck(Vec<RoutingTableEntry>),
    EstablishConnectionToNetwork { network: u16, termination_time: u8 },
    DisconnectConnectionToNetwork(u16),
    WhatIsNetworkNumber,
    NetworkNumberIs { network: u16, configured: bool },
    /// Proprietary or unknown-but-forwardable message, kept verbatim.
    Proprietary { message_type: u8, vendor_id: u16, body: Vec<u8> },
}

impl NetworkMessage {
    pub fn message_type(&self) -> u8 {
        use message_type::*;
        match self {
            NetworkMessage::WhoIsRouterToNetwork(_) => WHO_IS_ROUTER_TO_NETWORK,
            NetworkMessage::IAmRouterToNetwork(_) => I_AM_ROUTER_TO_NETWORK,
            NetworkMessage::ICouldBeRouterToNetwork { .. } => I_COULD_BE_ROUTER_TO_NETWORK,
            NetworkMessage::RejectMessageToNetwork { .. } => REJECT_MESSAGE_TO_NETWORK,
            NetworkMessage::RouterBusyToNetwork(_) => ROUTER_BUSY_TO_NETWORK,
            NetworkMessage::RouterAvailableToNetwork(_) => ROUTER_AVAILABLE_TO_NETWORK,
            NetworkMessage::InitializeRoutingTable(_) => INITIALIZE_ROUTING_TABLE,
            NetworkMessage::InitializeRoutingTableAck(_) => INITIALIZE_ROUTING_TABLE_ACK,
            NetworkMessage::EstablishConnectionToNetwork { .. } => {
                ESTABLISH_CONNECTION_TO_NETWORK
            }
            NetworkMessage::DisconnectConnectionToNetwork(_) => {
                DISCONNECT_CONNECTION_TO_NETWORK
            }
            NetworkMessage::WhatIsNetworkNumber => WHAT_IS_NETWORK_NUMBER,
            NetworkMessage::NetworkNumberIs { .. } => NETWORK_NUMBER_IS,
            NetworkMessage::Proprietary { message_type, .. } => *message_type,
        }
    }

    pub fn vendor_id(&self) -> Option<u16> {
        match self {
            NetworkMessage::Proprietary { vendor_id, .. } => Some(*vendor_id),
            _ => None,
        }
    }

    /// Message body only; the type octet lives in the NPDU header.
    pub fn encode_body(&self, buf: &mut Vec<u8>) {
        match self {
            NetworkMessage::WhoIsRouterToNetwork(network) => {
                if let Some(network) = network {
                    buf.extend_from_slice(&network.to_be_bytes());
                }
            }
            NetworkMessage::IAmRouterToNetwork(nets)
            | NetworkMessage::RouterBusyToNetwork(nets)
            | NetworkMessage::RouterAvailableToNetwork(nets) => {
                for net in nets {
                    buf.extend_from_slice(&net.to_be_bytes());
                }
            }
            NetworkMessage::ICouldBeRouterToNetwork { network, performance_index } => {
                buf.extend_from_slice(&network.to_be_bytes());
                buf.push(*performance_index);
            }
            NetworkMessage::RejectMessageToNetwork { reason, network } => {
                buf.push(*reason);
                buf.extend_from_slice(&network.to_be_bytes());
            }
            NetworkMessage::InitializeRoutingTable(entries)
            | NetworkMessage::InitializeRoutingTableAck(entries) => {
                buf.push(entries.len() as u8);
                for e in entries {
                    buf.extend_from_slice(&e.network.to_be_bytes());
                    buf.push(e.port_id);
                    buf.push(e.port_info.len() as u8);
                    buf.extend_from_slice(&e.port_info);
                }
            }
            NetworkMessage::EstablishConnectionToNetwork { network, termination_time } => {
                buf.extend_from_slice(&network.to_be_bytes());
                buf.push(*termination_time);
            }
            NetworkMessage::DisconnectConnectionToNetwork(network) => {
                buf.extend_from_slice(&network.to_be_bytes());
            }
            NetworkMessage::WhatIsNetworkNumber => {}
            NetworkMessage::NetworkNumberIs { network, configured } => {
                buf.extend_from_slice(&network.to_be_bytes());
                buf.push(*configured as u8);
            }
            NetworkMessage::Proprietary { body, .. } => buf.extend_from_slice(body),
        }
    }

    pub fn decode_body(
        message_type: u8,
        vendor_id: Option<u16>,
        body: &[u8],
    ) -> DecodeResult<NetworkMessage> {
        use message_type::*;
        let mut r = BufferReader::new(body);
        let msg = match message_type {
            WHO_IS_ROUTER_TO_NETWORK => {
                let network = if r.is_empty() { None } else { Some(r.read_u16()?) };
                NetworkMessage::WhoIsRouterToNetwork(network)
            }
            I_AM_ROUTER_TO_NETWORK => {
                NetworkMessage::IAmRouterToNetwork(read_network_list(&mut r)?)
            }
            I_COULD_BE_ROUTER_TO_NETWORK => NetworkMessage::ICouldBeRouterToNetwork {
                network: r.read_u16()?,
                performance_index: r.read_u8()?,
            },
            REJECT_MESSAGE_TO_NETWORK => NetworkMessage::RejectMessageToNetwork {
                reason: r.read_u8()?,
                network: r.read_u16()?,
            },
            ROUTER_BUSY_TO_NETWORK => {
                NetworkMessage::RouterBusyToNetwork(read_network_list(&mut r)?)
            }
            ROUTER_AVAILABLE_TO_NETWORK => {
                NetworkMessage::RouterAvailableToNetwork(read_network_list(&mut r)?)
            }
            INITIALIZE_ROUTING_TABLE => {
                NetworkMessage::InitializeRoutingTable(read_routing_entries(&mut r)?)
            }
            INITIALIZE_ROUTING_TABLE_ACK => {
                NetworkMessage::InitializeRoutingTableAck(read_routing_entries(&mut r)?)
            }
            ESTABLISH_CONNECTION_TO_NETWORK => NetworkMessage::EstablishConnectionToNetwork {
                network: r.read_u16()?,
                termination_time: r.read_u8()?,
            },
            DISCONNECT_CONNECTION_TO_NETWORK => {
                NetworkMessage::DisconnectConnectionToNetwork(r.read_u16()?)
            }
            WHAT_IS_NETWORK_NUMBER => NetworkMessage::WhatIsNetworkNumber,
            NETWORK_NUMBER_IS => NetworkMessage::NetworkNumberIs {
                network: r.read_u16()?,
                configured: r.read_u8()? == 1,
            },
            other if other >= 0x80 => {
                return Ok(NetworkMessage::Proprietary {
                    message_type: other,
                    vendor_id: vendor_id.ok_or(DecodeError::Truncated)?,
                    body: body.to_vec(),
                });
            }
            other => return Err(DecodeError::UnknownPduType(other)),
        };
        if !matches!(msg, NetworkMessage::Proprietary { .. }) && !r.is_empty() {
            return Err(DecodeError::OutOfRange);
        }
        Ok(msg)
    }

    /// Header-and-body pair for this message, local-destination form.
    pub fn to_npdu(&self) -> (Npdu, Vec<u8>) {
        let mut npdu = Npdu::network(self.message_type());
        if let Some(vendor) = self.vendor_id() {
            npdu.network_message = Some((self.message_type(), Some(vendor)));
        }
        let mut body = Vec::new();
        self.encode_body(&mut body);
        (npdu, body)
    }
}

fn read_network_list(r: &mut BufferReader<'_>) -> DecodeResult<Vec<u16>> {
    if r.remaining() % 2 != 0 {
        return Err(DecodeError::OutOfRange);
    }
    let count = r.remaining() / 2;
    if count > MAX_NETWORK_LIST {
        return Err(DecodeError::CountLimitExceeded);
    }
    let mut nets = Vec::with_capacity(count);
    while !r.is_empty() {
        nets.push(r.read_u16()?);
    }
    Ok(nets)
}

fn read_routing_entries(r: &mut BufferReader<'_>) -> DecodeResult<Vec<RoutingTableEntry>> {
    let count = r.read_u8()? as usize;
    let mut entries = Vec::with_capacity(count.min(MAX_NETWORK_LIST));
    for _ in 0..count {
        let network = r.read_u16()?;
        let port_id = r.read_u8()?;
        let info_len = r.read_u8()? as usize;
        let port_info = r.read_bytes(info_len)?.to_vec();
        entries.push(RoutingTableEntry { network, port_id, port_info });
    }
    if !r.is_empty() {
        return Err(DecodeError::OutOfRange);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn round_trip_npdu(npdu: Npdu, payload: &[u8]) -> Vec<u8> {
        let buf = npdu.encode_with(payload);
        assert_eq!(buf.len(), npdu.encoded_len() + payload.len());
        let (decoded, rest) = Npdu::decode(&buf).unwrap();
        assert_eq!(decoded, npdu);
        assert_eq!(rest, payload);
        buf
    }

    #[test]
    fn minimal_application_npdu() {
        let npdu = Npdu::application(true, NetworkPriority::Normal);
        let buf = round_trip_npdu(npdu, &[0xAA, 0xBB]);
        assert_eq!(buf, [0x01, 0x04, 0xAA, 0xBB]);
    }

    #[test]
    fn routed_npdu_with_both_addresses() {
        let npdu = Npdu {
            priority: NetworkPriority::Urgent,
            expecting_reply: false,
            destination: Some(Address::new(5, MacAddr::new(&[0x0A]).unwrap())),
            source: Some(Address::new(2, MacAddr::new(&[1, 2, 3, 4, 5, 6]).unwrap())),
            hop_count: Some(254),
            network_message: None,
        };
        round_trip_npdu(npdu, b"apdu");
    }

    #[test]
    fn global_broadcast_destination() {
        let npdu = Npdu {
            destination: Some(Address::GLOBAL_BROADCAST),
            hop_count: Some(255),
            ..Default::default()
        };
        let buf = round_trip_npdu(npdu, &[]);
        // version, control(dest), DNET=FFFF, DLEN=0, hop count
        assert_eq!(buf, [0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF]);
    }

    #[test]
    fn rejects_wrong_version() {
        assert_matches!(Npdu::decode(&[0x02, 0x00]), Err(DecodeError::UnknownPduType(2)));
    }

    #[test]
    fn rejects_broadcast_source() {
        // control says source present, SNET=1 with zero-length (broadcast) MAC.
        let buf = [0x01, 0x08, 0x00, 0x01, 0x00];
        assert_matches!(Npdu::decode(&buf), Err(DecodeError::OutOfRange));
    }

    fn round_trip_message(msg: NetworkMessage) {
        let mut body = Vec::new();
        msg.encode_body(&mut body);
        let decoded =
            NetworkMessage::decode_body(msg.message_type(), msg.vendor_id(), &body).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn network_message_round_trips() {
        round_trip_message(NetworkMessage::WhoIsRouterToNetwork(None));
        round_trip_message(NetworkMessage::WhoIsRouterToNetwork(Some(7)));
        round_trip_message(NetworkMessage::IAmRouterToNetwork(vec![1, 2, 300]));
        round_trip_message(NetworkMessage::ICouldBeRouterToNetwork {
            network: 9,
            performance_index: 3,
        });
        round_trip_message(NetworkMessage::RejectMessageToNetwork {
            reason: reject_reason::HOP_COUNT_EXCEEDED,
            network: 44,
        });
        round_trip_message(NetworkMessage::RouterBusyToNetwork(vec![5]));
        round_trip_message(NetworkMessage::RouterAvailableToNetwork(vec![5, 6]));
        round_trip_message(NetworkMessage::InitializeRoutingTable(vec![RoutingTableEntry {
            network: 3,
            port_id: 1,
            port_info: vec![],
        }]));
        round_trip_message(NetworkMessage::InitializeRoutingTableAck(vec![]));
        round_trip_message(NetworkMessage::EstablishConnectionToNetwork {
            network: 8,
            termination_time: 60,
        });
        round_trip_message(NetworkMessage::DisconnectConnectionToNetwork(8));
        round_trip_message(NetworkMessage::WhatIsNetworkNumber);
        round_trip_message(NetworkMessage::NetworkNumberIs { network: 1, configured: true });
        round_trip_message(NetworkMessage::Proprietary {
            message_type: 0x90,
            vendor_id: 260,
            body: vec![1, 2, 3],
        });
    }

    #[test]
    fn network_list_cap() {
        let body: Vec<u8> = vec![0; (MAX_NETWORK_LIST + 1) * 2];
        assert_matches!(
            NetworkMessage::decode_body(message_type::I_AM_ROUTER_TO_NETWORK, None, &body),
            Err(DecodeError::CountLimitExceeded)
        );
    }

    #[test]
    fn unknown_standard_message_type() {
        assert_matches!(
            NetworkMessage::decode_body(0x20, None, &[]),
            Err(DecodeError::UnknownPduType(0x20))
        );
    }

    #[test]
    fn trailing_bytes_rejected() {
        assert_matches!(
            NetworkMessage::decode_body(message_type::WHAT_IS_NETWORK_NUMBER, None, &[0x00]),
            Err(DecodeError::OutOfRange)
        );
    }
}
