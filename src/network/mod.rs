// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The network layer: NPDU construction, router discovery, and (with two or
//! more ports) routing between data links.
//!
//! All state lives on the application loop; ports hand frames in through
//! the sink installed at [`NetworkEngine::start`] and the engine hands
//! APDUs up through the sink it was built with.

pub mod routing;

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::addr::{Address, MacAddr, GLOBAL_BROADCAST_NETWORK, LOCAL_NETWORK};
use crate::datalink::{PortId, ReceivedFrame, TransportPort};
use crate::error::LinkError;
use crate::types::NetworkPriority;
use crate::util::sink::UnboundedSink;
use crate::wire::npdu::{reject_reason, NetworkMessage, Npdu, RoutingTableEntry};

use self::routing::RouterCache;

const LOG: &str = "bacnet::network";

/// How long an APDU waits for Who-Is-Router resolution.
pub const PENDING_ROUTE_TIMEOUT: Duration = Duration::from_secs(3);
const PENDING_ROUTE_CAP: usize = 64;
/// Initial hop count on originated routed frames.
const INITIAL_HOP_COUNT: u8 = 255;

/// An APDU delivered up to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingApdu {
    /// Reply address: the remote source when the frame was routed, otherwise
    /// the sending station on the receiving port's network.
    pub source: Address,
    pub apdu: Vec<u8>,
    pub expecting_reply: bool,
    pub port: PortId,
}

struct RegisteredPort {
    id: PortId,
    /// Network number of the attached link; 0 when not configured.
    network: u16,
    port: Box<dyn TransportPort>,
}

struct PendingFrame {
    network: u16,
    frame: Vec<u8>,
    deadline: Instant,
}

/// The network engine.
pub struct NetworkEngine {
    ports: Vec<RegisteredPort>,
    cache: RouterCache,
    pending: Vec<PendingFrame>,
    upward: UnboundedSink<IncomingApdu>,
    started: bool,
}

impl NetworkEngine {
    pub fn new(upward: UnboundedSink<IncomingApdu>) -> NetworkEngine {
        NetworkEngine {
            ports: Vec::new(),
            cache: RouterCache::default(),
            pending: Vec::new(),
            upward,
            started: false,
        }
    }

    /// Registers a port before start. `network` is the configured network
    /// number of the attached link (0 for a single-network node).
    pub fn add_port(&mut self, network: u16, port: Box<dyn TransportPort>) -> PortId {
        let id = PortId(self.ports.len() as u32);
        self.ports.push(RegisteredPort { id, network, port });
        id
    }

    /// Routing between links is active once two or more ports exist.
    pub fn is_router(&self) -> bool {
        self.ports.len() >= 2
    }

    pub fn start(&mut self, rx_sink: UnboundedSink<ReceivedFrame>) -> Result<(), LinkError> {
        for p in &mut self.ports {
            p.port.start(p.id, rx_sink.clone())?;
            info!(target: LOG, "started {} port {:?} (network {})",
                p.port.link_type(), p.id, p.network);
        }
        self.started = true;
        Ok(())
    }

    pub fn stop(&mut self) {
        for p in &mut self.ports {
            p.port.stop();
        }
        self.started = false;
        self.pending.clear();
    }

    fn port(&self, id: PortId) -> Option<&RegisteredPort> {
        self.ports.iter().find(|p| p.id == id)
    }

    fn port_for_network(&self, network: u16) -> Option<&RegisteredPort> {
        if network == LOCAL_NETWORK {
            return self.ports.first();
        }
        self.ports.iter().find(|p| p.network == network)
    }

    /// Sends an APDU to `dest`, handling local delivery, global broadcast,
    /// and remote routing with router discovery.
    pub fn send_apdu(
        &mut self,
        dest: &Address,
        apdu: &[u8],
        priority: NetworkPriority,
        expect_reply: bool,
    ) -> Result<(), LinkError> {
        if dest.is_global_broadcast() {
            let npdu = Npdu {
                priority,
                expecting_reply: expect_reply,
                destination: Some(Address::GLOBAL_BROADCAST),
                hop_count: Some(INITIAL_HOP_COUNT),
                ..Default::default()
            };
            let frame = npdu.encode_with(apdu);
            for p in &self.ports {
                p.port.send_broadcast(&frame)?;
            }
            return Ok(());
        }

        if let Some(port) = self.port_for_network(dest.network) {
            // Directly attached network: no DNET needed.
            let npdu = Npdu { priority, expecting_reply: expect_reply, ..Default::default() };
            let frame = npdu.encode_with(apdu);
            return if dest.mac.is_broadcast() {
                port.port.send_broadcast(&frame)
            } else {
                port.port.send_unicast(&dest.mac, &frame)
            };
        }

        // Remote network.
        let npdu = Npdu {
            priority,
            expecting_reply: expect_reply,
            destination: Some(*dest),
            hop_count: Some(INITIAL_HOP_COUNT),
            ..Default::default()
        };
        let frame = npdu.encode_with(apdu);
        self.send_routed(dest.network, frame)
    }

    fn send_routed(&mut self, network: u16, frame: Vec<u8>) -> Result<(), LinkError> {
        if let Some(route) = self.cache.lookup(network) {
            let port = self.port(route.port).ok_or(LinkError::NotStarted)?;
            return port.port.send_unicast(&route.next_hop, &frame);
        }
        debug!(target: LOG, "no route to network {}; soliciting routers", network);
        if self.pending.len() >= PENDING_ROUTE_CAP {
            // Oldest queued frame gives way; its transaction will retry.
            self.pending.remove(0);
        }
        self.pending.push(PendingFrame {
            network,
            frame,
            deadline: Instant::now() + PENDING_ROUTE_TIMEOUT,
        });
        self.broadcast_network_message(
            None,
            &NetworkMessage::WhoIsRouterToNetwork(Some(network)),
        )
    }

    /// Broadcasts a network message on every port (or one specific port).
    pub fn broadcast_network_message(
        &self,
        only_port: Option<PortId>,
        msg: &NetworkMessage,
    ) -> Result<(), LinkError> {
        let (npdu, body) = msg.to_npdu();
        let frame = npdu.encode_with(&body);
        for p in &self.ports {
            if only_port.map_or(true, |id| id == p.id) {
                p.port.send_broadcast(&frame)?;
            }
        }
        Ok(())
    }

    fn unicast_network_message(
        &self,
        port: PortId,
        dest_mac: &MacAddr,
        msg: &NetworkMessage,
    ) -> Result<(), LinkError> {
        let (npdu, body) = msg.to_npdu();
        let frame = npdu.encode_with(&body);
        let port = self.port(port).ok_or(LinkError::NotStarted)?;
        port.port.send_unicast(dest_mac, &frame)
    }

    /// Drops route-pending frames whose deadline has passed. Called from the
    /// application's periodic sweep.
    pub fn sweep(&mut self, now: Instant) {
        let before = self.pending.len();
        self.pending.retain(|p| p.deadline > now);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            warn!(target: LOG, "dropped {} frames awaiting router discovery", dropped);
        }
    }

    /// Entry point for every frame a port receives.
    pub fn handle_frame(&mut self, frame: ReceivedFrame) {
        match Npdu::decode(&frame.npdu) {
            Ok((npdu, payload)) => self.handle_npdu(frame.port, frame.source_mac, npdu, payload),
            Err(e) => {
                warn!(target: LOG, "dropping undecodable NPDU from {:?} on {:?}: {}",
                    frame.source_mac, frame.port, e);
            }
        }
    }

    fn handle_npdu(&mut self, port: PortId, sender: MacAddr, npdu: Npdu, payload: &[u8]) {
        // Router-path learning: any routed frame teaches us where its source
        // network lives.
        if let Some(source) = &npdu.source {
            self.cache.insert(source.network, sender, port);
            self.flush_pending(source.network);
        }

        if let Some(dest) = npdu.destination {
            if !self.deliver_or_forward(port, sender, &npdu, dest, payload) {
                return;
            }
        }

        if let Some((message_type, vendor)) = npdu.network_message {
            match NetworkMessage::decode_body(message_type, vendor, payload) {
                Ok(msg) => self.handle_network_message(port, sender, msg),
                Err(e) => warn!(target: LOG,
                    "dropping bad network message {:#x} from {:?}: {}", message_type, sender, e),
            }
            return;
        }

        let port_network = self.port(port).map(|p| p.network).unwrap_or(LOCAL_NETWORK);
        let source = match npdu.source {
            Some(remote) => remote,
            None => Address::new(port_network, sender),
        };
        self.upward.send(IncomingApdu {
            source,
            apdu: payload.to_vec(),
            expecting_reply: npdu.expecting_reply,
            port,
        });
    }

    /// Handles a frame carrying a DNET. Returns true when the frame is also
    /// for local consumption.
    fn deliver_or_forward(
        &mut self,
        port: PortId,
        sender: MacAddr,
        npdu: &Npdu,
        dest: Address,
        payload: &[u8],
    ) -> bool {
        let receiving_network = self.port(port).map(|p| p.network).unwrap_or(LOCAL_NETWORK);

        if dest.network == GLOBAL_BROADCAST_NETWORK {
            if self.is_router() {
                self.replicate_broadcast(port, sender, npdu, dest, payload);
            }
            return true;
        }
        if dest.network == receiving_network {
            return true;
        }
        if !self.is_router() {
            // Not ours and we do not route: drop quietly per Clause 6.
            debug!(target: LOG, "ignoring NPDU for network {}", dest.network);
            return false;
        }

        let hop_count = npdu.hop_count.unwrap_or(0);
        if hop_count == 0 {
            self.reject_toward(port, sender, npdu, reject_reason::HOP_COUNT_EXCEEDED, dest.network);
            return false;
        }

        let mut forwarded = Npdu {
            hop_count: Some(hop_count - 1),
            source: Some(npdu.source.unwrap_or(Address::new(receiving_network, sender))),
            ..npdu.clone()
        };

        if let Some(out) = self.port_for_network(dest.network) {
            // Final hop: strip the destination and deliver on that link.
            let out_id = out.id;
            forwarded.destination = None;
            forwarded.hop_count = None;
            let frame = forwarded.encode_with(payload);
            let out = self.port(out_id).unwrap();
            let result = if dest.mac.is_broadcast() {
                out.port.send_broadcast(&frame)
            } else {
                out.port.send_unicast(&dest.mac, &frame)
            };
            if let Err(e) = result {
                warn!(target: LOG, "forward to network {} failed: {}", dest.network, e);
            }
            return false;
        }

        let frame = forwarded.encode_with(payload);
        match self.send_routed(dest.network, frame) {
            Ok(()) => {}
            Err(e) => warn!(target: LOG, "next-hop forward failed: {}", e),
        }
        false
    }

    fn replicate_broadcast(
        &mut self,
        from: PortId,
        sender: MacAddr,
        npdu: &Npdu,
        dest: Address,
        payload: &[u8],
    ) {
        let hop_count = npdu.hop_count.unwrap_or(0);
        if hop_count == 0 {
            debug!(target: LOG, "not replicating global broadcast: hop count exhausted");
            return;
        }
        let receiving_network = self.port(from).map(|p| p.network).unwrap_or(LOCAL_NETWORK);
        let forwarded = Npdu {
            destination: Some(dest),
            hop_count: Some(hop_count - 1),
            source: Some(npdu.source.unwrap_or(Address::new(receiving_network, sender))),
            ..npdu.clone()
        };
        let frame = forwarded.encode_with(payload);
        for p in &self.ports {
            if p.id != from {
                if let Err(e) = p.port.send_broadcast(&frame) {
                    warn!(target: LOG, "broadcast replication on {:?} failed: {}", p.id, e);
                }
            }
        }
    }

    fn reject_toward(
        &self,
        port: PortId,
        sender: MacAddr,
        npdu: &Npdu,
        reason: u8,
        network: u16,
    ) {
        let reject = NetworkMessage::RejectMessageToNetwork { reason, network };
        // Toward the previous hop; the original source rides in SNET.
        let (mut out, body) = reject.to_npdu();
        out.destination = npdu.source;
        if out.destination.is_some() {
            out.hop_count = Some(INITIAL_HOP_COUNT);
        }
        let frame = out.encode_with(&body);
        if let Some(p) = self.port(port) {
            if let Err(e) = p.port.send_unicast(&sender, &frame) {
                warn!(target: LOG, "failed to send reject: {}", e);
            }
        }
    }

    fn flush_pending(&mut self, network: u16) {
        if self.pending.iter().all(|p| p.network != network) {
            return;
        }
        let Some(route) = self.cache.lookup(network) else { return };
        if self.port(route.port).is_none() {
            return;
        }
        let mut kept = Vec::new();
        for p in std::mem::take(&mut self.pending) {
            if p.network == network {
                if let Some(port) = self.port(route.port) {
                    if let Err(e) = port.port.send_unicast(&route.next_hop, &p.frame) {
                        warn!(target: LOG, "flush to network {} failed: {}", network, e);
                    }
                }
            } else {
                kept.push(p);
            }
        }
        self.pending = kept;
    }

    fn handle_network_message(&mut self, port: PortId, sender: MacAddr, msg: NetworkMessage) {
        match msg {
            NetworkMessage::WhoIsRouterToNetwork(asked) => {
                self.answer_who_is_router(port, asked)
            }
            NetworkMessage::IAmRouterToNetwork(nets) => {
                for net in &nets {
                    self.cache.insert(*net, sender, port);
                }
                for net in nets {
                    self.flush_pending(net);
                }
            }
            NetworkMessage::ICouldBeRouterToNetwork { network, .. } => {
                debug!(target: LOG, "ignoring I-Could-Be-Router-To-Network {}", network);
            }
            NetworkMessage::RejectMessageToNetwork { reason, network } => {
                warn!(target: LOG, "router rejected traffic for network {} (reason {})",
                    network, reason);
                self.cache.invalidate(network);
            }
            NetworkMessage::RouterBusyToNetwork(nets) => {
                for net in nets {
                    self.cache.invalidate(net);
                }
            }
            NetworkMessage::RouterAvailableToNetwork(nets) => {
                for net in nets {
                    self.cache.insert(net, sender, port);
                }
            }
            NetworkMessage::InitializeRoutingTable(entries) => {
                if entries.is_empty() {
                    // Empty request asks for our table.
                    let table: Vec<RoutingTableEntry> = self
                        .ports
                        .iter()
                        .map(|p| RoutingTableEntry {
                            network: p.network,
                            port_id: p.id.0 as u8 + 1,
                            port_info: Vec::new(),
                        })
                        .collect();
                    let ack = NetworkMessage::InitializeRoutingTableAck(table);
                    let _ = self.unicast_network_message(port, &sender, &ack);
                } else {
                    // Writable routing tables are an operator surface this
                    // node does not offer.
                    let _ = self.unicast_network_message(
                        port,
                        &sender,
                        &NetworkMessage::RejectMessageToNetwork {
                            reason: reject_reason::OTHER,
                            network: entries[0].network,
                        },
                    );
                }
            }
            NetworkMessage::InitializeRoutingTableAck(entries) => {
                debug!(target: LOG, "routing table ack with {} entries", entries.len());
            }
            NetworkMessage::EstablishConnectionToNetwork { network, .. }
            | NetworkMessage::DisconnectConnectionToNetwork(network) => {
                // PTP half-routers are not part of this stack.
                let _ = self.unicast_network_message(
                    port,
                    &sender,
                    &NetworkMessage::RejectMessageToNetwork {
                        reason: reject_reason::OTHER,
                        network,
                    },
                );
            }
            NetworkMessage::WhatIsNetworkNumber => {
                let network = self.port(port).map(|p| p.network).unwrap_or(LOCAL_NETWORK);
                if network != LOCAL_NETWORK {
                    let reply =
                        NetworkMessage::NetworkNumberIs { network, configured: true };
                    let _ = self.broadcast_network_message(Some(port), &reply);
                }
            }
            NetworkMessage::NetworkNumberIs { network, configured } => {
                info!(target: LOG, "network number of {:?} reported as {} (configured {})",
                    port, network, configured);
            }
            NetworkMessage::Proprietary { message_type, vendor_id, .. } => {
                debug!(target: LOG, "ignoring proprietary network message {:#x} vendor {}",
                    message_type, vendor_id);
            }
        }
    }

    fn answer_who_is_router(&mut self, port: PortId, asked: Option<u16>) {
        if !self.is_router() {
            return;
        }
        let reachable: Vec<u16> = match asked {
            Some(net) => {
                let via_port = self
                    .ports
                    .iter()
                    .any(|p| p.id != port && p.network == net);
                let via_cache = self
                    .cache
                    .lookup(net)
                    .map_or(false, |route| route.port != port);
                if via_port || via_cache {
                    vec![net]
                } else {
                    return;
                }
            }
            None => self
                .ports
                .iter()
                .filter(|p| p.id != port && p.network != LOCAL_NETWORK)
                .map(|p| p.network)
                .collect(),
        };
        if reachable.is_empty() {
            return;
        }
        let reply = NetworkMessage::IAmRouterToNetwork(reachable);
        let _ = self.broadcast_network_message(Some(port), &reply);
    }
}
