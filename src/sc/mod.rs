// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! BACnet Secure Connect (Annex AB): a hub-and-spoke overlay carrying
//! BVLC-SC frames over WebSocket, normally inside mutually authenticated
//! TLS 1.3.
//!
//! - [`connection`] is the per-link state machine, transport-free.
//! - [`hub`] accepts spokes and routes between them.
//! - [`connector`] keeps a spoke attached to its hub with failover.
//! - [`switch`] manages optional direct node-to-node connections.
//! - [`tls`] builds the rustls configurations.
//!
//! [`ScPort`] is the [`TransportPort`] face a Secure Connect node exposes
//! to the network layer.

pub mod connection;
pub mod connector;
pub mod hub;
pub mod switch;
pub mod tls;

use std::time::Duration;

use uuid::Uuid;

use crate::addr::MacAddr;
use crate::datalink::{PortId, ReceivedFrame, TransportPort};
use crate::error::LinkError;
use crate::util::sink::UnboundedSink;

pub use crate::wire::bvlcsc::{ScVmac, SC_BROADCAST};

/// WebSocket subprotocol for hub links.
pub const HUB_SUBPROTOCOL: &str = "hub.bsc.bacnet.org";
/// WebSocket subprotocol for direct node-to-node links.
pub const DIRECT_SUBPROTOCOL: &str = "dc.bsc.bacnet.org";

/// Largest NPDU the overlay advertises.
pub const SC_MAX_NPDU: u16 = 1497;
/// Largest BVLC-SC frame accepted before the oversize defense trips.
pub const SC_MAX_BVLC: u16 = 16384;

/// WebSocket buffer tuning shared by every SC socket: writes flush from
/// 8 KiB and refuse to queue past 32 KiB, turning a slow peer into TCP
/// backpressure instead of unbounded memory.
pub(crate) fn ws_config() -> tokio_tungstenite::tungstenite::protocol::WebSocketConfig {
    let mut config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    config.write_buffer_size = 8 * 1024;
    config.max_write_buffer_size = 32 * 1024;
    config
}

/// A random VMAC with the locally-administered unicast pattern Annex AB
/// requires (second-lowest bit of the first octet set, lowest clear).
pub fn random_vmac() -> ScVmac {
    let mut vmac: ScVmac = rand::random();
    vmac[0] = (vmac[0] | 0x02) & !0x01;
    vmac
}

/// Secure Connect node configuration.
#[derive(Debug, Clone)]
pub struct ScConfig {
    pub primary_uri: String,
    pub secondary_uri: Option<String>,
    pub vmac: ScVmac,
    pub uuid: Uuid,
    /// TLS material; `None` is the plaintext test mode and is loudly logged.
    pub tls: Option<tls::TlsMaterial>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for ScConfig {
    fn default() -> Self {
        ScConfig {
            primary_uri: String::new(),
            secondary_uri: None,
            vmac: random_vmac(),
            uuid: Uuid::new_v4(),
            tls: None,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
        }
    }
}

/// The data-link face of a Secure Connect node: frames go to the hub, which
/// routes them on; broadcasts use the broadcast VMAC.
pub struct ScPort {
    connector: connector::HubConnector,
}

impl ScPort {
    pub fn new(config: ScConfig) -> ScPort {
        ScPort { connector: connector::HubConnector::new(config) }
    }

    pub fn connector(&self) -> &connector::HubConnector {
        &self.connector
    }
}

impl TransportPort for ScPort {
    fn link_type(&self) -> &'static str {
        "sc"
    }

    fn start(
        &mut self,
        id: PortId,
        rx_sink: UnboundedSink<ReceivedFrame>,
    ) -> Result<(), LinkError> {
        let sink = rx_sink;
        self.connector.start(move |origin: ScVmac, npdu: Vec<u8>| {
            sink.send(ReceivedFrame {
                port: id,
                source_mac: MacAddr::new(&origin).unwrap(),
                npdu,
            });
        })
    }

    fn stop(&mut self) {
        self.connector.stop();
    }

    fn send_unicast(&self, dest: &MacAddr, npdu: &[u8]) -> Result<(), LinkError> {
        let vmac: ScVmac = dest
            .as_bytes()
            .try_into()
            .map_err(|_| LinkError::InvalidAddress(dest.to_string()))?;
        self.connector.send_npdu(vmac, npdu)
    }

    fn send_broadcast(&self, npdu: &[u8]) -> Result<(), LinkError> {
        self.connector.send_npdu(SC_BROADCAST, npdu)
    }

    fn max_npdu_len(&self) -> usize {
        SC_MAX_NPDU as usize
    }
}
