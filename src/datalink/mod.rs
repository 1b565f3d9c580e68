// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Data-link ports.
//!
//! A [`TransportPort`] owns its sockets and the tasks that pump them. Sends
//! are non-blocking: the caller hands the framed NPDU to the port, which
//! queues it toward its socket task. Receives flow the other way through the
//! sink installed at [`TransportPort::start`]; the socket tasks catch and
//! log per-frame failures so a malformed datagram can never take the
//! receive loop down.

pub mod bbmd;
pub mod bip4;
pub mod bip6;
#[cfg(target_os = "linux")]
pub mod ethernet;

use crate::addr::MacAddr;
use crate::error::LinkError;
use crate::util::sink::UnboundedSink;

/// Identifies one started port within an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u32);

/// A frame arriving from a data link, already stripped to the NPDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub port: PortId,
    /// Data-link source MAC of the sending station.
    pub source_mac: MacAddr,
    pub npdu: Vec<u8>,
}

/// The contract every data link implements.
///
/// `start` acquires OS resources and spawns the socket tasks; `stop` tears
/// them down. Between the two, `send_unicast` and `send_broadcast` accept
/// complete NPDUs and frame them for the link. Frames received from peers
/// are delivered through the sink passed to `start`, tagged with this
/// port's id.
pub trait TransportPort: Send {
    /// Short name for log lines, e.g. `"bip4"`.
    fn link_type(&self) -> &'static str;

    fn start(
        &mut self,
        id: PortId,
        rx_sink: UnboundedSink<ReceivedFrame>,
    ) -> Result<(), LinkError>;

    fn stop(&mut self);

    fn send_unicast(&self, dest: &MacAddr, npdu: &[u8]) -> Result<(), LinkError>;

    fn send_broadcast(&self, npdu: &[u8]) -> Result<(), LinkError>;

    /// Largest NPDU this link can carry.
    fn max_npdu_len(&self) -> usize;
}
