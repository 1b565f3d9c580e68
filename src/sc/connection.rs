// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-connection Secure Connect state machine (Annex AB.6.2).
//!
//! Transport-free: callers feed it frames and clock ticks and perform the
//! [`Output`]s it returns. Both endpoint roles share it (an initiator
//! opens with Connect-Request, an accepter waits for one), and the hub and
//! connector both pump one machine per WebSocket.

use std::time::{Duration, Instant};

use log::{debug, warn};
use uuid::Uuid;

use crate::wire::bvlcsc::{function, nak, ConnectParams, ScError, ScFrame, ScPayload, ScVmac};

const LOG: &str = "bacnet::sc::connection";

/// Consecutive oversized frames tolerated before the link is dropped.
pub const MAX_OVERSIZE_STRIKES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We dialed out and send Connect-Request.
    Initiator,
    /// We accepted the socket and wait for Connect-Request.
    Accepter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    AwaitConnectAccept,
    AwaitConnectRequest,
    Connected,
    Disconnecting,
    Failed,
}

/// What the owner must do after feeding the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Send(ScFrame),
    /// A frame for the layer above (NPDUs, resolutions, advertisements).
    Deliver(ScFrame),
    /// The handshake finished; the peer's parameters are known.
    Connected(ConnectParams),
    /// The link is over; close the socket.
    Close(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Graceful disconnect completed.
    Disconnected,
    /// Heartbeat or handshake deadline passed.
    Timeout,
    /// The peer misbehaved (protocol violation, oversize flood).
    Protocol,
    /// Our Connect-Request was refused.
    Refused,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub vmac: ScVmac,
    pub uuid: Uuid,
    pub max_bvlc_len: u16,
    pub max_npdu_len: u16,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
}

/// One Secure Connect link endpoint.
#[derive(Debug)]
pub struct Connection {
    role: Role,
    config: ConnectionConfig,
    state: State,
    peer: Option<ConnectParams>,
    next_message_id: u16,
    /// Last time any frame arrived.
    last_rx: Instant,
    /// Outstanding heartbeat: sent at, awaiting ack.
    heartbeat_sent: Option<Instant>,
    /// Deadline for the in-progress handshake or disconnect.
    phase_deadline: Option<Instant>,
    oversize_strikes: u8,
}

impl Connection {
    pub fn new(role: Role, config: ConnectionConfig, now: Instant) -> Connection {
        Connection {
            role,
            state: State::Idle,
            peer: None,
            next_message_id: rand::random(),
            last_rx: now,
            heartbeat_sent: None,
            phase_deadline: None,
            oversize_strikes: 0,
            config,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn peer(&self) -> Option<&ConnectParams> {
        self.peer.as_ref()
    }

    pub fn peer_vmac(&self) -> Option<ScVmac> {
        self.peer.map(|p| p.vmac)
    }

    fn message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    fn local_params(&self) -> ConnectParams {
        ConnectParams {
            vmac: self.config.vmac,
            uuid: self.config.uuid,
            max_bvlc_len: self.config.max_bvlc_len,
            max_npdu_len: self.config.max_npdu_len,
        }
    }

    /// Opens the handshake. Re-entrant safe: a second call while anything is
    /// in progress is refused with no side effects.
    pub fn connect(&mut self, now: Instant) -> Result<Vec<Output>, State> {
        if self.state != State::Idle {
            return Err(self.state);
        }
        self.phase_deadline = Some(now + self.config.connect_timeout);
        match self.role {
            Role::Initiator => {
                self.state = State::AwaitConnectAccept;
                let id = self.message_id();
                Ok(vec![Output::Send(ScFrame::new(
                    id,
                    ScPayload::ConnectRequest(self.local_params()),
                ))])
            }
            Role::Accepter => {
                self.state = State::AwaitConnectRequest;
                Ok(Vec::new())
            }
        }
    }

    /// Begins a graceful disconnect.
    pub fn disconnect(&mut self, now: Instant) -> Vec<Output> {
        match self.state {
            State::Connected => {
                self.state = State::Disconnecting;
                self.phase_deadline = Some(now + self.config.connect_timeout);
                let id = self.message_id();
                vec![Output::Send(ScFrame::new(id, ScPayload::DisconnectRequest))]
            }
            State::Idle | State::Failed => Vec::new(),
            _ => {
                self.state = State::Failed;
                vec![Output::Close(CloseReason::Disconnected)]
            }
        }
    }

    /// Builds an Encapsulated-NPDU toward `dest` on this link.
    pub fn encapsulate(&mut self, dest: ScVmac, npdu: &[u8]) -> ScFrame {
        let id = self.message_id();
        ScFrame::new(id, ScPayload::EncapsulatedNpdu(npdu.to_vec()))
            .with_origin(self.config.vmac)
            .with_destination(dest)
    }

    /// Reports a frame that exceeded the negotiated size. Returns outputs
    /// (possibly a close after repeated strikes); the frame itself must be
    /// dropped by the caller.
    pub fn on_oversized_frame(&mut self, len: usize) -> Vec<Output> {
        self.oversize_strikes += 1;
        warn!(target: LOG, "dropping {} byte frame over the {} cap (strike {}/{})",
            len, self.config.max_bvlc_len, self.oversize_strikes, MAX_OVERSIZE_STRIKES);
        if self.oversize_strikes >= MAX_OVERSIZE_STRIKES {
            self.state = State::Failed;
            return vec![Output::Close(CloseReason::Protocol)];
        }
        Vec::new()
    }

    /// Feeds one received frame.
    pub fn on_frame(&mut self, frame: ScFrame, now: Instant) -> Vec<Output> {
        self.last_rx = now;
        self.oversize_strikes = 0;
        match self.state {
            State::AwaitConnectAccept => self.handshake_initiator(frame),
            State::AwaitConnectRequest => self.handshake_accepter(frame),
            State::Connected => self.connected_frame(frame),
            State::Disconnecting => match frame.payload {
                ScPayload::DisconnectAck | ScPayload::DisconnectRequest => {
                    self.state = State::Idle;
                    vec![Output::Close(CloseReason::Disconnected)]
                }
                _ => Vec::new(),
            },
            State::Idle | State::Failed => {
                debug!(target: LOG, "frame in state {:?} ignored", self.state);
                Vec::new()
            }
        }
    }

    fn handshake_initiator(&mut self, frame: ScFrame) -> Vec<Output> {
        match frame.payload {
            ScPayload::ConnectAccept(params) => {
                self.peer = Some(params);
                self.state = State::Connected;
                self.phase_deadline = None;
                vec![Output::Connected(params)]
            }
            ScPayload::Result { acked_function: function::CONNECT_REQUEST, error } => {
                warn!(target: LOG, "hub refused connection: {:?}",
                    error.as_ref().map(|e| (e.class, e.code)));
                self.state = State::Failed;
                vec![Output::Close(CloseReason::Refused)]
            }
            _ => {
                debug!(target: LOG, "unexpected frame during handshake");
                Vec::new()
            }
        }
    }

    fn handshake_accepter(&mut self, frame: ScFrame) -> Vec<Output> {
        match frame.payload {
            ScPayload::ConnectRequest(params) => {
                self.peer = Some(params);
                self.state = State::Connected;
                self.phase_deadline = None;
                let id = self.message_id();
                vec![
                    Output::Send(ScFrame::new(
                        id,
                        ScPayload::ConnectAccept(self.local_params()),
                    )),
                    Output::Connected(params),
                ]
            }
            _ => {
                // Anything but a Connect-Request before the handshake is a
                // protocol violation.
                self.state = State::Failed;
                vec![Output::Close(CloseReason::Protocol)]
            }
        }
    }

    /// Rejects a Connect-Request whose identity collides with an existing
    /// connection. Only meaningful for an accepter mid-handshake.
    pub fn refuse_collision(&mut self, request_message_id: u16) -> Vec<Output> {
        self.state = State::Failed;
        let mut result = ScFrame::new(
            request_message_id,
            ScPayload::Result {
                acked_function: function::CONNECT_REQUEST,
                error: Some(ScError {
                    header_marker: 0,
                    class: nak::CLASS_COMMUNICATION,
                    code: nak::CODE_NODE_DUPLICATE_VMAC,
                    details: "vmac or uuid already connected".to_owned(),
                }),
            },
        );
        result.is_nack = true;
        vec![Output::Send(result), Output::Close(CloseReason::Protocol)]
    }

    fn connected_frame(&mut self, frame: ScFrame) -> Vec<Output> {
        match frame.payload {
            ScPayload::HeartbeatRequest => {
                let ack = ScFrame::new(frame.message_id, ScPayload::HeartbeatAck);
                vec![Output::Send(ack)]
            }
            ScPayload::HeartbeatAck => {
                self.heartbeat_sent = None;
                Vec::new()
            }
            ScPayload::DisconnectRequest => {
                self.state = State::Idle;
                let ack = ScFrame::new(frame.message_id, ScPayload::DisconnectAck);
                vec![Output::Send(ack), Output::Close(CloseReason::Disconnected)]
            }
            ScPayload::DisconnectAck => Vec::new(),
            _ => vec![Output::Deliver(frame)],
        }
    }

    /// Clock tick: drives heartbeats and all deadlines.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Output> {
        if let Some(deadline) = self.phase_deadline {
            if now >= deadline {
                warn!(target: LOG, "{:?} deadline passed in {:?}", self.role, self.state);
                self.state = State::Failed;
                return vec![Output::Close(CloseReason::Timeout)];
            }
        }
        if self.state != State::Connected {
            return Vec::new();
        }
        if let Some(sent) = self.heartbeat_sent {
            if now.duration_since(sent) >= self.config.heartbeat_timeout {
                warn!(target: LOG, "heartbeat unanswered; failing the connection");
                self.state = State::Failed;
                return vec![Output::Close(CloseReason::Timeout)];
            }
            return Vec::new();
        }
        if now.duration_since(self.last_rx) >= self.config.heartbeat_interval {
            self.heartbeat_sent = Some(now);
            let id = self.message_id();
            return vec![Output::Send(ScFrame::new(id, ScPayload::HeartbeatRequest))];
        }
        Vec::new()
    }
}
