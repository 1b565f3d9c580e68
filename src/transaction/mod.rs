// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The transaction state machine (Clause 5.4): reliable confirmed services
//! over a datagram network layer.
//!
//! One [`Tsm`] holds both halves: client transactions it originated and
//! server transactions peers opened toward us. Transactions are keyed by
//! `(peer, invoke id, role)`; the two roles live in separate maps. All
//! methods run on the application loop; outgoing APDUs leave through a sink
//! and timeouts arrive back as timer events.

pub mod segmentation;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::debug;

use crate::addr::Address;
use crate::error::{ServiceError, TransactionError};
use crate::util::responder::Responder;
use crate::util::sink::UnboundedSink;
use crate::util::timer::{EventId, TimedEvent, Timer};
use crate::wire::apdu::{
    abort_reason, Apdu, ComplexAck, ConfirmedRequest, MaxApdu, MaxSegments, SegmentInfo,
};

use self::segmentation::{AckOutcome, AssemblyAction, SegmentAssembler, SegmentedOutbound};

const LOG: &str = "bacnet::tsm";

/// Octets of APDU header preceding service data in a segmented PDU.
const SEGMENT_HEADER_OVERHEAD: usize = 6;

/// TSM tuning, from the device configuration.
#[derive(Debug, Clone)]
pub struct TsmConfig {
    pub apdu_timeout: Duration,
    pub retries: u32,
    pub segment_timeout: Duration,
    pub proposed_window: u8,
    pub max_segments: MaxSegments,
    /// Largest APDU we accept; advertised in requests and I-Am.
    pub max_apdu: MaxApdu,
}

impl Default for TsmConfig {
    fn default() -> Self {
        TsmConfig {
            apdu_timeout: Duration::from_secs(3),
            retries: 3,
            segment_timeout: Duration::from_secs(2),
            proposed_window: 16,
            max_segments: MaxSegments::MoreThanSixtyFour,
            max_apdu: MaxApdu::Up1476,
        }
    }
}

/// What a confirmed request resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceAck {
    Simple { service_choice: u8 },
    Complex { service_choice: u8, data: Vec<u8> },
}

pub type ClientCompletion = Responder<Result<ServiceAck, TransactionError>>;

/// Identifies a server transaction for [`Tsm::respond`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerKey {
    pub peer: Address,
    pub invoke_id: u8,
}

/// A reassembled confirmed request, headed for the service registry.
#[derive(Debug)]
pub struct InboundRequest {
    pub key: ServerKey,
    pub service_choice: u8,
    pub service_data: Vec<u8>,
}

/// The application's answer to an [`InboundRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Simple,
    Complex(Vec<u8>),
    Error(ServiceError),
    Reject(u8),
    Abort(u8),
}

/// An APDU the TSM wants on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingApdu {
    pub dest: Address,
    pub apdu: Apdu,
    pub expect_reply: bool,
}

/// Timer events the TSM schedules for itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsmEvent {
    ClientTimeout { peer: Address, invoke_id: u8 },
    ClientSegmentTimeout { peer: Address, invoke_id: u8 },
    ServerSegmentTimeout { peer: Address, invoke_id: u8 },
}

/// What we know about a peer from its I-Am (or a prior exchange).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub max_apdu: MaxApdu,
    pub segmentation_supported: bool,
    pub last_heard: Instant,
}

/// FIFO-bounded per-peer device info.
#[derive(Debug)]
pub struct DeviceInfoCache {
    map: HashMap<Address, DeviceInfo>,
    order: VecDeque<Address>,
    capacity: usize,
}

pub const DEVICE_INFO_CACHE_CAP: usize = 1000;

impl Default for DeviceInfoCache {
    fn default() -> Self {
        DeviceInfoCache { map: HashMap::new(), order: VecDeque::new(), capacity: DEVICE_INFO_CACHE_CAP }
    }
}

impl DeviceInfoCache {
    pub fn record(&mut self, peer: Address, max_apdu: MaxApdu, segmentation_supported: bool) {
        let info = DeviceInfo { max_apdu, segmentation_supported, last_heard: Instant::now() };
        if self.map.insert(peer, info).is_none() {
            self.order.push_back(peer);
            if self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        }
    }

    pub fn get(&self, peer: &Address) -> Option<&DeviceInfo> {
        self.map.get(peer)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

enum ClientState {
    AwaitingConfirmation,
    SegmentedRequest { out: SegmentedOutbound },
    SegmentedResponse { asm: SegmentAssembler, service_choice: u8 },
}

struct ClientTransaction {
    state: ClientState,
    responder: ClientCompletion,
    retries_left: u32,
    timer_id: EventId,
    /// The unsegmented request APDU, kept for retransmission.
    request: Option<Apdu>,
    service_choice: u8,
}

enum ServerState {
    AssemblingRequest { asm: SegmentAssembler, service_choice: u8 },
    AwaitingResponse,
    SendingResponse { out: SegmentedOutbound, service_choice: u8 },
}

struct ServerTransaction {
    state: ServerState,
    timer_id: EventId,
    /// Requester limits, from its request header.
    peer_max_apdu: MaxApdu,
    segmented_response_accepted: bool,
}

/// Both halves of the transaction state machine.
pub struct Tsm {
    config: TsmConfig,
    client: HashMap<(Address, u8), ClientTransaction>,
    server: HashMap<(Address, u8), ServerTransaction>,
    next_invoke: HashMap<Address, u8>,
    pub device_info: DeviceInfoCache,
    timer: Timer<TsmEvent>,
    outgoing: UnboundedSink<OutgoingApdu>,
    inbound: UnboundedSink<InboundRequest>,
}

impl Tsm {
    pub fn new(
        config: TsmConfig,
        timer: Timer<TsmEvent>,
        outgoing: UnboundedSink<OutgoingApdu>,
        inbound: UnboundedSink<InboundRequest>,
    ) -> Tsm {
        Tsm {
            config,
            client: HashMap::new(),
            server: HashMap::new(),
            next_invoke: HashMap::new(),
            device_info: DeviceInfoCache::default(),
            timer,
            outgoing,
            inbound,
        }
    }

    pub fn active_client_transactions(&self) -> usize {
        self.client.len()
    }

    pub fn active_server_transactions(&self) -> usize {
        self.server.len()
    }

    fn allocate_invoke_id(&mut self, peer: &Address) -> Option<u8> {
        let next = self.next_invoke.entry(*peer).or_insert(0);
        for _ in 0..=u8::MAX {
            let candidate = *next;
            *next = next.wrapping_add(1);
            if !self.client.contains_key(&(*peer, candidate)) {
                return Some(candidate);
            }
        }
        None
    }

    /// Conservative defaults apply until the peer's I-Am is heard.
    fn peer_limits(&self, peer: &Address) -> (MaxApdu, bool) {
        match self.device_info.get(peer) {
            Some(info) => (info.max_apdu, info.segmentation_supported),
            None => (MaxApdu::Up128, false),
        }
    }

    fn send(&self, dest: Address, apdu: Apdu, expect_reply: bool) {
        self.outgoing.send(OutgoingApdu { dest, apdu, expect_reply });
    }

    /// Issues a confirmed request. The responder resolves with the terminal
    /// outcome, exactly once.
    pub fn send_request(
        &mut self,
        peer: Address,
        service_choice: u8,
        service_data: Vec<u8>,
        responder: ClientCompletion,
    ) {
        let Some(invoke_id) = self.allocate_invoke_id(&peer) else {
            responder.respond(Err(TransactionError::ResourcesBusy));
            return;
        };
        let (peer_max_apdu, peer_segmentation) = self.peer_limits(&peer);
        let fits = service_data.len() + SEGMENT_HEADER_OVERHEAD <= peer_max_apdu.bytes();

        if fits {
            let mut request = ConfirmedRequest::new(invoke_id, service_choice, service_data);
            request.max_apdu = self.config.max_apdu;
            request.max_segments = self.config.max_segments;
            let apdu = Apdu::ConfirmedRequest(request);
            self.send(peer, apdu.clone(), true);
            let timer_id = self.timer.schedule_after(
                self.config.apdu_timeout,
                TsmEvent::ClientTimeout { peer, invoke_id },
            );
            self.client.insert(
                (peer, invoke_id),
                ClientTransaction {
                    state: ClientState::AwaitingConfirmation,
                    responder,
                    retries_left: self.config.retries,
                    timer_id,
                    request: Some(apdu),
                    service_choice,
                },
            );
            return;
        }

        if !peer_segmentation {
            responder.respond(Err(TransactionError::SegmentationNotSupported));
            return;
        }

        let segment_size = peer_max_apdu.bytes() - SEGMENT_HEADER_OVERHEAD;
        let out =
            SegmentedOutbound::new(service_data, segment_size, self.config.proposed_window);
        let (seq, more, chunk) = out.segment(0);
        self.send(
            peer,
            self.segmented_request_apdu(invoke_id, service_choice, seq, more, chunk, &out),
            true,
        );
        let timer_id = self.timer.schedule_after(
            self.config.segment_timeout,
            TsmEvent::ClientSegmentTimeout { peer, invoke_id },
        );
        self.client.insert(
            (peer, invoke_id),
            ClientTransaction {
                state: ClientState::SegmentedRequest { out },
                responder,
                retries_left: self.config.retries,
                timer_id,
                request: None,
                service_choice,
            },
        );
    }

    fn segmented_request_apdu(
        &self,
        invoke_id: u8,
        service_choice: u8,
        seq: u8,
        more: bool,
        chunk: &[u8],
        out: &SegmentedOutbound,
    ) -> Apdu {
        segmented_request_apdu(&self.config, invoke_id, service_choice, seq, more, chunk, out)
    }

    /// Cancels one client transaction: Abort toward the peer, `Cancelled` to
    /// the caller.
    pub fn cancel(&mut self, peer: Address, invoke_id: u8) {
        if let Some(txn) = self.client.remove(&(peer, invoke_id)) {
            self.send(
                peer,
                Apdu::Abort { from_server: false, invoke_id, reason: abort_reason::OTHER },
                false,
            );
            txn.responder.respond(Err(TransactionError::Cancelled));
        }
    }

    /// Cancels everything; used at shutdown. Every pending completion is
    /// woken with `Cancelled`.
    pub fn cancel_all(&mut self) {
        let client_keys: Vec<_> = self.client.keys().copied().collect();
        for (peer, invoke_id) in client_keys {
            self.cancel(peer, invoke_id);
        }
        for ((peer, invoke_id), _) in std::mem::take(&mut self.server) {
            self.send(
                peer,
                Apdu::Abort { from_server: true, invoke_id, reason: abort_reason::OTHER },
                false,
            );
        }
    }

    /// The application's answer to a previously delivered [`InboundRequest`].
    pub fn respond(&mut self, key: ServerKey, service_choice: u8, response: Response) {
        let Some(txn) = self.server.get_mut(&(key.peer, key.invoke_id)) else {
            debug!(target: LOG, "response for unknown transaction {:?}", key);
            return;
        };
        let apdu = match response {
            Response::Simple => {
                Apdu::SimpleAck { invoke_id: key.invoke_id, service_choice }
            }
            Response::Error(error) => {
                Apdu::Error { invoke_id: key.invoke_id, service_choice, error }
            }
            Response::Reject(reason) => Apdu::Reject { invoke_id: key.invoke_id, reason },
            Response::Abort(reason) => {
                Apdu::Abort { from_server: true, invoke_id: key.invoke_id, reason }
            }
            Response::Complex(data) => {
                let fits =
                    data.len() + SEGMENT_HEADER_OVERHEAD <= txn.peer_max_apdu.bytes();
                if fits {
                    Apdu::ComplexAck(ComplexAck::new(key.invoke_id, service_choice, data))
                } else if !txn.segmented_response_accepted {
                    Apdu::Abort {
                        from_server: true,
                        invoke_id: key.invoke_id,
                        reason: abort_reason::SEGMENTATION_NOT_SUPPORTED,
                    }
                } else {
                    // Open the segmented response with segment zero.
                    let segment_size = txn.peer_max_apdu.bytes() - SEGMENT_HEADER_OVERHEAD;
                    let out = SegmentedOutbound::new(
                        data,
                        segment_size,
                        self.config.proposed_window,
                    );
                    let (seq, more, chunk) = out.segment(0);
                    let apdu = Apdu::ComplexAck(ComplexAck {
                        invoke_id: key.invoke_id,
                        segment: Some(SegmentInfo {
                            sequence_number: seq,
                            proposed_window_size: out.window(),
                        }),
                        more_follows: more,
                        service_choice,
                        service_data: chunk.to_vec(),
                    });
                    txn.state = ServerState::SendingResponse { out, service_choice };
                    txn.timer_id = self.timer.schedule_after(
                        self.config.segment_timeout,
                        TsmEvent::ServerSegmentTimeout {
                            peer: key.peer,
                            invoke_id: key.invoke_id,
                        },
                    );
                    self.outgoing.send(OutgoingApdu {
                        dest: key.peer,
                        apdu,
                        expect_reply: true,
                    });
                    return;
                }
            }
        };
        self.server.remove(&(key.peer, key.invoke_id));
        self.send(key.peer, apdu, false);
    }

    /// Routes one received APDU into the matching transaction.
    pub fn handle_apdu(&mut self, source: Address, apdu: Apdu) {
        match apdu {
            Apdu::ConfirmedRequest(req) => self.handle_confirmed_request(source, req),
            Apdu::UnconfirmedRequest { .. } => {
                debug!(target: LOG, "unconfirmed request reached the TSM; dropped");
            }
            Apdu::SimpleAck { invoke_id, service_choice } => {
                self.complete_client(source, invoke_id, Ok(ServiceAck::Simple { service_choice }));
            }
            Apdu::ComplexAck(ack) => self.handle_complex_ack(source, ack),
            Apdu::SegmentAck {
                negative_ack,
                from_server,
                invoke_id,
                sequence_number,
                actual_window_size,
            } => {
                if from_server {
                    self.handle_client_segment_ack(
                        source,
                        invoke_id,
                        sequence_number,
                        actual_window_size,
                        negative_ack,
                    );
                } else {
                    self.handle_server_segment_ack(
                        source,
                        invoke_id,
                        sequence_number,
                        actual_window_size,
                        negative_ack,
                    );
                }
            }
            Apdu::Error { invoke_id, error, .. } => {
                self.complete_client(source, invoke_id, Err(TransactionError::Service(error)));
            }
            Apdu::Reject { invoke_id, reason } => {
                self.complete_client(source, invoke_id, Err(TransactionError::Rejected(reason)));
            }
            Apdu::Abort { invoke_id, reason, from_server } => {
                if from_server {
                    self.complete_client(
                        source,
                        invoke_id,
                        Err(TransactionError::Aborted(reason)),
                    );
                } else {
                    self.server.remove(&(source, invoke_id));
                }
            }
        }
    }

    fn complete_client(
        &mut self,
        peer: Address,
        invoke_id: u8,
        outcome: Result<ServiceAck, TransactionError>,
    ) {
        match self.client.remove(&(peer, invoke_id)) {
            Some(txn) => txn.responder.respond(outcome),
            None => debug!(target: LOG,
                "terminal APDU for unknown client transaction {} from {}", invoke_id, peer),
        }
    }

    fn handle_complex_ack(&mut self, source: Address, ack: ComplexAck) {
        let key = (source, ack.invoke_id);
        if !self.client.contains_key(&key) {
            debug!(target: LOG, "ComplexACK for unknown transaction {}", ack.invoke_id);
            return;
        }
        let Some(info) = ack.segment else {
            let outcome = Ok(ServiceAck::Complex {
                service_choice: ack.service_choice,
                data: ack.service_data,
            });
            self.complete_client(source, ack.invoke_id, outcome);
            return;
        };

        // Borrow the transaction only to advance its state; the resulting
        // sends and completions run after the borrow ends.
        enum After {
            Nothing,
            Ack { seq: u8, window: u8, negative: bool, expecting_more: bool },
            Complete { seq: u8, window: u8, outcome: Result<ServiceAck, TransactionError> },
            Overflow,
        }
        let window_cap = info.proposed_window_size.clamp(1, 127);
        let txn = self.client.get_mut(&key).unwrap();
        let after = match &mut txn.state {
            ClientState::AwaitingConfirmation if info.sequence_number == 0 => {
                if !ack.more_follows {
                    // A degenerate single-segment response.
                    After::Complete {
                        seq: 0,
                        window: window_cap,
                        outcome: Ok(ServiceAck::Complex {
                            service_choice: ack.service_choice,
                            data: ack.service_data.clone(),
                        }),
                    }
                } else {
                    txn.state = ClientState::SegmentedResponse {
                        asm: SegmentAssembler::new(window_cap, &ack.service_data),
                        service_choice: ack.service_choice,
                    };
                    txn.timer_id = self.timer.schedule_after(
                        self.config.segment_timeout,
                        TsmEvent::ClientSegmentTimeout { peer: source, invoke_id: ack.invoke_id },
                    );
                    After::Ack { seq: 0, window: window_cap, negative: false, expecting_more: true }
                }
            }
            ClientState::SegmentedResponse { asm, service_choice } => {
                let service_choice = *service_choice;
                let window = asm.window_size();
                match asm.accept(info.sequence_number, ack.more_follows, &ack.service_data) {
                    AssemblyAction::Buffered { ack_due } => {
                        let last = asm.last_seq();
                        txn.timer_id = self.timer.schedule_after(
                            self.config.segment_timeout,
                            TsmEvent::ClientSegmentTimeout {
                                peer: source,
                                invoke_id: ack.invoke_id,
                            },
                        );
                        if ack_due {
                            After::Ack { seq: last, window, negative: false, expecting_more: true }
                        } else {
                            After::Nothing
                        }
                    }
                    AssemblyAction::Complete(data) => After::Complete {
                        seq: info.sequence_number,
                        window,
                        outcome: Ok(ServiceAck::Complex { service_choice, data }),
                    },
                    AssemblyAction::Duplicate => After::Ack {
                        seq: asm.last_seq(),
                        window,
                        negative: false,
                        expecting_more: true,
                    },
                    AssemblyAction::Nak => After::Ack {
                        seq: asm.last_seq(),
                        window,
                        negative: true,
                        expecting_more: true,
                    },
                    AssemblyAction::OutOfWindow => After::Nothing,
                    AssemblyAction::Overflow => After::Overflow,
                }
            }
            _ => {
                debug!(target: LOG, "unexpected segmented ACK in this state; ignored");
                After::Nothing
            }
        };

        match after {
            After::Nothing => {}
            After::Ack { seq, window, negative, expecting_more } => {
                self.segment_ack(source, ack.invoke_id, seq, window, negative, expecting_more);
            }
            After::Complete { seq, window, outcome } => {
                self.segment_ack(source, ack.invoke_id, seq, window, false, false);
                self.complete_client(source, ack.invoke_id, outcome);
            }
            After::Overflow => {
                self.send(
                    source,
                    Apdu::Abort {
                        from_server: false,
                        invoke_id: ack.invoke_id,
                        reason: abort_reason::BUFFER_OVERFLOW,
                    },
                    false,
                );
                self.complete_client(
                    source,
                    ack.invoke_id,
                    Err(TransactionError::Aborted(abort_reason::BUFFER_OVERFLOW)),
                );
            }
        }
    }

    fn segment_ack(
        &self,
        peer: Address,
        invoke_id: u8,
        seq: u8,
        window: u8,
        negative: bool,
        expecting_more: bool,
    ) {
        // `from_server` is from the *sender's* point of view: acks we send
        // as the requesting client are not from a server.
        let from_server = self.server.contains_key(&(peer, invoke_id));
        self.send(
            peer,
            Apdu::SegmentAck {
                negative_ack: negative,
                from_server,
                invoke_id,
                sequence_number: seq,
                actual_window_size: window,
            },
            expecting_more,
        );
    }

    fn handle_client_segment_ack(
        &mut self,
        source: Address,
        invoke_id: u8,
        seq: u8,
        actual_window: u8,
        negative: bool,
    ) {
        let key = (source, invoke_id);
        let mut to_send: Vec<Apdu> = Vec::new();
        {
            let Some(txn) = self.client.get_mut(&key) else { return };
            let service_choice = txn.service_choice;
            let ClientState::SegmentedRequest { out } = &mut txn.state else {
                debug!(target: LOG, "SegmentACK outside a segmented request; ignored");
                return;
            };
            match out.on_ack(seq, actual_window, negative) {
                AckOutcome::Send(range) => {
                    for i in range {
                        let (seq, more, chunk) = out.segment(i);
                        to_send.push(segmented_request_apdu(
                            &self.config,
                            invoke_id,
                            service_choice,
                            seq,
                            more,
                            chunk,
                            out,
                        ));
                    }
                    txn.timer_id = self.timer.schedule_after(
                        self.config.segment_timeout,
                        TsmEvent::ClientSegmentTimeout { peer: source, invoke_id },
                    );
                }
                AckOutcome::Done => {
                    txn.state = ClientState::AwaitingConfirmation;
                    txn.request = None;
                    txn.timer_id = self.timer.schedule_after(
                        self.config.apdu_timeout,
                        TsmEvent::ClientTimeout { peer: source, invoke_id },
                    );
                }
                AckOutcome::Stale => {}
            }
        }
        for apdu in to_send {
            self.send(source, apdu, true);
        }
    }

    fn handle_server_segment_ack(
        &mut self,
        source: Address,
        invoke_id: u8,
        seq: u8,
        actual_window: u8,
        negative: bool,
    ) {
        let key = (source, invoke_id);
        let mut to_send: Vec<Apdu> = Vec::new();
        let mut done = false;
        {
            let Some(txn) = self.server.get_mut(&key) else { return };
            let ServerState::SendingResponse { out, service_choice } = &mut txn.state else {
                debug!(target: LOG, "SegmentACK outside a segmented response; ignored");
                return;
            };
            let service_choice = *service_choice;
            match out.on_ack(seq, actual_window, negative) {
                AckOutcome::Send(range) => {
                    for i in range {
                        let (seq, more, chunk) = out.segment(i);
                        to_send.push(Apdu::ComplexAck(ComplexAck {
                            invoke_id,
                            segment: Some(SegmentInfo {
                                sequence_number: seq,
                                proposed_window_size: out.window(),
                            }),
                            more_follows: more,
                            service_choice,
                            service_data: chunk.to_vec(),
                        }));
                    }
                    txn.timer_id = self.timer.schedule_after(
                        self.config.segment_timeout,
                        TsmEvent::ServerSegmentTimeout { peer: source, invoke_id },
                    );
                }
                AckOutcome::Done => done = true,
                AckOutcome::Stale => {}
            }
        }
        if done {
            self.server.remove(&key);
        }
        for apdu in to_send {
            self.send(source, apdu, true);
        }
    }

    fn handle_confirmed_request(&mut self, source: Address, req: ConfirmedRequest) {
        let key = (source, req.invoke_id);
        match req.segment {
            None => {
                if self.server.contains_key(&key) {
                    // A retry of a request we are still answering.
                    debug!(target: LOG, "duplicate request {} from {}", req.invoke_id, source);
                    return;
                }
                self.server.insert(
                    key,
                    ServerTransaction {
                        state: ServerState::AwaitingResponse,
                        timer_id: 0,
                        peer_max_apdu: req.max_apdu,
                        segmented_response_accepted: req.segmented_response_accepted,
                    },
                );
                self.inbound.send(InboundRequest {
                    key: ServerKey { peer: source, invoke_id: req.invoke_id },
                    service_choice: req.service_choice,
                    service_data: req.service_data,
                });
            }
            Some(info) => self.handle_segmented_request(source, req.invoke_id, info, req),
        }
    }

    fn handle_segmented_request(
        &mut self,
        source: Address,
        invoke_id: u8,
        info: SegmentInfo,
        req: ConfirmedRequest,
    ) {
        let key = (source, invoke_id);
        if info.sequence_number == 0 && !self.server.contains_key(&key) {
            let window = info
                .proposed_window_size
                .clamp(1, self.config.proposed_window.max(1));
            let asm = SegmentAssembler::new(window, &req.service_data);
            if !req.more_follows {
                // Degenerate single-segment request.
                self.server.insert(
                    key,
                    ServerTransaction {
                        state: ServerState::AwaitingResponse,
                        timer_id: 0,
                        peer_max_apdu: req.max_apdu,
                        segmented_response_accepted: req.segmented_response_accepted,
                    },
                );
                self.segment_ack(source, invoke_id, 0, window, false, false);
                self.inbound.send(InboundRequest {
                    key: ServerKey { peer: source, invoke_id },
                    service_choice: req.service_choice,
                    service_data: req.service_data,
                });
                return;
            }
            self.server.insert(
                key,
                ServerTransaction {
                    state: ServerState::AssemblingRequest {
                        asm,
                        service_choice: req.service_choice,
                    },
                    timer_id: self.timer.schedule_after(
                        self.config.segment_timeout,
                        TsmEvent::ServerSegmentTimeout { peer: source, invoke_id },
                    ),
                    peer_max_apdu: req.max_apdu,
                    segmented_response_accepted: req.segmented_response_accepted,
                },
            );
            self.segment_ack(source, invoke_id, 0, window, false, true);
            return;
        }

        if !self.server.contains_key(&key) {
            // Mid-stream segment for a transaction we never opened.
            self.send(
                source,
                Apdu::Abort {
                    from_server: true,
                    invoke_id,
                    reason: abort_reason::INVALID_APDU_IN_THIS_STATE,
                },
                false,
            );
            return;
        }

        enum After {
            Nothing,
            Ack { seq: u8, window: u8, negative: bool, expecting_more: bool },
            Deliver { seq: u8, window: u8, request: InboundRequest },
            Overflow,
        }
        let txn = self.server.get_mut(&key).unwrap();
        let after = {
            let ServerState::AssemblingRequest { asm, service_choice } = &mut txn.state else {
                debug!(target: LOG, "segment for a request already being answered; ignored");
                return;
            };
            let service_choice = *service_choice;
            let window = asm.window_size();
            match asm.accept(info.sequence_number, req.more_follows, &req.service_data) {
                AssemblyAction::Buffered { ack_due } => {
                    let last = asm.last_seq();
                    txn.timer_id = self.timer.schedule_after(
                        self.config.segment_timeout,
                        TsmEvent::ServerSegmentTimeout { peer: source, invoke_id },
                    );
                    if ack_due {
                        After::Ack { seq: last, window, negative: false, expecting_more: true }
                    } else {
                        After::Nothing
                    }
                }
                AssemblyAction::Complete(data) => {
                    txn.state = ServerState::AwaitingResponse;
                    After::Deliver {
                        seq: info.sequence_number,
                        window,
                        request: InboundRequest {
                            key: ServerKey { peer: source, invoke_id },
                            service_choice,
                            service_data: data,
                        },
                    }
                }
                AssemblyAction::Duplicate => After::Ack {
                    seq: asm.last_seq(),
                    window,
                    negative: false,
                    expecting_more: true,
                },
                AssemblyAction::Nak => After::Ack {
                    seq: asm.last_seq(),
                    window,
                    negative: true,
                    expecting_more: true,
                },
                AssemblyAction::OutOfWindow => After::Nothing,
                AssemblyAction::Overflow => After::Overflow,
            }
        };

        match after {
            After::Nothing => {}
            After::Ack { seq, window, negative, expecting_more } => {
                self.segment_ack(source, invoke_id, seq, window, negative, expecting_more);
            }
            After::Deliver { seq, window, request } => {
                self.segment_ack(source, invoke_id, seq, window, false, false);
                self.inbound.send(request);
            }
            After::Overflow => {
                self.server.remove(&key);
                self.send(
                    source,
                    Apdu::Abort {
                        from_server: true,
                        invoke_id,
                        reason: abort_reason::BUFFER_OVERFLOW,
                    },
                    false,
                );
            }
        }
    }

    /// Applies one timer event; stale ids (superseded schedules) fall
    /// through without effect.
    pub fn handle_timeout(&mut self, event: TimedEvent<TsmEvent>) {
        match event.event {
            TsmEvent::ClientTimeout { peer, invoke_id } => {
                let key = (peer, invoke_id);
                let Some(txn) = self.client.get_mut(&key) else { return };
                if txn.timer_id != event.id {
                    return;
                }
                if txn.retries_left > 0 {
                    if let Some(request) = txn.request.clone() {
                        txn.retries_left -= 1;
                        txn.timer_id = self.timer.schedule_after(
                            self.config.apdu_timeout,
                            TsmEvent::ClientTimeout { peer, invoke_id },
                        );
                        self.send(peer, request, true);
                        return;
                    }
                }
                self.send(
                    peer,
                    Apdu::Abort {
                        from_server: false,
                        invoke_id,
                        reason: abort_reason::TSM_TIMEOUT,
                    },
                    false,
                );
                self.complete_client(peer, invoke_id, Err(TransactionError::Timeout));
            }
            TsmEvent::ClientSegmentTimeout { peer, invoke_id } => {
                let key = (peer, invoke_id);
                let mut to_send = Vec::new();
                {
                    let Some(txn) = self.client.get_mut(&key) else { return };
                    if txn.timer_id != event.id {
                        return;
                    }
                    // An unacknowledged window is retransmitted before the
                    // transaction is declared dead.
                    if txn.retries_left > 0 {
                        if let ClientState::SegmentedRequest { out } = &txn.state {
                            let service_choice = txn.service_choice;
                            // Re-open the stalled window; the peer's ack
                            // walks the rest forward again.
                            for i in out.first_window().take(1) {
                                let (seq, more, chunk) = out.segment(i);
                                to_send.push(segmented_request_apdu(
                                    &self.config,
                                    invoke_id,
                                    service_choice,
                                    seq,
                                    more,
                                    chunk,
                                    out,
                                ));
                            }
                        }
                        if !to_send.is_empty() {
                            txn.retries_left -= 1;
                            txn.timer_id = self.timer.schedule_after(
                                self.config.segment_timeout,
                                TsmEvent::ClientSegmentTimeout { peer, invoke_id },
                            );
                        }
                    }
                }
                if !to_send.is_empty() {
                    for apdu in to_send {
                        self.send(peer, apdu, true);
                    }
                    return;
                }
                self.send(
                    peer,
                    Apdu::Abort {
                        from_server: false,
                        invoke_id,
                        reason: abort_reason::TSM_TIMEOUT,
                    },
                    false,
                );
                self.complete_client(peer, invoke_id, Err(TransactionError::Timeout));
            }
            TsmEvent::ServerSegmentTimeout { peer, invoke_id } => {
                let key = (peer, invoke_id);
                let Some(txn) = self.server.get(&key) else { return };
                if txn.timer_id != event.id {
                    return;
                }
                self.server.remove(&key);
                self.send(
                    peer,
                    Apdu::Abort {
                        from_server: true,
                        invoke_id,
                        reason: abort_reason::TSM_TIMEOUT,
                    },
                    false,
                );
            }
        }
    }
}

fn segmented_request_apdu(
    config: &TsmConfig,
    invoke_id: u8,
    service_choice: u8,
    seq: u8,
    more: bool,
    chunk: &[u8],
    out: &SegmentedOutbound,
) -> Apdu {
    Apdu::ConfirmedRequest(ConfirmedRequest {
        segmented_response_accepted: true,
        max_segments: config.max_segments,
        max_apdu: config.max_apdu,
        invoke_id,
        segment: Some(SegmentInfo { sequence_number: seq, proposed_window_size: out.window() }),
        more_follows: more,
        service_choice,
        service_data: chunk.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::MacAddr;
    use crate::util::sink;
    use crate::util::timer::{self, TimeStream};
    use assert_matches::assert_matches;
    use futures::channel::mpsc::UnboundedReceiver;
    use futures::channel::oneshot;

    struct Harness {
        tsm: Tsm,
        out_rx: UnboundedReceiver<OutgoingApdu>,
        in_rx: UnboundedReceiver<InboundRequest>,
        time: TimeStream<TsmEvent>,
    }

    fn harness(config: TsmConfig) -> Harness {
        let (timer, time) = timer::create_timer();
        let (out_tx, out_rx) = sink::unbounded("test-out");
        let (in_tx, in_rx) = sink::unbounded("test-in");
        Harness { tsm: Tsm::new(config, timer, out_tx, in_tx), out_rx, in_rx, time }
    }

    impl Harness {
        fn next_out(&mut self) -> OutgoingApdu {
            self.out_rx.try_next().unwrap().unwrap()
        }

        fn no_out(&mut self) {
            assert!(self.out_rx.try_next().is_err());
        }

        /// Fires the most recently scheduled timer entry.
        fn fire_last_timer(&mut self) {
            let mut last = None;
            while let Ok(Some(entry)) = self.time.try_next() {
                last = Some(entry);
            }
            let entry = last.expect("no timer scheduled");
            self.tsm.handle_timeout(TimedEvent { id: entry.id, event: entry.event });
        }
    }

    fn peer(n: u8) -> Address {
        Address::local(MacAddr::new(&[n]).unwrap())
    }

    fn completion() -> (ClientCompletion, oneshot::Receiver<Result<ServiceAck, TransactionError>>)
    {
        Responder::new()
    }

    #[test]
    fn simple_request_response() {
        let mut h = harness(TsmConfig::default());
        let (responder, mut rx) = completion();
        h.tsm.send_request(peer(1), 15, vec![0x01], responder);
        let out = h.next_out();
        assert_eq!(out.dest, peer(1));
        assert!(out.expect_reply);
        let invoke_id = out.apdu.invoke_id().unwrap();

        h.tsm.handle_apdu(peer(1), Apdu::SimpleAck { invoke_id, service_choice: 15 });
        assert_eq!(
            rx.try_recv().unwrap().unwrap(),
            Ok(ServiceAck::Simple { service_choice: 15 })
        );
        assert_eq!(h.tsm.active_client_transactions(), 0);
    }

    #[test]
    fn error_reject_abort_are_terminal() {
        let mut h = harness(TsmConfig::default());
        let cases: [fn(u8) -> Apdu; 3] = [
            |id| Apdu::Error {
                invoke_id: id,
                service_choice: 12,
                error: ServiceError::new(1, 31),
            },
            |id| Apdu::Reject { invoke_id: id, reason: 9 },
            |id| Apdu::Abort { from_server: true, invoke_id: id, reason: 4 },
        ];
        for (i, make) in cases.into_iter().enumerate() {
            let (responder, mut rx) = completion();
            h.tsm.send_request(peer(9), 12, vec![], responder);
            let invoke_id = h.next_out().apdu.invoke_id().unwrap();
            h.tsm.handle_apdu(peer(9), make(invoke_id));
            assert!(rx.try_recv().unwrap().unwrap().is_err(), "case {}", i);
        }
        assert_eq!(h.tsm.active_client_transactions(), 0);
    }

    #[test]
    fn distinct_invoke_ids_for_concurrent_requests() {
        let mut h = harness(TsmConfig::default());
        let mut seen = std::collections::HashSet::new();
        let mut receivers = Vec::new();
        for _ in 0..10 {
            let (responder, rx) = completion();
            h.tsm.send_request(peer(1), 12, vec![], responder);
            receivers.push(rx);
            assert!(seen.insert(h.next_out().apdu.invoke_id().unwrap()));
        }
        assert_eq!(h.tsm.active_client_transactions(), 10);
    }

    #[test]
    fn timeout_retries_then_fails() {
        let config = TsmConfig { retries: 2, ..TsmConfig::default() };
        let mut h = harness(config);
        let (responder, mut rx) = completion();
        h.tsm.send_request(peer(1), 12, vec![0xAA], responder);
        let first = h.next_out();

        // Two retries resend the identical APDU.
        for _ in 0..2 {
            h.fire_last_timer();
            assert_eq!(h.next_out().apdu, first.apdu);
        }
        // Third expiry is terminal: Abort plus a Timeout completion.
        h.fire_last_timer();
        let abort = h.next_out();
        assert_matches!(abort.apdu, Apdu::Abort { .. });
        assert_eq!(rx.try_recv().unwrap().unwrap(), Err(TransactionError::Timeout));
        assert_eq!(h.tsm.active_client_transactions(), 0);
    }

    #[test]
    fn cancel_aborts_and_wakes_caller() {
        let mut h = harness(TsmConfig::default());
        let (responder, mut rx) = completion();
        h.tsm.send_request(peer(1), 12, vec![], responder);
        let invoke_id = h.next_out().apdu.invoke_id().unwrap();
        h.tsm.cancel(peer(1), invoke_id);
        assert_matches!(h.next_out().apdu, Apdu::Abort { .. });
        assert_eq!(rx.try_recv().unwrap().unwrap(), Err(TransactionError::Cancelled));
    }

    #[test]
    fn cancel_all_drains_both_roles() {
        let mut h = harness(TsmConfig::default());
        let (responder, mut rx) = completion();
        h.tsm.send_request(peer(1), 12, vec![], responder);
        let _ = h.next_out();
        h.tsm.handle_apdu(
            peer(2),
            Apdu::ConfirmedRequest(ConfirmedRequest::new(7, 15, vec![])),
        );
        assert_eq!(h.tsm.active_server_transactions(), 1);

        h.tsm.cancel_all();
        assert_eq!(rx.try_recv().unwrap().unwrap(), Err(TransactionError::Cancelled));
        assert_eq!(h.tsm.active_client_transactions(), 0);
        assert_eq!(h.tsm.active_server_transactions(), 0);
    }

    #[test]
    fn inbound_request_flows_to_service_layer_and_back() {
        let mut h = harness(TsmConfig::default());
        h.tsm.handle_apdu(
            peer(3),
            Apdu::ConfirmedRequest(ConfirmedRequest::new(42, 12, vec![0x0C])),
        );
        let inbound = h.in_rx.try_next().unwrap().unwrap();
        assert_eq!(inbound.service_choice, 12);
        assert_eq!(inbound.service_data, [0x0C]);

        h.tsm.respond(inbound.key, 12, Response::Complex(vec![0x44, 0x42, 0x90, 0, 0]));
        let out = h.next_out();
        assert_matches!(out.apdu, Apdu::ComplexAck(ref ack) if ack.invoke_id == 42);
        assert_eq!(h.tsm.active_server_transactions(), 0);
    }

    #[test]
    fn duplicate_confirmed_request_ignored_while_pending() {
        let mut h = harness(TsmConfig::default());
        let req = Apdu::ConfirmedRequest(ConfirmedRequest::new(42, 12, vec![]));
        h.tsm.handle_apdu(peer(3), req.clone());
        h.tsm.handle_apdu(peer(3), req);
        assert_eq!(h.tsm.active_server_transactions(), 1);
        let _ = h.in_rx.try_next().unwrap().unwrap();
        assert!(h.in_rx.try_next().is_err());
    }

    #[test]
    fn segmented_request_requires_peer_support() {
        let mut h = harness(TsmConfig::default());
        let (responder, mut rx) = completion();
        // No device info: conservative 128-byte limit, no segmentation.
        h.tsm.send_request(peer(1), 12, vec![0; 500], responder);
        assert_eq!(
            rx.try_recv().unwrap().unwrap(),
            Err(TransactionError::SegmentationNotSupported)
        );
        h.no_out();
    }

    #[test]
    fn segmented_request_walks_the_window() {
        let mut h = harness(TsmConfig::default());
        h.tsm.device_info.record(peer(1), MaxApdu::Up480, true);
        let (responder, _rx) = completion();
        // 474-byte segments; 1000 bytes → 3 segments.
        h.tsm.send_request(peer(1), 12, vec![0xEE; 1000], responder);

        let first = h.next_out();
        let invoke_id = first.apdu.invoke_id().unwrap();
        assert_matches!(
            &first.apdu,
            Apdu::ConfirmedRequest(req) => {
                let seg = req.segment.unwrap();
                assert_eq!(seg.sequence_number, 0);
                assert!(req.more_follows);
            }
        );
        h.no_out();

        // Ack segment 0 with window 2: segments 1 and 2 follow.
        h.tsm.handle_apdu(peer(1), Apdu::SegmentAck {
            negative_ack: false,
            from_server: true,
            invoke_id,
            sequence_number: 0,
            actual_window_size: 2,
        });
        let s1 = h.next_out();
        let s2 = h.next_out();
        assert_matches!(&s1.apdu, Apdu::ConfirmedRequest(r) if r.segment.unwrap().sequence_number == 1);
        assert_matches!(
            &s2.apdu,
            Apdu::ConfirmedRequest(r) => {
                assert_eq!(r.segment.unwrap().sequence_number, 2);
                assert!(!r.more_follows);
            }
        );
        h.no_out();

        // Final ack moves the transaction to awaiting the response.
        h.tsm.handle_apdu(peer(1), Apdu::SegmentAck {
            negative_ack: false,
            from_server: true,
            invoke_id,
            sequence_number: 2,
            actual_window_size: 2,
        });
        h.no_out();
        assert_eq!(h.tsm.active_client_transactions(), 1);
    }

    #[test]
    fn segment_timeout_retransmits_then_fails() {
        let config = TsmConfig { retries: 1, ..TsmConfig::default() };
        let mut h = harness(config);
        h.tsm.device_info.record(peer(1), MaxApdu::Up480, true);
        let (responder, mut rx) = completion();
        h.tsm.send_request(peer(1), 12, vec![0xEE; 1000], responder);
        let first = h.next_out();

        // No SegmentACK arrives: the opening segment goes out again.
        h.fire_last_timer();
        assert_eq!(h.next_out().apdu, first.apdu);
        // The retry budget is spent; the next expiry is terminal.
        h.fire_last_timer();
        assert_matches!(h.next_out().apdu, Apdu::Abort { .. });
        assert_eq!(rx.try_recv().unwrap().unwrap(), Err(TransactionError::Timeout));
        assert_eq!(h.tsm.active_client_transactions(), 0);
    }

    #[test]
    fn segmented_response_reassembles_in_order() {
        let mut h = harness(TsmConfig::default());
        let (responder, mut rx) = completion();
        h.tsm.send_request(peer(1), 14, vec![], responder);
        let invoke_id = h.next_out().apdu.invoke_id().unwrap();

        let seg = |seq: u8, more: bool, data: &[u8]| {
            Apdu::ComplexAck(ComplexAck {
                invoke_id,
                segment: Some(SegmentInfo { sequence_number: seq, proposed_window_size: 4 }),
                more_follows: more,
                service_choice: 14,
                service_data: data.to_vec(),
            })
        };

        h.tsm.handle_apdu(peer(1), seg(0, true, b"AAA"));
        // Initial segment acked immediately.
        assert_matches!(h.next_out().apdu, Apdu::SegmentAck { sequence_number: 0, .. });
        h.tsm.handle_apdu(peer(1), seg(1, true, b"BBB"));
        h.tsm.handle_apdu(peer(1), seg(2, false, b"CCC"));
        // Final segment acked and the reassembled payload delivered.
        assert_matches!(
            h.next_out().apdu,
            Apdu::SegmentAck { sequence_number: 2, negative_ack: false, .. }
        );
        assert_eq!(
            rx.try_recv().unwrap().unwrap(),
            Ok(ServiceAck::Complex { service_choice: 14, data: b"AAABBBCCC".to_vec() })
        );
    }

    #[test]
    fn out_of_order_response_segment_naks() {
        let mut h = harness(TsmConfig::default());
        let (responder, _rx) = completion();
        h.tsm.send_request(peer(1), 14, vec![], responder);
        let invoke_id = h.next_out().apdu.invoke_id().unwrap();

        let seg = |seq: u8, more: bool| {
            Apdu::ComplexAck(ComplexAck {
                invoke_id,
                segment: Some(SegmentInfo { sequence_number: seq, proposed_window_size: 4 }),
                more_follows: more,
                service_choice: 14,
                service_data: vec![seq],
            })
        };
        h.tsm.handle_apdu(peer(1), seg(0, true));
        let _ack0 = h.next_out();
        // Segment 2 arrives before 1.
        h.tsm.handle_apdu(peer(1), seg(2, true));
        assert_matches!(
            h.next_out().apdu,
            Apdu::SegmentAck { negative_ack: true, sequence_number: 0, .. }
        );
    }

    #[test]
    fn segmented_inbound_request_reassembles() {
        let mut h = harness(TsmConfig::default());
        let seg = |seq: u8, more: bool, data: &[u8]| {
            Apdu::ConfirmedRequest(ConfirmedRequest {
                segment: Some(SegmentInfo { sequence_number: seq, proposed_window_size: 4 }),
                more_follows: more,
                ..ConfirmedRequest::new(9, 16, data.to_vec())
            })
        };
        h.tsm.handle_apdu(peer(5), seg(0, true, b"111"));
        assert_matches!(
            h.next_out().apdu,
            Apdu::SegmentAck { from_server: true, sequence_number: 0, .. }
        );
        h.tsm.handle_apdu(peer(5), seg(1, true, b"222"));
        h.tsm.handle_apdu(peer(5), seg(2, false, b"333"));
        assert_matches!(h.next_out().apdu, Apdu::SegmentAck { sequence_number: 2, .. });
        let inbound = h.in_rx.try_next().unwrap().unwrap();
        assert_eq!(inbound.service_data, b"111222333");
        assert_eq!(inbound.service_choice, 16);
    }

    #[test]
    fn segmented_response_sent_when_data_exceeds_peer_max() {
        let mut h = harness(TsmConfig::default());
        // Peer advertises a 480-byte APDU and accepts segmented responses.
        let req = ConfirmedRequest {
            max_apdu: MaxApdu::Up480,
            segmented_response_accepted: true,
            ..ConfirmedRequest::new(11, 14, vec![])
        };
        h.tsm.handle_apdu(peer(6), Apdu::ConfirmedRequest(req));
        let inbound = h.in_rx.try_next().unwrap().unwrap();

        h.tsm.respond(inbound.key, 14, Response::Complex(vec![0xAB; 1000]));
        let first = h.next_out();
        assert_matches!(
            &first.apdu,
            Apdu::ComplexAck(ack) => {
                assert_eq!(ack.segment.unwrap().sequence_number, 0);
                assert!(ack.more_follows);
            }
        );
        h.no_out();

        // Client acks segment 0; the rest follows within the window.
        h.tsm.handle_apdu(peer(6), Apdu::SegmentAck {
            negative_ack: false,
            from_server: false,
            invoke_id: 11,
            sequence_number: 0,
            actual_window_size: 4,
        });
        let s1 = h.next_out();
        let s2 = h.next_out();
        assert_matches!(&s1.apdu, Apdu::ComplexAck(a) if a.segment.unwrap().sequence_number == 1);
        assert_matches!(&s2.apdu, Apdu::ComplexAck(a) if !a.more_follows);

        h.tsm.handle_apdu(peer(6), Apdu::SegmentAck {
            negative_ack: false,
            from_server: false,
            invoke_id: 11,
            sequence_number: 2,
            actual_window_size: 4,
        });
        assert_eq!(h.tsm.active_server_transactions(), 0);
    }

    #[test]
    fn oversized_response_without_segmentation_aborts() {
        let mut h = harness(TsmConfig::default());
        let req = ConfirmedRequest {
            max_apdu: MaxApdu::Up128,
            segmented_response_accepted: false,
            ..ConfirmedRequest::new(11, 14, vec![])
        };
        h.tsm.handle_apdu(peer(6), Apdu::ConfirmedRequest(req));
        let inbound = h.in_rx.try_next().unwrap().unwrap();
        h.tsm.respond(inbound.key, 14, Response::Complex(vec![0xAB; 1000]));
        assert_matches!(
            h.next_out().apdu,
            Apdu::Abort { reason: abort_reason::SEGMENTATION_NOT_SUPPORTED, .. }
        );
        assert_eq!(h.tsm.active_server_transactions(), 0);
    }

    #[test]
    fn reassembly_overflow_aborts_with_buffer_overflow() {
        let config = TsmConfig::default();
        let mut h = harness(config);
        let big = vec![0u8; 600_000];
        let seg = |seq: u8, more: bool, data: Vec<u8>| {
            Apdu::ConfirmedRequest(ConfirmedRequest {
                segment: Some(SegmentInfo { sequence_number: seq, proposed_window_size: 1 }),
                more_follows: more,
                ..ConfirmedRequest::new(9, 16, data)
            })
        };
        h.tsm.handle_apdu(peer(5), seg(0, true, big.clone()));
        let _ack = h.next_out();
        h.tsm.handle_apdu(peer(5), seg(1, true, big.clone()));
        let _ack = h.next_out();
        // Third 600 KB segment blows the 1 MiB cap.
        h.tsm.handle_apdu(peer(5), seg(2, true, big));
        assert_matches!(
            h.next_out().apdu,
            Apdu::Abort { reason: abort_reason::BUFFER_OVERFLOW, .. }
        );
        assert_eq!(h.tsm.active_server_transactions(), 0);
    }

    #[test]
    fn device_info_cache_is_fifo_bounded() {
        let mut cache = DeviceInfoCache { capacity: 3, ..DeviceInfoCache::default() };
        for n in 1..=4u8 {
            cache.record(peer(n), MaxApdu::Up1476, true);
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&peer(1)).is_none());
        assert!(cache.get(&peer(4)).is_some());
        // Re-recording an existing peer does not evict.
        cache.record(peer(2), MaxApdu::Up128, false);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&peer(2)).unwrap().max_apdu, MaxApdu::Up128);
    }

    #[test]
    fn stale_timer_events_ignored() {
        let mut h = harness(TsmConfig::default());
        let (responder, mut rx) = completion();
        h.tsm.send_request(peer(1), 12, vec![], responder);
        let invoke_id = h.next_out().apdu.invoke_id().unwrap();
        // An event with a bogus id must not touch the transaction.
        h.tsm.handle_timeout(TimedEvent {
            id: 9999,
            event: TsmEvent::ClientTimeout { peer: peer(1), invoke_id },
        });
        assert!(rx.try_recv().unwrap().is_none());
        assert_eq!(h.tsm.active_client_transactions(), 1);
    }
}
