// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The application layer: one long-lived [`Application`] owns every engine
//! and runs the event loop; an [`ApplicationHandle`] is the typed client
//! API other tasks talk through.
//!
//! All protocol state mutates on the loop. Transports feed frames in
//! through channels, the TSM's outgoing APDUs and timeouts flow back the
//! same way, and handle calls are messages with oneshot completions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use log::{debug, info, warn};

use crate::addr::Address;
use crate::config::DeviceConfig;
use crate::cov::{CovEngine, SubscriptionKey};
use crate::datalink::{PortId, ReceivedFrame, TransportPort};
use crate::error::{
    error_class, error_code, LinkError, ServiceError, TransactionError,
};
use crate::event::{EventEngine, EventState, NotificationClass, WallClock};
use crate::network::{IncomingApdu, NetworkEngine};
use crate::object::{Change, ObjectStore};
use crate::service::codecs::{self, ServiceCodec};
use crate::service::{confirmed, unconfirmed, RequestHead, ServiceRegistry};
use crate::transaction::{
    InboundRequest, OutgoingApdu, Response, ServiceAck, Tsm, TsmEvent,
};
use crate::types::{property, NetworkPriority, ObjectId, PropertyId};
use crate::util::responder::Responder;
use crate::util::sink::{self, UnboundedSink};
use crate::util::timer::{self, TimedEvent};
use crate::util::timing_safe_eq;
use crate::wire::apdu::{Apdu, MaxApdu};
use crate::wire::value::{TlvWriter, Value};
use crate::wire::{Decodable, Encodable};

const LOG: &str = "bacnet::app";

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Communication gating set by DeviceCommunicationControl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommState {
    Enabled,
    /// No responses, no initiation (except DCC and ReinitializeDevice).
    Disabled { until: Option<Instant> },
    /// Responses allowed, initiation suppressed.
    InitiationDisabled { until: Option<Instant> },
}

/// An outbound message a service handler queued.
enum Outbound {
    Unconfirmed { dest: Address, choice: u8, data: Vec<u8> },
    Confirmed { peer: Address, choice: u8, data: Vec<u8> },
}

/// State the service handlers operate on.
pub struct AppState {
    device: ObjectId,
    vendor_id: u16,
    max_apdu: MaxApdu,
    password: Option<String>,
    pub store: ObjectStore,
    pub cov: CovEngine,
    pub events: EventEngine,
    comm: CommState,
    outbox: Vec<Outbound>,
    /// Device-info learned from I-Am, drained into the TSM cache.
    heard_iam: Vec<(Address, codecs::IAmRequest)>,
    discovered: Vec<(Address, codecs::IAmRequest)>,
    received_cov: Vec<codecs::CovNotification>,
    received_events: Vec<codecs::EventNotification>,
    vt_sessions: HashMap<u8, u8>,
    next_vt_session: u8,
}

impl AppState {
    /// Routes one property change through COV first, then the event
    /// engine; the relative order is a stated contract.
    fn apply_change(&mut self, change: &Change) {
        let now = Instant::now();
        let clock = WallClock::now();
        for dispatch in self.cov.on_change(change, now) {
            let data = dispatch.notification.encode();
            let choice = if dispatch.confirmed {
                self.outbox.push(Outbound::Confirmed {
                    peer: dispatch.subscriber,
                    choice: confirmed::COV_NOTIFICATION,
                    data,
                });
                continue;
            } else {
                unconfirmed::COV_NOTIFICATION
            };
            self.outbox.push(Outbound::Unconfirmed { dest: dispatch.subscriber, choice, data });
        }
        for dispatch in self.events.on_change(change, now, &clock) {
            let data = dispatch.notification.encode();
            if dispatch.confirmed {
                self.outbox.push(Outbound::Confirmed {
                    peer: dispatch.recipient,
                    choice: confirmed::EVENT_NOTIFICATION,
                    data,
                });
            } else {
                self.outbox.push(Outbound::Unconfirmed {
                    dest: dispatch.recipient,
                    choice: unconfirmed::EVENT_NOTIFICATION,
                    data,
                });
            }
        }
    }

    fn check_password(&self, offered: Option<&crate::wire::primitives::CharacterString>) -> bool {
        match (&self.password, offered) {
            (None, _) => true,
            (Some(expected), Some(offered)) => {
                timing_safe_eq(expected.as_bytes(), offered.text.as_bytes())
            }
            (Some(_), None) => false,
        }
    }

    fn responses_allowed(&self, service_choice: u8) -> bool {
        match self.comm {
            CommState::Enabled | CommState::InitiationDisabled { .. } => true,
            CommState::Disabled { .. } => matches!(
                service_choice,
                confirmed::DEVICE_COMMUNICATION_CONTROL | confirmed::REINITIALIZE_DEVICE
            ),
        }
    }

    fn initiation_allowed(&self) -> bool {
        matches!(self.comm, CommState::Enabled)
    }
}

/// Requests the handle sends to the loop.
enum ApiRequest {
    SendConfirmed {
        peer: Address,
        choice: u8,
        data: Vec<u8>,
        responder: Responder<Result<ServiceAck, TransactionError>>,
    },
    SendUnconfirmed {
        dest: Address,
        choice: u8,
        data: Vec<u8>,
    },
    AddObject {
        object: ObjectId,
        properties: HashMap<PropertyId, Vec<Value>>,
        responder: Responder<()>,
    },
    DefineNotificationClass {
        number: u32,
        class: NotificationClass,
        responder: Responder<()>,
    },
    WriteLocal {
        object: ObjectId,
        property: PropertyId,
        values: Vec<Value>,
        responder: Responder<Result<(), ServiceError>>,
    },
    ReadLocal {
        object: ObjectId,
        property: PropertyId,
        responder: Responder<Result<Vec<Value>, ServiceError>>,
    },
    GetDiscovered {
        responder: Responder<Vec<(Address, codecs::IAmRequest)>>,
    },
    GetReceivedCov {
        responder: Responder<Vec<codecs::CovNotification>>,
    },
    GetReceivedEvents {
        responder: Responder<Vec<codecs::EventNotification>>,
    },
    Shutdown {
        responder: Responder<()>,
    },
}

/// Cheap-to-clone client API over a running [`Application`].
#[derive(Clone)]
pub struct ApplicationHandle {
    api: UnboundedSink<ApiRequest>,
}

impl ApplicationHandle {
    /// Issues any confirmed service and waits for the terminal outcome.
    pub async fn send_confirmed(
        &self,
        peer: Address,
        choice: u8,
        data: Vec<u8>,
    ) -> Result<ServiceAck, TransactionError> {
        let (responder, receiver) = Responder::new();
        self.api.send(ApiRequest::SendConfirmed { peer, choice, data, responder });
        receiver.await.unwrap_or(Err(TransactionError::Cancelled))
    }

    pub async fn read_property(
        &self,
        peer: Address,
        object: ObjectId,
        property: PropertyId,
    ) -> Result<Vec<Value>, TransactionError> {
        let request = codecs::ReadPropertyRequest { object, property, array_index: None };
        let ack = self
            .send_confirmed(peer, confirmed::READ_PROPERTY, request.encode())
            .await?;
        match ack {
            ServiceAck::Complex { data, .. } => codecs::ReadPropertyAck::decode(&data)
                .map(|ack| ack.value)
                .map_err(|_| TransactionError::Rejected(
                    crate::wire::apdu::reject_reason::INVALID_TAG,
                )),
            ServiceAck::Simple { .. } => Err(TransactionError::Rejected(
                crate::wire::apdu::reject_reason::MISSING_REQUIRED_PARAMETER,
            )),
        }
    }

    pub async fn write_property(
        &self,
        peer: Address,
        object: ObjectId,
        property: PropertyId,
        values: Vec<Value>,
        priority: Option<u8>,
    ) -> Result<(), TransactionError> {
        let request = codecs::WritePropertyRequest {
            object,
            property,
            array_index: None,
            value: values,
            priority,
        };
        self.send_confirmed(peer, confirmed::WRITE_PROPERTY, request.encode())
            .await
            .map(|_| ())
    }

    pub async fn subscribe_cov(
        &self,
        peer: Address,
        process_id: u32,
        object: ObjectId,
        confirmed_notifications: bool,
        lifetime_seconds: u32,
    ) -> Result<(), TransactionError> {
        let request = codecs::SubscribeCovRequest {
            process_id,
            object,
            issue_confirmed: Some(confirmed_notifications),
            lifetime_seconds: Some(lifetime_seconds),
        };
        self.send_confirmed(peer, confirmed::SUBSCRIBE_COV, request.encode())
            .await
            .map(|_| ())
    }

    /// Broadcasts (or unicasts) a Who-Is.
    pub fn who_is(&self, dest: Address, low: Option<u32>, high: Option<u32>) {
        let request = codecs::WhoIsRequest { low_limit: low, high_limit: high };
        self.api.send(ApiRequest::SendUnconfirmed {
            dest,
            choice: unconfirmed::WHO_IS,
            data: request.encode(),
        });
    }

    /// Devices heard from (I-Am) so far.
    pub async fn discovered_devices(&self) -> Vec<(Address, codecs::IAmRequest)> {
        let (responder, receiver) = Responder::new();
        self.api.send(ApiRequest::GetDiscovered { responder });
        receiver.await.unwrap_or_default()
    }

    pub async fn received_cov_notifications(&self) -> Vec<codecs::CovNotification> {
        let (responder, receiver) = Responder::new();
        self.api.send(ApiRequest::GetReceivedCov { responder });
        receiver.await.unwrap_or_default()
    }

    pub async fn received_event_notifications(&self) -> Vec<codecs::EventNotification> {
        let (responder, receiver) = Responder::new();
        self.api.send(ApiRequest::GetReceivedEvents { responder });
        receiver.await.unwrap_or_default()
    }

    /// Server-side setup: add a local object.
    pub async fn add_object(
        &self,
        object: ObjectId,
        properties: HashMap<PropertyId, Vec<Value>>,
    ) {
        let (responder, receiver) = Responder::new();
        self.api.send(ApiRequest::AddObject { object, properties, responder });
        let _ = receiver.await;
    }

    pub async fn define_notification_class(&self, number: u32, class: NotificationClass) {
        let (responder, receiver) = Responder::new();
        self.api.send(ApiRequest::DefineNotificationClass { number, class, responder });
        let _ = receiver.await;
    }

    /// Local property write, driving the COV and event pipelines.
    pub async fn write_local(
        &self,
        object: ObjectId,
        property: PropertyId,
        values: Vec<Value>,
    ) -> Result<(), ServiceError> {
        let (responder, receiver) = Responder::new();
        self.api.send(ApiRequest::WriteLocal { object, property, values, responder });
        receiver.await.unwrap_or(Err(ServiceError::new(
            error_class::DEVICE,
            error_code::OTHER,
        )))
    }

    pub async fn read_local(
        &self,
        object: ObjectId,
        property: PropertyId,
    ) -> Result<Vec<Value>, ServiceError> {
        let (responder, receiver) = Responder::new();
        self.api.send(ApiRequest::ReadLocal { object, property, responder });
        receiver.await.unwrap_or(Err(ServiceError::new(
            error_class::DEVICE,
            error_code::OTHER,
        )))
    }

    /// Stops the application: every pending transaction completes with
    /// `Cancelled`, ports stop, tasks end.
    pub async fn shutdown(&self) {
        let (responder, receiver) = Responder::new();
        self.api.send(ApiRequest::Shutdown { responder });
        let _ = receiver.await;
    }
}

/// The assembled stack.
pub struct Application {
    state: AppState,
    registry: ServiceRegistry<AppState>,
    network: NetworkEngine,
    tsm: Tsm,
    frames_sink: UnboundedSink<ReceivedFrame>,
    frames_rx: UnboundedReceiver<ReceivedFrame>,
    apdu_rx: UnboundedReceiver<IncomingApdu>,
    tsm_out_rx: UnboundedReceiver<OutgoingApdu>,
    inbound_rx: UnboundedReceiver<InboundRequest>,
    timeout_rx: UnboundedReceiver<TimedEvent<TsmEvent>>,
    timer_driver: tokio::task::JoinHandle<()>,
    api_rx: UnboundedReceiver<ApiRequest>,
    api_sink: UnboundedSink<ApiRequest>,
}

impl Application {
    pub fn new(config: DeviceConfig) -> Result<Application, crate::error::ConfigError> {
        config.validate()?;
        let device = ObjectId::device(config.instance_number)
            .ok_or(crate::error::ConfigError::InstanceOutOfRange(config.instance_number))?;

        let (apdu_sink, apdu_rx) = sink::unbounded("application");
        let (frames_sink, frames_rx) = sink::unbounded("network");
        let (tsm_out_sink, tsm_out_rx) = sink::unbounded("tsm-out");
        let (inbound_sink, inbound_rx) = sink::unbounded("tsm-inbound");
        let (api_sink, api_rx) = sink::unbounded("api");
        let (timeout_sink, timeout_rx) = sink::unbounded("tsm-timeouts");

        let (tsm_timer, tsm_time_stream) = timer::create_timer();
        let timer_driver = tokio::spawn(timer::drive(tsm_time_stream, move |event| {
            timeout_sink.send(event);
        }));

        let tsm = Tsm::new(config.tsm_config(), tsm_timer, tsm_out_sink, inbound_sink);
        let network = NetworkEngine::new(apdu_sink);

        let mut state = AppState {
            device,
            vendor_id: config.vendor_id,
            max_apdu: MaxApdu::fitting(config.max_apdu_length as usize),
            password: config.password.as_ref().map(|s| s.0.clone()),
            store: ObjectStore::new(),
            cov: CovEngine::new(device),
            events: EventEngine::new(device),
            comm: CommState::Enabled,
            outbox: Vec::new(),
            heard_iam: Vec::new(),
            discovered: Vec::new(),
            received_cov: Vec::new(),
            received_events: Vec::new(),
            vt_sessions: HashMap::new(),
            next_vt_session: 1,
        };
        let device_properties = {
            let mut p = HashMap::new();
            p.insert(property::OBJECT_IDENTIFIER, vec![Value::ObjectId(device)]);
            p.insert(property::OBJECT_NAME, vec![Value::string(format!("device-{}", device.instance()))]);
            p.insert(property::OBJECT_TYPE, vec![Value::Enumerated(8)]);
            p
        };
        state.store.insert(device, device_properties);

        let mut registry = ServiceRegistry::new();
        register_default_services(&mut registry);

        Ok(Application {
            state,
            registry,
            network,
            tsm,
            frames_sink,
            frames_rx,
            apdu_rx,
            tsm_out_rx,
            inbound_rx,
            timeout_rx,
            timer_driver,
            api_rx,
            api_sink,
        })
    }

    /// Registers a data-link port; must precede [`Application::run`].
    pub fn add_port(&mut self, network_number: u16, port: Box<dyn TransportPort>) -> PortId {
        self.network.add_port(network_number, port)
    }

    /// Builds and registers every port named by the configuration's
    /// `router_ports` table.
    pub fn add_configured_ports(
        &mut self,
        config: &DeviceConfig,
    ) -> Result<Vec<PortId>, crate::error::ConfigError> {
        use crate::config::TransportConfig;
        use crate::datalink::bip4::{Bip4Config, Bip4Port, ForeignDeviceConfig};
        use crate::datalink::bip6::{Bip6Config, Bip6Port};

        let mut ids = Vec::new();
        for entry in &config.router_ports {
            let port: Box<dyn TransportPort> = match &entry.transport {
                TransportConfig::Bip4 { bind, broadcast } => {
                    Box::new(Bip4Port::new(Bip4Config {
                        bind: *bind,
                        broadcast: *broadcast,
                        foreign_device: config.bbmd_address.map(|bbmd| ForeignDeviceConfig {
                            bbmd,
                            ttl_seconds: config.bbmd_ttl,
                        }),
                        bbmd: None,
                    }))
                }
                TransportConfig::Bip6 { bind } => Box::new(Bip6Port::new(Bip6Config {
                    bind: *bind,
                    // The low octets of the instance make a stable VMAC.
                    vmac: [
                        (config.instance_number >> 16) as u8,
                        (config.instance_number >> 8) as u8,
                        config.instance_number as u8,
                    ],
                    ..Bip6Config::default()
                })),
                #[cfg(target_os = "linux")]
                TransportConfig::Ethernet { interface } => {
                    Box::new(crate::datalink::ethernet::EthernetPort::new(
                        crate::datalink::ethernet::EthernetConfig {
                            interface: interface.clone(),
                        },
                    ))
                }
                #[cfg(not(target_os = "linux"))]
                TransportConfig::Ethernet { .. } => {
                    return Err(crate::error::ConfigError::InvalidOption {
                        name: "transport",
                        reason: "raw ethernet requires linux".into(),
                    });
                }
                TransportConfig::Sc { primary_uri, secondary_uri } => {
                    let mut sc = config
                        .sc_config()?
                        .unwrap_or_else(crate::sc::ScConfig::default);
                    sc.primary_uri = primary_uri.clone();
                    if secondary_uri.is_some() {
                        sc.secondary_uri = secondary_uri.clone();
                    }
                    Box::new(crate::sc::ScPort::new(sc))
                }
            };
            ids.push(self.network.add_port(entry.network, port));
        }
        Ok(ids)
    }

    /// Registry access for application-specific handlers.
    pub fn registry_mut(&mut self) -> &mut ServiceRegistry<AppState> {
        &mut self.registry
    }

    pub fn handle(&self) -> ApplicationHandle {
        ApplicationHandle { api: self.api_sink.clone() }
    }

    /// Runs the event loop until shutdown.
    pub async fn run(mut self) -> Result<(), LinkError> {
        self.network.start(self.frames_sink.clone())?;
        info!(target: LOG, "device {} up", self.state.device);

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        let mut shutdown_responder = None;
        loop {
            tokio::select! {
                Some(frame) = self.frames_rx.next() => {
                    self.network.handle_frame(frame);
                }
                Some(incoming) = self.apdu_rx.next() => {
                    self.on_apdu(incoming);
                }
                Some(outgoing) = self.tsm_out_rx.next() => {
                    let bytes = outgoing.apdu.to_bytes();
                    if let Err(e) = self.network.send_apdu(
                        &outgoing.dest,
                        &bytes,
                        NetworkPriority::Normal,
                        outgoing.expect_reply,
                    ) {
                        warn!(target: LOG, "send to {} failed: {}", outgoing.dest, e);
                    }
                }
                Some(inbound) = self.inbound_rx.next() => {
                    self.on_inbound(inbound);
                }
                Some(timeout) = self.timeout_rx.next() => {
                    self.tsm.handle_timeout(timeout);
                }
                Some(api) = self.api_rx.next() => {
                    if let Some(responder) = self.on_api(api) {
                        shutdown_responder = Some(responder);
                        break;
                    }
                }
                _ = sweep.tick() => {
                    self.sweep();
                }
            }
            self.drain_state();
        }

        // Ordered teardown: transactions first (wakes every caller with
        // Cancelled), then ports, then the timer driver.
        self.tsm.cancel_all();
        self.drain_state();
        while let Ok(Some(outgoing)) = self.tsm_out_rx.try_next() {
            let bytes = outgoing.apdu.to_bytes();
            let _ = self.network.send_apdu(
                &outgoing.dest,
                &bytes,
                NetworkPriority::Normal,
                false,
            );
        }
        self.network.stop();
        self.timer_driver.abort();
        if let Some(responder) = shutdown_responder {
            responder.respond(());
        }
        info!(target: LOG, "device {} stopped", self.state.device);
        Ok(())
    }

    fn on_apdu(&mut self, incoming: IncomingApdu) {
        let apdu = match Apdu::decode(&incoming.apdu) {
            Ok(apdu) => apdu,
            Err(e) => {
                warn!(target: LOG, "dropping undecodable APDU from {}: {}",
                    incoming.source, e);
                return;
            }
        };
        match apdu {
            Apdu::UnconfirmedRequest { service_choice, service_data } => {
                if !self.state.responses_allowed(u8::MAX) {
                    debug!(target: LOG, "communication disabled; dropping unconfirmed {}",
                        service_choice);
                    return;
                }
                let head = RequestHead { source: incoming.source };
                self.registry.dispatch_unconfirmed(
                    &mut self.state,
                    &head,
                    service_choice,
                    &service_data,
                );
            }
            Apdu::ConfirmedRequest(ref request)
                if !self.state.responses_allowed(request.service_choice) =>
            {
                debug!(target: LOG, "communication disabled; dropping confirmed {}",
                    request.service_choice);
            }
            other => self.tsm.handle_apdu(incoming.source, other),
        }
    }

    fn on_inbound(&mut self, inbound: InboundRequest) {
        let head = RequestHead { source: inbound.key.peer };
        let response = self.registry.dispatch_confirmed(
            &mut self.state,
            &head,
            inbound.service_choice,
            &inbound.service_data,
        );
        self.tsm.respond(inbound.key, inbound.service_choice, response);
    }

    /// Returns the responder when this request was a shutdown.
    fn on_api(&mut self, api: ApiRequest) -> Option<Responder<()>> {
        match api {
            ApiRequest::SendConfirmed { peer, choice, data, responder } => {
                if !self.state.initiation_allowed() {
                    responder.respond(Err(TransactionError::Cancelled));
                    return None;
                }
                self.tsm.send_request(peer, choice, data, responder);
            }
            ApiRequest::SendUnconfirmed { dest, choice, data } => {
                if self.state.initiation_allowed() {
                    self.send_unconfirmed(dest, choice, data);
                }
            }
            ApiRequest::AddObject { object, properties, responder } => {
                if let Some(enrollment) =
                    EventEngine::intrinsic_enrollment(object, &properties)
                {
                    self.state.events.add_enrollment(enrollment, Instant::now());
                }
                self.state.store.insert(object, properties);
                responder.respond(());
            }
            ApiRequest::DefineNotificationClass { number, class, responder } => {
                self.state.events.define_class(number, class);
                responder.respond(());
            }
            ApiRequest::WriteLocal { object, property, values, responder } => {
                let result = self
                    .state
                    .store
                    .write_unchecked(object, property, values)
                    .map(|change| self.state.apply_change(&change));
                responder.respond(result);
            }
            ApiRequest::ReadLocal { object, property, responder } => {
                let result = self.state.store.read(&object, property).cloned();
                responder.respond(result);
            }
            ApiRequest::GetDiscovered { responder } => {
                responder.respond(self.state.discovered.clone());
            }
            ApiRequest::GetReceivedCov { responder } => {
                responder.respond(std::mem::take(&mut self.state.received_cov));
            }
            ApiRequest::GetReceivedEvents { responder } => {
                responder.respond(std::mem::take(&mut self.state.received_events));
            }
            ApiRequest::Shutdown { responder } => return Some(responder),
        }
        None
    }

    fn send_unconfirmed(&mut self, dest: Address, choice: u8, data: Vec<u8>) {
        let apdu = Apdu::UnconfirmedRequest { service_choice: choice, service_data: data };
        let bytes = apdu.to_bytes();
        if let Err(e) =
            self.network.send_apdu(&dest, &bytes, NetworkPriority::Normal, false)
        {
            warn!(target: LOG, "unconfirmed send to {} failed: {}", dest, e);
        }
    }

    /// Applies queued side effects of handlers and TSM interplay.
    fn drain_state(&mut self) {
        for (peer, iam) in std::mem::take(&mut self.state.heard_iam) {
            self.tsm.device_info.record(
                peer,
                MaxApdu::fitting(iam.max_apdu_length as usize),
                iam.segmentation_supported != codecs::segmentation::NONE,
            );
        }
        for outbound in std::mem::take(&mut self.state.outbox) {
            match outbound {
                Outbound::Unconfirmed { dest, choice, data } => {
                    if self.state.initiation_allowed() {
                        self.send_unconfirmed(dest, choice, data);
                    }
                }
                Outbound::Confirmed { peer, choice, data } => {
                    if !self.state.initiation_allowed() {
                        continue;
                    }
                    let (responder, _receiver) = Responder::new();
                    // Retry/timeout semantics come from the TSM; failures
                    // surface in its logs.
                    self.tsm.send_request(peer, choice, data, responder);
                }
            }
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        self.network.sweep(now);
        self.state.cov.sweep(now);
        let clock = WallClock::now();
        let dispatches = self.state.events.on_tick(now, &clock);
        if !dispatches.is_empty() {
            for dispatch in dispatches {
                let data = dispatch.notification.encode();
                if dispatch.confirmed {
                    self.state.outbox.push(Outbound::Confirmed {
                        peer: dispatch.recipient,
                        choice: confirmed::EVENT_NOTIFICATION,
                        data,
                    });
                } else {
                    self.state.outbox.push(Outbound::Unconfirmed {
                        dest: dispatch.recipient,
                        choice: unconfirmed::EVENT_NOTIFICATION,
                        data,
                    });
                }
            }
        }
        // Communication gating re-enables itself when the timer lapses.
        self.state.comm = match self.state.comm {
            CommState::Disabled { until: Some(until) } if until <= now => CommState::Enabled,
            CommState::InitiationDisabled { until: Some(until) } if until <= now => {
                CommState::Enabled
            }
            other => other,
        };
    }
}

/// Wires up the standard server-side services.
fn register_default_services(registry: &mut ServiceRegistry<AppState>) {
    use crate::transaction::Response::*;

    fn reject() -> Response {
        Response::Reject(crate::wire::apdu::reject_reason::MISSING_REQUIRED_PARAMETER)
    }

    // --- Object access ------------------------------------------------------

    registry.register_confirmed(confirmed::READ_PROPERTY, |state, _, data| {
        let Ok(request) = codecs::ReadPropertyRequest::decode(data) else { return reject() };
        match state.store.read_indexed(&request.object, request.property, request.array_index) {
            Ok(value) => Complex(
                codecs::ReadPropertyAck {
                    object: request.object,
                    property: request.property,
                    array_index: request.array_index,
                    value,
                }
                .encode(),
            ),
            Err(e) => Error(e),
        }
    });

    registry.register_confirmed(confirmed::WRITE_PROPERTY, |state, _, data| {
        let Ok(request) = codecs::WritePropertyRequest::decode(data) else { return reject() };
        match state.store.write(request.object, request.property, request.value) {
            Ok(change) => {
                state.apply_change(&change);
                Simple
            }
            Err(e) => Error(e),
        }
    });

    registry.register_confirmed(confirmed::READ_PROPERTY_MULTIPLE, |state, _, data| {
        let Ok(request) = codecs::ReadPropertyMultipleRequest::decode(data) else {
            return reject();
        };
        let mut results = Vec::new();
        for spec in request.specs {
            let mut object_results = Vec::new();
            let references: Vec<codecs::PropertyReference> = spec
                .properties
                .iter()
                .flat_map(|r| {
                    if r.property == property::ALL {
                        state
                            .store
                            .property_ids(&spec.object)
                            .unwrap_or_default()
                            .into_iter()
                            .map(codecs::PropertyReference::new)
                            .collect()
                    } else {
                        vec![*r]
                    }
                })
                .collect();
            for reference in references {
                let outcome = match state.store.read_indexed(
                    &spec.object,
                    reference.property,
                    reference.array_index,
                ) {
                    Ok(value) => codecs::ReadResult::Value(value),
                    Err(e) => codecs::ReadResult::Error {
                        class: e.class as u32,
                        code: e.code as u32,
                    },
                };
                object_results.push((reference, outcome));
            }
            results.push(codecs::ReadAccessResult { object: spec.object, results: object_results });
        }
        Complex(codecs::ReadPropertyMultipleAck { results }.encode())
    });

    registry.register_confirmed(confirmed::WRITE_PROPERTY_MULTIPLE, |state, _, data| {
        let Ok(request) = codecs::WritePropertyMultipleRequest::decode(data) else {
            return reject();
        };
        for spec in request.specs {
            for value in spec.values {
                match state.store.write(spec.object, value.property, value.value) {
                    Ok(change) => state.apply_change(&change),
                    Err(e) => return Error(e),
                }
            }
        }
        Simple
    });

    registry.register_confirmed(confirmed::READ_RANGE, |state, _, data| {
        let Ok(request) = codecs::ReadRangeRequest::decode(data) else { return reject() };
        let values = match state.store.read(&request.object, request.property) {
            Ok(values) => values.clone(),
            Err(e) => return Error(e),
        };
        let slice: Vec<Value> = match request.selector {
            codecs::ReadRangeSelector::All => values,
            codecs::ReadRangeSelector::ByPosition { reference, count } => {
                let start = (reference.max(1) as usize) - 1;
                let take = count.unsigned_abs() as usize;
                values.into_iter().skip(start).take(take).collect()
            }
            // Sequence and time selection need a log content model; the
            // position form of the answer is still well-formed.
            codecs::ReadRangeSelector::BySequence { count, .. }
            | codecs::ReadRangeSelector::ByTime { count, .. } => {
                values.into_iter().take(count.unsigned_abs() as usize).collect()
            }
        };
        let item_count = slice.len() as u32;
        Complex(
            codecs::ReadRangeAck {
                object: request.object,
                property: request.property,
                array_index: request.array_index,
                result_flags: crate::wire::primitives::BitString::from_bits(&[
                    true,
                    true,
                    false,
                ]),
                item_count,
                items: slice,
                first_sequence: None,
            }
            .encode(),
        )
    });

    // --- Object lifecycle ---------------------------------------------------

    registry.register_confirmed(confirmed::CREATE_OBJECT, |state, _, data| {
        let Ok(request) = codecs::CreateObjectRequest::decode(data) else { return reject() };
        let object = match request.specifier {
            codecs::CreateObjectSpecifier::Id(id) => id,
            codecs::CreateObjectSpecifier::Type(object_type) => {
                let instance = state
                    .store
                    .object_ids()
                    .iter()
                    .filter(|o| o.object_type() == object_type)
                    .map(|o| o.instance())
                    .max()
                    .map(|i| i + 1)
                    .unwrap_or(1);
                match ObjectId::new(object_type, instance) {
                    Some(id) => id,
                    None => {
                        return Error(ServiceError::new(
                            error_class::OBJECT,
                            error_code::VALUE_OUT_OF_RANGE,
                        ))
                    }
                }
            }
        };
        if !state.store.behavior(object.object_type()).dynamically_creatable {
            return Error(ServiceError::new(
                error_class::OBJECT,
                error_code::WRITE_ACCESS_DENIED,
            ));
        }
        if state.store.contains(&object) {
            return Error(ServiceError::new(error_class::OBJECT, error_code::OTHER));
        }
        let mut properties = HashMap::new();
        properties.insert(property::OBJECT_IDENTIFIER, vec![Value::ObjectId(object)]);
        for value in request.initial_values {
            properties.insert(value.property, value.value);
        }
        state.store.insert(object, properties);
        let mut ack = Vec::new();
        TlvWriter::new(&mut ack).application(&Value::ObjectId(object));
        Complex(ack)
    });

    registry.register_confirmed(confirmed::DELETE_OBJECT, |state, _, data| {
        let Ok(request) = codecs::DeleteObjectRequest::decode(data) else { return reject() };
        if !state.store.behavior(request.object.object_type()).dynamically_creatable {
            return Error(ServiceError::new(
                error_class::OBJECT,
                error_code::WRITE_ACCESS_DENIED,
            ));
        }
        if state.store.remove(&request.object) {
            Simple
        } else {
            Error(ServiceError::new(error_class::OBJECT, error_code::UNKNOWN_OBJECT))
        }
    });

    registry.register_confirmed(confirmed::ADD_LIST_ELEMENT, |state, _, data| {
        let Ok(request) = codecs::ListElementRequest::decode(data) else { return reject() };
        match state
            .store
            .add_list_elements(request.object, request.property, request.elements)
        {
            Ok(change) => {
                state.apply_change(&change);
                Simple
            }
            Err(e) => Error(e),
        }
    });

    registry.register_confirmed(confirmed::REMOVE_LIST_ELEMENT, |state, _, data| {
        let Ok(request) = codecs::ListElementRequest::decode(data) else { return reject() };
        match state
            .store
            .remove_list_elements(request.object, request.property, &request.elements)
        {
            Ok(change) => {
                state.apply_change(&change);
                Simple
            }
            Err(e) => Error(e),
        }
    });

    // --- Files --------------------------------------------------------------

    registry.register_confirmed(confirmed::ATOMIC_READ_FILE, |state, _, data| {
        let Ok(request) = codecs::AtomicReadFileRequest::decode(data) else { return reject() };
        let content = match state.store.read(&request.file, property::PRESENT_VALUE) {
            Ok(values) => match values.first() {
                Some(Value::OctetString(content)) => content.clone(),
                _ => {
                    return Error(ServiceError::new(
                        error_class::SERVICES,
                        error_code::INVALID_DATA_TYPE,
                    ))
                }
            },
            Err(e) => return Error(e),
        };
        let codecs::FileAccess::Stream { start, count } = request.access else {
            return Error(ServiceError::new(
                error_class::SERVICES,
                error_code::SERVICE_REQUEST_DENIED,
            ));
        };
        let from = (start.max(0) as usize).min(content.len());
        let to = (from + count as usize).min(content.len());
        Complex(
            codecs::AtomicReadFileAck {
                end_of_file: to >= content.len(),
                start: from as i32,
                data: vec![content[from..to].to_vec()],
                record_access: false,
            }
            .encode(),
        )
    });

    registry.register_confirmed(confirmed::ATOMIC_WRITE_FILE, |state, _, data| {
        let Ok(request) = codecs::AtomicWriteFileRequest::decode(data) else { return reject() };
        if request.record_access {
            return Error(ServiceError::new(
                error_class::SERVICES,
                error_code::SERVICE_REQUEST_DENIED,
            ));
        }
        let mut content = match state.store.read(&request.file, property::PRESENT_VALUE) {
            Ok(values) => match values.first() {
                Some(Value::OctetString(content)) => content.clone(),
                _ => Vec::new(),
            },
            Err(e) => return Error(e),
        };
        let payload = request.data.first().cloned().unwrap_or_default();
        let start = if request.start < 0 { content.len() } else { request.start as usize };
        if content.len() < start + payload.len() {
            content.resize(start + payload.len(), 0);
        }
        content[start..start + payload.len()].copy_from_slice(&payload);
        let change = state
            .store
            .write_unchecked(request.file, property::PRESENT_VALUE, vec![Value::OctetString(content)]);
        match change {
            Ok(change) => {
                state.apply_change(&change);
                Complex(
                    codecs::AtomicWriteFileAck {
                        start: start as i32,
                        record_access: false,
                    }
                    .encode(),
                )
            }
            Err(e) => Error(e),
        }
    });

    // --- COV ----------------------------------------------------------------

    registry.register_confirmed(confirmed::SUBSCRIBE_COV, |state, head, data| {
        let Ok(request) = codecs::SubscribeCovRequest::decode(data) else { return reject() };
        let key = SubscriptionKey {
            process_id: request.process_id,
            subscriber: head.source,
            object: request.object,
            property: None,
        };
        let baseline = state
            .store
            .read(&request.object, property::PRESENT_VALUE)
            .ok()
            .cloned();
        match state.cov.subscribe(
            key,
            request.issue_confirmed,
            request.lifetime_seconds,
            None,
            baseline,
            state.store.contains(&request.object),
            Instant::now(),
        ) {
            Ok(()) => Simple,
            Err(e) => Error(e),
        }
    });

    registry.register_confirmed(confirmed::SUBSCRIBE_COV_PROPERTY, |state, head, data| {
        let Ok(request) = codecs::SubscribeCovPropertyRequest::decode(data) else {
            return reject();
        };
        let key = SubscriptionKey {
            process_id: request.process_id,
            subscriber: head.source,
            object: request.object,
            property: Some(request.monitored_property.property),
        };
        let baseline = state
            .store
            .read(&request.object, request.monitored_property.property)
            .ok()
            .cloned();
        match state.cov.subscribe(
            key,
            request.issue_confirmed,
            request.lifetime_seconds,
            request.cov_increment.map(|i| i as f64),
            baseline,
            state.store.contains(&request.object),
            Instant::now(),
        ) {
            Ok(()) => Simple,
            Err(e) => Error(e),
        }
    });

    registry.register_confirmed(
        confirmed::SUBSCRIBE_COV_PROPERTY_MULTIPLE,
        |state, head, data| {
            let Ok(request) = codecs::SubscribeCovPropertyMultipleRequest::decode(data) else {
                return reject();
            };
            for spec in &request.specs {
                for prop in &spec.properties {
                    let key = SubscriptionKey {
                        process_id: request.process_id,
                        subscriber: head.source,
                        object: spec.object,
                        property: Some(prop.property),
                    };
                    let baseline =
                        state.store.read(&spec.object, prop.property).ok().cloned();
                    if let Err(e) = state.cov.subscribe(
                        key,
                        request.issue_confirmed,
                        request.lifetime_seconds,
                        prop.cov_increment.map(|i| i as f64),
                        baseline,
                        state.store.contains(&spec.object),
                        Instant::now(),
                    ) {
                        return Error(e);
                    }
                }
            }
            Simple
        },
    );

    registry.register_confirmed(confirmed::COV_NOTIFICATION, |state, _, data| {
        let Ok(notification) = codecs::CovNotification::decode(data) else { return reject() };
        state.received_cov.push(notification);
        Simple
    });

    // --- Alarms & events ----------------------------------------------------

    registry.register_confirmed(confirmed::EVENT_NOTIFICATION, |state, _, data| {
        let Ok(notification) = codecs::EventNotification::decode(data) else { return reject() };
        state.received_events.push(notification);
        Simple
    });

    registry.register_confirmed(confirmed::ACKNOWLEDGE_ALARM, |_, _, data| {
        let Ok(request) = codecs::AcknowledgeAlarmRequest::decode(data) else { return reject() };
        info!(target: LOG, "alarm on {} acknowledged by {}", request.event_object,
            request.acknowledgment_source);
        Simple
    });

    registry.register_confirmed(confirmed::GET_ALARM_SUMMARY, |state, _, _| {
        let summaries = state
            .events
            .alarm_summaries()
            .into_iter()
            .map(|(object, event_state)| codecs::AlarmSummary {
                object,
                alarm_state: event_state.code(),
                acknowledged_transitions: crate::wire::primitives::BitString::from_bits(&[
                    true, true, true,
                ]),
            })
            .collect();
        Complex(codecs::GetAlarmSummaryAck { summaries }.encode())
    });

    registry.register_confirmed(confirmed::GET_ENROLLMENT_SUMMARY, |state, _, data| {
        let Ok(request) = codecs::GetEnrollmentSummaryRequest::decode(data) else {
            return reject();
        };
        let summaries = state
            .events
            .enrollment_summaries()
            .into_iter()
            .filter(|(_, e, _)| {
                request
                    .notification_class_filter
                    .map_or(true, |c| c == e.notification_class)
            })
            .map(|(object, enrollment, event_state)| codecs::EnrollmentSummary {
                object,
                event_type: enrollment.algorithm.event_type(),
                event_state: event_state.code(),
                priority: state
                    .events
                    .class_priorities(enrollment.notification_class)
                    [event_state.transition_index()],
                notification_class: Some(enrollment.notification_class),
            })
            .collect();
        Complex(codecs::GetEnrollmentSummaryAck { summaries }.encode())
    });

    registry.register_confirmed(confirmed::GET_EVENT_INFORMATION, |state, _, data| {
        let Ok(_request) = codecs::GetEventInformationRequest::decode(data) else {
            return reject();
        };
        let summaries = state
            .events
            .enrollment_summaries()
            .into_iter()
            .filter(|(_, _, event_state)| *event_state != EventState::Normal)
            .map(|(object, enrollment, event_state)| codecs::EventSummary {
                object,
                event_state: event_state.code(),
                acknowledged_transitions: crate::wire::primitives::BitString::from_bits(&[
                    true, true, true,
                ]),
                event_timestamps: [
                    codecs::TimeStamp::Sequence(0),
                    codecs::TimeStamp::Sequence(0),
                    codecs::TimeStamp::Sequence(0),
                ],
                notify_type: enrollment.notify_type,
                event_enable: crate::wire::primitives::BitString::from_bits(
                    &enrollment.event_enable,
                ),
                event_priorities: {
                    let p = state.events.class_priorities(enrollment.notification_class);
                    [p[0] as u32, p[1] as u32, p[2] as u32]
                },
            })
            .collect();
        Complex(codecs::GetEventInformationAck { summaries, more_events: false }.encode())
    });

    // --- Device management --------------------------------------------------

    registry.register_confirmed(
        confirmed::DEVICE_COMMUNICATION_CONTROL,
        |state, _, data| {
            let Ok(request) = codecs::DeviceCommunicationControlRequest::decode(data) else {
                return reject();
            };
            if !state.check_password(request.password.as_ref()) {
                return Error(ServiceError::new(
                    error_class::SECURITY,
                    error_code::PASSWORD_FAILURE,
                ));
            }
            let until = request
                .time_duration_minutes
                .filter(|m| *m > 0)
                .map(|m| Instant::now() + Duration::from_secs(m as u64 * 60));
            state.comm = match request.state {
                0 => CommState::Enabled,
                1 => CommState::Disabled { until },
                2 => CommState::InitiationDisabled { until },
                _ => {
                    return Error(ServiceError::new(
                        error_class::SERVICES,
                        error_code::VALUE_OUT_OF_RANGE,
                    ))
                }
            };
            Simple
        },
    );

    registry.register_confirmed(confirmed::REINITIALIZE_DEVICE, |state, _, data| {
        let Ok(request) = codecs::ReinitializeDeviceRequest::decode(data) else {
            return reject();
        };
        if !state.check_password(request.password.as_ref()) {
            return Error(ServiceError::new(
                error_class::SECURITY,
                error_code::PASSWORD_FAILURE,
            ));
        }
        info!(target: LOG, "reinitialize requested (state {})", request.state);
        state.comm = CommState::Enabled;
        Simple
    });

    registry.register_confirmed(confirmed::TEXT_MESSAGE, |_, head, data| {
        let Ok(request) = codecs::TextMessageRequest::decode(data) else { return reject() };
        info!(target: LOG, "text message from {}: {}", head.source, request.message);
        Simple
    });

    registry.register_confirmed(confirmed::PRIVATE_TRANSFER, |_, _, data| {
        let Ok(request) = codecs::PrivateTransferRequest::decode(data) else { return reject() };
        // Acknowledge without a result block; vendor semantics live above
        // the core.
        let mut ack = Vec::new();
        let mut w = TlvWriter::new(&mut ack);
        w.context_unsigned(0, request.vendor_id as u64);
        w.context_unsigned(1, request.service_number as u64);
        Complex(ack)
    });

    registry.register_confirmed(confirmed::AUDIT_NOTIFICATION, |_, _, data| {
        let Ok(_request) = codecs::AuditNotificationRequest::decode(data) else {
            return reject();
        };
        Simple
    });

    registry.register_confirmed(confirmed::AUDIT_LOG_QUERY, |state, _, data| {
        let Ok(request) = codecs::AuditLogQueryRequest::decode(data) else { return reject() };
        if !state.store.contains(&request.log_object) {
            return Error(ServiceError::new(error_class::OBJECT, error_code::UNKNOWN_OBJECT));
        }
        Complex(
            codecs::AuditLogQueryAck {
                log_object: request.log_object,
                records: Vec::new(),
                first_sequence: None,
            }
            .encode(),
        )
    });

    // --- Virtual terminal ---------------------------------------------------

    registry.register_confirmed(confirmed::VT_OPEN, |state, _, data| {
        let Ok(request) = codecs::VtOpenRequest::decode(data) else { return reject() };
        let remote = state.next_vt_session;
        state.next_vt_session = state.next_vt_session.wrapping_add(1).max(1);
        state.vt_sessions.insert(remote, request.local_session_id);
        let mut ack = Vec::new();
        TlvWriter::new(&mut ack).application(&Value::Unsigned(remote as u64));
        Complex(ack)
    });

    registry.register_confirmed(confirmed::VT_CLOSE, |state, _, data| {
        let Ok(request) = codecs::VtCloseRequest::decode(data) else { return reject() };
        for id in request.session_ids {
            state.vt_sessions.remove(&id);
        }
        Simple
    });

    registry.register_confirmed(confirmed::VT_DATA, |state, _, data| {
        let Ok(request) = codecs::VtDataRequest::decode(data) else { return reject() };
        if !state.vt_sessions.contains_key(&request.session_id) {
            return Error(ServiceError::new(
                error_class::SERVICES,
                error_code::SERVICE_REQUEST_DENIED,
            ));
        }
        // VT-Data-ACK: all new data accepted.
        let mut ack = Vec::new();
        TlvWriter::new(&mut ack).context_boolean(0, true);
        Complex(ack)
    });

    // --- Unconfirmed services ----------------------------------------------

    registry.register_unconfirmed(unconfirmed::WHO_IS, |state, head, data| {
        let Ok(request) = codecs::WhoIsRequest::decode(data) else { return };
        if !request.matches(state.device.instance()) || !state.initiation_allowed() {
            return;
        }
        let iam = codecs::IAmRequest {
            device: state.device,
            max_apdu_length: state.max_apdu.bytes() as u32,
            segmentation_supported: codecs::segmentation::BOTH,
            vendor_id: state.vendor_id,
        };
        state.outbox.push(Outbound::Unconfirmed {
            dest: head.source,
            choice: unconfirmed::I_AM,
            data: iam.encode(),
        });
    });

    registry.register_unconfirmed(unconfirmed::I_AM, |state, head, data| {
        let Ok(iam) = codecs::IAmRequest::decode(data) else { return };
        state.heard_iam.push((head.source, iam));
        if !state.discovered.iter().any(|(_, d)| d.device == iam.device) {
            state.discovered.push((head.source, iam));
        }
    });

    registry.register_unconfirmed(unconfirmed::WHO_HAS, |state, head, data| {
        let Ok(request) = codecs::WhoHasRequest::decode(data) else { return };
        if !state.initiation_allowed() {
            return;
        }
        let matched: Option<(ObjectId, String)> = match &request.object {
            codecs::WhoHasObject::Id(id) => {
                state.store.contains(id).then(|| {
                    let name = state
                        .store
                        .read(id, property::OBJECT_NAME)
                        .ok()
                        .and_then(|v| match v.first() {
                            Some(Value::CharacterString(s)) => Some(s.text.clone()),
                            _ => None,
                        })
                        .unwrap_or_default();
                    (*id, name)
                })
            }
            codecs::WhoHasObject::Name(name) => {
                state.store.object_ids().into_iter().find_map(|id| {
                    match state.store.read(&id, property::OBJECT_NAME) {
                        Ok(values) => match values.first() {
                            Some(Value::CharacterString(s)) if s.text == name.text => {
                                Some((id, s.text.clone()))
                            }
                            _ => None,
                        },
                        Err(_) => None,
                    }
                })
            }
        };
        let Some((object, name)) = matched else { return };
        if let (Some(low), Some(high)) = (request.low_limit, request.high_limit) {
            let instance = state.device.instance();
            if !(low..=high).contains(&instance) {
                return;
            }
        }
        let ihave = codecs::IHaveRequest {
            device: state.device,
            object,
            object_name: crate::wire::primitives::CharacterString::utf8(name),
        };
        state.outbox.push(Outbound::Unconfirmed {
            dest: head.source,
            choice: unconfirmed::I_HAVE,
            data: ihave.encode(),
        });
    });

    registry.register_unconfirmed(unconfirmed::I_HAVE, |_, head, data| {
        if let Ok(ihave) = codecs::IHaveRequest::decode(data) {
            debug!(target: LOG, "{} has {} ({})", head.source, ihave.object,
                ihave.object_name);
        }
    });

    registry.register_unconfirmed(unconfirmed::COV_NOTIFICATION, |state, _, data| {
        if let Ok(notification) = codecs::CovNotification::decode(data) {
            state.received_cov.push(notification);
        }
    });

    registry.register_unconfirmed(unconfirmed::EVENT_NOTIFICATION, |state, _, data| {
        if let Ok(notification) = codecs::EventNotification::decode(data) {
            state.received_events.push(notification);
        }
    });

    registry.register_unconfirmed(unconfirmed::TIME_SYNCHRONIZATION, |_, head, data| {
        if let Ok(sync) = codecs::TimeSynchronizationRequest::decode(data) {
            info!(target: LOG, "time synchronization from {}: {:?} {:?}",
                head.source, sync.date, sync.time);
        }
    });

    registry.register_unconfirmed(unconfirmed::UTC_TIME_SYNCHRONIZATION, |_, head, data| {
        if let Ok(sync) = codecs::TimeSynchronizationRequest::decode(data) {
            info!(target: LOG, "utc time synchronization from {}: {:?} {:?}",
                head.source, sync.date, sync.time);
        }
    });

    registry.register_unconfirmed(unconfirmed::TEXT_MESSAGE, |_, head, data| {
        if let Ok(request) = codecs::TextMessageRequest::decode(data) {
            info!(target: LOG, "text message from {}: {}", head.source, request.message);
        }
    });

    registry.register_unconfirmed(unconfirmed::PRIVATE_TRANSFER, |_, head, data| {
        if let Ok(request) = codecs::PrivateTransferRequest::decode(data) {
            debug!(target: LOG, "private transfer {} from vendor {} ({})",
                request.service_number, request.vendor_id, head.source);
        }
    });

    registry.register_unconfirmed(unconfirmed::WRITE_GROUP, |_, _, data| {
        if let Ok(request) = codecs::WriteGroupRequest::decode(data) {
            debug!(target: LOG, "write-group {} ignored (no channel objects)",
                request.group_number);
        }
    });

    registry.register_unconfirmed(unconfirmed::AUDIT_NOTIFICATION, |_, _, data| {
        if codecs::AuditNotificationRequest::decode(data).is_err() {
            debug!(target: LOG, "malformed audit notification dropped");
        }
    });

    registry.register_unconfirmed(unconfirmed::WHO_AM_I, |_, head, data| {
        if let Ok(request) = codecs::WhoAmIRequest::decode(data) {
            info!(target: LOG, "who-am-i from {}: vendor {} model {} serial {}",
                head.source, request.vendor_id, request.model_name, request.serial_number);
        }
    });

    registry.register_unconfirmed(unconfirmed::YOU_ARE, |_, head, data| {
        if let Ok(request) = codecs::YouAreRequest::decode(data) {
            info!(target: LOG, "you-are from {} for serial {} (device {:?})",
                head.source, request.serial_number, request.device);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::MacAddr;
    use crate::datalink::testutil::FakePort;
    use crate::object::analog_object;
    use crate::types::object_type;
    use crate::wire::apdu::ConfirmedRequest;
    use crate::wire::npdu::Npdu;

    fn ai(instance: u32) -> ObjectId {
        ObjectId::new(object_type::ANALOG_INPUT, instance).unwrap()
    }

    fn av(instance: u32) -> ObjectId {
        ObjectId::new(object_type::ANALOG_VALUE, instance).unwrap()
    }

    struct Rig {
        handle: ApplicationHandle,
        port: FakePort,
        loop_task: tokio::task::JoinHandle<()>,
    }

    async fn rig(instance: u32) -> Rig {
        let config = DeviceConfig { instance_number: instance, ..Default::default() };
        let mut app = Application::new(config).unwrap();
        let port = FakePort::new();
        app.add_port(0, Box::new(port.clone()));
        let handle = app.handle();
        let loop_task = tokio::spawn(async move {
            let _ = app.run().await;
        });
        // Give the loop a beat to start its ports.
        for _ in 0..50 {
            if port.is_started() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Rig { handle, port, loop_task }
    }

    fn client_mac() -> MacAddr {
        MacAddr::new(&[0x42]).unwrap()
    }

    fn inject_apdu(rig: &Rig, apdu: &Apdu) {
        let npdu = Npdu::application(true, NetworkPriority::Normal);
        rig.port.inject(client_mac(), npdu.encode_with(&apdu.to_bytes()));
    }

    async fn wait_unicasts(rig: &Rig, n: usize) -> Vec<(MacAddr, Vec<u8>)> {
        for _ in 0..200 {
            let sent = rig.port.unicasts();
            if sent.len() >= n {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("port never sent {} frames; got {:?}", n, rig.port.unicasts().len());
    }

    fn apdu_of(frame: &[u8]) -> Apdu {
        let (_, payload) = Npdu::decode(frame).unwrap();
        Apdu::decode(payload).unwrap()
    }

    #[tokio::test]
    async fn read_property_request_answered() {
        let rig = rig(1234).await;
        rig.handle.add_object(ai(1), analog_object(ai(1), "oat", 22.5)).await;

        let request = codecs::ReadPropertyRequest {
            object: ai(1),
            property: property::PRESENT_VALUE,
            array_index: None,
        };
        inject_apdu(
            &rig,
            &Apdu::ConfirmedRequest(ConfirmedRequest::new(
                7,
                confirmed::READ_PROPERTY,
                request.encode(),
            )),
        );

        let sent = wait_unicasts(&rig, 1).await;
        match apdu_of(&sent[0].1) {
            Apdu::ComplexAck(ack) => {
                assert_eq!(ack.invoke_id, 7);
                let decoded = codecs::ReadPropertyAck::decode(&ack.service_data).unwrap();
                assert_eq!(decoded.value, vec![Value::Real(22.5)]);
            }
            other => panic!("expected ComplexACK, got {:?}", other),
        }
        rig.handle.shutdown().await;
    }

    #[tokio::test]
    async fn who_is_in_range_answered_with_i_am() {
        let rig = rig(1234).await;
        let request = codecs::WhoIsRequest { low_limit: Some(1000), high_limit: Some(2000) };
        inject_apdu(&rig, &Apdu::UnconfirmedRequest {
            service_choice: unconfirmed::WHO_IS,
            service_data: request.encode(),
        });

        let sent = wait_unicasts(&rig, 1).await;
        match apdu_of(&sent[0].1) {
            Apdu::UnconfirmedRequest { service_choice, service_data } => {
                assert_eq!(service_choice, unconfirmed::I_AM);
                let iam = codecs::IAmRequest::decode(&service_data).unwrap();
                assert_eq!(iam.device.instance(), 1234);
            }
            other => panic!("expected I-Am, got {:?}", other),
        }
        rig.handle.shutdown().await;
    }

    #[tokio::test]
    async fn who_is_out_of_range_stays_silent() {
        let rig = rig(1234).await;
        let request = codecs::WhoIsRequest { low_limit: Some(1), high_limit: Some(999) };
        inject_apdu(&rig, &Apdu::UnconfirmedRequest {
            service_choice: unconfirmed::WHO_IS,
            service_data: request.encode(),
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rig.port.unicasts().is_empty());
        assert!(rig.port.broadcasts().is_empty());
        rig.handle.shutdown().await;
    }

    #[tokio::test]
    async fn cov_threshold_scenario() {
        let rig = rig(1234).await;
        rig.handle.add_object(av(1), analog_object(av(1), "sp", 10.0)).await;

        // Subscribe with increment 1.0.
        let request = codecs::SubscribeCovPropertyRequest {
            process_id: 1,
            object: av(1),
            issue_confirmed: Some(false),
            lifetime_seconds: Some(300),
            monitored_property: codecs::PropertyReference::new(property::PRESENT_VALUE),
            cov_increment: Some(1.0),
        };
        inject_apdu(
            &rig,
            &Apdu::ConfirmedRequest(ConfirmedRequest::new(
                3,
                confirmed::SUBSCRIBE_COV_PROPERTY,
                request.encode(),
            )),
        );
        let sent = wait_unicasts(&rig, 1).await;
        assert!(matches!(apdu_of(&sent[0].1), Apdu::SimpleAck { invoke_id: 3, .. }));

        // Unchanged and sub-increment writes stay quiet.
        rig.handle.write_local(av(1), property::PRESENT_VALUE, vec![Value::Real(10.0)]).await.unwrap();
        rig.handle.write_local(av(1), property::PRESENT_VALUE, vec![Value::Real(10.4)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.port.unicasts().len(), 1);

        // Crossing the increment produces exactly one notification of 11.0.
        rig.handle.write_local(av(1), property::PRESENT_VALUE, vec![Value::Real(11.0)]).await.unwrap();
        let sent = wait_unicasts(&rig, 2).await;
        match apdu_of(&sent[1].1) {
            Apdu::UnconfirmedRequest { service_choice, service_data } => {
                assert_eq!(service_choice, unconfirmed::COV_NOTIFICATION);
                let n = codecs::CovNotification::decode(&service_data).unwrap();
                assert_eq!(n.monitored_object, av(1));
                assert_eq!(n.values[0].value, vec![Value::Real(11.0)]);
            }
            other => panic!("expected COV notification, got {:?}", other),
        }
        rig.handle.shutdown().await;
    }

    #[tokio::test]
    async fn dcc_wrong_password_rejected_timing_safely() {
        let config = DeviceConfig {
            instance_number: 1,
            password: Some(crate::config::Secret("hunter2".into())),
            ..Default::default()
        };
        let mut app = Application::new(config).unwrap();
        let port = FakePort::new();
        app.add_port(0, Box::new(port.clone()));
        let handle = app.handle();
        let loop_task = tokio::spawn(async move {
            let _ = app.run().await;
        });
        for _ in 0..50 {
            if port.is_started() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let rig = Rig { handle, port, loop_task };

        let request = codecs::DeviceCommunicationControlRequest {
            time_duration_minutes: Some(1),
            state: 1,
            password: Some(crate::wire::primitives::CharacterString::utf8("wrong")),
        };
        inject_apdu(
            &rig,
            &Apdu::ConfirmedRequest(ConfirmedRequest::new(
                9,
                confirmed::DEVICE_COMMUNICATION_CONTROL,
                request.encode(),
            )),
        );
        let sent = wait_unicasts(&rig, 1).await;
        match apdu_of(&sent[0].1) {
            Apdu::Error { error, .. } => {
                assert_eq!(error.code, error_code::PASSWORD_FAILURE);
            }
            other => panic!("expected password failure, got {:?}", other),
        }
        rig.handle.shutdown().await;
    }

    #[tokio::test]
    async fn dcc_disable_gates_requests() {
        let rig = rig(1).await;
        let disable = codecs::DeviceCommunicationControlRequest {
            time_duration_minutes: None,
            state: 1,
            password: None,
        };
        inject_apdu(
            &rig,
            &Apdu::ConfirmedRequest(ConfirmedRequest::new(
                1,
                confirmed::DEVICE_COMMUNICATION_CONTROL,
                disable.encode(),
            )),
        );
        let _ = wait_unicasts(&rig, 1).await;

        // A ReadProperty now dies silently.
        let request = codecs::ReadPropertyRequest {
            object: ObjectId::device(1).unwrap(),
            property: property::OBJECT_NAME,
            array_index: None,
        };
        inject_apdu(
            &rig,
            &Apdu::ConfirmedRequest(ConfirmedRequest::new(
                2,
                confirmed::READ_PROPERTY,
                request.encode(),
            )),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.port.unicasts().len(), 1);

        // DCC enable gets through and service resumes.
        let enable = codecs::DeviceCommunicationControlRequest {
            time_duration_minutes: None,
            state: 0,
            password: None,
        };
        inject_apdu(
            &rig,
            &Apdu::ConfirmedRequest(ConfirmedRequest::new(
                3,
                confirmed::DEVICE_COMMUNICATION_CONTROL,
                enable.encode(),
            )),
        );
        let sent = wait_unicasts(&rig, 2).await;
        assert!(matches!(apdu_of(&sent[1].1), Apdu::SimpleAck { invoke_id: 3, .. }));
        rig.handle.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_confirmed_service_rejected() {
        let rig = rig(1).await;
        inject_apdu(
            &rig,
            &Apdu::ConfirmedRequest(ConfirmedRequest::new(5, 200, vec![])),
        );
        let sent = wait_unicasts(&rig, 1).await;
        assert!(matches!(
            apdu_of(&sent[0].1),
            Apdu::Reject { invoke_id: 5, reason: 9 }
        ));
        rig.handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_ports_and_loop() {
        let rig = rig(1).await;
        assert!(rig.port.is_started());
        rig.handle.shutdown().await;
        let _ = tokio::time::timeout(Duration::from_secs(2), rig.loop_task)
            .await
            .expect("loop did not exit");
        assert!(!rig.port.is_started());
    }

    #[tokio::test]
    async fn cov_reports_before_event_on_same_write() {
        let rig = rig(1234).await;

        // An object with intrinsic reporting (out-of-range, class 4).
        let mut properties = analog_object(av(1), "zone", 10.0);
        properties.insert(property::NOTIFICATION_CLASS, vec![Value::Unsigned(4)]);
        properties.insert(property::HIGH_LIMIT, vec![Value::Real(80.0)]);
        properties.insert(property::LOW_LIMIT, vec![Value::Real(0.0)]);
        properties.insert(property::DEADBAND, vec![Value::Real(1.0)]);
        rig.handle.add_object(av(1), properties).await;
        rig.handle
            .define_notification_class(4, NotificationClass {
                priorities: [100, 50, 200],
                ack_required: [false; 3],
                recipients: vec![crate::event::Recipient::always(
                    Address::local(client_mac()),
                    7,
                    false,
                )],
            })
            .await;

        // An object-level COV subscription from the same station.
        let subscribe = codecs::SubscribeCovRequest {
            process_id: 1,
            object: av(1),
            issue_confirmed: Some(false),
            lifetime_seconds: Some(300),
        };
        inject_apdu(
            &rig,
            &Apdu::ConfirmedRequest(ConfirmedRequest::new(
                1,
                confirmed::SUBSCRIBE_COV,
                subscribe.encode(),
            )),
        );
        let _ = wait_unicasts(&rig, 1).await;

        // One write trips both pipelines; the COV notification must leave
        // before the event notification.
        rig.handle
            .write_local(av(1), property::PRESENT_VALUE, vec![Value::Real(85.0)])
            .await
            .unwrap();
        let sent = wait_unicasts(&rig, 3).await;
        let choices: Vec<u8> = sent[1..]
            .iter()
            .map(|(_, frame)| match apdu_of(frame) {
                Apdu::UnconfirmedRequest { service_choice, .. } => service_choice,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            choices,
            vec![unconfirmed::COV_NOTIFICATION, unconfirmed::EVENT_NOTIFICATION]
        );
        rig.handle.shutdown().await;
    }

    #[tokio::test]
    async fn i_am_populates_discovery_and_device_info() {
        let rig = rig(1).await;
        let iam = codecs::IAmRequest {
            device: ObjectId::device(77).unwrap(),
            max_apdu_length: 480,
            segmentation_supported: codecs::segmentation::BOTH,
            vendor_id: 9,
        };
        inject_apdu(&rig, &Apdu::UnconfirmedRequest {
            service_choice: unconfirmed::I_AM,
            service_data: iam.encode(),
        });
        for _ in 0..100 {
            if !rig.handle.discovered_devices().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let discovered = rig.handle.discovered_devices().await;
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].1.device.instance(), 77);
        rig.handle.shutdown().await;
    }
}
