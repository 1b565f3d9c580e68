// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The hub connector (Annex AB.6.6): one persistent WebSocket to the
//! primary hub, exponential-backoff reconnect, and failover to the
//! secondary hub URI when the primary stays down.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream};

use crate::error::LinkError;
use crate::sc::connection::{Connection, ConnectionConfig, Output, Role};
use crate::sc::tls;
use crate::sc::{ScConfig, HUB_SUBPROTOCOL, SC_MAX_BVLC, SC_MAX_NPDU};
use crate::wire::bvlcsc::{ScFrame, ScPayload, ScVmac};
use crate::wire::{Decodable, Encodable};

const LOG: &str = "bacnet::sc::connector";

/// Consecutive failures on the primary URI before the secondary is tried.
const FAILOVER_THRESHOLD: u32 = 3;

pub type MessageCallback = Arc<dyn Fn(ScVmac, Vec<u8>) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn() + Send + Sync>;
pub type ControlCallback = Arc<dyn Fn(ScFrame) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_message: Option<MessageCallback>,
    on_connected: Option<StateCallback>,
    on_disconnected: Option<StateCallback>,
    /// Non-NPDU frames the hub addresses to this node, e.g. the
    /// Address-Resolution-Acks the node switch waits on.
    on_control: Option<ControlCallback>,
}

struct Shared {
    config: ScConfig,
    out: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    next_message_id: AtomicU16,
    callbacks: Mutex<Callbacks>,
}

/// A spoke's persistent attachment to its hub.
pub struct HubConnector {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl HubConnector {
    pub fn new(config: ScConfig) -> HubConnector {
        HubConnector {
            shared: Arc::new(Shared {
                config,
                out: Mutex::new(None),
                connected: AtomicBool::new(false),
                next_message_id: AtomicU16::new(rand::random()),
                callbacks: Mutex::new(Callbacks::default()),
            }),
            task: None,
        }
    }

    pub fn vmac(&self) -> ScVmac {
        self.shared.config.vmac
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn set_on_connected(&self, callback: StateCallback) {
        self.shared.callbacks.lock().unwrap().on_connected = Some(callback);
    }

    pub fn set_on_disconnected(&self, callback: StateCallback) {
        self.shared.callbacks.lock().unwrap().on_disconnected = Some(callback);
    }

    pub fn set_on_control(&self, callback: ControlCallback) {
        self.shared.callbacks.lock().unwrap().on_control = Some(callback);
    }

    /// Sends an arbitrary BVLC-SC frame to the hub (resolution requests,
    /// advertisements). The message id is filled in.
    pub fn send_frame(&self, mut frame: ScFrame) -> Result<(), LinkError> {
        frame.message_id = self.shared.next_message_id.fetch_add(1, Ordering::Relaxed);
        let out = self.shared.out.lock().unwrap();
        out.as_ref()
            .ok_or(LinkError::NotStarted)?
            .unbounded_send(Message::Binary(frame.to_bytes()))
            .map_err(|_| LinkError::NotStarted)
    }

    /// Starts the reconnect loop; `on_message` receives every NPDU the hub
    /// relays to this node.
    pub fn start(
        &mut self,
        on_message: impl Fn(ScVmac, Vec<u8>) + Send + Sync + 'static,
    ) -> Result<(), LinkError> {
        if self.task.is_some() {
            return Ok(());
        }
        if self.shared.config.primary_uri.is_empty() {
            return Err(LinkError::InvalidAddress("empty hub uri".into()));
        }
        self.shared.callbacks.lock().unwrap().on_message = Some(Arc::new(on_message));
        let shared = self.shared.clone();
        self.task = Some(tokio::spawn(run_loop(shared)));
        Ok(())
    }

    /// Stops the connector: the task is cancelled, pending sends dropped,
    /// and callbacks cleared so no cycle keeps the owner alive.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        *self.shared.out.lock().unwrap() = None;
        self.shared.connected.store(false, Ordering::SeqCst);
        *self.shared.callbacks.lock().unwrap() = Callbacks::default();
    }

    /// Sends an NPDU through the hub toward `dest` (unicast VMAC or the
    /// broadcast VMAC).
    pub fn send_npdu(&self, dest: ScVmac, npdu: &[u8]) -> Result<(), LinkError> {
        if npdu.len() > SC_MAX_NPDU as usize {
            return Err(LinkError::FrameTooLarge(npdu.len()));
        }
        let id = self.shared.next_message_id.fetch_add(1, Ordering::Relaxed);
        let frame = ScFrame::new(id, ScPayload::EncapsulatedNpdu(npdu.to_vec()))
            .with_origin(self.shared.config.vmac)
            .with_destination(dest);
        let out = self.shared.out.lock().unwrap();
        out.as_ref()
            .ok_or(LinkError::NotStarted)?
            .unbounded_send(Message::Binary(frame.to_bytes()))
            .map_err(|_| LinkError::NotStarted)
    }
}

impl Drop for HubConnector {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(shared: Arc<Shared>) {
    let config = shared.config.clone();
    let mut failures: u32 = 0;
    let mut delay = config.reconnect_min_delay;
    loop {
        let uri = if failures >= FAILOVER_THRESHOLD {
            config.secondary_uri.as_deref().unwrap_or(&config.primary_uri)
        } else {
            &config.primary_uri
        };
        match run_connection(&shared, uri).await {
            Ok(was_connected) => {
                if was_connected {
                    failures = 0;
                    delay = config.reconnect_min_delay;
                } else {
                    failures += 1;
                }
            }
            Err(e) => {
                warn!(target: LOG, "connection to {} failed: {}", uri, e);
                failures += 1;
            }
        }
        debug!(target: LOG, "reconnecting in {:?} ({} consecutive failures)", delay, failures);
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(config.reconnect_max_delay);
    }
}

/// Runs one connection attempt to completion. Returns whether the
/// handshake ever succeeded.
async fn run_connection(shared: &Arc<Shared>, uri: &str) -> Result<bool, anyhow::Error> {
    let config = &shared.config;
    let mut request = uri.into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(HUB_SUBPROTOCOL));

    let connector = match &config.tls {
        Some(material) => Connector::Rustls(tls::client_config(material).map_err(|e| {
            anyhow::anyhow!("tls configuration: {}", e)
        })?),
        None => {
            warn!(target: LOG, "PLAINTEXT hub link to {} (test mode)", uri);
            Connector::Plain
        }
    };

    let (ws, _response) = tokio::time::timeout(
        config.connect_timeout,
        tokio_tungstenite::connect_async_tls_with_config(
            request,
            Some(crate::sc::ws_config()),
            false,
            Some(connector),
        ),
    )
    .await
    .map_err(|_| anyhow::anyhow!("websocket handshake timed out"))??;

    match ws.get_ref() {
        MaybeTlsStream::Plain(stream) => stream.set_nodelay(true)?,
        MaybeTlsStream::Rustls(stream) => stream.get_ref().0.set_nodelay(true)?,
        _ => {}
    }

    let mut machine = Connection::new(
        Role::Initiator,
        ConnectionConfig {
            vmac: config.vmac,
            uuid: config.uuid,
            max_bvlc_len: SC_MAX_BVLC,
            max_npdu_len: SC_MAX_NPDU,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            connect_timeout: config.connect_timeout,
        },
        Instant::now(),
    );

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded::<Message>();
    let mut was_connected = false;

    // The machine's opening outputs carry the Connect-Request.
    let opening = machine.connect(Instant::now()).expect("fresh machine not idle");
    for output in opening {
        if let Output::Send(frame) = output {
            ws_tx.send(Message::Binary(frame.to_bytes())).await?;
        }
    }

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let result = loop {
        let outputs = tokio::select! {
            message = ws_rx.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(()),
                };
                match message {
                    Message::Binary(bytes) => {
                        if bytes.len() > SC_MAX_BVLC as usize {
                            machine.on_oversized_frame(bytes.len())
                        } else {
                            match ScFrame::decode(&bytes) {
                                Ok(frame) => machine.on_frame(frame, Instant::now()),
                                Err(e) => {
                                    warn!(target: LOG, "undecodable frame from hub: {}", e);
                                    continue;
                                }
                            }
                        }
                    }
                    Message::Close(_) => break Ok(()),
                    _ => continue,
                }
            }
            outbound = out_rx.next() => {
                match outbound {
                    Some(message) => {
                        ws_tx.send(message).await?;
                        continue;
                    }
                    None => break Ok(()),
                }
            }
            _ = tick.tick() => machine.on_tick(Instant::now()),
        };

        let mut closed = false;
        for output in outputs {
            match output {
                Output::Send(frame) => {
                    ws_tx.send(Message::Binary(frame.to_bytes())).await?;
                }
                Output::Connected(params) => {
                    info!(target: LOG, "attached to hub {} as {}", uri,
                        hex::encode(config.vmac));
                    debug!(target: LOG, "hub vmac {}", hex::encode(params.vmac));
                    was_connected = true;
                    *shared.out.lock().unwrap() = Some(out_tx.clone());
                    shared.connected.store(true, Ordering::SeqCst);
                    let callback = shared.callbacks.lock().unwrap().on_connected.clone();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
                Output::Deliver(frame) => match &frame.payload {
                    ScPayload::EncapsulatedNpdu(npdu) => {
                        if let Some(origin) = frame.origin {
                            let callback =
                                shared.callbacks.lock().unwrap().on_message.clone();
                            if let Some(callback) = callback {
                                callback(origin, npdu.clone());
                            }
                        }
                    }
                    _ => {
                        let callback = shared.callbacks.lock().unwrap().on_control.clone();
                        if let Some(callback) = callback {
                            callback(frame);
                        }
                    }
                },
                Output::Close(reason) => {
                    debug!(target: LOG, "hub link closing: {:?}", reason);
                    closed = true;
                }
            }
        }
        if closed {
            break Ok(());
        }
    };

    *shared.out.lock().unwrap() = None;
    if shared.connected.swap(false, Ordering::SeqCst) {
        let callback = shared.callbacks.lock().unwrap().on_disconnected.clone();
        if let Some(callback) = callback {
            callback();
        }
    }
    result.map(|()| was_connected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sc::hub::{HubConfig, HubFunction};
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    const HUB_VMAC: ScVmac = [0x02, 0, 0, 0, 0, 0xFE];

    async fn started_hub() -> (HubFunction, String) {
        let mut hub = HubFunction::new(HubConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            vmac: HUB_VMAC,
            uuid: Uuid::from_bytes([0xFE; 16]),
            tls: None,
            max_connections: 8,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
        });
        hub.start().await.unwrap();
        let uri = format!("ws://{}", hub.local_addr().unwrap());
        (hub, uri)
    }

    fn spoke_config(uri: &str, last: u8) -> ScConfig {
        ScConfig {
            primary_uri: uri.to_owned(),
            vmac: [0x02, 0, 0, 0, 0, last],
            uuid: Uuid::from_bytes([last; 16]),
            reconnect_min_delay: Duration::from_millis(50),
            reconnect_max_delay: Duration::from_millis(400),
            ..ScConfig::default()
        }
    }

    async fn wait_connected(connector: &HubConnector) {
        for _ in 0..100 {
            if connector.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("connector never attached");
    }

    #[tokio::test]
    async fn two_spokes_exchange_npdus() {
        let (_hub, uri) = started_hub().await;
        let mut a = HubConnector::new(spoke_config(&uri, 1));
        let mut b = HubConnector::new(spoke_config(&uri, 2));
        let b_vmac = b.vmac();

        let (tx, rx) = std::sync::mpsc::channel::<(ScVmac, Vec<u8>)>();
        a.start(|_, _| {}).unwrap();
        b.start(move |origin, npdu| {
            let _ = tx.send((origin, npdu));
        })
        .unwrap();
        wait_connected(&a).await;
        wait_connected(&b).await;

        a.send_npdu(b_vmac, &[0x01, 0x04, 0xAA]).unwrap();
        let (origin, npdu) = tokio::task::spawn_blocking(move || {
            rx.recv_timeout(Duration::from_secs(2)).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(origin, a.vmac());
        assert_eq!(npdu, [0x01, 0x04, 0xAA]);
    }

    #[tokio::test]
    async fn reconnects_after_hub_restart() {
        let (hub, uri) = started_hub().await;
        let addr = hub.local_addr().unwrap();
        let mut a = HubConnector::new(spoke_config(&uri, 3));
        let connected_events = Arc::new(AtomicUsize::new(0));
        let events = connected_events.clone();
        a.set_on_connected(Arc::new(move || {
            events.fetch_add(1, Ordering::SeqCst);
        }));
        a.start(|_, _| {}).unwrap();
        wait_connected(&a).await;

        // Kill the hub; the spoke must notice and start retrying.
        drop(hub);
        for _ in 0..100 {
            if !a.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!a.is_connected());
        assert!(matches!(a.send_npdu([0x02, 0, 0, 0, 0, 9], &[0]), Err(LinkError::NotStarted)));

        // Bring a hub back on the same port; the spoke reattaches alone.
        // (Give the old listener socket a beat to fully close.)
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut hub2 = HubFunction::new(HubConfig {
            listen: addr,
            vmac: HUB_VMAC,
            uuid: Uuid::from_bytes([0xFE; 16]),
            tls: None,
            max_connections: 8,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
        });
        hub2.start().await.unwrap();
        wait_connected(&a).await;
        assert!(connected_events.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn fails_over_to_secondary_uri() {
        let (_hub, secondary_uri) = started_hub().await;
        // Primary points at a closed port.
        let dead = "ws://127.0.0.1:1";
        let mut config = spoke_config(dead, 4);
        config.secondary_uri = Some(secondary_uri);
        config.connect_timeout = Duration::from_millis(500);
        let mut a = HubConnector::new(config);
        a.start(|_, _| {}).unwrap();

        // Three primary failures and a short backoff later, the secondary
        // hub has us.
        for _ in 0..300 {
            if a.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("never failed over to the secondary hub");
    }

    #[tokio::test]
    async fn stop_clears_callbacks_and_sends() {
        let (_hub, uri) = started_hub().await;
        let mut a = HubConnector::new(spoke_config(&uri, 5));
        a.start(|_, _| {}).unwrap();
        wait_connected(&a).await;
        a.stop();
        assert!(!a.is_connected());
        assert!(matches!(a.send_npdu([0x02, 0, 0, 0, 0, 9], &[0]), Err(LinkError::NotStarted)));
        assert!(a.shared.callbacks.lock().unwrap().on_message.is_none());
    }

    #[test]
    fn start_requires_a_uri() {
        let mut a = HubConnector::new(ScConfig::default());
        assert!(matches!(a.start(|_, _| {}), Err(LinkError::InvalidAddress(_))));
    }
}
