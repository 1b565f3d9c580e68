// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The node switch (Annex AB.6.7): direct node-to-node connections that
//! bypass the hub for heavy unicast traffic.
//!
//! Outbound demand for an unconnected VMAC raises an Address-Resolution
//! through the hub; the candidate URIs in the ack are accepted only with
//! `ws://` or `wss://` schemes before any dial-out happens. The
//! pending-resolution table is bounded by the connection cap so resolution
//! requests cannot be used to flood the node.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector as WsConnector, WebSocketStream};
use uuid::Uuid;

use crate::error::LinkError;
use crate::sc::connection::{Connection, ConnectionConfig, Output, Role};
use crate::sc::connector::MessageCallback;
use crate::sc::tls::{self, TlsMaterial};
use crate::sc::{DIRECT_SUBPROTOCOL, SC_MAX_BVLC, SC_MAX_NPDU};
use crate::wire::bvlcsc::{ScFrame, ScPayload, ScVmac};
use crate::wire::{Decodable, Encodable};

const LOG: &str = "bacnet::sc::switch";

const RESOLUTION_TIMEOUT: Duration = Duration::from_secs(3);
/// Frames queued per peer while its resolution is outstanding.
const QUEUE_PER_PEER: usize = 8;

/// Checks a candidate URI from an Address-Resolution-Ack. Only WebSocket
/// schemes may be dialed; anything else is a server-side request forgery
/// vector and is discarded.
pub fn acceptable_direct_uri(uri: &str) -> bool {
    let lower = uri.trim().to_ascii_lowercase();
    lower.starts_with("ws://") || lower.starts_with("wss://")
}

#[derive(Debug, Clone)]
pub struct SwitchConfig {
    pub listen: Option<SocketAddr>,
    pub vmac: ScVmac,
    pub uuid: Uuid,
    pub tls: Option<TlsMaterial>,
    pub max_connections: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
}

struct PendingResolution {
    deadline: Instant,
    queued: Vec<Vec<u8>>,
}

#[derive(Default)]
struct Table {
    direct: HashMap<ScVmac, mpsc::UnboundedSender<Message>>,
    pending: HashMap<ScVmac, PendingResolution>,
}

struct Shared {
    config: SwitchConfig,
    table: Mutex<Table>,
    on_message: Mutex<Option<MessageCallback>>,
    /// Issues an Address-Resolution through the hub.
    resolver: Mutex<Option<Arc<dyn Fn(ScVmac) + Send + Sync>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Direct-connection manager.
pub struct NodeSwitch {
    shared: Arc<Shared>,
    listener_task: Option<JoinHandle<()>>,
    local: Option<SocketAddr>,
}

impl NodeSwitch {
    pub fn new(config: SwitchConfig) -> NodeSwitch {
        NodeSwitch {
            shared: Arc::new(Shared {
                config,
                table: Mutex::new(Table::default()),
                on_message: Mutex::new(None),
                resolver: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
            listener_task: None,
            local: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn direct_connection_count(&self) -> usize {
        self.shared.table.lock().unwrap().direct.len()
    }

    pub fn set_on_message(&self, callback: MessageCallback) {
        *self.shared.on_message.lock().unwrap() = Some(callback);
    }

    /// Installs the hook that sends Address-Resolution via the hub link.
    pub fn set_resolver(&self, resolver: Arc<dyn Fn(ScVmac) + Send + Sync>) {
        *self.shared.resolver.lock().unwrap() = Some(resolver);
    }

    /// Starts the inbound direct-connection listener, when configured.
    pub async fn start(&mut self) -> Result<(), LinkError> {
        let Some(listen) = self.shared.config.listen else {
            return Ok(());
        };
        let listener = TcpListener::bind(listen).await.map_err(LinkError::BindFailed)?;
        self.local = Some(listener.local_addr().map_err(LinkError::BindFailed)?);
        let acceptor = match &self.shared.config.tls {
            Some(material) => Some(tokio_rustls::TlsAcceptor::from(
                tls::server_config(material)
                    .map_err(|e| LinkError::InvalidAddress(e.to_string()))?,
            )),
            None => None,
        };
        info!(target: LOG, "direct connections on {} ({})", self.local.unwrap(),
            if acceptor.is_some() { "tls 1.3" } else { "PLAINTEXT" });

        let shared = self.shared.clone();
        self.listener_task = Some(tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(target: LOG, "accept failed: {}", e);
                        continue;
                    }
                };
                let shared2 = shared.clone();
                let acceptor = acceptor.clone();
                let task = tokio::spawn(async move {
                    let result = async {
                        stream.set_nodelay(true)?;
                        match acceptor {
                            Some(acceptor) => {
                                let stream = acceptor.accept(stream).await?;
                                let ws = tokio_tungstenite::accept_hdr_async_with_config(
                                    stream,
                                    direct_subprotocol,
                                    Some(crate::sc::ws_config()),
                                )
                                .await?;
                                pump_direct(shared2, ws, Role::Accepter, None).await
                            }
                            None => {
                                warn!(target: LOG,
                                    "PLAINTEXT direct connection from {} (test mode)", peer);
                                let ws = tokio_tungstenite::accept_hdr_async_with_config(
                                    stream,
                                    direct_subprotocol,
                                    Some(crate::sc::ws_config()),
                                )
                                .await?;
                                pump_direct(shared2, ws, Role::Accepter, None).await
                            }
                        }
                    }
                    .await;
                    if let Err(e) = result {
                        debug!(target: LOG, "direct peer {} ended: {:#}", peer, e);
                    }
                });
                shared.tasks.lock().unwrap().push(task);
            }
        }));
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.listener_task.take() {
            task.abort();
        }
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let mut table = self.shared.table.lock().unwrap();
        table.direct.clear();
        table.pending.clear();
        *self.shared.on_message.lock().unwrap() = None;
        *self.shared.resolver.lock().unwrap() = None;
        self.local = None;
    }

    /// Sends an NPDU directly to `dest`, resolving and dialing as needed.
    /// While no direct link exists the frame is queued against the pending
    /// resolution.
    pub fn send_npdu(&self, dest: ScVmac, npdu: &[u8]) -> Result<(), LinkError> {
        if npdu.len() > SC_MAX_NPDU as usize {
            return Err(LinkError::FrameTooLarge(npdu.len()));
        }
        let frame = ScFrame::new(0, ScPayload::EncapsulatedNpdu(npdu.to_vec()))
            .with_origin(self.shared.config.vmac)
            .with_destination(dest)
            .to_bytes();
        let mut table = self.shared.table.lock().unwrap();
        if let Some(out) = table.direct.get(&dest) {
            return out
                .unbounded_send(Message::Binary(frame))
                .map_err(|_| LinkError::NotStarted);
        }
        if let Some(pending) = table.pending.get_mut(&dest) {
            if pending.queued.len() >= QUEUE_PER_PEER {
                pending.queued.remove(0);
            }
            pending.queued.push(frame);
            return Ok(());
        }
        if table.pending.len() >= self.shared.config.max_connections {
            // Resolution flooding guard.
            return Err(LinkError::ResolutionTimeout);
        }
        table.pending.insert(
            dest,
            PendingResolution {
                deadline: Instant::now() + RESOLUTION_TIMEOUT,
                queued: vec![frame],
            },
        );
        drop(table);
        let resolver = self.shared.resolver.lock().unwrap().clone();
        match resolver {
            Some(resolver) => {
                resolver(dest);
                Ok(())
            }
            None => Err(LinkError::NotStarted),
        }
    }

    /// Feeds an Address-Resolution-Ack received via the hub. Invalid URIs
    /// are dropped; the first acceptable one is dialed.
    pub fn handle_resolution_ack(&self, vmac: ScVmac, uris: &[String]) {
        let acceptable: Vec<String> = uris
            .iter()
            .filter(|uri| {
                let good = acceptable_direct_uri(uri);
                if !good {
                    warn!(target: LOG, "discarding non-websocket candidate uri for {}",
                        hex::encode(vmac));
                }
                good
            })
            .cloned()
            .collect();
        let Some(uri) = acceptable.into_iter().next() else {
            self.shared.table.lock().unwrap().pending.remove(&vmac);
            return;
        };
        if !self.shared.table.lock().unwrap().pending.contains_key(&vmac) {
            debug!(target: LOG, "resolution ack for {} without a pending entry",
                hex::encode(vmac));
            return;
        }
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = connect_direct(shared.clone(), vmac, &uri).await {
                warn!(target: LOG, "direct connect to {} failed: {:#}", uri, e);
                shared.table.lock().unwrap().pending.remove(&vmac);
            }
        });
        self.shared.tasks.lock().unwrap().push(task);
    }

    /// Expires stale pending resolutions. Driven by the application sweep.
    pub fn sweep(&self, now: Instant) {
        let mut table = self.shared.table.lock().unwrap();
        let before = table.pending.len();
        table.pending.retain(|_, p| p.deadline > now);
        if table.pending.len() != before {
            debug!(target: LOG, "expired {} pending resolutions", before - table.pending.len());
        }
    }
}

impl Drop for NodeSwitch {
    fn drop(&mut self) {
        self.stop();
    }
}

fn direct_subprotocol(
    request: &Request,
    mut response: Response,
) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !offered.split(',').any(|p| p.trim() == DIRECT_SUBPROTOCOL) {
        return Err(ErrorResponse::new(Some("unsupported subprotocol".into())));
    }
    response
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(DIRECT_SUBPROTOCOL));
    Ok(response)
}

async fn connect_direct(
    shared: Arc<Shared>,
    vmac: ScVmac,
    uri: &str,
) -> Result<(), anyhow::Error> {
    let config = &shared.config;
    let mut request = uri.into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(DIRECT_SUBPROTOCOL));
    let connector = match &config.tls {
        Some(material) => WsConnector::Rustls(
            tls::client_config(material).map_err(|e| anyhow::anyhow!("{}", e))?,
        ),
        None => WsConnector::Plain,
    };
    let (ws, _) = tokio::time::timeout(
        config.connect_timeout,
        tokio_tungstenite::connect_async_tls_with_config(
            request,
            Some(crate::sc::ws_config()),
            false,
            Some(connector),
        ),
    )
    .await
    .map_err(|_| anyhow::anyhow!("direct websocket handshake timed out"))??;
    pump_direct(shared, ws, Role::Initiator, Some(vmac)).await
}

/// Pumps one direct link in either role until it closes.
async fn pump_direct<S>(
    shared: Arc<Shared>,
    ws: WebSocketStream<S>,
    role: Role,
    expected_vmac: Option<ScVmac>,
) -> Result<(), anyhow::Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let config = &shared.config;
    let mut machine = Connection::new(
        role,
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
    let opening = machine.connect(Instant::now()).expect("fresh machine not idle");
    for output in opening {
        if let Output::Send(frame) = output {
            ws_tx.send(Message::Binary(frame.to_bytes())).await?;
        }
    }

    let mut peer_vmac: Option<ScVmac> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let result: Result<(), anyhow::Error> = loop {
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
                                    warn!(target: LOG, "undecodable direct frame: {}", e);
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
                    if let Some(expected) = expected_vmac {
                        if params.vmac != expected {
                            warn!(target: LOG, "direct peer identified as {} not {}",
                                hex::encode(params.vmac), hex::encode(expected));
                            closed = true;
                            continue;
                        }
                    }
                    info!(target: LOG, "direct link with {}", hex::encode(params.vmac));
                    peer_vmac = Some(params.vmac);
                    let mut table = shared.table.lock().unwrap();
                    table.direct.insert(params.vmac, out_tx.clone());
                    if let Some(pending) = table.pending.remove(&params.vmac) {
                        for frame in pending.queued {
                            let _ = out_tx.unbounded_send(Message::Binary(frame));
                        }
                    }
                }
                Output::Deliver(frame) => {
                    if let ScPayload::EncapsulatedNpdu(npdu) = frame.payload {
                        if let Some(origin) = frame.origin {
                            let callback = shared.on_message.lock().unwrap().clone();
                            if let Some(callback) = callback {
                                callback(origin, npdu);
                            }
                        }
                    }
                }
                Output::Close(reason) => {
                    debug!(target: LOG, "direct link closing: {:?}", reason);
                    closed = true;
                }
            }
        }
        if closed {
            break Ok(());
        }
    };

    if let Some(vmac) = peer_vmac {
        shared.table.lock().unwrap().direct.remove(&vmac);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1: ScVmac = [0x02, 0, 0, 0, 0, 0x11];
    const V2: ScVmac = [0x02, 0, 0, 0, 0, 0x22];

    fn switch_config(vmac: ScVmac, listen: bool) -> SwitchConfig {
        SwitchConfig {
            listen: listen.then(|| "127.0.0.1:0".parse().unwrap()),
            vmac,
            uuid: Uuid::from_bytes([vmac[5]; 16]),
            tls: None,
            max_connections: 4,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn uri_guard_accepts_only_websocket_schemes() {
        assert!(acceptable_direct_uri("ws://10.0.0.9:8080"));
        assert!(acceptable_direct_uri("wss://node.example:4443/path"));
        assert!(acceptable_direct_uri("  WSS://CAPS.example  "));
        assert!(!acceptable_direct_uri("http://10.0.0.9/"));
        assert!(!acceptable_direct_uri("file:///etc/passwd"));
        assert!(!acceptable_direct_uri("gopher://x"));
        assert!(!acceptable_direct_uri(""));
    }

    #[tokio::test]
    async fn direct_link_carries_npdus_both_ways() {
        let mut b = NodeSwitch::new(switch_config(V2, true));
        let (tx_b, rx_b) = std::sync::mpsc::channel::<(ScVmac, Vec<u8>)>();
        b.set_on_message(Arc::new(move |origin, npdu| {
            let _ = tx_b.send((origin, npdu));
        }));
        b.start().await.unwrap();
        let uri = format!("ws://{}", b.local_addr().unwrap());

        let a = NodeSwitch::new(switch_config(V1, false));
        let (tx_a, rx_a) = std::sync::mpsc::channel::<(ScVmac, Vec<u8>)>();
        a.set_on_message(Arc::new(move |origin, npdu| {
            let _ = tx_a.send((origin, npdu));
        }));
        // Pretend resolution already happened.
        a.set_resolver(Arc::new(|_| {}));
        a.send_npdu(V2, &[0x01, 0xAA]).unwrap();
        a.handle_resolution_ack(V2, &[uri]);

        // The queued frame arrives at B after the dial completes.
        let (origin, npdu) = tokio::task::spawn_blocking(move || {
            rx_b.recv_timeout(Duration::from_secs(2)).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(origin, V1);
        assert_eq!(npdu, [0x01, 0xAA]);
        assert_eq!(a.direct_connection_count(), 1);

        // And the reverse direction reuses the link.
        b.send_npdu(V1, &[0x02, 0xBB]).unwrap();
        let (origin, npdu) = tokio::task::spawn_blocking(move || {
            rx_a.recv_timeout(Duration::from_secs(2)).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(origin, V2);
        assert_eq!(npdu, [0x02, 0xBB]);
    }

    #[tokio::test]
    async fn pending_table_is_bounded_by_max_connections() {
        let a = NodeSwitch::new(switch_config(V1, false));
        a.set_resolver(Arc::new(|_| {}));
        for i in 0..4u8 {
            a.send_npdu([0x02, 0, 0, 0, 1, i], &[0]).unwrap();
        }
        // The fifth pending resolution is refused outright.
        assert!(matches!(
            a.send_npdu([0x02, 0, 0, 0, 2, 0], &[0]),
            Err(LinkError::ResolutionTimeout)
        ));
        // Queued frames against an existing pending entry still work.
        a.send_npdu([0x02, 0, 0, 0, 1, 0], &[1]).unwrap();
    }

    #[tokio::test]
    async fn resolution_with_only_bad_uris_clears_pending() {
        let a = NodeSwitch::new(switch_config(V1, false));
        a.set_resolver(Arc::new(|_| {}));
        a.send_npdu(V2, &[0]).unwrap();
        a.handle_resolution_ack(V2, &["http://evil.example/".to_owned()]);
        // The pending entry is gone, so a fresh send re-resolves rather
        // than queueing behind a dead entry.
        let resolved = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = resolved.clone();
        a.set_resolver(Arc::new(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        a.send_npdu(V2, &[1]).unwrap();
        assert_eq!(resolved.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pending_resolutions_expire() {
        let a = NodeSwitch::new(switch_config(V1, false));
        a.set_resolver(Arc::new(|_| {}));
        a.send_npdu(V2, &[0]).unwrap();
        a.sweep(Instant::now() + RESOLUTION_TIMEOUT + Duration::from_millis(1));
        assert_eq!(a.shared.table.lock().unwrap().pending.len(), 0);
    }
}
