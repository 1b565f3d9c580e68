// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The hub function (Annex AB.6.5): accepts spoke connections, keeps the
//! VMAC and UUID tables, and routes BVLC-SC messages between spokes.
//!
//! Unicast forwarding passes the received WebSocket payload through
//! untouched; only the fixed header is peeked for the routing decision.
//! Broadcasts fan out concurrently to every connected spoke except the
//! origin. Every inbound message with an origin VMAC is checked against the
//! VMAC the connection authenticated as; a mismatch earns the sender a NAK
//! and the frame goes nowhere.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::error::LinkError;
use crate::sc::connection::{
    CloseReason, Connection, ConnectionConfig, Output, Role, State,
};
use crate::sc::tls::{self, TlsMaterial};
use crate::sc::{HUB_SUBPROTOCOL, SC_MAX_BVLC, SC_MAX_NPDU};
use crate::wire::bvlcsc::{
    function, nak, ScError, ScFrame, ScHeader, ScPayload, ScVmac, SC_BROADCAST,
};
use crate::wire::{Decodable, Encodable};

const LOG: &str = "bacnet::sc::hub";

/// Pending (mid-handshake) VMAC reservations expire after this.
const PENDING_TTL: Duration = Duration::from_secs(30);

/// Frames addressed to the hub's own node are handed to this callback.
pub type HubDeliver = Arc<dyn Fn(ScVmac, Vec<u8>) + Send + Sync>;

#[derive(Clone)]
pub struct HubConfig {
    pub listen: SocketAddr,
    pub vmac: ScVmac,
    pub uuid: Uuid,
    /// `None` runs the plaintext test mode, which logs a WARNING per
    /// accepted connection.
    pub tls: Option<TlsMaterial>,
    pub max_connections: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
}

struct PeerHandle {
    uuid: Uuid,
    out: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct HubTable {
    conns: HashMap<ScVmac, PeerHandle>,
    by_uuid: HashMap<Uuid, ScVmac>,
    pending: HashMap<ScVmac, Instant>,
}

impl HubTable {
    fn sweep_pending(&mut self, now: Instant) {
        self.pending.retain(|_, t| now.duration_since(*t) < PENDING_TTL);
    }

    /// Attempts to reserve an identity arriving in a Connect-Request.
    fn reserve(
        &mut self,
        vmac: ScVmac,
        uuid: Uuid,
        max_connections: usize,
        now: Instant,
    ) -> Result<(), u16> {
        self.sweep_pending(now);
        if self.conns.contains_key(&vmac) || self.pending.contains_key(&vmac) {
            return Err(nak::CODE_NODE_DUPLICATE_VMAC);
        }
        if self.by_uuid.contains_key(&uuid) {
            return Err(nak::CODE_NODE_DUPLICATE_VMAC);
        }
        if self.conns.len() + self.pending.len() >= max_connections {
            return Err(nak::CODE_OUT_OF_RESOURCES);
        }
        self.pending.insert(vmac, now);
        Ok(())
    }

    fn commit(&mut self, vmac: ScVmac, uuid: Uuid, out: mpsc::UnboundedSender<Message>) {
        self.pending.remove(&vmac);
        self.by_uuid.insert(uuid, vmac);
        self.conns.insert(vmac, PeerHandle { uuid, out });
    }

    fn remove(&mut self, vmac: ScVmac) {
        self.pending.remove(&vmac);
        if let Some(peer) = self.conns.remove(&vmac) {
            self.by_uuid.remove(&peer.uuid);
        }
    }
}

struct Shared {
    table: Mutex<HubTable>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    deliver: Option<HubDeliver>,
    config: HubConfig,
}

/// The hub.
pub struct HubFunction {
    config: HubConfig,
    deliver: Option<HubDeliver>,
    running: Option<Running>,
}

struct Running {
    shared: Arc<Shared>,
    listener_task: JoinHandle<()>,
    local: SocketAddr,
}

impl HubFunction {
    pub fn new(config: HubConfig) -> HubFunction {
        HubFunction { config, deliver: None, running: None }
    }

    /// Installs the callback receiving NPDUs addressed to the hub's own
    /// node (or broadcast). Must be set before start.
    pub fn set_deliver(&mut self, deliver: HubDeliver) {
        self.deliver = Some(deliver);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local)
    }

    pub fn connection_count(&self) -> usize {
        self.running
            .as_ref()
            .map(|r| r.shared.table.lock().unwrap().conns.len())
            .unwrap_or(0)
    }

    pub async fn start(&mut self) -> Result<(), LinkError> {
        let listener = TcpListener::bind(self.config.listen).await.map_err(LinkError::BindFailed)?;
        let local = listener.local_addr().map_err(LinkError::BindFailed)?;
        let tls = match &self.config.tls {
            Some(material) => Some(tokio_rustls::TlsAcceptor::from(
                tls::server_config(material)
                    .map_err(|e| LinkError::InvalidAddress(e.to_string()))?,
            )),
            None => None,
        };
        info!(target: LOG, "listening on {} ({})", local,
            if tls.is_some() { "tls 1.3" } else { "PLAINTEXT" });

        let shared = Arc::new(Shared {
            table: Mutex::new(HubTable::default()),
            tasks: Mutex::new(Vec::new()),
            deliver: self.deliver.clone(),
            config: self.config.clone(),
        });
        let accept_shared = shared.clone();
        let listener_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(target: LOG, "accept failed: {}", e);
                        continue;
                    }
                };
                let shared = accept_shared.clone();
                let tls = tls.clone();
                let task = tokio::spawn(async move {
                    if let Err(e) = serve_spoke(shared, stream, peer, tls).await {
                        debug!(target: LOG, "spoke {} ended: {}", peer, e);
                    }
                });
                accept_shared.tasks.lock().unwrap().push(task);
            }
        });
        self.running = Some(Running { shared, listener_task, local });
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.listener_task.abort();
            for task in running.shared.tasks.lock().unwrap().drain(..) {
                task.abort();
            }
            let mut table = running.shared.table.lock().unwrap();
            table.conns.clear();
            table.by_uuid.clear();
            table.pending.clear();
            info!(target: LOG, "stopped");
        }
    }
}

impl Drop for HubFunction {
    fn drop(&mut self) {
        self.stop();
    }
}

fn subprotocol_callback(
    request: &Request,
    mut response: Response,
) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !offered.split(',').any(|p| p.trim() == HUB_SUBPROTOCOL) {
        warn!(target: LOG, "connection without {} subprotocol refused", HUB_SUBPROTOCOL);
        return Err(ErrorResponse::new(Some("unsupported subprotocol".into())));
    }
    response
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(HUB_SUBPROTOCOL));
    Ok(response)
}

async fn serve_spoke(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<tokio_rustls::TlsAcceptor>,
) -> Result<(), anyhow::Error> {
    stream.set_nodelay(true)?;
    match tls {
        Some(acceptor) => {
            let stream = acceptor.accept(stream).await?;
            let ws = tokio_tungstenite::accept_hdr_async_with_config(
                stream,
                subprotocol_callback,
                Some(crate::sc::ws_config()),
            )
            .await?;
            pump_spoke(shared, ws, peer).await
        }
        None => {
            warn!(target: LOG, "PLAINTEXT connection accepted from {} (test mode)", peer);
            let ws = tokio_tungstenite::accept_hdr_async_with_config(
                stream,
                subprotocol_callback,
                Some(crate::sc::ws_config()),
            )
            .await?;
            pump_spoke(shared, ws, peer).await
        }
    }
}

async fn pump_spoke<S>(
    shared: Arc<Shared>,
    ws: WebSocketStream<S>,
    peer: SocketAddr,
) -> Result<(), anyhow::Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let config = &shared.config;
    let mut machine = Connection::new(
        Role::Accepter,
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
    let _ = machine.connect(Instant::now());

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.next().await {
            if ws_tx.send(message).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut auth: Option<(ScVmac, Uuid)> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let result: Result<(), anyhow::Error> = loop {
        let message = tokio::select! {
            message = ws_rx.next() => message,
            _ = tick.tick() => {
                if run_outputs(machine.on_tick(Instant::now()), &shared, &out_tx, auth) {
                    break Ok(());
                }
                continue;
            }
        };
        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(e)) => break Err(e.into()),
            None => break Ok(()),
        };
        let bytes = match message {
            Message::Binary(bytes) => bytes,
            Message::Close(_) => break Ok(()),
            // Control frames are tungstenite's business.
            _ => continue,
        };
        if bytes.len() > SC_MAX_BVLC as usize {
            if run_outputs(machine.on_oversized_frame(bytes.len()), &shared, &out_tx, auth) {
                break Ok(());
            }
            continue;
        }

        let header = match ScHeader::peek(&bytes) {
            Ok(header) => header,
            Err(e) => {
                warn!(target: LOG, "undecodable frame from {}: {}", peer, e);
                continue;
            }
        };

        // Pre-handshake: only the Connect-Request path.
        if auth.is_none() {
            match ScFrame::decode(&bytes) {
                Ok(frame) => {
                    if let ScPayload::ConnectRequest(params) = frame.payload {
                        let reserve = shared.table.lock().unwrap().reserve(
                            params.vmac,
                            params.uuid,
                            shared.config.max_connections,
                            Instant::now(),
                        );
                        if let Err(code) = reserve {
                            info!(target: LOG, "refusing {}: code {}", peer, code);
                            let mut result = ScFrame::new(
                                frame.message_id,
                                ScPayload::Result {
                                    acked_function: function::CONNECT_REQUEST,
                                    error: Some(ScError {
                                        header_marker: 0,
                                        class: nak::CLASS_COMMUNICATION,
                                        code,
                                        details: String::new(),
                                    }),
                                },
                            );
                            result.is_nack = true;
                            let _ = out_tx.unbounded_send(Message::Binary(result.to_bytes()));
                            break Ok(());
                        }
                        let outputs = machine.on_frame(
                            ScFrame::new(frame.message_id, ScPayload::ConnectRequest(params)),
                            Instant::now(),
                        );
                        shared.table.lock().unwrap().commit(
                            params.vmac,
                            params.uuid,
                            out_tx.clone(),
                        );
                        auth = Some((params.vmac, params.uuid));
                        info!(target: LOG, "spoke {} connected as {}", peer,
                            hex::encode(params.vmac));
                        if run_outputs(outputs, &shared, &out_tx, auth) {
                            break Ok(());
                        }
                        continue;
                    }
                    // Anything else pre-handshake is a violation.
                    if run_outputs(
                        machine.on_frame(frame, Instant::now()),
                        &shared,
                        &out_tx,
                        auth,
                    ) {
                        break Ok(());
                    }
                    continue;
                }
                Err(e) => {
                    warn!(target: LOG, "bad handshake frame from {}: {}", peer, e);
                    break Ok(());
                }
            }
        }
        let (auth_vmac, _) = auth.unwrap();

        // Origin enforcement applies to every frame claiming an origin.
        if let Some(origin) = header.origin {
            if origin != auth_vmac {
                warn!(target: LOG, "origin VMAC spoof from {}: claimed {}, is {}",
                    peer, hex::encode(origin), hex::encode(auth_vmac));
                let mut result = ScFrame::new(
                    header.message_id,
                    ScPayload::Result {
                        acked_function: header.function,
                        error: Some(ScError {
                            header_marker: 0,
                            class: nak::CLASS_COMMUNICATION,
                            code: nak::CODE_VMAC_MISMATCH,
                            details: String::new(),
                        }),
                    },
                );
                result.is_nack = true;
                let _ = out_tx.unbounded_send(Message::Binary(result.to_bytes()));
                continue;
            }
        }

        match header.destination {
            Some(dest) if dest == SC_BROADCAST => {
                // Fan out the raw bytes to every other spoke.
                let targets: Vec<mpsc::UnboundedSender<Message>> = {
                    let table = shared.table.lock().unwrap();
                    table
                        .conns
                        .iter()
                        .filter(|(vmac, _)| **vmac != auth_vmac)
                        .map(|(_, p)| p.out.clone())
                        .collect()
                };
                for target in targets {
                    let _ = target.unbounded_send(Message::Binary(bytes.clone()));
                }
                // The hub's own node hears broadcasts as well.
                deliver_locally(&shared, &bytes);
            }
            Some(dest) if dest != shared.config.vmac => {
                let target = shared
                    .table
                    .lock()
                    .unwrap()
                    .conns
                    .get(&dest)
                    .map(|p| p.out.clone());
                match target {
                    Some(out) => {
                        let _ = out.unbounded_send(Message::Binary(bytes));
                    }
                    None => {
                        debug!(target: LOG, "no spoke for {}", hex::encode(dest));
                        let mut result = ScFrame::new(
                            header.message_id,
                            ScPayload::Result {
                                acked_function: header.function,
                                error: Some(ScError {
                                    header_marker: 0,
                                    class: nak::CLASS_COMMUNICATION,
                                    code: nak::CODE_NODE_NOT_CONNECTED,
                                    details: String::new(),
                                }),
                            },
                        );
                        result.is_nack = true;
                        let _ = out_tx.unbounded_send(Message::Binary(result.to_bytes()));
                    }
                }
            }
            _ => {
                // For the hub itself: heartbeats, disconnects, NPDUs.
                match ScFrame::decode(&bytes) {
                    Ok(frame) => {
                        if run_outputs(
                            machine.on_frame(frame, Instant::now()),
                            &shared,
                            &out_tx,
                            auth,
                        ) {
                            break Ok(());
                        }
                    }
                    Err(e) => {
                        warn!(target: LOG, "undecodable frame from {}: {}", peer, e);
                    }
                }
            }
        }
    };

    if let Some((vmac, _)) = auth {
        shared.table.lock().unwrap().remove(vmac);
        info!(target: LOG, "spoke {} ({}) disconnected", peer, hex::encode(vmac));
    }
    writer.abort();
    result
}

/// Applies machine outputs; returns true when the connection should close.
fn run_outputs(
    outputs: Vec<Output>,
    shared: &Arc<Shared>,
    out_tx: &mpsc::UnboundedSender<Message>,
    auth: Option<(ScVmac, Uuid)>,
) -> bool {
    let mut close = false;
    for output in outputs {
        match output {
            Output::Send(frame) => {
                let _ = out_tx.unbounded_send(Message::Binary(frame.to_bytes()));
            }
            Output::Deliver(frame) => {
                if let (ScPayload::EncapsulatedNpdu(npdu), Some((vmac, _))) =
                    (&frame.payload, auth)
                {
                    let origin = frame.origin.unwrap_or(vmac);
                    if let Some(deliver) = &shared.deliver {
                        deliver(origin, npdu.clone());
                    }
                }
            }
            Output::Connected(_) => {}
            Output::Close(reason) => {
                if reason != CloseReason::Disconnected {
                    debug!(target: LOG, "closing spoke: {:?}", reason);
                }
                close = true;
            }
        }
    }
    close
}

fn deliver_locally(shared: &Arc<Shared>, bytes: &[u8]) {
    let Some(deliver) = &shared.deliver else { return };
    // Broadcast payloads need a full decode only on this local path.
    match ScFrame::decode(bytes) {
        Ok(frame) => {
            if let ScPayload::EncapsulatedNpdu(npdu) = frame.payload {
                if let Some(origin) = frame.origin {
                    deliver(origin, npdu);
                }
            }
        }
        Err(e) => debug!(target: LOG, "broadcast not decodable for local node: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use crate::wire::bvlcsc::ConnectParams;

    const N1: ScVmac = [0x02, 0, 0, 0, 0, 0x01];
    const N2: ScVmac = [0x02, 0, 0, 0, 0, 0x02];
    const HUB: ScVmac = [0x02, 0, 0, 0, 0, 0xFF];

    fn hub_config() -> HubConfig {
        HubConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            vmac: HUB,
            uuid: Uuid::from_bytes([0xAA; 16]),
            tls: None,
            max_connections: 8,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
        }
    }

    type Client = WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    async fn connect_spoke(addr: SocketAddr, vmac: ScVmac, uuid_byte: u8) -> Client {
        let mut request = format!("ws://{}", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(HUB_SUBPROTOCOL));
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        let params = ConnectParams {
            vmac,
            uuid: Uuid::from_bytes([uuid_byte; 16]),
            max_bvlc_len: SC_MAX_BVLC,
            max_npdu_len: SC_MAX_NPDU,
        };
        ws.send(Message::Binary(
            ScFrame::new(1, ScPayload::ConnectRequest(params)).to_bytes(),
        ))
        .await
        .unwrap();
        let reply = recv_frame(&mut ws).await;
        assert!(matches!(reply.payload, ScPayload::ConnectAccept(_)), "{:?}", reply);
        ws
    }

    async fn recv_frame(ws: &mut Client) -> ScFrame {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .expect("ws error");
            if let Message::Binary(bytes) = message {
                return ScFrame::decode(&bytes).unwrap();
            }
        }
    }

    async fn started_hub() -> (HubFunction, SocketAddr) {
        let mut hub = HubFunction::new(hub_config());
        hub.start().await.unwrap();
        let addr = hub.local_addr().unwrap();
        (hub, addr)
    }

    #[tokio::test]
    async fn routes_unicast_between_spokes() {
        let (_hub, addr) = started_hub().await;
        let mut n1 = connect_spoke(addr, N1, 1).await;
        let mut n2 = connect_spoke(addr, N2, 2).await;

        let frame = ScFrame::new(10, ScPayload::EncapsulatedNpdu(vec![0x01, 0x04, 0xAA]))
            .with_origin(N1)
            .with_destination(N2);
        n1.send(Message::Binary(frame.to_bytes())).await.unwrap();

        let received = recv_frame(&mut n2).await;
        assert_eq!(received.origin, Some(N1));
        assert_eq!(received.destination, Some(N2));
        assert!(matches!(received.payload, ScPayload::EncapsulatedNpdu(ref n) if n == &[0x01, 0x04, 0xAA]));
    }

    #[tokio::test]
    async fn rejects_spoofed_origin_vmac() {
        let (_hub, addr) = started_hub().await;
        let mut n1 = connect_spoke(addr, N1, 1).await;
        let mut n2 = connect_spoke(addr, N2, 2).await;

        // N1 claims to be N2.
        let spoofed = ScFrame::new(11, ScPayload::EncapsulatedNpdu(vec![0xEE]))
            .with_origin(N2)
            .with_destination(N2);
        n1.send(Message::Binary(spoofed.to_bytes())).await.unwrap();

        let reply = recv_frame(&mut n1).await;
        assert!(reply.is_nack);
        match reply.payload {
            ScPayload::Result { error: Some(e), .. } => {
                assert_eq!(e.code, nak::CODE_VMAC_MISMATCH);
            }
            other => panic!("expected NAK, got {:?}", other),
        }
        // N2 must see nothing.
        let nothing = tokio::time::timeout(Duration::from_millis(300), n2.next()).await;
        assert!(nothing.is_err(), "spoofed frame reached the target");
    }

    #[tokio::test]
    async fn broadcast_reaches_all_but_origin() {
        let (_hub, addr) = started_hub().await;
        let mut n1 = connect_spoke(addr, N1, 1).await;
        let mut n2 = connect_spoke(addr, N2, 2).await;
        let n3_vmac: ScVmac = [0x02, 0, 0, 0, 0, 0x03];
        let mut n3 = connect_spoke(addr, n3_vmac, 3).await;

        let frame = ScFrame::new(12, ScPayload::EncapsulatedNpdu(vec![0x01, 0x00]))
            .with_origin(N1)
            .with_destination(SC_BROADCAST);
        n1.send(Message::Binary(frame.to_bytes())).await.unwrap();

        assert_eq!(recv_frame(&mut n2).await.origin, Some(N1));
        assert_eq!(recv_frame(&mut n3).await.origin, Some(N1));
        let nothing = tokio::time::timeout(Duration::from_millis(300), n1.next()).await;
        assert!(nothing.is_err(), "broadcast echoed to its origin");
    }

    #[tokio::test]
    async fn duplicate_vmac_is_refused() {
        let (hub, addr) = started_hub().await;
        let _n1 = connect_spoke(addr, N1, 1).await;

        let mut request = format!("ws://{}", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(HUB_SUBPROTOCOL));
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        let params = ConnectParams {
            vmac: N1,
            uuid: Uuid::from_bytes([9; 16]),
            max_bvlc_len: SC_MAX_BVLC,
            max_npdu_len: SC_MAX_NPDU,
        };
        ws.send(Message::Binary(
            ScFrame::new(2, ScPayload::ConnectRequest(params)).to_bytes(),
        ))
        .await
        .unwrap();
        let reply = recv_frame(&mut ws).await;
        assert!(reply.is_nack);
        match reply.payload {
            ScPayload::Result { error: Some(e), .. } => {
                assert_eq!(e.code, nak::CODE_NODE_DUPLICATE_VMAC);
            }
            other => panic!("expected refusal, got {:?}", other),
        }
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn unknown_destination_naks() {
        let (_hub, addr) = started_hub().await;
        let mut n1 = connect_spoke(addr, N1, 1).await;
        let frame = ScFrame::new(13, ScPayload::EncapsulatedNpdu(vec![0x01]))
            .with_origin(N1)
            .with_destination([0x02, 9, 9, 9, 9, 9]);
        n1.send(Message::Binary(frame.to_bytes())).await.unwrap();
        let reply = recv_frame(&mut n1).await;
        assert!(reply.is_nack);
        match reply.payload {
            ScPayload::Result { error: Some(e), .. } => {
                assert_eq!(e.code, nak::CODE_NODE_NOT_CONNECTED);
            }
            other => panic!("{:?}", other),
        }
    }

    #[tokio::test]
    async fn heartbeats_are_answered() {
        let (_hub, addr) = started_hub().await;
        let mut n1 = connect_spoke(addr, N1, 1).await;
        n1.send(Message::Binary(
            ScFrame::new(44, ScPayload::HeartbeatRequest).to_bytes(),
        ))
        .await
        .unwrap();
        let reply = recv_frame(&mut n1).await;
        assert_eq!(reply.message_id, 44);
        assert!(matches!(reply.payload, ScPayload::HeartbeatAck));
    }

    #[tokio::test]
    async fn hub_delivers_frames_for_its_own_node() {
        let mut hub = HubFunction::new(hub_config());
        let (tx, rx) = std::sync::mpsc::channel::<(ScVmac, Vec<u8>)>();
        hub.set_deliver(Arc::new(move |origin, npdu| {
            let _ = tx.send((origin, npdu));
        }));
        hub.start().await.unwrap();
        let addr = hub.local_addr().unwrap();
        let mut n1 = connect_spoke(addr, N1, 1).await;

        let frame = ScFrame::new(15, ScPayload::EncapsulatedNpdu(vec![0xAB]))
            .with_origin(N1)
            .with_destination(HUB);
        n1.send(Message::Binary(frame.to_bytes())).await.unwrap();

        let (origin, npdu) = tokio::task::spawn_blocking(move || {
            rx.recv_timeout(Duration::from_secs(2)).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(origin, N1);
        assert_eq!(npdu, [0xAB]);
    }

    #[tokio::test]
    async fn connection_count_tracks_disconnects() {
        let (hub, addr) = started_hub().await;
        let n1 = connect_spoke(addr, N1, 1).await;
        assert_eq!(hub.connection_count(), 1);
        drop(n1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hub.connection_count(), 0);
    }
}
