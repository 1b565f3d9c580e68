// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! BACnet/IP over UDP/IPv4 (Annex J).
//!
//! The port owns one UDP socket and three tasks: a reader pumping datagrams
//! into the stack, a writer draining the outbound queue, and (when
//! configured as a foreign device) a re-registration loop. Acting as a BBMD
//! layers the [`super::bbmd::Bbmd`] tables onto the same socket.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::channel::mpsc;
use futures::StreamExt;
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::addr::MacAddr;
use crate::datalink::bbmd::{Bbmd, BbmdAction, BbmdConfig};
use crate::datalink::{PortId, ReceivedFrame, TransportPort};
use crate::error::LinkError;
use crate::util::sink::UnboundedSink;
use crate::wire::bvlc4::{result_code, Bvlc4};
use crate::wire::{Decodable, Encodable};

const LOG: &str = "bacnet::bip4";

/// The Annex J well-known port, 0xBAC0.
pub const BACNET_IP_PORT: u16 = 47808;

/// Room for the largest BVLC frame a peer may send.
const RECV_BUF_LEN: usize = 1500;

/// Largest NPDU Annex J can carry (1497 minus the unicast BVLC header).
const MAX_NPDU: usize = 1497 - 4;

/// Foreign-device registration settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignDeviceConfig {
    pub bbmd: SocketAddrV4,
    pub ttl_seconds: u16,
}

#[derive(Debug, Clone)]
pub struct Bip4Config {
    /// Local bind address. Port 0 reserves an ephemeral port; the port that
    /// was actually bound is cached and used from then on.
    pub bind: SocketAddrV4,
    /// Destination for link broadcasts, usually the subnet's directed
    /// broadcast address.
    pub broadcast: SocketAddrV4,
    pub foreign_device: Option<ForeignDeviceConfig>,
    pub bbmd: Option<BbmdConfig>,
}

impl Default for Bip4Config {
    fn default() -> Self {
        Bip4Config {
            bind: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, BACNET_IP_PORT),
            broadcast: SocketAddrV4::new(Ipv4Addr::BROADCAST, BACNET_IP_PORT),
            foreign_device: None,
            bbmd: None,
        }
    }
}

enum OutFrame {
    Unicast(SocketAddrV4, Vec<u8>),
    Broadcast(Vec<u8>),
}

struct Running {
    out_tx: mpsc::UnboundedSender<OutFrame>,
    /// The actually-bound local address (meaningful when bind port was 0).
    local: SocketAddrV4,
    bbmd: Option<Arc<Mutex<Bbmd>>>,
    tasks: Vec<JoinHandle<()>>,
}

/// The Annex J transport port.
pub struct Bip4Port {
    config: Bip4Config,
    prebound: Option<UdpSocket>,
    running: Option<Running>,
}

impl Bip4Port {
    pub fn new(config: Bip4Config) -> Bip4Port {
        Bip4Port { config, prebound: None, running: None }
    }

    /// Binds the socket ahead of [`TransportPort::start`], so callers that
    /// need the concrete address of an ephemeral (port 0) bind can learn it
    /// before handing the port to the stack.
    pub fn prebind(&mut self) -> Result<SocketAddrV4, LinkError> {
        let socket = Self::bind_socket(self.config.bind)?;
        let local = match socket.local_addr().map_err(LinkError::BindFailed)? {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(v6) => return Err(LinkError::InvalidAddress(v6.to_string())),
        };
        self.prebound = Some(socket);
        Ok(local)
    }

    /// The bound socket address once started.
    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.running.as_ref().map(|r| r.local)
    }

    /// Live foreign-device registrations when acting as a BBMD.
    pub fn foreign_device_count(&self) -> usize {
        self.running
            .as_ref()
            .and_then(|r| r.bbmd.as_ref())
            .map(|b| b.lock().unwrap().foreign_device_count())
            .unwrap_or(0)
    }

    fn bind_socket(bind: SocketAddrV4) -> Result<UdpSocket, LinkError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(LinkError::BindFailed)?;
        socket.set_reuse_address(true).map_err(LinkError::BindFailed)?;
        socket.set_broadcast(true).map_err(LinkError::BindFailed)?;
        socket.bind(&SocketAddr::V4(bind).into()).map_err(LinkError::BindFailed)?;
        socket.set_nonblocking(true).map_err(LinkError::BindFailed)?;
        UdpSocket::from_std(socket.into()).map_err(LinkError::BindFailed)
    }

    fn enqueue(&self, frame: OutFrame) -> Result<(), LinkError> {
        let running = self.running.as_ref().ok_or(LinkError::NotStarted)?;
        running.out_tx.unbounded_send(frame).map_err(|_| LinkError::NotStarted)
    }
}

impl TransportPort for Bip4Port {
    fn link_type(&self) -> &'static str {
        "bip4"
    }

    fn start(
        &mut self,
        id: PortId,
        rx_sink: UnboundedSink<ReceivedFrame>,
    ) -> Result<(), LinkError> {
        let socket = match self.prebound.take() {
            Some(socket) => Arc::new(socket),
            None => Arc::new(Self::bind_socket(self.config.bind)?),
        };
        let local = match socket.local_addr().map_err(LinkError::BindFailed)? {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(v6) => {
                return Err(LinkError::InvalidAddress(v6.to_string()));
            }
        };
        info!(target: LOG, "bound {} (broadcast {})", local, self.config.broadcast);

        let bbmd = self
            .config
            .bbmd
            .clone()
            .map(|config| Arc::new(Mutex::new(Bbmd::new(local, config))));

        let (out_tx, out_rx) = mpsc::unbounded();
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(writer_task(
            socket.clone(),
            self.config.broadcast,
            out_rx,
        )));
        tasks.push(tokio::spawn(reader_task(
            socket,
            id,
            rx_sink,
            bbmd.clone(),
            out_tx.clone(),
        )));
        if let Some(fd) = self.config.foreign_device {
            tasks.push(tokio::spawn(register_task(out_tx.clone(), fd)));
        }
        if bbmd.is_some() {
            let bbmd = bbmd.clone().unwrap();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(5));
                loop {
                    tick.tick().await;
                    bbmd.lock().unwrap().sweep(Instant::now());
                }
            }));
        }

        self.running = Some(Running { out_tx, local, bbmd, tasks });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            for task in running.tasks {
                task.abort();
            }
            info!(target: LOG, "stopped");
        }
    }

    fn send_unicast(&self, dest: &MacAddr, npdu: &[u8]) -> Result<(), LinkError> {
        let addr = dest
            .to_ipv4()
            .ok_or_else(|| LinkError::InvalidAddress(dest.to_string()))?;
        if npdu.len() > MAX_NPDU {
            return Err(LinkError::FrameTooLarge(npdu.len()));
        }
        let frame = Bvlc4::OriginalUnicastNpdu(npdu.to_vec()).to_bytes();
        self.enqueue(OutFrame::Unicast(addr, frame))
    }

    fn send_broadcast(&self, npdu: &[u8]) -> Result<(), LinkError> {
        if npdu.len() > MAX_NPDU {
            return Err(LinkError::FrameTooLarge(npdu.len()));
        }
        if let Some(fd) = self.config.foreign_device {
            // Foreign devices reach the subnet through their BBMD.
            let frame = Bvlc4::DistributeBroadcastToNetwork(npdu.to_vec()).to_bytes();
            return self.enqueue(OutFrame::Unicast(fd.bbmd, frame));
        }
        let frame = Bvlc4::OriginalBroadcastNpdu(npdu.to_vec()).to_bytes();
        self.enqueue(OutFrame::Broadcast(frame))?;
        // A BBMD relays its own broadcasts beyond the subnet as well.
        if let Some(running) = &self.running {
            if let Some(bbmd) = &running.bbmd {
                for action in bbmd.lock().unwrap().originate(npdu, Instant::now()) {
                    if let BbmdAction::Send(addr, frame) = action {
                        self.enqueue(OutFrame::Unicast(addr, frame.to_bytes()))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn max_npdu_len(&self) -> usize {
        MAX_NPDU
    }
}

impl Drop for Bip4Port {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn writer_task(
    socket: Arc<UdpSocket>,
    broadcast: SocketAddrV4,
    mut out_rx: mpsc::UnboundedReceiver<OutFrame>,
) {
    while let Some(frame) = out_rx.next().await {
        let (dest, bytes) = match &frame {
            OutFrame::Unicast(addr, bytes) => (*addr, bytes),
            OutFrame::Broadcast(bytes) => (broadcast, bytes),
        };
        if let Err(e) = socket.send_to(bytes, SocketAddr::V4(dest)).await {
            warn!(target: LOG, "send to {} failed: {}", dest, e);
        }
    }
}

async fn reader_task(
    socket: Arc<UdpSocket>,
    id: PortId,
    rx_sink: UnboundedSink<ReceivedFrame>,
    bbmd: Option<Arc<Mutex<Bbmd>>>,
    out_tx: mpsc::UnboundedSender<OutFrame>,
) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(target: LOG, "recv failed: {}", e);
                continue;
            }
        };
        let from = match from {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => continue,
        };
        let frame = match Bvlc4::decode(&buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: LOG, "dropping bad BVLC frame from {}: {}", from, e);
                continue;
            }
        };

        if let Some(bbmd) = &bbmd {
            let actions = bbmd.lock().unwrap().handle(from, &frame, Instant::now());
            if !actions.is_empty() {
                run_bbmd_actions(actions, id, &rx_sink, &out_tx);
                continue;
            }
        }

        match frame {
            Bvlc4::OriginalUnicastNpdu(npdu) | Bvlc4::OriginalBroadcastNpdu(npdu) => {
                rx_sink.send(ReceivedFrame {
                    port: id,
                    source_mac: MacAddr::from_ipv4(from),
                    npdu,
                });
            }
            Bvlc4::ForwardedNpdu { origin, npdu } => {
                rx_sink.send(ReceivedFrame {
                    port: id,
                    source_mac: MacAddr::from_ipv4(origin),
                    npdu,
                });
            }
            Bvlc4::Result(code) => {
                if code == result_code::SUCCESS {
                    debug!(target: LOG, "BVLC result success from {}", from);
                } else {
                    warn!(target: LOG, "BVLC NAK {:#06x} from {}", code, from);
                }
            }
            other => {
                // BDT/FDT administration addressed at a node that is not a
                // BBMD.
                debug!(target: LOG, "ignoring {:?} from {}", other, from);
            }
        }
    }
}

fn run_bbmd_actions(
    actions: Vec<BbmdAction>,
    id: PortId,
    rx_sink: &UnboundedSink<ReceivedFrame>,
    out_tx: &mpsc::UnboundedSender<OutFrame>,
) {
    for action in actions {
        match action {
            BbmdAction::Send(addr, frame) => {
                let _ = out_tx.unbounded_send(OutFrame::Unicast(addr, frame.to_bytes()));
            }
            BbmdAction::Broadcast(frame) => {
                let _ = out_tx.unbounded_send(OutFrame::Broadcast(frame.to_bytes()));
            }
            BbmdAction::Deliver { origin, npdu } => {
                rx_sink.send(ReceivedFrame {
                    port: id,
                    source_mac: MacAddr::from_ipv4(origin),
                    npdu,
                });
            }
        }
    }
}

async fn register_task(out_tx: mpsc::UnboundedSender<OutFrame>, fd: ForeignDeviceConfig) {
    let frame = Bvlc4::RegisterForeignDevice { ttl_seconds: fd.ttl_seconds }.to_bytes();
    // Re-register at half the TTL so one lost datagram cannot expire us.
    let interval = Duration::from_secs((fd.ttl_seconds as u64 / 2).max(1));
    loop {
        if out_tx.unbounded_send(OutFrame::Unicast(fd.bbmd, frame.clone())).is_err() {
            return;
        }
        debug!(target: LOG, "registered with BBMD {} (ttl {} s)", fd.bbmd, fd.ttl_seconds);
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::sink;

    fn localhost_config() -> Bip4Config {
        Bip4Config {
            bind: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            broadcast: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            ..Bip4Config::default()
        }
    }

    #[tokio::test]
    async fn ephemeral_bind_reports_real_port() {
        let mut port = Bip4Port::new(localhost_config());
        let (tx, _rx) = sink::unbounded("test");
        port.start(PortId(0), tx).unwrap();
        let local = port.local_addr().unwrap();
        assert_ne!(local.port(), 0);
        port.stop();
        assert!(port.local_addr().is_none());
    }

    #[tokio::test]
    async fn unicast_between_two_ports() {
        let mut a = Bip4Port::new(localhost_config());
        let mut b = Bip4Port::new(localhost_config());
        let (tx_a, _rx_a) = sink::unbounded("a");
        let (tx_b, mut rx_b) = sink::unbounded("b");
        a.start(PortId(0), tx_a).unwrap();
        b.start(PortId(1), tx_b).unwrap();

        let b_mac = MacAddr::from_ipv4(b.local_addr().unwrap());
        a.send_unicast(&b_mac, &[0x01, 0x04, 0xAA]).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), async {
            rx_b.next().await.unwrap()
        })
        .await
        .unwrap();
        assert_eq!(frame.port, PortId(1));
        assert_eq!(frame.npdu, [0x01, 0x04, 0xAA]);
        assert_eq!(frame.source_mac, MacAddr::from_ipv4(a.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn foreign_device_registers_and_distributes() {
        // A plain UDP socket stands in for the BBMD.
        let bbmd_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let bbmd_addr = match bbmd_sock.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        };

        let mut port = Bip4Port::new(Bip4Config {
            foreign_device: Some(ForeignDeviceConfig { bbmd: bbmd_addr, ttl_seconds: 60 }),
            ..localhost_config()
        });
        let (tx, _rx) = sink::unbounded("fd");
        port.start(PortId(0), tx).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), bbmd_sock.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            Bvlc4::decode(&buf[..len]).unwrap(),
            Bvlc4::RegisterForeignDevice { ttl_seconds: 60 }
        );

        // Broadcasts leave as Distribute-Broadcast-To-Network toward the BBMD.
        port.send_broadcast(&[0x01, 0x00]).unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), bbmd_sock.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            Bvlc4::decode(&buf[..len]).unwrap(),
            Bvlc4::DistributeBroadcastToNetwork(vec![0x01, 0x00])
        );
    }

    #[tokio::test]
    async fn bbmd_mode_answers_registration() {
        let mut port = Bip4Port::new(Bip4Config {
            bbmd: Some(BbmdConfig::default()),
            ..localhost_config()
        });
        let (tx, _rx) = sink::unbounded("bbmd");
        port.start(PortId(0), tx).unwrap();
        let bbmd_addr = port.local_addr().unwrap();

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        client
            .send_to(
                &Bvlc4::RegisterForeignDevice { ttl_seconds: 30 }.to_bytes(),
                SocketAddr::V4(bbmd_addr),
            )
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            Bvlc4::decode(&buf[..len]).unwrap(),
            Bvlc4::Result(result_code::SUCCESS)
        );
        assert_eq!(port.foreign_device_count(), 1);
    }

    #[test]
    fn sends_fail_before_start() {
        let port = Bip4Port::new(localhost_config());
        let mac = MacAddr::from_ipv4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 47808));
        assert!(matches!(port.send_unicast(&mac, &[0]), Err(LinkError::NotStarted)));
        assert!(matches!(port.send_broadcast(&[0]), Err(LinkError::NotStarted)));
    }

    #[tokio::test]
    async fn oversized_npdu_is_refused() {
        let mut port = Bip4Port::new(localhost_config());
        let (tx, _rx) = sink::unbounded("big");
        port.start(PortId(0), tx).unwrap();
        let mac = MacAddr::from_ipv4(port.local_addr().unwrap());
        let big = vec![0u8; MAX_NPDU + 1];
        assert!(matches!(
            port.send_unicast(&mac, &big),
            Err(LinkError::FrameTooLarge(_))
        ));
    }
}
