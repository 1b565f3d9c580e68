// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! BACnet/IPv6 (Annex U).
//!
//! Stations address each other by 3-octet virtual MACs; the mapping to
//! actual UDP endpoints is learned from every received frame and filled on
//! demand with Virtual-Address-Resolution. Frames for unresolved VMACs wait
//! in a small bounded queue while resolution runs. A node can additionally
//! act as an Annex U broadcast-management device for registered foreign
//! devices.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::channel::mpsc;
use futures::StreamExt;
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::addr::MacAddr;
use crate::datalink::{PortId, ReceivedFrame, TransportPort};
use crate::error::LinkError;
use crate::util::sink::UnboundedSink;
use crate::wire::bvlc6::{result_code, Bvlc6, Vmac6};
use crate::wire::{Decodable, Encodable};

const LOG: &str = "bacnet::bip6";

pub const BACNET_IP6_PORT: u16 = 47808;

const RECV_BUF_LEN: usize = 1500;
/// Largest NPDU after the biggest Annex U header (forwarded form).
const MAX_NPDU: usize = 1497 - 25;

/// VMAC→endpoint cache bound; eviction prefers the longest-unseen entry.
pub const VMAC_CACHE_CAP: usize = 4096;
/// Outbound frames parked awaiting resolution.
const PENDING_CAP: usize = 16;
const PENDING_TTL: Duration = Duration::from_secs(30);

/// The all-BACnet-devices site multicast group, FF02::BAC0.
pub fn default_multicast() -> SocketAddrV6 {
    SocketAddrV6::new(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xbac0), BACNET_IP6_PORT, 0, 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignDevice6Config {
    pub bbmd: SocketAddrV6,
    pub ttl_seconds: u16,
}

/// Annex U broadcast-management tables (server role).
#[derive(Debug, Clone, Default)]
pub struct Bbmd6Config {
    /// Peer BBMDs receiving Forwarded-NPDU copies of local broadcasts.
    pub peers: Vec<SocketAddrV6>,
    pub fdt_cap: usize,
}

#[derive(Debug, Clone)]
pub struct Bip6Config {
    pub bind: SocketAddrV6,
    /// Where link "broadcasts" go: the Annex U multicast group.
    pub multicast: SocketAddrV6,
    /// This station's 3-octet virtual MAC.
    pub vmac: Vmac6,
    pub foreign_device: Option<ForeignDevice6Config>,
    pub bbmd: Option<Bbmd6Config>,
}

impl Default for Bip6Config {
    fn default() -> Self {
        Bip6Config {
            bind: SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, BACNET_IP6_PORT, 0, 0),
            multicast: default_multicast(),
            vmac: [0, 0, 1],
            foreign_device: None,
            bbmd: None,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    addr: SocketAddrV6,
    last_seen: Instant,
}

#[derive(Debug)]
struct PendingFrame {
    vmac: Vmac6,
    frame: Vec<u8>,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Registration6 {
    expires: Instant,
}

/// State shared between the send path and the reader task.
#[derive(Debug, Default)]
struct Shared {
    cache: HashMap<Vmac6, CacheEntry>,
    pending: Vec<PendingFrame>,
    fdt: HashMap<SocketAddrV6, Registration6>,
}

impl Shared {
    fn learn(&mut self, vmac: Vmac6, addr: SocketAddrV6) -> Vec<Vec<u8>> {
        let now = Instant::now();
        if self.cache.len() >= VMAC_CACHE_CAP && !self.cache.contains_key(&vmac) {
            // Longest-unseen entry gives way.
            if let Some(&stale) = self
                .cache
                .iter()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(k, _)| k)
            {
                self.cache.remove(&stale);
            }
        }
        self.cache.insert(vmac, CacheEntry { addr, last_seen: now });
        // Flush anything parked for this station.
        let mut flushed = Vec::new();
        self.pending.retain(|p| {
            if p.vmac == vmac {
                flushed.push(p.frame.clone());
                false
            } else {
                true
            }
        });
        flushed
    }

    fn lookup(&mut self, vmac: &Vmac6) -> Option<SocketAddrV6> {
        self.cache.get_mut(vmac).map(|e| {
            e.last_seen = Instant::now();
            e.addr
        })
    }

    fn sweep(&mut self, now: Instant) {
        self.pending.retain(|p| p.deadline > now);
        self.fdt.retain(|_, r| r.expires > now);
    }
}

enum OutFrame {
    To(SocketAddrV6, Vec<u8>),
    Multicast(Vec<u8>),
}

struct Running {
    out_tx: mpsc::UnboundedSender<OutFrame>,
    local: SocketAddrV6,
    shared: Arc<Mutex<Shared>>,
    tasks: Vec<JoinHandle<()>>,
}

/// The Annex U transport port.
pub struct Bip6Port {
    config: Bip6Config,
    running: Option<Running>,
}

impl Bip6Port {
    pub fn new(config: Bip6Config) -> Bip6Port {
        Bip6Port { config, running: None }
    }

    pub fn local_addr(&self) -> Option<SocketAddrV6> {
        self.running.as_ref().map(|r| r.local)
    }

    pub fn vmac(&self) -> Vmac6 {
        self.config.vmac
    }

    fn bind_socket(config: &Bip6Config) -> Result<UdpSocket, LinkError> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
            .map_err(LinkError::BindFailed)?;
        socket.set_reuse_address(true).map_err(LinkError::BindFailed)?;
        socket.set_only_v6(true).map_err(LinkError::BindFailed)?;
        socket
            .bind(&SocketAddr::V6(config.bind).into())
            .map_err(LinkError::BindFailed)?;
        if config.multicast.ip().is_multicast() {
            socket
                .join_multicast_v6(config.multicast.ip(), config.bind.scope_id())
                .map_err(LinkError::BindFailed)?;
            socket
                .set_multicast_loop_v6(false)
                .map_err(LinkError::BindFailed)?;
        }
        socket.set_nonblocking(true).map_err(LinkError::BindFailed)?;
        UdpSocket::from_std(socket.into()).map_err(LinkError::BindFailed)
    }

    fn enqueue(&self, frame: OutFrame) -> Result<(), LinkError> {
        let running = self.running.as_ref().ok_or(LinkError::NotStarted)?;
        running.out_tx.unbounded_send(frame).map_err(|_| LinkError::NotStarted)
    }
}

impl TransportPort for Bip6Port {
    fn link_type(&self) -> &'static str {
        "bip6"
    }

    fn start(
        &mut self,
        id: PortId,
        rx_sink: UnboundedSink<ReceivedFrame>,
    ) -> Result<(), LinkError> {
        let socket = Arc::new(Self::bind_socket(&self.config)?);
        let local = match socket.local_addr().map_err(LinkError::BindFailed)? {
            SocketAddr::V6(v6) => v6,
            SocketAddr::V4(v4) => return Err(LinkError::InvalidAddress(v4.to_string())),
        };
        info!(target: LOG, "bound {} vmac {}", local, hex::encode(self.config.vmac));

        let shared = Arc::new(Mutex::new(Shared::default()));
        let (out_tx, out_rx) = mpsc::unbounded();
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(writer_task(
            socket.clone(),
            self.config.multicast,
            out_rx,
        )));
        tasks.push(tokio::spawn(reader_task(
            socket,
            id,
            self.config.clone(),
            rx_sink,
            shared.clone(),
            out_tx.clone(),
        )));
        if let Some(fd) = self.config.foreign_device {
            tasks.push(tokio::spawn(register_task(out_tx.clone(), self.config.vmac, fd)));
        }
        {
            let shared = shared.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(5));
                loop {
                    tick.tick().await;
                    shared.lock().unwrap().sweep(Instant::now());
                }
            }));
        }

        self.running = Some(Running { out_tx, local, shared, tasks });
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
        let running = self.running.as_ref().ok_or(LinkError::NotStarted)?;
        let dest_vmac: Vmac6 = dest
            .as_bytes()
            .try_into()
            .map_err(|_| LinkError::InvalidAddress(dest.to_string()))?;
        if npdu.len() > MAX_NPDU {
            return Err(LinkError::FrameTooLarge(npdu.len()));
        }
        let frame = Bvlc6::OriginalUnicastNpdu {
            vmac: self.config.vmac,
            dest_vmac,
            npdu: npdu.to_vec(),
        }
        .to_bytes();

        let mut shared = running.shared.lock().unwrap();
        if let Some(addr) = shared.lookup(&dest_vmac) {
            drop(shared);
            return self.enqueue(OutFrame::To(addr, frame));
        }
        // Park the frame and solicit the station.
        if shared.pending.len() >= PENDING_CAP {
            shared.pending.remove(0);
        }
        shared.pending.push(PendingFrame {
            vmac: dest_vmac,
            frame,
            deadline: Instant::now() + PENDING_TTL,
        });
        drop(shared);
        debug!(target: LOG, "resolving vmac {}", hex::encode(dest_vmac));
        let solicit = Bvlc6::VirtualAddressResolution { vmac: self.config.vmac }.to_bytes();
        self.enqueue(OutFrame::Multicast(solicit))
    }

    fn send_broadcast(&self, npdu: &[u8]) -> Result<(), LinkError> {
        if npdu.len() > MAX_NPDU {
            return Err(LinkError::FrameTooLarge(npdu.len()));
        }
        if let Some(fd) = self.config.foreign_device {
            let frame = Bvlc6::DistributeBroadcastToNetwork {
                vmac: self.config.vmac,
                npdu: npdu.to_vec(),
            }
            .to_bytes();
            return self.enqueue(OutFrame::To(fd.bbmd, frame));
        }
        let frame =
            Bvlc6::OriginalBroadcastNpdu { vmac: self.config.vmac, npdu: npdu.to_vec() }
                .to_bytes();
        self.enqueue(OutFrame::Multicast(frame))?;
        if let (Some(bbmd), Some(running)) = (&self.config.bbmd, &self.running) {
            let local = running.local;
            let forwarded = Bvlc6::ForwardedNpdu {
                vmac: self.config.vmac,
                origin: local,
                npdu: npdu.to_vec(),
            }
            .to_bytes();
            for peer in &bbmd.peers {
                self.enqueue(OutFrame::To(*peer, forwarded.clone()))?;
            }
            let shared = running.shared.lock().unwrap();
            let now = Instant::now();
            for (addr, reg) in shared.fdt.iter() {
                if reg.expires > now {
                    self.enqueue(OutFrame::To(*addr, forwarded.clone()))?;
                }
            }
        }
        Ok(())
    }

    fn max_npdu_len(&self) -> usize {
        MAX_NPDU
    }
}

impl Drop for Bip6Port {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn writer_task(
    socket: Arc<UdpSocket>,
    multicast: SocketAddrV6,
    mut out_rx: mpsc::UnboundedReceiver<OutFrame>,
) {
    while let Some(frame) = out_rx.next().await {
        let (dest, bytes) = match &frame {
            OutFrame::To(addr, bytes) => (*addr, bytes),
            OutFrame::Multicast(bytes) => (multicast, bytes),
        };
        if let Err(e) = socket.send_to(bytes, SocketAddr::V6(dest)).await {
            warn!(target: LOG, "send to {} failed: {}", dest, e);
        }
    }
}

async fn reader_task(
    socket: Arc<UdpSocket>,
    id: PortId,
    config: Bip6Config,
    rx_sink: UnboundedSink<ReceivedFrame>,
    shared: Arc<Mutex<Shared>>,
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
            SocketAddr::V6(v6) => v6,
            SocketAddr::V4(_) => continue,
        };
        let frame = match Bvlc6::decode(&buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: LOG, "dropping bad BVLL frame from {}: {}", from, e);
                continue;
            }
        };

        // Every Annex U frame names its sender; remember where it lives and
        // release anything waiting on that VMAC.
        let flushed = shared.lock().unwrap().learn(frame.source_vmac(), from);
        for parked in flushed {
            let dest = from;
            let _ = out_tx.unbounded_send(OutFrame::To(dest, parked));
        }

        handle_frame(&config, id, from, frame, &rx_sink, &shared, &out_tx);
    }
}

fn handle_frame(
    config: &Bip6Config,
    id: PortId,
    from: SocketAddrV6,
    frame: Bvlc6,
    rx_sink: &UnboundedSink<ReceivedFrame>,
    shared: &Arc<Mutex<Shared>>,
    out_tx: &mpsc::UnboundedSender<OutFrame>,
) {
    let deliver = |vmac: Vmac6, npdu: Vec<u8>| {
        rx_sink.send(ReceivedFrame {
            port: id,
            source_mac: MacAddr::new(&vmac).unwrap(),
            npdu,
        });
    };
    match frame {
        Bvlc6::OriginalUnicastNpdu { vmac, dest_vmac, npdu } => {
            if dest_vmac == config.vmac {
                deliver(vmac, npdu);
            }
        }
        Bvlc6::OriginalBroadcastNpdu { vmac, npdu } => {
            if let Some(bbmd) = &config.bbmd {
                // Relay a local broadcast to peers and foreign devices.
                let forwarded =
                    Bvlc6::ForwardedNpdu { vmac, origin: from, npdu: npdu.clone() }.to_bytes();
                for peer in &bbmd.peers {
                    if *peer != from {
                        let _ = out_tx.unbounded_send(OutFrame::To(*peer, forwarded.clone()));
                    }
                }
                let now = Instant::now();
                let fdt: Vec<SocketAddrV6> = shared
                    .lock()
                    .unwrap()
                    .fdt
                    .iter()
                    .filter(|(a, r)| r.expires > now && **a != from)
                    .map(|(a, _)| *a)
                    .collect();
                for fd in fdt {
                    let _ = out_tx.unbounded_send(OutFrame::To(fd, forwarded.clone()));
                }
            }
            deliver(vmac, npdu);
        }
        Bvlc6::VirtualAddressResolution { vmac } => {
            let ack = Bvlc6::VirtualAddressResolutionAck {
                vmac: config.vmac,
                dest_vmac: vmac,
            }
            .to_bytes();
            let _ = out_tx.unbounded_send(OutFrame::To(from, ack));
        }
        Bvlc6::VirtualAddressResolutionAck { .. } => {
            // The learn() on entry already did the work.
        }
        Bvlc6::AddressResolution { vmac, target_vmac } => {
            if target_vmac == config.vmac {
                let ack =
                    Bvlc6::AddressResolutionAck { vmac: config.vmac, dest_vmac: vmac }.to_bytes();
                let _ = out_tx.unbounded_send(OutFrame::To(from, ack));
            }
        }
        Bvlc6::AddressResolutionAck { .. } | Bvlc6::ForwardedAddressResolution { .. } => {}
        Bvlc6::ForwardedNpdu { vmac, origin, npdu } => {
            shared.lock().unwrap().learn(vmac, origin);
            deliver(vmac, npdu);
        }
        Bvlc6::RegisterForeignDevice { vmac, ttl_seconds } => {
            let Some(bbmd) = &config.bbmd else {
                debug!(target: LOG, "not a BBMD; ignoring registration from {}", from);
                return;
            };
            let _ = vmac;
            let mut shared = shared.lock().unwrap();
            let cap = if bbmd.fdt_cap == 0 { 128 } else { bbmd.fdt_cap };
            let code = if shared.fdt.contains_key(&from) || shared.fdt.len() < cap {
                let ttl = Duration::from_secs(ttl_seconds as u64).min(Duration::from_secs(3600));
                shared.fdt.insert(
                    from,
                    Registration6 { expires: Instant::now() + ttl + Duration::from_secs(30) },
                );
                result_code::SUCCESS
            } else {
                result_code::REGISTER_FOREIGN_DEVICE_NAK
            };
            drop(shared);
            let result = Bvlc6::Result { vmac: config.vmac, code }.to_bytes();
            let _ = out_tx.unbounded_send(OutFrame::To(from, result));
        }
        Bvlc6::DeleteFdtEntry { entry, .. } => {
            if config.bbmd.is_some() {
                let removed = shared.lock().unwrap().fdt.remove(&entry).is_some();
                let code = if removed {
                    result_code::SUCCESS
                } else {
                    result_code::DELETE_FDT_ENTRY_NAK
                };
                let result = Bvlc6::Result { vmac: config.vmac, code }.to_bytes();
                let _ = out_tx.unbounded_send(OutFrame::To(from, result));
            }
        }
        Bvlc6::DistributeBroadcastToNetwork { vmac, npdu } => {
            let Some(bbmd) = &config.bbmd else {
                debug!(target: LOG, "not a BBMD; dropping distribute-broadcast from {}", from);
                return;
            };
            let registered = shared.lock().unwrap().fdt.contains_key(&from);
            if !registered {
                let result = Bvlc6::Result {
                    vmac: config.vmac,
                    code: result_code::DISTRIBUTE_BROADCAST_NAK,
                }
                .to_bytes();
                let _ = out_tx.unbounded_send(OutFrame::To(from, result));
                return;
            }
            let rebroadcast =
                Bvlc6::OriginalBroadcastNpdu { vmac, npdu: npdu.clone() }.to_bytes();
            let _ = out_tx.unbounded_send(OutFrame::Multicast(rebroadcast));
            let forwarded =
                Bvlc6::ForwardedNpdu { vmac, origin: from, npdu: npdu.clone() }.to_bytes();
            for peer in &bbmd.peers {
                let _ = out_tx.unbounded_send(OutFrame::To(*peer, forwarded.clone()));
            }
            let now = Instant::now();
            let fdt: Vec<SocketAddrV6> = shared
                .lock()
                .unwrap()
                .fdt
                .iter()
                .filter(|(a, r)| r.expires > now && **a != from)
                .map(|(a, _)| *a)
                .collect();
            for fd in fdt {
                let _ = out_tx.unbounded_send(OutFrame::To(fd, forwarded.clone()));
            }
            deliver(vmac, npdu);
        }
        Bvlc6::Result { code, .. } => {
            if code == result_code::SUCCESS {
                debug!(target: LOG, "BVLL result success from {}", from);
            } else {
                warn!(target: LOG, "BVLL NAK {:#06x} from {}", code, from);
            }
        }
        Bvlc6::SecureBvll { .. } => {
            debug!(target: LOG, "ignoring Secure-BVLL from {}", from);
        }
    }
}

async fn register_task(
    out_tx: mpsc::UnboundedSender<OutFrame>,
    vmac: Vmac6,
    fd: ForeignDevice6Config,
) {
    let frame = Bvlc6::RegisterForeignDevice { vmac, ttl_seconds: fd.ttl_seconds }.to_bytes();
    let interval = Duration::from_secs((fd.ttl_seconds as u64 / 2).max(1));
    loop {
        if out_tx.unbounded_send(OutFrame::To(fd.bbmd, frame.clone())).is_err() {
            return;
        }
        tokio::time::sleep(interval).await;
    }
}
