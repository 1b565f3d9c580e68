// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Raw 802.3 port (Clause 7), Linux AF_PACKET.
//!
//! The socket is bound to one interface and speaks the 802.2 LLC framing of
//! [`crate::wire::ethernet`]. Blocking socket work runs on two plain
//! threads feeding the usual channels, which keeps the unsafe surface small
//! and away from the async executor.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::addr::MacAddr;
use crate::datalink::{PortId, ReceivedFrame, TransportPort};
use crate::error::LinkError;
use crate::util::sink::UnboundedSink;
use crate::wire::ethernet::{EthernetFrame, ETHERNET_BROADCAST};
use crate::wire::Encodable;

const LOG: &str = "bacnet::ethernet";

/// Largest NPDU the 802.3 length field can carry after LLC.
const MAX_NPDU: usize = 1497;

#[derive(Debug, Clone)]
pub struct EthernetConfig {
    /// Interface name, e.g. `"eth0"`.
    pub interface: String,
}

struct Running {
    fd: RawFd,
    mac: [u8; 6],
    out_tx: mpsc::Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

/// The Clause 7 transport port.
pub struct EthernetPort {
    config: EthernetConfig,
    running: Option<Running>,
}

impl EthernetPort {
    pub fn new(config: EthernetConfig) -> EthernetPort {
        EthernetPort { config, running: None }
    }

    /// The interface hardware address once started.
    pub fn mac(&self) -> Option<MacAddr> {
        self.running.as_ref().map(|r| MacAddr::new(&r.mac).unwrap())
    }

    fn open(interface: &str) -> Result<(RawFd, [u8; 6]), LinkError> {
        let name = CString::new(interface)
            .map_err(|_| LinkError::InvalidAddress(interface.to_owned()))?;

        // SAFETY: plain syscalls on owned buffers; the fd is closed on stop.
        unsafe {
            let protocol = (libc::ETH_P_802_2 as u16).to_be() as libc::c_int;
            let fd = libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol);
            if fd < 0 {
                return Err(LinkError::BindFailed(std::io::Error::last_os_error()));
            }

            let ifindex = libc::if_nametoindex(name.as_ptr());
            if ifindex == 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(LinkError::BindFailed(err));
            }

            let mut ifr: libc::ifreq = std::mem::zeroed();
            for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes_with_nul()) {
                *dst = *src as libc::c_char;
            }
            if libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut ifr) < 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(LinkError::BindFailed(err));
            }
            let mut mac = [0u8; 6];
            for (dst, src) in mac.iter_mut().zip(ifr.ifr_ifru.ifru_hwaddr.sa_data.iter()) {
                *dst = *src as u8;
            }

            let mut sll: libc::sockaddr_ll = std::mem::zeroed();
            sll.sll_family = libc::AF_PACKET as u16;
            sll.sll_protocol = (libc::ETH_P_802_2 as u16).to_be();
            sll.sll_ifindex = ifindex as i32;
            if libc::bind(
                fd,
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            ) < 0
            {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(LinkError::BindFailed(err));
            }

            // A receive timeout lets the reader thread notice shutdown.
            let timeout = libc::timeval { tv_sec: 0, tv_usec: 500_000 };
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            );

            Ok((fd, mac))
        }
    }

    fn enqueue(&self, frame: Vec<u8>) -> Result<(), LinkError> {
        let running = self.running.as_ref().ok_or(LinkError::NotStarted)?;
        running.out_tx.send(frame).map_err(|_| LinkError::NotStarted)
    }

    fn frame_to(&self, dst: [u8; 6], npdu: &[u8]) -> Result<Vec<u8>, LinkError> {
        let running = self.running.as_ref().ok_or(LinkError::NotStarted)?;
        if npdu.len() > MAX_NPDU {
            return Err(LinkError::FrameTooLarge(npdu.len()));
        }
        Ok(EthernetFrame::new(dst, running.mac, npdu.to_vec()).to_bytes())
    }
}

impl TransportPort for EthernetPort {
    fn link_type(&self) -> &'static str {
        "ethernet"
    }

    fn start(
        &mut self,
        id: PortId,
        rx_sink: UnboundedSink<ReceivedFrame>,
    ) -> Result<(), LinkError> {
        let (fd, mac) = Self::open(&self.config.interface)?;
        info!(target: LOG, "{} bound, hw address {}",
            self.config.interface, hex::encode(mac));

        let stop = Arc::new(AtomicBool::new(false));
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>();
        let mut threads = Vec::new();

        {
            let stop = stop.clone();
            threads.push(std::thread::spawn(move || reader_loop(fd, mac, id, rx_sink, stop)));
        }
        {
            let stop = stop.clone();
            threads.push(std::thread::spawn(move || writer_loop(fd, out_rx, stop)));
        }

        self.running = Some(Running { fd, mac, out_tx, stop, threads });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.store(true, Ordering::SeqCst);
            drop(running.out_tx);
            for thread in running.threads {
                let _ = thread.join();
            }
            // SAFETY: the fd belongs to this port and both threads are done.
            unsafe {
                libc::close(running.fd);
            }
            info!(target: LOG, "stopped");
        }
    }

    fn send_unicast(&self, dest: &MacAddr, npdu: &[u8]) -> Result<(), LinkError> {
        let dst: [u8; 6] = dest
            .as_bytes()
            .try_into()
            .map_err(|_| LinkError::InvalidAddress(dest.to_string()))?;
        let frame = self.frame_to(dst, npdu)?;
        self.enqueue(frame)
    }

    fn send_broadcast(&self, npdu: &[u8]) -> Result<(), LinkError> {
        let frame = self.frame_to(ETHERNET_BROADCAST, npdu)?;
        self.enqueue(frame)
    }

    fn max_npdu_len(&self) -> usize {
        MAX_NPDU
    }
}

impl Drop for EthernetPort {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_loop(
    fd: RawFd,
    our_mac: [u8; 6],
    id: PortId,
    rx_sink: UnboundedSink<ReceivedFrame>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 1600];
    while !stop.load(Ordering::SeqCst) {
        // SAFETY: reads into a stack buffer of the stated length.
        let len = unsafe {
            libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        if len < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock
                || err.kind() == std::io::ErrorKind::TimedOut
                || err.kind() == std::io::ErrorKind::Interrupted
            {
                continue;
            }
            if !stop.load(Ordering::SeqCst) {
                warn!(target: LOG, "recv failed: {}", err);
            }
            return;
        }
        let frame = match EthernetFrame::decode(&buf[..len as usize]) {
            Ok(frame) => frame,
            Err(_) => {
                // Non-BACnet LLC traffic shares the protocol number.
                continue;
            }
        };
        if frame.src == our_mac {
            continue;
        }
        if frame.dst != our_mac && frame.dst != ETHERNET_BROADCAST {
            debug!(target: LOG, "frame for {} ignored", hex::encode(frame.dst));
            continue;
        }
        rx_sink.send(ReceivedFrame {
            port: id,
            source_mac: MacAddr::new(&frame.src).unwrap(),
            npdu: frame.npdu,
        });
    }
}

fn writer_loop(fd: RawFd, out_rx: mpsc::Receiver<Vec<u8>>, stop: Arc<AtomicBool>) {
    loop {
        let frame = match out_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(frame) => frame,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                continue;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        };
        // SAFETY: writes a fully initialized, owned buffer.
        let sent = unsafe {
            libc::send(fd, frame.as_ptr() as *const libc::c_void, frame.len(), 0)
        };
        if sent < 0 {
            warn!(target: LOG, "send failed: {}", std::io::Error::last_os_error());
        }
    }
}
