// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! BBMD: broadcast management across IP subnets (Annex J.4).
//!
//! Pure table-and-policy logic; the owning BIP port performs the socket
//! work. A BBMD holds a Broadcast Distribution Table of peer BBMDs and a
//! Foreign Device Table of registered off-subnet devices, and fans
//! broadcasts out to both.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::wire::bvlc4::{result_code, BdtEntry, Bvlc4, FdtEntry};

const LOG: &str = "bacnet::bbmd";

/// Upper bound on Broadcast Distribution Table entries.
pub const DEFAULT_BDT_CAP: usize = 128;
/// Registrations may not ask for more than an hour.
pub const MAX_FDT_TTL: Duration = Duration::from_secs(3600);
/// Grace added to each registration, per Annex J.5.2.3.
const FDT_GRACE: Duration = Duration::from_secs(30);

/// What the owning port should do with the outcome of one BBMD decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BbmdAction {
    /// Send this frame to one peer.
    Send(SocketAddrV4, Bvlc4),
    /// Broadcast this frame on the local subnet.
    Broadcast(Bvlc4),
    /// Hand this NPDU up the stack, sourced from `origin`.
    Deliver { origin: SocketAddrV4, npdu: Vec<u8> },
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    ttl: Duration,
    expires: Instant,
}

/// BBMD configuration.
#[derive(Debug, Clone)]
pub struct BbmdConfig {
    /// Static peer table; this BBMD's own address may be included and is
    /// skipped on distribution.
    pub bdt: Vec<BdtEntry>,
    pub bdt_cap: usize,
    pub fdt_cap: usize,
    /// Whether Write-BDT from the network is honored.
    pub accept_bdt_writes: bool,
}

impl Default for BbmdConfig {
    fn default() -> Self {
        BbmdConfig {
            bdt: Vec::new(),
            bdt_cap: DEFAULT_BDT_CAP,
            fdt_cap: 128,
            accept_bdt_writes: false,
        }
    }
}

/// The broadcast-management state machine.
#[derive(Debug)]
pub struct Bbmd {
    local: SocketAddrV4,
    bdt: Vec<BdtEntry>,
    fdt: HashMap<SocketAddrV4, Registration>,
    config: BbmdConfig,
}

impl Bbmd {
    pub fn new(local: SocketAddrV4, config: BbmdConfig) -> Bbmd {
        let bdt = config.bdt.clone();
        Bbmd { local, bdt, fdt: HashMap::new(), config }
    }

    pub fn foreign_device_count(&self) -> usize {
        self.fdt.len()
    }

    /// Purges expired registrations. Driven by the application sweep.
    pub fn sweep(&mut self, now: Instant) {
        let before = self.fdt.len();
        self.fdt.retain(|_, reg| reg.expires > now);
        if self.fdt.len() != before {
            debug!(target: LOG, "expired {} foreign device registrations",
                before - self.fdt.len());
        }
    }

    /// Peer BBMDs, excluding ourselves.
    fn bdt_peers(&self) -> impl Iterator<Item = SocketAddrV4> + '_ {
        let local = self.local;
        self.bdt.iter().map(|e| e.address).filter(move |a| *a != local)
    }

    /// Every live foreign device except `excluded`.
    fn foreign_devices(
        &self,
        now: Instant,
        excluded: Option<SocketAddrV4>,
    ) -> impl Iterator<Item = SocketAddrV4> + '_ {
        self.fdt
            .iter()
            .filter(move |(addr, reg)| reg.expires > now && Some(**addr) != excluded)
            .map(|(addr, _)| *addr)
    }

    fn fan_out(
        &self,
        origin: SocketAddrV4,
        npdu: &[u8],
        now: Instant,
        exclude_fd: Option<SocketAddrV4>,
    ) -> Vec<BbmdAction> {
        let forwarded = Bvlc4::ForwardedNpdu { origin, npdu: npdu.to_vec() };
        self.bdt_peers()
            .chain(self.foreign_devices(now, exclude_fd))
            .map(|addr| BbmdAction::Send(addr, forwarded.clone()))
            .collect()
    }

    /// Distribution for a broadcast this node itself originates: the local
    /// subnet never loops our own datagram back, so the fan-out happens at
    /// the send path.
    pub fn originate(&self, npdu: &[u8], now: Instant) -> Vec<BbmdAction> {
        self.fan_out(self.local, npdu, now, None)
    }

    /// Processes one frame the port received. Frames that are not BBMD
    /// business return an empty action list.
    pub fn handle(&mut self, from: SocketAddrV4, frame: &Bvlc4, now: Instant) -> Vec<BbmdAction> {
        match frame {
            Bvlc4::OriginalBroadcastNpdu(npdu) => {
                // A local station broadcast: relay it beyond the subnet.
                let mut actions = self.fan_out(from, npdu, now, None);
                actions.push(BbmdAction::Deliver { origin: from, npdu: npdu.clone() });
                actions
            }
            Bvlc4::DistributeBroadcastToNetwork(npdu) => {
                if !self.fdt.contains_key(&from) {
                    warn!(target: LOG, "distribute-broadcast from unregistered {}", from);
                    return vec![BbmdAction::Send(
                        from,
                        Bvlc4::Result(result_code::DISTRIBUTE_BROADCAST_NAK),
                    )];
                }
                let mut actions = self.fan_out(from, npdu, now, Some(from));
                actions.push(BbmdAction::Broadcast(Bvlc4::OriginalBroadcastNpdu(npdu.clone())));
                actions.push(BbmdAction::Deliver { origin: from, npdu: npdu.clone() });
                actions
            }
            Bvlc4::ForwardedNpdu { origin, npdu } => {
                // From a peer BBMD: give it to local stations and our
                // foreign devices, and take it ourselves.
                let mut actions = vec![BbmdAction::Broadcast(frame.clone())];
                for fd in self.foreign_devices(now, None) {
                    actions.push(BbmdAction::Send(fd, frame.clone()));
                }
                actions.push(BbmdAction::Deliver { origin: *origin, npdu: npdu.clone() });
                actions
            }
            Bvlc4::RegisterForeignDevice { ttl_seconds } => {
                let ttl = Duration::from_secs(*ttl_seconds as u64).min(MAX_FDT_TTL);
                if !self.fdt.contains_key(&from) && self.fdt.len() >= self.config.fdt_cap {
                    warn!(target: LOG, "foreign device table full; refusing {}", from);
                    return vec![BbmdAction::Send(
                        from,
                        Bvlc4::Result(result_code::REGISTER_FOREIGN_DEVICE_NAK),
                    )];
                }
                info!(target: LOG, "foreign device {} registered for {:?}", from, ttl);
                self.fdt.insert(from, Registration { ttl, expires: now + ttl + FDT_GRACE });
                vec![BbmdAction::Send(from, Bvlc4::Result(result_code::SUCCESS))]
            }
            Bvlc4::DeleteFdtEntry(entry) => {
                let code = if self.fdt.remove(entry).is_some() {
                    result_code::SUCCESS
                } else {
                    result_code::DELETE_FDT_ENTRY_NAK
                };
                vec![BbmdAction::Send(from, Bvlc4::Result(code))]
            }
            Bvlc4::ReadBdt => {
                vec![BbmdAction::Send(from, Bvlc4::ReadBdtAck(self.bdt.clone()))]
            }
            Bvlc4::ReadFdt => {
                let entries = self
                    .fdt
                    .iter()
                    .map(|(addr, reg)| FdtEntry {
                        address: *addr,
                        ttl_seconds: reg.ttl.as_secs() as u16,
                        remaining_seconds: reg
                            .expires
                            .saturating_duration_since(now)
                            .as_secs() as u16,
                    })
                    .collect();
                vec![BbmdAction::Send(from, Bvlc4::ReadFdtAck(entries))]
            }
            Bvlc4::WriteBdt(entries) => {
                if !self.config.accept_bdt_writes || entries.len() > self.config.bdt_cap {
                    return vec![BbmdAction::Send(
                        from,
                        Bvlc4::Result(result_code::WRITE_BDT_NAK),
                    )];
                }
                self.bdt = entries.clone();
                vec![BbmdAction::Send(from, Bvlc4::Result(result_code::SUCCESS))]
            }
            // Unicast traffic and acks are none of the BBMD's business.
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(d: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, d), 47808)
    }

    fn bbmd_with_peers() -> Bbmd {
        Bbmd::new(
            addr(1),
            BbmdConfig {
                bdt: vec![
                    BdtEntry::unicast(addr(1)), // ourselves
                    BdtEntry::unicast(addr(2)),
                    BdtEntry::unicast(addr(3)),
                ],
                accept_bdt_writes: true,
                ..BbmdConfig::default()
            },
        )
    }

    fn register(bbmd: &mut Bbmd, who: SocketAddrV4, ttl: u16, now: Instant) {
        let actions = bbmd.handle(who, &Bvlc4::RegisterForeignDevice { ttl_seconds: ttl }, now);
        assert_eq!(
            actions,
            vec![BbmdAction::Send(who, Bvlc4::Result(result_code::SUCCESS))]
        );
    }

    #[test]
    fn local_broadcast_fans_out_to_peers_and_fds() {
        let mut bbmd = bbmd_with_peers();
        let now = Instant::now();
        register(&mut bbmd, addr(50), 60, now);

        let actions =
            bbmd.handle(addr(9), &Bvlc4::OriginalBroadcastNpdu(vec![0x01, 0x00]), now);
        let forwarded = Bvlc4::ForwardedNpdu { origin: addr(9), npdu: vec![0x01, 0x00] };
        assert!(actions.contains(&BbmdAction::Send(addr(2), forwarded.clone())));
        assert!(actions.contains(&BbmdAction::Send(addr(3), forwarded.clone())));
        assert!(actions.contains(&BbmdAction::Send(addr(50), forwarded.clone())));
        // Never back to ourselves.
        assert!(!actions.contains(&BbmdAction::Send(addr(1), forwarded)));
        assert!(actions
            .contains(&BbmdAction::Deliver { origin: addr(9), npdu: vec![0x01, 0x00] }));
    }

    #[test]
    fn distribute_broadcast_excludes_the_origin_fd() {
        let mut bbmd = bbmd_with_peers();
        let now = Instant::now();
        register(&mut bbmd, addr(50), 60, now);
        register(&mut bbmd, addr(51), 60, now);

        let npdu = vec![0x01, 0x00, 0x10, 0x08];
        let actions =
            bbmd.handle(addr(50), &Bvlc4::DistributeBroadcastToNetwork(npdu.clone()), now);
        let forwarded = Bvlc4::ForwardedNpdu { origin: addr(50), npdu: npdu.clone() };
        assert!(actions.contains(&BbmdAction::Send(addr(2), forwarded.clone())));
        assert!(actions.contains(&BbmdAction::Send(addr(3), forwarded.clone())));
        assert!(actions.contains(&BbmdAction::Send(addr(51), forwarded.clone())));
        assert!(!actions.contains(&BbmdAction::Send(addr(50), forwarded)));
        assert!(actions
            .contains(&BbmdAction::Broadcast(Bvlc4::OriginalBroadcastNpdu(npdu.clone()))));
        assert!(actions.contains(&BbmdAction::Deliver { origin: addr(50), npdu }));
    }

    #[test]
    fn distribute_from_unregistered_device_naks() {
        let mut bbmd = bbmd_with_peers();
        let actions = bbmd.handle(
            addr(66),
            &Bvlc4::DistributeBroadcastToNetwork(vec![0x01]),
            Instant::now(),
        );
        assert_eq!(
            actions,
            vec![BbmdAction::Send(
                addr(66),
                Bvlc4::Result(result_code::DISTRIBUTE_BROADCAST_NAK)
            )]
        );
    }

    #[test]
    fn forwarded_npdu_reaches_local_subnet_and_fds() {
        let mut bbmd = bbmd_with_peers();
        let now = Instant::now();
        register(&mut bbmd, addr(50), 60, now);
        let frame = Bvlc4::ForwardedNpdu { origin: addr(77), npdu: vec![0xAA] };
        let actions = bbmd.handle(addr(2), &frame, now);
        assert!(actions.contains(&BbmdAction::Broadcast(frame.clone())));
        assert!(actions.contains(&BbmdAction::Send(addr(50), frame)));
        assert!(actions.contains(&BbmdAction::Deliver { origin: addr(77), npdu: vec![0xAA] }));
    }

    #[test]
    fn registrations_expire_and_cap_is_enforced() {
        let mut bbmd = Bbmd::new(
            addr(1),
            BbmdConfig { fdt_cap: 1, ..BbmdConfig::default() },
        );
        let now = Instant::now();
        register(&mut bbmd, addr(50), 1, now);
        let actions =
            bbmd.handle(addr(51), &Bvlc4::RegisterForeignDevice { ttl_seconds: 60 }, now);
        assert_eq!(
            actions,
            vec![BbmdAction::Send(
                addr(51),
                Bvlc4::Result(result_code::REGISTER_FOREIGN_DEVICE_NAK)
            )]
        );

        // After expiry (1 s TTL + 30 s grace) the slot opens up.
        bbmd.sweep(now + Duration::from_secs(32));
        assert_eq!(bbmd.foreign_device_count(), 0);
        register(&mut bbmd, addr(51), 60, now + Duration::from_secs(32));
    }

    #[test]
    fn ttl_is_capped_at_one_hour() {
        let mut bbmd = bbmd_with_peers();
        let now = Instant::now();
        register(&mut bbmd, addr(50), u16::MAX, now);
        let actions = bbmd.handle(addr(9), &Bvlc4::ReadFdt, now);
        match &actions[0] {
            BbmdAction::Send(_, Bvlc4::ReadFdtAck(entries)) => {
                assert_eq!(entries[0].ttl_seconds, 3600);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn bdt_reads_and_writes() {
        let mut bbmd = bbmd_with_peers();
        let now = Instant::now();
        let actions = bbmd.handle(addr(9), &Bvlc4::ReadBdt, now);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], BbmdAction::Send(_, Bvlc4::ReadBdtAck(e)) if e.len() == 3));

        let new_table = vec![BdtEntry::unicast(addr(1)), BdtEntry::unicast(addr(4))];
        let actions = bbmd.handle(addr(9), &Bvlc4::WriteBdt(new_table.clone()), now);
        assert_eq!(
            actions,
            vec![BbmdAction::Send(addr(9), Bvlc4::Result(result_code::SUCCESS))]
        );
        let actions = bbmd.handle(addr(9), &Bvlc4::ReadBdt, now);
        assert!(matches!(&actions[0], BbmdAction::Send(_, Bvlc4::ReadBdtAck(e)) if *e == new_table));
    }

    #[test]
    fn oversized_bdt_write_naks() {
        let mut bbmd = Bbmd::new(
            addr(1),
            BbmdConfig { bdt_cap: 2, accept_bdt_writes: true, ..BbmdConfig::default() },
        );
        let table = vec![
            BdtEntry::unicast(addr(2)),
            BdtEntry::unicast(addr(3)),
            BdtEntry::unicast(addr(4)),
        ];
        let actions = bbmd.handle(addr(9), &Bvlc4::WriteBdt(table), Instant::now());
        assert_eq!(
            actions,
            vec![BbmdAction::Send(addr(9), Bvlc4::Result(result_code::WRITE_BDT_NAK))]
        );
    }

    #[test]
    fn delete_fdt_entry() {
        let mut bbmd = bbmd_with_peers();
        let now = Instant::now();
        register(&mut bbmd, addr(50), 60, now);
        let actions = bbmd.handle(addr(9), &Bvlc4::DeleteFdtEntry(addr(50)), now);
        assert_eq!(
            actions,
            vec![BbmdAction::Send(addr(9), Bvlc4::Result(result_code::SUCCESS))]
        );
        let actions = bbmd.handle(addr(9), &Bvlc4::DeleteFdtEntry(addr(50)), now);
        assert_eq!(
            actions,
            vec![BbmdAction::Send(
                addr(9),
                Bvlc4::Result(result_code::DELETE_FDT_ENTRY_NAK)
            )]
        );
    }

    #[test]
    fn unicast_traffic_is_ignored() {
        let mut bbmd = bbmd_with_peers();
        let actions = bbmd.handle(
            addr(9),
            &Bvlc4::OriginalUnicastNpdu(vec![0x01, 0x00]),
            Instant::now(),
        );
        assert!(actions.is_empty());
    }
}
