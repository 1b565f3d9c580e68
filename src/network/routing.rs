// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The router cache: which router, on which port, forwards to a given
//! remote network.
//!
//! Entries are learned from I-Am-Router-To-Network messages and from the
//! SNET/SADR of routed frames. The cache is bounded; eviction removes a
//! stale entry first (not refreshed within the configured interval) and
//! falls back to least-recently-used.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::addr::MacAddr;
use crate::datalink::PortId;

pub const ROUTER_CACHE_CAP: usize = 1024;

/// Routers must be re-heard from within this window before counting as
/// stale. Spec floor is 30 minutes.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// MAC of the router on the directly attached link.
    pub next_hop: MacAddr,
    pub port: PortId,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    route: Route,
    last_seen: Instant,
    last_used: Instant,
}

#[derive(Debug)]
pub struct RouterCache {
    entries: HashMap<u16, Entry>,
    capacity: usize,
    stale_after: Duration,
}

impl Default for RouterCache {
    fn default() -> Self {
        RouterCache::new(ROUTER_CACHE_CAP, DEFAULT_STALE_AFTER)
    }
}

impl RouterCache {
    pub fn new(capacity: usize, stale_after: Duration) -> RouterCache {
        RouterCache { entries: HashMap::new(), capacity, stale_after }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Learns (or refreshes) the route to `network`.
    pub fn insert(&mut self, network: u16, next_hop: MacAddr, port: PortId) {
        let now = Instant::now();
        if let Some(entry) = self.entries.get_mut(&network) {
            entry.route = Route { next_hop, port };
            entry.last_seen = now;
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict(now);
        }
        self.entries.insert(
            network,
            Entry { route: Route { next_hop, port }, last_seen: now, last_used: now },
        );
    }

    /// Route for `network`, marking the entry used.
    pub fn lookup(&mut self, network: u16) -> Option<Route> {
        let entry = self.entries.get_mut(&network)?;
        entry.last_used = Instant::now();
        Some(entry.route)
    }

    pub fn invalidate(&mut self, network: u16) {
        self.entries.remove(&network);
    }

    /// Drops every route through `port` (the port went away).
    pub fn invalidate_port(&mut self, port: PortId) {
        self.entries.retain(|_, e| e.route.port != port);
    }

    fn evict(&mut self, now: Instant) {
        // Stale first.
        if let Some((&net, _)) = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) > self.stale_after)
            .min_by_key(|(_, e)| e.last_seen)
        {
            self.entries.remove(&net);
            return;
        }
        // Otherwise least recently used.
        if let Some((&net, _)) = self.entries.iter().min_by_key(|(_, e)| e.last_used) {
            self.entries.remove(&net);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> MacAddr {
        MacAddr::new(&[b]).unwrap()
    }

    #[test]
    fn insert_and_lookup() {
        let mut cache = RouterCache::default();
        cache.insert(5, mac(1), PortId(0));
        let route = cache.lookup(5).unwrap();
        assert_eq!(route.next_hop, mac(1));
        assert_eq!(route.port, PortId(0));
        assert_eq!(cache.lookup(6), None);
    }

    #[test]
    fn refresh_replaces_route() {
        let mut cache = RouterCache::default();
        cache.insert(5, mac(1), PortId(0));
        cache.insert(5, mac(2), PortId(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(5).unwrap().next_hop, mac(2));
    }

    #[test]
    fn bounded_with_lru_eviction() {
        let mut cache = RouterCache::new(3, Duration::from_secs(3600));
        cache.insert(1, mac(1), PortId(0));
        cache.insert(2, mac(2), PortId(0));
        cache.insert(3, mac(3), PortId(0));
        // Touch 1 and 2 so 3 is the least recently used.
        cache.lookup(1);
        cache.lookup(2);
        cache.insert(4, mac(4), PortId(0));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.lookup(3), None);
        assert!(cache.lookup(1).is_some());
        assert!(cache.lookup(4).is_some());
    }

    #[test]
    fn stale_entries_evicted_before_lru() {
        let mut cache = RouterCache::new(2, Duration::from_millis(0));
        cache.insert(1, mac(1), PortId(0));
        cache.insert(2, mac(2), PortId(0));
        // Entry 2 is the LRU candidate (1 was just used), but both are stale
        // with a zero stale window; the older-seen entry (1) goes first.
        std::thread::sleep(Duration::from_millis(2));
        cache.lookup(1);
        cache.insert(3, mac(3), PortId(0));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup(1), None);
        assert!(cache.lookup(2).is_some());
    }

    #[test]
    fn invalidate_port_clears_routes() {
        let mut cache = RouterCache::default();
        cache.insert(1, mac(1), PortId(0));
        cache.insert(2, mac(2), PortId(1));
        cache.invalidate_port(PortId(0));
        assert_eq!(cache.lookup(1), None);
        assert!(cache.lookup(2).is_some());
    }
}
