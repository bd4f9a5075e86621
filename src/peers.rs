//! Opennet peer table, greedy routing policy and HTL policy.

use crate::refs::NodeRef;
use crate::ring::Location;
use crate::types::{AnnounceConfig, Htl, PeerId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Default cap on opennet peers accepted from announcements.
pub const DEFAULT_MAX_OPENNET_PEERS: usize = 20;

/// One known peer.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub location: Location,
    pub connected: bool,
    /// Set while the provider's backoff heuristics exclude the peer from
    /// routing.
    pub backed_off: bool,
}

impl Peer {
    pub fn new(id: PeerId, location: Location) -> Self {
        Self {
            id,
            location,
            connected: true,
            backed_off: false,
        }
    }
}

#[derive(Default)]
struct TableState {
    peers: HashMap<PeerId, Peer>,
    opennet_count: usize,
}

/// Registry of known peers. Sessions hold the table behind an `Arc` and
/// only ever read snapshots; connection state is flipped by the owner.
#[derive(Clone)]
pub struct PeerTable {
    state: Arc<RwLock<TableState>>,
    max_opennet_peers: usize,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_OPENNET_PEERS)
    }

    pub fn with_capacity(max_opennet_peers: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(TableState::default())),
            max_opennet_peers,
        }
    }

    pub fn insert(&self, peer: Peer) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.peers.insert(peer.id, peer);
    }

    pub fn get(&self, id: PeerId) -> Option<Peer> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.peers.get(&id).cloned()
    }

    pub fn set_connected(&self, id: PeerId, connected: bool) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = state.peers.get_mut(&id) {
            p.connected = connected;
        }
    }

    pub fn set_backed_off(&self, id: PeerId, backed_off: bool) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = state.peers.get_mut(&id) {
            p.backed_off = backed_off;
        }
    }

    pub fn len(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connected peer whose location minimizes ring distance to `target`,
    /// excluding `source` and everything in `excluded`. Backed-off peers
    /// are skipped unless `ignore_backoff`. Deterministic for identical
    /// inputs: ties break toward the lower id.
    pub fn pick_closer(
        &self,
        source: Option<PeerId>,
        excluded: &HashSet<PeerId>,
        target: Location,
        ignore_backoff: bool,
    ) -> Option<PeerId> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .peers
            .values()
            .filter(|p| p.connected)
            .filter(|p| ignore_backoff || !p.backed_off)
            .filter(|p| Some(p.id) != source && !excluded.contains(&p.id))
            .min_by(|a, b| {
                a.location
                    .distance(target)
                    .partial_cmp(&b.location.distance(target))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            })
            .map(|p| p.id)
    }

    /// Offer a validated noderef from an announcement. Accepted while the
    /// opennet allotment has room; the new peer starts connected.
    pub fn add_new_opennet_node(&self, noderef: &NodeRef) -> Option<PeerId> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.peers.contains_key(&noderef.id) {
            debug!("announced node {} already known", noderef.id);
            return None;
        }
        if state.opennet_count >= self.max_opennet_peers {
            debug!(
                "announced node {} not wanted: {} opennet peers already",
                noderef.id, state.opennet_count
            );
            return None;
        }
        state.opennet_count += 1;
        state.peers.insert(noderef.id, Peer::new(noderef.id, noderef.location));
        info!(
            "added opennet peer {} at {} ({} total)",
            noderef.id, noderef.location, state.opennet_count
        );
        Some(noderef.id)
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// HTL decrement policy. Near the ceiling the decrement is probabilistic
/// so a request's entry point cannot be inferred from its HTL.
#[derive(Clone)]
pub struct HtlPolicy {
    max_htl: Htl,
    decrement_at_max_probability: f64,
}

impl HtlPolicy {
    pub fn new(cfg: &AnnounceConfig) -> Self {
        Self {
            max_htl: cfg.max_htl,
            decrement_at_max_probability: cfg.decrement_at_max_probability,
        }
    }

    pub fn max_htl(&self) -> Htl {
        self.max_htl
    }

    /// Decrement `htl`, possibly refusing at the ceiling.
    pub fn decrement(&self, htl: Htl) -> Htl {
        if htl == 0 {
            return 0;
        }
        if htl >= self.max_htl {
            if rand::random::<f64>() < self.decrement_at_max_probability {
                return self.max_htl - 1;
            }
            return self.max_htl;
        }
        htl - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(locs: &[(u64, f64)]) -> PeerTable {
        let table = PeerTable::new();
        for &(id, loc) in locs {
            table.insert(Peer::new(PeerId(id), Location::new(loc).unwrap()));
        }
        table
    }

    #[test]
    fn test_pick_closer_minimizes_distance() {
        let table = table_with(&[(1, 0.9), (2, 0.55), (3, 0.3)]);
        let target = Location::new(0.5).unwrap();
        let picked = table.pick_closer(None, &HashSet::new(), target, false);
        assert_eq!(picked, Some(PeerId(2)));
    }

    #[test]
    fn test_pick_closer_respects_exclusions() {
        let table = table_with(&[(1, 0.9), (2, 0.55), (3, 0.3)]);
        let target = Location::new(0.5).unwrap();
        let mut excluded = HashSet::new();
        excluded.insert(PeerId(2));
        assert_eq!(
            table.pick_closer(None, &excluded, target, false),
            Some(PeerId(3))
        );
        excluded.insert(PeerId(3));
        excluded.insert(PeerId(1));
        assert_eq!(table.pick_closer(None, &excluded, target, false), None);
    }

    #[test]
    fn test_pick_closer_skips_source_and_disconnected() {
        let table = table_with(&[(1, 0.5), (2, 0.55)]);
        let target = Location::new(0.5).unwrap();
        assert_eq!(
            table.pick_closer(Some(PeerId(1)), &HashSet::new(), target, false),
            Some(PeerId(2))
        );
        table.set_connected(PeerId(2), false);
        assert_eq!(
            table.pick_closer(Some(PeerId(1)), &HashSet::new(), target, false),
            None
        );
    }

    #[test]
    fn test_pick_closer_backoff() {
        let table = table_with(&[(1, 0.5), (2, 0.6)]);
        let target = Location::new(0.5).unwrap();
        table.set_backed_off(PeerId(1), true);
        assert_eq!(
            table.pick_closer(None, &HashSet::new(), target, false),
            Some(PeerId(2))
        );
        assert_eq!(
            table.pick_closer(None, &HashSet::new(), target, true),
            Some(PeerId(1))
        );
    }

    #[test]
    fn test_pick_closer_tie_breaks_on_id() {
        let table = table_with(&[(7, 0.4), (3, 0.6)]);
        let target = Location::new(0.5).unwrap();
        assert_eq!(
            table.pick_closer(None, &HashSet::new(), target, false),
            Some(PeerId(3))
        );
    }

    #[test]
    fn test_opennet_capacity() {
        let table = PeerTable::with_capacity(2);
        let make_ref = |id: u64, loc: f64| {
            NodeRef::new(PeerId(id), Location::new(loc).unwrap(), Vec::new())
        };
        assert!(table.add_new_opennet_node(&make_ref(1, 0.1)).is_some());
        assert!(table.add_new_opennet_node(&make_ref(2, 0.2)).is_some());
        assert!(table.add_new_opennet_node(&make_ref(3, 0.3)).is_none());
        // Duplicates are refused without consuming capacity
        assert!(table.add_new_opennet_node(&make_ref(1, 0.1)).is_none());
    }

    #[test]
    fn test_htl_decrement_below_max_is_deterministic() {
        let cfg = AnnounceConfig::default();
        let policy = HtlPolicy::new(&cfg);
        assert_eq!(policy.decrement(5), 4);
        assert_eq!(policy.decrement(1), 0);
        assert_eq!(policy.decrement(0), 0);
    }

    #[test]
    fn test_htl_decrement_at_max_is_probabilistic() {
        let cfg = AnnounceConfig::default();
        let policy = HtlPolicy::new(&cfg);
        let max = policy.max_htl();
        let mut kept = 0;
        let mut dropped = 0;
        for _ in 0..1000 {
            match policy.decrement(max) {
                h if h == max => kept += 1,
                h if h == max - 1 => dropped += 1,
                h => panic!("unexpected htl {}", h),
            }
        }
        // p = 0.5 either way; 1000 trials make both branches certain in
        // practice.
        assert!(kept > 300, "kept {}", kept);
        assert!(dropped > 300, "dropped {}", dropped);
    }
}
