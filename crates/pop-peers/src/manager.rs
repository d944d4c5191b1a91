use chrono::{DateTime, Utc};
use libp2p::PeerId;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use pop_types::Region;

/// A connected peer that completed the hey handshake.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub regions: Vec<Region>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Round-trip measured by the hey initiator, when we dialed.
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Added {
        peer: PeerId,
        regions: Vec<Region>,
    },
    Removed {
        peer: PeerId,
        regions: Vec<Region>,
    },
}

/// Tracks connected peers with their advertised region sets. Entries exist
/// only for peers with a live connection and a completed hey.
pub struct PeerMgr {
    local: PeerId,
    peers: Arc<RwLock<HashMap<PeerId, PeerEntry>>>,
    subscribers: Arc<RwLock<Vec<mpsc::UnboundedSender<PeerEvent>>>>,
}

impl PeerMgr {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            peers: Arc::new(RwLock::new(HashMap::new())),
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    async fn emit(&self, event: PeerEvent) {
        let mut subs = self.subscribers.write().await;
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Register a heyed peer. Idempotent: a repeat hey refreshes the region
    /// set without a second `Added` event.
    pub async fn add_peer(
        &self,
        peer: PeerId,
        regions: Vec<Region>,
        latency_ms: Option<u64>,
    ) {
        let is_new = {
            let mut peers = self.peers.write().await;
            let now = Utc::now();
            match peers.get_mut(&peer) {
                Some(entry) => {
                    entry.regions = regions.clone();
                    entry.last_seen = now;
                    if latency_ms.is_some() {
                        entry.latency_ms = latency_ms;
                    }
                    false
                }
                None => {
                    peers.insert(
                        peer,
                        PeerEntry {
                            peer_id: peer,
                            regions: regions.clone(),
                            first_seen: now,
                            last_seen: now,
                            latency_ms,
                        },
                    );
                    true
                }
            }
        };
        if is_new {
            info!(peer = %peer, regions = regions.len(), "peer added");
            self.emit(PeerEvent::Added { peer, regions }).await;
        }
    }

    pub async fn remove_peer(&self, peer: &PeerId) -> Option<PeerEntry> {
        let removed = {
            let mut peers = self.peers.write().await;
            peers.remove(peer)
        };
        if let Some(ref entry) = removed {
            info!(peer = %peer, "peer removed");
            self.emit(PeerEvent::Removed {
                peer: *peer,
                regions: entry.regions.clone(),
            })
            .await;
        }
        removed
    }

    pub async fn get_peer(&self, peer: &PeerId) -> Option<PeerEntry> {
        let peers = self.peers.read().await;
        peers.get(peer).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        let peers = self.peers.read().await;
        peers.len()
    }

    /// Up to `n` peers whose region set intersects `regions`, excluding
    /// `exclude`, in stable random order.
    pub async fn peers(
        &self,
        n: usize,
        regions: &[Region],
        exclude: &HashSet<PeerId>,
    ) -> Vec<PeerId> {
        let peers = self.peers.read().await;
        let mut matching: Vec<PeerId> = peers
            .values()
            .filter(|e| !exclude.contains(&e.peer_id))
            .filter(|e| Region::intersects(regions, &e.regions))
            .map(|e| e.peer_id)
            .collect();
        matching.shuffle(&mut rand::thread_rng());
        matching.truncate(n);
        debug!(
            requested = n,
            returned = matching.len(),
            "peer selection"
        );
        matching
    }

    /// Stream of add/remove events from this point on.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.write().await;
        subs.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pop_types::region::{AFRICA_REGION, ASIA_REGION};

    fn asia() -> Vec<Region> {
        vec![Region::new("Asia", ASIA_REGION)]
    }

    fn africa() -> Vec<Region> {
        vec![Region::new("Africa", AFRICA_REGION)]
    }

    #[tokio::test]
    async fn test_region_filtered_selection() {
        let mgr = PeerMgr::new(PeerId::random());
        let asian: Vec<PeerId> = (0..4).map(|_| PeerId::random()).collect();
        let african: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        for p in &asian {
            mgr.add_peer(*p, asia(), None).await;
        }
        for p in &african {
            mgr.add_peer(*p, africa(), None).await;
        }

        let picked = mgr.peers(10, &asia(), &HashSet::new()).await;
        assert_eq!(picked.len(), 4);
        assert!(picked.iter().all(|p| asian.contains(p)));

        let none = mgr
            .peers(10, &[Region::new("Oceania", pop_types::region::OCEANIA_REGION)], &HashSet::new())
            .await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_exclusion() {
        let mgr = PeerMgr::new(PeerId::random());
        let peers: Vec<PeerId> = (0..5).map(|_| PeerId::random()).collect();
        for p in &peers {
            mgr.add_peer(*p, asia(), None).await;
        }
        let exclude: HashSet<PeerId> = peers[..3].iter().copied().collect();
        let picked = mgr.peers(10, &asia(), &exclude).await;
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|p| !exclude.contains(p)));
    }

    #[tokio::test]
    async fn test_events() {
        let mgr = PeerMgr::new(PeerId::random());
        let mut events = mgr.subscribe().await;
        let peer = PeerId::random();

        mgr.add_peer(peer, asia(), None).await;
        assert!(matches!(
            events.recv().await,
            Some(PeerEvent::Added { peer: p, .. }) if p == peer
        ));

        // Repeat hey refreshes without a duplicate event.
        mgr.add_peer(peer, asia(), Some(12)).await;

        mgr.remove_peer(&peer).await;
        assert!(matches!(
            events.recv().await,
            Some(PeerEvent::Removed { peer: p, .. }) if p == peer
        ));
        assert_eq!(mgr.peer_count().await, 0);
    }
}
