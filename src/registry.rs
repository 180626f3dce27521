use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::peer::Peer;

/// In-memory table of peers keyed by address.
///
/// Records are replaced whole under the write lock, so a concurrent
/// `snapshot` sees either the old or the new record, never a mix.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<SocketAddr, Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the peer or refreshes the existing record for its address.
    /// `last_seen` never moves backwards.
    pub fn upsert(&self, peer: Peer) {
        let mut peers = self.peers.write();
        match peers.get_mut(&peer.address) {
            Some(existing) => {
                existing.display_name = peer.display_name;
                if peer.last_seen > existing.last_seen {
                    existing.last_seen = peer.last_seen;
                }
            }
            None => {
                tracing::debug!("New peer {} ({})", peer.display_name, peer.address);
                peers.insert(peer.address, peer);
            }
        }
    }

    /// Peers seen within `ttl` of `now`, ordered by display name then address.
    pub fn snapshot(&self, now: Instant, ttl: Duration) -> Vec<Peer> {
        let mut live: Vec<Peer> = {
            let peers = self.peers.read();
            peers
                .values()
                .filter(|p| is_fresh(p, now, ttl))
                .cloned()
                .collect()
        };
        live.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.address.cmp(&b.address))
        });
        live
    }

    /// Drops peers not seen within `ttl`; returns how many were removed.
    pub fn evict_expired(&self, now: Instant, ttl: Duration) -> usize {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|_, p| is_fresh(p, now, ttl));
        before - peers.len()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

fn is_fresh(peer: &Peer, now: Instant, ttl: Duration) -> bool {
    // A peer refreshed after `now` was taken is fresh.
    now.saturating_duration_since(peer.last_seen) <= ttl
}
