//! Peer directory: maps node ids to names and link addresses.
//!
//! Seeded from configuration and refined by every packet that carries both
//! an id and a name (Heartbeat, ReqQueue, Queue, ReqMeta). Names double as
//! storage directory names, so a learned name must be a single path
//! component, and a configured peer keeps its configured name.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use uplink_core::config::PeerConfig;
use uplink_core::wire::{Heartbeat, NodeId};
use uplink_core::{is_path_component, NodeName};

/// What we know about one remote node.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub node_id: NodeId,
    pub name: NodeName,

    /// Where to send datagrams. `None` until configured.
    pub addr: Option<SocketAddr>,

    /// Last time any packet from this node was seen.
    pub last_seen: Option<Instant>,

    /// Most recent heartbeat telemetry.
    pub heartbeat: Option<HeartbeatInfo>,

    /// Came from configuration; packets cannot rename it.
    pub pinned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatInfo {
    pub beat_period: f32,
    pub throughput: f32,
    pub unix_time: u32,
}

/// Shared between the receive loop, the sweep loop and the manager.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    by_id: Arc<DashMap<NodeId, PeerEntry>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(peers: &[PeerConfig]) -> Self {
        let dir = Self::new();
        for peer in peers {
            dir.insert(peer.node_id, peer.name.clone(), Some(peer.addr));
            if let Some(mut entry) = dir.by_id.get_mut(&peer.node_id) {
                entry.pinned = true;
            }
        }
        dir
    }

    pub fn insert(&self, node_id: NodeId, name: NodeName, addr: Option<SocketAddr>) {
        self.by_id.insert(
            node_id,
            PeerEntry {
                node_id,
                name,
                addr,
                last_seen: None,
                heartbeat: None,
                pinned: false,
            },
        );
    }

    /// Record that `node_id` calls itself `name`. Names that are not a
    /// single path component are ignored, as are renames of pinned peers.
    pub fn learn(&self, node_id: NodeId, name: &NodeName, now: Instant) {
        if !is_path_component(name.as_str()) {
            tracing::warn!(node_id, peer = ?name.as_str(), "ignoring unusable peer name");
            self.touch(node_id, now);
            return;
        }
        let mut entry = self.by_id.entry(node_id).or_insert_with(|| {
            tracing::info!(node_id, peer = %name, "new peer");
            PeerEntry {
                node_id,
                name: name.clone(),
                addr: None,
                last_seen: None,
                heartbeat: None,
                pinned: false,
            }
        });
        if entry.name != *name {
            if entry.pinned {
                tracing::warn!(node_id, configured = %entry.name, claimed = %name, "configured peer claims another name, ignoring");
            } else {
                tracing::warn!(node_id, old = %entry.name, new = %name, "peer renamed");
                entry.name = name.clone();
            }
        }
        entry.last_seen = Some(now);
    }

    /// Remember where `node_id` sends from, unless an address is configured.
    pub fn observe_addr(&self, node_id: NodeId, addr: SocketAddr) {
        if let Some(mut entry) = self.by_id.get_mut(&node_id) {
            if entry.addr.is_none() {
                tracing::debug!(node_id, %addr, "learned peer address");
                entry.addr = Some(addr);
            }
        }
    }

    pub fn touch(&self, node_id: NodeId, now: Instant) {
        if let Some(mut entry) = self.by_id.get_mut(&node_id) {
            entry.last_seen = Some(now);
        }
    }

    pub fn record_heartbeat(&self, beat: &Heartbeat, now: Instant) {
        self.learn(beat.node_id, &beat.node_name, now);
        if let Some(mut entry) = self.by_id.get_mut(&beat.node_id) {
            entry.heartbeat = Some(HeartbeatInfo {
                beat_period: beat.beat_period,
                throughput: beat.throughput,
                unix_time: beat.unix_time,
            });
        }
    }

    pub fn get(&self, node_id: NodeId) -> Option<PeerEntry> {
        self.by_id.get(&node_id).map(|e| e.clone())
    }

    pub fn name_of(&self, node_id: NodeId) -> Option<NodeName> {
        self.by_id.get(&node_id).map(|e| e.name.clone())
    }

    pub fn id_of(&self, name: &NodeName) -> Option<NodeId> {
        self.by_id
            .iter()
            .find(|e| e.name == *name)
            .map(|e| e.node_id)
    }

    pub fn addr_of(&self, node_id: NodeId) -> Option<SocketAddr> {
        self.by_id.get(&node_id).and_then(|e| e.addr)
    }

    /// Known node ids, ascending.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.by_id.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
