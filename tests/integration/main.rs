//! Uplink integration test harness.
//!
//! Two transfer managers, each with its own storage root, exchange packets
//! through an in-process link. Every packet is encoded to bytes and decoded
//! again on the far side, so the codec is exercised on the full path.
//!
//! The link can drop, duplicate, corrupt and reorder datagrams. Faults come
//! from a seeded generator, so a failing run is reproducible.
//!
//! Time is simulated: each step advances a shared clock and polls both
//! managers, then delivers traffic until both sides fall quiet.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use uplink_core::config::TransferConfig;
use uplink_core::wire::{self, NodeId, Packet};
use uplink_core::NodeName;
use uplink_services::{
    LoggingAux, NodeIdentity, Outbound, PeerDirectory, TransferEvent, TransferManager,
};

mod cancel;
mod resume;
mod stall;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const SAT: NodeId = 1;
pub const GROUND: NodeId = 2;

/// Simulated time between sweeps.
pub const STEP: Duration = Duration::from_millis(200);

/// Delivery rounds per step before giving up on quiescence.
const MAX_ROUNDS: usize = 64;

pub fn name(s: &str) -> NodeName {
    NodeName::new(s).unwrap()
}

/// Empty scratch directory for one test.
pub fn fresh_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("uplink-it-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Seeded random bytes, identical for the same `seed`.
pub fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill(&mut bytes[..]);
    bytes
}

/// One end of a test link.
pub struct Node {
    pub manager: TransferManager,
    pub events: broadcast::Receiver<TransferEvent>,
    pub root: PathBuf,
}

impl Node {
    /// A node rooted at `base/<own name>` that knows exactly one peer.
    pub fn open(
        base: &Path,
        (id, own): (NodeId, &str),
        (peer_id, peer): (NodeId, &str),
        tweak: impl FnOnce(&mut TransferConfig),
    ) -> Self {
        let root = base.join(own);
        let mut settings = TransferConfig {
            root: root.clone(),
            ..TransferConfig::default()
        };
        tweak(&mut settings);
        let peers = PeerDirectory::new();
        peers.insert(peer_id, name(peer), None);
        let manager = TransferManager::new(
            NodeIdentity {
                node_id: id,
                node_name: name(own),
            },
            settings,
            peers,
            Arc::new(LoggingAux),
        );
        let events = manager.subscribe();
        Self {
            manager,
            events,
            root,
        }
    }

    pub fn sat(base: &Path, tweak: impl FnOnce(&mut TransferConfig)) -> Self {
        Self::open(base, (SAT, "sat"), (GROUND, "ground"), tweak)
    }

    pub fn ground(base: &Path, tweak: impl FnOnce(&mut TransferConfig)) -> Self {
        Self::open(base, (GROUND, "ground"), (SAT, "sat"), tweak)
    }

    /// Write `bytes` to a staging file and return its path.
    pub fn stage(&self, file: &str, bytes: &[u8]) -> PathBuf {
        let dir = self.root.join("staging");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub fn drain_events(&mut self) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// In-process datagram link with fault injection.
pub struct Link {
    rng: StdRng,
    pub drop_pct: u64,
    pub dup_pct: u64,
    pub corrupt_pct: u64,
    pub reorder: bool,
    pub carried: usize,
    pub lost: usize,
}

impl Link {
    pub fn perfect() -> Self {
        Self {
            rng: StdRng::seed_from_u64(1),
            drop_pct: 0,
            dup_pct: 0,
            corrupt_pct: 0,
            reorder: false,
            carried: 0,
            lost: 0,
        }
    }

    pub fn lossy(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            drop_pct: 20,
            dup_pct: 10,
            corrupt_pct: 5,
            reorder: true,
            carried: 0,
            lost: 0,
        }
    }

    fn roll(&mut self, pct: u64) -> bool {
        pct > 0 && self.rng.gen_range(0..100) < pct
    }

    /// Put `packets` on the wire and return what arrives at the far end.
    pub fn carry(&mut self, packets: Vec<Outbound>) -> Vec<Packet> {
        let mut arrived = Vec::new();
        for out in packets {
            let mut bytes = wire::encode(&out.packet).unwrap().to_vec();
            if self.roll(self.drop_pct) {
                self.lost += 1;
                continue;
            }
            if self.roll(self.corrupt_pct) {
                let bit = self.rng.gen_range(0..bytes.len() * 8);
                bytes[bit / 8] ^= 1 << (bit % 8);
            }
            let copies = if self.roll(self.dup_pct) { 2 } else { 1 };
            for _ in 0..copies {
                match wire::decode(&bytes) {
                    Ok(packet) => arrived.push(packet),
                    Err(_) => self.lost += 1,
                }
            }
        }
        if self.reorder {
            arrived.shuffle(&mut self.rng);
        }
        self.carried += arrived.len();
        arrived
    }
}

/// Deliver traffic in both directions until neither side has anything to say.
pub fn exchange(
    a: &Node,
    b: &Node,
    link: &mut Link,
    mut a_out: Vec<Outbound>,
    mut b_out: Vec<Outbound>,
    now: Instant,
) {
    for _ in 0..MAX_ROUNDS {
        if a_out.is_empty() && b_out.is_empty() {
            return;
        }
        let to_b = link.carry(std::mem::take(&mut a_out));
        let to_a = link.carry(std::mem::take(&mut b_out));
        for packet in to_b {
            b_out.extend(b.manager.handle_packet(packet, now));
        }
        for packet in to_a {
            a_out.extend(a.manager.handle_packet(packet, now));
        }
    }
}

/// Poll both nodes once and deliver the result.
pub fn step(a: &Node, b: &Node, link: &mut Link, now: Instant) {
    let a_out = a.manager.poll(now);
    let b_out = b.manager.poll(now);
    exchange(a, b, link, a_out, b_out, now);
}

/// Step until both managers are idle. Returns the simulated time taken, or
/// `None` if `max_steps` ran out first.
pub fn run_until_idle(
    a: &Node,
    b: &Node,
    link: &mut Link,
    start: Instant,
    max_steps: usize,
) -> Option<Duration> {
    let mut now = start;
    for _ in 0..max_steps {
        step(a, b, link, now);
        if a.manager.is_empty() && b.manager.is_empty() {
            return Some(now - start);
        }
        now += STEP;
    }
    None
}

#[test]
fn test_harness_link_is_deterministic() {
    let packets = |n: u16| -> Vec<Outbound> {
        (0..n)
            .map(|tx_id| Outbound {
                node_id: GROUND,
                packet: Packet::Complete(wire::TxRef {
                    node_id: SAT,
                    tx_id,
                }),
            })
            .collect()
    };
    let mut first = Link::lossy(42);
    let mut second = Link::lossy(42);
    assert_eq!(first.carry(packets(200)), second.carry(packets(200)));
    assert!(first.lost > 0, "lossy link should lose something");

    let mut clean = Link::perfect();
    assert_eq!(clean.carry(packets(10)).len(), 10);
    assert_eq!(clean.lost, 0);
}
