//! Transaction manager: routes packets to transactions and drives them.
//!
//! The manager owns every live transaction, keyed by peer, tx id and
//! direction. Inbound packets go through `handle_packet`; timers go through
//! `poll`. Both return the packets to put on the link and never block on
//! I/O other than the local file system.
//!
//! Finished transaction keys are kept as tombstones for a while so that
//! stragglers (late Data, repeated Meta) are recognised instead of starting
//! a fresh transaction under the same id.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::broadcast;
use uplink_core::config::{MetaForm, TransferConfig};
use uplink_core::wire::{
    Data, MetaLong, MetaShort, NodeId, Packet, ReqData, ReqQueue, TxAnnounce, TxId, TxRef,
};
use uplink_core::{AgentName, FileName, NodeName};

use crate::error::{io_err, Result, TransferError};
use crate::events::{TransferEvent, TxSummary, EVENT_CAPACITY};
use crate::holes::Hole;
use crate::peer::PeerDirectory;
use crate::service::AuxHandler;
use crate::storage::{self, Checkpoint, Layout};
use crate::transaction::{
    DataOutcome, Direction, FileMeta, IncomingDue, OutgoingDue, Transaction, TxKey, TxState,
    MAX_FILE_SIZE,
};

/// Tx ids are split between the two ends of a link. The node with the lower
/// id allocates with this bit set, the other with it clear, so a tx id names
/// exactly one direction even when both nodes send to each other.
pub const TX_ID_LOW_NODE_BIT: TxId = 0x8000;

/// Who we are on the link.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub node_name: NodeName,
}

/// A packet and the node it is addressed to.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub node_id: NodeId,
    pub packet: Packet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    outcome: Outcome,
    at: Instant,
    /// Last time a straggler was answered with Complete.
    last_reply: Option<Instant>,
}

pub struct TransferManager {
    identity: NodeIdentity,
    settings: TransferConfig,
    layout: Layout,
    peers: PeerDirectory,
    aux: Arc<dyn AuxHandler>,
    transactions: DashMap<TxKey, Transaction>,
    tombstones: DashMap<TxKey, Tombstone>,
    /// Low bits of the next outgoing tx id to try, per peer.
    next_tx_id: DashMap<NodeId, TxId>,
    events: broadcast::Sender<TransferEvent>,
}

impl TransferManager {
    pub fn new(
        identity: NodeIdentity,
        settings: TransferConfig,
        peers: PeerDirectory,
        aux: Arc<dyn AuxHandler>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            identity,
            layout: Layout::new(settings.root.clone()),
            settings,
            peers,
            aux,
            transactions: DashMap::new(),
            tombstones: DashMap::new(),
            next_tx_id: DashMap::new(),
            events,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn get(&self, key: TxKey) -> Option<TxSummary> {
        self.transactions.get(&key).map(|tx| TxSummary::from(&*tx))
    }

    /// Every live transaction, ordered by key.
    pub fn snapshot(&self) -> Vec<TxSummary> {
        let mut all: Vec<TxSummary> = self
            .transactions
            .iter()
            .map(|tx| TxSummary::from(tx.value()))
            .collect();
        all.sort_by_key(|s| s.key);
        all
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Apply one validated packet and return the replies it provokes.
    pub fn handle_packet(&self, packet: Packet, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        if let Some(node_id) = packet.node_id() {
            self.peers.touch(node_id, now);
        }

        match packet {
            Packet::Heartbeat(beat) => {
                self.peers.record_heartbeat(&beat, now);
                self.dispatch_aux("heartbeat", || self.aux.on_heartbeat(&beat));
            }
            Packet::Message(note) => self.dispatch_aux("message", || self.aux.on_message(&note)),
            Packet::Command(note) => self.dispatch_aux("command", || self.aux.on_command(&note)),
            Packet::Raw(raw) => self.dispatch_aux("raw", || self.aux.on_raw(&raw)),
            Packet::ReqQueue(req) => {
                self.peers.learn(req.node_id, &req.node_name, now);
                self.answer_queue(req.node_id, &mut out);
            }
            Packet::Queue(q) => {
                self.peers.learn(q.node_id, &q.node_name, now);
                self.on_queue(q.node_id, q.tx_id, now, &mut out);
            }
            Packet::ReqMeta(req) => {
                self.peers.learn(req.node_id, &req.node_name, now);
                self.on_req_meta(req.node_id, req.tx_id, now, &mut out);
            }
            Packet::MetaLong(meta) => {
                let Some(node_id) = self.peers.id_of(&meta.node_name) else {
                    tracing::warn!(peer = %meta.node_name, tx_id = meta.tx_id, "metadata from unknown node name, dropping");
                    return out;
                };
                self.peers.touch(node_id, now);
                let file = FileMeta {
                    agent_name: meta.agent_name,
                    file_name: meta.file_name,
                    file_size: meta.file_size,
                };
                self.on_meta(node_id, meta.tx_id, file, now, &mut out);
            }
            Packet::MetaShort(meta) => {
                let file = FileMeta {
                    agent_name: meta.agent_name,
                    file_name: meta.file_name,
                    file_size: meta.file_size as u64,
                };
                self.on_meta(meta.node_id, meta.tx_id, file, now, &mut out);
            }
            Packet::ReqData(req) => self.on_req_data(req, now, &mut out),
            Packet::Data(data) => self.on_data(data, now, &mut out),
            Packet::Complete(c) => self.on_complete(c, now),
            Packet::Cancel(c) => self.on_cancel(c, now),
            Packet::ReqComplete(c) => self.on_req_complete(c, now, &mut out),
        }
        out
    }

    fn dispatch_aux(&self, kind: &'static str, handle: impl FnOnce() -> anyhow::Result<()>) {
        if let Err(e) = handle() {
            tracing::warn!(kind, error = %e, "auxiliary handler failed");
        }
    }

    fn answer_queue(&self, node_id: NodeId, out: &mut Vec<Outbound>) {
        let mut tx_ids: Vec<TxId> = self
            .transactions
            .iter()
            .filter(|tx| {
                let key = tx.key();
                key.direction == Direction::Outgoing
                    && key.node_id == node_id
                    && tx.enabled()
                    && !tx.state().is_terminal()
            })
            .map(|tx| tx.key().tx_id)
            .collect();
        tx_ids.sort_unstable();
        tracing::debug!(node_id, count = tx_ids.len(), "answering queue request");
        for tx_id in tx_ids {
            out.push(self.announce(node_id, tx_id, true));
        }
    }

    fn on_queue(&self, node_id: NodeId, tx_id: TxId, now: Instant, out: &mut Vec<Outbound>) {
        let key = TxKey::incoming(node_id, tx_id);
        if self.answer_tombstone(key, now, out) {
            return;
        }
        let Some(mut tx) = self.incoming_entry(key, now) else {
            return;
        };
        if tx.state() == TxState::AwaitingMeta && tx.request_due(now, self.settings.request_timeout()) {
            tx.issue_request(now);
            out.push(self.announce(node_id, tx_id, false));
        }
    }

    fn on_meta(&self, node_id: NodeId, tx_id: TxId, meta: FileMeta, now: Instant, out: &mut Vec<Outbound>) {
        let key = TxKey::incoming(node_id, tx_id);
        if self.answer_tombstone(key, now, out) {
            return;
        }
        let failure = {
            let Some(mut tx) = self.incoming_entry(key, now) else {
                return;
            };
            let event = TransferEvent::MetaReceived {
                key,
                agent_name: meta.agent_name.to_string(),
                file_name: meta.file_name.to_string(),
                file_size: meta.file_size,
            };
            match tx.apply_meta(meta, &self.layout, now) {
                Ok(true) => {
                    tracing::info!(
                        tx = %key,
                        peer = %tx.peer_name(),
                        file_name = tx.meta().map(|m| m.file_name.as_str()).unwrap_or_default(),
                        file_size = tx.file_size().unwrap_or_default(),
                        "metadata received"
                    );
                    let _ = self.events.send(event);
                    if let Err(e) = tx.checkpoint(&self.layout, now, self.settings.checkpoint_interval(), true) {
                        tracing::warn!(tx = %key, error = %e, "checkpoint failed");
                    }
                    if let IncomingDue::ReqData(hole) = tx.issue_request(now) {
                        out.push(self.req_data(key, hole));
                    }
                    None
                }
                Ok(false) => None,
                Err(e) => Some(e.to_string()),
            }
        };
        if let Some(reason) = failure {
            tracing::warn!(tx = %key, reason, "rejecting metadata");
            self.fail(key, reason, now, out);
        }
    }

    fn on_data(&self, data: Data, now: Instant, out: &mut Vec<Outbound>) {
        let key = TxKey::incoming(data.node_id, data.tx_id);
        if self.answer_tombstone(key, now, out) {
            return;
        }
        let result = {
            let Some(mut tx) = self.incoming_entry(key, now) else {
                return;
            };
            match tx.apply_data(data.chunk_start as u64, &data.chunk, now) {
                Ok(DataOutcome::NeedMeta) => {
                    if tx.request_due(now, self.settings.request_timeout()) {
                        tx.issue_request(now);
                        out.push(self.announce(key.node_id, key.tx_id, false));
                    }
                    Ok(())
                }
                Ok(DataOutcome::Ignored) => {
                    tracing::trace!(tx = %key, chunk_start = data.chunk_start, "nothing new in chunk");
                    Ok(())
                }
                Ok(DataOutcome::Written {
                    added,
                    request_satisfied,
                }) => {
                    tracing::debug!(tx = %key, chunk_start = data.chunk_start, added, "chunk written");
                    let _ = self.events.send(TransferEvent::Progress {
                        key,
                        bytes_done: tx.bytes_done(),
                        file_size: tx.file_size().unwrap_or_default(),
                    });
                    if tx.state() == TxState::DataComplete {
                        tracing::info!(tx = %key, "all data received");
                    } else if request_satisfied {
                        if let IncomingDue::ReqData(hole) = tx.issue_request(now) {
                            out.push(self.req_data(key, hole));
                        }
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            tracing::warn!(tx = %key, error = %e, "failed to store chunk");
            self.fail(key, e.to_string(), now, out);
        }
    }

    fn on_req_meta(&self, node_id: NodeId, tx_id: TxId, now: Instant, out: &mut Vec<Outbound>) {
        let key = TxKey::outgoing(node_id, tx_id);
        match self.transactions.get_mut(&key) {
            Some(mut tx) => {
                if tx.on_req_meta(now) {
                    if let Some(meta) = self.meta_packet(&tx) {
                        out.push(meta);
                    }
                }
            }
            None => self.reject_unknown(key, out),
        }
    }

    fn on_req_data(&self, req: ReqData, now: Instant, out: &mut Vec<Outbound>) {
        let key = TxKey::outgoing(req.node_id, req.tx_id);
        let result = {
            let Some(mut tx) = self.transactions.get_mut(&key) else {
                self.reject_unknown(key, out);
                return;
            };
            let owed = tx.on_req_data(req.hole_start as u64, req.hole_end as u64, now);
            tracing::debug!(tx = %key, start = req.hole_start, end = req.hole_end, owed, "data requested");
            self.push_chunks(&mut tx, now, out)
        };
        if let Err(e) = result {
            tracing::warn!(tx = %key, error = %e, "failed to read source");
            self.fail(key, e.to_string(), now, out);
        }
    }

    fn on_complete(&self, c: TxRef, now: Instant) {
        let key = TxKey::outgoing(c.node_id, c.tx_id);
        let Some((_, mut tx)) = self.transactions.remove(&key) else {
            tracing::trace!(tx = %key, "completion for unknown transaction");
            return;
        };
        tx.on_complete();
        let source = tx.file_path().map(Path::to_path_buf).unwrap_or_default();
        tracing::info!(tx = %key, peer = %tx.peer_name(), path = %source.display(), "transfer confirmed by peer");
        self.remove_source(&tx);
        self.retire(key, Outcome::Completed, now);
        let _ = self.events.send(TransferEvent::Completed { key, path: source });
    }

    /// A Cancel carries no direction. The tx id tells whose allocation it
    /// is: one of ours means the peer aborted its receive.
    fn on_cancel(&self, c: TxRef, now: Instant) {
        let key = if self.allocated_here(c.node_id, c.tx_id) {
            TxKey::outgoing(c.node_id, c.tx_id)
        } else {
            TxKey::incoming(c.node_id, c.tx_id)
        };
        let Some((key, mut tx)) = self.transactions.remove(&key) else {
            tracing::trace!(tx = %key, "cancel for unknown transaction");
            return;
        };
        tracing::info!(tx = %key, "cancelled by peer");
        tx.cancel(&self.layout);
        self.remove_source(&tx);
        self.retire(key, Outcome::Cancelled, now);
        let _ = self.events.send(TransferEvent::Cancelled { key, by_peer: true });
    }

    fn on_req_complete(&self, c: TxRef, now: Instant, out: &mut Vec<Outbound>) {
        let key = TxKey::incoming(c.node_id, c.tx_id);
        if self.answer_tombstone(key, now, out) {
            return;
        }
        let finalize = {
            let Some(mut tx) = self.incoming_entry(key, now) else {
                return;
            };
            match tx.state() {
                TxState::DataComplete => true,
                // the sender believes it is done: say what is still missing
                _ => {
                    match tx.issue_request(now) {
                        IncomingDue::ReqMeta => out.push(self.announce(key.node_id, key.tx_id, false)),
                        IncomingDue::ReqData(hole) => out.push(self.req_data(key, hole)),
                        _ => {}
                    }
                    false
                }
            }
        };
        if finalize {
            self.finalize(key, now, out);
        }
    }

    // ── Sweep ────────────────────────────────────────────────────────────────

    /// Periodic work: requests, retransmissions, finalization, checkpoints
    /// and tombstone expiry.
    pub fn poll(&self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        let mut keys: Vec<TxKey> = self.transactions.iter().map(|tx| *tx.key()).collect();
        keys.sort_unstable();
        for key in keys {
            match key.direction {
                Direction::Incoming => self.poll_incoming(key, now, &mut out),
                Direction::Outgoing => self.poll_outgoing(key, now, &mut out),
            }
        }

        let ttl = self.settings.tombstone_ttl();
        self.tombstones
            .retain(|_, t| now.saturating_duration_since(t.at) < ttl);
        out
    }

    fn poll_incoming(&self, key: TxKey, now: Instant, out: &mut Vec<Outbound>) {
        let finalize = {
            let Some(mut tx) = self.transactions.get_mut(&key) else {
                return;
            };
            let due = tx.poll_incoming(now, self.settings.request_timeout(), self.settings.max_retries);
            match due {
                IncomingDue::ReqMeta => {
                    tracing::debug!(tx = %key, retries = tx.retries(), "requesting metadata");
                    out.push(self.announce(key.node_id, key.tx_id, false));
                }
                IncomingDue::ReqData(hole) => {
                    tracing::debug!(tx = %key, start = hole.start, end = hole.end, retries = tx.retries(), "requesting data");
                    out.push(self.req_data(key, hole));
                }
                IncomingDue::Stalled => {
                    tracing::warn!(tx = %key, retries = tx.retries(), missing = tx.holes().missing_bytes(), "transfer stalled");
                    let _ = self.events.send(TransferEvent::Stalled {
                        key,
                        retries: tx.retries(),
                    });
                }
                IncomingDue::Finalize | IncomingDue::Nothing => {}
            }
            if due != IncomingDue::Finalize {
                if let Err(e) = tx.checkpoint(&self.layout, now, self.settings.checkpoint_interval(), false) {
                    tracing::warn!(tx = %key, error = %e, "checkpoint failed");
                }
            }
            due == IncomingDue::Finalize
        };
        if finalize {
            self.finalize(key, now, out);
        }
    }

    fn poll_outgoing(&self, key: TxKey, now: Instant, out: &mut Vec<Outbound>) {
        let result = {
            let Some(mut tx) = self.transactions.get_mut(&key) else {
                return;
            };
            match tx.poll_outgoing(now, self.settings.request_timeout(), self.settings.max_retries) {
                OutgoingDue::Meta => {
                    tracing::debug!(tx = %key, retries = tx.retries(), "sending metadata");
                    if let Some(meta) = self.meta_packet(&tx) {
                        out.push(meta);
                    }
                    Ok(())
                }
                OutgoingDue::Data => self.push_chunks(&mut tx, now, out),
                OutgoingDue::ReqComplete => {
                    tracing::debug!(tx = %key, retries = tx.retries(), "asking peer for completion");
                    out.push(Outbound {
                        node_id: key.node_id,
                        packet: Packet::ReqComplete(self.tx_ref(key.tx_id)),
                    });
                    Ok(())
                }
                OutgoingDue::Stalled => {
                    tracing::warn!(tx = %key, retries = tx.retries(), "peer stopped answering");
                    let _ = self.events.send(TransferEvent::Stalled {
                        key,
                        retries: tx.retries(),
                    });
                    Ok(())
                }
                OutgoingDue::Nothing => Ok(()),
            }
        };
        if let Err(e) = result {
            tracing::warn!(tx = %key, error = %e, "failed to read source");
            self.fail(key, e.to_string(), now, out);
        }
    }

    fn push_chunks(&self, tx: &mut Transaction, now: Instant, out: &mut Vec<Outbound>) -> Result<()> {
        let key = tx.key();
        let chunks = tx.next_chunks(self.settings.burst_chunks, self.settings.chunk_size(), now)?;
        for (start, chunk) in chunks {
            out.push(Outbound {
                node_id: key.node_id,
                packet: Packet::Data(Data {
                    node_id: self.identity.node_id,
                    tx_id: key.tx_id,
                    chunk_start: start as u32,
                    chunk,
                }),
            });
        }
        if tx.state() == TxState::AwaitingComplete {
            tracing::debug!(tx = %key, bytes = tx.bytes_done(), "all requested data sent");
        }
        Ok(())
    }

    fn finalize(&self, key: TxKey, now: Instant, out: &mut Vec<Outbound>) {
        let Some((_, mut tx)) = self.transactions.remove(&key) else {
            return;
        };
        match tx.finalize(&self.layout) {
            Ok(path) => {
                tracing::info!(
                    tx = %key,
                    peer = %tx.peer_name(),
                    bytes = tx.bytes_done(),
                    path = %path.display(),
                    "file received"
                );
                out.push(Outbound {
                    node_id: key.node_id,
                    packet: Packet::Complete(self.tx_ref(key.tx_id)),
                });
                self.retire(key, Outcome::Completed, now);
                let _ = self.events.send(TransferEvent::Completed { key, path });
            }
            Err(e) => {
                tracing::warn!(tx = %key, error = %e, "failed to finalize file");
                self.transactions.insert(key, tx);
                self.fail(key, e.to_string(), now, out);
            }
        }
    }

    // ── Local operations ─────────────────────────────────────────────────────

    /// Queue `source` for delivery to `node_id` on behalf of `agent`.
    pub fn enqueue(&self, node_id: NodeId, agent: AgentName, source: &Path, now: Instant) -> Result<TxKey> {
        let peer_name = self
            .peers
            .name_of(node_id)
            .ok_or_else(|| TransferError::UnknownPeer(node_id.to_string()))?;
        let raw_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::UnsafeName(source.display().to_string()))?;
        storage::check_component(raw_name)?;
        storage::check_component(agent.as_str())?;
        let file_name = FileName::new(raw_name)?;

        let size = std::fs::metadata(source)
            .map_err(io_err("failed to stat", source))?
            .len();
        if size > MAX_FILE_SIZE {
            return Err(TransferError::FileTooLarge {
                path: source.to_path_buf(),
                size,
                max: MAX_FILE_SIZE,
            });
        }

        let mut queued = 0;
        for tx in self.transactions.iter() {
            let key = tx.key();
            if key.direction != Direction::Outgoing || key.node_id != node_id {
                continue;
            }
            if tx.file_path() == Some(source) {
                return Err(TransferError::Duplicate(source.to_path_buf()));
            }
            queued += 1;
        }
        if queued >= self.settings.queue_limit {
            return Err(TransferError::QueueFull {
                node_id,
                limit: self.settings.queue_limit,
            });
        }

        let tx_id = self.allocate_tx_id(node_id).ok_or(TransferError::QueueFull {
            node_id,
            limit: self.settings.queue_limit,
        })?;
        let meta = FileMeta {
            agent_name: agent,
            file_name,
            file_size: size,
        };
        let tx = Transaction::outgoing(node_id, tx_id, peer_name, meta, source.to_path_buf(), now);
        let key = tx.key();
        tracing::info!(tx = %key, peer = %tx.peer_name(), path = %source.display(), size, "file queued");
        self.transactions.insert(key, tx);
        let _ = self.events.send(TransferEvent::Started { key });
        Ok(key)
    }

    /// Queue every file under `<root>/<peer>/outgoing/<agent>/` for every
    /// known peer. Files already queued are skipped.
    pub fn load_outgoing(&self, now: Instant) -> Result<Vec<TxKey>> {
        let mut queued = Vec::new();
        for node_id in self.peers.ids() {
            let Some(peer_name) = self.peers.name_of(node_id) else {
                continue;
            };
            for file in self.layout.outgoing_files(&peer_name)? {
                match self.enqueue(node_id, file.agent, &file.path, now) {
                    Ok(key) => queued.push(key),
                    Err(TransferError::Duplicate(_)) => {}
                    Err(TransferError::QueueFull { .. }) => {
                        tracing::debug!(node_id, "outgoing queue full, leaving the rest for later");
                        break;
                    }
                    Err(e) => tracing::warn!(path = %file.path.display(), error = %e, "cannot queue file"),
                }
            }
        }
        Ok(queued)
    }

    /// Abort a transaction and tell the peer.
    pub fn cancel(&self, key: TxKey, now: Instant) -> Result<Vec<Outbound>> {
        let (_, mut tx) = self
            .transactions
            .remove(&key)
            .ok_or(TransferError::UnknownTransaction(key))?;
        tracing::info!(tx = %key, "cancelled locally");
        tx.cancel(&self.layout);
        self.remove_source(&tx);
        self.retire(key, Outcome::Cancelled, now);
        let _ = self.events.send(TransferEvent::Cancelled { key, by_peer: false });
        Ok(vec![Outbound {
            node_id: key.node_id,
            packet: Packet::Cancel(self.tx_ref(key.tx_id)),
        }])
    }

    /// Forget a transaction without telling the peer. Incoming temp data and
    /// its checkpoint stay on disk so `resume` can pick it up again.
    pub fn purge(&self, key: TxKey, now: Instant) -> Result<()> {
        let (_, mut tx) = self
            .transactions
            .remove(&key)
            .ok_or(TransferError::UnknownTransaction(key))?;
        if let Err(e) = tx.checkpoint(&self.layout, now, self.settings.checkpoint_interval(), true) {
            tracing::warn!(tx = %key, error = %e, "checkpoint failed");
        }
        tx.release();
        tracing::info!(tx = %key, "purged");
        Ok(())
    }

    /// Purge every transaction with `node_id` in `direction`. Returns how
    /// many were dropped.
    pub fn reset_queue(&self, node_id: NodeId, direction: Direction, now: Instant) -> usize {
        let keys: Vec<TxKey> = self
            .transactions
            .iter()
            .map(|tx| *tx.key())
            .filter(|k| k.node_id == node_id && k.direction == direction)
            .collect();
        keys.into_iter()
            .filter(|key| self.purge(*key, now).is_ok())
            .count()
    }

    /// Pause or resume one transaction. A disabled transaction sends
    /// nothing on its own but still accepts data.
    pub fn set_enabled(&self, key: TxKey, enabled: bool) -> Result<()> {
        let mut tx = self
            .transactions
            .get_mut(&key)
            .ok_or(TransferError::UnknownTransaction(key))?;
        tx.set_enabled(enabled);
        tracing::info!(tx = %key, enabled, "transaction toggled");
        Ok(())
    }

    pub fn set_enabled_all(&self, enabled: bool) {
        for mut tx in self.transactions.iter_mut() {
            tx.set_enabled(enabled);
        }
    }

    /// Ask `node_id` to announce its outgoing transactions.
    pub fn request_queue(&self, node_id: NodeId) -> Result<Outbound> {
        if self.peers.get(node_id).is_none() {
            return Err(TransferError::UnknownPeer(node_id.to_string()));
        }
        Ok(Outbound {
            node_id,
            packet: Packet::ReqQueue(ReqQueue {
                node_id: self.identity.node_id,
                node_name: self.identity.node_name.clone(),
            }),
        })
    }

    /// Build a heartbeat advertising this node.
    pub fn heartbeat(&self, beat_period: f32, throughput: f32, unix_time: u32) -> Packet {
        Packet::Heartbeat(uplink_core::wire::Heartbeat {
            node_id: self.identity.node_id,
            node_name: self.identity.node_name.clone(),
            beat_period,
            throughput,
            unix_time,
        })
    }

    /// Rebuild incoming transactions from checkpoints of every known peer.
    /// Returns how many were restored.
    pub fn resume(&self, now: Instant) -> Result<usize> {
        let mut restored = 0;
        for node_id in self.peers.ids() {
            let Some(peer_name) = self.peers.name_of(node_id) else {
                continue;
            };
            for path in self.layout.checkpoints(&peer_name)? {
                let mut checkpoint = match Checkpoint::load(&path) {
                    Ok(cp) => cp,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint");
                        continue;
                    }
                };
                // node ids are per link; the directory knows the current one
                checkpoint.node_id = node_id;
                checkpoint.node_name = peer_name.clone();
                let key = TxKey::incoming(node_id, checkpoint.tx_id);
                if self.transactions.contains_key(&key) {
                    continue;
                }
                match Transaction::resumed(checkpoint, &self.layout, now) {
                    Ok(tx) => {
                        tracing::info!(
                            tx = %key,
                            peer = %peer_name,
                            missing = tx.holes().missing_bytes(),
                            "resumed from checkpoint"
                        );
                        self.tombstones.remove(&key);
                        self.transactions.insert(key, tx);
                        let _ = self.events.send(TransferEvent::Started { key });
                        restored += 1;
                    }
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot resume"),
                }
            }
        }
        Ok(restored)
    }

    /// Checkpoint and close everything. Temp files stay for `resume`.
    pub fn shutdown(&self, now: Instant) -> usize {
        let keys: Vec<TxKey> = self.transactions.iter().map(|tx| *tx.key()).collect();
        let mut closed = 0;
        for key in keys {
            if let Some((_, mut tx)) = self.transactions.remove(&key) {
                if let Err(e) = tx.checkpoint(&self.layout, now, self.settings.checkpoint_interval(), true) {
                    tracing::warn!(tx = %key, error = %e, "checkpoint failed");
                }
                tx.release();
                closed += 1;
            }
        }
        tracing::info!(closed, "transfer manager shut down");
        closed
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Live incoming transaction for `key`, created on first reference.
    /// `None` if the peer is unknown or its queue is full.
    fn incoming_entry(
        &self,
        key: TxKey,
        now: Instant,
    ) -> Option<dashmap::mapref::one::RefMut<'_, TxKey, Transaction>> {
        if let Some(tx) = self.transactions.get_mut(&key) {
            return Some(tx);
        }
        let Some(peer_name) = self.peers.name_of(key.node_id) else {
            tracing::warn!(tx = %key, "packet from unknown node, dropping");
            return None;
        };
        if let Err(e) = storage::check_component(peer_name.as_str()) {
            tracing::warn!(tx = %key, error = %e, "peer name is not a directory name, dropping");
            return None;
        }
        let active = self
            .transactions
            .iter()
            .filter(|tx| tx.key().node_id == key.node_id && tx.key().direction == Direction::Incoming)
            .count();
        if active >= self.settings.queue_limit {
            tracing::warn!(tx = %key, limit = self.settings.queue_limit, "incoming queue full, dropping");
            return None;
        }
        let tx = self.transactions.entry(key).or_insert_with(|| {
            tracing::info!(tx = %key, peer = %peer_name, "incoming transaction");
            let _ = self.events.send(TransferEvent::Started { key });
            Transaction::incoming(key.node_id, key.tx_id, peer_name, now)
        });
        Some(tx)
    }

    /// Handle a packet for a finished transaction. Returns true if `key` is
    /// tombstoned; a completed one re-answers Complete, at most once per
    /// request timeout.
    fn answer_tombstone(&self, key: TxKey, now: Instant, out: &mut Vec<Outbound>) -> bool {
        let Some(mut tomb) = self.tombstones.get_mut(&key) else {
            return false;
        };
        if tomb.outcome == Outcome::Completed {
            let due = tomb
                .last_reply
                .map_or(true, |t| now.saturating_duration_since(t) >= self.settings.request_timeout());
            if due {
                tomb.last_reply = Some(now);
                out.push(Outbound {
                    node_id: key.node_id,
                    packet: Packet::Complete(self.tx_ref(key.tx_id)),
                });
            }
        }
        true
    }

    /// Tell the peer we have no such outgoing transaction, unless we just
    /// finished it.
    fn reject_unknown(&self, key: TxKey, out: &mut Vec<Outbound>) {
        if self.tombstones.contains_key(&key) {
            return;
        }
        tracing::debug!(tx = %key, "request for unknown outgoing transaction");
        out.push(Outbound {
            node_id: key.node_id,
            packet: Packet::Cancel(self.tx_ref(key.tx_id)),
        });
    }

    /// Tear down after a local failure and tell the peer.
    fn fail(&self, key: TxKey, reason: String, now: Instant, out: &mut Vec<Outbound>) {
        if let Some((_, mut tx)) = self.transactions.remove(&key) {
            tx.fail(&self.layout);
        }
        self.retire(key, Outcome::Failed, now);
        out.push(Outbound {
            node_id: key.node_id,
            packet: Packet::Cancel(self.tx_ref(key.tx_id)),
        });
        let _ = self.events.send(TransferEvent::Failed { key, reason });
    }

    fn retire(&self, key: TxKey, outcome: Outcome, now: Instant) {
        self.tombstones.insert(
            key,
            Tombstone {
                outcome,
                at: now,
                last_reply: None,
            },
        );
    }

    fn remove_source(&self, tx: &Transaction) {
        if tx.key().direction != Direction::Outgoing || !self.settings.remove_sent_files {
            return;
        }
        if let Some(path) = tx.file_path() {
            if let Err(e) = storage::remove_if_exists(path) {
                tracing::warn!(tx = %tx.key(), error = %e, "failed to remove sent file");
            }
        }
    }

    /// Bits every id we allocate towards `peer` carries.
    fn tx_id_base(&self, peer: NodeId) -> TxId {
        if self.identity.node_id < peer {
            TX_ID_LOW_NODE_BIT
        } else {
            0
        }
    }

    fn allocated_here(&self, peer: NodeId, tx_id: TxId) -> bool {
        (tx_id & TX_ID_LOW_NODE_BIT) == self.tx_id_base(peer)
    }

    /// Next free outgoing id for `node_id`. The low bits are never zero.
    fn allocate_tx_id(&self, node_id: NodeId) -> Option<TxId> {
        let base = self.tx_id_base(node_id);
        let mut next = self.next_tx_id.entry(node_id).or_insert(1);
        for _ in 0..TX_ID_LOW_NODE_BIT {
            let candidate = base | *next;
            *next = if *next + 1 == TX_ID_LOW_NODE_BIT { 1 } else { *next + 1 };
            let key = TxKey::outgoing(node_id, candidate);
            if !self.transactions.contains_key(&key) && !self.tombstones.contains_key(&key) {
                return Some(candidate);
            }
        }
        None
    }

    fn tx_ref(&self, tx_id: TxId) -> TxRef {
        TxRef {
            node_id: self.identity.node_id,
            tx_id,
        }
    }

    /// Queue (`queue = true`) or ReqMeta for `tx_id`, addressed to `node_id`.
    fn announce(&self, node_id: NodeId, tx_id: TxId, queue: bool) -> Outbound {
        let announce = TxAnnounce {
            node_id: self.identity.node_id,
            node_name: self.identity.node_name.clone(),
            tx_id,
        };
        Outbound {
            node_id,
            packet: if queue {
                Packet::Queue(announce)
            } else {
                Packet::ReqMeta(announce)
            },
        }
    }

    fn req_data(&self, key: TxKey, hole: Hole) -> Outbound {
        Outbound {
            node_id: key.node_id,
            packet: Packet::ReqData(ReqData {
                node_id: self.identity.node_id,
                tx_id: key.tx_id,
                hole_start: hole.start as u32,
                hole_end: hole.end as u32,
            }),
        }
    }

    fn meta_packet(&self, tx: &Transaction) -> Option<Outbound> {
        let meta = tx.meta()?;
        let key = tx.key();
        let packet = match self.settings.meta_form {
            MetaForm::Short => Packet::MetaShort(MetaShort {
                node_id: self.identity.node_id,
                tx_id: key.tx_id,
                agent_name: meta.agent_name.clone(),
                file_name: meta.file_name.clone(),
                file_size: meta.file_size as u32,
            }),
            MetaForm::Long => Packet::MetaLong(MetaLong {
                node_name: self.identity.node_name.clone(),
                tx_id: key.tx_id,
                agent_name: meta.agent_name.clone(),
                file_name: meta.file_name.clone(),
                file_size: meta.file_size,
            }),
        };
        Some(Outbound {
            node_id: key.node_id,
            packet,
        })
    }
}
