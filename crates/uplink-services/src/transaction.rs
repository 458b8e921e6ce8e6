//! One file moving in one direction between us and a peer.
//!
//! A `Transaction` owns its hole list and its open file. It decides its own
//! state transitions; the manager turns the outcomes into packets.
//!
//! Receiving: AwaitingMeta → HaveMeta → Receiving → DataComplete → Finalized
//! Sending:   MetaQueued → MetaSent → DataSending → AwaitingComplete → Finalized
//!
//! Cancelled and Failed are terminal and reachable from every live state.
//! Stalled means retries ran out; fresh traffic from the peer revives it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use uplink_core::wire::{NodeId, TxId};
use uplink_core::{AgentName, FileName, NodeName};

use crate::error::{Result, TransferError};
use crate::holes::{Hole, HoleTracker};
use crate::storage::{self, Checkpoint, Layout, ScopedFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The peer sends, we receive.
    Incoming,
    /// We send, the peer receives.
    Outgoing,
}

/// Identity of a transaction: the peer, its tx id, and which way data flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TxKey {
    pub node_id: NodeId,
    pub tx_id: TxId,
    pub direction: Direction,
}

impl TxKey {
    pub fn incoming(node_id: NodeId, tx_id: TxId) -> Self {
        Self {
            node_id,
            tx_id,
            direction: Direction::Incoming,
        }
    }

    pub fn outgoing(node_id: NodeId, tx_id: TxId) -> Self {
        Self {
            node_id,
            tx_id,
            direction: Direction::Outgoing,
        }
    }
}

impl fmt::Display for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Incoming => "in",
            Direction::Outgoing => "out",
        };
        write!(f, "{dir}:{}/{}", self.node_id, self.tx_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    AwaitingMeta,
    HaveMeta,
    Receiving,
    DataComplete,
    MetaQueued,
    MetaSent,
    DataSending,
    AwaitingComplete,
    Stalled,
    Finalized,
    Cancelled,
    Failed,
}

impl TxState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Finalized | TxState::Cancelled | TxState::Failed)
    }
}

/// What the metadata packets announce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMeta {
    pub agent_name: AgentName,
    pub file_name: FileName,
    pub file_size: u64,
}

/// Largest file either metadata form can describe: Data and ReqData carry
/// 32-bit offsets.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;

/// Result of applying one Data packet to a receiving transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// Metadata is unknown; the bytes were discarded.
    NeedMeta,
    /// Nothing new: duplicate, out of range, or the transaction is over.
    Ignored,
    Written {
        added: u64,
        /// The range last requested has now fully arrived.
        request_satisfied: bool,
    },
}

/// What a receiving transaction wants from the periodic sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingDue {
    Nothing,
    ReqMeta,
    ReqData(Hole),
    Finalize,
    /// Retries just ran out.
    Stalled,
}

/// What a sending transaction wants from the periodic sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingDue {
    Nothing,
    Meta,
    Data,
    ReqComplete,
    /// Retries just ran out.
    Stalled,
}

#[derive(Debug)]
pub struct Transaction {
    key: TxKey,
    peer_name: NodeName,
    state: TxState,
    enabled: bool,
    meta: Option<FileMeta>,
    /// Incoming: bytes not yet received. Outgoing: bytes owed to the peer.
    holes: HoleTracker,
    file: Option<ScopedFile>,
    temp_path: Option<PathBuf>,
    /// Incoming: final destination. Outgoing: source file.
    file_path: Option<PathBuf>,
    /// Incoming: distinct bytes received. Outgoing: bytes put on the link.
    bytes_done: u64,
    requested: Option<Hole>,
    created_at: Instant,
    last_activity: Instant,
    last_request: Option<Instant>,
    retries: u32,
    last_checkpoint: Option<Instant>,
    checkpoint_dirty: bool,
}

impl Transaction {
    /// A transaction we learned about from the peer, before its metadata.
    pub fn incoming(node_id: NodeId, tx_id: TxId, peer_name: NodeName, now: Instant) -> Self {
        Self::blank(TxKey::incoming(node_id, tx_id), peer_name, TxState::AwaitingMeta, now)
    }

    /// A local file queued for the peer.
    pub fn outgoing(
        node_id: NodeId,
        tx_id: TxId,
        peer_name: NodeName,
        meta: FileMeta,
        source: PathBuf,
        now: Instant,
    ) -> Self {
        let mut tx = Self::blank(TxKey::outgoing(node_id, tx_id), peer_name, TxState::MetaQueued, now);
        tx.holes = HoleTracker::empty(meta.file_size);
        tx.meta = Some(meta);
        tx.file_path = Some(source);
        tx
    }

    /// Rebuild a receiving transaction from its checkpoint and temp file.
    pub fn resumed(checkpoint: Checkpoint, layout: &Layout, now: Instant) -> Result<Self> {
        storage::check_component(checkpoint.agent_name.as_str())?;
        storage::check_component(checkpoint.file_name.as_str())?;
        let mut tx = Self::incoming(
            checkpoint.node_id,
            checkpoint.tx_id,
            checkpoint.node_name.clone(),
            now,
        );
        let temp = layout.temp_path(&checkpoint.node_name, checkpoint.tx_id);
        if !temp.exists() {
            // data file lost: every byte is missing again
            tx.holes = HoleTracker::initialize(checkpoint.file_size);
        } else {
            tx.holes = HoleTracker::from_holes(checkpoint.file_size, checkpoint.holes);
        }
        tx.file = Some(ScopedFile::open_write(&temp)?);
        tx.file_path = Some(layout.incoming_path(
            &checkpoint.node_name,
            &checkpoint.agent_name,
            &checkpoint.file_name,
        ));
        tx.temp_path = Some(temp);
        tx.bytes_done = checkpoint.file_size - tx.holes.missing_bytes();
        tx.state = if tx.holes.is_complete() {
            TxState::DataComplete
        } else if tx.bytes_done > 0 {
            TxState::Receiving
        } else {
            TxState::HaveMeta
        };
        tx.meta = Some(FileMeta {
            agent_name: checkpoint.agent_name,
            file_name: checkpoint.file_name,
            file_size: checkpoint.file_size,
        });
        Ok(tx)
    }

    fn blank(key: TxKey, peer_name: NodeName, state: TxState, now: Instant) -> Self {
        Self {
            key,
            peer_name,
            state,
            enabled: true,
            meta: None,
            holes: HoleTracker::default(),
            file: None,
            temp_path: None,
            file_path: None,
            bytes_done: 0,
            requested: None,
            created_at: now,
            last_activity: now,
            last_request: None,
            retries: 0,
            last_checkpoint: None,
            checkpoint_dirty: false,
        }
    }

    pub fn key(&self) -> TxKey {
        self.key
    }

    pub fn peer_name(&self) -> &NodeName {
        &self.peer_name
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn meta(&self) -> Option<&FileMeta> {
        self.meta.as_ref()
    }

    pub fn holes(&self) -> &HoleTracker {
        &self.holes
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    pub fn file_size(&self) -> Option<u64> {
        self.meta.as_ref().map(|m| m.file_size)
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn temp_path(&self) -> Option<&Path> {
        self.temp_path.as_deref()
    }

    pub fn has_open_file(&self) -> bool {
        self.file.is_some()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    /// Store metadata, size the hole list and open the temp file.
    ///
    /// Returns false when metadata was already known; a repeated Meta packet
    /// changes nothing.
    pub fn apply_meta(&mut self, meta: FileMeta, layout: &Layout, now: Instant) -> Result<bool> {
        if self.meta.is_some() || self.state.is_terminal() {
            return Ok(false);
        }
        storage::check_component(meta.agent_name.as_str())?;
        storage::check_component(meta.file_name.as_str())?;
        if meta.file_size > MAX_FILE_SIZE {
            return Err(TransferError::FileTooLarge {
                path: PathBuf::from(meta.file_name.as_str()),
                size: meta.file_size,
                max: MAX_FILE_SIZE,
            });
        }

        let temp = layout.temp_path(&self.peer_name, self.key.tx_id);
        let mut file = ScopedFile::open_write(&temp)?;
        // leftovers from an earlier transaction with the same id
        file.set_len(meta.file_size)?;

        self.file = Some(file);
        self.file_path = Some(layout.incoming_path(&self.peer_name, &meta.agent_name, &meta.file_name));
        self.temp_path = Some(temp);
        self.holes = HoleTracker::initialize(meta.file_size);
        self.state = if meta.file_size == 0 {
            TxState::DataComplete
        } else {
            TxState::HaveMeta
        };
        self.meta = Some(meta);
        self.last_activity = now;
        self.last_request = None;
        self.requested = None;
        self.retries = 0;
        self.checkpoint_dirty = true;
        Ok(true)
    }

    /// Write one chunk at its offset and account for it.
    ///
    /// Applying the same chunk twice has the same effect as applying it once.
    pub fn apply_data(&mut self, chunk_start: u64, chunk: &[u8], now: Instant) -> Result<DataOutcome> {
        if self.state.is_terminal() {
            return Ok(DataOutcome::Ignored);
        }
        let Some(file_size) = self.file_size() else {
            if self.state == TxState::Stalled {
                self.state = TxState::AwaitingMeta;
                self.retries = 0;
            }
            return Ok(DataOutcome::NeedMeta);
        };

        let end = (chunk_start + chunk.len() as u64).min(file_size);
        if chunk_start >= end || self.holes.missing_within(chunk_start, end) == 0 {
            return Ok(DataOutcome::Ignored);
        }

        let part = &chunk[..(end - chunk_start) as usize];
        if self.file.is_none() {
            if let Some(temp) = &self.temp_path {
                self.file = Some(ScopedFile::open_write(temp)?);
            }
        }
        if let Some(file) = self.file.as_mut() {
            file.write_at(chunk_start, part)?;
        }

        let added = self.holes.mark_received(chunk_start, end);
        self.bytes_done += added;
        self.last_activity = now;
        self.retries = 0;
        self.checkpoint_dirty = true;

        let complete = self.holes.is_complete();
        self.state = if complete {
            TxState::DataComplete
        } else {
            TxState::Receiving
        };
        let request_satisfied = !complete
            && self
                .requested
                .is_some_and(|h| self.holes.missing_within(h.start, h.end) == 0);
        Ok(DataOutcome::Written {
            added,
            request_satisfied,
        })
    }

    /// Record a request sent now and return what to ask for.
    pub fn issue_request(&mut self, now: Instant) -> IncomingDue {
        self.last_request = Some(now);
        match self.state {
            TxState::AwaitingMeta => IncomingDue::ReqMeta,
            TxState::HaveMeta | TxState::Receiving => match self.holes.next_request() {
                Some(hole) => {
                    self.requested = Some(hole);
                    IncomingDue::ReqData(hole)
                }
                None => IncomingDue::Nothing,
            },
            _ => IncomingDue::Nothing,
        }
    }

    /// Sweep step for a receiving transaction.
    pub fn poll_incoming(&mut self, now: Instant, timeout: Duration, max_retries: u32) -> IncomingDue {
        if !self.enabled || self.state.is_terminal() {
            return IncomingDue::Nothing;
        }
        match self.state {
            TxState::DataComplete => IncomingDue::Finalize,
            TxState::AwaitingMeta | TxState::HaveMeta | TxState::Receiving => {
                if !self.request_due(now, timeout) {
                    return IncomingDue::Nothing;
                }
                if self.retries >= max_retries {
                    self.state = TxState::Stalled;
                    return IncomingDue::Stalled;
                }
                self.retries += 1;
                self.issue_request(now)
            }
            _ => IncomingDue::Nothing,
        }
    }

    /// Flush, close and move the temp file to its final name.
    pub fn finalize(&mut self, layout: &Layout) -> Result<PathBuf> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        let (Some(temp), Some(dest)) = (self.temp_path.clone(), self.file_path.clone()) else {
            return Err(TransferError::UnknownTransaction(self.key));
        };
        storage::promote(&temp, &dest)?;
        storage::remove_if_exists(&layout.checkpoint_path(&self.peer_name, self.key.tx_id))?;
        self.state = TxState::Finalized;
        Ok(dest)
    }

    /// Persist progress if anything changed since the last checkpoint and
    /// `interval` has passed. `force` ignores the interval.
    pub fn checkpoint(&mut self, layout: &Layout, now: Instant, interval: Duration, force: bool) -> Result<bool> {
        if self.key.direction != Direction::Incoming || self.state.is_terminal() || !self.checkpoint_dirty {
            return Ok(false);
        }
        let Some(meta) = &self.meta else {
            return Ok(false);
        };
        let due = force
            || self
                .last_checkpoint
                .map_or(true, |t| now.saturating_duration_since(t) >= interval);
        if !due {
            return Ok(false);
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Checkpoint {
            node_id: self.key.node_id,
            node_name: self.peer_name.clone(),
            tx_id: self.key.tx_id,
            agent_name: meta.agent_name.clone(),
            file_name: meta.file_name.clone(),
            file_size: meta.file_size,
            holes: self.holes.holes().to_vec(),
        }
        .save(&layout.checkpoint_path(&self.peer_name, self.key.tx_id))?;
        self.last_checkpoint = Some(now);
        self.checkpoint_dirty = false;
        Ok(true)
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// The peer asked for metadata. Returns whether to send it.
    pub fn on_req_meta(&mut self, now: Instant) -> bool {
        if self.state.is_terminal() || !self.enabled {
            return false;
        }
        if matches!(self.state, TxState::MetaQueued | TxState::Stalled) {
            self.state = TxState::MetaSent;
            self.retries = 0;
        }
        self.last_activity = now;
        self.last_request = Some(now);
        true
    }

    /// The peer asked for `[start, end)`. Returns bytes newly owed.
    pub fn on_req_data(&mut self, start: u64, end: u64, now: Instant) -> u64 {
        if self.state.is_terminal() {
            return 0;
        }
        let added = self.holes.mark_missing(start, end);
        if !self.holes.is_complete() {
            self.state = TxState::DataSending;
        }
        self.last_activity = now;
        self.retries = 0;
        added
    }

    /// Read up to `max_chunks` owed chunks of at most `chunk_size` bytes.
    /// Moves to AwaitingComplete once nothing more is owed.
    pub fn next_chunks(&mut self, max_chunks: usize, chunk_size: usize, now: Instant) -> Result<Vec<(u64, Bytes)>> {
        let mut chunks = Vec::new();
        if self.state != TxState::DataSending || !self.enabled {
            return Ok(chunks);
        }
        if self.file.is_none() {
            let Some(source) = &self.file_path else {
                return Err(TransferError::UnknownTransaction(self.key));
            };
            self.file = Some(ScopedFile::open_read(source)?);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(chunks);
        };

        while chunks.len() < max_chunks {
            let Some(hole) = self.holes.next_request() else {
                break;
            };
            let len = hole.len().min(chunk_size as u64);
            let data = file.read_at(hole.start, len as usize)?;
            if (data.len() as u64) < len {
                return Err(TransferError::Io {
                    action: "short read from",
                    path: file.path().to_path_buf(),
                    source: std::io::ErrorKind::UnexpectedEof.into(),
                });
            }
            self.holes.mark_received(hole.start, hole.start + len);
            self.bytes_done += len;
            chunks.push((hole.start, data));
        }

        self.last_activity = now;
        if self.holes.is_complete() {
            self.state = TxState::AwaitingComplete;
            self.last_request = Some(now);
            self.retries = 0;
            self.file = None;
        }
        Ok(chunks)
    }

    /// Sweep step for a sending transaction.
    pub fn poll_outgoing(&mut self, now: Instant, timeout: Duration, max_retries: u32) -> OutgoingDue {
        if !self.enabled || self.state.is_terminal() {
            return OutgoingDue::Nothing;
        }
        match self.state {
            TxState::MetaQueued => {
                self.state = TxState::MetaSent;
                self.last_request = Some(now);
                OutgoingDue::Meta
            }
            TxState::DataSending => OutgoingDue::Data,
            TxState::MetaSent | TxState::AwaitingComplete => {
                if !self.request_due(now, timeout) {
                    return OutgoingDue::Nothing;
                }
                if self.retries >= max_retries {
                    self.state = TxState::Stalled;
                    return OutgoingDue::Stalled;
                }
                self.retries += 1;
                self.last_request = Some(now);
                if self.state == TxState::MetaSent {
                    OutgoingDue::Meta
                } else {
                    OutgoingDue::ReqComplete
                }
            }
            _ => OutgoingDue::Nothing,
        }
    }

    /// The peer confirmed receipt.
    pub fn on_complete(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.file = None;
        self.state = TxState::Finalized;
        true
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Stop now. A receiving transaction deletes its temp file and
    /// checkpoint; a sending one only closes its source.
    pub fn cancel(&mut self, layout: &Layout) {
        self.file = None;
        self.state = TxState::Cancelled;
        if self.key.direction == Direction::Incoming {
            self.discard_temp(layout);
        }
    }

    /// Give up after a local I/O failure.
    pub fn fail(&mut self, layout: &Layout) {
        self.file = None;
        self.state = TxState::Failed;
        if self.key.direction == Direction::Incoming {
            self.discard_temp(layout);
        }
    }

    /// Close the file but keep everything on disk for a later resume.
    pub fn release(&mut self) {
        self.file = None;
    }

    fn discard_temp(&self, layout: &Layout) {
        let checkpoint = layout.checkpoint_path(&self.peer_name, self.key.tx_id);
        let paths = self.temp_path.iter().map(PathBuf::as_path).chain([checkpoint.as_path()]);
        for path in paths {
            if let Err(e) = storage::remove_if_exists(path) {
                tracing::warn!(tx = %self.key, error = %e, "failed to remove transfer state");
            }
        }
    }

    /// No request within `timeout` and no peer activity within `timeout`.
    /// Always true before the first request.
    pub fn request_due(&self, now: Instant, timeout: Duration) -> bool {
        let Some(last_request) = self.last_request else {
            return true;
        };
        now.saturating_duration_since(last_request) >= timeout
            && now.saturating_duration_since(self.last_activity) >= timeout
    }
}
