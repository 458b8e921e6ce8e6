//! Transfer lifecycle notifications and status snapshots.

use std::path::PathBuf;

use serde::Serialize;

use crate::transaction::{Transaction, TxKey, TxState};

/// Capacity of the event channel. Slow observers lag and lose the oldest
/// events rather than stalling the engine.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    Started {
        key: TxKey,
    },
    MetaReceived {
        key: TxKey,
        agent_name: String,
        file_name: String,
        file_size: u64,
    },
    Progress {
        key: TxKey,
        bytes_done: u64,
        file_size: u64,
    },
    Completed {
        key: TxKey,
        path: PathBuf,
    },
    Cancelled {
        key: TxKey,
        by_peer: bool,
    },
    Failed {
        key: TxKey,
        reason: String,
    },
    Stalled {
        key: TxKey,
        retries: u32,
    },
}

impl TransferEvent {
    pub fn key(&self) -> TxKey {
        match self {
            TransferEvent::Started { key }
            | TransferEvent::MetaReceived { key, .. }
            | TransferEvent::Progress { key, .. }
            | TransferEvent::Completed { key, .. }
            | TransferEvent::Cancelled { key, .. }
            | TransferEvent::Failed { key, .. }
            | TransferEvent::Stalled { key, .. } => *key,
        }
    }
}

/// Point-in-time view of one transaction.
#[derive(Debug, Clone, Serialize)]
pub struct TxSummary {
    pub key: TxKey,
    pub peer: String,
    pub state: TxState,
    pub enabled: bool,
    pub agent_name: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub bytes_done: u64,
    pub missing_bytes: u64,
    pub retries: u32,
}

impl From<&Transaction> for TxSummary {
    fn from(tx: &Transaction) -> Self {
        let meta = tx.meta();
        Self {
            key: tx.key(),
            peer: tx.peer_name().to_string(),
            state: tx.state(),
            enabled: tx.enabled(),
            agent_name: meta.map(|m| m.agent_name.to_string()),
            file_name: meta.map(|m| m.file_name.to_string()),
            file_size: meta.map(|m| m.file_size),
            bytes_done: tx.bytes_done(),
            missing_bytes: tx.holes().missing_bytes(),
            retries: tx.retries(),
        }
    }
}
