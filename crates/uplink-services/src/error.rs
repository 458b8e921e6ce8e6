use std::path::PathBuf;

use uplink_core::{NameError, NodeId};

use crate::transaction::TxKey;

/// Failures of local transfer operations. Inbound packets never produce
/// these: a bad packet is dropped, a failing transaction moves to `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("queue for node {node_id} is full ({limit} transactions)")]
    QueueFull { node_id: NodeId, limit: usize },

    #[error("already queued: {0}")]
    Duplicate(PathBuf),

    #[error("{path} is {size} bytes, the metadata form allows at most {max}")]
    FileTooLarge { path: PathBuf, size: u64, max: u64 },

    #[error("no transaction {0}")]
    UnknownTransaction(TxKey),

    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad checkpoint {path}: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0:?} is not a usable path component")]
    UnsafeName(String),

    #[error(transparent)]
    Name(#[from] NameError),
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

/// Attach the failing action and path to an I/O error.
pub(crate) fn io_err(action: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> TransferError {
    let path = path.into();
    move |source| TransferError::Io {
        action,
        path,
        source,
    }
}
