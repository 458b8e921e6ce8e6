//! uplink-services: the transfer engine. Hole tracking, transactions, storage
//! and the manager that ties them to the wire.

pub mod error;
pub mod events;
pub mod holes;
pub mod manager;
pub mod peer;
pub mod service;
pub mod storage;
pub mod transaction;

pub use error::{Result, TransferError};
pub use events::{TransferEvent, TxSummary};
pub use holes::{Hole, HoleTracker};
pub use manager::{NodeIdentity, Outbound, TransferManager};
pub use peer::{PeerDirectory, PeerEntry};
pub use service::{AuxHandler, LoggingAux};
pub use storage::{Checkpoint, Layout};
pub use transaction::{Direction, FileMeta, Transaction, TxKey, TxState};
