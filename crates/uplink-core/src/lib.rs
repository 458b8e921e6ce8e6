//! uplink-core: wire format, bounded names, and configuration.
//! All other Uplink crates depend on this one.

pub mod config;
pub mod names;
pub mod wire;

pub use names::{is_path_component, AgentName, FileName, NameError, NodeName};
pub use wire::{decode, encode, DecodeError, EncodeError, NodeId, Packet, PacketKind, TxId};
