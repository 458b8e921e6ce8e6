//! Auxiliary traffic that shares the transfer channel.
//!
//! Heartbeat, Message, Command and Raw packets carry no transaction state.
//! Once a packet has passed framing and checksum validation the manager
//! hands it to an `AuxHandler`.

use anyhow::Result;
use uplink_core::wire::{Heartbeat, Note, Raw};

/// Receiver for packets that are not part of a file transfer.
///
/// Every method has a no-op default; implement the ones you care about.
pub trait AuxHandler: Send + Sync {
    fn on_heartbeat(&self, _beat: &Heartbeat) -> Result<()> {
        Ok(())
    }

    fn on_message(&self, _note: &Note) -> Result<()> {
        Ok(())
    }

    fn on_command(&self, _note: &Note) -> Result<()> {
        Ok(())
    }

    fn on_raw(&self, _raw: &Raw) -> Result<()> {
        Ok(())
    }
}

/// Default handler: logs everything it sees.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAux;

impl AuxHandler for LoggingAux {
    fn on_heartbeat(&self, beat: &Heartbeat) -> Result<()> {
        tracing::debug!(
            node_id = beat.node_id,
            peer = %beat.node_name,
            beat_period = beat.beat_period,
            throughput = beat.throughput,
            unix_time = beat.unix_time,
            "heartbeat"
        );
        Ok(())
    }

    fn on_message(&self, note: &Note) -> Result<()> {
        tracing::info!(
            node_id = note.node_id,
            text = %String::from_utf8_lossy(&note.bytes),
            "message"
        );
        Ok(())
    }

    fn on_command(&self, note: &Note) -> Result<()> {
        tracing::info!(
            node_id = note.node_id,
            bytes = hex::encode(&note.bytes),
            "command received"
        );
        Ok(())
    }

    fn on_raw(&self, raw: &Raw) -> Result<()> {
        tracing::debug!(
            node_id = raw.node_id,
            tx_id = raw.tx_id,
            len = raw.payload.len(),
            head = hex::encode(&raw.payload[..raw.payload.len().min(16)]),
            "raw packet"
        );
        Ok(())
    }
}
