//! On-disk layout for transfers.
//!
//! Everything lives under one root, partitioned by peer name:
//!   <root>/<peer>/outgoing/<agent>/<file>   files waiting to be sent
//!   <root>/<peer>/temp/in_<tx_id>           partial incoming data
//!   <root>/<peer>/temp/in_<tx_id>.meta      checkpoint for the same tx
//!   <root>/<peer>/incoming/<agent>/<file>   completed incoming files
//!
//! Incoming data is never written to its final name. A file only appears
//! under `incoming/` once every byte is present.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uplink_core::wire::{NodeId, TxId};
use uplink_core::{AgentName, FileName, NodeName};

use crate::error::{io_err, Result, TransferError};
use crate::holes::Hole;

const OUTGOING: &str = "outgoing";
const INCOMING: &str = "incoming";
const TEMP: &str = "temp";
const CHECKPOINT_EXT: &str = "meta";

/// Path builder for the transfer tree.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn peer_dir(&self, peer: &NodeName) -> PathBuf {
        self.root.join(peer.as_str())
    }

    pub fn outgoing_dir(&self, peer: &NodeName) -> PathBuf {
        self.peer_dir(peer).join(OUTGOING)
    }

    pub fn temp_dir(&self, peer: &NodeName) -> PathBuf {
        self.peer_dir(peer).join(TEMP)
    }

    /// Partial data for incoming `tx_id`.
    pub fn temp_path(&self, peer: &NodeName, tx_id: TxId) -> PathBuf {
        self.temp_dir(peer).join(format!("in_{tx_id}"))
    }

    pub fn checkpoint_path(&self, peer: &NodeName, tx_id: TxId) -> PathBuf {
        self.temp_path(peer, tx_id).with_extension(CHECKPOINT_EXT)
    }

    /// Final location of a completed incoming file.
    pub fn incoming_path(&self, peer: &NodeName, agent: &AgentName, file: &FileName) -> PathBuf {
        self.peer_dir(peer)
            .join(INCOMING)
            .join(agent.as_str())
            .join(file.as_str())
    }

    /// Checkpoint files left for `peer`, in no particular order.
    pub fn checkpoints(&self, peer: &NodeName) -> Result<Vec<PathBuf>> {
        let dir = self.temp_dir(peer);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err("failed to list", &dir)(e)),
        };
        Ok(entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == CHECKPOINT_EXT))
            .collect())
    }

    /// Regular files under `<root>/<peer>/outgoing/<agent>/`, sorted by path.
    ///
    /// Entries whose agent or file name does not fit the wire limits are
    /// skipped with a warning.
    pub fn outgoing_files(&self, peer: &NodeName) -> Result<Vec<OutgoingFile>> {
        let dir = self.outgoing_dir(peer);
        let agents = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err("failed to list", &dir)(e)),
        };

        let mut found = Vec::new();
        for agent_entry in agents.flatten() {
            let agent_path = agent_entry.path();
            if !agent_path.is_dir() {
                continue;
            }
            let Some(agent) = name_of::<{ uplink_core::names::MAX_AGENT_NAME }>(&agent_path) else {
                tracing::warn!(path = %agent_path.display(), "skipping agent directory with unusable name");
                continue;
            };
            let files = fs::read_dir(&agent_path).map_err(io_err("failed to list", &agent_path))?;
            for file_entry in files.flatten() {
                let path = file_entry.path();
                if !path.is_file() {
                    continue;
                }
                let Some(file) = name_of::<{ uplink_core::names::MAX_FILE_NAME }>(&path) else {
                    tracing::warn!(path = %path.display(), "skipping outgoing file with unusable name");
                    continue;
                };
                found.push(OutgoingFile {
                    agent: agent.clone(),
                    file,
                    path,
                });
            }
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }
}

/// A file found in an outgoing directory.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub agent: AgentName,
    pub file: FileName,
    pub path: PathBuf,
}

fn name_of<const N: usize>(path: &Path) -> Option<uplink_core::names::BoundedName<N>> {
    let name = path.file_name()?.to_str()?;
    uplink_core::names::BoundedName::new(name).ok()
}

/// Reject names that would escape their directory when joined to a path.
pub fn check_component(name: &str) -> Result<()> {
    if !uplink_core::is_path_component(name) {
        return Err(TransferError::UnsafeName(name.to_string()));
    }
    Ok(())
}

// ── ScopedFile ────────────────────────────────────────────────────────────────

/// An open file owned by exactly one transaction. Closed when dropped.
#[derive(Debug)]
pub struct ScopedFile {
    file: File,
    path: PathBuf,
}

impl ScopedFile {
    /// Open an existing file for reading.
    pub fn open_read(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(io_err("failed to open", path))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Open for writing, creating the file and its parent directories if
    /// needed. Existing contents are kept so a resumed transfer continues
    /// where it stopped.
    pub fn open_write(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err("failed to create", parent))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err("failed to open", path))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        let meta = self.file.metadata().map_err(io_err("failed to stat", &self.path))?;
        Ok(meta.len())
    }

    /// Read up to `len` bytes at `offset`. Shorter only at end of file.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(io_err("failed to seek", &self.path))?;
        let mut buf = Vec::with_capacity(len);
        (&mut self.file)
            .take(len as u64)
            .read_to_end(&mut buf)
            .map_err(io_err("failed to read", &self.path))?;
        Ok(Bytes::from(buf))
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(io_err("failed to seek", &self.path))?;
        self.file
            .write_all(data)
            .map_err(io_err("failed to write", &self.path))
    }

    /// Push written data to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(io_err("failed to sync", &self.path))
    }

    /// Trim the file to exactly `size` bytes.
    pub fn set_len(&mut self, size: u64) -> Result<()> {
        self.file
            .set_len(size)
            .map_err(io_err("failed to resize", &self.path))
    }
}

/// Move a completed temp file to its final name, creating parent
/// directories. Falls back to copy + remove when rename crosses devices.
pub fn promote(temp: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(io_err("failed to create", parent))?;
    }
    if fs::rename(temp, dest).is_ok() {
        return Ok(());
    }
    fs::copy(temp, dest).map_err(io_err("failed to copy", dest))?;
    fs::remove_file(temp).map_err(io_err("failed to remove", temp))
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err("failed to remove", path)(e)),
    }
}

// ── Checkpoints ───────────────────────────────────────────────────────────────

/// Persisted progress of one incoming transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub node_id: NodeId,
    pub node_name: NodeName,
    pub tx_id: TxId,
    pub agent_name: AgentName,
    pub file_name: FileName,
    pub file_size: u64,
    pub holes: Vec<Hole>,
}

impl Checkpoint {
    /// Write atomically: temp file, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err("failed to create", parent))?;
        }
        let text = serde_json::to_vec_pretty(self).map_err(|source| TransferError::Checkpoint {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp_path = path.with_extension("meta.tmp");
        fs::write(&tmp_path, text).map_err(io_err("failed to write", &tmp_path))?;
        fs::rename(&tmp_path, path).map_err(io_err("failed to rename", path))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read(path).map_err(io_err("failed to read", path))?;
        serde_json::from_slice(&text).map_err(|source| TransferError::Checkpoint {
            path: path.to_path_buf(),
            source,
        })
    }
}
