//! Length-checked names carried on the wire.
//!
//! Every name travels as a one-byte length followed by UTF-8 bytes. The
//! limits match the fixed buffers of the flight software this protocol talks
//! to. Oversized names are rejected, never truncated: a truncated file name
//! would silently land somewhere the operator did not ask for.

use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

/// Longest node name accepted.
pub const MAX_NODE_NAME: usize = 40;

/// Longest agent name accepted.
pub const MAX_AGENT_NAME: usize = 40;

/// Longest file name accepted.
pub const MAX_FILE_NAME: usize = 128;

/// A string of at most `N` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BoundedName<const N: usize>(String);

pub type NodeName = BoundedName<MAX_NODE_NAME>;
pub type AgentName = BoundedName<MAX_AGENT_NAME>;
pub type FileName = BoundedName<MAX_FILE_NAME>;

/// True if `name` can be joined onto a directory as exactly one entry of
/// it: not empty, not `.` or `..`, no separator, no root or drive prefix.
pub fn is_path_component(name: &str) -> bool {
    if name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut parts = Path::new(name).components();
    matches!(
        (parts.next(), parts.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
}

impl<const N: usize> BoundedName<N> {
    pub const MAX: usize = N;

    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        if name.len() > N {
            return Err(NameError::TooLong {
                len: name.len(),
                max: N,
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> Default for BoundedName<N> {
    fn default() -> Self {
        Self(String::new())
    }
}

impl<const N: usize> TryFrom<String> for BoundedName<N> {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl<const N: usize> TryFrom<&str> for BoundedName<N> {
    type Error = NameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl<const N: usize> From<BoundedName<N>> for String {
    fn from(name: BoundedName<N>) -> String {
        name.0
    }
}

impl<const N: usize> AsRef<str> for BoundedName<N> {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<const N: usize> fmt::Display for BoundedName<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
