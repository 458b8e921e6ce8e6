//! Hole tracking: the byte ranges of a file not yet accounted for.
//!
//! The receiving side starts with one hole covering the whole file and
//! subtracts every chunk that arrives. The sending side runs the same
//! structure the other way round, adding every range the peer asks for and
//! subtracting what it has put on the link.

use serde::{Deserialize, Serialize};

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hole {
    pub start: u64,
    pub end: u64,
}

impl Hole {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Sorted, non-overlapping, coalesced list of holes within `[0, file_size)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoleTracker {
    file_size: u64,
    holes: Vec<Hole>,
}

impl HoleTracker {
    /// A tracker with nothing missing.
    pub fn empty(file_size: u64) -> Self {
        Self {
            file_size,
            holes: Vec::new(),
        }
    }

    /// A tracker missing the whole file.
    pub fn initialize(file_size: u64) -> Self {
        let mut tracker = Self::empty(file_size);
        if file_size > 0 {
            tracker.holes.push(Hole::new(0, file_size));
        }
        tracker
    }

    /// Rebuild from a persisted hole list. Input order and overlap do not
    /// matter; ranges past `file_size` are clipped.
    pub fn from_holes(file_size: u64, holes: impl IntoIterator<Item = Hole>) -> Self {
        let mut tracker = Self::empty(file_size);
        for hole in holes {
            tracker.mark_missing(hole.start, hole.end);
        }
        tracker
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn holes(&self) -> &[Hole] {
        &self.holes
    }

    pub fn is_complete(&self) -> bool {
        self.holes.is_empty()
    }

    /// Total bytes still missing.
    pub fn missing_bytes(&self) -> u64 {
        self.holes.iter().map(Hole::len).sum()
    }

    /// Bytes of `[start, end)` still missing.
    pub fn missing_within(&self, start: u64, end: u64) -> u64 {
        self.holes
            .iter()
            .map(|h| h.end.min(end).saturating_sub(h.start.max(start)))
            .sum()
    }

    /// The hole with the smallest start.
    pub fn next_request(&self) -> Option<Hole> {
        self.holes.first().copied()
    }

    /// Subtract `[start, end)` from every hole. Returns the number of bytes
    /// that were missing before this call and no longer are.
    pub fn mark_received(&mut self, start: u64, end: u64) -> u64 {
        if end <= start {
            return 0;
        }
        let before = self.missing_bytes();
        let mut kept = Vec::with_capacity(self.holes.len() + 1);
        for hole in self.holes.drain(..) {
            if hole.end <= start || hole.start >= end {
                kept.push(hole);
                continue;
            }
            if hole.start < start {
                kept.push(Hole::new(hole.start, start));
            }
            if hole.end > end {
                kept.push(Hole::new(end, hole.end));
            }
        }
        self.holes = kept;
        before - self.missing_bytes()
    }

    /// Add `[start, end)` to the hole set, clipped to the file size.
    /// Returns the number of bytes newly marked missing.
    pub fn mark_missing(&mut self, start: u64, end: u64) -> u64 {
        let end = end.min(self.file_size);
        if end <= start {
            return 0;
        }
        let before = self.missing_bytes();

        // first hole that could touch the new range
        let first = self.holes.partition_point(|h| h.end < start);
        let mut merged = Hole::new(start, end);
        let mut last = first;
        while last < self.holes.len() && self.holes[last].start <= merged.end {
            merged.start = merged.start.min(self.holes[last].start);
            merged.end = merged.end.max(self.holes[last].end);
            last += 1;
        }
        self.holes.splice(first..last, std::iter::once(merged));

        self.missing_bytes() - before
    }
}
