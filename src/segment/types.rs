//! Core types for the segment-based index

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single posting: one hash token of one document's fingerprint.
///
/// Items are ordered lexicographically by `(hash, id)`, which is the order
/// they are stored in both memory and file segments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Item {
    /// 32-bit hash token
    pub hash: u32,
    /// Document identifier
    pub id: u32,
}

impl Item {
    pub fn new(hash: u32, id: u32) -> Self {
        Self { hash, id }
    }
}

/// Segment identifier: the rank of the first commit the segment covers plus
/// the number of follow-up ranks folded in by merging.
///
/// A segment built from a single commit has `included_merges = 0`. Merging a
/// contiguous run `A..B` yields a segment spanning the whole interval
/// `[A.version, B.version + B.included_merges]`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SegmentId {
    pub version: u64,
    pub included_merges: u64,
}

impl SegmentId {
    pub fn new(version: u64, included_merges: u64) -> Self {
        Self {
            version,
            included_merges,
        }
    }

    /// Id of the very first segment of an index.
    pub fn first() -> Self {
        Self {
            version: 1,
            included_merges: 0,
        }
    }

    /// Id of the segment that immediately follows this one.
    pub fn next(&self) -> Self {
        Self {
            version: self.version + self.included_merges + 1,
            included_merges: 0,
        }
    }

    /// Id of the segment produced by merging the contiguous run `first..=last`.
    pub fn merge(first: SegmentId, last: SegmentId) -> Self {
        Self {
            version: first.version,
            included_merges: (last.version + last.included_merges) - first.version,
        }
    }

    /// Whether `child`'s version interval lies entirely within this one.
    pub fn contains(&self, child: SegmentId) -> bool {
        child.version >= self.version
            && child.version + child.included_merges <= self.version + self.included_merges
    }

    /// File stem used for this segment's data file.
    pub fn file_stem(&self) -> String {
        format!("segment_{:010}_{:010}", self.version, self.included_merges)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment_{}_{}", self.version, self.included_merges)
    }
}

/// A single change within a commit batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    /// Replace document `id`'s fingerprint with `hashes`
    Insert { id: u32, hashes: Vec<u32> },
    /// Remove document `id`
    Delete { id: u32 },
    /// Set a named index attribute
    SetAttribute { name: String, value: u64 },
}

impl Change {
    pub fn insert(id: u32, hashes: Vec<u32>) -> Self {
        Change::Insert { id, hashes }
    }

    pub fn delete(id: u32) -> Self {
        Change::Delete { id }
    }

    pub fn set_attribute(name: impl Into<String>, value: u64) -> Self {
        Change::SetAttribute {
            name: name.into(),
            value,
        }
    }

    /// Document id touched by this change, if any.
    pub fn doc_id(&self) -> Option<u32> {
        match self {
            Change::Insert { id, .. } | Change::Delete { id } => Some(*id),
            Change::SetAttribute { .. } => None,
        }
    }
}
