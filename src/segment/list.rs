//! Copy-on-write list of reference-counted segment handles
//!
//! Every mutation clones the backing array into a new list; the owner
//! publishes the new list with an atomic pointer swap. Readers that acquired
//! a snapshot keep using their version for as long as they hold it, so
//! searches are never invalidated by concurrent checkpoints or merges.

use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::index::results::MatchAccumulator;

use super::types::SegmentId;
use super::Segment;

/// Immutable ordered sequence of shared segment handles.
#[derive(Debug)]
pub struct SegmentList<T> {
    segments: Arc<Vec<Arc<T>>>,
}

impl<T> Clone for SegmentList<T> {
    fn clone(&self) -> Self {
        Self {
            segments: Arc::clone(&self.segments),
        }
    }
}

impl<T> Default for SegmentList<T> {
    fn default() -> Self {
        Self {
            segments: Arc::new(Vec::new()),
        }
    }
}

impl<T: Segment> SegmentList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<Arc<T>>) -> Self {
        Self {
            segments: Arc::new(segments),
        }
    }

    pub fn segments(&self) -> &[Arc<T>] {
        &self.segments
    }

    pub fn count(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn first(&self) -> Option<&Arc<T>> {
        self.segments.first()
    }

    pub fn last(&self) -> Option<&Arc<T>> {
        self.segments.last()
    }

    pub fn get_ids(&self) -> Vec<SegmentId> {
        self.segments.iter().map(|s| s.id()).collect()
    }

    /// Highest oplog commit id covered by any segment in the list
    pub fn get_max_commit_id(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.max_commit_id())
            .max()
            .unwrap_or(0)
    }

    /// New list with `segment` appended.
    pub fn append(&self, segment: Arc<T>) -> Self {
        let mut segments = self.segments.as_ref().clone();
        segments.push(segment);
        Self {
            segments: Arc::new(segments),
        }
    }

    /// New list with positions `start..end` replaced by `replacement`
    /// (or simply removed when `replacement` is `None`).
    pub fn replace_range(&self, start: usize, end: usize, replacement: Option<Arc<T>>) -> Self {
        let mut segments: Vec<Arc<T>> = Vec::with_capacity(self.segments.len());
        segments.extend(self.segments[..start].iter().cloned());
        segments.extend(replacement);
        segments.extend(self.segments[end..].iter().cloned());
        Self {
            segments: Arc::new(segments),
        }
    }

    /// New list without its head segment.
    pub fn remove_first(&self) -> Self {
        self.replace_range(0, 1, None)
    }

    /// Search every segment in order, oldest first, so newer overwrites win
    /// inside the accumulator.
    pub fn search(
        &self,
        hashes: &[u32],
        results: &mut MatchAccumulator,
        deadline: Option<Instant>,
    ) -> Result<()> {
        for segment in self.segments.iter() {
            segment.search(hashes, results, deadline)?;
        }
        Ok(())
    }

    /// Whether any segment newer than `version` carries `doc_id` in its doc
    /// map (as an overwrite or a tombstone).
    pub fn has_newer_version(&self, doc_id: u32, version: u64) -> bool {
        for segment in self.segments.iter().rev() {
            if segment.id().version <= version {
                break;
            }
            if segment.doc_status(doc_id).is_some() {
                return true;
            }
        }
        false
    }
}
