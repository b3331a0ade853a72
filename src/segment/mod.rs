//! Two-tier log-structured segment engine
//!
//! The index is a sequence of immutable segments in two tiers:
//!
//! - `MemorySegment`: sorted posting buffer built from one commit batch
//! - `FileSegment`: mmap-backed, block-compressed posting store on disk
//! - `SegmentList`: copy-on-write list of shared segment handles
//! - `Merger`: N-way streaming merge with tombstone and shadow suppression
//! - `MergePolicy`: tiered cost model keeping both tiers geometrically shaped
//! - `FileSegmentWriter` / `codec` / `store`: the on-disk format

pub mod codec;
pub mod file;
pub mod list;
pub mod memory;
pub mod merger;
pub mod policy;
pub mod store;
pub mod types;
pub mod writer;

use std::collections::HashMap;
use std::time::Instant;

use crate::error::Result;
use crate::index::results::MatchAccumulator;

pub use file::FileSegment;
pub use list::SegmentList;
pub use memory::MemorySegment;
pub use merger::Merger;
pub use policy::{MergeCandidate, MergePolicy};
pub use types::{Change, Item, SegmentId};
pub use writer::FileSegmentWriter;

/// How many query hashes a segment scan processes between deadline checks
pub(crate) const DEADLINE_CHECK_INTERVAL: usize = 64;

/// Common interface of both segment tiers.
pub trait Segment: Send + Sync {
    fn id(&self) -> SegmentId;

    /// Number of items; the segment's size for the merge policy
    fn size(&self) -> usize;

    /// Highest oplog commit id covered by this segment
    fn max_commit_id(&self) -> u64;

    /// Per-document status: `Some(true)` live, `Some(false)` tombstone
    fn doc_status(&self, id: u32) -> Option<bool>;

    fn docs(&self) -> &HashMap<u32, bool>;

    fn attributes(&self) -> &HashMap<String, u64>;

    fn search(
        &self,
        hashes: &[u32],
        results: &mut MatchAccumulator,
        deadline: Option<Instant>,
    ) -> Result<()>;

    /// Lazy sorted item stream, used by merges
    fn iter_items(&self) -> Box<dyn Iterator<Item = Result<Item>> + '_>;

    /// Whether the segment has been selected for checkpointing (memory tier
    /// only; file segments are never frozen)
    fn is_frozen(&self) -> bool {
        false
    }
}

impl Segment for MemorySegment {
    fn id(&self) -> SegmentId {
        MemorySegment::id(self)
    }

    fn size(&self) -> usize {
        MemorySegment::size(self)
    }

    fn max_commit_id(&self) -> u64 {
        MemorySegment::max_commit_id(self)
    }

    fn doc_status(&self, id: u32) -> Option<bool> {
        MemorySegment::doc_status(self, id)
    }

    fn docs(&self) -> &HashMap<u32, bool> {
        MemorySegment::docs(self)
    }

    fn attributes(&self) -> &HashMap<String, u64> {
        MemorySegment::attributes(self)
    }

    fn search(
        &self,
        hashes: &[u32],
        results: &mut MatchAccumulator,
        deadline: Option<Instant>,
    ) -> Result<()> {
        MemorySegment::search(self, hashes, results, deadline)
    }

    fn iter_items(&self) -> Box<dyn Iterator<Item = Result<Item>> + '_> {
        Box::new(self.items().iter().map(|&item| Ok(item)))
    }

    fn is_frozen(&self) -> bool {
        MemorySegment::is_frozen(self)
    }
}

impl Segment for FileSegment {
    fn id(&self) -> SegmentId {
        FileSegment::id(self)
    }

    fn size(&self) -> usize {
        FileSegment::size(self)
    }

    fn max_commit_id(&self) -> u64 {
        FileSegment::max_commit_id(self)
    }

    fn doc_status(&self, id: u32) -> Option<bool> {
        FileSegment::doc_status(self, id)
    }

    fn docs(&self) -> &HashMap<u32, bool> {
        FileSegment::docs(self)
    }

    fn attributes(&self) -> &HashMap<String, u64> {
        FileSegment::attributes(self)
    }

    fn search(
        &self,
        hashes: &[u32],
        results: &mut MatchAccumulator,
        deadline: Option<Instant>,
    ) -> Result<()> {
        FileSegment::search(self, hashes, results, deadline)
    }

    fn iter_items(&self) -> Box<dyn Iterator<Item = Result<Item>> + '_> {
        Box::new(FileSegment::iter_items(self))
    }
}
