//! In-memory segment holding the postings of one or more commits

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::index::results::MatchAccumulator;

use super::types::{Change, Item, SegmentId};
use super::DEADLINE_CHECK_INTERVAL;

/// Immutable sorted posting buffer built from one commit batch (or a merge of
/// contiguous memory segments).
///
/// The segment is constructed in full before it is published to the segment
/// list; after publication only the `frozen` flag changes, and only once.
#[derive(Debug)]
pub struct MemorySegment {
    id: SegmentId,
    max_commit_id: u64,
    attributes: HashMap<String, u64>,
    /// Per-document status: true = live, false = tombstone
    docs: HashMap<u32, bool>,
    /// Sorted by (hash, id), deduplicated
    items: Vec<Item>,
    /// Set once the checkpoint worker selects this segment; a one-way
    /// transition that excludes it from memory merges
    frozen: AtomicBool,
}

impl MemorySegment {
    /// Build a segment from a commit batch.
    ///
    /// Deduplicates by document id with last-write-wins: the batch is walked
    /// in reverse so only the final state of each document survives.
    pub fn build(changes: &[Change]) -> Self {
        let mut docs = HashMap::new();
        let mut attributes = HashMap::new();
        let mut items = Vec::new();
        let mut seen_docs = HashSet::new();
        let mut seen_attrs = HashSet::new();

        for change in changes.iter().rev() {
            match change {
                Change::Insert { id, hashes } => {
                    if seen_docs.insert(*id) {
                        docs.insert(*id, true);
                        items.extend(hashes.iter().map(|&hash| Item::new(hash, *id)));
                    }
                }
                Change::Delete { id } => {
                    if seen_docs.insert(*id) {
                        docs.insert(*id, false);
                    }
                }
                Change::SetAttribute { name, value } => {
                    if seen_attrs.insert(name.clone()) {
                        attributes.insert(name.clone(), *value);
                    }
                }
            }
        }

        items.sort_unstable();
        items.dedup();

        Self {
            id: SegmentId::default(),
            max_commit_id: 0,
            attributes,
            docs,
            items,
            frozen: AtomicBool::new(false),
        }
    }

    /// Assemble a segment from already-merged parts.
    pub fn from_parts(
        id: SegmentId,
        max_commit_id: u64,
        attributes: HashMap<String, u64>,
        docs: HashMap<u32, bool>,
        items: Vec<Item>,
    ) -> Self {
        debug_assert!(items.windows(2).all(|w| w[0] < w[1]));
        Self {
            id,
            max_commit_id,
            attributes,
            docs,
            items,
            frozen: AtomicBool::new(false),
        }
    }

    /// Assign identity at publication time, before the segment becomes visible.
    pub fn publish_as(mut self, id: SegmentId, max_commit_id: u64) -> Self {
        self.id = id;
        self.max_commit_id = max_commit_id;
        self
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn max_commit_id(&self) -> u64 {
        self.max_commit_id
    }

    /// Number of items (the segment's size for merge policy purposes)
    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn docs(&self) -> &HashMap<u32, bool> {
        &self.docs
    }

    pub fn attributes(&self) -> &HashMap<String, u64> {
        &self.attributes
    }

    /// Status of a document in this segment, if present
    pub fn doc_status(&self, id: u32) -> Option<bool> {
        self.docs.get(&id).copied()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Mark the segment as selected for checkpointing (one-way).
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Match the sorted, deduplicated query hashes against this segment.
    ///
    /// Each query hash resumes the scan from the previous match cursor, so a
    /// whole query costs one pass over the relevant item range.
    pub fn search(
        &self,
        hashes: &[u32],
        results: &mut MatchAccumulator,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let mut cursor = 0usize;
        for (n, &hash) in hashes.iter().enumerate() {
            if n % DEADLINE_CHECK_INTERVAL == 0 {
                if let Some(deadline) = deadline {
                    if Instant::now() > deadline {
                        return Err(Error::Timeout);
                    }
                }
            }

            cursor += self.items[cursor..].partition_point(|item| item.hash < hash);
            while cursor < self.items.len() && self.items[cursor].hash == hash {
                results.upsert_match(self.items[cursor].id, self.id.version);
                cursor += 1;
            }
            if cursor == self.items.len() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_ids(segment: &MemorySegment, hashes: &[u32]) -> Vec<(u32, u32)> {
        let mut results = MatchAccumulator::new();
        segment.search(hashes, &mut results, None).unwrap();
        results
            .into_results(|_, _| false)
            .into_iter()
            .map(|r| (r.id, r.score))
            .collect()
    }

    #[test]
    fn test_build_insert() {
        let segment = MemorySegment::build(&[Change::insert(1, vec![30, 10, 20])]);

        assert_eq!(segment.size(), 3);
        assert_eq!(segment.doc_status(1), Some(true));
        assert_eq!(
            segment.items(),
            &[Item::new(10, 1), Item::new(20, 1), Item::new(30, 1)]
        );
    }

    #[test]
    fn test_build_delete_produces_tombstone() {
        let segment = MemorySegment::build(&[Change::delete(5)]);

        assert_eq!(segment.size(), 0);
        assert_eq!(segment.doc_status(5), Some(false));
    }

    #[test]
    fn test_build_last_write_wins_within_batch() {
        let segment = MemorySegment::build(&[
            Change::insert(1, vec![1, 2, 3]),
            Change::insert(2, vec![9]),
            Change::insert(1, vec![7]),
        ]);

        // Only the final insert of doc 1 survives
        assert_eq!(
            segment.items(),
            &[Item::new(7, 1), Item::new(9, 2)]
        );
        assert_eq!(segment.doc_status(1), Some(true));
    }

    #[test]
    fn test_build_insert_then_delete_within_batch() {
        let segment = MemorySegment::build(&[
            Change::insert(1, vec![1, 2, 3]),
            Change::delete(1),
        ]);

        assert_eq!(segment.size(), 0);
        assert_eq!(segment.doc_status(1), Some(false));
    }

    #[test]
    fn test_build_dedups_repeated_hash() {
        let segment = MemorySegment::build(&[Change::insert(1, vec![5, 5, 5, 6])]);
        assert_eq!(segment.items(), &[Item::new(5, 1), Item::new(6, 1)]);
    }

    #[test]
    fn test_build_attributes_last_write_wins() {
        let segment = MemorySegment::build(&[
            Change::set_attribute("generation", 1),
            Change::set_attribute("generation", 2),
        ]);
        assert_eq!(segment.attributes().get("generation"), Some(&2));
    }

    #[test]
    fn test_search_counts_distinct_hashes() {
        let segment = MemorySegment::build(&[
            Change::insert(1, vec![1, 2, 3]),
            Change::insert(2, vec![2, 3, 4]),
        ]);

        assert_eq!(search_ids(&segment, &[1, 2, 3]), vec![(1, 3), (2, 2)]);
        assert_eq!(search_ids(&segment, &[4]), vec![(2, 1)]);
        assert_eq!(search_ids(&segment, &[99]), vec![]);
    }

    #[test]
    fn test_search_empty_query() {
        let segment = MemorySegment::build(&[Change::insert(1, vec![1])]);
        assert_eq!(search_ids(&segment, &[]), vec![]);
    }

    #[test]
    fn test_search_deadline_in_past() {
        let segment = MemorySegment::build(&[Change::insert(1, vec![1, 2, 3])]);
        let mut results = MatchAccumulator::new();
        let past = Instant::now() - std::time::Duration::from_secs(1);
        let err = segment.search(&[1, 2], &mut results, Some(past));
        assert!(matches!(err, Err(Error::Timeout)));
    }

    #[test]
    fn test_freeze_is_one_way() {
        let segment = MemorySegment::build(&[Change::insert(1, vec![1])]);
        assert!(!segment.is_frozen());
        segment.freeze();
        assert!(segment.is_frozen());
    }

    #[test]
    fn test_publish_as() {
        let segment = MemorySegment::build(&[Change::insert(1, vec![1])]);
        let segment = segment.publish_as(SegmentId::new(4, 0), 17);
        assert_eq!(segment.id(), SegmentId::new(4, 0));
        assert_eq!(segment.max_commit_id(), 17);
    }
}
