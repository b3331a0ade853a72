//! Tiered merge policy for segment management
//!
//! The policy keeps each tier geometrically shaped: segment sizes should fall
//! into levels spaced by powers of two, with at most `segments_per_level`
//! segments per level. When the list outgrows its budget, the policy picks
//! the contiguous window of segments whose combined size best fills the level
//! at the window's position, preferring balanced merges over lopsided ones.

use std::sync::Arc;

use crate::config::IndexConfig;

use super::Segment;

/// A contiguous run of segments selected for merging (`start..end`, end
/// exclusive, always at least two segments).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeCandidate {
    pub start: usize,
    pub end: usize,
}

/// Tiered merge policy configuration and selection logic.
#[derive(Clone, Debug)]
pub struct MergePolicy {
    /// Smallest level size (also the checkpoint threshold)
    pub min_segment_size: usize,
    /// Segments at or above this size are never merge sources
    pub max_segment_size: usize,
    /// Target number of segments per size level
    pub segments_per_level: usize,
    /// Maximum number of sources in one merge
    pub segments_per_merge: usize,
    /// Hard cap on the segment count
    pub max_segments: usize,
}

impl MergePolicy {
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            min_segment_size: config.min_segment_size,
            max_segment_size: config.max_segment_size,
            segments_per_level: config.segments_per_level,
            segments_per_merge: config.segments_per_merge,
            max_segments: config.max_segments,
        }
    }

    fn floor(&self) -> u64 {
        (self.min_segment_size as u64).max(1)
    }

    /// Top and bottom level sizes for a list with `total_size` items.
    fn level_bounds(&self, total_size: u64) -> (u64, u64) {
        let floor = self.floor();
        let max_level = (self.max_segment_size as u64).min((total_size / 2).max(floor));
        let min_level = (max_level / 1000).max(floor).min(max_level);
        (max_level, min_level)
    }

    /// How many segments a list of `total_size` items may hold before a
    /// merge is required.
    pub fn allowed_count(&self, total_size: u64) -> usize {
        let (max_level, min_level) = self.level_bounds(total_size);
        let levels = ((max_level / min_level).max(1).ilog2() as usize).max(1);
        (levels * self.segments_per_level).min(self.max_segments)
    }

    /// Expected size of a segment at `position` from the head (oldest and
    /// biggest first).
    fn level_size(&self, position: usize, max_level: u64, min_level: u64) -> u64 {
        let level = (position / self.segments_per_level.max(1)) as u32;
        (max_level >> level.min(63)).max(min_level)
    }

    /// Pick the cheapest contiguous window to merge, or `None` while the
    /// list is within budget.
    ///
    /// Frozen and oversized segments never participate; ties prefer earlier
    /// (older) windows.
    pub fn find_candidate<T: Segment>(&self, segments: &[Arc<T>]) -> Option<MergeCandidate> {
        if segments.len() < 2 {
            return None;
        }

        let sizes: Vec<u64> = segments.iter().map(|s| s.size() as u64).collect();
        let total: u64 = sizes.iter().sum();
        if segments.len() <= self.allowed_count(total) {
            return None;
        }

        let (max_level, min_level) = self.level_bounds(total);
        let eligible: Vec<bool> = segments
            .iter()
            .map(|s| !s.is_frozen() && s.size() < self.max_segment_size)
            .collect();

        let mut best: Option<(i64, MergeCandidate)> = None;
        for start in 0..segments.len() {
            if !eligible[start] {
                continue;
            }
            let mut sum = sizes[start];
            for end in start + 1..segments.len() {
                if !eligible[end] || end - start + 1 > self.segments_per_merge {
                    break;
                }
                sum += sizes[end];

                let score = sum as i64 - self.level_size(start, max_level, min_level) as i64;
                let candidate = MergeCandidate {
                    start,
                    end: end + 1,
                };
                // Strictly-less keeps the earliest window on ties
                if best.map_or(true, |(best_score, _)| score < best_score) {
                    best = Some((score, candidate));
                }
            }
        }

        best.map(|(_, candidate)| candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::memory::MemorySegment;
    use crate::segment::types::{Change, SegmentId};

    fn policy() -> MergePolicy {
        MergePolicy {
            min_segment_size: 10,
            max_segment_size: 10_000,
            segments_per_level: 2,
            segments_per_merge: 4,
            max_segments: 16,
        }
    }

    fn segment(version: u64, size: usize, frozen: bool) -> Arc<MemorySegment> {
        let hashes: Vec<u32> = (0..size as u32).collect();
        let segment = MemorySegment::build(&[Change::insert(1, hashes)])
            .publish_as(SegmentId::new(version, 0), version);
        if frozen {
            segment.freeze();
        }
        Arc::new(segment)
    }

    fn list(sizes: &[usize]) -> Vec<Arc<MemorySegment>> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| segment(i as u64 + 1, size, false))
            .collect()
    }

    #[test]
    fn test_within_budget_no_merge() {
        let policy = policy();
        assert_eq!(policy.find_candidate(&list(&[100, 50])), None);
    }

    #[test]
    fn test_over_budget_selects_window() {
        let policy = policy();
        // One segment over budget (allowed = 12 at this total size)
        let segments = list(&[800, 400, 200, 100, 50, 25, 12, 12, 12, 12, 12, 12, 12]);
        let candidate = policy.find_candidate(&segments).unwrap();

        assert!(candidate.end - candidate.start >= 2);
        assert!(candidate.end - candidate.start <= policy.segments_per_merge);
        // Position 3 expects a ~411-item segment but holds 100+50: the most
        // underfilled window wins
        assert_eq!(candidate, MergeCandidate { start: 3, end: 5 });
    }

    #[test]
    fn test_frozen_segments_excluded() {
        let policy = policy();
        let mut segments: Vec<Arc<MemorySegment>> = Vec::new();
        segments.push(segment(1, 500, true));
        segments.push(segment(2, 500, true));
        for v in 3..=12 {
            segments.push(segment(v, 10, false));
        }

        let candidate = policy.find_candidate(&segments).unwrap();
        assert!(candidate.start >= 2, "frozen head must not be merged");
    }

    #[test]
    fn test_oversized_segments_excluded() {
        let policy = policy();
        let mut segments = vec![segment(1, 20_000, false)];
        for v in 2..=20 {
            segments.push(segment(v, 10, false));
        }

        let candidate = policy.find_candidate(&segments).unwrap();
        assert!(candidate.start >= 1, "oversized segment must not be merged");
    }

    #[test]
    fn test_all_frozen_no_candidate() {
        let policy = policy();
        let segments: Vec<Arc<MemorySegment>> =
            (1..=12).map(|v| segment(v, 10, true)).collect();
        assert_eq!(policy.find_candidate(&segments), None);
    }

    #[test]
    fn test_allowed_count_grows_with_total() {
        let policy = policy();
        let small = policy.allowed_count(100);
        let large = policy.allowed_count(10_000_000);
        assert!(small >= policy.segments_per_level);
        assert!(large > small);
        assert!(large <= policy.max_segments);
    }

    #[test]
    fn test_single_segment_never_merges() {
        let policy = policy();
        assert_eq!(policy.find_candidate(&list(&[5])), None);
        assert_eq!(policy.find_candidate(&Vec::<Arc<MemorySegment>>::new()), None);
    }

    #[test]
    fn test_ties_prefer_older_window() {
        let policy = MergePolicy {
            min_segment_size: 1,
            max_segment_size: 10_000,
            segments_per_level: 1,
            segments_per_merge: 2,
            max_segments: 2,
        };
        // Identical sizes: the head window exactly fills its level (score 0)
        // and later windows overshoot their smaller levels
        let segments = list(&[4, 4, 4, 4]);
        let candidate = policy.find_candidate(&segments).unwrap();
        assert_eq!(candidate, MergeCandidate { start: 0, end: 2 });
    }
}
