use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for opening an index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Create the index if the directory does not contain one yet
    pub create: bool,
    /// Minimum number of items before a memory segment is checkpointed to disk
    pub min_segment_size: usize,
    /// Segments at or above this many items are never selected for merging
    pub max_segment_size: usize,
    /// Target number of segments per size level (merge policy fan-out)
    pub segments_per_level: usize,
    /// Maximum number of source segments in a single merge
    pub segments_per_merge: usize,
    /// Hard cap on the segment count before a merge is forced
    pub max_segments: usize,
    /// Fixed on-disk block size in bytes
    pub block_size: u16,
    /// Rotate the oplog once the current file exceeds this many bytes
    pub max_oplog_file_size: u64,
    /// How long the maintenance workers sleep between fallback wakeups
    pub worker_idle_timeout: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            create: false,
            // 500k items (~4MB of postings)
            min_segment_size: 500_000,
            // 128M items
            max_segment_size: 128 * 1024 * 1024,
            segments_per_level: 4,
            segments_per_merge: 8,
            max_segments: 64,
            block_size: 4096,
            // 128MB per oplog file
            max_oplog_file_size: 128 * 1024 * 1024,
            worker_idle_timeout: Duration::from_secs(60),
        }
    }
}

impl IndexConfig {
    /// Config with `create = true`, for first-time index creation.
    pub fn create() -> Self {
        Self {
            create: true,
            ..Default::default()
        }
    }
}
