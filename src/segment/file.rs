//! Immutable on-disk segment backed by a read-only memory map

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::index::results::MatchAccumulator;

use super::codec::{self, SegmentMeta};
use super::store;
use super::types::{Item, SegmentId};
use super::DEADLINE_CHECK_INTERVAL;

/// Mmapped, block-indexed posting store. Immutable after publication.
///
/// The handle owns the map; dropping the last reference unmaps the file and,
/// if the segment has been superseded by a merge, unlinks it.
pub struct FileSegment {
    info: SegmentId,
    path: PathBuf,
    meta: SegmentMeta,
    block_size: usize,
    /// Byte offset of the block region inside the map
    data_offset: usize,
    mmap: Mmap,
    /// Set by the merge controller once a superseding segment list is durable
    delete_on_drop: AtomicBool,
}

impl FileSegment {
    /// Open and validate the segment file for `id` inside `dir`.
    pub fn open(dir: &Path, id: SegmentId) -> Result<Self> {
        let path = store::segment_path(dir, id);
        let file = File::open(&path).map_err(Error::from_io)?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(Error::from_io)?;

        let block_size =
            codec::decode_header(&mmap).map_err(|e| corruption(&path, e))? as usize;
        let mut pos = codec::HEADER_SIZE;
        let meta = SegmentMeta::decode(&mmap, &mut pos).map_err(|e| corruption(&path, e))?;

        let data_offset = pos;
        let expected_len = data_offset + meta.block_index.len() * block_size;
        if mmap.len() < expected_len {
            return Err(Error::corruption(
                &path,
                format!(
                    "block region truncated: {} bytes, expected {}",
                    mmap.len(),
                    expected_len
                ),
            ));
        }

        Ok(Self {
            info: id,
            path,
            meta,
            block_size,
            data_offset,
            mmap,
            delete_on_drop: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> SegmentId {
        self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_commit_id(&self) -> u64 {
        self.meta.max_commit_id
    }

    /// Number of items (the segment's size for merge policy purposes)
    pub fn size(&self) -> usize {
        self.meta.num_items as usize
    }

    pub fn num_blocks(&self) -> usize {
        self.meta.block_index.len()
    }

    pub fn block_index(&self) -> &[u32] {
        &self.meta.block_index
    }

    pub fn min_doc_id(&self) -> u32 {
        self.meta.min_doc_id
    }

    pub fn max_doc_id(&self) -> u32 {
        self.meta.max_doc_id
    }

    pub fn docs(&self) -> &HashMap<u32, bool> {
        &self.meta.docs
    }

    pub fn attributes(&self) -> &HashMap<String, u64> {
        &self.meta.attributes
    }

    /// Status of a document in this segment, if present
    pub fn doc_status(&self, id: u32) -> Option<bool> {
        self.meta.docs.get(&id).copied()
    }

    /// Unlink the file once the last handle drops.
    pub fn delete_on_drop(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }

    fn decode_block(&self, idx: usize, items: &mut Vec<Item>) -> Result<()> {
        let start = self.data_offset + idx * self.block_size;
        let block = &self.mmap[start..start + self.block_size];
        items.clear();
        codec::decode_block(block, items).map_err(|e| corruption(&self.path, e))
    }

    /// Match the sorted, deduplicated query hashes against this segment.
    ///
    /// Blocks are decoded on demand; the most recently decoded block is kept,
    /// so consecutive query hashes landing in the same block decode it once.
    pub fn search(
        &self,
        hashes: &[u32],
        results: &mut MatchAccumulator,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let index = &self.meta.block_index;
        if index.is_empty() {
            return Ok(());
        }

        let mut cached: Option<(usize, Vec<Item>)> = None;

        for (n, &hash) in hashes.iter().enumerate() {
            if n % DEADLINE_CHECK_INTERVAL == 0 {
                if let Some(deadline) = deadline {
                    if Instant::now() > deadline {
                        return Err(Error::Timeout);
                    }
                }
            }

            // A posting run may begin in the last block whose first key is
            // below the target and continue through blocks whose first key
            // equals it.
            let first_at_or_above = index.partition_point(|&first_key| first_key < hash);
            let mut block_idx = if first_at_or_above > 0 {
                first_at_or_above - 1
            } else if index[0] == hash {
                0
            } else {
                continue;
            };

            while block_idx < index.len() && index[block_idx] <= hash {
                let hit = matches!(&cached, Some((idx, _)) if *idx == block_idx);
                if !hit {
                    let mut items = cached.take().map(|(_, v)| v).unwrap_or_default();
                    self.decode_block(block_idx, &mut items)?;
                    cached = Some((block_idx, items));
                }
                let (_, items) = cached.as_ref().unwrap();

                let mut i = items.partition_point(|item| item.hash < hash);
                while i < items.len() && items[i].hash == hash {
                    results.upsert_match(items[i].id, self.info.version);
                    i += 1;
                }

                block_idx += 1;
            }
        }
        Ok(())
    }

    /// Iterate every item in order, decoding one block at a time.
    pub fn iter_items(&self) -> FileSegmentItems<'_> {
        FileSegmentItems {
            segment: self,
            block_idx: 0,
            items: Vec::new(),
            pos: 0,
        }
    }
}

impl Drop for FileSegment {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn corruption(path: &Path, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            Error::corruption(path, err.to_string())
        }
        _ => Error::from_io(err),
    }
}

/// Streaming iterator over a file segment's items, used by merges.
pub struct FileSegmentItems<'a> {
    segment: &'a FileSegment,
    block_idx: usize,
    items: Vec<Item>,
    pos: usize,
}

impl Iterator for FileSegmentItems<'_> {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Result<Item>> {
        loop {
            if self.pos < self.items.len() {
                let item = self.items[self.pos];
                self.pos += 1;
                return Some(Ok(item));
            }
            if self.block_idx >= self.segment.num_blocks() {
                return None;
            }
            if let Err(e) = self.segment.decode_block(self.block_idx, &mut self.items) {
                self.block_idx = self.segment.num_blocks();
                return Some(Err(e));
            }
            self.block_idx += 1;
            self.pos = 0;
        }
    }
}
