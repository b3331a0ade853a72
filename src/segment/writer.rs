//! Segment writer for creating new immutable segment files
//!
//! Blocks are streamed to a scratch file first, because the metadata section
//! (which precedes the block region) includes the block index and is not
//! known until every block has been written. `finish()` assembles the final
//! file and publishes it with an atomic rename.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::codec::{self, BlockBuilder, SegmentMeta};
use super::store;
use super::types::{Item, SegmentId};

/// Writer producing one immutable segment file from a sorted item stream.
pub struct FileSegmentWriter {
    id: SegmentId,
    final_path: PathBuf,
    tmp_path: PathBuf,
    blocks_path: PathBuf,
    blocks_file: Option<BufWriter<File>>,
    builder: BlockBuilder,
    block_index: Vec<u32>,
    block_size: u16,
    num_items: u64,
    last_item: Option<Item>,
    finished: bool,
}

impl FileSegmentWriter {
    /// Start writing the segment `id` into `dir`.
    pub fn create(dir: &Path, id: SegmentId, block_size: u16) -> Result<Self> {
        // A block must fit its header, CRC and at least one worst-case item
        if block_size < 20 {
            return Err(Error::InvalidArgument(format!(
                "block size {} too small",
                block_size
            )));
        }
        let final_path = store::segment_path(dir, id);
        let tmp_path = final_path.with_extension("dat.tmp");
        let blocks_path = final_path.with_extension("blocks.tmp");
        let blocks_file = File::create(&blocks_path).map_err(Error::from_io)?;

        Ok(Self {
            id,
            final_path,
            tmp_path,
            blocks_path,
            blocks_file: Some(BufWriter::new(blocks_file)),
            builder: BlockBuilder::new(block_size),
            block_index: Vec::new(),
            block_size,
            num_items: 0,
            last_item: None,
            finished: false,
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn num_items(&self) -> u64 {
        self.num_items
    }

    /// Append the next item. Items must arrive in strictly ascending
    /// `(hash, id)` order; duplicates are skipped.
    pub fn push(&mut self, item: Item) -> Result<()> {
        if let Some(last) = self.last_item {
            if item <= last {
                if item == last {
                    return Ok(());
                }
                return Err(Error::InvalidArgument(format!(
                    "items out of order: {:?} after {:?}",
                    item, last
                )));
            }
        }

        if !self.builder.try_push(item) {
            self.flush_block()?;
            // A fresh block always has room for one item
            let pushed = self.builder.try_push(item);
            debug_assert!(pushed);
        }
        self.last_item = Some(item);
        self.num_items += 1;
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.builder.is_empty() {
            return Ok(());
        }
        self.block_index.push(self.builder.first_hash());
        let file = self.blocks_file.as_mut().expect("writer already finished");
        self.builder.finish(file).map_err(Error::from_io)?;
        Ok(())
    }

    /// Write metadata, assemble the final file and publish it atomically.
    pub fn finish(
        mut self,
        docs: HashMap<u32, bool>,
        attributes: HashMap<String, u64>,
        max_commit_id: u64,
    ) -> Result<PathBuf> {
        self.flush_block()?;

        let mut blocks_file = self
            .blocks_file
            .take()
            .expect("writer already finished")
            .into_inner()
            .map_err(|e| Error::from_io(e.into_error()))?;
        blocks_file.flush().map_err(Error::from_io)?;

        let mut min_doc_id = u32::MAX;
        let mut max_doc_id = 0u32;
        let mut any_live = false;
        for (&id, &live) in &docs {
            if live {
                any_live = true;
                min_doc_id = min_doc_id.min(id);
                max_doc_id = max_doc_id.max(id);
            }
        }
        if !any_live {
            min_doc_id = 0;
        }
        let meta = SegmentMeta {
            num_items: self.num_items,
            min_doc_id,
            max_doc_id,
            max_commit_id,
            attributes,
            docs,
            block_index: std::mem::take(&mut self.block_index),
        };

        let mut prefix = Vec::new();
        codec::encode_header(self.block_size, &mut prefix);
        meta.encode(&mut prefix);

        let result = (|| -> Result<()> {
            let mut out = File::create(&self.tmp_path).map_err(Error::from_io)?;
            out.write_all(&prefix).map_err(Error::from_io)?;
            blocks_file
                .seek(SeekFrom::Start(0))
                .map_err(Error::from_io)?;
            io::copy(&mut blocks_file, &mut out).map_err(Error::from_io)?;
            out.sync_all().map_err(Error::from_io)?;
            fs::rename(&self.tmp_path, &self.final_path).map_err(Error::from_io)?;
            store::sync_dir(self.final_path.parent().unwrap())?;
            Ok(())
        })();

        let _ = fs::remove_file(&self.blocks_path);
        match result {
            Ok(()) => {
                self.finished = true;
                Ok(self.final_path.clone())
            }
            Err(e) => {
                let _ = fs::remove_file(&self.tmp_path);
                Err(e)
            }
        }
    }
}

impl Drop for FileSegmentWriter {
    fn drop(&mut self) {
        // Abandoned build: leave no scratch files behind
        if !self.finished {
            let _ = fs::remove_file(&self.blocks_path);
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::file::FileSegment;

    #[test]
    fn test_write_and_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let id = SegmentId::new(1, 0);

        let mut writer = FileSegmentWriter::create(tmp.path(), id, 512).unwrap();
        for i in 0..100u32 {
            writer.push(Item::new(i * 3, i)).unwrap();
        }

        let mut docs = HashMap::new();
        for i in 0..100u32 {
            docs.insert(i, true);
        }
        let path = writer.finish(docs, HashMap::new(), 7).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("dat.tmp").exists());
        assert!(!path.with_extension("blocks.tmp").exists());

        let segment = FileSegment::open(tmp.path(), id).unwrap();
        assert_eq!(segment.size(), 100);
        assert_eq!(segment.max_commit_id(), 7);
        assert_eq!(segment.min_doc_id(), 0);
        assert_eq!(segment.max_doc_id(), 99);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer =
            FileSegmentWriter::create(tmp.path(), SegmentId::new(1, 0), 512).unwrap();
        writer.push(Item::new(10, 1)).unwrap();
        let err = writer.push(Item::new(9, 1));
        assert!(matches!(err, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_duplicates_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer =
            FileSegmentWriter::create(tmp.path(), SegmentId::new(1, 0), 512).unwrap();
        writer.push(Item::new(10, 1)).unwrap();
        writer.push(Item::new(10, 1)).unwrap();
        writer.push(Item::new(10, 2)).unwrap();
        assert_eq!(writer.num_items(), 2);
    }

    #[test]
    fn test_drop_removes_scratch_files() {
        let tmp = tempfile::tempdir().unwrap();
        let id = SegmentId::new(3, 0);
        {
            let mut writer = FileSegmentWriter::create(tmp.path(), id, 512).unwrap();
            writer.push(Item::new(1, 1)).unwrap();
            // dropped without finish()
        }
        let entries: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_hash_run_spans_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        let id = SegmentId::new(1, 0);

        // One hash with far more postings than a single 64-byte block can hold
        let mut writer = FileSegmentWriter::create(tmp.path(), id, 64).unwrap();
        let mut docs = HashMap::new();
        for i in 0..500u32 {
            writer.push(Item::new(42, i)).unwrap();
            docs.insert(i, true);
        }
        writer.finish(docs, HashMap::new(), 1).unwrap();

        let segment = FileSegment::open(tmp.path(), id).unwrap();
        assert_eq!(segment.size(), 500);
        assert!(segment.num_blocks() > 1);
        // Every continuation block starts with the same hash
        assert!(segment.block_index().iter().all(|&h| h == 42));
    }
}
