//! Index core: orchestrates updates, searches, checkpoints and merges
//!
//! Ownership: two copy-on-write segment lists (memory tier and file tier)
//! published through atomically swapped pointers, the oplog, and three
//! maintenance workers (checkpoint, memory merge, file merge) woken by
//! auto-reset events with a scheduler-driven timer fallback.
//!
//! Lock order, never reversed:
//!
//! 1. `update_lock` — serialises commit ids and segment ids
//! 2. `memory_segments_lock` — serialises mutators of the memory list
//! 3. `file_segments_lock` — serialises mutators of the file list
//! 4. `segments_lock` (RW) — guards the pair of list pointers; searches take
//!    it shared just long enough to snapshot both lists

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::oplog::Oplog;
use crate::scheduler::{JobId, Schedule, Scheduler};
use crate::segment::{
    store, Change, FileSegment, FileSegmentWriter, MemorySegment, MergePolicy, Merger, Segment,
    SegmentId, SegmentList,
};

use super::results::{MatchAccumulator, SearchResult};

/// Attribute reporting the smallest live document id
pub const MIN_DOCUMENT_ID_ATTR: &str = "min_document_id";
/// Attribute reporting the largest live document id
pub const MAX_DOCUMENT_ID_ATTR: &str = "max_document_id";

/// Location and liveness of one document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DocInfo {
    pub id: u32,
    /// Version of the newest segment carrying the document
    pub version: u64,
    pub deleted: bool,
}

/// Auto-reset wakeup signal for a maintenance worker.
#[derive(Default)]
struct ResetEvent {
    signaled: Mutex<bool>,
    wakeup: Condvar,
}

impl ResetEvent {
    fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.wakeup.notify_one();
    }

    /// Wait until signalled or the timeout elapses; consumes the signal.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            self.wakeup.wait_for(&mut signaled, timeout);
        }
        std::mem::take(&mut signaled)
    }
}

struct IndexInner {
    config: IndexConfig,
    data_dir: PathBuf,
    policy: MergePolicy,

    update_lock: Mutex<()>,
    memory_segments_lock: Mutex<()>,
    file_segments_lock: Mutex<()>,
    segments_lock: RwLock<()>,

    memory_segments: ArcSwap<SegmentList<MemorySegment>>,
    file_segments: ArcSwap<SegmentList<FileSegment>>,

    oplog: Mutex<Oplog>,

    stopping: AtomicBool,
    checkpoint_event: ResetEvent,
    memory_merge_event: ResetEvent,
    file_merge_event: ResetEvent,
}

/// Embedded audio-fingerprint index.
///
/// Maps 32-bit hash tokens to 32-bit document ids and answers "how many of
/// these hashes co-occur per document" queries. All state lives under one
/// root directory; a successful [`Index::update`] is durable before it
/// returns.
pub struct Index {
    inner: Arc<IndexInner>,
    scheduler: Scheduler,
    timer_jobs: Vec<JobId>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Index {
    /// Open the index stored in `dir`.
    ///
    /// Fails with [`Error::IndexNotFound`] when the directory holds no index
    /// and `config.create` is false, and with [`Error::AlreadyOpen`] when it
    /// does and `config.create` is true. Recovery replays every oplog commit
    /// newer than the checkpoint watermark.
    pub fn open(dir: impl AsRef<Path>, config: IndexConfig) -> Result<Self> {
        let root = dir.as_ref();
        let data_dir = root.join("data");
        let oplog_dir = root.join("oplog");

        let exists = store::index_exists(&data_dir);
        if !exists && !config.create {
            return Err(Error::IndexNotFound(root.to_path_buf()));
        }
        if exists && config.create {
            return Err(Error::AlreadyOpen(root.to_path_buf()));
        }
        if !exists {
            fs::create_dir_all(&data_dir).map_err(Error::from_io)?;
            store::write_index_file(&data_dir, &[])?;
        }

        let mut file_segments = Vec::new();
        for id in store::read_index_file(&data_dir)? {
            file_segments.push(Arc::new(FileSegment::open(&data_dir, id)?));
        }
        let file_list = SegmentList::from_segments(file_segments);

        let mut oplog = Oplog::open(&oplog_dir, config.max_oplog_file_size)?;
        let max_published = file_list.get_max_commit_id();
        oplog.advance_to(max_published);

        let mut memory_segments = Vec::new();
        let mut last_id = file_list.last().map(|s| s.id());
        oplog.replay(max_published, |commit_id, changes| {
            let id = last_id.map(|id| id.next()).unwrap_or_else(SegmentId::first);
            let segment = MemorySegment::build(&changes).publish_as(id, commit_id);
            last_id = Some(id);
            memory_segments.push(Arc::new(segment));
            Ok(())
        })?;

        info!(
            dir = %root.display(),
            file_segments = file_list.count(),
            replayed_commits = memory_segments.len(),
            "index opened"
        );

        let inner = Arc::new(IndexInner {
            policy: MergePolicy::from_config(&config),
            data_dir,
            update_lock: Mutex::new(()),
            memory_segments_lock: Mutex::new(()),
            file_segments_lock: Mutex::new(()),
            segments_lock: RwLock::new(()),
            memory_segments: ArcSwap::from_pointee(SegmentList::from_segments(memory_segments)),
            file_segments: ArcSwap::from_pointee(file_list),
            oplog: Mutex::new(oplog),
            stopping: AtomicBool::new(false),
            checkpoint_event: ResetEvent::default(),
            memory_merge_event: ResetEvent::default(),
            file_merge_event: ResetEvent::default(),
            config,
        });

        let workers = vec![
            spawn_worker("fpindex-checkpoint", &inner, |i| &i.checkpoint_event, |i| {
                i.do_checkpoint()
            }),
            spawn_worker(
                "fpindex-memory-merge",
                &inner,
                |i| &i.memory_merge_event,
                |i| i.maybe_merge_memory_segments(),
            ),
            spawn_worker(
                "fpindex-file-merge",
                &inner,
                |i| &i.file_merge_event,
                |i| i.maybe_merge_file_segments(),
            ),
        ];

        // Timer fallback: re-signal each worker on its own strand in case an
        // event was produced while the worker was busy
        let scheduler = Scheduler::new(1);
        let period = inner.config.worker_idle_timeout;
        let events: [(&str, fn(&IndexInner) -> &ResetEvent); 3] = [
            ("checkpoint", |i| &i.checkpoint_event),
            ("memory-merge", |i| &i.memory_merge_event),
            ("file-merge", |i| &i.file_merge_event),
        ];
        let timer_jobs = events
            .iter()
            .map(|&(strand, event)| {
                let inner = Arc::clone(&inner);
                scheduler.schedule(
                    move || event(&inner).set(),
                    Schedule {
                        after: period,
                        repeat: Some(period),
                        strand: Some(strand.to_string()),
                    },
                )
            })
            .collect();

        // Work may be pending from before the last shutdown
        inner.memory_merge_event.set();
        inner.checkpoint_event.set();
        inner.file_merge_event.set();

        Ok(Self {
            inner,
            scheduler,
            timer_jobs,
            workers: Mutex::new(workers),
        })
    }

    /// Apply one batch of changes as a single commit.
    ///
    /// Returns once the commit is durable in the oplog and visible to any
    /// subsequently started search.
    pub fn update(&self, changes: Vec<Change>) -> Result<()> {
        let inner = &self.inner;
        if inner.stopping.load(Ordering::Acquire) {
            return Err(Error::NotOpen);
        }
        if changes.is_empty() {
            return Err(Error::InvalidArgument("empty change batch".to_string()));
        }
        for change in &changes {
            if change.doc_id() == Some(0) {
                return Err(Error::InvalidArgument(
                    "document id 0 is reserved".to_string(),
                ));
            }
        }

        let segment = MemorySegment::build(&changes);

        let update_guard = inner.update_lock.lock();
        let commit_id = inner.oplog.lock().write(&changes)?;
        {
            let _guard = inner.segments_lock.write();
            let memory = inner.memory_segments.load();
            let id = memory
                .last()
                .map(|s| s.id().next())
                .or_else(|| inner.file_segments.load().last().map(|s| s.id().next()))
                .unwrap_or_else(SegmentId::first);
            let segment = Arc::new(segment.publish_as(id, commit_id));
            inner.memory_segments.store(Arc::new(memory.append(segment)));
        }
        drop(update_guard);

        inner.memory_merge_event.set();
        Ok(())
    }

    /// Find documents sharing hashes with the query.
    ///
    /// Results are sorted by score descending, then id ascending. An empty
    /// query yields empty results; duplicate query hashes count once.
    pub fn search(
        &self,
        hashes: &[u32],
        deadline: Option<Instant>,
    ) -> Result<Vec<SearchResult>> {
        let inner = &self.inner;
        if inner.stopping.load(Ordering::Acquire) {
            return Err(Error::NotOpen);
        }
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = hashes.to_vec();
        query.sort_unstable();
        query.dedup();

        let (files, memory) = inner.snapshot();

        let mut matches = MatchAccumulator::new();
        files.search(&query, &mut matches, deadline)?;
        memory.search(&query, &mut matches, deadline)?;

        Ok(matches.into_results(|doc_id, version| {
            memory.has_newer_version(doc_id, version) || files.has_newer_version(doc_id, version)
        }))
    }

    /// Current location and liveness of a document, if the index knows it.
    pub fn get_doc_info(&self, id: u32) -> Result<Option<DocInfo>> {
        let inner = &self.inner;
        if inner.stopping.load(Ordering::Acquire) {
            return Err(Error::NotOpen);
        }

        let (files, memory) = inner.snapshot();
        for segment in memory.segments().iter().rev() {
            if let Some(live) = segment.doc_status(id) {
                return Ok(Some(DocInfo {
                    id,
                    version: segment.id().version,
                    deleted: !live,
                }));
            }
        }
        for segment in files.segments().iter().rev() {
            if let Some(live) = segment.doc_status(id) {
                return Ok(Some(DocInfo {
                    id,
                    version: segment.id().version,
                    deleted: !live,
                }));
            }
        }
        Ok(None)
    }

    /// Merged attribute map, later segment versions winning, plus the
    /// built-in `min_document_id` / `max_document_id` attributes.
    pub fn get_attributes(&self) -> Result<HashMap<String, u64>> {
        let inner = &self.inner;
        if inner.stopping.load(Ordering::Acquire) {
            return Err(Error::NotOpen);
        }

        let (files, memory) = inner.snapshot();

        // Oldest to newest: a later segment's value wins
        let mut merged = HashMap::new();
        for segment in files
            .segments()
            .iter()
            .map(|s| s.attributes())
            .chain(memory.segments().iter().map(|s| s.attributes()))
        {
            for (key, &value) in segment {
                merged.insert(key.clone(), value);
            }
        }

        let mut seen = HashSet::new();
        let mut min_doc = None::<u32>;
        let mut max_doc = None::<u32>;
        for segment in memory
            .segments()
            .iter()
            .rev()
            .map(|s| s.docs())
            .chain(files.segments().iter().rev().map(|s| s.docs()))
        {
            for (&doc_id, &live) in segment {
                if seen.insert(doc_id) && live {
                    min_doc = Some(min_doc.map_or(doc_id, |m| m.min(doc_id)));
                    max_doc = Some(max_doc.map_or(doc_id, |m| m.max(doc_id)));
                }
            }
        }
        merged.insert(MIN_DOCUMENT_ID_ATTR.to_string(), min_doc.unwrap_or(0) as u64);
        merged.insert(MAX_DOCUMENT_ID_ATTR.to_string(), max_doc.unwrap_or(0) as u64);

        Ok(merged)
    }

    /// Highest durably committed change batch id.
    pub fn last_commit_id(&self) -> u64 {
        self.inner.oplog.lock().last_commit_id()
    }

    /// Number of segments in the memory tier.
    pub fn memory_segment_count(&self) -> usize {
        self.inner.memory_segments.load().count()
    }

    /// Number of segments in the file tier.
    pub fn file_segment_count(&self) -> usize {
        self.inner.file_segments.load().count()
    }

    /// Identifiers of the file-tier segments, oldest first.
    pub fn file_segment_ids(&self) -> Vec<SegmentId> {
        self.inner.file_segments.load().get_ids()
    }

    /// Quiesce the maintenance workers and shut the index down.
    ///
    /// Idempotent; in-flight operations finish against their snapshots.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.stopping.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for job in &self.timer_jobs {
            self.scheduler.cancel(*job);
        }
        self.scheduler.shutdown();

        inner.checkpoint_event.set();
        inner.memory_merge_event.set();
        inner.file_merge_event.set();

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn spawn_worker(
    name: &str,
    inner: &Arc<IndexInner>,
    event: fn(&IndexInner) -> &ResetEvent,
    step: fn(&IndexInner) -> Result<bool>,
) -> JoinHandle<()> {
    let inner = Arc::clone(inner);
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || loop {
            if inner.stopping.load(Ordering::Acquire) {
                return;
            }
            match step(&inner) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    // Stay available on the last durable state; retry after
                    // the idle backoff
                    warn!(error = %e, "index maintenance step failed");
                }
            }
            event(&inner).wait_timeout(inner.config.worker_idle_timeout);
        })
        .expect("failed to spawn index worker thread")
}

impl IndexInner {
    /// Consistent snapshot of both segment lists.
    fn snapshot(
        &self,
    ) -> (
        Arc<SegmentList<FileSegment>>,
        Arc<SegmentList<MemorySegment>>,
    ) {
        let _guard = self.segments_lock.read();
        (self.file_segments.load_full(), self.memory_segments.load_full())
    }

    /// Promote the oldest memory segment to a file segment once it is big
    /// enough, then truncate the oplog behind it.
    fn do_checkpoint(&self) -> Result<bool> {
        // Freeze under the memory list lock so a concurrent memory merge can
        // never fold the head away between selection and publication
        let head = {
            let _ml = self.memory_segments_lock.lock();
            let memory = self.memory_segments.load();
            match memory.first() {
                Some(head) if head.size() >= self.config.min_segment_size => {
                    head.freeze();
                    Arc::clone(head)
                }
                _ => return Ok(false),
            }
        };

        // I/O-heavy build happens outside every lock
        let mut writer =
            FileSegmentWriter::create(&self.data_dir, head.id(), self.config.block_size)?;
        for &item in head.items() {
            writer.push(item)?;
        }
        writer.finish(
            head.docs().clone(),
            head.attributes().clone(),
            head.max_commit_id(),
        )?;
        let published = Arc::new(FileSegment::open(&self.data_dir, head.id())?);

        {
            let _ml = self.memory_segments_lock.lock();
            let _fl = self.file_segments_lock.lock();
            let new_files = self.file_segments.load().append(published);
            store::write_index_file(&self.data_dir, &new_files.get_ids())?;

            let _guard = self.segments_lock.write();
            let memory = self.memory_segments.load();
            debug_assert!(memory
                .first()
                .map(|s| Arc::ptr_eq(s, &head))
                .unwrap_or(false));
            self.file_segments.store(Arc::new(new_files));
            self.memory_segments.store(Arc::new(memory.remove_first()));
        }

        self.oplog.lock().truncate(head.max_commit_id())?;
        info!(
            segment = %head.id(),
            items = head.size(),
            max_commit_id = head.max_commit_id(),
            "checkpointed memory segment"
        );

        self.file_merge_event.set();
        Ok(true)
    }

    /// Coalesce small memory segments when the tier is over budget.
    fn maybe_merge_memory_segments(&self) -> Result<bool> {
        let _ml = self.memory_segments_lock.lock();
        let (files, memory) = self.snapshot();

        let Some(candidate) = self.policy.find_candidate(memory.segments()) else {
            // The head may already be checkpoint-sized without any merge
            if memory
                .first()
                .map(|s| s.size() >= self.config.min_segment_size)
                .unwrap_or(false)
            {
                self.checkpoint_event.set();
            }
            return Ok(false);
        };

        let sources = &memory.segments()[candidate.start..candidate.end];
        let window_is_head = candidate.start == 0 && files.is_empty();
        let threshold = SegmentId::merge(
            sources.first().unwrap().id(),
            sources.last().unwrap().id(),
        );
        let after = threshold.version + threshold.included_merges;
        let merger = Merger::new(
            sources,
            |doc_id| {
                memory.has_newer_version(doc_id, after) || files.has_newer_version(doc_id, after)
            },
            window_is_head,
        );
        let merged_id = merger.merged_id();
        let max_commit_id = merger.max_commit_id();

        let mut items = Vec::new();
        let parts = merger.run(|item| {
            items.push(item);
            Ok(())
        })?;
        let merged = Arc::new(MemorySegment::from_parts(
            merged_id,
            max_commit_id,
            parts.attributes,
            parts.docs,
            items,
        ));
        let merged_size = merged.size();

        {
            let _guard = self.segments_lock.write();
            let current = self.memory_segments.load();
            self.memory_segments.store(Arc::new(current.replace_range(
                candidate.start,
                candidate.end,
                Some(merged),
            )));
        }

        if candidate.start == 0 && merged_size >= self.config.min_segment_size {
            self.checkpoint_event.set();
        }
        Ok(true)
    }

    /// Merge a window of file segments when the tier is over budget.
    fn maybe_merge_file_segments(&self) -> Result<bool> {
        // Snapshot both lists atomically; the file list is append-only under
        // file_segments_lock, so the window cannot disappear while we build
        let (files, memory) = self.snapshot();
        let Some(candidate) = self.policy.find_candidate(files.segments()) else {
            return Ok(false);
        };

        let sources = &files.segments()[candidate.start..candidate.end];
        let threshold = SegmentId::merge(
            sources.first().unwrap().id(),
            sources.last().unwrap().id(),
        );
        let after = threshold.version + threshold.included_merges;
        let merger = Merger::new(
            sources,
            |doc_id| {
                memory.has_newer_version(doc_id, after) || files.has_newer_version(doc_id, after)
            },
            candidate.start == 0,
        );
        let merged_id = merger.merged_id();
        let max_commit_id = merger.max_commit_id();

        let mut writer =
            FileSegmentWriter::create(&self.data_dir, merged_id, self.config.block_size)?;
        let parts = merger.run(|item| writer.push(item))?;

        // A merge that erased every document leaves nothing behind, unless
        // the segment still carries attributes that need a home
        let replacement = if writer.num_items() == 0
            && parts.docs.is_empty()
            && parts.attributes.is_empty()
        {
            drop(writer);
            None
        } else {
            writer.finish(parts.docs, parts.attributes, max_commit_id)?;
            Some(Arc::new(FileSegment::open(&self.data_dir, merged_id)?))
        };

        let vanished = replacement.is_none();
        let published = (|| -> Result<()> {
            let _fl = self.file_segments_lock.lock();
            let current = self.file_segments.load();
            // The file list is append-only while a merge is in flight, so
            // the window sits exactly where the snapshot put it
            debug_assert!(Arc::ptr_eq(&current.segments()[candidate.start], &sources[0]));
            let new_files =
                current.replace_range(candidate.start, candidate.end, replacement.clone());
            store::write_index_file(&self.data_dir, &new_files.get_ids())?;

            let _guard = self.segments_lock.write();
            self.file_segments.store(Arc::new(new_files));
            Ok(())
        })();
        if let Err(e) = published {
            // Never leave an unreferenced target behind; sources stay live
            if let Some(merged) = replacement {
                merged.delete_on_drop();
            }
            return Err(e);
        }

        // The superseding list is durable: retire the sources once the last
        // search snapshot lets go of them
        for source in sources {
            source.delete_on_drop();
        }
        info!(
            merged = %merged_id,
            sources = sources.len(),
            vanished,
            "merged file segments"
        );
        Ok(true)
    }
}
