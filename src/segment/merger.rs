//! N-way streaming merge of contiguous segments
//!
//! The merge emits one deduplicated sorted item stream while honouring
//! per-document overwrites:
//!
//! - within the window, the latest source carrying a document owns its state;
//!   items of the same document from older sources are dropped
//! - documents carried by any segment newer than the window (checked through
//!   a consistent snapshot of both lists) are dropped entirely, items and doc
//!   entries alike
//! - tombstones propagate until the window reaches the head of the segment
//!   list, at which point nothing older remains for them to shadow

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

use super::types::{Item, SegmentId};
use super::Segment;

/// Final per-document state within the merge window.
#[derive(Clone, Copy, Debug)]
struct DocState {
    /// Version of the window source that owns the document
    version: u64,
    /// true = live, false = tombstone
    live: bool,
    /// Carried by a segment newer than the window
    shadowed: bool,
}

/// Doc map and attributes of the merged segment, produced alongside the
/// item stream.
#[derive(Debug, Default)]
pub struct MergedParts {
    pub docs: HashMap<u32, bool>,
    pub attributes: HashMap<String, u64>,
}

/// Streaming merger over a contiguous window of segments.
pub struct Merger<'a, T: Segment> {
    sources: &'a [Arc<T>],
    doc_states: HashMap<u32, DocState>,
    drop_tombstones: bool,
}

impl<'a, T: Segment> Merger<'a, T> {
    /// Prepare a merge of `sources` (a contiguous run, oldest first).
    ///
    /// `has_newer_version(doc_id)` must answer whether any segment *after*
    /// the window carries the document; resolve it against a snapshot of
    /// both segment lists taken atomically. `window_is_head` marks a window
    /// starting at the head of the whole index, which lets tombstones retire.
    pub fn new<F>(sources: &'a [Arc<T>], has_newer_version: F, window_is_head: bool) -> Self
    where
        F: Fn(u32) -> bool,
    {
        debug_assert!(!sources.is_empty());

        let mut doc_states: HashMap<u32, DocState> = HashMap::new();
        for source in sources {
            let version = source.id().version;
            for (&doc_id, &live) in source.docs() {
                // Later sources overwrite earlier state
                let state = doc_states.entry(doc_id).or_insert(DocState {
                    version,
                    live,
                    shadowed: false,
                });
                state.version = version;
                state.live = live;
            }
        }
        for (&doc_id, state) in doc_states.iter_mut() {
            state.shadowed = has_newer_version(doc_id);
        }

        Self {
            sources,
            doc_states,
            drop_tombstones: window_is_head,
        }
    }

    /// Identifier of the merged output segment.
    pub fn merged_id(&self) -> SegmentId {
        let first = self.sources.first().expect("empty merge window").id();
        let last = self.sources.last().expect("empty merge window").id();
        SegmentId::merge(first, last)
    }

    /// Oplog watermark of the merged output segment.
    pub fn max_commit_id(&self) -> u64 {
        self.sources
            .iter()
            .map(|s| s.max_commit_id())
            .max()
            .unwrap_or(0)
    }

    fn keep_item(&self, item: Item, source_version: u64) -> bool {
        match self.doc_states.get(&item.id) {
            Some(state) => state.version == source_version && state.live && !state.shadowed,
            None => false,
        }
    }

    /// Stream the merged items into `emit` and return the merged doc map and
    /// attributes.
    pub fn run<F>(self, mut emit: F) -> Result<MergedParts>
    where
        F: FnMut(Item) -> Result<()>,
    {
        let mut streams: Vec<_> = self
            .sources
            .iter()
            .map(|s| (s.id().version, s.iter_items().peekable()))
            .collect();

        let mut last_emitted: Option<Item> = None;
        loop {
            // Pick the stream with the smallest head item
            let mut min: Option<(usize, Item)> = None;
            for (idx, (_, stream)) in streams.iter_mut().enumerate() {
                match stream.peek() {
                    Some(Ok(item)) => {
                        if min.map_or(true, |(_, best)| *item < best) {
                            min = Some((idx, *item));
                        }
                    }
                    Some(Err(_)) => {
                        return Err(stream.next().unwrap().unwrap_err());
                    }
                    None => {}
                }
            }
            let Some((idx, item)) = min else {
                break;
            };
            streams[idx].1.next();

            if last_emitted == Some(item) {
                continue;
            }
            if self.keep_item(item, streams[idx].0) {
                emit(item)?;
                last_emitted = Some(item);
            }
        }

        let mut parts = MergedParts::default();
        for source in self.sources {
            for (key, &value) in source.attributes() {
                parts.attributes.insert(key.clone(), value);
            }
        }
        for (&doc_id, state) in &self.doc_states {
            if state.shadowed {
                continue;
            }
            if !state.live && self.drop_tombstones {
                continue;
            }
            parts.docs.insert(doc_id, state.live);
        }

        Ok(parts)
    }
}
