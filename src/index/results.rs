//! Search result aggregation with newer-version-wins semantics

use std::collections::HashMap;

/// Search result for one document
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchResult {
    /// Document identifier
    pub id: u32,
    /// Number of distinct query hashes matched in the newest segment
    /// containing the document
    pub score: u32,
    /// Version of the segment the score was counted in
    pub version: u64,
}

/// Accumulates per-document match counts while segment lists are traversed
/// oldest to newest.
///
/// A match arriving from a newer segment version means the document was
/// overwritten there, so the running count restarts; matches from the same
/// version accumulate.
#[derive(Debug, Default)]
pub struct MatchAccumulator {
    by_doc: HashMap<u32, (u32, u64)>,
}

impl MatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one matched query hash for `id` found in a segment of `version`.
    pub fn upsert_match(&mut self, id: u32, version: u64) {
        match self.by_doc.entry(id) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let (score, current) = entry.get_mut();
                if version > *current {
                    *score = 1;
                    *current = version;
                } else if version == *current {
                    *score += 1;
                }
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert((1, version));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_doc.is_empty()
    }

    /// Drop documents deleted or overwritten by a segment newer than the one
    /// they were counted in, then return the surviving results sorted.
    ///
    /// `has_newer_version(id, version)` must answer whether any segment with a
    /// version greater than `version` carries `id` in its doc map.
    pub fn into_results<F>(self, has_newer_version: F) -> Vec<SearchResult>
    where
        F: Fn(u32, u64) -> bool,
    {
        let mut results: Vec<SearchResult> = self
            .by_doc
            .into_iter()
            .filter(|(id, (_, version))| !has_newer_version(*id, *version))
            .map(|(id, (score, version))| SearchResult { id, score, version })
            .collect();
        sort_search_results(&mut results);
        results
    }
}

/// Order results by score descending, then document id ascending.
pub fn sort_search_results(results: &mut [SearchResult]) {
    results.sort_unstable_by(|a, b| b.score.cmp(&a.score).then(a.id.cmp(&b.id)));
}

/// Truncate sorted results to `limit` entries, dropping everything scoring
/// below `min_score_percent` percent of the best score.
pub fn filter_search_results(results: &mut Vec<SearchResult>, limit: usize, min_score_percent: u32) {
    if let Some(top) = results.first().map(|r| r.score) {
        results.retain(|r| r.score as u64 * 100 >= top as u64 * min_score_percent as u64);
    }
    results.truncate(limit);
}
