//! End-to-end behaviour of the index against an in-process instance

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use fpindex::{Change, Error, Index, IndexConfig};

fn open_index() -> (TempDir, Index) {
    let tmp = TempDir::new().unwrap();
    let index = Index::open(tmp.path(), test_config()).unwrap();
    (tmp, index)
}

fn test_config() -> IndexConfig {
    IndexConfig {
        create: true,
        min_segment_size: 64,
        max_segment_size: 100_000,
        segments_per_level: 2,
        segments_per_merge: 4,
        max_segments: 8,
        block_size: 128,
        max_oplog_file_size: 4096,
        worker_idle_timeout: Duration::from_millis(100),
    }
}

fn scores(index: &Index, hashes: &[u32]) -> Vec<(u32, u32)> {
    index
        .search(hashes, None)
        .unwrap()
        .into_iter()
        .map(|r| (r.id, r.score))
        .collect()
}

#[test]
fn test_basic_recall() {
    let (_tmp, index) = open_index();
    index.update(vec![Change::insert(1, vec![1, 2, 3])]).unwrap();

    assert_eq!(scores(&index, &[1, 2, 3]), vec![(1, 3)]);
}

#[test]
fn test_partial_overwrite() {
    let (_tmp, index) = open_index();
    index.update(vec![Change::insert(1, vec![1, 2, 3])]).unwrap();
    index.update(vec![Change::insert(1, vec![1, 2, 4])]).unwrap();

    assert_eq!(scores(&index, &[1, 2, 3]), vec![(1, 2)]);
}

#[test]
fn test_full_overwrite() {
    let (_tmp, index) = open_index();
    index.update(vec![Change::insert(1, vec![1, 2, 3])]).unwrap();
    index
        .update(vec![Change::insert(1, vec![100, 200, 300])])
        .unwrap();

    assert_eq!(scores(&index, &[1, 2, 3]), vec![]);
    assert_eq!(scores(&index, &[100, 200, 300]), vec![(1, 3)]);
}

#[test]
fn test_delete() {
    let (_tmp, index) = open_index();
    index.update(vec![Change::insert(1, vec![1, 2, 3])]).unwrap();
    index.update(vec![Change::delete(1)]).unwrap();

    assert_eq!(scores(&index, &[1, 2, 3]), vec![]);
}

#[test]
fn test_delete_then_reinsert() {
    let (_tmp, index) = open_index();
    index.update(vec![Change::insert(1, vec![1, 2, 3])]).unwrap();
    index.update(vec![Change::delete(1)]).unwrap();
    index.update(vec![Change::insert(1, vec![1, 2])]).unwrap();

    assert_eq!(scores(&index, &[1, 2, 3]), vec![(1, 2)]);
}

#[test]
fn test_insert_is_idempotent() {
    let (_tmp, index) = open_index();
    index.update(vec![Change::insert(1, vec![5, 6, 7])]).unwrap();
    index.update(vec![Change::insert(1, vec![5, 6, 7])]).unwrap();

    assert_eq!(scores(&index, &[5, 6, 7]), vec![(1, 3)]);
}

#[test]
fn test_delete_is_idempotent() {
    let (_tmp, index) = open_index();
    index.update(vec![Change::insert(1, vec![5])]).unwrap();
    index.update(vec![Change::delete(1)]).unwrap();
    index.update(vec![Change::delete(1)]).unwrap();

    assert_eq!(scores(&index, &[5]), vec![]);
    let info = index.get_doc_info(1).unwrap().unwrap();
    assert!(info.deleted);
}

#[test]
fn test_empty_query_returns_empty() {
    let (_tmp, index) = open_index();
    index.update(vec![Change::insert(1, vec![1])]).unwrap();

    assert_eq!(scores(&index, &[]), vec![]);
}

#[test]
fn test_duplicate_query_hashes_count_once() {
    let (_tmp, index) = open_index();
    index.update(vec![Change::insert(1, vec![1, 2])]).unwrap();

    assert_eq!(scores(&index, &[1, 1, 1, 2]), vec![(1, 2)]);
}

#[test]
fn test_single_shared_hash_scores_one() {
    let (_tmp, index) = open_index();
    index.update(vec![Change::insert(7, vec![42, 43])]).unwrap();

    assert_eq!(scores(&index, &[42, 99]), vec![(7, 1)]);
}

#[test]
fn test_results_ordered_by_score_then_id() {
    let (_tmp, index) = open_index();
    index.update(vec![
        Change::insert(3, vec![1, 2, 3]),
        Change::insert(1, vec![1]),
        Change::insert(2, vec![1]),
    ]).unwrap();

    assert_eq!(scores(&index, &[1, 2, 3]), vec![(3, 3), (1, 1), (2, 1)]);
}

#[test]
fn test_multiple_docs_in_one_commit_last_write_wins() {
    let (_tmp, index) = open_index();
    index
        .update(vec![
            Change::insert(1, vec![1, 2]),
            Change::insert(1, vec![3, 4]),
        ])
        .unwrap();

    assert_eq!(scores(&index, &[1, 2]), vec![]);
    assert_eq!(scores(&index, &[3, 4]), vec![(1, 2)]);
}

#[test]
fn test_invalid_arguments() {
    let (_tmp, index) = open_index();

    assert!(matches!(
        index.update(vec![]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        index.update(vec![Change::insert(0, vec![1])]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        index.update(vec![Change::delete(0)]),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_search_deadline_exceeded() {
    let (_tmp, index) = open_index();
    index.update(vec![Change::insert(1, vec![1, 2, 3])]).unwrap();

    let past = Instant::now() - Duration::from_secs(1);
    assert!(matches!(
        index.search(&[1, 2], Some(past)),
        Err(Error::Timeout)
    ));
}

#[test]
fn test_get_doc_info() {
    let (_tmp, index) = open_index();
    index.update(vec![Change::insert(5, vec![1])]).unwrap();

    let info = index.get_doc_info(5).unwrap().unwrap();
    assert_eq!(info.id, 5);
    assert!(!info.deleted);
    assert!(info.version >= 1);

    index.update(vec![Change::delete(5)]).unwrap();
    let info = index.get_doc_info(5).unwrap().unwrap();
    assert!(info.deleted);
    assert!(info.version >= 2);

    assert_eq!(index.get_doc_info(99).unwrap(), None);
}

#[test]
fn test_attributes() {
    let (_tmp, index) = open_index();
    index
        .update(vec![
            Change::insert(10, vec![1]),
            Change::insert(70, vec![2]),
            Change::set_attribute("model", 3),
        ])
        .unwrap();
    index.update(vec![Change::set_attribute("model", 4)]).unwrap();

    let attrs = index.get_attributes().unwrap();
    assert_eq!(attrs.get("model"), Some(&4));
    assert_eq!(attrs.get(fpindex::MIN_DOCUMENT_ID_ATTR), Some(&10));
    assert_eq!(attrs.get(fpindex::MAX_DOCUMENT_ID_ATTR), Some(&70));
}

#[test]
fn test_attributes_ignore_deleted_docs() {
    let (_tmp, index) = open_index();
    index
        .update(vec![
            Change::insert(10, vec![1]),
            Change::insert(70, vec![2]),
        ])
        .unwrap();
    index.update(vec![Change::delete(70)]).unwrap();

    let attrs = index.get_attributes().unwrap();
    assert_eq!(attrs.get(fpindex::MIN_DOCUMENT_ID_ATTR), Some(&10));
    assert_eq!(attrs.get(fpindex::MAX_DOCUMENT_ID_ATTR), Some(&10));
}

#[test]
fn test_operations_fail_after_close() {
    let (_tmp, index) = open_index();
    index.update(vec![Change::insert(1, vec![1])]).unwrap();
    index.close().unwrap();

    assert!(matches!(
        index.update(vec![Change::insert(2, vec![2])]),
        Err(Error::NotOpen)
    ));
    assert!(matches!(index.search(&[1], None), Err(Error::NotOpen)));
    // close is idempotent
    index.close().unwrap();
}

#[test]
fn test_result_filtering_helpers() {
    let (_tmp, index) = open_index();
    index.update(vec![
        Change::insert(1, vec![1, 2, 3, 4, 5]),
        Change::insert(2, vec![1]),
        Change::insert(3, vec![2]),
    ]).unwrap();

    let mut results = index.search(&[1, 2, 3, 4, 5], None).unwrap();
    assert_eq!(results.len(), 3);

    fpindex::filter_search_results(&mut results, 10, 50);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, 1);
    assert_eq!(results[0].score, 5);
}

/// Reference model: a plain map of document id to hash set.
#[derive(Default)]
struct ReferenceIndex {
    docs: HashMap<u32, HashSet<u32>>,
}

impl ReferenceIndex {
    fn apply(&mut self, changes: &[Change]) {
        for change in changes {
            match change {
                Change::Insert { id, hashes } => {
                    self.docs.insert(*id, hashes.iter().copied().collect());
                }
                Change::Delete { id } => {
                    self.docs.remove(id);
                }
                Change::SetAttribute { .. } => {}
            }
        }
    }

    fn search(&self, hashes: &[u32]) -> Vec<(u32, u32)> {
        let query: HashSet<u32> = hashes.iter().copied().collect();
        let mut results: Vec<(u32, u32)> = self
            .docs
            .iter()
            .map(|(&id, doc)| (id, query.intersection(doc).count() as u32))
            .filter(|&(_, score)| score > 0)
            .collect();
        results.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        results
    }
}

#[test]
fn test_matches_brute_force_reference() {
    let (_tmp, index) = open_index();
    let mut reference = ReferenceIndex::default();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    // A mix of inserts, overwrites and deletes over a small id space so
    // overwrites and deletes actually collide
    for _ in 0..300 {
        let id = rng.gen_range(1..40u32);
        let change = if rng.gen_bool(0.2) {
            Change::delete(id)
        } else {
            let len = rng.gen_range(1..10usize);
            let hashes: Vec<u32> = (0..len).map(|_| rng.gen_range(0..500u32)).collect();
            Change::insert(id, hashes)
        };
        reference.apply(std::slice::from_ref(&change));
        index.update(vec![change]).unwrap();
    }

    for _ in 0..50 {
        let len = rng.gen_range(1..12usize);
        let query: Vec<u32> = (0..len).map(|_| rng.gen_range(0..500u32)).collect();
        assert_eq!(
            scores(&index, &query),
            reference.search(&query),
            "query {:?}",
            query
        );
    }
}
