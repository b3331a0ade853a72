//! Embedded audio-fingerprint index
//!
//! A persistent, append-only, multi-version store mapping 32-bit hash tokens
//! to 32-bit document identifiers, built for fingerprint-matching services
//! that embed the index directly. Writes are batched into durable commits;
//! searches report how many query hashes co-occur per document, honouring
//! per-document overwrites and deletes.
//!
//! ```no_run
//! use fpindex::{Change, Index, IndexConfig};
//!
//! let index = Index::open("/var/lib/fpindex", IndexConfig::create())?;
//! index.update(vec![Change::insert(1, vec![100, 200, 300])])?;
//! let results = index.search(&[100, 200, 300], None)?;
//! assert_eq!(results[0].id, 1);
//! assert_eq!(results[0].score, 3);
//! # Ok::<(), fpindex::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod oplog;
pub mod scheduler;
pub mod segment;

pub use config::IndexConfig;
pub use error::{Error, Result};
pub use index::{
    filter_search_results, sort_search_results, DocInfo, Index, SearchResult,
    MAX_DOCUMENT_ID_ATTR, MIN_DOCUMENT_ID_ATTR,
};
pub use segment::{Change, SegmentId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
