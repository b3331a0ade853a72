//! Index orchestration: the embedding-facing API and result aggregation

pub mod core;
pub mod results;

pub use self::core::{DocInfo, Index, MAX_DOCUMENT_ID_ATTR, MIN_DOCUMENT_ID_ATTR};
pub use results::{filter_search_results, sort_search_results, MatchAccumulator, SearchResult};
