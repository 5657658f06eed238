//! shardline - the shard-level engine of a distributed full-text search
//! server.
//!
//! A [`Shard`] owns one partition of an index on top of
//! [Tantivy](https://github.com/quickwit-oss/tantivy): a single writer,
//! point-in-time reader snapshots, a result cache invalidated on refresh,
//! and a commit policy driven by mutation counts and idle time. Queries
//! support per-field similarity, multi-field sorting with search-after
//! cursors, facet counts, highlighting and term analysis.
//!
//! # Quick start
//!
//! ```
//! use shardline::{FieldConfig, FieldType, IndexConfig, IndexSettings};
//! use shardline::{QueryNode, Shard, ShardQuery};
//!
//! let config = IndexConfig::new(IndexSettings {
//!     index_name: "books".to_string(),
//!     fields: vec![
//!         FieldConfig::new("title", FieldType::Text).index_as("title"),
//!     ],
//!     ..IndexSettings::default()
//! })
//! .unwrap();
//! let shard = Shard::open_in_ram(config, 0, true).unwrap();
//!
//! let serde_json::Value::Object(doc) =
//!     serde_json::json!({ "title": "The Left Hand of Darkness" })
//! else {
//!     unreachable!()
//! };
//! shard.index("b1", 0, &doc, &[]).unwrap();
//! shard.force_commit().unwrap();
//!
//! let query = ShardQuery::new(QueryNode::All, 10);
//! let response = shard.query(&query).unwrap();
//! assert_eq!(response.total_hits, 1);
//! assert_eq!(response.scored_results[0].unique_id, "b1");
//! ```

pub mod analysis;
pub mod cache;
pub mod codec;
mod collector;
pub mod config;
pub mod error;
pub mod facet;
pub mod highlight;
pub mod logging;
pub mod query;
pub mod reader;
pub mod response;
mod result;
pub mod scheduler;
pub mod schema;
pub mod shard;
pub mod similarity;
pub mod sort;
pub mod terms;
pub mod writer;

pub use analysis::{AnalysisRequest, AnalysisResult};
pub use cache::{CacheStats, ResultCache};
pub use codec::{Document, DocumentCodec, JsonCodec};
pub use config::{FieldConfig, FieldType, IndexConfig, IndexSettings};
pub use error::{Error, ErrorKind, Result};
pub use facet::{CountRequest, FacetRequest, ShardFacets};
pub use highlight::HighlightRequest;
pub use query::{QueryNode, ShardQuery};
pub use response::{
    FetchType,
    Metadata,
    ResultDocument,
    ScoredResult,
    ShardQueryResponse,
};
pub use shard::Shard;
pub use similarity::Similarity;
pub use sort::{AfterCursor, FieldSort, SortRequest, SortValue};
pub use terms::{TermsRequest, TermsResponse};
