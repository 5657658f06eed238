use serde::{Deserialize, Serialize};

use crate::{
    analysis::AnalysisResult,
    facet::FacetGroup,
    highlight::HighlightResult,
    sort::{AfterCursor, SortValue},
};

/// How much of each hit's stored data to load.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FetchType {
    /// Id and timestamp only, read from columnar storage.
    None,
    /// Plus metadata.
    Meta,
    /// Plus the stored document.
    #[default]
    Full,
}

impl FetchType {
    pub fn is_full(self) -> bool {
        self == FetchType::Full
    }

    pub fn loads_stored(self) -> bool {
        self != FetchType::None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub key: String,
    pub value: String,
}

impl Metadata {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultDocument {
    pub unique_id: String,
    pub index_name: String,
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: Vec<Metadata>,
    /// Encoded stored document, absent unless fully fetched.
    #[serde(default)]
    pub document: Option<Vec<u8>>,
}

impl ResultDocument {
    /// Identity-only document returned when a fetch finds nothing.
    pub fn placeholder(unique_id: &str, index_name: &str) -> Self {
        Self {
            unique_id: unique_id.to_string(),
            index_name: index_name.to_string(),
            timestamp: 0,
            metadata: Vec::new(),
            document: None,
        }
    }

    pub fn has_document(&self) -> bool {
        self.document.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredResult {
    pub unique_id: String,
    pub score: f32,
    pub timestamp: i64,
    pub index_name: String,
    pub shard: u32,
    pub segment_ord: u32,
    pub doc_id: u32,
    /// Position in the response; the extra result carries `amount`.
    pub result_index: usize,
    #[serde(default)]
    pub sort_values: Option<Vec<SortValue>>,
    #[serde(default)]
    pub result_document: Option<ResultDocument>,
    #[serde(default)]
    pub highlight_results: Vec<HighlightResult>,
    #[serde(default)]
    pub analysis_results: Vec<AnalysisResult>,
}

impl ScoredResult {
    /// Cursor resuming right after this hit.
    pub fn after_cursor(&self) -> AfterCursor {
        AfterCursor {
            score: self.score,
            sort_values: self.sort_values.clone(),
            segment_ord: self.segment_ord,
            doc_id: self.doc_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardQueryResponse {
    pub index_name: String,
    pub shard_number: u32,
    pub total_hits: u64,
    pub scored_results: Vec<ScoredResult>,
    /// First hit beyond the requested amount, fetched without stored data.
    #[serde(default)]
    pub next: Option<ScoredResult>,
    #[serde(default)]
    pub facet_groups: Vec<FacetGroup>,
    #[serde(default)]
    pub analysis_results: Vec<AnalysisResult>,
}

impl ShardQueryResponse {
    pub fn empty(shard_number: u32, index_name: &str) -> Self {
        Self {
            index_name: index_name.to_string(),
            shard_number,
            total_hits: 0,
            scored_results: Vec::new(),
            next: None,
            facet_groups: Vec::new(),
            analysis_results: Vec::new(),
        }
    }

    pub fn has_more(&self) -> bool {
        self.next.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCountResponse {
    pub shard_number: u32,
    pub number_of_docs: u64,
}
