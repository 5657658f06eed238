use std::{
    collections::{BTreeSet, HashMap},
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tantivy::{
    DocId,
    DocSet,
    Score,
    Searcher,
    SegmentReader,
    Term,
    fieldnorm::FieldNormReader,
    postings::{Postings, SegmentPostings},
    query::Query,
    schema::{Field, IndexRecordOption},
};

use crate::{
    config::IndexConfig,
    error::{Error, Result},
};

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

/// Scoring model applied to a field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Similarity {
    #[default]
    Bm25,
    /// Classic vector-space scoring: `sqrt(tf) * idf^2 / sqrt(length)`.
    TfIdf,
    /// Every matching term scores 1.
    Constant,
    /// Raw term frequency.
    Tf,
}

impl FromStr for Similarity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bm25" => Ok(Similarity::Bm25),
            "tfidf" | "tf_idf" => Ok(Similarity::TfIdf),
            "constant" => Ok(Similarity::Constant),
            "tf" => Ok(Similarity::Tf),
            _ => Err(Error::UnknownSimilarity(s.to_string())),
        }
    }
}

/// Picks the similarity for an index field: the index default, replaced by
/// the field analyzer's similarity, replaced by a per-query override.
pub struct SimilarityResolver<'a> {
    config: &'a IndexConfig,
    overrides: &'a HashMap<String, Similarity>,
}

impl<'a> SimilarityResolver<'a> {
    pub fn new(
        config: &'a IndexConfig,
        overrides: &'a HashMap<String, Similarity>,
    ) -> Self {
        Self { config, overrides }
    }

    pub fn resolve(&self, field: &str) -> Similarity {
        if let Some(similarity) = self.overrides.get(field) {
            return *similarity;
        }
        self.config
            .analyzer_settings_for_index_field(field)
            .and_then(|analyzer| analyzer.similarity)
            .unwrap_or(self.config.settings().default_similarity)
    }
}

/// Collection-level statistics for one query term.
#[derive(Debug, Clone)]
pub(crate) struct TermWeight {
    term: Term,
    field: Field,
    similarity: Similarity,
    idf: f32,
    avg_len: f32,
}

/// Query terms that need rescoring because at least one of their fields
/// does not use BM25.
#[derive(Debug, Clone)]
pub(crate) struct TermWeights(Arc<[TermWeight]>);

impl TermWeights {
    /// `None` when every field resolves to BM25 and the native score can
    /// be kept.
    pub(crate) fn build(
        searcher: &Searcher,
        query: &dyn Query,
        resolver: &SimilarityResolver<'_>,
    ) -> Result<Option<Self>> {
        let mut terms = BTreeSet::new();
        query.query_terms(&mut |term, _| {
            terms.insert(term.clone());
        });

        let schema = searcher.schema();
        let resolved: Vec<(Term, Similarity)> = terms
            .into_iter()
            .map(|term| {
                let name = schema.get_field_name(term.field());
                let similarity = resolver.resolve(name);
                (term, similarity)
            })
            .collect();

        if resolved.iter().all(|(_, s)| *s == Similarity::Bm25) {
            return Ok(None);
        }

        let num_docs = searcher.num_docs().max(1) as f32;
        let mut total_tokens: HashMap<Field, u64> = HashMap::new();
        let mut weights = Vec::with_capacity(resolved.len());
        for (term, similarity) in resolved {
            let field = term.field();
            let doc_freq = searcher.doc_freq(&term)? as f32;
            let idf = match similarity {
                Similarity::Bm25 => {
                    (1.0 + (num_docs - doc_freq + 0.5) / (doc_freq + 0.5)).ln()
                }
                Similarity::TfIdf => {
                    1.0 + ((num_docs + 1.0) / (doc_freq + 1.0)).ln()
                }
                Similarity::Constant | Similarity::Tf => 1.0,
            };
            let tokens = match total_tokens.get(&field) {
                Some(tokens) => *tokens,
                None => {
                    let mut tokens = 0;
                    for segment_reader in searcher.segment_readers() {
                        tokens += segment_reader
                            .inverted_index(field)?
                            .total_num_tokens();
                    }
                    total_tokens.insert(field, tokens);
                    tokens
                }
            };
            let avg_len = (tokens as f32 / num_docs).max(1.0);
            weights.push(TermWeight {
                term,
                field,
                similarity,
                idf,
                avg_len,
            });
        }

        Ok(Some(Self(weights.into())))
    }

    pub(crate) fn for_segment(
        &self,
        segment_reader: &SegmentReader,
    ) -> SegmentScorer {
        let postings = self
            .0
            .iter()
            .map(|w| {
                segment_reader
                    .inverted_index(w.field)
                    .ok()
                    .and_then(|index| {
                        index
                            .read_postings(&w.term, IndexRecordOption::WithFreqs)
                            .ok()
                            .flatten()
                    })
            })
            .collect();
        let norms = self
            .0
            .iter()
            .map(|w| segment_reader.get_fieldnorms_reader(w.field).ok())
            .collect();
        SegmentScorer {
            weights: self.0.clone(),
            postings,
            norms,
        }
    }
}

/// Rescores the documents of one segment. Documents must be visited in
/// increasing order.
pub(crate) struct SegmentScorer {
    weights: Arc<[TermWeight]>,
    postings: Vec<Option<SegmentPostings>>,
    norms: Vec<Option<FieldNormReader>>,
}

impl SegmentScorer {
    pub(crate) fn score(&mut self, doc: DocId) -> Score {
        let mut score = 0.0;
        for ((weight, postings), norms) in self
            .weights
            .iter()
            .zip(self.postings.iter_mut())
            .zip(self.norms.iter())
        {
            let Some(postings) = postings.as_mut() else {
                continue;
            };
            if postings.doc() < doc {
                postings.seek(doc);
            }
            if postings.doc() != doc {
                continue;
            }
            let tf = postings.term_freq() as f32;
            let len = norms
                .as_ref()
                .map(|n| n.fieldnorm(doc) as f32)
                .unwrap_or(weight.avg_len);
            score += term_score(weight, tf, len);
        }
        score
    }
}

fn term_score(weight: &TermWeight, tf: f32, len: f32) -> Score {
    if tf <= 0.0 {
        return 0.0;
    }
    match weight.similarity {
        Similarity::Bm25 => {
            let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * len / weight.avg_len);
            weight.idf * (tf * (BM25_K1 + 1.0)) / (tf + norm)
        }
        Similarity::TfIdf => {
            tf.sqrt() * weight.idf * weight.idf / len.max(1.0).sqrt()
        }
        Similarity::Constant => 1.0,
        Similarity::Tf => tf,
    }
}
