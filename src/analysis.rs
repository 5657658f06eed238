use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tantivy::{
    Searcher,
    Term,
    schema::Field,
    tokenizer::{TextAnalyzer, TokenStream},
};

use crate::{
    codec::{Document, value_text, values_at_path},
    error::Result,
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TermSort {
    /// Term frequency weighted by inverse document frequency.
    #[default]
    Tfidf,
    /// Raw term frequency.
    Abs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Stored field to analyze.
    pub field: String,
    #[serde(default)]
    pub analyzer_override: Option<String>,
    #[serde(default)]
    pub tokens: bool,
    #[serde(default)]
    pub doc_terms: bool,
    #[serde(default)]
    pub summary_terms: bool,
    /// 0 keeps every term.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default)]
    pub min_word_len: usize,
    /// 0 means no limit.
    #[serde(default)]
    pub max_word_len: usize,
    #[serde(default)]
    pub term_sort: TermSort,
}

fn default_top_n() -> usize {
    10
}

impl AnalysisRequest {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
            analyzer_override: None,
            tokens: false,
            doc_terms: false,
            summary_terms: false,
            top_n: default_top_n(),
            min_word_len: 0,
            max_word_len: 0,
            term_sort: TermSort::Tfidf,
        }
    }

    /// Whether anything has to be computed per returned document.
    pub fn per_document(&self) -> bool {
        self.tokens || self.doc_terms
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermScore {
    pub term: String,
    pub term_freq: u64,
    pub doc_freq: u64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analysis_request: AnalysisRequest,
    pub tokens: Vec<String>,
    pub terms: Vec<TermScore>,
}

/// Runs one analysis request over the documents of a response.
pub(crate) struct AnalysisHandler {
    request: AnalysisRequest,
    analyzer: TextAnalyzer,
    index_field: Option<Field>,
    searcher: Searcher,
    /// Term frequencies summed over every analyzed document.
    summary: HashMap<String, u64>,
}

impl AnalysisHandler {
    pub(crate) fn new(
        request: AnalysisRequest,
        analyzer: TextAnalyzer,
        index_field: Option<Field>,
        searcher: Searcher,
    ) -> Self {
        Self {
            request,
            analyzer,
            index_field,
            searcher,
            summary: HashMap::new(),
        }
    }

    fn keep(&self, token: &str) -> bool {
        let len = token.chars().count();
        len >= self.request.min_word_len
            && (self.request.max_word_len == 0
                || len <= self.request.max_word_len)
    }

    fn analyze(&mut self, document: &Document) -> Vec<String> {
        let texts: Vec<String> = values_at_path(document, &self.request.field)
            .into_iter()
            .filter_map(value_text)
            .collect();
        let mut tokens = Vec::new();
        for text in &texts {
            let mut stream = self.analyzer.token_stream(text);
            while stream.advance() {
                tokens.push(stream.token().text.clone());
            }
        }
        tokens.retain(|t| self.keep(t));
        tokens
    }

    /// Analyze one returned document. Summary terms are accumulated for
    /// [`AnalysisHandler::shard_result`]. `None` when the request asks for
    /// nothing per document.
    pub(crate) fn analyze_document(
        &mut self,
        document: &Document,
    ) -> Result<Option<AnalysisResult>> {
        let tokens = self.analyze(document);

        let mut counts: HashMap<String, u64> = HashMap::new();
        for token in &tokens {
            *counts.entry(token.clone()).or_default() += 1;
        }

        if self.request.summary_terms {
            for (term, count) in &counts {
                *self.summary.entry(term.clone()).or_default() += count;
            }
        }

        if !self.request.per_document() {
            return Ok(None);
        }

        let terms = if self.request.doc_terms {
            self.top_terms(counts.into_iter())?
        } else {
            Vec::new()
        };
        Ok(Some(AnalysisResult {
            analysis_request: self.request.clone(),
            tokens: if self.request.tokens { tokens } else { Vec::new() },
            terms,
        }))
    }

    /// Summary terms across every analyzed document, when requested.
    pub(crate) fn shard_result(&self) -> Result<Option<AnalysisResult>> {
        if !self.request.summary_terms {
            return Ok(None);
        }
        let counts = self
            .summary
            .iter()
            .map(|(term, term_freq)| (term.clone(), *term_freq));
        Ok(Some(AnalysisResult {
            analysis_request: self.request.clone(),
            tokens: Vec::new(),
            terms: self.top_terms(counts)?,
        }))
    }

    fn top_terms(
        &self,
        counts: impl Iterator<Item = (String, u64)>,
    ) -> Result<Vec<TermScore>> {
        let num_docs = self.searcher.num_docs().max(1) as f64;
        let mut terms = Vec::new();
        for (term, term_freq) in counts {
            let doc_freq = match self.index_field {
                Some(field) => self
                    .searcher
                    .doc_freq(&Term::from_field_text(field, &term))?,
                None => 0,
            };
            let score = match self.request.term_sort {
                TermSort::Abs => term_freq as f64,
                TermSort::Tfidf => {
                    let idf = (num_docs / (doc_freq as f64 + 1.0)).ln() + 1.0;
                    term_freq as f64 * idf
                }
            };
            terms.push(TermScore {
                term,
                term_freq,
                doc_freq,
                score,
            });
        }
        terms.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.term.cmp(&b.term))
        });
        if self.request.top_n > 0 {
            terms.truncate(self.request.top_n);
        }
        Ok(terms)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tantivy::{
        Index,
        schema::{SchemaBuilder, TEXT},
        tokenizer::{LowerCaser, SimpleTokenizer},
    };

    use super::*;

    fn handler(request: AnalysisRequest) -> AnalysisHandler {
        let mut builder = SchemaBuilder::new();
        builder.add_text_field("body", TEXT);
        let index = Index::create_in_ram(builder.build());
        let searcher = index.reader().unwrap().searcher();
        let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(LowerCaser)
            .build();
        AnalysisHandler::new(request, analyzer, None, searcher)
    }

    fn doc(value: serde_json::Value) -> Document {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn tokens_and_doc_terms() {
        let mut request = AnalysisRequest::new("body");
        request.tokens = true;
        request.doc_terms = true;
        request.term_sort = TermSort::Abs;
        request.min_word_len = 2;
        let mut handler = handler(request);

        let result = handler
            .analyze_document(&doc(json!({"body": "The cat and the Hat a"})))
            .unwrap()
            .unwrap();
        assert_eq!(result.tokens, vec!["the", "cat", "and", "the", "hat"]);
        assert_eq!(result.terms[0].term, "the");
        assert_eq!(result.terms[0].term_freq, 2);
        assert_eq!(result.terms[1].term, "and");
    }

    #[test]
    fn summary_accumulates_across_documents() {
        let mut request = AnalysisRequest::new("body");
        request.summary_terms = true;
        request.term_sort = TermSort::Abs;
        request.top_n = 1;
        let mut handler = handler(request);

        for text in ["red fish", "red cat", "blue fish red"] {
            let per_doc = handler
                .analyze_document(&doc(json!({ "body": text })))
                .unwrap();
            assert!(per_doc.is_none());
        }

        let summary = handler.shard_result().unwrap().unwrap();
        assert_eq!(summary.terms.len(), 1);
        assert_eq!(summary.terms[0].term, "red");
        assert_eq!(summary.terms[0].term_freq, 3);
    }

    #[test]
    fn max_word_len_filters() {
        let mut request = AnalysisRequest::new("body");
        request.tokens = true;
        request.max_word_len = 3;
        let mut handler = handler(request);
        let result = handler
            .analyze_document(&doc(json!({"body": "tiny enormous cat"})))
            .unwrap()
            .unwrap();
        assert_eq!(result.tokens, vec!["cat"]);
    }
}
