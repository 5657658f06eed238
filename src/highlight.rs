use std::collections::HashSet;

use levenshtein_automata::{DFA, Distance, LevenshteinAutomatonBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tantivy::{
    Searcher,
    query::Query,
    tokenizer::{TextAnalyzer, TokenStream},
};

use crate::{
    codec::{Document, value_text, values_at_path},
    error::{Error, Result},
    query::QueryNode,
};

pub const DEFAULT_PRE_TAG: &str = "<em>";
pub const DEFAULT_POST_TAG: &str = "</em>";
pub const DEFAULT_FRAGMENT_LENGTH: usize = 100;
/// Most index terms a prefix, fuzzy or regex node contributes.
pub const MAX_EXPANSIONS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightRequest {
    /// Index field whose query terms are highlighted.
    pub field: String,
    #[serde(default = "default_pre_tag")]
    pub pre_tag: String,
    #[serde(default = "default_post_tag")]
    pub post_tag: String,
    #[serde(default = "default_number_of_fragments")]
    pub number_of_fragments: usize,
    /// Approximate fragment size in bytes. 0 keeps each value whole.
    #[serde(default = "default_fragment_length")]
    pub fragment_length: usize,
}

fn default_pre_tag() -> String {
    DEFAULT_PRE_TAG.to_string()
}

fn default_post_tag() -> String {
    DEFAULT_POST_TAG.to_string()
}

fn default_number_of_fragments() -> usize {
    1
}

fn default_fragment_length() -> usize {
    DEFAULT_FRAGMENT_LENGTH
}

impl HighlightRequest {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
            pre_tag: default_pre_tag(),
            post_tag: default_post_tag(),
            number_of_fragments: default_number_of_fragments(),
            fragment_length: default_fragment_length(),
        }
    }

    pub fn with_tags(mut self, pre_tag: &str, post_tag: &str) -> Self {
        self.pre_tag = pre_tag.to_string();
        self.post_tag = post_tag.to_string();
        self
    }

    pub fn with_fragments(
        mut self,
        number_of_fragments: usize,
        fragment_length: usize,
    ) -> Self {
        self.number_of_fragments = number_of_fragments;
        self.fragment_length = fragment_length;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightResult {
    /// Stored field the fragments were cut from.
    pub field: String,
    pub fragments: Vec<String>,
}

/// A scored piece of text with its matches wrapped in tags.
#[derive(Debug, Clone, PartialEq)]
pub struct TextFragment {
    pub text: String,
    pub score: f32,
}

struct HighlightToken {
    from: usize,
    to: usize,
    position: usize,
    matched: Option<String>,
}

/// Highlights one request's query terms in stored field values.
pub(crate) struct Highlighter {
    request: HighlightRequest,
    stored_field: Option<String>,
    terms: HashSet<String>,
    analyzer: TextAnalyzer,
}

/// Matches index terms for a node that stands for many terms.
enum TermPattern {
    Prefix(String),
    Fuzzy(DFA, u8),
    Regex(Regex),
}

impl TermPattern {
    fn from_node(node: &QueryNode, field: &str) -> Result<Option<Self>> {
        Ok(match node {
            QueryNode::Prefix { field: f, prefix } if f == field => {
                Some(TermPattern::Prefix(prefix.clone()))
            }
            QueryNode::Fuzzy {
                field: f,
                value,
                distance,
                prefix,
            } if f == field => {
                let builder = LevenshteinAutomatonBuilder::new(*distance, true);
                let dfa = if *prefix {
                    builder.build_prefix_dfa(value)
                } else {
                    builder.build_dfa(value)
                };
                Some(TermPattern::Fuzzy(dfa, *distance))
            }
            QueryNode::Regex { field: f, pattern } if f == field => {
                let regex = Regex::new(&format!("^(?:{pattern})$"))
                    .map_err(|e| {
                        Error::InvalidRequest(format!("bad pattern: {e}"))
                    })?;
                Some(TermPattern::Regex(regex))
            }
            _ => None,
        })
    }

    fn matches(&self, term: &str) -> bool {
        match self {
            TermPattern::Prefix(prefix) => term.starts_with(prefix.as_str()),
            TermPattern::Fuzzy(dfa, distance) => {
                matches!(dfa.eval(term), Distance::Exact(d) if d <= *distance)
            }
            TermPattern::Regex(regex) => regex.is_match(term),
        }
    }
}

/// Text terms of `query` on index field `field`. Prefix, fuzzy and regex
/// nodes of `node` are expanded against the segment term dictionaries.
pub(crate) fn highlight_terms(
    query: &dyn Query,
    node: &QueryNode,
    searcher: &Searcher,
    field: &str,
) -> Result<HashSet<String>> {
    let mut terms = HashSet::new();
    let Ok(index_field) = searcher.schema().get_field(field) else {
        return Ok(terms);
    };
    query.query_terms(&mut |term, _| {
        if term.field() == index_field
            && let Some(text) = term.value().as_str()
        {
            terms.insert(text.to_string());
        }
    });

    let mut patterns = Vec::new();
    let mut failed = None;
    node.visit(&mut |n| match TermPattern::from_node(n, field) {
        Ok(Some(pattern)) => patterns.push(pattern),
        Ok(None) => {}
        Err(e) => failed = Some(e),
    });
    if let Some(e) = failed {
        return Err(e);
    }

    let mut expanded = 0;
    for pattern in &patterns {
        for segment_reader in searcher.segment_readers() {
            let inverted = segment_reader.inverted_index(index_field)?;
            let dictionary = inverted.terms();
            let mut stream = match pattern {
                TermPattern::Prefix(prefix) => {
                    dictionary.range().ge(prefix.as_bytes()).into_stream()?
                }
                _ => dictionary.stream()?,
            };
            while expanded < MAX_EXPANSIONS && stream.advance() {
                let Ok(term) = std::str::from_utf8(stream.key()) else {
                    continue;
                };
                if pattern.matches(term) {
                    if terms.insert(term.to_string()) {
                        expanded += 1;
                    }
                } else if matches!(pattern, TermPattern::Prefix(_)) {
                    break;
                }
            }
        }
    }
    Ok(terms)
}

impl Highlighter {
    /// `terms` are the indexed terms to highlight, as produced by
    /// [`highlight_terms`].
    pub(crate) fn new(
        request: HighlightRequest,
        stored_field: Option<String>,
        terms: HashSet<String>,
        analyzer: TextAnalyzer,
    ) -> Self {
        Self {
            request,
            stored_field,
            terms,
            analyzer,
        }
    }

    /// Highlight every value of the stored field. `None` when the index
    /// field is not fed from a stored field.
    pub(crate) fn highlight(
        &mut self,
        document: &Document,
    ) -> Option<HighlightResult> {
        let stored_field = self.stored_field.clone()?;
        let texts: Vec<String> = values_at_path(document, &stored_field)
            .into_iter()
            .filter_map(value_text)
            .collect();
        let fragments = texts
            .iter()
            .flat_map(|text| self.best_fragments(text))
            .map(|fragment| fragment.text)
            .collect();
        Some(HighlightResult {
            field: stored_field,
            fragments,
        })
    }

    fn tokens(&mut self, text: &str) -> Vec<HighlightToken> {
        let mut stream = self.analyzer.token_stream(text);
        let mut tokens = Vec::new();
        while stream.advance() {
            let token = stream.token();
            let matched = self
                .terms
                .contains(&token.text)
                .then(|| token.text.clone());
            tokens.push(HighlightToken {
                from: token.offset_from,
                to: token.offset_to,
                position: token.position,
                matched,
            });
        }
        tokens
    }

    /// Up to `number_of_fragments` fragments with at least one match, best
    /// first. A fragment scores one point per distinct matched term.
    pub fn best_fragments(&mut self, text: &str) -> Vec<TextFragment> {
        if self.terms.is_empty() || self.request.number_of_fragments == 0 {
            return Vec::new();
        }
        let tokens = self.tokens(text);

        // Fragment boundaries, never splitting a run of adjacent matches.
        let mut bounds = vec![(0usize, 0usize)];
        let mut start = 0;
        for (i, token) in tokens.iter().enumerate() {
            let in_span = i > 0
                && token.matched.is_some()
                && tokens[i - 1].matched.is_some()
                && tokens[i - 1].position + 1 == token.position;
            if self.request.fragment_length > 0
                && token.from >= start + self.request.fragment_length
                && !in_span
            {
                start = token.from;
                bounds.push((start, i));
            }
        }

        let mut fragments = Vec::with_capacity(bounds.len());
        for (n, &(from, first_token)) in bounds.iter().enumerate() {
            let (to, last_token) = match bounds.get(n + 1) {
                Some(&(next, next_token)) => (next, next_token),
                None => (text.len(), tokens.len()),
            };
            let window = &tokens[first_token..last_token];
            let distinct: HashSet<&str> = window
                .iter()
                .filter_map(|t| t.matched.as_deref())
                .collect();
            if distinct.is_empty() {
                continue;
            }
            fragments.push((
                from,
                TextFragment {
                    text: self.render(text, from, to, window),
                    score: distinct.len() as f32,
                },
            ));
        }

        fragments.sort_by(|(a_start, a), (b_start, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a_start.cmp(b_start))
        });
        fragments.truncate(self.request.number_of_fragments);
        fragments.into_iter().map(|(_, f)| f).collect()
    }

    fn render(
        &self,
        text: &str,
        from: usize,
        to: usize,
        tokens: &[HighlightToken],
    ) -> String {
        let mut out = String::with_capacity(to - from + 16);
        let mut cursor = from;
        for token in tokens.iter().filter(|t| t.matched.is_some()) {
            if token.from < cursor || token.to > to {
                continue;
            }
            out.push_str(&text[cursor..token.from]);
            out.push_str(&self.request.pre_tag);
            out.push_str(&text[token.from..token.to]);
            out.push_str(&self.request.post_tag);
            cursor = token.to;
        }
        out.push_str(&text[cursor..to]);
        out
    }
}

#[cfg(test)]
mod tests {
    use tantivy::{
        Index,
        IndexWriter,
        TantivyDocument,
        schema::{SchemaBuilder, TEXT},
        tokenizer::{LowerCaser, SimpleTokenizer},
    };

    use super::*;

    fn highlighter(request: HighlightRequest, words: &[&str]) -> Highlighter {
        let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(LowerCaser)
            .build();
        Highlighter::new(
            request,
            Some("body".to_string()),
            words.iter().map(|w| w.to_string()).collect(),
            analyzer,
        )
    }

    #[test]
    fn wraps_matches_in_tags() {
        let mut h = highlighter(HighlightRequest::new("body"), &["fox"]);
        let fragments = h.best_fragments("The quick brown Fox jumps");
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].text, "The quick brown <em>Fox</em> jumps");
        assert_eq!(fragments[0].score, 1.0);
    }

    #[test]
    fn no_match_no_fragment() {
        let mut h = highlighter(HighlightRequest::new("body"), &["wolf"]);
        assert!(h.best_fragments("The quick brown fox").is_empty());
    }

    #[test]
    fn best_fragment_has_most_distinct_terms() {
        let request = HighlightRequest::new("body")
            .with_tags("[", "]")
            .with_fragments(2, 20);
        let mut h = highlighter(request, &["red", "fox"]);
        let text =
            "a red bird sat down. then a red fox ran off. nothing else here";
        let fragments = h.best_fragments(text);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].score, 2.0);
        assert!(fragments[0].text.contains("[red] [fox]"));
        assert!(fragments.iter().all(|f| f.score > 0.0));
    }

    #[test]
    fn fragment_count_is_bounded() {
        let request = HighlightRequest::new("body").with_fragments(1, 10);
        let mut h = highlighter(request, &["cat"]);
        let fragments =
            h.best_fragments("cat one two three cat four five six cat");
        assert_eq!(fragments.len(), 1);
    }

    #[test]
    fn adjacent_matches_stay_together() {
        let request = HighlightRequest::new("body").with_fragments(3, 4);
        let mut h = highlighter(request, &["new", "york"]);
        let fragments = h.best_fragments("new york");
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].text, "<em>new</em> <em>york</em>");
    }

    #[test]
    fn highlights_document_values() {
        let mut h = highlighter(HighlightRequest::new("body"), &["rust"]);
        let value = serde_json::json!({"body": ["rust is fast", "go"]});
        let document = match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let result = h.highlight(&document).unwrap();
        assert_eq!(result.field, "body");
        assert_eq!(result.fragments, vec!["<em>rust</em> is fast"]);
    }

    fn searcher(texts: &[&str]) -> Searcher {
        let mut builder = SchemaBuilder::new();
        let body = builder.add_text_field("body", TEXT);
        let index = Index::create_in_ram(builder.build());
        let mut writer: IndexWriter = index.writer(15_000_000).unwrap();
        for text in texts {
            let mut doc = TantivyDocument::default();
            doc.add_text(body, text);
            writer.add_document(doc).unwrap();
            writer.commit().unwrap();
        }
        index.reader().unwrap().searcher()
    }

    fn terms_for(node: QueryNode, searcher: &Searcher) -> Vec<String> {
        let query = node.build(searcher.index()).unwrap();
        let mut terms: Vec<_> =
            highlight_terms(query.as_ref(), &node, searcher, "body")
                .unwrap()
                .into_iter()
                .collect();
        terms.sort();
        terms
    }

    #[test]
    fn multi_term_nodes_expand_across_segments() {
        let searcher = searcher(&["darkness falls", "dark water", "dune"]);
        assert_eq!(
            terms_for(QueryNode::prefix("body", "dar"), &searcher),
            vec!["dark", "darkness"]
        );
        assert_eq!(
            terms_for(QueryNode::fuzzy("body", "dane", 1), &searcher),
            vec!["dune"]
        );
        assert_eq!(
            terms_for(QueryNode::regex("body", "[dw]a.*r"), &searcher),
            vec!["water"]
        );
        assert_eq!(
            terms_for(QueryNode::term("body", "dune"), &searcher),
            vec!["dune"]
        );
    }

    #[test]
    fn expanded_terms_are_highlighted() {
        let searcher = searcher(&["the left hand of darkness"]);
        let node = QueryNode::Bool {
            must: vec![QueryNode::prefix("body", "dark")],
            should: vec![QueryNode::term("body", "left")],
            must_not: Vec::new(),
        };
        let query = node.build(searcher.index()).unwrap();
        let terms =
            highlight_terms(query.as_ref(), &node, &searcher, "body").unwrap();
        let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(LowerCaser)
            .build();
        let mut h = Highlighter::new(
            HighlightRequest::new("body").with_tags("[", "]"),
            Some("body".to_string()),
            terms,
            analyzer,
        );
        let fragments = h.best_fragments("The Left Hand of Darkness");
        assert_eq!(fragments[0].text, "The [Left] Hand of [Darkness]");
    }
}
