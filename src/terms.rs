use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tantivy::{
    DocSet,
    Searcher,
    SegmentReader,
    TERMINATED,
    postings::Postings,
    schema::{Field, FieldType, IndexRecordOption},
};

use crate::{
    config::IndexConfig,
    error::{Error, Result},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermsRequest {
    pub field: String,
    /// 0 means every term.
    #[serde(default)]
    pub amount: usize,
    #[serde(default)]
    pub min_doc_freq: u64,
    #[serde(default)]
    pub min_term_freq: u64,
    /// Inclusive lower bound.
    #[serde(default)]
    pub start_term: Option<String>,
    /// Exclusive upper bound.
    #[serde(default)]
    pub end_term: Option<String>,
    /// When non-empty, only these terms are counted.
    #[serde(default)]
    pub include_terms: Vec<String>,
}

impl TermsRequest {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
            amount: 0,
            min_doc_freq: 0,
            min_term_freq: 0,
            start_term: None,
            end_term: None,
            include_terms: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermCount {
    pub term: String,
    pub doc_freq: u64,
    pub term_freq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermsResponse {
    pub field: String,
    pub terms: Vec<TermCount>,
}

type Counts = BTreeMap<String, (u64, u64)>;

fn segment_counts(
    segment_reader: &SegmentReader,
    field: Field,
    request: &TermsRequest,
) -> Result<Counts> {
    let inverted = segment_reader.inverted_index(field)?;
    let alive = segment_reader.alive_bitset();

    let mut range = inverted.terms().range();
    if let Some(start) = &request.start_term {
        range = range.ge(start.as_bytes());
    }
    if let Some(end) = &request.end_term {
        range = range.lt(end.as_bytes());
    }
    let mut stream = range.into_stream()?;

    let mut counts = Counts::new();
    while stream.advance() {
        let Ok(term) = std::str::from_utf8(stream.key()) else {
            continue;
        };
        if !request.include_terms.is_empty()
            && !request.include_terms.iter().any(|t| t == term)
        {
            continue;
        }
        let mut postings = inverted.read_postings_from_terminfo(
            stream.value(),
            IndexRecordOption::WithFreqs,
        )?;
        let (mut doc_freq, mut term_freq) = (0u64, 0u64);
        let mut doc = postings.doc();
        while doc != TERMINATED {
            if alive.is_none_or(|bits| bits.is_alive(doc)) {
                doc_freq += 1;
                term_freq += u64::from(postings.term_freq());
            }
            doc = postings.advance();
        }
        if doc_freq > 0 {
            counts.insert(term.to_string(), (doc_freq, term_freq));
        }
    }
    Ok(counts)
}

/// Document and term frequencies of a text field's terms, merged across
/// segments in term order. Deleted documents do not count.
pub(crate) fn term_counts(
    searcher: &Searcher,
    request: &TermsRequest,
) -> Result<TermsResponse> {
    let schema = searcher.schema();
    let field = schema
        .get_field(&request.field)
        .map_err(|_| Error::UnknownField(request.field.clone()))?;
    if !matches!(schema.get_field_entry(field).field_type(), FieldType::Str(_))
    {
        return Err(Error::InvalidRequest(format!(
            "terms are only available for text fields, not <{}>",
            request.field
        )));
    }

    let per_segment = searcher
        .segment_readers()
        .par_iter()
        .map(|segment_reader| segment_counts(segment_reader, field, request))
        .collect::<Result<Vec<_>>>()?;

    let mut merged = Counts::new();
    for counts in per_segment {
        for (term, (doc_freq, term_freq)) in counts {
            let entry = merged.entry(term).or_default();
            entry.0 += doc_freq;
            entry.1 += term_freq;
        }
    }

    let terms = merged
        .into_iter()
        .filter(|(_, (doc_freq, term_freq))| {
            *doc_freq >= request.min_doc_freq
                && *term_freq >= request.min_term_freq
        })
        .map(|(term, (doc_freq, term_freq))| TermCount {
            term,
            doc_freq,
            term_freq,
        });
    let terms = if request.amount > 0 {
        terms.take(request.amount).collect()
    } else {
        terms.collect()
    };

    Ok(TermsResponse {
        field: request.field.clone(),
        terms,
    })
}

/// User-visible fields of the index, sorted.
pub(crate) fn field_names(searcher: &Searcher) -> Vec<String> {
    let mut names: Vec<String> = searcher
        .schema()
        .fields()
        .map(|(_, entry)| entry.name())
        .filter(|name| !IndexConfig::is_internal_field(name))
        .map(str::to_string)
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use tantivy::{Index, IndexWriter, TantivyDocument, Term, schema::*};

    use super::*;

    fn searcher() -> Searcher {
        let mut builder = Schema::builder();
        let body = builder.add_text_field("body", TEXT);
        builder.add_i64_field("year", INDEXED);
        builder.add_text_field("_id", STRING);
        let index = Index::create_in_ram(builder.build());
        let mut writer: IndexWriter = index.writer(15_000_000).unwrap();
        for (i, text) in ["apple banana apple", "banana cherry", "date"]
            .iter()
            .enumerate()
        {
            let mut doc = TantivyDocument::default();
            doc.add_text(body, text);
            writer.add_document(doc).unwrap();
            // Spread documents over segments.
            if i == 0 {
                writer.commit().unwrap();
            }
        }
        writer.commit().unwrap();
        writer.delete_term(Term::from_field_text(body, "date"));
        writer.commit().unwrap();
        index.reader().unwrap().searcher()
    }

    #[test]
    fn counts_merge_across_segments() {
        let response =
            term_counts(&searcher(), &TermsRequest::new("body")).unwrap();
        let terms: Vec<_> = response
            .terms
            .iter()
            .map(|t| (t.term.as_str(), t.doc_freq, t.term_freq))
            .collect();
        assert_eq!(
            terms,
            vec![("apple", 1, 2), ("banana", 2, 2), ("cherry", 1, 1)]
        );
    }

    #[test]
    fn bounds_and_filters() {
        let searcher = searcher();
        let mut request = TermsRequest::new("body");
        request.start_term = Some("b".to_string());
        request.end_term = Some("c".to_string());
        let response = term_counts(&searcher, &request).unwrap();
        assert_eq!(response.terms.len(), 1);
        assert_eq!(response.terms[0].term, "banana");

        let mut request = TermsRequest::new("body");
        request.min_term_freq = 2;
        request.amount = 1;
        let response = term_counts(&searcher, &request).unwrap();
        assert_eq!(response.terms[0].term, "apple");
        assert_eq!(response.terms.len(), 1);

        let mut request = TermsRequest::new("body");
        request.include_terms = vec!["cherry".to_string()];
        let response = term_counts(&searcher, &request).unwrap();
        assert_eq!(response.terms.len(), 1);
    }

    #[test]
    fn unknown_and_non_text_fields() {
        let searcher = searcher();
        assert!(matches!(
            term_counts(&searcher, &TermsRequest::new("nope")),
            Err(Error::UnknownField(_))
        ));
        assert!(matches!(
            term_counts(&searcher, &TermsRequest::new("year")),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn internal_fields_are_hidden() {
        assert_eq!(field_names(&searcher()), vec!["body", "year"]);
    }
}
