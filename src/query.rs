use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
};

use serde::{Deserialize, Serialize};
use tantivy::{
    Index,
    Term,
    query::{
        AllQuery,
        BooleanQuery,
        BoostQuery,
        FuzzyTermQuery,
        Occur,
        PhrasePrefixQuery,
        PhraseQuery,
        Query,
        QueryParser,
        RangeQuery,
        RegexQuery,
        TermQuery,
    },
    schema::{Field, FieldType as SchemaFieldType, IndexRecordOption, Schema},
};

use crate::{
    analysis::AnalysisRequest,
    cache::QueryCacheKey,
    error::{Error, Result},
    facet::FacetRequest,
    highlight::HighlightRequest,
    response::FetchType,
    similarity::Similarity,
    sort::{AfterCursor, SortRequest},
};

/// Largest edit distance a fuzzy query accepts.
pub const MAX_FUZZY_DISTANCE: u8 = 2;

/// A query over the shard's index fields, compiled to a tantivy query at
/// search time.
///
/// Values are matched as indexed terms and are not analyzed, except in
/// [`QueryNode::Parsed`]. Numeric and boolean values are given as text
/// and converted to the field's type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryNode {
    All,
    Term {
        field: String,
        value: String,
    },
    Phrase {
        field: String,
        terms: Vec<String>,
        #[serde(default)]
        slop: u32,
    },
    Prefix {
        field: String,
        prefix: String,
    },
    Fuzzy {
        field: String,
        value: String,
        distance: u8,
        /// Match terms that start with a fuzzy match of `value`.
        #[serde(default)]
        prefix: bool,
    },
    /// Terms fully matching `pattern`.
    Regex {
        field: String,
        pattern: String,
    },
    /// Inclusive bounds; a missing bound is open.
    Range {
        field: String,
        lower: Option<String>,
        upper: Option<String>,
    },
    Bool {
        #[serde(default)]
        must: Vec<QueryNode>,
        #[serde(default)]
        should: Vec<QueryNode>,
        #[serde(default)]
        must_not: Vec<QueryNode>,
    },
    Boost {
        query: Box<QueryNode>,
        boost: f32,
    },
    /// Query syntax text, analyzed with each field's analyzer. An empty
    /// `default_fields` searches every analyzed text field.
    Parsed {
        text: String,
        #[serde(default)]
        default_fields: Vec<String>,
    },
}

impl QueryNode {
    pub fn term(field: &str, value: &str) -> Self {
        QueryNode::Term {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn phrase(field: &str, terms: &[&str]) -> Self {
        QueryNode::Phrase {
            field: field.to_string(),
            terms: terms.iter().map(|t| t.to_string()).collect(),
            slop: 0,
        }
    }

    pub fn prefix(field: &str, prefix: &str) -> Self {
        QueryNode::Prefix {
            field: field.to_string(),
            prefix: prefix.to_string(),
        }
    }

    pub fn fuzzy(field: &str, value: &str, distance: u8) -> Self {
        QueryNode::Fuzzy {
            field: field.to_string(),
            value: value.to_string(),
            distance,
            prefix: false,
        }
    }

    pub fn regex(field: &str, pattern: &str) -> Self {
        QueryNode::Regex {
            field: field.to_string(),
            pattern: pattern.to_string(),
        }
    }

    pub fn range(
        field: &str,
        lower: Option<&str>,
        upper: Option<&str>,
    ) -> Self {
        QueryNode::Range {
            field: field.to_string(),
            lower: lower.map(str::to_string),
            upper: upper.map(str::to_string),
        }
    }

    pub fn parsed(text: &str) -> Self {
        QueryNode::Parsed {
            text: text.to_string(),
            default_fields: Vec::new(),
        }
    }

    pub fn boost(self, boost: f32) -> Self {
        QueryNode::Boost {
            query: Box::new(self),
            boost,
        }
    }

    /// Compile against `index`. Fails on unknown fields, values that do
    /// not convert to the field type and malformed patterns.
    pub fn build(&self, index: &Index) -> Result<Box<dyn Query>> {
        let schema = index.schema();
        Ok(match self {
            QueryNode::All => Box::new(AllQuery),
            QueryNode::Term { field, value } => Box::new(TermQuery::new(
                term(&schema, field, value)?,
                IndexRecordOption::WithFreqs,
            )),
            QueryNode::Phrase { field, terms, slop } => {
                let mut terms = terms
                    .iter()
                    .map(|value| text_term(&schema, field, value))
                    .collect::<Result<Vec<_>>>()?;
                match terms.len() {
                    0 => {
                        return Err(Error::InvalidRequest(format!(
                            "phrase on <{field}> has no terms"
                        )));
                    }
                    1 => Box::new(TermQuery::new(
                        terms.remove(0),
                        IndexRecordOption::WithFreqs,
                    )),
                    _ => {
                        let mut phrase = PhraseQuery::new(terms);
                        phrase.set_slop(*slop);
                        Box::new(phrase)
                    }
                }
            }
            QueryNode::Prefix { field, prefix } => {
                let mut query = PhrasePrefixQuery::new(vec![text_term(
                    &schema, field, prefix,
                )?]);
                query.set_max_expansions(u32::MAX);
                Box::new(query)
            }
            QueryNode::Fuzzy {
                field,
                value,
                distance,
                prefix,
            } => {
                if *distance > MAX_FUZZY_DISTANCE {
                    return Err(Error::InvalidRequest(format!(
                        "fuzzy distance {distance} on <{field}> exceeds \
                         {MAX_FUZZY_DISTANCE}"
                    )));
                }
                let term = text_term(&schema, field, value)?;
                if *prefix {
                    Box::new(FuzzyTermQuery::new_prefix(term, *distance, true))
                } else {
                    Box::new(FuzzyTermQuery::new(term, *distance, true))
                }
            }
            QueryNode::Regex { field, pattern } => {
                let field = text_field(&schema, field)?;
                Box::new(RegexQuery::from_pattern(pattern, field).map_err(
                    |e| Error::InvalidRequest(format!("bad pattern: {e}")),
                )?)
            }
            QueryNode::Range {
                field,
                lower,
                upper,
            } => {
                let bound = |value: &Option<String>| -> Result<Bound<Term>> {
                    Ok(match value {
                        Some(value) => {
                            Bound::Included(term(&schema, field, value)?)
                        }
                        None => Bound::Unbounded,
                    })
                };
                if lower.is_none() && upper.is_none() {
                    return Err(Error::InvalidRequest(format!(
                        "range on <{field}> needs at least one bound"
                    )));
                }
                Box::new(RangeQuery::new(bound(lower)?, bound(upper)?))
            }
            QueryNode::Bool {
                must,
                should,
                must_not,
            } => {
                let mut clauses = Vec::new();
                for (occur, nodes) in [
                    (Occur::Must, must),
                    (Occur::Should, should),
                    (Occur::MustNot, must_not),
                ] {
                    for node in nodes {
                        clauses.push((occur, node.build(index)?));
                    }
                }
                Box::new(BooleanQuery::new(clauses))
            }
            QueryNode::Boost { query, boost } => {
                Box::new(BoostQuery::new(query.build(index)?, *boost))
            }
            QueryNode::Parsed {
                text,
                default_fields,
            } => {
                let fields = if default_fields.is_empty() {
                    schema
                        .fields()
                        .filter(|(_, entry)| {
                            entry
                                .field_type()
                                .get_index_record_option()
                                .is_some_and(IndexRecordOption::has_positions)
                        })
                        .map(|(field, _)| field)
                        .collect()
                } else {
                    default_fields
                        .iter()
                        .map(|name| field_of(&schema, name))
                        .collect::<Result<Vec<_>>>()?
                };
                QueryParser::for_index(index, fields).parse_query(text)?
            }
        })
    }

    /// Visit this node and every node nested in it.
    pub fn visit<'a>(&'a self, visitor: &mut dyn FnMut(&'a QueryNode)) {
        visitor(self);
        match self {
            QueryNode::Bool {
                must,
                should,
                must_not,
            } => {
                for node in must.iter().chain(should).chain(must_not) {
                    node.visit(visitor);
                }
            }
            QueryNode::Boost { query, .. } => query.visit(visitor),
            _ => {}
        }
    }
}

fn field_of(schema: &Schema, name: &str) -> Result<Field> {
    schema
        .get_field(name)
        .map_err(|_| Error::UnknownField(name.to_string()))
}

fn text_field(schema: &Schema, name: &str) -> Result<Field> {
    let field = field_of(schema, name)?;
    match schema.get_field_entry(field).field_type() {
        SchemaFieldType::Str(_) => Ok(field),
        _ => Err(Error::InvalidRequest(format!(
            "field <{name}> is not a text field"
        ))),
    }
}

fn text_term(schema: &Schema, name: &str, value: &str) -> Result<Term> {
    Ok(Term::from_field_text(text_field(schema, name)?, value))
}

/// Term for `value` converted to the type of field `name`.
fn term(schema: &Schema, name: &str, value: &str) -> Result<Term> {
    let field = field_of(schema, name)?;
    let invalid = || {
        Error::InvalidRequest(format!(
            "value <{value}> does not fit field <{name}>"
        ))
    };
    let trimmed = value.trim();
    Ok(match schema.get_field_entry(field).field_type() {
        SchemaFieldType::Str(_) => Term::from_field_text(field, value),
        SchemaFieldType::I64(_) => Term::from_field_i64(
            field,
            trimmed.parse().map_err(|_| invalid())?,
        ),
        SchemaFieldType::F64(_) => Term::from_field_f64(
            field,
            trimmed.parse().map_err(|_| invalid())?,
        ),
        SchemaFieldType::Bool(_) => Term::from_field_bool(
            field,
            trimmed.parse().map_err(|_| invalid())?,
        ),
        _ => return Err(invalid()),
    })
}

/// Everything one shard needs to answer a query.
#[derive(Debug, Clone)]
pub struct ShardQuery {
    pub query: QueryNode,
    pub amount: usize,
    pub after: Option<AfterCursor>,
    /// Similarity per index field, overriding the configured one.
    pub similarity_overrides: HashMap<String, Similarity>,
    pub sort_request: SortRequest,
    pub facet_request: FacetRequest,
    pub highlight_requests: Vec<HighlightRequest>,
    pub analysis_requests: Vec<AnalysisRequest>,
    pub fetch_type: FetchType,
    pub fields_to_return: Vec<String>,
    pub fields_to_mask: Vec<String>,
    /// Log the query and its scoring setup.
    pub debug: bool,
    /// When false the result cache is bypassed.
    pub cacheable: bool,
}

#[derive(Serialize)]
struct CacheKeyParts<'a> {
    query: &'a QueryNode,
    amount: usize,
    after: &'a Option<AfterCursor>,
    similarity_overrides: BTreeMap<&'a str, Similarity>,
    sort_request: &'a SortRequest,
    facet_request: &'a FacetRequest,
    highlight_requests: &'a [HighlightRequest],
    analysis_requests: &'a [AnalysisRequest],
    fetch_type: FetchType,
    fields_to_return: &'a [String],
    fields_to_mask: &'a [String],
}

impl ShardQuery {
    pub fn new(query: QueryNode, amount: usize) -> Self {
        Self {
            query,
            amount,
            after: None,
            similarity_overrides: HashMap::new(),
            sort_request: SortRequest::default(),
            facet_request: FacetRequest::default(),
            highlight_requests: Vec::new(),
            analysis_requests: Vec::new(),
            fetch_type: FetchType::Full,
            fields_to_return: Vec::new(),
            fields_to_mask: Vec::new(),
            debug: false,
            cacheable: true,
        }
    }

    pub fn with_after(mut self, after: AfterCursor) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_similarity(
        mut self,
        field: &str,
        similarity: Similarity,
    ) -> Self {
        self.similarity_overrides.insert(field.to_string(), similarity);
        self
    }

    pub fn with_sort(mut self, sort_request: SortRequest) -> Self {
        self.sort_request = sort_request;
        self
    }

    pub fn with_facets(mut self, facet_request: FacetRequest) -> Self {
        self.facet_request = facet_request;
        self
    }

    pub fn with_highlight(mut self, request: HighlightRequest) -> Self {
        self.highlight_requests.push(request);
        self
    }

    pub fn with_analysis(mut self, request: AnalysisRequest) -> Self {
        self.analysis_requests.push(request);
        self
    }

    pub fn with_fetch_type(mut self, fetch_type: FetchType) -> Self {
        self.fetch_type = fetch_type;
        self
    }

    pub fn with_fields_to_return(mut self, fields: Vec<String>) -> Self {
        self.fields_to_return = fields;
        self
    }

    pub fn with_fields_to_mask(mut self, fields: Vec<String>) -> Self {
        self.fields_to_mask = fields;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Fingerprint of every parameter that shapes the response. `None`
    /// when the query must not be cached.
    pub fn cache_key(&self) -> Option<QueryCacheKey> {
        if !self.cacheable {
            return None;
        }
        QueryCacheKey::from_parts(&CacheKeyParts {
            query: &self.query,
            amount: self.amount,
            after: &self.after,
            similarity_overrides: self
                .similarity_overrides
                .iter()
                .map(|(k, v)| (k.as_str(), *v))
                .collect(),
            sort_request: &self.sort_request,
            facet_request: &self.facet_request,
            highlight_requests: &self.highlight_requests,
            analysis_requests: &self.analysis_requests,
            fetch_type: self.fetch_type,
            fields_to_return: &self.fields_to_return,
            fields_to_mask: &self.fields_to_mask,
        })
    }
}
