use std::path::Path;

use tantivy::{
    Index,
    TantivyDocument,
    schema::*,
    tokenizer::{
        AsciiFoldingFilter,
        Language,
        LowerCaser,
        RawTokenizer,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        StopWordFilter,
        TextAnalyzer,
        Tokenizer,
        WhitespaceTokenizer,
    },
};

use crate::{
    config::{
        AnalyzerSettings,
        FieldType,
        IndexConfig,
        TokenFilterKind,
        TokenizerKind,
    },
    error::{Error, Result},
};

/// Names of the bookkeeping fields every shard schema carries.
pub mod fields {
    pub const ID: &str = "_id";
    pub const TIMESTAMP: &str = "_ts";
    pub const STORED_META: &str = "_meta";
    pub const STORED_DOC: &str = "_doc";
    pub const FACETS: &str = "_facets";
}

/// Resolved handles for the bookkeeping fields.
#[derive(Debug, Clone, Copy)]
pub struct ShardFields {
    pub id: Field,
    pub timestamp: Field,
    pub stored_meta: Field,
    pub stored_doc: Field,
    pub facets: Field,
}

impl ShardFields {
    pub fn resolve(schema: &Schema) -> Result<Self> {
        let f = |name: &str| {
            schema.get_field(name).map_err(|_| {
                Error::Config(format!("index is missing field <{name}>"))
            })
        };
        Ok(Self {
            id: f(fields::ID)?,
            timestamp: f(fields::TIMESTAMP)?,
            stored_meta: f(fields::STORED_META)?,
            stored_doc: f(fields::STORED_DOC)?,
            facets: f(fields::FACETS)?,
        })
    }
}

fn text_indexing(analyzer: &str) -> TextOptions {
    TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(analyzer)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    )
}

/// Build the schema for an index: bookkeeping fields plus one field per
/// declared index, sort and facet projection.
pub fn build_schema(config: &IndexConfig) -> Schema {
    let mut builder = Schema::builder();

    builder.add_text_field(fields::ID, STRING | STORED | FAST);
    builder.add_i64_field(fields::TIMESTAMP, INDEXED | STORED | FAST);
    builder.add_bytes_field(fields::STORED_META, STORED);
    builder.add_bytes_field(fields::STORED_DOC, STORED);
    builder.add_facet_field(fields::FACETS, FacetOptions::default());

    for field in config.field_configs() {
        for index_as in &field.index_as {
            let name = index_as.index_field_name.as_str();
            match field.field_type {
                FieldType::String | FieldType::Text => {
                    let analyzer = config
                        .analyzer_name_for_index_field(name)
                        .unwrap_or("default");
                    builder.add_text_field(name, text_indexing(analyzer));
                }
                FieldType::Bool => {
                    builder.add_bool_field(name, INDEXED);
                }
                FieldType::Int | FieldType::Long | FieldType::Date => {
                    builder.add_i64_field(name, INDEXED);
                }
                FieldType::Float | FieldType::Double => {
                    builder.add_f64_field(name, INDEXED);
                }
            }
        }

        // The sortable form lives in a columnar fast field.
        for sort_as in &field.sort_as {
            let name = sort_as.sort_field_name.as_str();
            match field.field_type {
                FieldType::String | FieldType::Text | FieldType::Bool => {
                    builder.add_text_field(name, STRING | FAST);
                }
                FieldType::Int | FieldType::Long | FieldType::Date => {
                    builder.add_i64_field(name, FAST);
                }
                FieldType::Float | FieldType::Double => {
                    builder.add_f64_field(name, FAST);
                }
            }
        }
    }

    builder.build()
}

/// Check that an existing on-disk schema can serve `config`.
///
/// Fields cannot be added or retyped once an index exists; fields the
/// config no longer mentions are left alone.
pub fn check_compatible(schema: &Schema, config: &IndexConfig) -> Result<()> {
    let expected = build_schema(config);
    for (_, entry) in expected.fields() {
        let name = entry.name();
        let existing = schema.get_field(name).map_err(|_| {
            Error::Config(format!(
                "field <{name}> cannot be added to an existing index"
            ))
        })?;
        if schema.get_field_entry(existing) != entry {
            return Err(Error::Config(format!(
                "field <{name}> changed type on an existing index"
            )));
        }
    }
    Ok(())
}

fn with_filters<T: Tokenizer>(
    tokenizer: T,
    filters: &[TokenFilterKind],
) -> TextAnalyzer {
    let mut builder = TextAnalyzer::builder(tokenizer).dynamic();
    for filter in filters {
        builder = match filter {
            TokenFilterKind::Lowercase => builder.filter_dynamic(LowerCaser),
            TokenFilterKind::AsciiFolding => {
                builder.filter_dynamic(AsciiFoldingFilter)
            }
            TokenFilterKind::EnglishStem => {
                builder.filter_dynamic(Stemmer::new(Language::English))
            }
            TokenFilterKind::EnglishStop => {
                match StopWordFilter::new(Language::English) {
                    Some(stop) => builder.filter_dynamic(stop),
                    None => builder,
                }
            }
            TokenFilterKind::RemoveLong { limit } => {
                builder.filter_dynamic(RemoveLongFilter::limit(*limit))
            }
        };
    }
    builder.build()
}

pub fn build_analyzer(settings: &AnalyzerSettings) -> TextAnalyzer {
    match settings.tokenizer {
        TokenizerKind::Standard => {
            with_filters(SimpleTokenizer::default(), &settings.filters)
        }
        TokenizerKind::Whitespace => {
            with_filters(WhitespaceTokenizer::default(), &settings.filters)
        }
        TokenizerKind::Keyword => {
            with_filters(RawTokenizer::default(), &settings.filters)
        }
    }
}

/// Register every analyzer the config knows under its name.
pub fn register_analyzers(index: &Index, config: &IndexConfig) {
    for settings in config.analyzers() {
        index
            .tokenizers()
            .register(&settings.name, build_analyzer(settings));
    }
}

/// Open or create an index at the given directory.
pub fn open_index(dir: &Path, config: &IndexConfig) -> Result<Index> {
    std::fs::create_dir_all(dir)?;

    let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
        .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
    let index = if Index::exists(&mmap_dir)
        .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
    {
        let index = Index::open(mmap_dir)?;
        check_compatible(&index.schema(), config)?;
        index
    } else {
        Index::create(
            mmap_dir,
            build_schema(config),
            tantivy::IndexSettings::default(),
        )?
    };

    register_analyzers(&index, config);
    Ok(index)
}

/// Create an in-memory index (for testing).
pub fn open_in_ram(config: &IndexConfig) -> Index {
    let index = Index::create_in_ram(build_schema(config));
    register_analyzers(&index, config);
    index
}

pub(crate) fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

pub(crate) fn extract_i64(doc: &TantivyDocument, field: Field) -> i64 {
    doc.get_first(field).and_then(|v| v.as_i64()).unwrap_or(0)
}

pub(crate) fn extract_bytes(
    doc: &TantivyDocument,
    field: Field,
) -> Option<&[u8]> {
    doc.get_first(field).and_then(|v| v.as_bytes())
}
