use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tantivy::{
    Index,
    IndexWriter,
    TantivyDocument,
    Term,
    index::SegmentId,
    schema::{Field, FieldType as SchemaFieldType, Schema},
    tokenizer::TextAnalyzer,
};
use tracing::{debug, warn};

use crate::{
    codec::{Document, DocumentCodec, value_text, values_at_path},
    config::{FieldType, IndexConfig},
    error::{Error, Result},
    facet::facet_path,
    response::Metadata,
    schema::{self, ShardFields},
};

/// Sole owner of the shard's index writer. Every mutation goes through
/// its lock.
pub struct WriterManager {
    index: Index,
    fields: ShardFields,
    config: RwLock<Arc<IndexConfig>>,
    writer: Mutex<Option<IndexWriter>>,
    /// Count of successful commits since the writer was opened.
    commits: Arc<AtomicU64>,
    codec: Arc<dyn DocumentCodec>,
    shard_number: u32,
}

impl WriterManager {
    pub fn new(
        index: Index,
        config: Arc<IndexConfig>,
        codec: Arc<dyn DocumentCodec>,
        shard_number: u32,
    ) -> Result<Self> {
        let fields = ShardFields::resolve(&index.schema())?;
        let writer: IndexWriter =
            index.writer(config.settings().writer_memory_budget)?;
        Ok(Self {
            index,
            fields,
            config: RwLock::new(config),
            writer: Mutex::new(Some(writer)),
            commits: Arc::new(AtomicU64::new(0)),
            codec,
            shard_number,
        })
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn fields(&self) -> ShardFields {
        self.fields
    }

    pub fn codec(&self) -> &Arc<dyn DocumentCodec> {
        &self.codec
    }

    /// Sequence number of the last commit, shared with the reader side.
    ///
    /// Opstamps cannot serve here: deleting every document rolls the
    /// writer's opstamp back to the last committed one.
    pub fn commit_watermark(&self) -> Arc<AtomicU64> {
        self.commits.clone()
    }

    fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut IndexWriter) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or_else(|| Error::Closed {
            index: self.config.read().index_name().to_string(),
            shard: self.shard_number,
        })?;
        f(writer)
    }

    /// Replace any document with the same id.
    pub fn index_document(
        &self,
        id: &str,
        timestamp: i64,
        document: &Document,
        metadata: &[Metadata],
    ) -> Result<()> {
        let doc = self.build_document(id, timestamp, document, metadata)?;
        self.with_writer(|writer| {
            writer.delete_term(Term::from_field_text(self.fields.id, id));
            writer.add_document(doc)?;
            Ok(())
        })
    }

    fn build_document(
        &self,
        id: &str,
        timestamp: i64,
        document: &Document,
        metadata: &[Metadata],
    ) -> Result<TantivyDocument> {
        let config = self.config.read().clone();
        let schema = self.index.schema();

        let mut doc = TantivyDocument::default();
        doc.add_text(self.fields.id, id);
        doc.add_i64(self.fields.timestamp, timestamp);
        let meta = serde_json::to_vec(metadata)?;
        doc.add_bytes(self.fields.stored_meta, &meta);
        doc.add_bytes(self.fields.stored_doc, &self.codec.encode(document)?);

        for field_config in config.field_configs() {
            let values =
                values_at_path(document, &field_config.stored_field_name);
            if values.is_empty() {
                continue;
            }
            let targets = field_config
                .index_as
                .iter()
                .map(|i| i.index_field_name.as_str())
                .chain(
                    field_config
                        .sort_as
                        .iter()
                        .map(|s| s.sort_field_name.as_str()),
                );
            for name in targets {
                let Ok(field) = schema.get_field(name) else {
                    continue;
                };
                for value in &values {
                    add_value(
                        &mut doc,
                        &schema,
                        field,
                        field_config.field_type,
                        value,
                    );
                }
            }
            for facet_as in &field_config.facet_as {
                for value in values.iter().filter_map(|v| value_text(v)) {
                    doc.add_facet(
                        self.fields.facets,
                        facet_path(&facet_as.facet_name, &value),
                    );
                }
            }
        }
        Ok(doc)
    }

    pub fn delete_documents(&self, id: &str) -> Result<()> {
        self.with_writer(|writer| {
            writer.delete_term(Term::from_field_text(self.fields.id, id));
            Ok(())
        })
    }

    pub fn delete_all(&self) -> Result<()> {
        self.with_writer(|writer| {
            writer.delete_all_documents()?;
            Ok(())
        })
    }

    fn commit_locked(&self, writer: &mut IndexWriter) -> Result<u64> {
        let opstamp = writer.commit()?;
        let sequence = self.commits.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            opstamp,
            sequence,
            shard = self.shard_number,
            "Committed index writer"
        );
        Ok(sequence)
    }

    /// Commit pending changes and return the new commit sequence number.
    pub fn commit(&self) -> Result<u64> {
        self.with_writer(|writer| self.commit_locked(writer))
    }

    /// Commit, then merge the smallest segments until at most
    /// `max_segments` remain.
    pub fn force_merge(&self, max_segments: usize) -> Result<()> {
        let max_segments = max_segments.max(1);
        self.with_writer(|writer| {
            self.commit_locked(writer)?;
            let mut metas = self.index.searchable_segment_metas()?;
            if metas.len() <= max_segments {
                return Ok(());
            }
            metas.sort_by_key(|meta| meta.num_docs());
            let merge_count = metas.len() - max_segments + 1;
            let ids: Vec<SegmentId> =
                metas.iter().take(merge_count).map(|m| m.id()).collect();
            debug!(
                segments = ids.len(),
                shard = self.shard_number,
                "Merging segments"
            );
            writer.merge(&ids).wait()?;
            Ok(())
        })
    }

    /// Swap in a new configuration. Analyzers are re-registered; the
    /// schema itself cannot change.
    pub fn update_index_setting(
        &self,
        config: Arc<IndexConfig>,
    ) -> Result<()> {
        schema::check_compatible(&self.index.schema(), &config)?;
        schema::register_analyzers(&self.index, &config);
        *self.config.write() = config;
        Ok(())
    }

    /// Analyzer registered under `name`.
    pub fn analyzer(&self, name: &str) -> Result<TextAnalyzer> {
        let config = self.config.read();
        if config.analyzer_settings_by_name(name).is_none() {
            return Err(Error::UnknownAnalyzer(name.to_string()));
        }
        self.index
            .tokenizers()
            .get(name)
            .ok_or_else(|| Error::UnknownAnalyzer(name.to_string()))
    }

    /// Analyzer for an index field, falling back to the index default.
    pub fn field_analyzer(&self, index_field: &str) -> Result<TextAnalyzer> {
        let name = {
            let config = self.config.read();
            config
                .analyzer_name_for_index_field(index_field)
                .unwrap_or(&config.settings().default_analyzer)
                .to_string()
        };
        self.analyzer(&name)
    }

    /// Stop accepting mutations. Pending work is committed when `commit`
    /// is set.
    pub fn close(&self, commit: bool) -> Result<()> {
        let Some(mut writer) = self.writer.lock().take() else {
            return Ok(());
        };
        if commit {
            self.commit_locked(&mut writer)?;
        }
        writer.wait_merging_threads()?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.writer.lock().is_none()
    }
}

impl std::fmt::Debug for WriterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterManager")
            .field("shard_number", &self.shard_number)
            .finish_non_exhaustive()
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))
        }
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => Some(true),
            "false" | "f" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

/// Convert a JSON value to the schema type of `field` and add it.
/// Values that do not convert are skipped.
fn add_value(
    doc: &mut TantivyDocument,
    schema: &Schema,
    field: Field,
    field_type: FieldType,
    value: &Value,
) {
    let entry = schema.get_field_entry(field);
    let added = match entry.field_type() {
        SchemaFieldType::Str(_) => {
            let text = match field_type {
                FieldType::Bool => as_bool(value).map(|b| b.to_string()),
                _ => value_text(value),
            };
            text.map(|t| doc.add_text(field, t))
        }
        SchemaFieldType::I64(_) => as_i64(value).map(|v| {
            let v = match field_type {
                FieldType::Int => i64::from(v as i32),
                _ => v,
            };
            doc.add_i64(field, v)
        }),
        SchemaFieldType::F64(_) => as_f64(value).map(|v| {
            let v = match field_type {
                FieldType::Float => f64::from(v as f32),
                _ => v,
            };
            doc.add_f64(field, v)
        }),
        SchemaFieldType::Bool(_) => {
            as_bool(value).map(|b| doc.add_bool(field, b))
        }
        _ => None,
    };
    if added.is_none() {
        warn!(
            field = entry.name(),
            ?field_type,
            "Skipping value that does not convert to the field type"
        );
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tantivy::{
        collector::Count,
        query::TermQuery,
        schema::IndexRecordOption,
    };

    use super::*;
    use crate::{
        codec::JsonCodec,
        config::{FieldConfig, IndexSettings},
    };

    fn manager() -> WriterManager {
        let config = Arc::new(
            IndexConfig::new(IndexSettings {
                writer_memory_budget: 15_000_000,
                fields: vec![
                    FieldConfig::new("title", FieldType::Text)
                        .index_as("title")
                        .sort_as("title_sort"),
                    FieldConfig::new("year", FieldType::Int)
                        .index_as("year")
                        .sort_as("year_sort")
                        .facet_as("year"),
                ],
                ..IndexSettings::default()
            })
            .unwrap(),
        );
        let index = schema::open_in_ram(&config);
        WriterManager::new(index, config, Arc::new(JsonCodec), 0).unwrap()
    }

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn count(manager: &WriterManager, field: &str, text: &str) -> usize {
        let reader = manager.index().reader().unwrap();
        reader.reload().unwrap();
        let field = manager.index().schema().get_field(field).unwrap();
        let query = TermQuery::new(
            Term::from_field_text(field, text),
            IndexRecordOption::Basic,
        );
        reader.searcher().search(&query, &Count).unwrap()
    }

    #[test]
    fn upsert_replaces_by_id() {
        let m = manager();
        m.index_document("a", 1, &doc(json!({"title": "old"})), &[])
            .unwrap();
        m.commit().unwrap();
        m.index_document("a", 2, &doc(json!({"title": "new"})), &[])
            .unwrap();
        m.commit().unwrap();

        assert_eq!(count(&m, "title", "old"), 0);
        assert_eq!(count(&m, "title", "new"), 1);
        assert_eq!(count(&m, schema::fields::ID, "a"), 1);
    }

    #[test]
    fn commit_advances_watermark() {
        let m = manager();
        let watermark = m.commit_watermark();
        assert_eq!(watermark.load(Ordering::Acquire), 0);
        assert_eq!(m.commit().unwrap(), 1);
        assert_eq!(m.commit().unwrap(), 2);
        assert_eq!(watermark.load(Ordering::Acquire), 2);
    }

    #[test]
    fn delete_all_still_advances_watermark() {
        let m = manager();
        m.index_document("a", 0, &doc(json!({"title": "x"})), &[])
            .unwrap();
        let before = m.commit().unwrap();

        m.delete_all().unwrap();
        let after = m.commit().unwrap();
        assert!(after > before);
        assert_eq!(m.commit_watermark().load(Ordering::Acquire), after);
        assert_eq!(count(&m, "title", "x"), 0);
    }

    #[test]
    fn delete_and_delete_all() {
        let m = manager();
        for id in ["a", "b", "c"] {
            m.index_document(id, 0, &doc(json!({"title": "x"})), &[])
                .unwrap();
        }
        m.commit().unwrap();
        m.delete_documents("a").unwrap();
        m.commit().unwrap();
        assert_eq!(count(&m, "title", "x"), 2);

        m.delete_all().unwrap();
        m.commit().unwrap();
        assert_eq!(count(&m, "title", "x"), 0);
    }

    #[test]
    fn force_merge_reduces_segments() {
        let m = manager();
        for id in ["a", "b", "c"] {
            m.index_document(id, 0, &doc(json!({"title": "x"})), &[])
                .unwrap();
            m.commit().unwrap();
        }
        assert_eq!(m.index().searchable_segment_metas().unwrap().len(), 3);
        m.force_merge(1).unwrap();
        m.commit().unwrap();
        assert_eq!(m.index().searchable_segment_metas().unwrap().len(), 1);
        assert_eq!(count(&m, "title", "x"), 3);
    }

    #[test]
    fn closed_writer_rejects_mutations() {
        let m = manager();
        m.close(true).unwrap();
        assert!(m.is_closed());
        assert!(matches!(
            m.delete_documents("a"),
            Err(Error::Closed { shard: 0, .. })
        ));
        assert!(m.close(true).is_ok());
    }

    #[test]
    fn unknown_analyzer_is_reported() {
        let m = manager();
        assert!(m.analyzer("standard").is_ok());
        assert!(m.field_analyzer("title").is_ok());
        assert!(matches!(
            m.analyzer("nope"),
            Err(Error::UnknownAnalyzer(name)) if name == "nope"
        ));
    }

    #[test]
    fn values_convert_to_field_types() {
        let m = manager();
        let built = m
            .build_document(
                "a",
                5,
                &doc(json!({"title": "Dune", "year": "1965"})),
                &[Metadata::new("k", "v")],
            )
            .unwrap();
        let schema = m.index().schema();
        let year_sort = schema.get_field("year_sort").unwrap();
        let year = built
            .get_first(year_sort)
            .and_then(|v| tantivy::schema::Value::as_i64(&v));
        assert_eq!(year, Some(1965));
        assert_eq!(built.get_all(m.fields().facets).count(), 1);
    }
}
