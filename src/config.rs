use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    schema::fields,
    similarity::Similarity,
};

/// Declared type of a stored document field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    String,
    Text,
    Bool,
    Int,
    Long,
    Float,
    Double,
    /// Epoch milliseconds.
    Date,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexAs {
    pub index_field_name: String,
    #[serde(default)]
    pub analyzer_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortAs {
    pub sort_field_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetAs {
    pub facet_name: String,
}

/// How one field of the stored document is projected into the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Dotted path of the value inside the stored document.
    pub stored_field_name: String,
    #[serde(default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub index_as: Vec<IndexAs>,
    #[serde(default)]
    pub sort_as: Vec<SortAs>,
    #[serde(default)]
    pub facet_as: Vec<FacetAs>,
}

impl FieldConfig {
    pub fn new(stored_field_name: &str, field_type: FieldType) -> Self {
        Self {
            stored_field_name: stored_field_name.to_string(),
            field_type,
            index_as: Vec::new(),
            sort_as: Vec::new(),
            facet_as: Vec::new(),
        }
    }

    pub fn index_as(mut self, index_field_name: &str) -> Self {
        self.index_as.push(IndexAs {
            index_field_name: index_field_name.to_string(),
            analyzer_name: None,
        });
        self
    }

    pub fn index_with(
        mut self,
        index_field_name: &str,
        analyzer_name: &str,
    ) -> Self {
        self.index_as.push(IndexAs {
            index_field_name: index_field_name.to_string(),
            analyzer_name: Some(analyzer_name.to_string()),
        });
        self
    }

    pub fn sort_as(mut self, sort_field_name: &str) -> Self {
        self.sort_as.push(SortAs {
            sort_field_name: sort_field_name.to_string(),
        });
        self
    }

    pub fn facet_as(mut self, facet_name: &str) -> Self {
        self.facet_as.push(FacetAs {
            facet_name: facet_name.to_string(),
        });
        self
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    #[default]
    Standard,
    Whitespace,
    Keyword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenFilterKind {
    Lowercase,
    AsciiFolding,
    EnglishStem,
    EnglishStop,
    RemoveLong { limit: usize },
}

/// A named analyzer: one tokenizer followed by a chain of token filters,
/// optionally carrying the similarity used to score fields analyzed by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerSettings {
    pub name: String,
    #[serde(default)]
    pub tokenizer: TokenizerKind,
    #[serde(default)]
    pub filters: Vec<TokenFilterKind>,
    #[serde(default)]
    pub similarity: Option<Similarity>,
}

impl AnalyzerSettings {
    pub fn new(name: &str, tokenizer: TokenizerKind) -> Self {
        Self {
            name: name.to_string(),
            tokenizer,
            filters: Vec::new(),
            similarity: None,
        }
    }

    pub fn filter(mut self, filter: TokenFilterKind) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_similarity(mut self, similarity: Similarity) -> Self {
        self.similarity = Some(similarity);
        self
    }
}

/// Analyzers every index gets without declaring them.
pub fn builtin_analyzers() -> Vec<AnalyzerSettings> {
    vec![
        AnalyzerSettings::new("standard", TokenizerKind::Standard)
            .filter(TokenFilterKind::RemoveLong { limit: 40 })
            .filter(TokenFilterKind::Lowercase),
        AnalyzerSettings::new("keyword", TokenizerKind::Keyword),
        AnalyzerSettings::new("whitespace", TokenizerKind::Whitespace),
        AnalyzerSettings::new("en_stem", TokenizerKind::Standard)
            .filter(TokenFilterKind::RemoveLong { limit: 40 })
            .filter(TokenFilterKind::Lowercase)
            .filter(TokenFilterKind::EnglishStem),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub index_name: String,
    pub number_of_shards: u32,
    /// Commit after this many mutations. 0 disables count-based commits.
    pub shard_commit_interval: u64,
    /// Seconds a shard may stay idle with uncommitted changes.
    pub idle_time_without_commit: u64,
    /// Maximum cached responses per shard. 0 disables the cache.
    pub shard_query_cache_size: usize,
    /// Queries asking for more results than this are never cached.
    /// 0 means no limit.
    pub shard_query_cache_max_amount: usize,
    pub default_similarity: Similarity,
    pub default_analyzer: String,
    pub writer_memory_budget: usize,
    pub analyzers: Vec<AnalyzerSettings>,
    pub fields: Vec<FieldConfig>,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            index_name: "index".to_string(),
            number_of_shards: 1,
            shard_commit_interval: 3200,
            idle_time_without_commit: 30,
            shard_query_cache_size: 512,
            shard_query_cache_max_amount: 256,
            default_similarity: Similarity::Bm25,
            default_analyzer: "standard".to_string(),
            writer_memory_budget: 50_000_000,
            analyzers: Vec::new(),
            fields: Vec::new(),
        }
    }
}

/// Where an index field gets its value and how it is analyzed.
#[derive(Debug, Clone)]
struct IndexFieldInfo {
    stored_field_name: String,
    analyzer_name: String,
}

/// Validated index configuration with the lookups the shard needs at
/// query time.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    settings: IndexSettings,
    analyzers: HashMap<String, AnalyzerSettings>,
    index_fields: HashMap<String, IndexFieldInfo>,
    sort_fields: HashMap<String, FieldType>,
    facets: HashSet<String>,
}

impl IndexConfig {
    pub fn new(settings: IndexSettings) -> Result<Self> {
        let mut analyzers: HashMap<String, AnalyzerSettings> =
            builtin_analyzers()
                .into_iter()
                .map(|a| (a.name.clone(), a))
                .collect();
        for analyzer in &settings.analyzers {
            analyzers.insert(analyzer.name.clone(), analyzer.clone());
        }

        if !analyzers.contains_key(&settings.default_analyzer) {
            return Err(Error::UnknownAnalyzer(
                settings.default_analyzer.clone(),
            ));
        }

        let mut names = HashSet::new();
        let mut claim = |name: &str| -> Result<()> {
            if name.is_empty() || name.starts_with('_') {
                return Err(Error::Config(format!(
                    "field name <{name}> is reserved"
                )));
            }
            if !names.insert(name.to_string()) {
                return Err(Error::Config(format!(
                    "field name <{name}> is declared more than once"
                )));
            }
            Ok(())
        };

        let mut index_fields = HashMap::new();
        let mut sort_fields = HashMap::new();
        let mut facets = HashSet::new();

        for field in &settings.fields {
            for index_as in &field.index_as {
                claim(&index_as.index_field_name)?;
                let analyzer_name = index_as
                    .analyzer_name
                    .clone()
                    .unwrap_or_else(|| settings.default_analyzer.clone());
                if !analyzers.contains_key(&analyzer_name) {
                    return Err(Error::UnknownAnalyzer(analyzer_name));
                }
                index_fields.insert(
                    index_as.index_field_name.clone(),
                    IndexFieldInfo {
                        stored_field_name: field.stored_field_name.clone(),
                        analyzer_name,
                    },
                );
            }
            for sort_as in &field.sort_as {
                claim(&sort_as.sort_field_name)?;
                sort_fields
                    .insert(sort_as.sort_field_name.clone(), field.field_type);
            }
            for facet_as in &field.facet_as {
                if facet_as.facet_name.is_empty() {
                    return Err(Error::Config(
                        "facet name must not be empty".to_string(),
                    ));
                }
                facets.insert(facet_as.facet_name.clone());
            }
        }

        Ok(Self {
            settings,
            analyzers,
            index_fields,
            sort_fields,
            facets,
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::new(serde_json::from_str(json)?)
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    pub fn index_name(&self) -> &str {
        &self.settings.index_name
    }

    pub fn number_of_shards(&self) -> u32 {
        self.settings.number_of_shards
    }

    pub fn field_configs(&self) -> &[FieldConfig] {
        &self.settings.fields
    }

    pub fn analyzers(&self) -> impl Iterator<Item = &AnalyzerSettings> {
        self.analyzers.values()
    }

    pub fn analyzer_settings_by_name(
        &self,
        name: &str,
    ) -> Option<&AnalyzerSettings> {
        self.analyzers.get(name)
    }

    pub fn analyzer_name_for_index_field(&self, field: &str) -> Option<&str> {
        self.index_fields
            .get(field)
            .map(|info| info.analyzer_name.as_str())
    }

    pub fn analyzer_settings_for_index_field(
        &self,
        field: &str,
    ) -> Option<&AnalyzerSettings> {
        self.analyzer_name_for_index_field(field)
            .and_then(|name| self.analyzers.get(name))
    }

    pub fn stored_field_name(&self, index_field: &str) -> Option<&str> {
        self.index_fields
            .get(index_field)
            .map(|info| info.stored_field_name.as_str())
    }

    /// First index field fed from the given stored field.
    pub fn index_field_for_stored(&self, stored_field: &str) -> Option<&str> {
        self.settings
            .fields
            .iter()
            .filter(|f| f.stored_field_name == stored_field)
            .flat_map(|f| f.index_as.iter())
            .map(|i| i.index_field_name.as_str())
            .next()
    }

    pub fn field_type_for_sort_field(&self, field: &str) -> Option<FieldType> {
        self.sort_fields.get(field).copied()
    }

    pub fn existing_facet(&self, label: &str) -> bool {
        self.facets.contains(label)
    }

    /// Whether `name` is one of the engine's own bookkeeping fields.
    pub fn is_internal_field(name: &str) -> bool {
        matches!(
            name,
            fields::ID
                | fields::TIMESTAMP
                | fields::STORED_META
                | fields::STORED_DOC
                | fields::FACETS
        )
    }
}
