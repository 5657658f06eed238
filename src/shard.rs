use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::RwLock;
use tantivy::{Index, IndexReader, ReloadPolicy, collector::Count};
use tracing::{debug, info};

use crate::{
    analysis::AnalysisHandler,
    cache::{CacheStats, ResultCache},
    codec::{Document, DocumentCodec, JsonCodec},
    collector,
    config::{IndexConfig, IndexSettings},
    error::{Error, Result},
    facet,
    highlight::{self, Highlighter},
    query::{QueryNode, ShardQuery},
    reader::{ReaderManager, Snapshot},
    response::{
        FetchType,
        Metadata,
        ResultDocument,
        ShardCountResponse,
        ShardQueryResponse,
    },
    result::{HitStages, ResultAssembler},
    schema,
    similarity::{SimilarityResolver, TermWeights},
    sort::SortPlan,
    terms::{self, TermsRequest, TermsResponse},
    writer::WriterManager,
};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Millisecond timestamp where 0 means "never".
fn load_millis(value: &AtomicU64) -> Option<u64> {
    match value.load(Ordering::Acquire) {
        0 => None,
        millis => Some(millis),
    }
}

/// One partition of an index: its writer, its readers and its result
/// cache.
///
/// Queries may run concurrently from any number of threads. Mutations are
/// only accepted on a primary.
pub struct Shard {
    index_name: String,
    shard_number: u32,
    primary: bool,
    config: RwLock<Arc<IndexConfig>>,
    writer: WriterManager,
    readers: ReaderManager,
    cache: Arc<ResultCache>,
    counter: AtomicU64,
    last_change: AtomicU64,
    last_commit: AtomicU64,
}

impl Shard {
    /// Open or create a shard stored in `dir`.
    pub fn open(
        dir: &Path,
        config: IndexConfig,
        shard_number: u32,
        primary: bool,
    ) -> Result<Self> {
        let index = schema::open_index(dir, &config)?;
        Self::with_index(
            index,
            config,
            shard_number,
            primary,
            Arc::new(JsonCodec),
        )
    }

    /// Create an in-memory shard (for testing).
    pub fn open_in_ram(
        config: IndexConfig,
        shard_number: u32,
        primary: bool,
    ) -> Result<Self> {
        let index = schema::open_in_ram(&config);
        Self::with_index(
            index,
            config,
            shard_number,
            primary,
            Arc::new(JsonCodec),
        )
    }

    /// Build a shard over an already opened index whose analyzers are
    /// registered.
    pub fn with_index(
        index: Index,
        config: IndexConfig,
        shard_number: u32,
        primary: bool,
        codec: Arc<dyn DocumentCodec>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let settings = config.settings();
        let cache = Arc::new(ResultCache::new(
            settings.shard_query_cache_size,
            settings.shard_query_cache_max_amount,
        ));

        let writer = WriterManager::new(
            index.clone(),
            config.clone(),
            codec,
            shard_number,
        )?;
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let invalidate = {
            let cache = cache.clone();
            move |generation| cache.invalidate(generation)
        };
        let readers = ReaderManager::new(
            reader,
            writer.commit_watermark(),
            Box::new(invalidate),
        )?;

        info!(
            "Opened shard <{}> for index <{}> as {}",
            shard_number,
            config.index_name(),
            if primary { "primary" } else { "replica" }
        );

        Ok(Self {
            index_name: config.index_name().to_string(),
            shard_number,
            primary,
            config: RwLock::new(config),
            writer,
            readers,
            cache,
            counter: AtomicU64::new(0),
            last_change: AtomicU64::new(0),
            last_commit: AtomicU64::new(0),
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn shard_number(&self) -> u32 {
        self.shard_number
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn config(&self) -> Arc<IndexConfig> {
        self.config.read().clone()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Generation of the current reader snapshot.
    pub fn generation(&self) -> u64 {
        self.readers.generation()
    }

    /// Snapshot references currently held by running operations.
    pub fn outstanding_snapshots(&self) -> usize {
        self.readers.outstanding()
    }

    /// Mutations accepted since the shard was opened.
    pub fn mutation_count(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    pub fn last_change_millis(&self) -> Option<u64> {
        load_millis(&self.last_change)
    }

    pub fn last_commit_millis(&self) -> Option<u64> {
        load_millis(&self.last_commit)
    }

    fn ensure_primary(&self, operation: impl FnOnce() -> String) -> Result<()> {
        if self.primary {
            Ok(())
        } else {
            Err(Error::NotPrimary {
                operation: operation(),
                index: self.index_name.clone(),
                shard: self.shard_number,
            })
        }
    }

    /// Run `f` against a freshly refreshed snapshot.
    fn with_snapshot<T>(
        &self,
        f: impl FnOnce(&Snapshot) -> Result<T>,
    ) -> Result<T> {
        self.readers.refresh_blocking()?;
        let snapshot = self.readers.acquire();
        let result = f(&snapshot);
        self.readers.release(snapshot);
        result
    }

    pub fn query(&self, request: &ShardQuery) -> Result<ShardQueryResponse> {
        self.with_snapshot(|snapshot| self.cached_query(snapshot, request))
    }

    /// Answer from the cache when it holds a response computed against
    /// `snapshot`'s generation.
    fn cached_query(
        &self,
        snapshot: &Snapshot,
        request: &ShardQuery,
    ) -> Result<ShardQueryResponse> {
        let generation = snapshot.generation();
        let cache_key = request.cache_key();
        let use_cache =
            self.cache.is_eligible(cache_key.as_ref(), request.amount);
        if use_cache
            && let Some(key) = cache_key.as_ref()
            && let Some(cached) = self.cache.get(key, generation)
        {
            debug!(shard = self.shard_number, generation, "Result cache hit");
            return Ok(cached);
        }

        let response = self.execute_query(snapshot, &self.config(), request)?;
        if use_cache && let Some(key) = cache_key {
            self.cache.put(key, generation, response.clone());
        }
        Ok(response)
    }

    fn execute_query(
        &self,
        snapshot: &Snapshot,
        config: &IndexConfig,
        request: &ShardQuery,
    ) -> Result<ShardQueryResponse> {
        if !request.fetch_type.is_full() {
            if !request.highlight_requests.is_empty() {
                return Err(Error::FullFetchRequired {
                    feature: "Highlighting",
                });
            }
            if !request.analysis_requests.is_empty() {
                return Err(Error::FullFetchRequired {
                    feature: "Analysis",
                });
            }
        }

        let searcher = snapshot.searcher();
        let schema = searcher.schema();
        let built = request.query.build(searcher.index())?;
        let query = built.as_ref();

        let resolver =
            SimilarityResolver::new(config, &request.similarity_overrides);
        let weights = TermWeights::build(searcher, query, &resolver)?;
        if request.debug {
            info!(
                "Running query {:?} on shard <{}> for index <{}> ({} scoring)",
                query,
                self.shard_number,
                self.index_name,
                if weights.is_some() { "custom" } else { "native" }
            );
        }

        let sort_plan = SortPlan::build(&request.sort_request, config, schema)?;
        let after = request
            .after
            .as_ref()
            .map(|cursor| cursor.rank_key(sort_plan.as_deref()));

        // One extra hit tells whether more results exist. A shard never
        // returns more hits than it has live documents.
        let num_docs =
            usize::try_from(searcher.num_docs()).unwrap_or(usize::MAX);
        let limit = request.amount.min(num_docs).saturating_add(1);
        let top = collector::top_collector(
            limit,
            sort_plan.clone(),
            weights,
            after,
            collector::segment_ords(searcher),
        );

        let facet_request = &request.facet_request;
        let (total_hits, hits, facet_groups) = if facet_request.is_empty() {
            let (count, hits) = searcher.search(query, &(Count, top))?;
            (count, hits, Vec::new())
        } else {
            let facets = facet::facet_collector(facet_request, config)?;
            let (count, hits, counts) =
                searcher.search(query, &(Count, top, facets))?;
            let groups = facet::facet_groups(
                facet_request,
                &counts,
                config.number_of_shards(),
            );
            (count, hits, groups)
        };

        let hits: Vec<_> =
            hits.into_iter().filter(|(key, _)| key.eligible).collect();
        let more_available = hits.len() > request.amount;
        let num_results = hits.len().min(request.amount);

        let mut highlighters = request
            .highlight_requests
            .iter()
            .map(|hr| -> Result<Highlighter> {
                let terms = highlight::highlight_terms(
                    query,
                    &request.query,
                    searcher,
                    &hr.field,
                )?;
                Ok(Highlighter::new(
                    hr.clone(),
                    config.stored_field_name(&hr.field).map(str::to_string),
                    terms,
                    self.writer.field_analyzer(&hr.field)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut analyzers = request
            .analysis_requests
            .iter()
            .map(|ar| -> Result<AnalysisHandler> {
                let index_field = config.index_field_for_stored(&ar.field);
                let analyzer = match (&ar.analyzer_override, index_field) {
                    (Some(name), _) => self.writer.analyzer(name)?,
                    (None, Some(field)) => self.writer.field_analyzer(field)?,
                    (None, None) => self
                        .writer
                        .analyzer(&config.settings().default_analyzer)?,
                };
                Ok(AnalysisHandler::new(
                    ar.clone(),
                    analyzer,
                    index_field.and_then(|name| schema.get_field(name).ok()),
                    searcher.clone(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let assembler = ResultAssembler {
            searcher,
            fields: self.writer.fields(),
            codec: self.writer.codec().as_ref(),
            index_name: &self.index_name,
            shard_number: self.shard_number,
            sort_plan: sort_plan.as_deref(),
        };

        let mut stages = HitStages {
            fetch_type: request.fetch_type,
            fields_to_return: &request.fields_to_return,
            fields_to_mask: &request.fields_to_mask,
            highlighters: &mut highlighters,
            analyzers: &mut analyzers,
        };
        let mut scored_results = Vec::with_capacity(num_results);
        for (i, (key, address)) in hits.iter().take(num_results).enumerate() {
            scored_results
                .push(assembler.assemble(key, *address, i, &mut stages)?);
        }

        let next = if more_available {
            let (key, address) = &hits[num_results];
            Some(assembler.assemble(
                key,
                *address,
                num_results,
                &mut HitStages::identity(),
            )?)
        } else {
            None
        };

        let mut analysis_results = Vec::new();
        for analyzer in &analyzers {
            if let Some(result) = analyzer.shard_result()? {
                analysis_results.push(result);
            }
        }

        Ok(ShardQueryResponse {
            index_name: self.index_name.clone(),
            shard_number: self.shard_number,
            total_hits: total_hits as u64,
            scored_results,
            next,
            facet_groups,
            analysis_results,
        })
    }

    /// Look up one document by id. Returns an identity-only placeholder
    /// when it does not exist.
    pub fn fetch_document(
        &self,
        unique_id: &str,
        fetch_type: FetchType,
        fields_to_return: Vec<String>,
        fields_to_mask: Vec<String>,
    ) -> Result<ResultDocument> {
        let request =
            ShardQuery::new(QueryNode::term(schema::fields::ID, unique_id), 1)
                .with_fetch_type(fetch_type)
                .with_fields_to_return(fields_to_return)
                .with_fields_to_mask(fields_to_mask);

        let response = self.query(&request)?;
        let found = response
            .scored_results
            .into_iter()
            .next()
            .filter(|r| r.unique_id == unique_id);
        Ok(match found {
            Some(result) => {
                result.result_document.unwrap_or_else(|| ResultDocument {
                    timestamp: result.timestamp,
                    ..ResultDocument::placeholder(unique_id, &self.index_name)
                })
            }
            None => ResultDocument::placeholder(unique_id, &self.index_name),
        })
    }

    pub fn index(
        &self,
        unique_id: &str,
        timestamp: i64,
        document: &Document,
        metadata: &[Metadata],
    ) -> Result<()> {
        self.ensure_primary(|| format!("index document <{unique_id}>"))?;
        self.writer
            .index_document(unique_id, timestamp, document, metadata)?;
        self.maybe_commit()
    }

    pub fn delete(&self, unique_id: &str) -> Result<()> {
        self.ensure_primary(|| format!("delete document <{unique_id}>"))?;
        self.writer.delete_documents(unique_id)?;
        self.maybe_commit()
    }

    /// Remove every document and commit.
    pub fn clear(&self) -> Result<()> {
        self.ensure_primary(|| "clear".to_string())?;
        self.writer.delete_all()?;
        self.last_change.store(now_millis(), Ordering::Release);
        self.force_commit()
    }

    /// Merge down to at most `max_segments` segments and commit.
    pub fn optimize(&self, max_segments: usize) -> Result<()> {
        self.ensure_primary(|| "optimize".to_string())?;
        self.last_change.store(now_millis(), Ordering::Release);
        self.writer.force_merge(max_segments)?;
        self.force_commit()
    }

    fn maybe_commit(&self) -> Result<()> {
        self.last_change.store(now_millis(), Ordering::Release);
        let count = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        let interval = self.config.read().settings().shard_commit_interval;
        if interval > 0 && count % interval == 0 {
            self.force_commit()?;
        }
        Ok(())
    }

    /// Commit pending changes and make them visible to new queries.
    pub fn force_commit(&self) -> Result<()> {
        self.ensure_primary(|| "force commit".to_string())?;
        info!(
            "Committing shard <{}> for index <{}>",
            self.shard_number, self.index_name
        );
        let started = now_millis();
        self.writer.commit()?;
        self.readers.refresh_nonblocking()?;
        self.last_commit.store(started, Ordering::Release);
        Ok(())
    }

    /// Commit if the shard has been idle with uncommitted changes for
    /// longer than the configured timeout. Replicas never commit. Returns
    /// whether a commit happened.
    pub fn periodic_commit_check(&self) -> Result<bool> {
        self.periodic_commit_check_at(now_millis())
    }

    pub(crate) fn periodic_commit_check_at(&self, now: u64) -> Result<bool> {
        if !self.primary {
            return Ok(false);
        }
        let Some(last_change) = self.last_change_millis() else {
            return Ok(false);
        };
        let idle_millis = self
            .config
            .read()
            .settings()
            .idle_time_without_commit
            .saturating_mul(1000);
        if now.saturating_sub(last_change) <= idle_millis {
            return Ok(false);
        }
        match self.last_commit_millis() {
            Some(last_commit) if last_change <= last_commit => Ok(false),
            _ => {
                self.force_commit()?;
                Ok(true)
            }
        }
    }

    /// Names of the user-visible fields in the index.
    pub fn field_names(&self) -> Result<Vec<String>> {
        self.with_snapshot(|snapshot| {
            Ok(terms::field_names(snapshot.searcher()))
        })
    }

    pub fn term_counts(&self, request: &TermsRequest) -> Result<TermsResponse> {
        self.with_snapshot(|snapshot| {
            terms::term_counts(snapshot.searcher(), request)
        })
    }

    pub fn document_count(&self) -> Result<ShardCountResponse> {
        self.with_snapshot(|snapshot| {
            Ok(ShardCountResponse {
                shard_number: self.shard_number,
                number_of_docs: snapshot.num_docs(),
            })
        })
    }

    /// Apply new settings: analyzers, similarity, commit policy and cache
    /// sizing. Fields cannot be added to an existing shard.
    pub fn update_index_settings(&self, settings: IndexSettings) -> Result<()> {
        let config = Arc::new(IndexConfig::new(settings)?);
        self.writer.update_index_setting(config.clone())?;
        self.cache.reconfigure(
            config.settings().shard_query_cache_size,
            config.settings().shard_query_cache_max_amount,
        );
        *self.config.write() = config;
        Ok(())
    }

    /// Flush and close the writer. A primary commits pending changes
    /// first. Queries keep working against the last snapshot.
    pub fn close(&self) -> Result<()> {
        info!(
            "Closing shard <{}> for index <{}>",
            self.shard_number, self.index_name
        );
        self.writer.close(self.primary)?;
        if self.primary {
            self.last_commit.store(now_millis(), Ordering::Release);
            self.readers.refresh_blocking()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("index_name", &self.index_name)
            .field("shard_number", &self.shard_number)
            .field("primary", &self.primary)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{FieldConfig, FieldType};

    fn settings(commit_interval: u64, idle_secs: u64) -> IndexSettings {
        IndexSettings {
            index_name: "books".to_string(),
            shard_commit_interval: commit_interval,
            idle_time_without_commit: idle_secs,
            writer_memory_budget: 15_000_000,
            fields: vec![
                FieldConfig::new("title", FieldType::Text).index_as("title"),
            ],
            ..IndexSettings::default()
        }
    }

    fn shard(commit_interval: u64, idle_secs: u64) -> Shard {
        let config =
            IndexConfig::new(settings(commit_interval, idle_secs)).unwrap();
        Shard::open_in_ram(config, 0, true).unwrap()
    }

    fn doc(title: &str) -> Document {
        match json!({ "title": title }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn count(shard: &Shard) -> u64 {
        shard.document_count().unwrap().number_of_docs
    }

    #[test]
    fn commits_on_interval() {
        let shard = shard(3, 30);
        shard.index("a", 0, &doc("x"), &[]).unwrap();
        shard.index("b", 0, &doc("x"), &[]).unwrap();
        assert_eq!(count(&shard), 0);
        assert!(shard.last_commit_millis().is_none());

        shard.index("c", 0, &doc("x"), &[]).unwrap();
        assert_eq!(count(&shard), 3);
        assert!(shard.last_commit_millis().is_some());
        assert_eq!(shard.mutation_count(), 3);
    }

    #[test]
    fn zero_interval_never_commits_on_count() {
        let shard = shard(0, 30);
        for id in ["a", "b", "c"] {
            shard.index(id, 0, &doc("x"), &[]).unwrap();
        }
        assert_eq!(count(&shard), 0);
    }

    #[test]
    fn idle_check_commits_once() {
        let shard = shard(100, 30);
        assert!(!shard.periodic_commit_check_at(now_millis()).unwrap());

        shard.index("a", 0, &doc("x"), &[]).unwrap();
        let changed = shard.last_change_millis().unwrap();
        assert!(!shard.periodic_commit_check_at(changed + 30_000).unwrap());
        assert!(shard.periodic_commit_check_at(changed + 30_001).unwrap());
        assert_eq!(count(&shard), 1);

        let later = changed + 60_000;
        assert!(!shard.periodic_commit_check_at(later).unwrap());
    }

    #[test]
    fn replica_never_commits_on_idle() {
        let config = IndexConfig::new(settings(100, 0)).unwrap();
        let replica = Shard::open_in_ram(config, 1, false).unwrap();
        replica.last_change.store(1, Ordering::Release);
        assert!(!replica.periodic_commit_check_at(now_millis()).unwrap());
    }

    #[test]
    fn closed_shard_rejects_writes_but_serves_reads() {
        let shard = shard(100, 30);
        shard.index("a", 0, &doc("x"), &[]).unwrap();
        shard.close().unwrap();
        assert_eq!(count(&shard), 1);
        assert!(matches!(
            shard.index("b", 0, &doc("y"), &[]),
            Err(Error::Closed { .. })
        ));
    }
}
