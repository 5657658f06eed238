use tantivy::{DocAddress, Searcher, TantivyDocument};

use crate::{
    analysis::AnalysisHandler,
    codec::{DocumentCodec, remove_fields, retain_fields},
    error::Result,
    highlight::Highlighter,
    response::{FetchType, Metadata, ResultDocument, ScoredResult},
    schema::{ShardFields, extract_bytes, extract_i64, extract_text, fields},
    sort::{RankKey, SortPlan},
};

/// Per-hit work requested by the query.
pub(crate) struct HitStages<'a> {
    pub(crate) fetch_type: FetchType,
    pub(crate) fields_to_return: &'a [String],
    pub(crate) fields_to_mask: &'a [String],
    pub(crate) highlighters: &'a mut [Highlighter],
    pub(crate) analyzers: &'a mut [AnalysisHandler],
}

impl HitStages<'_> {
    /// Identity only, for the extra hit past `amount`.
    pub(crate) fn identity() -> HitStages<'static> {
        HitStages {
            fetch_type: FetchType::None,
            fields_to_return: &[],
            fields_to_mask: &[],
            highlighters: &mut [],
            analyzers: &mut [],
        }
    }

    fn touches_document(&self) -> bool {
        !self.highlighters.is_empty()
            || !self.analyzers.is_empty()
            || !self.fields_to_return.is_empty()
            || !self.fields_to_mask.is_empty()
    }
}

/// Turns ranked hits into [`ScoredResult`]s.
pub(crate) struct ResultAssembler<'a> {
    pub(crate) searcher: &'a Searcher,
    pub(crate) fields: ShardFields,
    pub(crate) codec: &'a dyn DocumentCodec,
    pub(crate) index_name: &'a str,
    pub(crate) shard_number: u32,
    pub(crate) sort_plan: Option<&'a SortPlan>,
}

impl ResultAssembler<'_> {
    /// Id and timestamp straight from columnar storage, without loading
    /// the stored document.
    fn columnar_identity(&self, address: DocAddress) -> Result<(String, i64)> {
        let segment = self.searcher.segment_reader(address.segment_ord);
        let fast_fields = segment.fast_fields();

        let mut unique_id = String::new();
        if let Some(ids) = fast_fields.str(fields::ID)?
            && let Some(ord) = ids.term_ords(address.doc_id).next()
        {
            ids.ord_to_str(ord, &mut unique_id)?;
        }
        let timestamp = fast_fields
            .i64(fields::TIMESTAMP)?
            .first(address.doc_id)
            .unwrap_or(0);
        Ok((unique_id, timestamp))
    }

    fn stored_result(
        &self,
        address: DocAddress,
        fetch_type: FetchType,
    ) -> Result<ResultDocument> {
        let doc: TantivyDocument = self.searcher.doc(address)?;
        let metadata: Vec<Metadata> =
            match extract_bytes(&doc, self.fields.stored_meta) {
                Some(bytes) if !bytes.is_empty() => {
                    serde_json::from_slice(bytes)?
                }
                _ => Vec::new(),
            };
        let document = if fetch_type.is_full() {
            extract_bytes(&doc, self.fields.stored_doc).map(<[u8]>::to_vec)
        } else {
            None
        };
        Ok(ResultDocument {
            unique_id: extract_text(&doc, self.fields.id),
            index_name: self.index_name.to_string(),
            timestamp: extract_i64(&doc, self.fields.timestamp),
            metadata,
            document,
        })
    }

    pub(crate) fn assemble(
        &self,
        key: &RankKey,
        address: DocAddress,
        result_index: usize,
        stages: &mut HitStages<'_>,
    ) -> Result<ScoredResult> {
        let mut result_document = if stages.fetch_type.loads_stored() {
            Some(self.stored_result(address, stages.fetch_type)?)
        } else {
            None
        };
        let (unique_id, timestamp) = match &result_document {
            Some(rd) => (rd.unique_id.clone(), rd.timestamp),
            None => self.columnar_identity(address)?,
        };

        let mut highlight_results = Vec::new();
        let mut analysis_results = Vec::new();
        if stages.touches_document()
            && let Some(rd) = result_document.as_mut()
            && let Some(bytes) = rd.document.as_deref()
        {
            let mut document = self.codec.decode(bytes)?;
            for highlighter in stages.highlighters.iter_mut() {
                if let Some(result) = highlighter.highlight(&document) {
                    highlight_results.push(result);
                }
            }
            for analyzer in stages.analyzers.iter_mut() {
                if let Some(result) = analyzer.analyze_document(&document)? {
                    analysis_results.push(result);
                }
            }
            if !stages.fields_to_return.is_empty() {
                retain_fields(&mut document, stages.fields_to_return);
            }
            if !stages.fields_to_mask.is_empty() {
                remove_fields(&mut document, stages.fields_to_mask);
            }
            rd.document = Some(self.codec.encode(&document)?);
        }

        Ok(ScoredResult {
            unique_id,
            score: key.score,
            timestamp,
            index_name: self.index_name.to_string(),
            shard: self.shard_number,
            segment_ord: address.segment_ord,
            doc_id: address.doc_id,
            result_index,
            sort_values: self.sort_plan.map(|plan| plan.sort_values(key)),
            result_document,
            highlight_results,
            analysis_results,
        })
    }
}
