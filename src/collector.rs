use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use tantivy::{
    DocAddress,
    DocId,
    Score,
    Searcher,
    SegmentReader,
    collector::{Collector, TopDocs},
    index::SegmentId,
};

use crate::{
    similarity::TermWeights,
    sort::{RankKey, SortPlan},
};

/// Segment ordinals of a searcher, keyed by segment id, for use inside
/// per-segment closures.
pub(crate) fn segment_ords(
    searcher: &Searcher,
) -> Arc<HashMap<SegmentId, u32>> {
    Arc::new(
        searcher
            .segment_readers()
            .iter()
            .enumerate()
            .map(|(ord, reader)| (reader.segment_id(), ord as u32))
            .collect(),
    )
}

/// Top-`limit` collector ranking hits by [`RankKey`].
///
/// Scores are replaced when `weights` is set. Hits at or before `after`
/// come back marked ineligible and must be filtered out by the caller.
pub(crate) fn top_collector(
    limit: usize,
    plan: Option<Arc<SortPlan>>,
    weights: Option<TermWeights>,
    after: Option<RankKey>,
    segment_ords: Arc<HashMap<SegmentId, u32>>,
) -> impl Collector<Fruit = Vec<(RankKey, DocAddress)>> {
    TopDocs::with_limit(limit.max(1)).tweak_score(
        move |segment_reader: &SegmentReader| {
            let segment_ord = segment_ords
                .get(&segment_reader.segment_id())
                .copied()
                .unwrap_or(u32::MAX);
            let columns =
                plan.as_ref().map(|p| p.segment_columns(segment_reader));
            let mut scorer =
                weights.as_ref().map(|w| w.for_segment(segment_reader));
            let plan = plan.clone();
            let after = after.clone();
            let directions = plan
                .as_ref()
                .map(|p| p.directions().clone())
                .unwrap_or_else(|| Arc::from(Vec::new()));

            move |doc: DocId, score: Score| {
                let score = match scorer.as_mut() {
                    Some(scorer) => scorer.score(doc),
                    None => score,
                };
                let sort = match (plan.as_ref(), columns.as_ref()) {
                    (Some(plan), Some(columns)) => {
                        Some(plan.sort_key(columns, doc))
                    }
                    _ => None,
                };
                let mut key = RankKey {
                    eligible: true,
                    score,
                    sort,
                    directions: directions.clone(),
                    segment_ord,
                    doc,
                };
                if let Some(after) = after.as_ref() {
                    key.eligible = key.rank_cmp(after) == Ordering::Less;
                }
                key
            }
        },
    )
}
