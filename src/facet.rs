use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tantivy::{
    collector::{FacetCollector, FacetCounts},
    schema::Facet,
};

use crate::{
    config::IndexConfig,
    error::{Error, Result},
    schema::fields,
};

/// How many values a shard reports for a label when the index spans more
/// than one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardFacets {
    /// Over-fetch `max_facets * 10` so the merged top values are accurate.
    #[default]
    Default,
    /// Exactly this many values per shard.
    Explicit(usize),
    /// Every value, no over-fetch heuristic.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRequest {
    pub label: String,
    /// 0 means every value.
    #[serde(default)]
    pub max_facets: usize,
    #[serde(default)]
    pub shard_facets: ShardFacets,
}

impl CountRequest {
    pub fn new(label: &str, max_facets: usize) -> Self {
        Self {
            label: label.to_string(),
            max_facets,
            shard_facets: ShardFacets::Default,
        }
    }

    pub fn with_shard_facets(mut self, shard_facets: ShardFacets) -> Self {
        self.shard_facets = shard_facets;
        self
    }

    /// Number of values this shard should return, `None` for all of them.
    pub fn fetch_size(&self, number_of_shards: u32) -> Option<usize> {
        if number_of_shards > 1 {
            match self.shard_facets {
                ShardFacets::Explicit(n) => Some(n),
                ShardFacets::Default if self.max_facets > 0 => {
                    Some(self.max_facets.saturating_mul(10))
                }
                ShardFacets::Default | ShardFacets::All => None,
            }
        } else if self.max_facets > 0 {
            Some(self.max_facets)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetRequest {
    pub count_requests: Vec<CountRequest>,
}

impl FacetRequest {
    pub fn is_empty(&self) -> bool {
        self.count_requests.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetCount {
    pub facet: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetGroup {
    pub count_request: CountRequest,
    pub facet_counts: Vec<FacetCount>,
}

/// Facet path for a label's value, as stored in the `_facets` field.
pub(crate) fn facet_path(label: &str, value: &str) -> Facet {
    Facet::from_path([label, value])
}

/// Collector counting every requested label. Fails with
/// [`Error::NotFacetable`] on a label the config does not declare.
pub(crate) fn facet_collector(
    request: &FacetRequest,
    config: &IndexConfig,
) -> Result<FacetCollector> {
    let mut labels = BTreeSet::new();
    for count_request in &request.count_requests {
        if !config.existing_facet(&count_request.label) {
            return Err(Error::NotFacetable(count_request.label.clone()));
        }
        labels.insert(count_request.label.as_str());
    }

    let mut collector = FacetCollector::for_field(fields::FACETS);
    for label in labels {
        collector.add_facet(Facet::from_path([label]));
    }
    Ok(collector)
}

/// Turn raw counts into one group per request, ordered by descending count
/// then value. A label with no indexed values gives an empty group.
pub(crate) fn facet_groups(
    request: &FacetRequest,
    counts: &FacetCounts,
    number_of_shards: u32,
) -> Vec<FacetGroup> {
    request
        .count_requests
        .iter()
        .map(|count_request| {
            let parent = Facet::from_path([count_request.label.as_str()]);
            let mut values: Vec<FacetCount> = counts
                .get(parent)
                .filter_map(|(facet, count)| {
                    let value = facet.to_path().last()?.to_string();
                    Some(FacetCount {
                        facet: value,
                        count,
                    })
                })
                .collect();
            values.sort_by(|a, b| {
                b.count.cmp(&a.count).then_with(|| a.facet.cmp(&b.facet))
            });
            if let Some(size) = count_request.fetch_size(number_of_shards) {
                values.truncate(size);
            }
            FacetGroup {
                count_request: count_request.clone(),
                facet_counts: values,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldConfig, FieldType, IndexSettings};

    #[test]
    fn single_shard_sizing() {
        assert_eq!(CountRequest::new("color", 5).fetch_size(1), Some(5));
        assert_eq!(CountRequest::new("color", 0).fetch_size(1), None);
        let explicit = CountRequest::new("color", 5)
            .with_shard_facets(ShardFacets::Explicit(7));
        assert_eq!(explicit.fetch_size(1), Some(5));
    }

    #[test]
    fn multi_shard_sizing() {
        assert_eq!(CountRequest::new("color", 5).fetch_size(3), Some(50));
        assert_eq!(CountRequest::new("color", 0).fetch_size(3), None);
        let explicit = CountRequest::new("color", 5)
            .with_shard_facets(ShardFacets::Explicit(7));
        assert_eq!(explicit.fetch_size(3), Some(7));
        let all =
            CountRequest::new("color", 5).with_shard_facets(ShardFacets::All);
        assert_eq!(all.fetch_size(3), None);
    }

    #[test]
    fn undeclared_label_is_rejected() {
        let config = IndexConfig::new(IndexSettings {
            fields: vec![
                FieldConfig::new("color", FieldType::String).facet_as("color"),
            ],
            ..IndexSettings::default()
        })
        .unwrap();

        let ok = FacetRequest {
            count_requests: vec![CountRequest::new("color", 3)],
        };
        assert!(facet_collector(&ok, &config).is_ok());

        let bad = FacetRequest {
            count_requests: vec![CountRequest::new("size", 3)],
        };
        assert!(matches!(
            facet_collector(&bad, &config),
            Err(Error::NotFacetable(label)) if label == "size"
        ));
    }

    #[test]
    fn value_with_slash_stays_one_level() {
        let facet = facet_path("path", "a/b");
        assert_eq!(facet.to_path(), vec!["path", "a/b"]);
    }
}
