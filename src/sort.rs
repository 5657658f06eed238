use std::{cmp::Ordering, sync::Arc};

use serde::{Deserialize, Serialize};
use tantivy::{
    DocId,
    Score,
    SegmentReader,
    columnar::{Column, StrColumn},
    schema::Schema,
};

use crate::{
    config::{FieldType, IndexConfig},
    error::{Error, Result},
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSort {
    pub sort_field: String,
    #[serde(default)]
    pub direction: Direction,
}

impl FieldSort {
    pub fn ascending(sort_field: &str) -> Self {
        Self {
            sort_field: sort_field.to_string(),
            direction: Direction::Ascending,
        }
    }

    pub fn descending(sort_field: &str) -> Self {
        Self {
            sort_field: sort_field.to_string(),
            direction: Direction::Descending,
        }
    }
}

/// Ordered list of sort fields. Empty means sort by score.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortRequest {
    pub field_sorts: Vec<FieldSort>,
}

impl SortRequest {
    pub fn new(field_sorts: Vec<FieldSort>) -> Self {
        Self { field_sorts }
    }

    pub fn is_empty(&self) -> bool {
        self.field_sorts.is_empty()
    }
}

/// One component of a hit's sort key, typed by the sort field's declared
/// type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortValue {
    Missing,
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Epoch milliseconds.
    Date(i64),
    Str(String),
}

impl SortValue {
    pub fn exists(&self) -> bool {
        !matches!(self, SortValue::Missing)
    }
}

/// Raw value read from a fast field.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SortComponent {
    I64(i64),
    F64(f64),
    Str(String),
}

impl PartialOrd for SortComponent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (SortComponent::I64(a), SortComponent::I64(b)) => a.partial_cmp(b),
            (SortComponent::F64(a), SortComponent::F64(b)) => a.partial_cmp(b),
            (SortComponent::Str(a), SortComponent::Str(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl SortComponent {
    fn from_value(value: &SortValue) -> Option<Self> {
        match value {
            SortValue::Missing => None,
            SortValue::Integer(v) => Some(SortComponent::I64(i64::from(*v))),
            SortValue::Long(v) | SortValue::Date(v) => {
                Some(SortComponent::I64(*v))
            }
            SortValue::Float(v) => Some(SortComponent::F64(f64::from(*v))),
            SortValue::Double(v) => Some(SortComponent::F64(*v)),
            SortValue::Str(v) => Some(SortComponent::Str(v.clone())),
        }
    }

    fn to_value(component: Option<&Self>, field_type: FieldType) -> SortValue {
        match (component, field_type) {
            (None, _) => SortValue::Missing,
            (Some(SortComponent::I64(v)), FieldType::Int) => {
                SortValue::Integer(*v as i32)
            }
            (Some(SortComponent::I64(v)), FieldType::Date) => {
                SortValue::Date(*v)
            }
            (Some(SortComponent::I64(v)), _) => SortValue::Long(*v),
            (Some(SortComponent::F64(v)), FieldType::Float) => {
                SortValue::Float(*v as f32)
            }
            (Some(SortComponent::F64(v)), _) => SortValue::Double(*v),
            (Some(SortComponent::Str(v)), _) => SortValue::Str(v.clone()),
        }
    }
}

/// Per-segment handle on one sort field's fast field.
pub(crate) enum SortColumn {
    I64(Column<i64>),
    F64(Column<f64>),
    /// Float fields are stored as f64 but compared at f32 precision, so
    /// that a cursor built from a returned value matches its own hit.
    F32(Column<f64>),
    Str(StrColumn),
    Absent,
}

/// Ascending sorts use a document's smallest value, descending its
/// largest.
fn pick<T: PartialOrd>(
    values: impl Iterator<Item = T>,
    direction: Direction,
) -> Option<T> {
    values.fold(None, |best, v| match best {
        None => Some(v),
        Some(b) => {
            let replace = match direction {
                Direction::Ascending => v < b,
                Direction::Descending => v > b,
            };
            Some(if replace { v } else { b })
        }
    })
}

impl SortColumn {
    fn value(&self, doc: DocId, direction: Direction) -> Option<SortComponent> {
        match self {
            SortColumn::I64(col) => {
                pick(col.values_for_doc(doc), direction).map(SortComponent::I64)
            }
            SortColumn::F64(col) => {
                pick(col.values_for_doc(doc), direction).map(SortComponent::F64)
            }
            SortColumn::F32(col) => pick(
                col.values_for_doc(doc).map(|v| f64::from(v as f32)),
                direction,
            )
            .map(SortComponent::F64),
            SortColumn::Str(col) => {
                let ord = pick(col.term_ords(doc), direction)?;
                let mut text = String::new();
                col.ord_to_str(ord, &mut text).ok()?;
                Some(SortComponent::Str(text))
            }
            SortColumn::Absent => None,
        }
    }
}

/// A validated sort request.
#[derive(Debug)]
pub(crate) struct SortPlan {
    fields: Vec<(String, FieldType)>,
    directions: Arc<[Direction]>,
}

impl SortPlan {
    /// `None` for an empty request. Fails with [`Error::NotSortable`] when a
    /// field has no sortable form in the config or the index.
    pub(crate) fn build(
        request: &SortRequest,
        config: &IndexConfig,
        schema: &Schema,
    ) -> Result<Option<Arc<Self>>> {
        if request.is_empty() {
            return Ok(None);
        }

        let mut fields = Vec::with_capacity(request.field_sorts.len());
        for sort in &request.field_sorts {
            let not_sortable = || Error::NotSortable {
                field: sort.sort_field.clone(),
            };
            let field_type = config
                .field_type_for_sort_field(&sort.sort_field)
                .ok_or_else(not_sortable)?;
            let field = schema
                .get_field(&sort.sort_field)
                .map_err(|_| not_sortable())?;
            if !schema.get_field_entry(field).is_fast() {
                return Err(not_sortable());
            }
            fields.push((sort.sort_field.clone(), field_type));
        }

        let directions = request
            .field_sorts
            .iter()
            .map(|s| s.direction)
            .collect::<Vec<_>>()
            .into();
        Ok(Some(Arc::new(Self { fields, directions })))
    }

    pub(crate) fn directions(&self) -> &Arc<[Direction]> {
        &self.directions
    }

    pub(crate) fn segment_columns(
        &self,
        segment_reader: &SegmentReader,
    ) -> Vec<SortColumn> {
        let fast_fields = segment_reader.fast_fields();
        self.fields
            .iter()
            .map(|(name, field_type)| match field_type {
                FieldType::Int | FieldType::Long | FieldType::Date => {
                    fast_fields
                        .i64(name)
                        .map(SortColumn::I64)
                        .unwrap_or(SortColumn::Absent)
                }
                FieldType::Double => fast_fields
                    .f64(name)
                    .map(SortColumn::F64)
                    .unwrap_or(SortColumn::Absent),
                FieldType::Float => fast_fields
                    .f64(name)
                    .map(SortColumn::F32)
                    .unwrap_or(SortColumn::Absent),
                FieldType::String | FieldType::Text | FieldType::Bool => {
                    match fast_fields.str(name) {
                        Ok(Some(col)) => SortColumn::Str(col),
                        _ => SortColumn::Absent,
                    }
                }
            })
            .collect()
    }

    pub(crate) fn sort_key(
        &self,
        columns: &[SortColumn],
        doc: DocId,
    ) -> Vec<Option<SortComponent>> {
        columns
            .iter()
            .zip(self.directions.iter())
            .map(|(column, direction)| column.value(doc, *direction))
            .collect()
    }

    /// Typed sort values for a hit, in request order.
    pub(crate) fn sort_values(&self, key: &RankKey) -> Vec<SortValue> {
        let components = key.sort.as_deref().unwrap_or(&[]);
        self.fields
            .iter()
            .enumerate()
            .map(|(i, (_, field_type))| {
                SortComponent::to_value(
                    components.get(i).and_then(Option::as_ref),
                    *field_type,
                )
            })
            .collect()
    }
}

/// Total order used to rank hits: greater ranks first.
///
/// With a sort plan, hits compare by their sort components (missing values
/// last in either direction); without one, by score. Ties go to the lower
/// document address. Ineligible hits, those at or before a search-after
/// cursor, rank below everything.
#[derive(Debug, Clone)]
pub(crate) struct RankKey {
    pub(crate) eligible: bool,
    pub(crate) score: Score,
    pub(crate) sort: Option<Vec<Option<SortComponent>>>,
    pub(crate) directions: Arc<[Direction]>,
    pub(crate) segment_ord: u32,
    pub(crate) doc: DocId,
}

fn compare_components(
    a: &[Option<SortComponent>],
    b: &[Option<SortComponent>],
    directions: &[Direction],
) -> Ordering {
    for ((a, b), direction) in a.iter().zip(b.iter()).zip(directions.iter()) {
        let ord = match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => {
                let by_value = a.partial_cmp(b).unwrap_or(Ordering::Equal);
                match direction {
                    Direction::Ascending => by_value.reverse(),
                    Direction::Descending => by_value,
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

impl RankKey {
    pub(crate) fn rank_cmp(&self, other: &Self) -> Ordering {
        if self.eligible != other.eligible {
            return self.eligible.cmp(&other.eligible);
        }
        let by_value = match (&self.sort, &other.sort) {
            (Some(a), Some(b)) => compare_components(a, b, &self.directions),
            _ => self
                .score
                .partial_cmp(&other.score)
                .unwrap_or(Ordering::Equal),
        };
        by_value.then_with(|| {
            (other.segment_ord, other.doc).cmp(&(self.segment_ord, self.doc))
        })
    }
}

impl PartialEq for RankKey {
    fn eq(&self, other: &Self) -> bool {
        self.rank_cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.rank_cmp(other))
    }
}

/// Position of the last hit of a previous page. Only hits ranking strictly
/// after it are returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AfterCursor {
    pub score: f32,
    #[serde(default)]
    pub sort_values: Option<Vec<SortValue>>,
    pub segment_ord: u32,
    pub doc_id: u32,
}

impl AfterCursor {
    pub(crate) fn rank_key(&self, plan: Option<&SortPlan>) -> RankKey {
        let (sort, directions) = match plan {
            Some(plan) => (
                Some(
                    self.sort_values
                        .as_deref()
                        .unwrap_or(&[])
                        .iter()
                        .map(SortComponent::from_value)
                        .collect(),
                ),
                plan.directions().clone(),
            ),
            None => (None, Arc::from(Vec::new())),
        };
        RankKey {
            eligible: true,
            score: self.score,
            sort,
            directions,
            segment_ord: self.segment_ord,
            doc: self.doc_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(
        sort: Option<Vec<Option<SortComponent>>>,
        dirs: &[Direction],
        doc: u32,
    ) -> RankKey {
        RankKey {
            eligible: true,
            score: 1.0,
            sort,
            directions: Arc::from(dirs.to_vec()),
            segment_ord: 0,
            doc,
        }
    }

    fn scored(score: f32, segment_ord: u32, doc: u32) -> RankKey {
        RankKey {
            eligible: true,
            score,
            sort: None,
            directions: Arc::from(Vec::new()),
            segment_ord,
            doc,
        }
    }

    #[test]
    fn higher_score_ranks_first_then_lower_address() {
        assert!(scored(2.0, 1, 5) > scored(1.0, 0, 0));
        assert!(scored(1.0, 0, 3) > scored(1.0, 0, 4));
        assert!(scored(1.0, 0, 9) > scored(1.0, 1, 0));
    }

    #[test]
    fn ascending_puts_smaller_first_and_missing_last() {
        let asc = [Direction::Ascending];
        let one = key(Some(vec![Some(SortComponent::I64(1))]), &asc, 2);
        let two = key(Some(vec![Some(SortComponent::I64(2))]), &asc, 1);
        let missing = key(Some(vec![None]), &asc, 0);
        assert!(one > two);
        assert!(two > missing);
    }

    #[test]
    fn descending_puts_larger_first_and_missing_last() {
        let desc = [Direction::Descending];
        let a = key(Some(vec![Some(SortComponent::Str("a".into()))]), &desc, 0);
        let b = key(Some(vec![Some(SortComponent::Str("b".into()))]), &desc, 1);
        let missing = key(Some(vec![None]), &desc, 2);
        assert!(b > a);
        assert!(a > missing);
    }

    #[test]
    fn later_components_break_ties() {
        let dirs = [Direction::Ascending, Direction::Descending];
        let x = key(
            Some(vec![Some(SortComponent::I64(1)), Some(SortComponent::F64(0.5))]),
            &dirs,
            0,
        );
        let y = key(
            Some(vec![Some(SortComponent::I64(1)), Some(SortComponent::F64(0.9))]),
            &dirs,
            1,
        );
        assert!(y > x);
    }

    #[test]
    fn ineligible_ranks_lowest() {
        let mut top = scored(100.0, 0, 0);
        top.eligible = false;
        assert!(scored(0.1, 3, 3) > top);
    }

    #[test]
    fn cursor_from_sort_values() {
        let cursor = AfterCursor {
            score: 0.0,
            sort_values: Some(vec![SortValue::Float(1.5), SortValue::Missing]),
            segment_ord: 0,
            doc_id: 4,
        };
        let key = cursor.rank_key(None);
        assert!(key.sort.is_none());
        assert_eq!(key.doc, 4);
    }

    #[test]
    fn typed_values_follow_field_type() {
        assert_eq!(
            SortComponent::to_value(Some(&SortComponent::I64(7)), FieldType::Int),
            SortValue::Integer(7)
        );
        assert_eq!(
            SortComponent::to_value(Some(&SortComponent::I64(7)), FieldType::Date),
            SortValue::Date(7)
        );
        assert_eq!(
            SortComponent::to_value(None, FieldType::Double),
            SortValue::Missing
        );
        assert_eq!(
            SortComponent::from_value(&SortValue::Integer(3)),
            Some(SortComponent::I64(3))
        );
    }
}
