use crate::aggregation::{Accumulator, AggregateIter, AggregationType, Reducer};
use crate::error::DbError;
use crate::index::QueryPredicate;
use crate::series::Series;
use crate::storage::RangeQuery;
use crate::types::{Labels, Sample, Timestamp};

use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Label added to grouped results naming the reducer.
pub const REDUCER_LABEL: &str = "__reducer__";
/// Label added to grouped results listing the contributing series keys.
pub const SOURCE_LABEL: &str = "__source__";

/// Arguments of a single-series range read. Both bounds are inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeArgs {
    pub start: Timestamp,
    pub end: Timestamp,
    /// Aggregation kind and bucket width in milliseconds.
    pub aggregation: Option<(AggregationType, u64)>,
    pub count: Option<usize>,
    pub reverse: bool,
}

impl RangeArgs {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start,
            end,
            aggregation: None,
            count: None,
            reverse: false,
        }
    }

    /// The whole series.
    pub fn all() -> Self {
        Self::new(0, Timestamp::MAX)
    }

    pub fn aggregate(mut self, kind: AggregationType, bucket_duration: u64) -> Self {
        self.aggregation = Some((kind, bucket_duration));
        self
    }

    pub fn count(mut self, n: usize) -> Self {
        self.count = Some(n);
        self
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn validate(&self) -> Result<(), DbError> {
        if self.start > self.end {
            return Err(DbError::InvalidTimeRange {
                start: self.start,
                end: self.end,
            });
        }
        if let Some((_, 0)) = self.aggregation {
            return Err(DbError::InvalidArgument(
                "aggregation bucket must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupBy {
    pub label: String,
    pub reducer: Reducer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MRangeArgs {
    pub range: RangeArgs,
    pub filters: Vec<QueryPredicate>,
    pub with_labels: bool,
    pub group_by: Option<GroupBy>,
}

impl MRangeArgs {
    pub fn new(range: RangeArgs, filters: Vec<QueryPredicate>) -> Self {
        Self {
            range,
            filters,
            with_labels: false,
            group_by: None,
        }
    }

    pub fn with_labels(mut self) -> Self {
        self.with_labels = true;
        self
    }

    pub fn group_by(mut self, label: &str, reducer: Reducer) -> Self {
        self.group_by = Some(GroupBy {
            label: label.to_string(),
            reducer,
        });
        self
    }
}

/// One emitted sequence of a multi-series query.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesResult {
    pub key: String,
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

/// Extracts the samples of `series` for `args`, aggregated and limited as requested.
pub fn range_series(series: &Series, args: &RangeArgs) -> Result<Vec<Sample>, DbError> {
    args.validate()?;
    let query = RangeQuery {
        start: args.start,
        end: args.end,
        reverse: args.reverse,
    };
    let limit = args.count.unwrap_or(usize::MAX);
    let samples = series.range(query);
    match args.aggregation {
        Some((kind, bucket)) => AggregateIter::new(samples, kind, bucket, args.reverse)
            .take(limit)
            .collect(),
        None => samples.take(limit).collect(),
    }
}

/// Runs the per-series part of a multi-series query in parallel, then groups if requested.
///
/// `handles` must already be in emission (key) order; the order is preserved.
pub fn execute_mrange(
    handles: &[&RwLock<Series>],
    args: &MRangeArgs,
) -> Result<Vec<SeriesResult>, DbError> {
    args.range.validate()?;
    match &args.group_by {
        None => handles
            .par_iter()
            .map(|h| -> Result<SeriesResult, DbError> {
                let s = h.read()?;
                Ok(SeriesResult {
                    key: s.key().to_string(),
                    labels: if args.with_labels {
                        s.labels().clone()
                    } else {
                        Labels::new()
                    },
                    samples: range_series(&s, &args.range)?,
                })
            })
            .collect(),
        Some(group) => {
            // Per-series aggregation runs forward and unlimited; count/reverse apply after reduction.
            let per_series = RangeArgs {
                count: None,
                reverse: false,
                ..args.range.clone()
            };
            let extracted: Vec<Option<(String, String, Vec<Sample>)>> = handles
                .par_iter()
                .map(|h| -> Result<Option<(String, String, Vec<Sample>)>, DbError> {
                    let s = h.read()?;
                    let Some(value) = s.labels().get(&group.label) else {
                        return Ok(None);
                    };
                    Ok(Some((
                        s.key().to_string(),
                        value.clone(),
                        range_series(&s, &per_series)?,
                    )))
                })
                .collect::<Result<_, DbError>>()?;
            Ok(group_results(
                extracted.into_iter().flatten(),
                group,
                args.range.count,
                args.range.reverse,
            ))
        }
    }
}

struct Group {
    sources: Vec<String>,
    buckets: BTreeMap<Timestamp, Accumulator>,
}

/// Reduces `(key, label value, samples)` triples into one result per distinct label value,
/// ordered by value.
pub fn group_results(
    series: impl IntoIterator<Item = (String, String, Vec<Sample>)>,
    group: &GroupBy,
    count: Option<usize>,
    reverse: bool,
) -> Vec<SeriesResult> {
    let mut groups: BTreeMap<String, Group> = BTreeMap::new();
    for (key, value, samples) in series {
        let g = groups.entry(value).or_insert_with(|| Group {
            sources: Vec::new(),
            buckets: BTreeMap::new(),
        });
        g.sources.push(key);
        for s in samples {
            g.buckets
                .entry(s.timestamp)
                .or_insert_with(|| group.reducer.accumulator())
                .append(s.value);
        }
    }

    groups
        .into_iter()
        .map(|(value, g)| {
            let mut samples: Vec<Sample> = g
                .buckets
                .into_iter()
                .filter_map(|(ts, acc)| acc.finalize().map(|v| Sample::new(ts, v)))
                .collect();
            if reverse {
                samples.reverse();
            }
            if let Some(n) = count {
                samples.truncate(n);
            }
            let mut labels = Labels::new();
            labels.insert(group.label.clone(), value.clone());
            labels.insert(REDUCER_LABEL.to_string(), group.reducer.to_string());
            labels.insert(SOURCE_LABEL.to_string(), g.sources.join(","));
            SeriesResult {
                key: format!("{}={}", group.label, value),
                labels,
                samples,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkEncoding;
    use crate::duplicate_policy::DuplicatePolicy;
    use crate::storage::StoreConfig;
    use crate::types::labels_from;

    fn series_with(key: &str, labels: &[(&str, &str)], points: &[(u64, f64)]) -> Series {
        let mut s = Series::new(
            key,
            labels_from(labels),
            DuplicatePolicy::Block,
            StoreConfig {
                encoding: ChunkEncoding::Uncompressed,
                ..StoreConfig::default()
            },
        )
        .unwrap();
        for &(ts, v) in points {
            s.add(ts, v, None).unwrap();
        }
        s
    }

    #[test]
    fn range_is_inclusive_and_validated() {
        let s = series_with("a", &[], &[(1, 1.0), (2, 2.0), (3, 3.0)]);
        let got = range_series(&s, &RangeArgs::new(2, 3)).unwrap();
        assert_eq!(got, vec![Sample::new(2, 2.0), Sample::new(3, 3.0)]);
        assert_eq!(range_series(&s, &RangeArgs::new(2, 2)).unwrap().len(), 1);
        assert!(matches!(
            range_series(&s, &RangeArgs::new(3, 2)),
            Err(DbError::InvalidTimeRange { .. })
        ));
        assert!(range_series(&s, &RangeArgs::all().aggregate(AggregationType::Sum, 0)).is_err());
    }

    #[test]
    fn count_applies_after_direction() {
        let s = series_with("a", &[], &[(1, 1.0), (2, 2.0), (3, 3.0)]);
        let got = range_series(&s, &RangeArgs::all().reverse().count(2)).unwrap();
        assert_eq!(got, vec![Sample::new(3, 3.0), Sample::new(2, 2.0)]);
    }

    #[test]
    fn aggregated_range() {
        let s = series_with("a", &[], &[(0, 1.0), (4, 3.0), (10, 5.0), (15, 7.0)]);
        let got = range_series(&s, &RangeArgs::all().aggregate(AggregationType::Avg, 10)).unwrap();
        assert_eq!(got, vec![Sample::new(0, 2.0), Sample::new(10, 6.0)]);
    }

    #[test]
    fn grouped_results_reduce_per_timestamp() {
        let group = GroupBy {
            label: "region".into(),
            reducer: Reducer::Sum,
        };
        let out = group_results(
            vec![
                ("a".into(), "eu".into(), vec![Sample::new(1, 1.0), Sample::new(2, 2.0)]),
                ("b".into(), "us".into(), vec![Sample::new(1, 10.0)]),
                ("c".into(), "eu".into(), vec![Sample::new(2, 5.0), Sample::new(3, 1.0)]),
            ],
            &group,
            Some(2),
            true,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key, "region=eu");
        assert_eq!(out[0].samples, vec![Sample::new(3, 1.0), Sample::new(2, 7.0)]);
        assert_eq!(out[0].labels.get(SOURCE_LABEL).map(String::as_str), Some("a,c"));
        assert_eq!(out[0].labels.get(REDUCER_LABEL).map(String::as_str), Some("sum"));
        assert_eq!(out[1].key, "region=us");
    }

    #[test]
    fn mrange_keeps_handle_order_and_skips_unlabelled_in_groups() {
        let series: Vec<RwLock<Series>> = [
            series_with("a", &[("g", "x")], &[(1, 1.0)]),
            series_with("b", &[], &[(1, 2.0)]),
            series_with("c", &[("g", "x")], &[(1, 4.0)]),
        ]
        .into_iter()
        .map(RwLock::new)
        .collect();
        let handles: Vec<&RwLock<Series>> = series.iter().collect();

        let plain = execute_mrange(&handles, &MRangeArgs::new(RangeArgs::all(), vec![])).unwrap();
        let keys: Vec<_> = plain.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["a", "b", "c"]);
        assert!(plain[0].labels.is_empty());

        let grouped = execute_mrange(
            &handles,
            &MRangeArgs::new(RangeArgs::all(), vec![]).group_by("g", Reducer::Max),
        )
        .unwrap();
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].samples, vec![Sample::new(1, 4.0)]);
    }
}
