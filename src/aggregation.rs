//! Single-pass aggregation: accumulators, the bucketing iterator and cross-series reducers.

use crate::error::DbError;
use crate::types::{Sample, Timestamp, Value};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregationType {
    Min,
    Max,
    Avg,
    Sum,
    Count,
    Range,
    First,
    Last,
    StdP,
    StdS,
    VarP,
    VarS,
}

impl AggregationType {
    pub const ALL: [AggregationType; 12] = [
        AggregationType::Min,
        AggregationType::Max,
        AggregationType::Avg,
        AggregationType::Sum,
        AggregationType::Count,
        AggregationType::Range,
        AggregationType::First,
        AggregationType::Last,
        AggregationType::StdP,
        AggregationType::StdS,
        AggregationType::VarP,
        AggregationType::VarS,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AggregationType::Min => "min",
            AggregationType::Max => "max",
            AggregationType::Avg => "avg",
            AggregationType::Sum => "sum",
            AggregationType::Count => "count",
            AggregationType::Range => "range",
            AggregationType::First => "first",
            AggregationType::Last => "last",
            AggregationType::StdP => "std.p",
            AggregationType::StdS => "std.s",
            AggregationType::VarP => "var.p",
            AggregationType::VarS => "var.s",
        }
    }

    /// The kind to use when samples are fed newest-first.
    pub fn reversed(self) -> Self {
        match self {
            AggregationType::First => AggregationType::Last,
            AggregationType::Last => AggregationType::First,
            other => other,
        }
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationType {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        AggregationType::ALL
            .into_iter()
            .find(|a| a.as_str() == lower)
            .ok_or_else(|| DbError::InvalidArgument(format!("unknown aggregation type '{s}'")))
    }
}

/// Running state of one aggregation over one bucket. O(1) per sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Accumulator {
    Min(Option<Value>),
    Max(Option<Value>),
    Sum { sum: Value, count: u64 },
    Avg { sum: Value, count: u64 },
    Count(u64),
    Range(Option<(Value, Value)>),
    First(Option<Value>),
    Last(Option<Value>),
    /// Welford's online mean/variance.
    Variance {
        kind: AggregationType,
        count: u64,
        mean: Value,
        m2: Value,
    },
}

impl Accumulator {
    pub fn new(kind: AggregationType) -> Self {
        match kind {
            AggregationType::Min => Accumulator::Min(None),
            AggregationType::Max => Accumulator::Max(None),
            AggregationType::Sum => Accumulator::Sum { sum: 0.0, count: 0 },
            AggregationType::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
            AggregationType::Count => Accumulator::Count(0),
            AggregationType::Range => Accumulator::Range(None),
            AggregationType::First => Accumulator::First(None),
            AggregationType::Last => Accumulator::Last(None),
            AggregationType::StdP
            | AggregationType::StdS
            | AggregationType::VarP
            | AggregationType::VarS => Accumulator::Variance {
                kind,
                count: 0,
                mean: 0.0,
                m2: 0.0,
            },
        }
    }

    pub fn kind(&self) -> AggregationType {
        match self {
            Accumulator::Min(_) => AggregationType::Min,
            Accumulator::Max(_) => AggregationType::Max,
            Accumulator::Sum { .. } => AggregationType::Sum,
            Accumulator::Avg { .. } => AggregationType::Avg,
            Accumulator::Count(_) => AggregationType::Count,
            Accumulator::Range(_) => AggregationType::Range,
            Accumulator::First(_) => AggregationType::First,
            Accumulator::Last(_) => AggregationType::Last,
            Accumulator::Variance { kind, .. } => *kind,
        }
    }

    pub fn append(&mut self, v: Value) {
        match self {
            Accumulator::Min(m) => *m = Some(m.map_or(v, |cur| if v < cur { v } else { cur })),
            Accumulator::Max(m) => *m = Some(m.map_or(v, |cur| if v > cur { v } else { cur })),
            Accumulator::Sum { sum, count } | Accumulator::Avg { sum, count } => {
                *sum += v;
                *count += 1;
            }
            Accumulator::Count(n) => *n += 1,
            Accumulator::Range(r) => {
                *r = Some(match *r {
                    None => (v, v),
                    Some((lo, hi)) => (
                        if v < lo { v } else { lo },
                        if v > hi { v } else { hi },
                    ),
                })
            }
            Accumulator::First(f) => {
                if f.is_none() {
                    *f = Some(v);
                }
            }
            Accumulator::Last(l) => *l = Some(v),
            Accumulator::Variance {
                count, mean, m2, ..
            } => {
                *count += 1;
                let delta = v - *mean;
                *mean += delta / *count as f64;
                *m2 += delta * (v - *mean);
            }
        }
    }

    /// The aggregate of everything appended since the last reset; `None` when nothing was.
    pub fn finalize(&self) -> Option<Value> {
        match self {
            Accumulator::Min(m) | Accumulator::Max(m) => *m,
            Accumulator::First(v) | Accumulator::Last(v) => *v,
            Accumulator::Sum { sum, count } => (*count > 0).then_some(*sum),
            Accumulator::Avg { sum, count } => (*count > 0).then(|| *sum / *count as f64),
            Accumulator::Count(n) => (*n > 0).then_some(*n as f64),
            Accumulator::Range(r) => r.map(|(lo, hi)| hi - lo),
            Accumulator::Variance {
                kind,
                count,
                m2,
                ..
            } => {
                if *count == 0 {
                    return None;
                }
                let n = *count as f64;
                let var = match kind {
                    AggregationType::VarS | AggregationType::StdS => {
                        if *count < 2 {
                            0.0
                        } else {
                            *m2 / (n - 1.0)
                        }
                    }
                    _ => *m2 / n,
                };
                Some(match kind {
                    AggregationType::StdP | AggregationType::StdS => var.sqrt(),
                    _ => var,
                })
            }
        }
    }

    pub fn reset(&mut self) {
        *self = Accumulator::new(self.kind());
    }
}

#[inline]
pub fn bucket_start(ts: Timestamp, bucket_duration: u64) -> Timestamp {
    ts - ts % bucket_duration
}

/// Groups a time-ordered sample stream into fixed buckets and yields one aggregate per bucket,
/// stamped with the bucket start.
pub struct AggregateIter<I> {
    inner: I,
    bucket_duration: u64,
    acc: Accumulator,
    open: Option<Timestamp>,
    done: bool,
}

impl<I> AggregateIter<I>
where
    I: Iterator<Item = Result<Sample, DbError>>,
{
    /// `reverse` must match the direction of `inner` so that first/last keep their meaning.
    pub fn new(inner: I, kind: AggregationType, bucket_duration: u64, reverse: bool) -> Self {
        let kind = if reverse { kind.reversed() } else { kind };
        Self {
            inner,
            bucket_duration: bucket_duration.max(1),
            acc: Accumulator::new(kind),
            open: None,
            done: false,
        }
    }
}

impl<I> Iterator for AggregateIter<I>
where
    I: Iterator<Item = Result<Sample, DbError>>,
{
    type Item = Result<Sample, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.inner.next() {
                Some(Ok(s)) => {
                    let bucket = bucket_start(s.timestamp, self.bucket_duration);
                    let closed = match self.open {
                        Some(open) if open != bucket => {
                            let out = self.acc.finalize().map(|v| Sample::new(open, v));
                            self.acc.reset();
                            out
                        }
                        _ => None,
                    };
                    self.open = Some(bucket);
                    self.acc.append(s.value);
                    if let Some(out) = closed {
                        return Some(Ok(out));
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    let open = self.open.take()?;
                    return self.acc.finalize().map(|v| Ok(Sample::new(open, v)));
                }
            }
        }
    }
}

/// Cross-series reducer used by grouped multi-range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reducer {
    Sum,
    Min,
    Max,
    Avg,
    Count,
}

impl Reducer {
    pub fn as_str(self) -> &'static str {
        match self {
            Reducer::Sum => "sum",
            Reducer::Min => "min",
            Reducer::Max => "max",
            Reducer::Avg => "avg",
            Reducer::Count => "count",
        }
    }

    pub fn accumulator(self) -> Accumulator {
        Accumulator::new(match self {
            Reducer::Sum => AggregationType::Sum,
            Reducer::Min => AggregationType::Min,
            Reducer::Max => AggregationType::Max,
            Reducer::Avg => AggregationType::Avg,
            Reducer::Count => AggregationType::Count,
        })
    }
}

impl fmt::Display for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Reducer {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(Reducer::Sum),
            "min" => Ok(Reducer::Min),
            "max" => Ok(Reducer::Max),
            "avg" => Ok(Reducer::Avg),
            "count" => Ok(Reducer::Count),
            other => Err(DbError::InvalidArgument(format!("unknown reducer '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(kind: AggregationType, values: &[f64]) -> Option<f64> {
        let mut acc = Accumulator::new(kind);
        for &v in values {
            acc.append(v);
        }
        acc.finalize()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn reference_aggregates() {
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(fold(AggregationType::Min, &v), Some(2.0));
        assert_eq!(fold(AggregationType::Max, &v), Some(9.0));
        assert_eq!(fold(AggregationType::Sum, &v), Some(40.0));
        assert_eq!(fold(AggregationType::Avg, &v), Some(5.0));
        assert_eq!(fold(AggregationType::Count, &v), Some(8.0));
        assert_eq!(fold(AggregationType::Range, &v), Some(7.0));
        assert_eq!(fold(AggregationType::First, &v), Some(2.0));
        assert_eq!(fold(AggregationType::Last, &v), Some(9.0));
        assert!(close(fold(AggregationType::VarP, &v).unwrap(), 4.0));
        assert!(close(fold(AggregationType::StdP, &v).unwrap(), 2.0));
        assert!(close(fold(AggregationType::VarS, &v).unwrap(), 32.0 / 7.0));
        assert!(close(
            fold(AggregationType::StdS, &v).unwrap(),
            (32.0f64 / 7.0).sqrt()
        ));
    }

    #[test]
    fn empty_and_single_sample_buckets() {
        for kind in AggregationType::ALL {
            assert_eq!(fold(kind, &[]), None, "{kind}");
        }
        assert_eq!(fold(AggregationType::VarS, &[3.0]), Some(0.0));
        assert_eq!(fold(AggregationType::StdP, &[3.0]), Some(0.0));
    }

    #[test]
    fn reset_clears_state() {
        let mut acc = Accumulator::new(AggregationType::StdS);
        acc.append(1.0);
        acc.append(100.0);
        acc.reset();
        assert_eq!(acc.finalize(), None);
        assert_eq!(acc.kind(), AggregationType::StdS);
    }

    #[test]
    fn parse_and_display() {
        assert_eq!("STD.P".parse::<AggregationType>().unwrap(), AggregationType::StdP);
        assert_eq!(AggregationType::VarS.to_string(), "var.s");
        assert!("median".parse::<AggregationType>().is_err());
        assert_eq!("Avg".parse::<Reducer>().unwrap(), Reducer::Avg);
    }

    #[test]
    fn aggregate_iter_buckets_forward_and_reverse() {
        let samples: Vec<Sample> = [(0u64, 1.0), (5, 2.0), (10, 3.0), (25, 4.0), (29, 5.0)]
            .into_iter()
            .map(Sample::from)
            .collect();

        let fwd: Vec<Sample> = AggregateIter::new(
            samples.iter().copied().map(Ok),
            AggregationType::First,
            10,
            false,
        )
        .map(|r| r.unwrap())
        .collect();
        assert_eq!(
            fwd,
            vec![Sample::new(0, 1.0), Sample::new(10, 3.0), Sample::new(20, 4.0)]
        );

        let rev: Vec<Sample> = AggregateIter::new(
            samples.iter().rev().copied().map(Ok),
            AggregationType::First,
            10,
            true,
        )
        .map(|r| r.unwrap())
        .collect();
        assert_eq!(
            rev,
            vec![Sample::new(20, 4.0), Sample::new(10, 3.0), Sample::new(0, 1.0)]
        );
    }
}
