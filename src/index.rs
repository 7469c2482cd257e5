//! Label index: `(label, value) -> {series key}` postings and predicate resolution.

use crate::error::DbError;
use crate::types::Labels;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::Bound;
use std::str::FromStr;
use std::sync::RwLock;

/// A label predicate. `Equal(k, "")` matches series without `k`; `NotEqual(k, "")` matches
/// series that have `k`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPredicate {
    Equal(String, String),
    NotEqual(String, String),
    ListMatch(String, Vec<String>),
    ListExclude(String, Vec<String>),
}

impl QueryPredicate {
    /// Whether this predicate can seed a resolution (a positive, non-empty match).
    fn is_positive(&self) -> bool {
        match self {
            QueryPredicate::Equal(_, v) => !v.is_empty(),
            QueryPredicate::ListMatch(_, vs) => !vs.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for QueryPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryPredicate::Equal(k, v) => write!(f, "{k}={v}"),
            QueryPredicate::NotEqual(k, v) => write!(f, "{k}!={v}"),
            QueryPredicate::ListMatch(k, vs) => write!(f, "{k}=({})", vs.join(",")),
            QueryPredicate::ListExclude(k, vs) => write!(f, "{k}!=({})", vs.join(",")),
        }
    }
}

impl FromStr for QueryPredicate {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, rest, negated) = if let Some(pos) = s.find("!=") {
            (&s[..pos], &s[pos + 2..], true)
        } else if let Some(pos) = s.find('=') {
            (&s[..pos], &s[pos + 1..], false)
        } else {
            return Err(DbError::InvalidPredicate(s.to_string()));
        };
        if key.is_empty() {
            return Err(DbError::InvalidPredicate(s.to_string()));
        }
        let key = key.to_string();

        if let Some(inner) = rest.strip_prefix('(') {
            let inner = inner
                .strip_suffix(')')
                .ok_or_else(|| DbError::InvalidPredicate(s.to_string()))?;
            let values: Vec<String> = inner
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            return Ok(if negated {
                QueryPredicate::ListExclude(key, values)
            } else {
                QueryPredicate::ListMatch(key, values)
            });
        }

        let value = rest.to_string();
        Ok(if negated {
            QueryPredicate::NotEqual(key, value)
        } else {
            QueryPredicate::Equal(key, value)
        })
    }
}

/// Parses a list of textual predicates.
pub fn parse_predicates<S: AsRef<str>>(items: &[S]) -> Result<Vec<QueryPredicate>, DbError> {
    items.iter().map(|s| s.as_ref().parse()).collect()
}

#[derive(Debug, Default)]
struct IndexInner {
    postings: BTreeMap<(String, String), BTreeSet<String>>,
    /// label name -> keys carrying it
    by_label: HashMap<String, BTreeSet<String>>,
    all: BTreeSet<String>,
}

impl IndexInner {
    fn bucket(&self, k: &str, v: &str) -> Option<&BTreeSet<String>> {
        self.postings.get(&(k.to_string(), v.to_string()))
    }

    fn positive_set(&self, p: &QueryPredicate) -> BTreeSet<String> {
        match p {
            QueryPredicate::Equal(k, v) => self.bucket(k, v).cloned().unwrap_or_default(),
            QueryPredicate::ListMatch(k, vs) => vs
                .iter()
                .filter_map(|v| self.bucket(k, v))
                .flat_map(|b| b.iter().cloned())
                .collect(),
            _ => BTreeSet::new(),
        }
    }

    fn retain(&self, keys: &mut BTreeSet<String>, p: &QueryPredicate) {
        let empty = BTreeSet::new();
        match p {
            QueryPredicate::Equal(k, v) if v.is_empty() => {
                let with = self.by_label.get(k).unwrap_or(&empty);
                keys.retain(|key| !with.contains(key));
            }
            QueryPredicate::NotEqual(k, v) if v.is_empty() => {
                let with = self.by_label.get(k).unwrap_or(&empty);
                keys.retain(|key| with.contains(key));
            }
            QueryPredicate::Equal(..) | QueryPredicate::ListMatch(..) => {
                let set = self.positive_set(p);
                keys.retain(|key| set.contains(key));
            }
            QueryPredicate::NotEqual(k, v) => {
                let set = self.bucket(k, v).unwrap_or(&empty);
                keys.retain(|key| !set.contains(key));
            }
            QueryPredicate::ListExclude(k, vs) => {
                for v in vs {
                    if let Some(set) = self.bucket(k, v) {
                        keys.retain(|key| !set.contains(key));
                    }
                }
            }
        }
    }
}

/// Secondary index owned by one engine instance.
#[derive(Debug, Default)]
pub struct LabelIndex {
    inner: RwLock<IndexInner>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self, key: &str, labels: &Labels) -> Result<(), DbError> {
        let mut g = self.inner.write()?;
        g.all.insert(key.to_string());
        for (k, v) in labels {
            g.postings
                .entry((k.clone(), v.clone()))
                .or_default()
                .insert(key.to_string());
            g.by_label
                .entry(k.clone())
                .or_default()
                .insert(key.to_string());
        }
        Ok(())
    }

    /// Removes `key` from every posting of `labels`; emptied buckets are dropped.
    pub fn remove(&self, key: &str, labels: &Labels) -> Result<(), DbError> {
        let mut g = self.inner.write()?;
        g.all.remove(key);
        for (k, v) in labels {
            let posting = (k.clone(), v.clone());
            if let Some(set) = g.postings.get_mut(&posting) {
                set.remove(key);
                if set.is_empty() {
                    g.postings.remove(&posting);
                }
            }
            if let Some(set) = g.by_label.get_mut(k) {
                set.remove(key);
                if set.is_empty() {
                    g.by_label.remove(k);
                }
            }
        }
        Ok(())
    }

    /// Keys matching every predicate, in lexicographic order.
    pub fn resolve(&self, predicates: &[QueryPredicate]) -> Result<BTreeSet<String>, DbError> {
        let Some(seed) = predicates.iter().position(QueryPredicate::is_positive) else {
            return Err(DbError::NoMatchers);
        };
        let g = self.inner.read()?;
        let mut keys = g.positive_set(&predicates[seed]);
        for (i, p) in predicates.iter().enumerate() {
            if i == seed || keys.is_empty() {
                continue;
            }
            g.retain(&mut keys, p);
        }
        Ok(keys)
    }

    pub fn len(&self) -> Result<usize, DbError> {
        Ok(self.inner.read()?.all.len())
    }

    pub fn is_empty(&self) -> Result<bool, DbError> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<(), DbError> {
        let mut g = self.inner.write()?;
        *g = IndexInner::default();
        Ok(())
    }
}

/// Ordered cursor over a resolved key set that can resume after the last observed key.
///
/// Used by scans that drop their locks between keys: if the set changes underneath, iteration
/// continues from the first key strictly greater than the last one returned.
#[derive(Debug, Clone)]
pub struct KeyCursor {
    keys: BTreeSet<String>,
    last: Option<String>,
}

impl KeyCursor {
    pub fn new(keys: BTreeSet<String>) -> Self {
        Self { keys, last: None }
    }

    /// Replaces the key set (e.g. after a re-resolve); the position is kept.
    pub fn reseed(&mut self, keys: BTreeSet<String>) {
        self.keys = keys;
    }
}

impl Iterator for KeyCursor {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let next = match &self.last {
            None => self.keys.iter().next(),
            Some(last) => self
                .keys
                .range::<String, _>((Bound::Excluded(last), Bound::Unbounded))
                .next(),
        }?
        .clone();
        self.last = Some(next.clone());
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::labels_from;

    fn p(s: &str) -> QueryPredicate {
        s.parse().unwrap()
    }

    fn sample_index() -> LabelIndex {
        let idx = LabelIndex::new();
        idx.index("a", &labels_from(&[("region", "eu"), ("host", "h1")]))
            .unwrap();
        idx.index("b", &labels_from(&[("region", "us"), ("host", "h2")]))
            .unwrap();
        idx.index("c", &labels_from(&[("region", "eu")])).unwrap();
        idx
    }

    fn keys(set: BTreeSet<String>) -> Vec<String> {
        set.into_iter().collect()
    }

    #[test]
    fn parses_textual_forms() {
        assert_eq!(p("a=b"), QueryPredicate::Equal("a".into(), "b".into()));
        assert_eq!(p("a!=b"), QueryPredicate::NotEqual("a".into(), "b".into()));
        assert_eq!(
            p("a=(x, y)"),
            QueryPredicate::ListMatch("a".into(), vec!["x".into(), "y".into()])
        );
        assert_eq!(
            p("a!=(x)"),
            QueryPredicate::ListExclude("a".into(), vec!["x".into()])
        );
        assert_eq!(p("a="), QueryPredicate::Equal("a".into(), "".into()));
        assert!("novalue".parse::<QueryPredicate>().is_err());
        assert!("=v".parse::<QueryPredicate>().is_err());
        assert!("a=(x".parse::<QueryPredicate>().is_err());
    }

    #[test]
    fn resolve_requires_positive_matcher() {
        let idx = sample_index();
        assert!(matches!(idx.resolve(&[p("region!=eu")]), Err(DbError::NoMatchers)));
        assert!(matches!(idx.resolve(&[p("host=")]), Err(DbError::NoMatchers)));
        assert!(matches!(idx.resolve(&[]), Err(DbError::NoMatchers)));
    }

    #[test]
    fn resolve_intersects_predicates() {
        let idx = sample_index();
        assert_eq!(keys(idx.resolve(&[p("region=eu")]).unwrap()), ["a", "c"]);
        assert_eq!(keys(idx.resolve(&[p("region=eu"), p("host=")]).unwrap()), ["c"]);
        assert_eq!(keys(idx.resolve(&[p("region=eu"), p("host!=")]).unwrap()), ["a"]);
        assert_eq!(
            keys(idx.resolve(&[p("region=(eu,us)"), p("host!=h1")]).unwrap()),
            ["b", "c"]
        );
        assert_eq!(
            keys(idx.resolve(&[p("region=(eu,us)"), p("host!=(h1,h2)")]).unwrap()),
            ["c"]
        );
        assert!(idx.resolve(&[p("region=ap")]).unwrap().is_empty());
    }

    #[test]
    fn removal_is_immediately_visible() {
        let idx = sample_index();
        idx.remove("a", &labels_from(&[("region", "eu"), ("host", "h1")]))
            .unwrap();
        assert_eq!(keys(idx.resolve(&[p("region=eu")]).unwrap()), ["c"]);
        assert!(idx.resolve(&[p("host=h1")]).unwrap().is_empty());
        assert_eq!(idx.len().unwrap(), 2);
        idx.clear().unwrap();
        assert!(idx.is_empty().unwrap());
    }

    #[test]
    fn cursor_resumes_after_last_key() {
        let mut set: BTreeSet<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let mut cur = KeyCursor::new(set.clone());
        assert_eq!(cur.next().as_deref(), Some("a"));
        assert_eq!(cur.next().as_deref(), Some("b"));
        set.remove("c");
        set.insert("bb".to_string());
        cur.reseed(set);
        assert_eq!(cur.next().as_deref(), Some("bb"));
        assert_eq!(cur.next().as_deref(), Some("d"));
        assert_eq!(cur.next(), None);
    }
}
