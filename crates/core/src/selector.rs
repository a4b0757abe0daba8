//! Label selectors in the Kubernetes string form (`app=web,tier!=db,env in (a,b),!legacy`).

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{CacheError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expression {
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Equal(String, String),
    NotEqual(String, String),
    Exists(String),
    DoesNotExist(String),
}

impl Expression {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Expression::In(key, values) => labels.get(key).map_or(false, |v| values.contains(v)),
            Expression::NotIn(key, values) => labels.get(key).map_or(true, |v| !values.contains(v)),
            Expression::Equal(key, value) => labels.get(key) == Some(value),
            Expression::NotEqual(key, value) => labels.get(key) != Some(value),
            Expression::Exists(key) => labels.contains_key(key),
            Expression::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |vs: &BTreeSet<String>| vs.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Expression::In(k, vs) => write!(f, "{} in ({})", k, join(vs)),
            Expression::NotIn(k, vs) => write!(f, "{} notin ({})", k, join(vs)),
            Expression::Equal(k, v) => write!(f, "{}={}", k, v),
            Expression::NotEqual(k, v) => write!(f, "{}!={}", k, v),
            Expression::Exists(k) => write!(f, "{}", k),
            Expression::DoesNotExist(k) => write!(f, "!{}", k),
        }
    }
}

/// Conjunction of label expressions. An empty selector matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelSelector {
    exprs: SmallVec<[Expression; 4]>,
}

impl LabelSelector {
    pub fn everything() -> Self { Self::default() }

    /// Build from `matchLabels`-style equality pairs.
    pub fn from_labels<K: Into<String>, V: Into<String>>(labels: impl IntoIterator<Item = (K, V)>) -> Self {
        Self { exprs: labels.into_iter().map(|(k, v)| Expression::Equal(k.into(), v.into())).collect() }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut exprs = SmallVec::new();
        for term in split_top_level(s) {
            if term.trim().is_empty() {
                continue;
            }
            exprs.push(parse_term(term)?);
        }
        Ok(Self { exprs })
    }

    pub fn selects_all(&self) -> bool { self.exprs.is_empty() }

    pub fn expressions(&self) -> &[Expression] { &self.exprs }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.exprs.iter().all(|e| e.matches(labels))
    }
}

impl FromStr for LabelSelector {
    type Err = CacheError;
    fn from_str(s: &str) -> Result<Self> { Self::parse(s) }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.exprs.iter().map(|e| e.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

// Commas inside `( ... )` belong to set expressions, not to the conjunction.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn invalid(term: &str, why: &str) -> CacheError {
    CacheError::Resolution(format!("invalid label selector term {:?}: {}", term.trim(), why))
}

fn valid_key(k: &str) -> bool {
    !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

fn valid_value(v: &str) -> bool {
    v.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn checked_pair(term: &str, key: &str, value: &str) -> Result<(String, String)> {
    let (key, value) = (key.trim(), value.trim());
    if !valid_key(key) { return Err(invalid(term, "bad key")); }
    if !valid_value(value) { return Err(invalid(term, "bad value")); }
    Ok((key.to_string(), value.to_string()))
}

fn parse_set(term: &str, rest: &str) -> Result<BTreeSet<String>> {
    let inner = rest
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| invalid(term, "expected (v1,v2,...)"))?;
    let mut values = BTreeSet::new();
    for v in inner.split(',') {
        let v = v.trim();
        if v.is_empty() || !valid_value(v) { return Err(invalid(term, "bad value in set")); }
        values.insert(v.to_string());
    }
    Ok(values)
}

fn parse_term(term: &str) -> Result<Expression> {
    let t = term.trim();
    if let Some(key) = t.strip_prefix('!') {
        let key = key.trim();
        if !valid_key(key) { return Err(invalid(term, "bad key")); }
        return Ok(Expression::DoesNotExist(key.to_string()));
    }
    if let Some(idx) = t.find("!=") {
        let (k, v) = checked_pair(term, &t[..idx], &t[idx + 2..])?;
        return Ok(Expression::NotEqual(k, v));
    }
    if let Some(idx) = t.find("==") {
        let (k, v) = checked_pair(term, &t[..idx], &t[idx + 2..])?;
        return Ok(Expression::Equal(k, v));
    }
    if let Some(idx) = t.find('=') {
        let (k, v) = checked_pair(term, &t[..idx], &t[idx + 1..])?;
        return Ok(Expression::Equal(k, v));
    }
    let (key, rest) = match t.find(char::is_whitespace) {
        Some(idx) => (&t[..idx], t[idx..].trim_start()),
        None => (t, ""),
    };
    if !valid_key(key) { return Err(invalid(term, "bad key")); }
    if rest.is_empty() {
        return Ok(Expression::Exists(key.to_string()));
    }
    if let Some(set) = rest.strip_prefix("notin") {
        return Ok(Expression::NotIn(key.to_string(), parse_set(term, set)?));
    }
    if let Some(set) = rest.strip_prefix("in") {
        return Ok(Expression::In(key.to_string(), parse_set(term, set)?));
    }
    Err(invalid(term, "unknown operator"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_all_operators() {
        let sel = LabelSelector::parse("app=web, tier!=db,env in (prod, staging),zone notin (a),team,!legacy").unwrap();
        assert_eq!(sel.expressions().len(), 6);
        assert_eq!(sel.to_string(), "app=web,tier!=db,env in (prod,staging),zone notin (a),team,!legacy");

        let ok = labels(&[("app", "web"), ("env", "prod"), ("zone", "b"), ("team", "x")]);
        assert!(sel.matches(&ok));
        let legacy = labels(&[("app", "web"), ("env", "prod"), ("team", "x"), ("legacy", "1")]);
        assert!(!sel.matches(&legacy));
        let wrong_env = labels(&[("app", "web"), ("env", "dev"), ("team", "x")]);
        assert!(!sel.matches(&wrong_env));
    }

    #[test]
    fn double_equals_and_empty_value() {
        let sel: LabelSelector = "app==web,flag=".parse().unwrap();
        assert!(sel.matches(&labels(&[("app", "web"), ("flag", "")])));
        assert!(!sel.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn empty_selects_all() {
        let sel = LabelSelector::parse("").unwrap();
        assert!(sel.selects_all());
        assert!(sel.matches(&BTreeMap::new()));
        assert!(LabelSelector::everything().matches(&labels(&[("a", "b")])));
    }

    #[test]
    fn rejects_garbage() {
        assert!(LabelSelector::parse("app in web").is_err());
        assert!(LabelSelector::parse("app in ()").is_err());
        assert!(LabelSelector::parse("a b c").is_err());
        assert!(LabelSelector::parse("=web").is_err());
    }

    #[test]
    fn from_labels_is_equality() {
        let sel = LabelSelector::from_labels([("app", "web")]);
        assert!(sel.matches(&labels(&[("app", "web"), ("x", "y")])));
        assert!(!sel.matches(&labels(&[("app", "api")])));
    }
}
