//! Label selectors, kept independent of k8s-openapi so the model stays plain data.
//!
//! An empty `match_labels` never matches anything. The apiserver treats an empty
//! selector as "everything"; a rollout narrative must not.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::Equals => value.map(|v| self.values.first() == Some(v)).unwrap_or(false),
            Operator::NotEquals => value.map(|v| self.values.first() != Some(v)).unwrap_or(true),
            Operator::In => value.map(|v| self.values.contains(v)).unwrap_or(false),
            Operator::NotIn => value.map(|v| !self.values.contains(v)).unwrap_or(true),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }

    fn render(&self) -> String {
        match self.operator {
            Operator::Equals => format!("{}={}", self.key, self.values.first().map(String::as_str).unwrap_or("")),
            Operator::NotEquals => format!("{}!={}", self.key, self.values.first().map(String::as_str).unwrap_or("")),
            Operator::In => format!("{} in ({})", self.key, self.values.join(",")),
            Operator::NotIn => format!("{} notin ({})", self.key, self.values.join(",")),
            Operator::Exists => self.key.clone(),
            Operator::DoesNotExist => format!("!{}", self.key),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<Requirement>,
}

impl LabelSelector {
    pub fn from_labels<K, V, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    /// Reject selectors the fabric refuses to watch with.
    pub fn validate(&self) -> Result<()> {
        if self.match_labels.is_empty() {
            return Err(Error::SelectorInvalid("empty matchLabels".into()));
        }
        for (k, _) in self.match_labels.iter() {
            if k.is_empty() {
                return Err(Error::SelectorInvalid("empty label key".into()));
            }
        }
        for r in self.match_expressions.iter() {
            if r.key.is_empty() {
                return Err(Error::SelectorInvalid("empty expression key".into()));
            }
            if matches!(r.operator, Operator::In | Operator::NotIn) && r.values.is_empty() {
                return Err(Error::SelectorInvalid(format!("{} requires values", r.key)));
            }
        }
        Ok(())
    }

    pub fn requirements(&self) -> Vec<Requirement> {
        let mut out: Vec<Requirement> = self
            .match_labels
            .iter()
            .map(|(k, v)| Requirement { key: k.clone(), operator: Operator::Equals, values: vec![v.clone()] })
            .collect();
        out.extend(self.match_expressions.iter().cloned());
        out
    }

    /// Render as an apiserver `labelSelector` query string.
    pub fn to_query(&self) -> String {
        self.requirements().iter().map(Requirement::render).collect::<Vec<_>>().join(",")
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        if self.match_labels.is_empty() {
            return false;
        }
        self.requirements().iter().all(|r| r.matches(labels))
    }
}

/// Parse a `labelSelector` query string (`a=b,env in (x,y),!legacy`).
pub fn parse_query(query: &str) -> Result<Vec<Requirement>> {
    let mut out = Vec::new();
    for term in split_terms(query) {
        let term = term.trim();
        if term.is_empty() {
            continue;
        }
        out.push(parse_term(term)?);
    }
    Ok(out)
}

/// Evaluate a query string against a label set. An empty query matches everything,
/// which mirrors apiserver semantics; callers guard emptiness before getting here.
pub fn query_matches(query: &str, labels: &BTreeMap<String, String>) -> bool {
    match parse_query(query) {
        Ok(reqs) => reqs.iter().all(|r| r.matches(labels)),
        Err(_) => false,
    }
}

fn split_terms(query: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in query.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&query[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&query[start..]);
    out
}

fn parse_set(key: &str, rest: &str, operator: Operator) -> Result<Requirement> {
    let inner = rest
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| Error::SelectorInvalid(format!("malformed set for {key}")))?;
    let values: Vec<String> = inner.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect();
    if values.is_empty() {
        return Err(Error::SelectorInvalid(format!("{key} requires values")));
    }
    Ok(Requirement { key: key.trim().to_string(), operator, values })
}

fn parse_term(term: &str) -> Result<Requirement> {
    if let Some(key) = term.strip_prefix('!') {
        return Ok(Requirement { key: key.trim().to_string(), operator: Operator::DoesNotExist, values: Vec::new() });
    }
    if let Some((key, rest)) = term.split_once(" notin ") {
        return parse_set(key, rest, Operator::NotIn);
    }
    if let Some((key, rest)) = term.split_once(" in ") {
        return parse_set(key, rest, Operator::In);
    }
    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Requirement { key: key.trim().to_string(), operator: Operator::NotEquals, values: vec![value.trim().to_string()] });
    }
    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::SelectorInvalid(format!("malformed term: {term}")));
        }
        return Ok(Requirement { key: key.to_string(), operator: Operator::Equals, values: vec![value.trim().to_string()] });
    }
    Ok(Requirement { key: term.to_string(), operator: Operator::Exists, values: Vec::new() })
}
