use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::matcher::TermMatcher;
use super::rule::TerminologyRule;
use crate::error::TerminologyError;

/// The user's terminology list.
///
/// Any edit drops the compiled matcher; the next [`snapshot`](Self::snapshot)
/// recompiles it.
#[derive(Debug, Default)]
pub struct TerminologyTable {
    rules: Vec<TerminologyRule>,
    case_insensitive: bool,
    compiled: RwLock<Option<Arc<TermMatcher>>>,
}

impl Clone for TerminologyTable {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules.clone(),
            case_insensitive: self.case_insensitive,
            compiled: RwLock::new(None),
        }
    }
}

impl TerminologyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: impl IntoIterator<Item = TerminologyRule>) -> Self {
        let mut table = Self::new();
        table.import(rules);
        table
    }

    pub fn case_insensitive(mut self, yes: bool) -> Self {
        self.case_insensitive = yes;
        self.invalidate();
        self
    }

    pub fn rules(&self) -> &[TerminologyRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Adds a rule. A rule with the same source term and mode is replaced in
    /// place, keeping its original position.
    pub fn add(&mut self, rule: TerminologyRule) {
        match self
            .rules
            .iter_mut()
            .find(|r| r.source == rule.source && r.mode == rule.mode)
        {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
        self.invalidate();
    }

    pub fn import(&mut self, rules: impl IntoIterator<Item = TerminologyRule>) -> usize {
        let mut count = 0usize;
        for rule in rules {
            self.add(rule);
            count += 1;
        }
        count
    }

    pub fn remove(&mut self, source: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.source != source);
        let removed = self.rules.len() != before;
        if removed {
            self.invalidate();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.rules.clear();
        self.invalidate();
    }

    fn invalidate(&mut self) {
        *self
            .compiled
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Stable identifier of the current rule set, used in cache keys.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update([u8::from(self.case_insensitive)]);
        for r in &self.rules {
            let line = serde_json::to_string(r).unwrap_or_default();
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(&hasher.finalize()[..8])
    }

    /// The compiled matcher for the current rules, built on first use.
    pub fn snapshot(&self) -> Result<Arc<TermMatcher>, TerminologyError> {
        if let Some(m) = self
            .compiled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(Arc::clone(m));
        }

        let mut slot = self.compiled.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(m) = slot.as_ref() {
            return Ok(Arc::clone(m));
        }

        let matcher = Arc::new(TermMatcher::compile(
            self.rules.clone(),
            self.case_insensitive,
            self.fingerprint(),
        )?);
        *slot = Some(Arc::clone(&matcher));
        Ok(matcher)
    }

    /// Reads either a flat `{"source": "target"}` object or an array of rules.
    pub fn from_json_str(s: &str) -> Result<Self, TerminologyError> {
        let v: Value =
            serde_json::from_str(s).map_err(|e| TerminologyError::InvalidDocument(e.to_string()))?;

        let rules: Vec<TerminologyRule> = match v {
            Value::Object(map) => map
                .into_iter()
                .map(|(source, target)| match target {
                    Value::String(t) => Ok(TerminologyRule::literal(source, t)),
                    other => Err(TerminologyError::InvalidDocument(format!(
                        "term {source:?} maps to a non-string value: {other}"
                    ))),
                })
                .collect::<Result<_, _>>()?,
            Value::Array(_) => serde_json::from_value(v)
                .map_err(|e| TerminologyError::InvalidDocument(e.to_string()))?,
            _ => {
                return Err(TerminologyError::InvalidDocument(
                    "expected an object or an array".into(),
                ))
            }
        };

        Ok(Self::from_rules(rules))
    }

    pub fn to_json_string(&self) -> Result<String, TerminologyError> {
        serde_json::to_string_pretty(&self.rules)
            .map_err(|e| TerminologyError::InvalidDocument(e.to_string()))
    }
}
