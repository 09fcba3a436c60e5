//! Scriptable backend for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::error::BackendError;
use crate::services::dispatch::{BatchRequest, TranslationBackend};

#[derive(Debug, Clone)]
pub enum MockMode {
    /// Returns every text unchanged.
    Echo,
    /// Prepends a fixed string to every text.
    Prefix(String),
    /// Looks texts up in a table, echoing anything unknown.
    Mappings(HashMap<String, String>),
    /// Fails every call with the given error.
    Fail(BackendError),
    /// Fails the first `n` calls with a transient error, then echoes.
    FailTimes(usize),
    /// Returns one translation fewer than requested.
    Short,
    /// Echoes with every placeholder removed.
    DropPlaceholders,
    /// Echoes with the placeholders of each text in reverse order.
    ReorderPlaceholders,
}

#[derive(Debug)]
pub struct MockBackend {
    mode: MockMode,
    delays: Vec<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<BatchRequest>>,
}

impl MockBackend {
    pub fn new(mode: MockMode) -> Self {
        Self {
            mode,
            delays: Vec::new(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleeps before answering; call `n` sleeps `delays[n % len]`.
    pub fn with_delays(mut self, delays: Vec<Duration>) -> Self {
        self.delays = delays;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<BatchRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TranslationBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn translate_batch(&self, request: &BatchRequest) -> Result<Vec<String>, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if !self.delays.is_empty() {
            thread::sleep(self.delays[call % self.delays.len()]);
        }

        let texts = &request.texts;
        match &self.mode {
            MockMode::Echo => Ok(texts.clone()),
            MockMode::Prefix(p) => Ok(texts.iter().map(|t| format!("{p}{t}")).collect()),
            MockMode::Mappings(map) => Ok(texts
                .iter()
                .map(|t| map.get(t).cloned().unwrap_or_else(|| t.clone()))
                .collect()),
            MockMode::Fail(e) => Err(e.clone()),
            MockMode::FailTimes(n) if call < *n => {
                Err(BackendError::Transient(format!("scripted failure {}", call + 1)))
            }
            MockMode::FailTimes(_) => Ok(texts.clone()),
            MockMode::Short => Ok(texts.iter().skip(1).cloned().collect()),
            MockMode::DropPlaceholders => Ok(texts
                .iter()
                .map(|t| {
                    let (parts, _) = split_placeholders(t);
                    parts.concat()
                })
                .collect()),
            MockMode::ReorderPlaceholders => Ok(texts
                .iter()
                .map(|t| {
                    let (parts, mut holders) = split_placeholders(t);
                    holders.reverse();
                    let mut out = String::new();
                    for (i, part) in parts.iter().enumerate() {
                        out.push_str(part);
                        if let Some(h) = holders.get(i) {
                            out.push_str(h);
                        }
                    }
                    out
                })
                .collect()),
        }
    }
}

/// Splits `text` into the runs between `⟦…⟧` placeholders and the placeholders.
/// There is always one more run than placeholders.
fn split_placeholders(text: &str) -> (Vec<&str>, Vec<&str>) {
    let mut parts = Vec::new();
    let mut holders = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find('⟦') {
        let Some(close) = rest[open..].find('⟧') else {
            break;
        };
        let close = open + close + '⟧'.len_utf8();
        parts.push(&rest[..open]);
        holders.push(&rest[open..close]);
        rest = &rest[close..];
    }
    parts.push(rest);

    (parts, holders)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(texts: &[&str]) -> BatchRequest {
        BatchRequest {
            texts: texts.iter().map(|t| t.to_string()).collect(),
            source_lang: "en".into(),
            target_lang: "zh".into(),
            glossary: Vec::new(),
        }
    }

    #[test]
    fn reorders_and_drops_placeholders() {
        let req = request(&["a ⟦P1⟧ b ⟦P2⟧ c"]);
        let reordered = MockBackend::new(MockMode::ReorderPlaceholders)
            .translate_batch(&req)
            .unwrap();
        assert_eq!(reordered, vec!["a ⟦P2⟧ b ⟦P1⟧ c"]);

        let dropped = MockBackend::new(MockMode::DropPlaceholders)
            .translate_batch(&req)
            .unwrap();
        assert_eq!(dropped, vec!["a  b  c"]);
    }

    #[test]
    fn fail_times_then_recovers() {
        let backend = MockBackend::new(MockMode::FailTimes(1));
        let req = request(&["x"]);
        assert!(backend.translate_batch(&req).is_err());
        assert_eq!(backend.translate_batch(&req).unwrap(), vec!["x"]);
        assert_eq!(backend.calls(), 2);
    }

    #[test]
    fn mappings_fall_back_to_echo() {
        let map = HashMap::from([("Hi".to_string(), "你好".to_string())]);
        let out = MockBackend::new(MockMode::Mappings(map))
            .translate_batch(&request(&["Hi", "Bye"]))
            .unwrap();
        assert_eq!(out, vec!["你好", "Bye"]);
    }
}
