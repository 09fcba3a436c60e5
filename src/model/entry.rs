use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, TokenMismatchError};
use crate::services::token_guard::{MaskedText, TokenGuard};

/// One line of the caller's corpus: an identifier and its source text.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub id: String,

    #[serde(default)]
    pub text: String,

    /// Entries sharing a group are always sent to the backend together.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl CorpusEntry {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            group: None,
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Ordered, id-unique list of entries for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Corpus {
    entries: Vec<CorpusEntry>,
}

impl Corpus {
    pub fn new(entries: Vec<CorpusEntry>) -> Result<Self, EngineError> {
        let mut seen = HashSet::with_capacity(entries.len());
        for (i, e) in entries.iter().enumerate() {
            if e.id.is_empty() {
                return Err(EngineError::InvalidCorpus(format!("entry {i} has an empty id")));
            }
            if !seen.insert(e.id.as_str()) {
                return Err(EngineError::InvalidCorpus(format!("duplicate id {:?}", e.id)));
            }
        }
        Ok(Self { entries })
    }

    /// Builds a corpus from `(id, text)` pairs, keeping their order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| CorpusEntry::new(k, v))
                .collect(),
        )
    }

    pub fn entries(&self) -> &[CorpusEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A corpus entry with its game tokens masked. Fixed once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub id: String,
    pub text: String,
    pub group: Option<String>,
    pub masked: MaskedText,
}

impl SourceEntry {
    pub fn load(entry: &CorpusEntry, guard: &TokenGuard) -> Self {
        Self {
            id: entry.id.clone(),
            text: entry.text.clone(),
            group: entry.group.clone(),
            masked: guard.mask(&entry.text),
        }
    }

    /// Empty or whitespace-only sources are passed through untouched.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Where an entry ended up during a run.
///
/// `Pending -> CacheHit | Dispatched -> Translated | Failed`, then checked
/// entries become `Clean` or `Issue`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    #[default]
    Pending,
    CacheHit,
    Dispatched,
    Translated,
    Failed,
    Clean,
    Issue,
}

impl EntryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EntryState::Clean | EntryState::Issue | EntryState::Failed)
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct EntryReport {
    pub id: String,
    pub state: EntryState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,

    pub from_cache: bool,

    /// Backend calls spent on this entry's batch.
    pub attempts: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_mismatch: Option<TokenMismatchError>,
}

impl EntryReport {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: EntryState::Pending,
            translation: None,
            from_cache: false,
            attempts: 0,
            error: None,
            token_mismatch: None,
        }
    }
}
