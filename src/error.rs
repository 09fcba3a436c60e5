use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::services::pipeline::RunReport;

/// The backend altered, dropped or invented a protected placeholder.
///
/// Never repaired automatically: the caller decides what to do with the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error(
    "token mismatch: expected {expected_count} placeholder(s), found {found_count}; \
     missing {missing:?}, unexpected {unexpected:?} in {text:?}"
)]
pub struct TokenMismatchError {
    pub expected_count: usize,
    pub found_count: usize,
    /// Original token values whose placeholder did not come back exactly once.
    pub missing: Vec<String>,
    /// Placeholders present in the text that were never issued (or issued once and repeated).
    pub unexpected: Vec<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("backend rate limit reached")]
    RateLimited,

    #[error("backend rejected the request: {0}")]
    Permanent(String),

    #[error("backend returned {got} translation(s) for {expected} input(s)")]
    MalformedResponse { expected: usize, got: usize },
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Transient(_) => true,
            BackendError::RateLimited => true,
            BackendError::MalformedResponse { .. } => true,
            BackendError::Permanent(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache document is invalid: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

impl CacheError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminologyError {
    #[error("invalid pattern rule {source_term:?}: {message}")]
    InvalidPattern { source_term: String, message: String },

    #[error("terminology automaton could not be built: {0}")]
    Automaton(String),

    #[error("invalid terminology document: {0}")]
    InvalidDocument(String),
}

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("project I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid project file {path}: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("project already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("project.json not found in {0}")]
    NotFound(PathBuf),

    #[error(transparent)]
    Terminology(#[from] TerminologyError),
}

impl ProjectError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ProjectError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid corpus: {0}")]
    InvalidCorpus(String),

    #[error(transparent)]
    Terminology(#[from] TerminologyError),

    /// The run stopped because results could not be persisted. The partial
    /// report holds everything produced before the failure.
    #[error("cache unavailable, run aborted: {source}")]
    CacheUnavailable {
        #[source]
        source: CacheError,
        partial: Box<RunReport>,
    },

    #[error("configuration error: {0}")]
    Config(String),
}
