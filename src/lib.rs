//! Incremental translation engine for Stardew Valley mod text.
//!
//! Game tokens are masked before text reaches a backend, a per-project cache
//! skips anything already translated, a terminology table keeps vocabulary
//! consistent, and a quality pass reviews the result.

pub mod config;
pub mod error;
pub mod model;
pub mod protocol;
pub mod services;

pub use config::{EngineConfig, QualityConfig};
pub use error::{BackendError, CacheError, EngineError, TerminologyError, TokenMismatchError};
pub use model::entry::{Corpus, CorpusEntry, EntryReport, EntryState};
pub use services::dispatch::{BatchRequest, CancelToken, TranslationBackend};
pub use services::pipeline::{run, RunContext, RunReport, RunStats};
