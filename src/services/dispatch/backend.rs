use serde::Serialize;

use crate::error::BackendError;
use crate::services::terminology::GlossaryHint;

/// One backend call: the texts of a batch, already masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchRequest {
    pub texts: Vec<String>,
    pub source_lang: String,
    pub target_lang: String,
    /// Terms found in this batch, for backends that can take a glossary.
    pub glossary: Vec<GlossaryHint>,
}

/// Anything that can translate a batch of strings.
///
/// Implementations normalise whatever their service returns into either one
/// translation per input, in input order, or a [`BackendError`].
pub trait TranslationBackend: Send + Sync {
    fn name(&self) -> &str;

    fn translate_batch(&self, request: &BatchRequest) -> Result<Vec<String>, BackendError>;
}
