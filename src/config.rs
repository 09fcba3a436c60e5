use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::services::dispatch::{DispatchConfig, RetryPolicy};
use crate::services::translation_memory::MergePolicy;

fn default_excluded_words() -> Vec<String> {
    ["joja", "true", "false", "null", "stardew", "valley", "id"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualityConfig {
    pub check_mixed_language: bool,
    pub check_tokens: bool,
    pub check_completeness: bool,
    /// Largest tolerated share of source-script letters in a translation.
    pub mixed_language_max_ratio: f64,
    /// Shorter source-script runs are ignored (ids, units, abbreviations).
    pub min_word_len: usize,
    /// Compared case-insensitively against whole words.
    pub excluded_words: Vec<String>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            check_mixed_language: true,
            check_tokens: true,
            check_completeness: true,
            mixed_language_max_ratio: 0.0,
            min_word_len: 3,
            excluded_words: default_excluded_words(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub min_batch_interval_ms: u64,
    pub parallelism: usize,
    pub merge_policy: MergePolicy,
    pub quality: QualityConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_attempts: 3,
            base_backoff_ms: 800,
            max_backoff_ms: 30_000,
            min_batch_interval_ms: 0,
            parallelism: 2,
            merge_policy: MergePolicy::KeepExisting,
            quality: QualityConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let data = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        let cfg: EngineConfig = serde_json::from_str(&data)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.batch_size == 0 {
            return Err(EngineError::Config("batch_size must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(EngineError::Config("max_attempts must be at least 1".into()));
        }
        if self.parallelism == 0 {
            return Err(EngineError::Config("parallelism must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.quality.mixed_language_max_ratio) {
            return Err(EngineError::Config(
                "quality.mixed_language_max_ratio must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            batch_size: self.batch_size,
            parallelism: self.parallelism,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.base_backoff_ms),
                max_delay: Duration::from_millis(self.max_backoff_ms),
                jitter: true,
            },
            min_batch_interval: Duration::from_millis(self.min_batch_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_keep_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"batch_size": 5, "quality": {"min_word_len": 4}}"#).unwrap();
        assert_eq!(cfg.batch_size, 5);
        assert_eq!(cfg.parallelism, 2);
        assert_eq!(cfg.quality.min_word_len, 4);
        assert!(cfg.quality.excluded_words.iter().any(|w| w == "joja"));
        assert_eq!(cfg.merge_policy, MergePolicy::KeepExisting);
    }

    #[test]
    fn rejects_zero_sizes() {
        let cfg = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn from_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{"parallelism": 0}"#).unwrap();
        assert!(EngineConfig::from_file(&path).is_err());

        fs::write(&path, r#"{"min_batch_interval_ms": 250}"#).unwrap();
        let cfg = EngineConfig::from_file(&path).unwrap();
        assert_eq!(
            cfg.dispatch_config().min_batch_interval,
            Duration::from_millis(250)
        );
    }
}
