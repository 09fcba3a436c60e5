use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::normalize;

/// How much a cached translation can be relied on. Ordered from least to most
/// trusted; a record is never replaced by one of lower trust.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Trust {
    #[default]
    Machine,
    Imported,
    HumanReviewed,
}

impl Trust {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trust::Machine => "machine",
            Trust::Imported => "imported",
            Trust::HumanReviewed => "human_reviewed",
        }
    }
}

/// How two records of equal trust are reconciled when a cache file is imported.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Keep the translation already in the cache unless it is empty.
    #[default]
    KeepExisting,
    /// Keep whichever non-empty translation is longer.
    PreferLonger,
    /// Take the incoming translation unless it is empty.
    PreferIncoming,
}

pub fn hash_norm(norm: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(norm.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub hash: String,
    pub target_lang: String,
    pub terminology_version: String,
}

impl CacheKey {
    pub fn for_source(source: &str, target_lang: &str, terminology_version: &str) -> Self {
        Self {
            hash: hash_norm(&normalize::normalize(source)),
            target_lang: target_lang.to_string(),
            terminology_version: terminology_version.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub target_lang: String,

    #[serde(default)]
    pub terminology_version: String,

    pub original: String,
    pub translation: String,

    #[serde(default)]
    pub normalized: String,

    #[serde(default)]
    pub hash: String,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub source_api: String,

    #[serde(default)]
    pub trust: Trust,
}

impl CacheRecord {
    pub fn new(
        original: &str,
        target_lang: &str,
        terminology_version: &str,
        translation: &str,
        source_api: &str,
    ) -> Self {
        let normalized = normalize::normalize(original);
        let hash = hash_norm(&normalized);
        Self {
            target_lang: target_lang.to_string(),
            terminology_version: terminology_version.to_string(),
            original: original.to_string(),
            translation: translation.to_string(),
            normalized,
            hash,
            updated_at: Utc::now(),
            source_api: source_api.to_string(),
            trust: Trust::Machine,
        }
    }

    pub fn with_trust(mut self, trust: Trust) -> Self {
        self.trust = trust;
        self
    }

    pub fn key(&self) -> CacheKey {
        CacheKey {
            hash: self.hash.clone(),
            target_lang: self.target_lang.clone(),
            terminology_version: self.terminology_version.clone(),
        }
    }

    /// Fills `normalized`/`hash` for records written by older tools or by hand.
    pub fn ensure_norm_hash(&mut self) -> bool {
        let mut changed = false;

        if self.normalized.is_empty() {
            self.normalized = normalize::normalize(&self.original);
            changed = true;
        }

        if self.hash.is_empty() {
            self.hash = hash_norm(&self.normalized);
            changed = true;
        }

        changed
    }

    /// A record without a usable translation.
    pub fn is_stale(&self) -> bool {
        self.translation.trim().is_empty()
    }

    /// Whether a freshly produced `candidate` may overwrite this record.
    pub fn accepts_update(&self, candidate: &CacheRecord) -> bool {
        self.is_stale() || candidate.trust >= self.trust
    }

    /// Whether an imported `candidate` should replace this record under `policy`.
    pub fn yields_to(&self, candidate: &CacheRecord, policy: MergePolicy) -> bool {
        if candidate.trust != self.trust {
            return candidate.trust > self.trust && !candidate.is_stale();
        }

        let cur_empty = self.is_stale();
        let cand_empty = candidate.is_stale();

        if cur_empty && !cand_empty {
            return true;
        }
        if cand_empty {
            return false;
        }

        match policy {
            MergePolicy::KeepExisting => false,
            MergePolicy::PreferLonger => {
                candidate.translation.chars().count() > self.translation.chars().count()
            }
            MergePolicy::PreferIncoming => candidate.translation != self.translation,
        }
    }
}
