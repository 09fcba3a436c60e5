//! Per-project translation cache.
//!
//! Readers take a cheap snapshot of the record map and never wait on a
//! writer's disk I/O. Writers are serialized through one mutex, which also
//! holds the records that could not be persisted yet.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use regex::Regex;
use serde::Serialize;

use super::model::{CacheKey, CacheRecord, MergePolicy, Trust};
use super::normalize;
use super::store::{self, CacheStore};
use crate::error::CacheError;

pub type CacheSnapshot = Arc<HashMap<CacheKey, CacheRecord>>;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub added: usize,
    pub replaced: usize,
    pub kept: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub project: String,
    pub entries: usize,
    pub pending: usize,
    pub by_trust: BTreeMap<String, usize>,
    pub by_target_lang: BTreeMap<String, usize>,
}

pub struct TranslationCache {
    project: String,
    store: Arc<dyn CacheStore>,
    records: RwLock<CacheSnapshot>,
    /// Records accepted in memory but not yet durable. Locked by every writer.
    pending: Mutex<Vec<CacheRecord>>,
}

impl std::fmt::Debug for TranslationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationCache")
            .field("project", &self.project)
            .field("entries", &self.snapshot().len())
            .finish()
    }
}

impl TranslationCache {
    pub fn open(project: impl Into<String>, store: Arc<dyn CacheStore>) -> Result<Self, CacheError> {
        let project = project.into();
        let records: HashMap<CacheKey, CacheRecord> = store
            .enumerate(&project)?
            .into_iter()
            .map(|r| (r.key(), r))
            .collect();

        tracing::debug!(%project, entries = records.len(), "translation cache opened");

        Ok(Self {
            project,
            store,
            records: RwLock::new(Arc::new(records)),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// A consistent view of all records at this moment.
    pub fn snapshot(&self) -> CacheSnapshot {
        Arc::clone(&self.records.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Looks up a usable translation for `source`.
    pub fn get(&self, source: &str, target_lang: &str, terminology_version: &str) -> Option<CacheRecord> {
        let key = CacheKey::for_source(source, target_lang, terminology_version);
        let norm = normalize::normalize(source);
        self.snapshot()
            .get(&key)
            .filter(|r| r.normalized == norm && !r.is_stale())
            .cloned()
    }

    pub fn put(
        &self,
        source: &str,
        target_lang: &str,
        terminology_version: &str,
        translation: &str,
        source_api: &str,
    ) -> Result<bool, CacheError> {
        let record = CacheRecord::new(source, target_lang, terminology_version, translation, source_api);
        Ok(self.put_batch(vec![record])? == 1)
    }

    /// Stores a translation a person has checked. Machine output never replaces it.
    pub fn put_reviewed(
        &self,
        source: &str,
        target_lang: &str,
        terminology_version: &str,
        translation: &str,
    ) -> Result<bool, CacheError> {
        let record = CacheRecord::new(source, target_lang, terminology_version, translation, "human")
            .with_trust(Trust::HumanReviewed);
        Ok(self.put_batch(vec![record])? == 1)
    }

    /// Accepts each record unless it would overwrite a better-trusted one,
    /// then persists everything still pending in one store write.
    ///
    /// On a store failure the accepted records stay visible to readers and are
    /// retried by the next write or by [`flush`](Self::flush).
    pub fn put_batch(&self, records: Vec<CacheRecord>) -> Result<usize, CacheError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let accepted = self.accept(&mut pending, records);
        self.persist(&mut pending)?;
        Ok(accepted)
    }

    /// Accepts records into memory only; they are written by the next
    /// successful [`put_batch`](Self::put_batch) or [`flush`](Self::flush).
    pub fn stage(&self, records: Vec<CacheRecord>) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.accept(&mut pending, records)
    }

    fn accept(&self, pending: &mut Vec<CacheRecord>, records: Vec<CacheRecord>) -> usize {
        let mut accepted = 0usize;
        let mut guard = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let map = Arc::make_mut(&mut guard);
        for mut r in records {
            r.ensure_norm_hash();
            let key = r.key();
            let take = match map.get(&key) {
                Some(existing) => existing.accepts_update(&r),
                None => true,
            };
            if take {
                map.insert(key, r.clone());
                pending.push(r);
                accepted += 1;
            }
        }
        accepted
    }

    /// Merges records from another cache under `policy`.
    ///
    /// Records marked `machine` come in as `imported`; `human_reviewed`
    /// records keep their trust.
    pub fn merge(&self, records: Vec<CacheRecord>, policy: MergePolicy) -> Result<MergeReport, CacheError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut report = MergeReport::default();

        {
            let mut guard = self.records.write().unwrap_or_else(PoisonError::into_inner);
            let map = Arc::make_mut(&mut guard);
            for mut r in records {
                r.ensure_norm_hash();
                if r.trust == Trust::Machine {
                    r.trust = Trust::Imported;
                }
                let key = r.key();
                match map.get(&key) {
                    None if r.is_stale() => report.kept += 1,
                    None => {
                        map.insert(key, r.clone());
                        pending.push(r);
                        report.added += 1;
                    }
                    Some(existing) if existing.yields_to(&r, policy) => {
                        map.insert(key, r.clone());
                        pending.push(r);
                        report.replaced += 1;
                    }
                    Some(_) => report.kept += 1,
                }
            }
        }

        tracing::info!(
            project = %self.project,
            added = report.added,
            replaced = report.replaced,
            kept = report.kept,
            ?policy,
            "cache merged"
        );

        self.persist(&mut pending)?;
        Ok(report)
    }

    /// Deletes records whose source text matches `pattern`, or every record.
    ///
    /// The store is updated first; on a store failure nothing changes in memory.
    pub fn invalidate(&self, pattern: Option<&Regex>) -> Result<usize, CacheError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        let doomed: HashSet<CacheKey> = self
            .snapshot()
            .iter()
            .filter(|(_, r)| pattern.map_or(true, |re| re.is_match(&r.original)))
            .map(|(k, _)| k.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let keys: Vec<CacheKey> = doomed.iter().cloned().collect();
        self.store.delete(&self.project, &keys)?;

        {
            let mut guard = self.records.write().unwrap_or_else(PoisonError::into_inner);
            let map = Arc::make_mut(&mut guard);
            map.retain(|k, _| !doomed.contains(k));
        }
        pending.retain(|r| !doomed.contains(&r.key()));

        tracing::info!(project = %self.project, removed = doomed.len(), "cache invalidated");
        Ok(doomed.len())
    }

    /// Retries persisting records a previous write could not save.
    pub fn flush(&self) -> Result<usize, CacheError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let n = pending.len();
        self.persist(&mut pending)?;
        Ok(n)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn persist(&self, pending: &mut Vec<CacheRecord>) -> Result<(), CacheError> {
        if pending.is_empty() {
            return Ok(());
        }
        match self.store.put(&self.project, pending) {
            Ok(()) => {
                tracing::debug!(project = %self.project, written = pending.len(), "cache persisted");
                pending.clear();
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    project = %self.project,
                    pending = pending.len(),
                    error = %e,
                    "cache write failed; records kept in memory"
                );
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let snapshot = self.snapshot();
        let mut stats = CacheStats {
            project: self.project.clone(),
            entries: snapshot.len(),
            pending: self.pending_len(),
            ..CacheStats::default()
        };
        for r in snapshot.values() {
            *stats.by_trust.entry(r.trust.as_str().to_string()).or_insert(0) += 1;
            *stats.by_target_lang.entry(r.target_lang.clone()).or_insert(0) += 1;
        }
        stats
    }

    pub fn export_json(&self, path: &Path) -> Result<usize, CacheError> {
        let mut records: Vec<CacheRecord> = self.snapshot().values().cloned().collect();
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        store::write_records(path, &records)?;
        Ok(records.len())
    }

    pub fn import_json(&self, path: &Path, policy: MergePolicy) -> Result<MergeReport, CacheError> {
        let data = std::fs::read_to_string(path).map_err(|e| CacheError::io(path, e))?;
        let records = store::read_records(&data)?;
        self.merge(records, policy)
    }
}
