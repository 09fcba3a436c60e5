//! Durable storage behind the translation cache.
//!
//! The cache only needs get/put/delete/enumerate scoped by project; how the
//! records reach the disk is up to the [`CacheStore`] implementation.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use super::model::{CacheKey, CacheRecord, MergePolicy};
use crate::error::CacheError;
use crate::services::project::safe_project_dir_name;

pub const CACHE_FILE: &str = "translation_cache.json";

pub trait CacheStore: Send + Sync {
    fn get(&self, project: &str, key: &CacheKey) -> Result<Option<CacheRecord>, CacheError>;

    /// Inserts or replaces the given records. Either all of them are durable
    /// when this returns `Ok`, or none are.
    fn put(&self, project: &str, records: &[CacheRecord]) -> Result<(), CacheError>;

    fn delete(&self, project: &str, keys: &[CacheKey]) -> Result<usize, CacheError>;

    fn enumerate(&self, project: &str) -> Result<Vec<CacheRecord>, CacheError>;
}

type ProjectRecords = HashMap<CacheKey, CacheRecord>;

/// Keeps records in memory only. Useful for tests and throwaway runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    projects: Mutex<HashMap<String, ProjectRecords>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, project: &str, key: &CacheKey) -> Result<Option<CacheRecord>, CacheError> {
        let projects = self.projects.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(projects.get(project).and_then(|p| p.get(key)).cloned())
    }

    fn put(&self, project: &str, records: &[CacheRecord]) -> Result<(), CacheError> {
        let mut projects = self.projects.lock().unwrap_or_else(PoisonError::into_inner);
        let p = projects.entry(project.to_string()).or_default();
        for r in records {
            p.insert(r.key(), r.clone());
        }
        Ok(())
    }

    fn delete(&self, project: &str, keys: &[CacheKey]) -> Result<usize, CacheError> {
        let mut projects = self.projects.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(match projects.get_mut(project) {
            Some(p) => keys.iter().filter(|k| p.remove(*k).is_some()).count(),
            None => 0,
        })
    }

    fn enumerate(&self, project: &str) -> Result<Vec<CacheRecord>, CacheError> {
        let projects = self.projects.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<CacheRecord> = projects
            .get(project)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        sort_records(&mut out);
        Ok(out)
    }
}

/// One pretty-printed JSON array per project at
/// `<root>/<project dir>/translation_cache.json`, rewritten atomically.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    loaded: Mutex<HashMap<String, ProjectRecords>>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, project: &str) -> PathBuf {
        self.root.join(safe_project_dir_name(project)).join(CACHE_FILE)
    }

    fn with_project<T>(
        &self,
        project: &str,
        f: impl FnOnce(&mut ProjectRecords, &Path) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let path = self.path_for(project);
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);

        if !loaded.contains_key(project) {
            let records = load_file(&path)?;
            loaded.insert(project.to_string(), records);
        }

        match loaded.get_mut(project) {
            Some(records) => f(records, &path),
            None => Err(CacheError::Unavailable(format!("project {project} not loaded"))),
        }
    }
}

impl CacheStore for JsonFileStore {
    fn get(&self, project: &str, key: &CacheKey) -> Result<Option<CacheRecord>, CacheError> {
        self.with_project(project, |records, _| Ok(records.get(key).cloned()))
    }

    fn put(&self, project: &str, records: &[CacheRecord]) -> Result<(), CacheError> {
        self.with_project(project, |current, path| {
            let mut next = current.clone();
            for r in records {
                let mut r = r.clone();
                r.ensure_norm_hash();
                next.insert(r.key(), r);
            }
            save_file(path, &next)?;
            *current = next;
            Ok(())
        })
    }

    fn delete(&self, project: &str, keys: &[CacheKey]) -> Result<usize, CacheError> {
        self.with_project(project, |current, path| {
            let mut next = current.clone();
            let removed = keys.iter().filter(|k| next.remove(*k).is_some()).count();
            if removed > 0 {
                save_file(path, &next)?;
                *current = next;
            }
            Ok(removed)
        })
    }

    fn enumerate(&self, project: &str) -> Result<Vec<CacheRecord>, CacheError> {
        self.with_project(project, |records, _| {
            let mut out: Vec<CacheRecord> = records.values().cloned().collect();
            sort_records(&mut out);
            Ok(out)
        })
    }
}

fn load_file(path: &Path) -> Result<ProjectRecords, CacheError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let data = fs::read_to_string(path).map_err(|e| CacheError::io(path, e))?;
    let records = read_records(&data)?;

    let total = records.len();
    let (deduped, removed) = dedup(records);
    tracing::info!(path = %path.display(), entries = deduped.len(), "cache loaded");
    if removed > 0 {
        tracing::warn!(removed, total, "duplicate cache records collapsed on load");
    }

    Ok(deduped.into_iter().map(|r| (r.key(), r)).collect())
}

fn save_file(path: &Path, records: &ProjectRecords) -> Result<(), CacheError> {
    let mut v: Vec<CacheRecord> = records.values().cloned().collect();
    sort_records(&mut v);
    write_records(path, &v)
}

pub(crate) fn read_records(data: &str) -> Result<Vec<CacheRecord>, CacheError> {
    let mut records: Vec<CacheRecord> = serde_json::from_str(data)?;
    for r in records.iter_mut() {
        r.ensure_norm_hash();
    }
    Ok(records)
}

pub(crate) fn write_records(path: &Path, records: &[CacheRecord]) -> Result<(), CacheError> {
    let json = serde_json::to_string_pretty(records)?;
    write_atomic(path, json.as_bytes())
}

/// Collapses records sharing a key, keeping the better one.
fn dedup(records: Vec<CacheRecord>) -> (Vec<CacheRecord>, usize) {
    let mut map: HashMap<CacheKey, CacheRecord> = HashMap::new();
    let mut removed = 0usize;

    for r in records {
        match map.get_mut(&r.key()) {
            None => {
                map.insert(r.key(), r);
            }
            Some(existing) => {
                if existing.yields_to(&r, MergePolicy::PreferLonger) {
                    *existing = r;
                }
                removed += 1;
            }
        }
    }

    (map.into_values().collect(), removed)
}

fn sort_records(records: &mut [CacheRecord]) {
    records.sort_by(|a, b| {
        (
            a.target_lang.as_str(),
            a.terminology_version.as_str(),
            a.hash.as_str(),
            a.original.as_str(),
        )
            .cmp(&(
                b.target_lang.as_str(),
                b.terminology_version.as_str(),
                b.hash.as_str(),
                b.original.as_str(),
            ))
    });
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let tmp = tmp_path(path);

    if let Some(parent) = tmp.parent() {
        fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
    }

    fs::write(&tmp, bytes).map_err(|e| CacheError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| CacheError::io(path, e))?;

    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut p = path.to_path_buf();
    let file_name = match path.file_name().and_then(|s| s.to_str()) {
        Some(n) => n.to_string(),
        None => "cache".to_string(),
    };
    p.set_file_name(format!("{file_name}.tmp"));
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::translation_memory::model::Trust;

    fn rec(original: &str, translation: &str) -> CacheRecord {
        CacheRecord::new(original, "zh", "v1", translation, "mock")
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = rec("Hello", "你好").key();

        {
            let store = JsonFileStore::new(dir.path());
            store.put("Farm Mod", &[rec("Hello", "你好"), rec("Bye", "再见")]).unwrap();
        }

        let reopened = JsonFileStore::new(dir.path());
        let got = reopened.get("Farm Mod", &key).unwrap().unwrap();
        assert_eq!(got.translation, "你好");
        assert_eq!(reopened.enumerate("Farm Mod").unwrap().len(), 2);
        assert!(reopened.enumerate("Other").unwrap().is_empty());
        assert!(!reopened.path_for("Farm Mod").with_extension("json.tmp").exists());
    }

    #[test]
    fn json_store_delete_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let r = rec("Hello", "你好");
        store.put("p", &[r.clone()]).unwrap();
        assert_eq!(store.delete("p", &[r.key()]).unwrap(), 1);
        assert_eq!(store.delete("p", &[r.key()]).unwrap(), 0);

        let reopened = JsonFileStore::new(dir.path());
        assert!(reopened.enumerate("p").unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_an_error_not_an_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let path = store.path_for("p");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            store.enumerate("p"),
            Err(CacheError::Serialization(_))
        ));
    }

    #[test]
    fn duplicates_collapse_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let path = store.path_for("p");
        write_records(
            &path,
            &[
                rec("Hello", ""),
                rec("Hello ", "你好呀"),
                rec("Hello", "你好").with_trust(Trust::HumanReviewed),
            ],
        )
        .unwrap();

        let all = store.enumerate("p").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].translation, "你好");
        assert_eq!(all[0].trust, Trust::HumanReviewed);
    }

    #[test]
    fn memory_store_scopes_by_project() {
        let store = MemoryStore::new();
        let r = rec("Hello", "你好");
        store.put("a", &[r.clone()]).unwrap();
        assert!(store.get("a", &r.key()).unwrap().is_some());
        assert!(store.get("b", &r.key()).unwrap().is_none());
        assert_eq!(store.delete("b", &[r.key()]).unwrap(), 0);
    }
}
