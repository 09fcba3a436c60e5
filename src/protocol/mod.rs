//! Line-delimited JSON front end.
//!
//! Each request is `{"id", "cmd", "payload"}`; each response is
//! `{"id", "status": "ok", "payload"}` or `{"id", "status": "error", "message"}`
//! (errors that carry data, like a partial run report, add a `payload`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::config::{EngineConfig, QualityConfig};
use crate::error::{
    BackendError, CacheError, EngineError, ProjectError, TerminologyError, TokenMismatchError,
};
use crate::model::entry::{Corpus, CorpusEntry};
use crate::model::project::ProjectInfo;
use crate::services::ai::{ChatBackend, ChatBackendConfig};
use crate::services::dispatch::TranslationBackend;
use crate::services::mock::{MockBackend, MockMode};
use crate::services::pipeline::{self, RunContext};
use crate::services::project::{self as project_service, PROJECT_FILE};
use crate::services::qa::{QaEntry, QualityChecker, QualityStats};
use crate::services::terminology::TerminologyTable;
use crate::services::token_guard::{TokenGuard, TokenMap};
use crate::services::translation_memory::{JsonFileStore, MergePolicy, TranslationCache};

mod command;
mod project;

use command::Command;

/// Why a request failed, optionally with data for the caller.
#[derive(Debug)]
pub enum Failure {
    Message(String),
    WithPayload { message: String, payload: Value },
}

impl From<String> for Failure {
    fn from(s: String) -> Self {
        Failure::Message(s)
    }
}

impl From<&str> for Failure {
    fn from(s: &str) -> Self {
        Failure::Message(s.to_string())
    }
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::CacheUnavailable { source, partial } => Failure::WithPayload {
                message: format!("cache unavailable, run aborted: {source}"),
                payload: json!({ "partial": *partial }),
            },
            other => Failure::Message(other.to_string()),
        }
    }
}

impl From<TokenMismatchError> for Failure {
    fn from(e: TokenMismatchError) -> Self {
        Failure::WithPayload {
            message: e.to_string(),
            payload: json!({ "mismatch": e }),
        }
    }
}

macro_rules! message_failure {
    ($($t:ty),*) => {
        $(impl From<$t> for Failure {
            fn from(e: $t) -> Self {
                Failure::Message(e.to_string())
            }
        })*
    };
}

message_failure!(BackendError, CacheError, ProjectError, TerminologyError);

fn get_cmd(req: &Value) -> &str {
    req.get("cmd").and_then(|v| v.as_str()).unwrap_or("")
}

fn get_id(req: &Value) -> Value {
    req.get("id").cloned().unwrap_or(Value::Null)
}

fn get_payload(req: &Value) -> &Value {
    static EMPTY: Value = Value::Null;
    req.get("payload").unwrap_or(&EMPTY)
}

fn ok(id: Value, payload: Value) -> String {
    json!({
        "id": id,
        "status": "ok",
        "payload": payload
    })
    .to_string()
}

fn err(id: Value, failure: Failure) -> String {
    match failure {
        Failure::Message(message) => json!({
            "id": id,
            "status": "error",
            "message": message
        }),
        Failure::WithPayload { message, payload } => json!({
            "id": id,
            "status": "error",
            "message": message,
            "payload": payload
        }),
    }
    .to_string()
}

pub(crate) fn field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub(crate) fn required<'a>(payload: &'a Value, key: &str) -> Result<&'a str, Failure> {
    field(payload, key).ok_or_else(|| Failure::Message(format!("payload.{key} is required")))
}

pub(crate) fn parse_field<T: DeserializeOwned>(payload: &Value, key: &str) -> Result<T, Failure> {
    let v = payload
        .get(key)
        .cloned()
        .ok_or_else(|| Failure::Message(format!("payload.{key} is required")))?;
    serde_json::from_value(v).map_err(|e| Failure::Message(format!("invalid payload.{key}: {e}")))
}

fn optional_field<T: DeserializeOwned>(payload: &Value, key: &str) -> Result<Option<T>, Failure> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => parse_field(payload, key).map(Some),
    }
}

/// State kept across requests: where projects live and their open caches.
pub struct Session {
    base: PathBuf,
    store: Arc<JsonFileStore>,
    caches: HashMap<String, Arc<TranslationCache>>,
    guard: Arc<TokenGuard>,
}

impl Session {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            store: Arc::new(JsonFileStore::new(&base)),
            base,
            caches: HashMap::new(),
            guard: Arc::new(TokenGuard::default()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(project_service::projects_base_dir())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn handle(&mut self, input: &str) -> String {
        let req: Value = match serde_json::from_str(input) {
            Ok(v) => v,
            Err(_) => {
                return json!({
                    "status": "error",
                    "message": "invalid json"
                })
                .to_string();
            }
        };

        let id = get_id(&req);
        let cmd_str = get_cmd(&req);
        let payload = get_payload(&req);

        tracing::debug!(cmd = cmd_str, "request");
        match self.dispatch(Command::from(cmd_str), payload) {
            Ok(v) => ok(id, v),
            Err(f) => {
                tracing::warn!(cmd = cmd_str, failure = ?f, "request failed");
                err(id, f)
            }
        }
    }

    fn dispatch(&mut self, cmd: Command, payload: &Value) -> Result<Value, Failure> {
        if let Some(result) = project::handle(&self.base, cmd, payload) {
            return result;
        }

        match cmd {
            Command::Ping => Ok(json!({
                "message": "stardew-tl-core alive",
                "version": env!("CARGO_PKG_VERSION")
            })),
            Command::Mask => {
                let text = payload.get("text").and_then(|v| v.as_str()).unwrap_or("");
                let masked = self.guard.mask(text);
                Ok(json!({ "masked": masked.text, "tokens": masked.tokens }))
            }
            Command::Unmask => {
                let text = payload.get("text").and_then(|v| v.as_str()).unwrap_or("");
                let tokens: TokenMap = parse_field(payload, "tokens")?;
                let restored = self.guard.unmask(text, &tokens)?;
                Ok(json!({ "text": restored }))
            }
            Command::TerminologyMatch => self.terminology_match(payload),
            Command::Translate => self.translate(payload),
            Command::RunQa => {
                let (checker, entries) = self.qa_input(payload)?;
                let issues = checker.check(&entries);
                let stats = QualityStats::from_issues(&issues);
                Ok(json!({ "issues": issues, "stats": stats }))
            }
            Command::QaFix => {
                let (checker, mut entries) = self.qa_input(payload)?;
                let report = checker.fix(&mut entries);
                let stats = QualityStats::from_issues(&report.remaining);
                Ok(json!({ "entries": entries, "report": report, "stats": stats }))
            }
            Command::CacheStats => {
                let cache = self.cache(required(payload, "project")?)?;
                Ok(json!(cache.stats()))
            }
            Command::CacheClear => {
                let cache = self.cache(required(payload, "project")?)?;
                let pattern = field(payload, "pattern")
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| Failure::Message(format!("invalid payload.pattern: {e}")))?;
                let removed = cache.invalidate(pattern.as_ref())?;
                Ok(json!({ "removed": removed }))
            }
            Command::CacheImport => {
                let project = required(payload, "project")?;
                let path = required(payload, "path")?;
                let policy = match optional_field::<MergePolicy>(payload, "policy")? {
                    Some(p) => p,
                    None => self
                        .find_project(project)?
                        .map(|p| p.engine.merge_policy)
                        .unwrap_or_default(),
                };
                let cache = self.cache(project)?;
                let report = cache.import_json(Path::new(path), policy)?;
                Ok(json!(report))
            }
            Command::CacheExport => {
                let cache = self.cache(required(payload, "project")?)?;
                let exported = cache.export_json(Path::new(required(payload, "path")?))?;
                Ok(json!({ "exported": exported }))
            }
            _ => Err("unknown command".into()),
        }
    }

    fn cache(&mut self, project: &str) -> Result<Arc<TranslationCache>, Failure> {
        if let Some(c) = self.caches.get(project) {
            return Ok(Arc::clone(c));
        }
        let store: Arc<dyn crate::services::translation_memory::CacheStore> = self.store.clone();
        let cache = Arc::new(TranslationCache::open(project, store)?);
        self.caches.insert(project.to_string(), Arc::clone(&cache));
        Ok(cache)
    }

    fn find_project(&self, name: &str) -> Result<Option<ProjectInfo>, Failure> {
        let dir = self.base.join(project_service::safe_project_dir_name(name));
        if !dir.join(PROJECT_FILE).exists() {
            return Ok(None);
        }
        Ok(Some(project_service::open_project(&dir)?))
    }

    /// `payload.terms` if given, else the project's saved table.
    fn terminology(&self, payload: &Value, project: Option<&ProjectInfo>) -> Result<TerminologyTable, Failure> {
        match payload.get("terms") {
            Some(v) if !v.is_null() => Ok(TerminologyTable::from_json_str(&v.to_string())?),
            _ => match project {
                Some(p) => Ok(project_service::load_terminology(p)?),
                None => Ok(TerminologyTable::new()),
            },
        }
    }

    fn terminology_match(&self, payload: &Value) -> Result<Value, Failure> {
        let text = payload.get("text").and_then(|v| v.as_str()).unwrap_or("");
        let project = match field(payload, "project") {
            Some(name) => self.find_project(name)?,
            None => None,
        };
        let table = self.terminology(payload, project.as_ref())?;
        let matcher = table.snapshot()?;

        let matches: Vec<Value> = matcher
            .find(text)
            .into_iter()
            .map(|m| {
                json!({
                    "start": m.start,
                    "end": m.end,
                    "text": &text[m.range()],
                    "target": matcher.rule(m.rule).map(|r| r.target.as_str()),
                    "rule": m.rule,
                })
            })
            .collect();

        Ok(json!({
            "matches": matches,
            "glossary": matcher.glossary(text),
            "version": matcher.version(),
        }))
    }

    fn translate(&mut self, payload: &Value) -> Result<Value, Failure> {
        let project_name = required(payload, "project")?;
        let project = self.find_project(project_name)?;

        let source_lang = field(payload, "source_lang")
            .map(str::to_string)
            .or_else(|| project.as_ref().map(|p| p.source_language.clone()))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "en".to_string());
        let target_lang = field(payload, "target_lang")
            .map(str::to_string)
            .or_else(|| project.as_ref().map(|p| p.target_language.clone()))
            .filter(|s| !s.is_empty())
            .ok_or("payload.target_lang is required")?;

        let config = match optional_field::<EngineConfig>(payload, "config")? {
            Some(c) => c,
            None => project.as_ref().map(|p| p.engine.clone()).unwrap_or_default(),
        };

        let table = self.terminology(payload, project.as_ref())?;
        let entries: Vec<CorpusEntry> = parse_field(payload, "entries")?;
        let corpus = Corpus::new(entries)?;
        let backend = backend_from(payload)?;

        let cache = self.cache(project_name)?;
        let mut ctx = RunContext::new(cache, table.snapshot()?, source_lang, target_lang)
            .with_config(config);
        ctx.guard = Arc::clone(&self.guard);

        let report = pipeline::run(&ctx, &corpus, backend.as_ref())?;
        let translations: Vec<Value> = report
            .translations()
            .into_iter()
            .map(|(id, text)| json!({ "id": id, "text": text }))
            .collect();

        Ok(json!({ "translations": translations, "report": report }))
    }

    fn qa_input(&self, payload: &Value) -> Result<(QualityChecker, Vec<QaEntry>), Failure> {
        let entries: Vec<QaEntry> = parse_field(payload, "entries")?;
        let quality: QualityConfig = optional_field(payload, "quality")?.unwrap_or_default();
        let source_lang = field(payload, "source_lang").unwrap_or("en");
        let target_lang = required(payload, "target_lang")?;
        let checker =
            QualityChecker::from_config(&quality, Arc::clone(&self.guard), source_lang, target_lang);
        Ok((checker, entries))
    }
}

/// `payload.backend`: `{"provider": "echo"}` for a dry run, otherwise a
/// chat-completions configuration.
fn backend_from(payload: &Value) -> Result<Box<dyn TranslationBackend>, Failure> {
    let cfg = payload.get("backend").cloned().unwrap_or(Value::Null);
    if cfg.get("provider").and_then(|v| v.as_str()) == Some("echo") {
        return Ok(Box::new(MockBackend::new(MockMode::Echo)));
    }
    let cfg: ChatBackendConfig = parse_field(payload, "backend")?;
    Ok(Box::new(ChatBackend::new(&cfg)?))
}
