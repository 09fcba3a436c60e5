//! One translation run over a corpus.
//!
//! mask -> cache lookup -> terminology pre-pass -> dispatch -> post-pass ->
//! unmask -> cache write (per batch) -> quality checks.

use std::sync::Arc;

use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::entry::{Corpus, EntryReport, EntryState, SourceEntry};
use crate::services::dispatch::{
    CancelToken, Dispatcher, EntryOutcome, EntryResult, PendingItem, TranslationBackend,
};
use crate::services::qa::{QaEntry, QualityChecker, QualityIssue, QualityStats};
use crate::services::terminology::TermMatcher;
use crate::services::token_guard::TokenGuard;
use crate::services::translation_memory::{CacheRecord, TranslationCache};

/// Everything a run needs, passed in explicitly.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub cache: Arc<TranslationCache>,
    /// Read-only for the whole run and shared by every worker.
    pub terminology: Arc<TermMatcher>,
    pub guard: Arc<TokenGuard>,
    pub source_lang: String,
    pub target_lang: String,
    pub config: EngineConfig,
    pub cancel: CancelToken,
}

impl RunContext {
    pub fn new(
        cache: Arc<TranslationCache>,
        terminology: Arc<TermMatcher>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            terminology,
            guard: Arc::new(TokenGuard::default()),
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
            config: EngineConfig::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn project(&self) -> &str {
        self.cache.project()
    }

    pub fn terminology_version(&self) -> &str {
        self.terminology.version()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub total: usize,
    pub passthrough: usize,
    pub cache_hits: usize,
    pub dispatched: usize,
    pub translated: usize,
    pub failed: usize,
    pub pending: usize,
    pub clean: usize,
    pub with_issues: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub project: String,
    pub target_lang: String,
    pub terminology_version: String,
    /// One report per corpus entry, in corpus order.
    pub entries: Vec<EntryReport>,
    pub issues: Vec<QualityIssue>,
    pub stats: RunStats,
    pub quality: QualityStats,
}

impl RunReport {
    /// `(id, translation)` in corpus order, for every entry that has one.
    pub fn translations(&self) -> Vec<(&str, &str)> {
        self.entries
            .iter()
            .filter_map(|e| e.translation.as_deref().map(|t| (e.id.as_str(), t)))
            .collect()
    }

    pub fn entry(&self, id: &str) -> Option<&EntryReport> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn is_complete(&self) -> bool {
        self.stats.pending == 0 && self.stats.failed == 0
    }
}

/// Translates `corpus`, skipping everything the cache already knows.
///
/// Backend failures become `Failed` entries; a cache write failure stops the
/// run and returns [`EngineError::CacheUnavailable`] with the partial report.
pub fn run(
    ctx: &RunContext,
    corpus: &Corpus,
    backend: &dyn TranslationBackend,
) -> Result<RunReport, EngineError> {
    ctx.config.validate()?;

    let version = ctx.terminology_version().to_string();
    let sources: Vec<SourceEntry> = corpus
        .entries()
        .iter()
        .map(|e| SourceEntry::load(e, &ctx.guard))
        .collect();

    let mut reports: Vec<EntryReport> = sources.iter().map(|s| EntryReport::pending(&s.id)).collect();
    let mut stats = RunStats {
        total: sources.len(),
        ..Default::default()
    };

    let mut pending = Vec::new();
    for (index, src) in sources.iter().enumerate() {
        let report = &mut reports[index];

        if src.is_blank() {
            report.state = EntryState::Clean;
            report.translation = Some(src.text.clone());
            stats.passthrough += 1;
            continue;
        }

        if let Some(hit) = ctx.cache.get(&src.text, &ctx.target_lang, &version) {
            report.state = EntryState::CacheHit;
            report.translation = Some(hit.translation);
            report.from_cache = true;
            stats.cache_hits += 1;
            continue;
        }

        let excluded = ctx.guard.placeholder_spans(&src.masked.text);
        pending.push(PendingItem {
            index,
            id: src.id.clone(),
            text: ctx.terminology.apply_prepass(&src.masked.text, &excluded),
            group: src.group.clone(),
        });
    }

    tracing::info!(
        project = ctx.project(),
        total = stats.total,
        cache_hits = stats.cache_hits,
        to_dispatch = pending.len(),
        backend = backend.name(),
        "run started"
    );

    let dispatcher = Dispatcher::new(
        ctx.config.dispatch_config(),
        ctx.source_lang.as_str(),
        ctx.target_lang.as_str(),
        ctx.cancel.clone(),
    )?
    .with_guard(Arc::clone(&ctx.guard));
    let mut dispatch = dispatcher.dispatch(pending, backend, Some(ctx.terminology.as_ref()));

    while let Some(batch) = dispatch.next_batch() {
        let mut records = Vec::with_capacity(batch.len());
        for result in batch {
            if let Some(record) = settle(ctx, &version, backend.name(), &sources, &mut reports, result) {
                records.push(record);
            }
        }

        if records.is_empty() {
            continue;
        }
        if let Err(e) = ctx.cache.put_batch(records) {
            tracing::error!(project = ctx.project(), error = %e, "cache write failed, stopping run");

            // batches that finished alongside this one are kept too
            let finished: Vec<CacheRecord> = dispatch
                .take_ready()
                .into_iter()
                .filter_map(|result| settle(ctx, &version, backend.name(), &sources, &mut reports, result))
                .collect();
            ctx.cache.stage(finished);

            let partial = finish(ctx, &sources, reports, stats, &version);
            return Err(EngineError::CacheUnavailable {
                source: e,
                partial: Box::new(partial),
            });
        }
    }

    if dispatch.is_cancelled() {
        tracing::warn!(
            project = ctx.project(),
            left = dispatch.remaining().len(),
            "run cancelled"
        );
    }

    let report = finish(ctx, &sources, reports, stats, &version);
    tracing::info!(
        project = ctx.project(),
        translated = report.stats.translated,
        failed = report.stats.failed,
        pending = report.stats.pending,
        issues = report.issues.len(),
        "run finished"
    );
    Ok(report)
}

/// Applies one backend result to its entry; returns the record to cache.
fn settle(
    ctx: &RunContext,
    version: &str,
    source_api: &str,
    sources: &[SourceEntry],
    reports: &mut [EntryReport],
    result: EntryResult,
) -> Option<CacheRecord> {
    let src = &sources[result.index];
    let report = &mut reports[result.index];
    report.state = EntryState::Dispatched;

    match result.outcome {
        EntryOutcome::Translated { text, attempts } => {
            report.attempts = attempts;

            let masked = &src.masked.text;
            let corrected = ctx.terminology.apply_postpass(
                masked,
                &text,
                &ctx.guard.placeholder_spans(masked),
                &ctx.guard.placeholder_spans(&text),
            );

            match ctx.guard.unmask(&corrected, &src.masked.tokens) {
                Ok(restored) => {
                    let record = CacheRecord::new(
                        &src.text,
                        &ctx.target_lang,
                        version,
                        &restored,
                        source_api,
                    );
                    report.state = EntryState::Translated;
                    report.translation = Some(restored);
                    Some(record)
                }
                Err(e) => {
                    tracing::warn!(entry = %src.id, error = %e, "backend broke a protected token");
                    report.state = EntryState::Failed;
                    report.error = Some(e.to_string());
                    report.token_mismatch = Some(e);
                    None
                }
            }
        }
        EntryOutcome::Failed { error, attempts, .. } => {
            report.state = EntryState::Failed;
            report.attempts = attempts;
            report.error = Some(error);
            None
        }
    }
}

fn finish(
    ctx: &RunContext,
    sources: &[SourceEntry],
    mut reports: Vec<EntryReport>,
    mut stats: RunStats,
    version: &str,
) -> RunReport {
    let checker = QualityChecker::from_config(
        &ctx.config.quality,
        Arc::clone(&ctx.guard),
        &ctx.source_lang,
        &ctx.target_lang,
    );

    let mut issues = Vec::new();
    for (src, report) in sources.iter().zip(reports.iter_mut()) {
        if !matches!(report.state, EntryState::Translated | EntryState::CacheHit) {
            continue;
        }
        if report.state == EntryState::Translated {
            stats.translated += 1;
        }
        let Some(target) = report.translation.as_deref() else {
            continue;
        };

        let found = checker.check_entry(&QaEntry::new(&src.id, &src.text, target));
        report.state = if found.is_empty() {
            EntryState::Clean
        } else {
            EntryState::Issue
        };
        issues.extend(found);
    }

    for r in &reports {
        match r.state {
            EntryState::Failed => stats.failed += 1,
            EntryState::Pending => stats.pending += 1,
            EntryState::Clean => stats.clean += 1,
            EntryState::Issue => stats.with_issues += 1,
            _ => {}
        }
    }
    stats.dispatched = stats.translated + stats.failed;

    RunReport {
        project: ctx.project().to_string(),
        target_lang: ctx.target_lang.clone(),
        terminology_version: version.to_string(),
        entries: reports,
        quality: QualityStats::from_issues(&issues),
        issues,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entry::CorpusEntry;
    use crate::services::mock::{MockBackend, MockMode};
    use crate::services::terminology::{TerminologyRule, TerminologyTable};
    use crate::services::translation_memory::MemoryStore;

    fn context(table: &TerminologyTable) -> RunContext {
        let cache = TranslationCache::open("test", Arc::new(MemoryStore::new())).unwrap();
        RunContext::new(Arc::new(cache), table.snapshot().unwrap(), "en", "zh")
    }

    #[test]
    fn blank_entries_pass_through() {
        let ctx = context(&TerminologyTable::new());
        let corpus = Corpus::from_pairs([("a", "  "), ("b", "")]).unwrap();
        let backend = MockBackend::new(MockMode::Prefix("X".into()));

        let report = run(&ctx, &corpus, &backend).unwrap();

        assert_eq!(backend.calls(), 0);
        assert_eq!(report.stats.passthrough, 2);
        assert_eq!(report.entry("a").unwrap().translation.as_deref(), Some("  "));
        assert!(ctx.cache.is_empty());
    }

    #[test]
    fn dropped_placeholder_fails_the_entry_and_is_not_cached() {
        let ctx = context(&TerminologyTable::new());
        let corpus = Corpus::from_pairs([("a", "Hello %name!"), ("b", "Good morning")]).unwrap();
        let backend = MockBackend::new(MockMode::DropPlaceholders);

        let report = run(&ctx, &corpus, &backend).unwrap();

        let a = report.entry("a").unwrap();
        assert_eq!(a.state, EntryState::Failed);
        let mismatch = a.token_mismatch.as_ref().unwrap();
        assert_eq!(mismatch.missing, vec!["%name".to_string()]);
        assert!(a.translation.is_none());

        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.stats.translated, 1);
        assert_eq!(ctx.cache.len(), 1);
    }

    #[test]
    fn reordered_placeholders_are_accepted() {
        let ctx = context(&TerminologyTable::new());
        let corpus = Corpus::from_pairs([("a", "%a gives {b}")]).unwrap();
        let backend = MockBackend::new(MockMode::ReorderPlaceholders);

        let report = run(&ctx, &corpus, &backend).unwrap();
        assert_eq!(
            report.entry("a").unwrap().translation.as_deref(),
            Some("{b} gives %a")
        );
    }

    #[test]
    fn terminology_passes_shape_the_output() {
        let table = TerminologyTable::from_rules([
            TerminologyRule::literal("Stardrop", "星之果实").mandatory(),
            TerminologyRule::literal("Pierre", "皮埃尔"),
        ]);
        let ctx = context(&table);
        let corpus = Corpus::from_pairs([("a", "Pierre sells a Stardrop")]).unwrap();
        let backend = MockBackend::new(MockMode::Echo);

        let report = run(&ctx, &corpus, &backend).unwrap();

        let sent = &backend.requests()[0];
        assert_eq!(sent.texts, vec!["Pierre sells a 星之果实"]);
        assert_eq!(sent.glossary.len(), 1);
        assert_eq!(
            report.entry("a").unwrap().translation.as_deref(),
            Some("皮埃尔 sells a 星之果实")
        );
    }

    #[test]
    fn linked_group_entries_share_a_batch() {
        let ctx = context(&TerminologyTable::new()).with_config(EngineConfig {
            batch_size: 2,
            parallelism: 1,
            ..EngineConfig::default()
        });
        let corpus = Corpus::new(vec![
            CorpusEntry::new("a", "One"),
            CorpusEntry::new("fish", "a fish").in_group("fish"),
            CorpusEntry::new("fishes", "%count fish").in_group("fish"),
        ])
        .unwrap();
        let backend = MockBackend::new(MockMode::Prefix("译:".into()));

        let report = run(&ctx, &corpus, &backend).unwrap();

        let sizes: Vec<usize> = backend.requests().iter().map(|r| r.texts.len()).collect();
        assert_eq!(sizes, vec![1, 2]);
        let ids: Vec<&str> = report.translations().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec!["a", "fish", "fishes"]);
    }
}
