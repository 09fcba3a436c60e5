//! Post-run checks over produced translations.
//!
//! Each [`Check`] looks at one entry on its own; [`QualityChecker`] runs the
//! enabled ones and collects their findings. Only checks with a deterministic
//! correction implement [`Check::fix`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use aho_corasick::{AhoCorasick, MatchKind};
use serde::{Deserialize, Serialize};

use crate::config::QualityConfig;
use crate::services::token_guard::TokenGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MixedLanguage,
    TokenMismatch,
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub entry_id: String,
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

/// A source/translation pair under review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaEntry {
    pub id: String,
    pub source: String,
    pub target: String,
}

impl QaEntry {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
        }
    }
}

pub trait Check: Send + Sync {
    fn kind(&self) -> IssueKind;

    fn check(&self, entry: &QaEntry) -> Option<QualityIssue>;

    /// A corrected target, when the correction is unambiguous.
    fn fix(&self, _entry: &QaEntry) -> Option<String> {
        None
    }
}

/// Writing systems the mixed-language check can tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Latin,
    Cjk,
    Cyrillic,
}

impl Script {
    pub fn for_language(lang: &str) -> Option<Script> {
        let primary = lang
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match primary.as_str() {
            "en" | "fr" | "de" | "es" | "pt" | "it" | "nl" | "tr" | "pl" | "hu" | "id" | "vi" => {
                Some(Script::Latin)
            }
            "zh" | "ja" | "ko" => Some(Script::Cjk),
            "ru" | "uk" | "bg" => Some(Script::Cyrillic),
            _ => None,
        }
    }

    pub fn contains(self, c: char) -> bool {
        match self {
            Script::Latin => {
                c.is_ascii_alphabetic() || (c.is_alphabetic() && ('\u{00C0}'..'\u{0250}').contains(&c))
            }
            Script::Cjk => matches!(c,
                '\u{3040}'..='\u{30FF}' | '\u{3400}'..='\u{4DBF}' | '\u{4E00}'..='\u{9FFF}' | '\u{AC00}'..='\u{D7AF}'),
            Script::Cyrillic => ('\u{0400}'..='\u{04FF}').contains(&c),
        }
    }
}

/// Flags translations that still carry words in the source script.
pub struct MixedLanguageCheck {
    guard: Arc<TokenGuard>,
    source_script: Script,
    max_ratio: f64,
    min_word_len: usize,
    excluded: HashSet<String>,
}

impl MixedLanguageCheck {
    /// `None` when the languages share a script or either one is unknown.
    pub fn new(
        guard: Arc<TokenGuard>,
        source_lang: &str,
        target_lang: &str,
        cfg: &QualityConfig,
    ) -> Option<Self> {
        let source_script = Script::for_language(source_lang)?;
        let target_script = Script::for_language(target_lang)?;
        if source_script == target_script {
            return None;
        }
        Some(Self {
            guard,
            source_script,
            max_ratio: cfg.mixed_language_max_ratio,
            min_word_len: cfg.min_word_len.max(1),
            excluded: cfg.excluded_words.iter().map(|w| w.to_lowercase()).collect(),
        })
    }

    fn foreign_words<'t>(&self, text: &'t str) -> Vec<&'t str> {
        let mut words = Vec::new();
        let mut start: Option<usize> = None;

        for (i, c) in text.char_indices().chain([(text.len(), ' ')]) {
            match (self.source_script.contains(c) && i < text.len(), start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    let word = &text[s..i];
                    if word.chars().count() >= self.min_word_len
                        && !self.excluded.contains(&word.to_lowercase())
                    {
                        words.push(word);
                    }
                    start = None;
                }
                _ => {}
            }
        }

        words
    }
}

impl Check for MixedLanguageCheck {
    fn kind(&self) -> IssueKind {
        IssueKind::MixedLanguage
    }

    fn check(&self, entry: &QaEntry) -> Option<QualityIssue> {
        if entry.target.trim().is_empty() {
            return None;
        }

        let stripped = self.guard.strip_tokens(&entry.target);
        let words = self.foreign_words(&stripped);
        if words.is_empty() {
            return None;
        }

        let letters = stripped.chars().filter(|c| c.is_alphabetic()).count().max(1);
        let foreign: usize = words.iter().map(|w| w.chars().count()).sum();
        let ratio = foreign as f64 / letters as f64;
        if ratio <= self.max_ratio {
            return None;
        }

        let marked = mark_words(&entry.target, &words);

        Some(QualityIssue {
            entry_id: entry.id.clone(),
            kind: IssueKind::MixedLanguage,
            severity: Severity::Warning,
            message: format!("source-language text left in translation: {marked}"),
            suggested_fix: None,
        })
    }
}

/// Wraps every occurrence of `words` in `text` with 【】, preferring the longest
/// word at each position.
fn mark_words(text: &str, words: &[&str]) -> String {
    let unique: BTreeSet<&str> = words.iter().copied().collect();
    let unique: Vec<&str> = unique.into_iter().collect();
    let marks: Vec<String> = unique.iter().map(|w| format!("【{w}】")).collect();
    match AhoCorasick::builder()
        .match_kind(MatchKind::LeftmostLongest)
        .build(&unique)
    {
        Ok(ac) => ac.replace_all(text, &marks),
        Err(_) => text.to_string(),
    }
}

/// Compares the game tokens of source and translation as multisets.
pub struct TokenConsistencyCheck {
    guard: Arc<TokenGuard>,
}

impl TokenConsistencyCheck {
    pub fn new(guard: Arc<TokenGuard>) -> Self {
        Self { guard }
    }

    fn diff(&self, entry: &QaEntry) -> (Vec<String>, Vec<String>) {
        let mut pool: HashMap<&str, usize> = HashMap::new();
        for t in self.guard.tokens_in(&entry.target) {
            *pool.entry(t).or_default() += 1;
        }

        let mut missing = Vec::new();
        for t in self.guard.tokens_in(&entry.source) {
            match pool.get_mut(t) {
                Some(n) if *n > 0 => *n -= 1,
                _ => missing.push(t.to_string()),
            }
        }

        let mut unexpected: Vec<String> = pool
            .into_iter()
            .flat_map(|(t, n)| std::iter::repeat(t.to_string()).take(n))
            .collect();
        unexpected.sort();

        (missing, unexpected)
    }
}

impl Check for TokenConsistencyCheck {
    fn kind(&self) -> IssueKind {
        IssueKind::TokenMismatch
    }

    fn check(&self, entry: &QaEntry) -> Option<QualityIssue> {
        if entry.target.trim().is_empty() {
            return None;
        }
        let (missing, unexpected) = self.diff(entry);
        if missing.is_empty() && unexpected.is_empty() {
            return None;
        }

        Some(QualityIssue {
            entry_id: entry.id.clone(),
            kind: IssueKind::TokenMismatch,
            severity: Severity::Error,
            message: format!("token mismatch: missing {missing:?}, unexpected {unexpected:?}"),
            suggested_fix: self.fix(entry),
        })
    }

    /// Restores tokens the translation lost at the very start or end of the
    /// source. Anything else (extra tokens, tokens lost mid-sentence) has no
    /// single right answer and is left alone.
    fn fix(&self, entry: &QaEntry) -> Option<String> {
        let (missing, unexpected) = self.diff(entry);
        if missing.is_empty() || !unexpected.is_empty() {
            return None;
        }

        let masked = self.guard.mask(&entry.source);
        let tokens = &masked.tokens.tokens;
        let n = missing.len();
        if n > tokens.len() {
            return None;
        }

        let tail = &tokens[tokens.len() - n..];
        let tail_start = tail[0].offset;
        if same_values(tail, &missing) && only_tokens(&self.guard, &entry.source[tail_start..]) {
            return Some(format!("{}{}", entry.target.trim_end(), &entry.source[tail_start..]));
        }

        let head = &tokens[..n];
        let head_end = head[n - 1].offset + head[n - 1].value.len();
        if same_values(head, &missing) && only_tokens(&self.guard, &entry.source[..head_end]) {
            return Some(format!("{}{}", &entry.source[..head_end], entry.target.trim_start()));
        }

        None
    }
}

fn same_values(tokens: &[crate::services::token_guard::Token], values: &[String]) -> bool {
    let mut a: Vec<&str> = tokens.iter().map(|t| t.value.as_str()).collect();
    let mut b: Vec<&str> = values.iter().map(String::as_str).collect();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

fn only_tokens(guard: &TokenGuard, segment: &str) -> bool {
    guard.strip_tokens(segment).trim().is_empty()
}

/// Flags empty translations and translations identical to the source.
pub struct CompletenessCheck {
    guard: Arc<TokenGuard>,
}

impl CompletenessCheck {
    pub fn new(guard: Arc<TokenGuard>) -> Self {
        Self { guard }
    }

    fn is_trivial(&self, source: &str) -> bool {
        !self
            .guard
            .strip_tokens(source)
            .chars()
            .any(|c| c.is_alphabetic())
    }
}

impl Check for CompletenessCheck {
    fn kind(&self) -> IssueKind {
        IssueKind::Incomplete
    }

    fn check(&self, entry: &QaEntry) -> Option<QualityIssue> {
        if self.is_trivial(&entry.source) {
            return None;
        }

        let target = entry.target.trim();
        let (severity, message) = if target.is_empty() {
            (Severity::Error, "translation is empty")
        } else if target.to_lowercase() == entry.source.trim().to_lowercase() {
            (Severity::Warning, "translation is identical to the source")
        } else {
            return None;
        };

        Some(QualityIssue {
            entry_id: entry.id.clone(),
            kind: IssueKind::Incomplete,
            severity,
            message: message.to_string(),
            suggested_fix: None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QualityStats {
    pub total: usize,
    pub mixed_language: usize,
    pub token_mismatch: usize,
    pub incomplete: usize,
    pub errors: usize,
    pub warnings: usize,
}

impl QualityStats {
    pub fn from_issues(issues: &[QualityIssue]) -> Self {
        let mut s = QualityStats {
            total: issues.len(),
            ..Default::default()
        };
        for i in issues {
            match i.kind {
                IssueKind::MixedLanguage => s.mixed_language += 1,
                IssueKind::TokenMismatch => s.token_mismatch += 1,
                IssueKind::Incomplete => s.incomplete += 1,
            }
            match i.severity {
                Severity::Error => s.errors += 1,
                Severity::Warning => s.warnings += 1,
            }
        }
        s
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedFix {
    pub entry_id: String,
    pub kind: IssueKind,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FixReport {
    pub fixed: Vec<AppliedFix>,
    /// Issues with no deterministic correction.
    pub skipped: Vec<QualityIssue>,
    /// Everything the checks still report after fixing.
    pub remaining: Vec<QualityIssue>,
}

pub struct QualityChecker {
    checks: Vec<Box<dyn Check>>,
}

impl std::fmt::Debug for QualityChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<IssueKind> = self.checks.iter().map(|c| c.kind()).collect();
        f.debug_struct("QualityChecker").field("checks", &kinds).finish()
    }
}

impl QualityChecker {
    pub fn new(checks: Vec<Box<dyn Check>>) -> Self {
        Self { checks }
    }

    pub fn from_config(
        cfg: &QualityConfig,
        guard: Arc<TokenGuard>,
        source_lang: &str,
        target_lang: &str,
    ) -> Self {
        let mut checks: Vec<Box<dyn Check>> = Vec::new();
        if cfg.check_tokens {
            checks.push(Box::new(TokenConsistencyCheck::new(Arc::clone(&guard))));
        }
        if cfg.check_completeness {
            checks.push(Box::new(CompletenessCheck::new(Arc::clone(&guard))));
        }
        if cfg.check_mixed_language {
            if let Some(c) = MixedLanguageCheck::new(guard, source_lang, target_lang, cfg) {
                checks.push(Box::new(c));
            }
        }
        Self { checks }
    }

    pub fn check_entry(&self, entry: &QaEntry) -> Vec<QualityIssue> {
        self.checks.iter().filter_map(|c| c.check(entry)).collect()
    }

    pub fn check(&self, entries: &[QaEntry]) -> Vec<QualityIssue> {
        entries.iter().flat_map(|e| self.check_entry(e)).collect()
    }

    /// Applies every deterministic correction, then re-checks.
    ///
    /// A correction is kept only if its own check passes afterwards.
    pub fn fix(&self, entries: &mut [QaEntry]) -> FixReport {
        let mut report = FixReport::default();

        for entry in entries.iter_mut() {
            for check in &self.checks {
                let Some(issue) = check.check(entry) else {
                    continue;
                };

                let candidate = check.fix(entry).map(|after| QaEntry {
                    target: after,
                    ..entry.clone()
                });
                match candidate {
                    Some(fixed) if check.check(&fixed).is_none() => {
                        tracing::debug!(entry = %entry.id, kind = ?issue.kind, "issue fixed");
                        let before = std::mem::replace(&mut entry.target, fixed.target);
                        report.fixed.push(AppliedFix {
                            entry_id: entry.id.clone(),
                            kind: issue.kind,
                            before,
                            after: entry.target.clone(),
                        });
                    }
                    _ => report.skipped.push(issue),
                }
            }
        }

        report.remaining = self.check(entries);
        tracing::info!(
            fixed = report.fixed.len(),
            skipped = report.skipped.len(),
            remaining = report.remaining.len(),
            "quality fix pass done"
        );
        report
    }
}
