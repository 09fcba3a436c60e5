//! Compiled, read-only view of a terminology table.
//!
//! Literal rules share one Aho-Corasick automaton, so scanning cost does not
//! grow with the number of rules. Pattern rules are scanned with their own
//! regex. All candidate matches are then resolved into a non-overlapping set:
//! longer matches win, then higher priority, then the earlier rule.

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

use aho_corasick::{AhoCorasick, MatchKind};
use regex::{Regex, RegexBuilder};
use serde::Serialize;

use super::rule::{MatchMode, TerminologyRule};
use crate::error::TerminologyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TermMatch {
    pub start: usize,
    pub end: usize,
    pub rule: usize,
    pub priority: i32,
    /// Length in characters, used for the longest-match tie-break.
    pub len: usize,
}

impl TermMatch {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// A term found in a text, as handed to backends as a glossary hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlossaryHint {
    pub source: String,
    pub target: String,
}

#[derive(Debug)]
pub struct TermMatcher {
    rules: Vec<TerminologyRule>,
    automaton: Option<AhoCorasick>,
    /// automaton pattern id -> rule index
    literal_rules: Vec<usize>,
    pattern_rules: Vec<(usize, Regex)>,
    version: String,
}

impl TermMatcher {
    pub fn compile(
        rules: Vec<TerminologyRule>,
        case_insensitive: bool,
        version: String,
    ) -> Result<Self, TerminologyError> {
        let mut literal_rules = Vec::new();
        let mut literals: Vec<&str> = Vec::new();
        let mut pattern_rules = Vec::new();

        for (i, rule) in rules.iter().enumerate() {
            if rule.source.is_empty() {
                continue;
            }
            match rule.mode {
                MatchMode::Literal => {
                    literal_rules.push(i);
                    literals.push(rule.source.as_str());
                }
                MatchMode::Pattern => {
                    let re = RegexBuilder::new(&rule.source)
                        .case_insensitive(case_insensitive)
                        .build()
                        .map_err(|e| TerminologyError::InvalidPattern {
                            source_term: rule.source.clone(),
                            message: e.to_string(),
                        })?;
                    pattern_rules.push((i, re));
                }
            }
        }

        let automaton = if literals.is_empty() {
            None
        } else {
            let ac = AhoCorasick::builder()
                .match_kind(MatchKind::Standard)
                .ascii_case_insensitive(case_insensitive)
                .build(&literals)
                .map_err(|e| TerminologyError::Automaton(e.to_string()))?;
            Some(ac)
        };

        tracing::debug!(
            literal = literal_rules.len(),
            pattern = pattern_rules.len(),
            %version,
            "terminology compiled"
        );

        Ok(Self {
            rules,
            automaton,
            literal_rules,
            pattern_rules,
            version,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn rules(&self) -> &[TerminologyRule] {
        &self.rules
    }

    pub fn rule(&self, index: usize) -> Option<&TerminologyRule> {
        self.rules.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.automaton.is_none() && self.pattern_rules.is_empty()
    }

    /// Non-overlapping matches in `text`, ordered by position.
    pub fn find(&self, text: &str) -> Vec<TermMatch> {
        self.find_outside(text, &[])
    }

    /// Like [`find`](Self::find) but ignores any candidate touching one of the
    /// `excluded` byte ranges (e.g. token placeholders).
    pub fn find_outside(&self, text: &str, excluded: &[Range<usize>]) -> Vec<TermMatch> {
        let mut candidates = self.candidates(text);
        candidates.retain(|m| !excluded.iter().any(|r| m.start < r.end && r.start < m.end));
        resolve(candidates)
    }

    fn candidates(&self, text: &str) -> Vec<TermMatch> {
        let mut out = Vec::new();

        if let Some(ac) = &self.automaton {
            for m in ac.find_overlapping_iter(text) {
                let rule = self.literal_rules[m.pattern().as_usize()];
                out.push(TermMatch {
                    start: m.start(),
                    end: m.end(),
                    rule,
                    priority: self.rules[rule].priority,
                    len: text[m.start()..m.end()].chars().count(),
                });
            }
        }

        for (rule, re) in &self.pattern_rules {
            for m in re.find_iter(text) {
                if m.start() == m.end() {
                    continue;
                }
                out.push(TermMatch {
                    start: m.start(),
                    end: m.end(),
                    rule: *rule,
                    priority: self.rules[*rule].priority,
                    len: m.as_str().chars().count(),
                });
            }
        }

        out
    }

    /// Distinct rules matched in `text`, in order of first occurrence.
    pub fn glossary(&self, text: &str) -> Vec<GlossaryHint> {
        self.glossary_outside(text, &[])
    }

    /// Like [`glossary`](Self::glossary), skipping matches that touch `excluded`.
    pub fn glossary_outside(&self, text: &str, excluded: &[Range<usize>]) -> Vec<GlossaryHint> {
        let mut seen = HashSet::new();
        self.find_outside(text, excluded)
            .into_iter()
            .filter(|m| seen.insert(m.rule))
            .map(|m| GlossaryHint {
                source: text[m.range()].to_string(),
                target: self.rules[m.rule].target.clone(),
            })
            .collect()
    }

    /// Replaces occurrences of mandatory rules with their target rendering.
    pub fn apply_prepass(&self, text: &str, excluded: &[Range<usize>]) -> String {
        let matches: Vec<TermMatch> = self
            .find_outside(text, excluded)
            .into_iter()
            .filter(|m| self.rules[m.rule].mandatory)
            .collect();
        self.replace(text, &matches)
    }

    /// Rewrites source terms the backend left untranslated in `output`.
    ///
    /// Only rules that matched in `source` are considered, so a term that the
    /// backend legitimately introduced is left alone.
    pub fn apply_postpass(
        &self,
        source: &str,
        output: &str,
        excluded_in_source: &[Range<usize>],
        excluded_in_output: &[Range<usize>],
    ) -> String {
        let in_source: HashSet<usize> = self
            .find_outside(source, excluded_in_source)
            .into_iter()
            .map(|m| m.rule)
            .collect();
        if in_source.is_empty() {
            return output.to_string();
        }

        let matches: Vec<TermMatch> = self
            .find_outside(output, excluded_in_output)
            .into_iter()
            .filter(|m| in_source.contains(&m.rule))
            .collect();
        self.replace(output, &matches)
    }

    fn replace(&self, text: &str, matches: &[TermMatch]) -> String {
        if matches.is_empty() {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for m in matches {
            out.push_str(&text[last..m.start]);
            out.push_str(&self.rules[m.rule].target);
            last = m.end;
        }
        out.push_str(&text[last..]);
        out
    }
}

/// Greedy selection: best candidates first, skipping anything that overlaps
/// an accepted match.
fn resolve(mut candidates: Vec<TermMatch>) -> Vec<TermMatch> {
    candidates.sort_by(|a, b| {
        b.len
            .cmp(&a.len)
            .then(b.priority.cmp(&a.priority))
            .then(a.rule.cmp(&b.rule))
            .then(a.start.cmp(&b.start))
    });

    let mut accepted: BTreeMap<usize, TermMatch> = BTreeMap::new();
    for m in candidates {
        let clashes_before = accepted
            .range(..m.end)
            .next_back()
            .is_some_and(|(_, prev)| prev.end > m.start);
        if !clashes_before {
            accepted.insert(m.start, m);
        }
    }

    accepted.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(rules: Vec<TerminologyRule>) -> TermMatcher {
        TermMatcher::compile(rules, false, "test".into()).unwrap()
    }

    #[test]
    fn longer_term_beats_higher_priority() {
        let m = compile(vec![
            TerminologyRule::literal("Star", "星").with_priority(1),
            TerminologyRule::literal("Stardrop", "星之滴").with_priority(10),
        ]);
        let found = m.find("Stardrop");
        assert_eq!(found.len(), 1);
        assert_eq!(m.rule(found[0].rule).unwrap().target, "星之滴");

        // even when the shorter rule has the higher priority
        let m = compile(vec![
            TerminologyRule::literal("Star", "星").with_priority(99),
            TerminologyRule::literal("Stardrop", "星之滴"),
        ]);
        let found = m.find("a Stardrop");
        assert_eq!(m.rule(found[0].rule).unwrap().source, "Stardrop");
    }

    #[test]
    fn result_does_not_depend_on_insertion_order() {
        let a = compile(vec![
            TerminologyRule::literal("Star", "星"),
            TerminologyRule::literal("Stardrop Saloon", "星之果实酒吧"),
            TerminologyRule::literal("Stardrop", "星之滴"),
        ]);
        let b = compile(vec![
            TerminologyRule::literal("Stardrop", "星之滴"),
            TerminologyRule::literal("Stardrop Saloon", "星之果实酒吧"),
            TerminologyRule::literal("Star", "星"),
        ]);
        let text = "Meet at the Stardrop Saloon, eat a Stardrop, see a Star.";
        let targets = |m: &TermMatcher| -> Vec<String> {
            m.find(text)
                .iter()
                .map(|x| m.rule(x.rule).unwrap().target.clone())
                .collect()
        };
        assert_eq!(targets(&a), vec!["星之果实酒吧", "星之滴", "星"]);
        assert_eq!(targets(&a), targets(&b));
    }

    #[test]
    fn equal_length_overlap_resolves_by_priority_then_order() {
        let m = compile(vec![
            TerminologyRule::literal("ab", "X").with_priority(1),
            TerminologyRule::literal("bc", "Y").with_priority(5),
        ]);
        let found = m.find("abc");
        assert_eq!(found.len(), 1);
        assert_eq!(m.rule(found[0].rule).unwrap().target, "Y");

        let m = compile(vec![
            TerminologyRule::literal("ab", "X"),
            TerminologyRule::literal("bc", "Y"),
        ]);
        let found = m.find("abc");
        assert_eq!(m.rule(found[0].rule).unwrap().target, "X");
    }

    #[test]
    fn matches_never_overlap() {
        let m = compile(vec![
            TerminologyRule::literal("aa", "1"),
            TerminologyRule::literal("aaa", "2"),
            TerminologyRule::literal("a", "3"),
        ]);
        let found = m.find("aaaaaaa");
        for pair in found.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
        let covered: usize = found.iter().map(|x| x.end - x.start).sum();
        assert_eq!(covered, 7);
    }

    #[test]
    fn pattern_rules_join_the_selection() {
        let m = compile(vec![
            TerminologyRule::literal("Pierre", "皮埃尔"),
            TerminologyRule::pattern(r"Pierre's\s+Shop", "皮埃尔的杂货店"),
        ]);
        let found = m.find("Go to Pierre's  Shop");
        assert_eq!(found.len(), 1);
        assert_eq!(m.rule(found[0].rule).unwrap().target, "皮埃尔的杂货店");
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = TermMatcher::compile(
            vec![TerminologyRule::pattern("(unclosed", "x")],
            false,
            "v".into(),
        )
        .unwrap_err();
        assert!(matches!(err, TerminologyError::InvalidPattern { .. }));
    }

    #[test]
    fn prepass_only_touches_mandatory_rules_outside_placeholders() {
        let m = compile(vec![
            TerminologyRule::literal("Joja", "乔家").mandatory(),
            TerminologyRule::literal("Mart", "超市"),
            TerminologyRule::literal("P1", "坏"),
        ]);
        let text = "Joja Mart ⟦P1⟧";
        let spans = vec![10..text.len()];
        assert_eq!(m.apply_prepass(text, &spans), "乔家 Mart ⟦P1⟧");
    }

    #[test]
    fn postpass_fixes_terms_left_in_output() {
        let m = compile(vec![
            TerminologyRule::literal("Pelican Town", "鹈鹕镇"),
            TerminologyRule::literal("Zuzu", "祖祖城"),
        ]);
        let fixed = m.apply_postpass("Welcome to Pelican Town", "欢迎来到 Pelican Town", &[], &[]);
        assert_eq!(fixed, "欢迎来到 鹈鹕镇");

        // terms the source never mentioned are left alone
        let untouched = m.apply_postpass("Welcome", "Zuzu 欢迎", &[], &[]);
        assert_eq!(untouched, "Zuzu 欢迎");
    }

    #[test]
    fn glossary_lists_each_rule_once() {
        let m = compile(vec![
            TerminologyRule::literal("Abigail", "阿比盖尔"),
            TerminologyRule::literal("Sebastian", "塞巴斯蒂安"),
        ]);
        let hints = m.glossary("Abigail and Sebastian and Abigail");
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0].target, "阿比盖尔");
    }

    #[test]
    fn case_insensitive_literals() {
        let m = TermMatcher::compile(
            vec![TerminologyRule::literal("joja", "乔家")],
            true,
            "v".into(),
        )
        .unwrap();
        assert_eq!(m.find("JOJA cola").len(), 1);
    }
}
