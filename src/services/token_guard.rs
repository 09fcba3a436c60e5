//! Masks game variables before text goes to a translation backend and puts
//! them back afterwards.
//!
//! Every recognised token is replaced with `⟦P1⟧`, `⟦P2⟧`, ... in order of
//! appearance. Unmasking requires every issued placeholder to come back exactly
//! once; anything else is a [`TokenMismatchError`].

use std::collections::HashMap;
use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::TokenMismatchError;

const PLACEHOLDER_OPEN: char = '⟦';
const PLACEHOLDER_CLOSE: char = '⟧';

/// A named syntactic rule for one family of game tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRule {
    pub name: &'static str,
    pub pattern: &'static str,
}

/// Rules are tried in order at each position, so longer forms come first.
pub const DEFAULT_RULES: &[TokenRule] = &[
    // placeholder-looking text already in the source must survive untouched
    TokenRule { name: "placeholder_literal", pattern: r"⟦[^⟦⟧]*⟧|⟦|⟧" },
    TokenRule { name: "dollar_brace", pattern: r"\$\{[^{}]*\}" },
    TokenRule { name: "double_brace", pattern: r"\{\{[^{}]*\}\}" },
    TokenRule { name: "brace_identifier", pattern: r"\{[A-Za-z0-9_.:\-]+\}" },
    TokenRule { name: "dialogue_break", pattern: r"#\$[be]#" },
    TokenRule { name: "dialogue_command", pattern: r"\$[cqrpd]\s+[^#]*#" },
    TokenRule { name: "dollar_command", pattern: r"\$[A-Za-z0-9_]+" },
    TokenRule { name: "percent_escape", pattern: r"%%" },
    TokenRule { name: "percent_directive", pattern: r"%[A-Za-z_][A-Za-z0-9_]*" },
    TokenRule { name: "item_list", pattern: r"\[[^\[\]]+\]" },
    TokenRule { name: "player_name", pattern: r"@" },
    TokenRule { name: "gender_split", pattern: r"\^" },
];

/// One masked token: the placeholder issued for it and the original text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub placeholder: String,
    pub value: String,
    /// Byte offset of the token in the unmasked source.
    pub offset: usize,
}

/// Ordered tokens of one masked string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMap {
    pub tokens: Vec<Token>,
}

impl TokenMap {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(|t| t.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskedText {
    pub text: String,
    pub tokens: TokenMap,
}

#[derive(Debug, Clone)]
pub struct TokenGuard {
    token_re: Regex,
    placeholder_re: Regex,
}

static BUILTIN: OnceLock<TokenGuard> = OnceLock::new();

impl Default for TokenGuard {
    fn default() -> Self {
        Self::builtin().clone()
    }
}

impl TokenGuard {
    /// The guard for [`DEFAULT_RULES`], compiled once per process.
    pub fn builtin() -> &'static TokenGuard {
        BUILTIN.get_or_init(|| {
            Self::with_rules(DEFAULT_RULES).expect("DEFAULT_RULES are valid regexes")
        })
    }

    pub fn with_rules(rules: &[TokenRule]) -> Result<Self, regex::Error> {
        let alternation = rules
            .iter()
            .map(|r| format!("(?:{})", r.pattern))
            .collect::<Vec<_>>()
            .join("|");

        Ok(Self {
            token_re: Regex::new(&alternation)?,
            placeholder_re: Regex::new(r"⟦P(\d+)⟧")?,
        })
    }

    pub fn placeholder(index: usize) -> String {
        format!("{PLACEHOLDER_OPEN}P{index}{PLACEHOLDER_CLOSE}")
    }

    pub fn mask(&self, text: &str) -> MaskedText {
        let mut out = String::with_capacity(text.len());
        let mut tokens = Vec::new();
        let mut last = 0usize;

        for m in self.token_re.find_iter(text) {
            out.push_str(&text[last..m.start()]);

            let placeholder = Self::placeholder(tokens.len() + 1);
            out.push_str(&placeholder);
            tokens.push(Token {
                placeholder,
                value: m.as_str().to_string(),
                offset: m.start(),
            });

            last = m.end();
        }
        out.push_str(&text[last..]);

        MaskedText {
            text: out,
            tokens: TokenMap { tokens },
        }
    }

    /// Restores the original tokens into `text`.
    ///
    /// Placeholders may appear in any order, but each issued placeholder must
    /// occur exactly once and nothing placeholder-like may be left over.
    pub fn unmask(&self, text: &str, map: &TokenMap) -> Result<String, TokenMismatchError> {
        let mut seen: HashMap<usize, usize> = HashMap::new();
        let mut unexpected: Vec<String> = Vec::new();
        let mut found_count = 0usize;

        for caps in self.placeholder_re.captures_iter(text) {
            found_count += 1;
            let whole = caps[0].to_string();
            match caps[1].parse::<usize>() {
                Ok(n) if n >= 1 && n <= map.len() => {
                    let count = seen.entry(n).or_insert(0);
                    *count += 1;
                    if *count > 1 {
                        unexpected.push(whole);
                    }
                }
                _ => unexpected.push(whole),
            }
        }

        let brackets = text
            .chars()
            .filter(|&c| c == PLACEHOLDER_OPEN || c == PLACEHOLDER_CLOSE)
            .count();
        if brackets != found_count * 2 {
            unexpected.push(format!("{PLACEHOLDER_OPEN}…{PLACEHOLDER_CLOSE}"));
        }

        let missing: Vec<String> = map
            .tokens
            .iter()
            .enumerate()
            .filter(|(i, _)| !seen.contains_key(&(i + 1)))
            .map(|(_, t)| t.value.clone())
            .collect();

        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(TokenMismatchError {
                expected_count: map.len(),
                found_count,
                missing,
                unexpected,
                text: text.to_string(),
            });
        }

        let restored = self.placeholder_re.replace_all(text, |caps: &regex::Captures| {
            // indices were validated above
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|n| map.tokens.get(n - 1))
                .map(|t| t.value.clone())
                .unwrap_or_default()
        });

        Ok(restored.into_owned())
    }

    /// Raw token values in `text`, in order.
    pub fn tokens_in<'t>(&self, text: &'t str) -> Vec<&'t str> {
        self.token_re.find_iter(text).map(|m| m.as_str()).collect()
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.token_re.find_iter(text).count()
    }

    /// `text` with every token removed.
    pub fn strip_tokens(&self, text: &str) -> String {
        self.token_re.replace_all(text, " ").into_owned()
    }

    /// Byte ranges of the placeholders in an already masked string.
    pub fn placeholder_spans(&self, masked: &str) -> Vec<Range<usize>> {
        self.placeholder_re.find_iter(masked).map(|m| m.range()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_rules_compile_once() {
        assert!(TokenGuard::with_rules(DEFAULT_RULES).is_ok());
        assert!(std::ptr::eq(TokenGuard::builtin(), TokenGuard::builtin()));
    }

    #[test]
    fn masks_percent_and_brace_tokens_in_order() {
        let guard = TokenGuard::default();
        let masked = guard.mask("Hello %name, you found {item}!");

        assert_eq!(masked.text, "Hello ⟦P1⟧, you found ⟦P2⟧!");
        let values: Vec<&str> = masked.tokens.values().collect();
        assert_eq!(values, vec!["%name", "{item}"]);
        assert_eq!(masked.tokens.tokens[0].offset, 6);
    }

    #[test]
    fn restores_translated_text() {
        let guard = TokenGuard::default();
        let masked = guard.mask("Hello %name, you found {item}!");

        let restored = guard
            .unmask("你好 ⟦P1⟧，你找到了 ⟦P2⟧！", &masked.tokens)
            .unwrap();
        assert_eq!(restored, "你好 %name，你找到了 {item}！");
    }

    #[test]
    fn round_trip_is_exact() {
        let guard = TokenGuard::default();
        let samples = [
            "",
            "plain text with no tokens",
            "100%% sure, %farm is yours$h",
            "Nice to meet you, @.#$b#I'm ${Mr^Ms}.",
            "$q 101 null#Do you like fish?",
            "Here, take this [128 129]. {{ItemName}} {0}",
            "stray ⟦ bracket and ⟦P3⟧ literal",
            "Gender^split and %%%name",
        ];
        for s in samples {
            let masked = guard.mask(s);
            assert_eq!(guard.unmask(&masked.text, &masked.tokens).unwrap(), s, "{s}");
        }
    }

    #[test]
    fn reordered_placeholders_are_accepted() {
        let guard = TokenGuard::default();
        let masked = guard.mask("%spouse gave {item} to you");

        let restored = guard.unmask("⟦P2⟧ 是 ⟦P1⟧ 给你的", &masked.tokens).unwrap();
        assert_eq!(restored, "{item} 是 %spouse 给你的");
    }

    #[test]
    fn dropped_placeholder_is_reported() {
        let guard = TokenGuard::default();
        let masked = guard.mask("Hello %name, you found {item}!");

        let err = guard.unmask("你好 ⟦P1⟧！", &masked.tokens).unwrap_err();
        assert_eq!(err.expected_count, 2);
        assert_eq!(err.found_count, 1);
        assert_eq!(err.missing, vec!["{item}".to_string()]);
    }

    #[test]
    fn duplicated_or_invented_placeholder_is_reported() {
        let guard = TokenGuard::default();
        let masked = guard.mask("Hi %name");

        let err = guard.unmask("⟦P1⟧ ⟦P1⟧", &masked.tokens).unwrap_err();
        assert_eq!(err.unexpected, vec!["⟦P1⟧".to_string()]);

        let err = guard.unmask("⟦P1⟧ ⟦P7⟧", &masked.tokens).unwrap_err();
        assert_eq!(err.unexpected, vec!["⟦P7⟧".to_string()]);
    }

    #[test]
    fn mangled_placeholder_is_reported() {
        let guard = TokenGuard::default();
        let masked = guard.mask("Hi %name");

        let err = guard.unmask("你好 ⟦ P1 ⟧", &masked.tokens).unwrap_err();
        assert_eq!(err.missing, vec!["%name".to_string()]);
        assert!(!err.unexpected.is_empty());
    }

    #[test]
    fn counts_and_strips_tokens() {
        let guard = TokenGuard::default();
        let text = "%name found {item}$h";
        assert_eq!(guard.count_tokens(text), 3);
        assert_eq!(guard.tokens_in(text), vec!["%name", "{item}", "$h"]);
        assert!(!guard.strip_tokens(text).contains('%'));
    }

    #[test]
    fn placeholder_spans_cover_placeholders() {
        let guard = TokenGuard::default();
        let masked = guard.mask("a %b c");
        let spans = guard.placeholder_spans(&masked.text);
        assert_eq!(spans.len(), 1);
        assert_eq!(&masked.text[spans[0].clone()], "⟦P1⟧");
    }
}
