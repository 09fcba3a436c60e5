use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Literal,
    /// `source` is a regular expression.
    Pattern,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TerminologyRule {
    pub source: String,
    pub target: String,

    #[serde(default)]
    pub mode: MatchMode,

    #[serde(default)]
    pub priority: i32,

    /// Replace the source term before the text is sent to the backend.
    #[serde(default)]
    pub mandatory: bool,
}

impl TerminologyRule {
    pub fn literal(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            mode: MatchMode::Literal,
            priority: 0,
            mandatory: false,
        }
    }

    pub fn pattern(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            mode: MatchMode::Pattern,
            ..Self::literal(source, target)
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}
