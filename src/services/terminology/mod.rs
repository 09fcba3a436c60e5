pub mod matcher;
pub mod rule;
pub mod table;

pub use matcher::{GlossaryHint, TermMatch, TermMatcher};
pub use rule::{MatchMode, TerminologyRule};
pub use table::TerminologyTable;
