pub mod entry;
pub mod project;
