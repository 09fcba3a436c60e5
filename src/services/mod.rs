pub mod ai;
pub mod dispatch;
pub mod mock;
pub mod pipeline;
pub mod project;
pub mod qa;
pub mod terminology;
pub mod token_guard;
pub mod translation_memory;
