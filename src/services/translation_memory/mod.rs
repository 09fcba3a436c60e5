pub mod cache;
pub mod model;
pub mod normalize;
pub mod store;

pub use cache::{CacheSnapshot, CacheStats, MergeReport, TranslationCache};
pub use model::{CacheKey, CacheRecord, MergePolicy, Trust};
pub use store::{CacheStore, JsonFileStore, MemoryStore};
