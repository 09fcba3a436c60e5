pub mod backend;
pub mod batching;
pub mod dispatcher;
pub mod retry;

pub use backend::{BatchRequest, TranslationBackend};
pub use batching::{plan_batches, Batch, PendingItem};
pub use dispatcher::{DispatchConfig, Dispatch, Dispatcher, EntryOutcome, EntryResult};
pub use retry::{CancelToken, Pacer, RetryPolicy};
