mod codec;
pub mod error;
pub mod metrics;
pub mod models;
pub mod processing_log;
pub mod user_cache;

pub use error::StoreError;
pub use metrics::{BindingMetrics, MetricsStore};
pub use models::{Outcome, ProcessingLogEntry, UserCacheEntry, UserCacheState};
pub use processing_log::ProcessingLog;
pub use user_cache::UserCache;
