//! Analytics: per-request records, their SQLite store, and the query API

pub mod export;
pub mod query;
pub mod record;
pub mod store;
pub mod writer;

pub use query::{BasicStats, EnhancedStats, SearchFilter, SearchParams, StatsParams};
pub use record::{AnalyticsRecord, RecordStatus};
pub use writer::{Analytics, Enqueue};
