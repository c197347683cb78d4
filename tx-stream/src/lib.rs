//! Transaction stream consumer.
//!
//! Consumes a partitioned topic as a member of a consumer group with one worker
//! task per owned partition. Batches are processed with retries, dead-lettered
//! when retries are exhausted, and their offsets are committed only after they
//! reached one of those outcomes.
//!
//! ## Error logging (anyhow)
//!
//! Log errors with their full cause chain: `error = ?e` as a structured field or
//! `{e:#}` inline. Build errors with `.context()` / `.with_context()` so the
//! original error stays the source.

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod kafka;
pub mod metrics;
pub mod metrics_consts;
pub mod processor;
pub mod retry;
pub mod service;
pub mod transaction;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

pub use dead_letter::DeadLetterSink;
pub use processor::RecordProcessor;
