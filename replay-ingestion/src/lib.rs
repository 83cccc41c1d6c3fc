//! Session replay ingestion and query service.
//!
//! Recording segments are consumed from Kafka, written to blob storage by a
//! batch committer and acknowledged only after every write and derived event
//! is durable. The query side translates portable replay queries into SnQL or
//! EAP requests and assembles the results into replay records.
//!
//! ## Error logging (anyhow)
//!
//! Log errors with `{e:#}` (full chain on one line) or `error = ?e`. Avoid
//! `{}` / `%e` for errors, which only show the top-level message.

pub mod billing;
pub mod commit;
pub mod config;
pub mod kafka;
pub mod metrics_consts;
pub mod query;
pub mod recording;
pub mod replay;
pub mod runtime;
pub mod service;
pub mod storage;
pub mod strategy;
pub mod test_utils;

pub use config::Config;
pub use service::ReplayIngestionService;
