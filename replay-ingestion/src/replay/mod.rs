//! Canonical replay records and the read path that builds them.

pub mod assembler;
pub mod model;
pub mod query;

pub use assembler::{as_replay, assemble_segments, merge_segment_rows};
pub use model::Replay;
pub use query::{ReplayQuery, ReplayQueryBuilder};
