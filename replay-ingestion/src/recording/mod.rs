pub mod actions;
pub mod keys;
pub mod message;
pub mod parser;

pub use actions::{ReplayActionsEvent, ReplayClick};
pub use message::{ProcessedRecordingMessage, RecordingEnvelope};
pub use parser::{parse_recording_message, ParseError};
