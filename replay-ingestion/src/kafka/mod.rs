pub mod config;
pub mod consumer;
pub mod driver;
pub mod offset_tracker;
pub mod producer;
pub mod types;
