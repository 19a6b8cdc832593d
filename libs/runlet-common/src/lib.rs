pub mod config;
pub mod error;
pub mod redis;
pub mod store;
pub mod types;

pub use error::{DecodeError, PipelineError};
