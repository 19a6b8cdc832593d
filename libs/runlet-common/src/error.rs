use crate::types::{Language, OperationKind};
use uuid::Uuid;

/// Errors shared by the pipeline, the stores and the transport.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The snippet id does not resolve to any stored source.
    #[error("Snippet not found")]
    NotFound(Uuid),

    #[error("Language not supported: {0}")]
    UnsupportedLanguage(Language),

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure to turn a stream payload into a job request.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed {kind} request: {source}")]
    Malformed {
        kind: OperationKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} requests are not consumed from a stream")]
    NotStreamed(OperationKind),
}
