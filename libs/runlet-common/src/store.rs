//! Collaborator interfaces consumed by the pipeline.
//!
//! Redis implementations live in [`crate::redis`]; the worker only depends
//! on these traits so it can be driven by in-memory doubles in tests.

use crate::error::PipelineError;
use crate::types::{OperationKind, SnippetStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// How status records are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusScope {
    /// One record per snippet; every operation kind overwrites it.
    #[default]
    Shared,
    /// One record per (snippet, operation kind).
    PerOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusKey {
    pub snippet_id: Uuid,
    pub kind: Option<OperationKind>,
}

impl StatusKey {
    pub fn new(scope: StatusScope, snippet_id: Uuid, kind: OperationKind) -> Self {
        let kind = match scope {
            StatusScope::Shared => None,
            StatusScope::PerOperation => Some(kind),
        };
        Self { snippet_id, kind }
    }

    pub fn shared(snippet_id: Uuid) -> Self {
        Self {
            snippet_id,
            kind: None,
        }
    }
}

/// Last-write-wins status per key. No history, no expiry.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn set(&self, key: &StatusKey, status: SnippetStatus) -> Result<(), PipelineError>;
    async fn get(&self, key: &StatusKey) -> Result<Option<SnippetStatus>, PipelineError>;
}

/// Snippet source blobs addressed by id.
#[async_trait]
pub trait SnippetStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<String>, PipelineError>;
    async fn save(&self, id: Uuid, content: &str) -> Result<(), PipelineError>;
}

/// Where a consumer-group read starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries never delivered to this group.
    New,
    /// Entries delivered to this consumer but not yet acknowledged, with
    /// ids strictly after the given one. `"0"` starts from the oldest.
    PendingAfter(String),
}

impl ReadFrom {
    pub fn pending() -> Self {
        ReadFrom::PendingAfter(PENDING_START.to_string())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ReadFrom::PendingAfter(_))
    }
}

/// Cursor naming the start of a consumer's pending list.
pub const PENDING_START: &str = "0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    /// `None` when the entry has no payload field.
    pub payload: Option<String>,
}

/// Append-only streams with consumer groups and explicit acknowledgment.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Create the consumer group (and the stream) if it does not exist.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), PipelineError>;

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, PipelineError>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), PipelineError>;

    /// Append a payload and return the id assigned by the stream.
    async fn append(&self, stream: &str, payload: &str) -> Result<String, PipelineError>;
}
