use crate::error::PipelineError;
use crate::store::{ReadFrom, SnippetStore, StatusKey, StatusStore, StreamMessage, StreamTransport};
use crate::types::SnippetStatus;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Redis key layout - shared by the worker loops and the HTTP surface so
/// both always address the same records.

pub const STATUS_PREFIX: &str = "snippet:status";
pub const CONTENT_PREFIX: &str = "snippet:content";

/// Field holding the JSON payload of every stream entry.
pub const PAYLOAD_FIELD: &str = "payload";

/// Status key for a snippet. Per-operation keys carry the kind.
pub fn status_key(key: &StatusKey) -> String {
    match key.kind {
        None => format!("{}:{}", STATUS_PREFIX, key.snippet_id),
        Some(kind) => format!("{}:{}:{}", STATUS_PREFIX, kind, key.snippet_id),
    }
}

pub fn content_key(snippet_id: &Uuid) -> String {
    format!("{}:{}", CONTENT_PREFIX, snippet_id)
}

/// Create a consumer group reading from the start of the stream, creating
/// the stream if needed. An existing group is not an error.
pub async fn ensure_group(conn: &mut ConnectionManager, stream: &str, group: &str) -> RedisResult<()> {
    let created: RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
    match created {
        Err(e) if e.code() == Some("BUSYGROUP") => {
            debug!(stream, group, "Consumer group already exists");
            Ok(())
        }
        Ok(()) => {
            info!(stream, group, "Created consumer group");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// XREADGROUP from one stream. New entries block for up to `block`;
/// pending entries are returned immediately.
pub async fn read_group(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
    consumer: &str,
    from: ReadFrom,
    count: usize,
    block: Duration,
) -> RedisResult<Vec<StreamMessage>> {
    let mut opts = StreamReadOptions::default().group(group, consumer).count(count);
    let start = match &from {
        ReadFrom::New => {
            opts = opts.block(block.as_millis() as usize);
            ">"
        }
        ReadFrom::PendingAfter(cursor) => cursor.as_str(),
    };

    let reply: Option<StreamReadReply> = conn.xread_options(&[stream], &[start], &opts).await?;

    let messages = reply
        .map(|reply| {
            reply
                .keys
                .into_iter()
                .flat_map(|key| key.ids)
                .map(|entry| StreamMessage {
                    payload: entry.get::<String>(PAYLOAD_FIELD),
                    id: entry.id,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(messages)
}

pub async fn ack(conn: &mut ConnectionManager, stream: &str, group: &str, id: &str) -> RedisResult<()> {
    let _: i64 = conn.xack(stream, group, &[id]).await?;
    Ok(())
}

/// XADD a payload under an auto-generated id.
pub async fn append(conn: &mut ConnectionManager, stream: &str, payload: &str) -> RedisResult<String> {
    conn.xadd(stream, "*", &[(PAYLOAD_FIELD, payload)]).await
}

pub async fn set_status(conn: &mut ConnectionManager, key: &StatusKey, status: SnippetStatus) -> RedisResult<()> {
    conn.set(status_key(key), status.as_str()).await
}

pub async fn get_status(conn: &mut ConnectionManager, key: &StatusKey) -> Result<Option<SnippetStatus>, PipelineError> {
    let raw: Option<String> = conn.get(status_key(key)).await?;
    raw.map(|value| value.parse()).transpose()
}

pub async fn get_snippet(conn: &mut ConnectionManager, snippet_id: &Uuid) -> RedisResult<Option<String>> {
    conn.get(content_key(snippet_id)).await
}

pub async fn save_snippet(conn: &mut ConnectionManager, snippet_id: &Uuid, content: &str) -> RedisResult<()> {
    conn.set(content_key(snippet_id), content).await
}

/// Redis-backed implementation of every pipeline store.
///
/// `ConnectionManager` multiplexes and reconnects on its own, so cloning the
/// backend is cheap. Blocking stream reads should use a dedicated backend so
/// they do not stall status writes and publishes queued behind them.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(client: &redis::Client) -> Result<Self, PipelineError> {
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl StatusStore for RedisBackend {
    async fn set(&self, key: &StatusKey, status: SnippetStatus) -> Result<(), PipelineError> {
        set_status(&mut self.connection(), key, status).await?;
        Ok(())
    }

    async fn get(&self, key: &StatusKey) -> Result<Option<SnippetStatus>, PipelineError> {
        get_status(&mut self.connection(), key).await
    }
}

#[async_trait]
impl SnippetStore for RedisBackend {
    async fn get(&self, id: Uuid) -> Result<Option<String>, PipelineError> {
        Ok(get_snippet(&mut self.connection(), &id).await?)
    }

    async fn save(&self, id: Uuid, content: &str) -> Result<(), PipelineError> {
        save_snippet(&mut self.connection(), &id, content).await?;
        Ok(())
    }
}

#[async_trait]
impl StreamTransport for RedisBackend {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), PipelineError> {
        ensure_group(&mut self.connection(), stream, group).await?;
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, PipelineError> {
        Ok(read_group(&mut self.connection(), stream, group, consumer, from, count, block).await?)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), PipelineError> {
        ack(&mut self.connection(), stream, group, id).await?;
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &str) -> Result<String, PipelineError> {
        Ok(append(&mut self.connection(), stream, payload).await?)
    }
}
