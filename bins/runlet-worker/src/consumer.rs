/// Job Consumer - Stream Polling and Per-Job State Machine
///
/// **Core Responsibility:**
/// Read requests of one operation kind from its stream, run each one on a
/// bounded worker pool and drive it through
/// `Received → Pending → {Passed, Failed} → Acknowledged`.
///
/// **Delivery:**
/// - At-least-once: a message is acknowledged only after its terminal
///   status is stored
/// - Anything that fails before that leaves the message pending, and the
///   periodic pending sweep replays it from the start
/// - The sweep pages through the pending list by id until a read comes
///   back empty, then returns to new messages
/// - Status writes are plain overwrites, so replays are harmless
///
/// **Shutdown:**
/// Cancellation stops polling and pool admission. Jobs already admitted
/// run to completion, awaited up to the grace period.

use crate::adapter::panic_message;
use crate::executor::SnippetRunner;
use crate::publisher::{PublishOutcome, ResultPublisher};
use futures_util::FutureExt;
use runlet_common::config::{PipelineConfig, StreamPair};
use runlet_common::store::{
    ReadFrom, StatusKey, StatusScope, StatusStore, StreamMessage, StreamTransport, PENDING_START,
};
use runlet_common::types::{decode_request, JobResult, OperationKind, SnippetStatus};
use runlet_common::PipelineError;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

pub const INTERNAL_ERROR: &str = "Internal error while processing job";

/// Wait before polling again after a failed read
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub kind: OperationKind,
    pub streams: StreamPair,
    pub consumer_name: String,
    pub pool_size: usize,
    pub poll_timeout: Duration,
    pub reclaim_interval: Duration,
    pub shutdown_grace: Duration,
    pub status_scope: StatusScope,
}

impl ConsumerSettings {
    /// Settings for a streamed kind; `None` for kinds without streams.
    pub fn from_config(config: &PipelineConfig, kind: OperationKind) -> Option<Self> {
        let streams = config.streams(kind)?.clone();
        Some(Self {
            kind,
            streams,
            consumer_name: config.consumer_name.clone(),
            pool_size: config.worker_pool_size,
            poll_timeout: config.poll_timeout,
            reclaim_interval: config.pending_reclaim_interval,
            shutdown_grace: config.shutdown_grace,
            status_scope: config.status_scope,
        })
    }
}

/// What happened to one stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Terminal status stored; acknowledged and published best effort.
    Completed(JobResult),
    /// Left pending for redelivery.
    Unacknowledged,
}

pub struct JobConsumer {
    settings: ConsumerSettings,
    /// Used only for blocking reads so they never stall other commands.
    reader: Arc<dyn StreamTransport>,
    transport: Arc<dyn StreamTransport>,
    statuses: Arc<dyn StatusStore>,
    runner: SnippetRunner,
    publisher: ResultPublisher,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl JobConsumer {
    pub fn new(
        settings: ConsumerSettings,
        reader: Arc<dyn StreamTransport>,
        transport: Arc<dyn StreamTransport>,
        statuses: Arc<dyn StatusStore>,
        runner: SnippetRunner,
        publisher: ResultPublisher,
    ) -> Self {
        Self {
            settings,
            reader,
            transport,
            statuses,
            runner,
            publisher,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Poll until cancelled, then drain in-flight jobs.
    #[instrument(skip(self, cancel), fields(kind = %self.settings.kind, stream = %self.settings.streams.request))]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), PipelineError> {
        let settings = &self.settings;
        self.transport
            .ensure_group(&settings.streams.request, &settings.streams.group)
            .await?;

        info!(
            group = %settings.streams.group,
            consumer = %settings.consumer_name,
            pool_size = settings.pool_size,
            "Consumer started"
        );

        let pool = Arc::new(Semaphore::new(settings.pool_size));
        let tracker = TaskTracker::new();
        // Start with a pending sweep to pick up work left by a previous run.
        let mut sweep = Some(PENDING_START.to_string());
        let mut next_reclaim = Instant::now() + settings.reclaim_interval;

        'poll: loop {
            if sweep.is_none() && Instant::now() >= next_reclaim {
                sweep = Some(PENDING_START.to_string());
            }
            let from = sweep.clone().map_or(ReadFrom::New, ReadFrom::PendingAfter);

            let read = tokio::select! {
                _ = cancel.cancelled() => break 'poll,
                read = self.reader.read_group(
                    &settings.streams.request,
                    &settings.streams.group,
                    &settings.consumer_name,
                    from.clone(),
                    settings.pool_size,
                    settings.poll_timeout,
                ) => read,
            };

            let messages = match read {
                Ok(messages) => messages,
                Err(e) => {
                    error!(error = %e, "Stream read failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break 'poll,
                        _ = tokio::time::sleep(READ_RETRY_DELAY) => continue 'poll,
                    }
                }
            };

            // Page through the pending list so entries that stay pending
            // cannot hide the ones behind them.
            if from.is_pending() {
                match messages.last() {
                    Some(last) => {
                        info!(count = messages.len(), after = ?sweep, "Re-reading pending messages");
                        sweep = Some(last.id.clone());
                    }
                    None => {
                        sweep = None;
                        next_reclaim = Instant::now() + settings.reclaim_interval;
                    }
                }
            }

            for message in messages {
                let Some(claim) = self.claim(&message.id) else {
                    debug!(message_id = %message.id, "Message still in flight, skipping");
                    continue;
                };

                let permit = tokio::select! {
                    _ = cancel.cancelled() => break 'poll,
                    permit = Arc::clone(&pool).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'poll,
                    },
                };

                let consumer = Arc::clone(&self);
                tracker.spawn(async move {
                    let _permit = permit;
                    let _claim = claim;
                    consumer.process(message).await;
                });
            }
        }

        tracker.close();
        info!(in_flight = tracker.len(), "Consumer draining");
        if tokio::time::timeout(settings.shutdown_grace, tracker.wait()).await.is_err() {
            warn!(
                remaining = tracker.len(),
                grace_ms = settings.shutdown_grace.as_millis() as u64,
                "Shutdown grace period elapsed with jobs still running"
            );
        }
        info!("Consumer stopped");
        Ok(())
    }

    /// Handle one message end to end.
    #[instrument(skip(self, message), fields(kind = %self.settings.kind, message_id = %message.id))]
    pub async fn process(&self, message: StreamMessage) -> Disposition {
        let settings = &self.settings;

        let Some(payload) = message.payload.as_deref() else {
            error!("Stream entry has no payload, leaving unacknowledged");
            return Disposition::Unacknowledged;
        };

        let job = match decode_request(settings.kind, payload) {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "Failed to decode request, leaving unacknowledged");
                return Disposition::Unacknowledged;
            }
        };

        info!(snippet_id = %job.snippet_id, owner_id = %job.owner_id, language = %job.language, "Received job");

        let key = StatusKey::new(settings.status_scope, job.snippet_id, job.kind);
        if let Err(e) = self.statuses.set(&key, SnippetStatus::Pending).await {
            error!(snippet_id = %job.snippet_id, error = %e, "Failed to mark job pending, leaving unacknowledged");
            return Disposition::Unacknowledged;
        }

        let result = match AssertUnwindSafe(self.runner.run_job(&job)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                error!(
                    snippet_id = %job.snippet_id,
                    panic = %panic_message(panic.as_ref()),
                    "Job panicked"
                );
                JobResult::failed(&job, INTERNAL_ERROR)
            }
        };

        if let Err(e) = self.statuses.set(&key, result.status.into()).await {
            error!(snippet_id = %job.snippet_id, error = %e, "Failed to store terminal status, leaving unacknowledged");
            return Disposition::Unacknowledged;
        }

        if let Err(e) = self
            .transport
            .ack(&settings.streams.request, &settings.streams.group, &message.id)
            .await
        {
            warn!(snippet_id = %job.snippet_id, error = %e, "Failed to acknowledge, message will be replayed");
        }

        match self.publisher.publish(&settings.streams.result, &result.to_event()).await {
            PublishOutcome::Delivered { attempts, .. } => {
                info!(snippet_id = %job.snippet_id, status = ?result.status, attempts, "Job completed");
            }
            PublishOutcome::Abandoned { attempts } | PublishOutcome::Cancelled { attempts } => {
                warn!(snippet_id = %job.snippet_id, status = ?result.status, attempts, "Job completed without a published result");
            }
        }

        Disposition::Completed(result)
    }

    /// Mark a message in flight; `None` if it already is.
    fn claim(&self, message_id: &str) -> Option<InFlight> {
        let inserted = match self.in_flight.lock() {
            Ok(mut in_flight) => in_flight.insert(message_id.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(message_id.to_string()),
        };
        inserted.then(|| InFlight {
            set: Arc::clone(&self.in_flight),
            message_id: message_id.to_string(),
        })
    }
}

/// Claim on a message id, released on drop even if the job task panics.
struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    message_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        match self.set.lock() {
            Ok(mut in_flight) => in_flight.remove(&self.message_id),
            Err(poisoned) => poisoned.into_inner().remove(&self.message_id),
        };
    }
}
