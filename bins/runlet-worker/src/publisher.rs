// Result publication with bounded, cancellation-aware retry

use runlet_common::config::RetryPolicy;
use runlet_common::store::StreamTransport;
use runlet_common::types::ResultEvent;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered { attempts: u32, entry_id: String },
    /// Every attempt failed; the result is dropped.
    Abandoned { attempts: u32 },
    /// Shutdown interrupted the backoff.
    Cancelled { attempts: u32 },
}

#[derive(Clone)]
pub struct ResultPublisher {
    transport: Arc<dyn StreamTransport>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl ResultPublisher {
    pub fn new(transport: Arc<dyn StreamTransport>, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            transport,
            policy,
            cancel,
        }
    }

    /// Append the event to `stream`, waiting `attempt × base_delay` after
    /// each failed attempt.
    pub async fn publish(&self, stream: &str, event: &ResultEvent) -> PublishOutcome {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    stream,
                    snippet_id = %event.snippet_id,
                    error = %e,
                    permanent_failure = true,
                    "Failed to serialize result event"
                );
                return PublishOutcome::Abandoned { attempts: 0 };
            }
        };

        let max_attempts = self.policy.max_attempts;
        for attempt in 1..=max_attempts {
            match self.transport.append(stream, &payload).await {
                Ok(entry_id) => {
                    debug!(stream, snippet_id = %event.snippet_id, attempt, entry_id = %entry_id, "Result published");
                    return PublishOutcome::Delivered { attempts: attempt, entry_id };
                }
                Err(e) => {
                    warn!(stream, snippet_id = %event.snippet_id, attempt, error = %e, "Failed to publish result");
                    if attempt == max_attempts {
                        break;
                    }

                    let delay = self.policy.delay_after(attempt);
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            warn!(stream, snippet_id = %event.snippet_id, attempt, "Shutdown interrupted publish retry");
                            return PublishOutcome::Cancelled { attempts: attempt };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        error!(
            stream,
            snippet_id = %event.snippet_id,
            owner_id = %event.owner_id,
            attempts = max_attempts,
            permanent_failure = true,
            "Giving up on result publication"
        );
        PublishOutcome::Abandoned { attempts: max_attempts }
    }
}
