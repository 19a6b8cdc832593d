// Pipeline configuration, read from the environment with defaults

use crate::error::PipelineError;
use crate::store::StatusScope;
use crate::types::OperationKind;
use std::str::FromStr;
use std::time::Duration;

/// Request/result stream pair for one operation kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPair {
    pub request: String,
    pub result: String,
    pub group: String,
}

impl StreamPair {
    fn defaults(kind: OperationKind) -> Self {
        Self {
            request: format!("snippet.{}.request", kind),
            result: format!("snippet.{}.result", kind),
            group: format!("runlet-{}", kind),
        }
    }
}

/// Bounded linear backoff for result publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Wait after the given failed attempt (1-based) before the next one.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub redis_url: String,
    pub consumer_name: String,
    pub format: StreamPair,
    pub lint: StreamPair,
    pub test: StreamPair,
    pub worker_pool_size: usize,
    pub poll_timeout: Duration,
    pub pending_reclaim_interval: Duration,
    pub publish: RetryPolicy,
    pub shutdown_grace: Duration,
    pub status_scope: StatusScope,
    pub http_addr: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            consumer_name: "runlet-worker".to_string(),
            format: StreamPair::defaults(OperationKind::Format),
            lint: StreamPair::defaults(OperationKind::Lint),
            test: StreamPair::defaults(OperationKind::Test),
            worker_pool_size: 10,
            poll_timeout: Duration::from_secs(10),
            pending_reclaim_interval: Duration::from_secs(30),
            publish: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
            status_scope: StatusScope::Shared,
            http_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Build the configuration from environment variables, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let stream_pair = |kind: OperationKind, fallback: StreamPair| {
            let prefix = kind.as_str().to_uppercase();
            StreamPair {
                request: lookup(&format!("{}_REQUEST_STREAM", prefix)).unwrap_or(fallback.request),
                result: lookup(&format!("{}_RESULT_STREAM", prefix)).unwrap_or(fallback.result),
                group: lookup(&format!("{}_GROUP", prefix)).unwrap_or(fallback.group),
            }
        };

        let status_scope = match lookup("STATUS_SCOPE").as_deref() {
            None | Some("shared") => StatusScope::Shared,
            Some("per-operation") => StatusScope::PerOperation,
            Some(other) => {
                return Err(PipelineError::Config(format!(
                    "STATUS_SCOPE must be 'shared' or 'per-operation', got '{}'",
                    other
                )))
            }
        };

        let config = Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            consumer_name: lookup("CONSUMER_NAME").unwrap_or(defaults.consumer_name),
            format: stream_pair(OperationKind::Format, defaults.format),
            lint: stream_pair(OperationKind::Lint, defaults.lint),
            test: stream_pair(OperationKind::Test, defaults.test),
            worker_pool_size: parse_or(&lookup, "WORKER_POOL_SIZE", defaults.worker_pool_size)?,
            poll_timeout: millis_or(&lookup, "POLL_TIMEOUT_MS", defaults.poll_timeout)?,
            pending_reclaim_interval: millis_or(
                &lookup,
                "PENDING_RECLAIM_INTERVAL_MS",
                defaults.pending_reclaim_interval,
            )?,
            publish: RetryPolicy {
                max_attempts: parse_or(&lookup, "PUBLISH_MAX_ATTEMPTS", defaults.publish.max_attempts)?,
                base_delay: millis_or(&lookup, "PUBLISH_BASE_DELAY_MS", defaults.publish.base_delay)?,
            },
            shutdown_grace: millis_or(&lookup, "SHUTDOWN_GRACE_MS", defaults.shutdown_grace)?,
            status_scope,
            http_addr: lookup("HTTP_ADDR").unwrap_or(defaults.http_addr),
        };

        if config.worker_pool_size == 0 {
            return Err(PipelineError::Config("WORKER_POOL_SIZE must be at least 1".to_string()));
        }
        if config.publish.max_attempts == 0 {
            return Err(PipelineError::Config("PUBLISH_MAX_ATTEMPTS must be at least 1".to_string()));
        }

        Ok(config)
    }

    /// Stream pair for a streamed operation kind.
    pub fn streams(&self, kind: OperationKind) -> Option<&StreamPair> {
        match kind {
            OperationKind::Format => Some(&self.format),
            OperationKind::Lint => Some(&self.lint),
            OperationKind::Test => Some(&self.test),
            OperationKind::Execute => None,
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T, PipelineError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| PipelineError::Config(format!("{} has an invalid value '{}'", name, raw))),
    }
}

fn millis_or<F>(lookup: &F, name: &str, default: Duration) -> Result<Duration, PipelineError>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = default.as_millis() as u64;
    parse_or(lookup, name, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.worker_pool_size, 10);
        assert_eq!(config.poll_timeout, Duration::from_secs(10));
        assert_eq!(config.publish.max_attempts, 3);
        assert_eq!(config.format.request, "snippet.format.request");
        assert_eq!(config.test.result, "snippet.test.result");
        assert_eq!(config.status_scope, StatusScope::Shared);
    }

    #[test]
    fn test_overrides() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("WORKER_POOL_SIZE", "4"),
            ("LINT_REQUEST_STREAM", "lint-in"),
            ("PUBLISH_BASE_DELAY_MS", "250"),
            ("STATUS_SCOPE", "per-operation"),
        ]))
        .unwrap();

        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.lint.request, "lint-in");
        assert_eq!(config.lint.result, "snippet.lint.result");
        assert_eq!(config.publish.base_delay, Duration::from_millis(250));
        assert_eq!(config.status_scope, StatusScope::PerOperation);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(PipelineConfig::from_lookup(lookup_from(&[("WORKER_POOL_SIZE", "many")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup_from(&[("WORKER_POOL_SIZE", "0")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup_from(&[("STATUS_SCOPE", "global")])).is_err());
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(3));
    }
}
