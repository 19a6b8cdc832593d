/// Snippet Runner - Loads Snippets and Drives the Adapter
///
/// **Core Responsibility:**
/// Resolve a snippet id to source, pick the engine for its language, run
/// one operation through the `ExecutionAdapter` and shape the result for
/// either surface (HTTP response or stream result).
///
/// **Guarantees:**
/// - A missing snippet fails with "Snippet not found" before any engine call
/// - Engine calls run on the blocking pool, never on the async workers
/// - A successful format writes the formatted text back to the store

use crate::adapter::{ExecutionAdapter, OperationFailure};
use crate::engine::EngineCatalog;
use crate::evaluator::{evaluate, Verdict, OUTPUT_MISMATCH};
use runlet_common::store::SnippetStore;
use runlet_common::types::{
    ExecutionOutcome, FormatRules, JobRequest, JobResult, Language, LintRules, OperationKind,
    ResultStatus, RuleConfig, Version,
};
use runlet_common::PipelineError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Operation(#[from] OperationFailure),

    #[error("Failed to save snippet")]
    Save(#[source] PipelineError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Outcome of a test run as returned to HTTP callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub outputs: Vec<String>,
    pub errors: Vec<String>,
    pub status: ResultStatus,
}

#[derive(Clone)]
pub struct SnippetRunner {
    snippets: Arc<dyn SnippetStore>,
    engines: EngineCatalog,
}

impl SnippetRunner {
    pub fn new(snippets: Arc<dyn SnippetStore>, engines: EngineCatalog) -> Self {
        Self { snippets, engines }
    }

    async fn load(&self, snippet_id: Uuid) -> Result<String, PipelineError> {
        self.snippets
            .get(snippet_id)
            .await?
            .ok_or(PipelineError::NotFound(snippet_id))
    }

    fn adapter(&self, language: Language) -> Result<ExecutionAdapter, PipelineError> {
        self.engines.engine_for(language).map(ExecutionAdapter::new)
    }

    /// Load the snippet and build its adapter, in that order.
    async fn prepare(&self, snippet_id: Uuid, language: Language) -> Result<(String, ExecutionAdapter), PipelineError> {
        let source = self.load(snippet_id).await?;
        let adapter = self.adapter(language)?;
        Ok((source, adapter))
    }

    pub async fn execute(
        &self,
        snippet_id: Uuid,
        language: Language,
        version: Version,
        inputs: Vec<String>,
        env_vars: BTreeMap<String, String>,
    ) -> ExecutionOutcome {
        let (source, adapter) = match self.prepare(snippet_id, language).await {
            Ok(prepared) => prepared,
            Err(e) => return ExecutionOutcome::failed(e.to_string()),
        };

        let run = tokio::task::spawn_blocking(move || adapter.execute(&source, version, &inputs, &env_vars));
        match run.await {
            Ok(outcome) => outcome,
            Err(e) => ExecutionOutcome::failed(RunError::Internal(e.to_string()).to_string()),
        }
    }

    /// Format the snippet and save the result over the stored source.
    pub async fn format(
        &self,
        snippet_id: Uuid,
        language: Language,
        version: Version,
        rules: &FormatRules,
    ) -> Result<String, RunError> {
        let (source, adapter) = self.prepare(snippet_id, language).await?;
        let rules = rules.clone();

        let formatted = tokio::task::spawn_blocking(move || adapter.format(&mut source.as_bytes(), &rules, version))
            .await
            .map_err(|e| RunError::Internal(e.to_string()))??;

        self.snippets
            .save(snippet_id, &formatted)
            .await
            .map_err(RunError::Save)?;
        debug!(snippet_id = %snippet_id, bytes = formatted.len(), "Formatted snippet saved");

        Ok(formatted)
    }

    pub async fn analyze(
        &self,
        snippet_id: Uuid,
        language: Language,
        version: Version,
        rules: &LintRules,
    ) -> Result<String, RunError> {
        let (source, adapter) = self.prepare(snippet_id, language).await?;
        let rules = rules.clone();

        let report = tokio::task::spawn_blocking(move || adapter.analyze(&mut source.as_bytes(), &rules, version))
            .await
            .map_err(|e| RunError::Internal(e.to_string()))??;
        Ok(report)
    }

    /// A snippet is valid when it runs without inputs and reports no errors.
    pub async fn validate(&self, snippet_id: Uuid, language: Language, version: Version) -> Result<(), OperationFailure> {
        let outcome = self
            .execute(snippet_id, language, version, Vec::new(), BTreeMap::new())
            .await;
        if outcome.is_success() {
            Ok(())
        } else {
            Err(OperationFailure::new(format!("Invalid snippet:\n{}", outcome.errors.join("\n"))))
        }
    }

    pub async fn test(
        &self,
        snippet_id: Uuid,
        language: Language,
        version: Version,
        inputs: Vec<String>,
        env_vars: BTreeMap<String, String>,
        expected: &[String],
    ) -> TestReport {
        let outcome = self.execute(snippet_id, language, version, inputs, env_vars).await;
        let verdict = evaluate(&outcome, expected);
        let status = verdict.status();

        match verdict {
            Verdict::Passed => TestReport {
                outputs: outcome.outputs,
                errors: Vec::new(),
                status,
            },
            Verdict::Errored { errors } => TestReport {
                outputs: outcome.outputs,
                errors,
                status,
            },
            Verdict::Mismatch { expected, actual } => {
                debug!(snippet_id = %snippet_id, expected, actual, "Test outputs differ");
                TestReport {
                    outputs: outcome.outputs,
                    errors: vec![OUTPUT_MISMATCH.to_string()],
                    status,
                }
            }
        }
    }

    /// Run a stream job to its terminal result. Never fails: every problem
    /// becomes a Failed result with a detail.
    #[instrument(skip(self, job), fields(snippet_id = %job.snippet_id, kind = %job.kind))]
    pub async fn run_job(&self, job: &JobRequest) -> JobResult {
        let version = match job.version.parse::<Version>() {
            Ok(version) => version,
            Err(e) => {
                warn!(version = %job.version, "Rejecting job with unsupported version");
                return JobResult::failed(job, e.to_string());
            }
        };

        let result = match job.kind {
            OperationKind::Format => {
                let rules = match &job.rules {
                    Some(RuleConfig::Format(rules)) => rules.clone(),
                    _ => FormatRules::default(),
                };
                match self.format(job.snippet_id, job.language, version, &rules).await {
                    Ok(_) => JobResult::passed(job),
                    Err(e) => JobResult::failed(job, e.to_string()),
                }
            }
            OperationKind::Lint => {
                let rules = match &job.rules {
                    Some(RuleConfig::Lint(rules)) => rules.clone(),
                    _ => LintRules::default(),
                };
                match self.analyze(job.snippet_id, job.language, version, &rules).await {
                    Ok(_) => JobResult::passed(job),
                    Err(e) => JobResult::failed(job, e.to_string()),
                }
            }
            OperationKind::Test => {
                let expected = job.expected_outputs.clone().unwrap_or_default();
                let report = self
                    .test(
                        job.snippet_id,
                        job.language,
                        version,
                        job.inputs.clone(),
                        job.env_vars.clone(),
                        &expected,
                    )
                    .await;
                match report.status {
                    ResultStatus::Passed => JobResult::passed(job),
                    ResultStatus::Failed => JobResult::failed(job, report.errors.join("\n")),
                }
            }
            OperationKind::Execute => {
                let outcome = self
                    .execute(job.snippet_id, job.language, version, job.inputs.clone(), job.env_vars.clone())
                    .await;
                if outcome.is_success() {
                    JobResult::passed(job)
                } else {
                    JobResult::failed(job, outcome.errors.join("\n"))
                }
            }
        };

        info!(status = ?result.status, detail = result.detail.as_deref().unwrap_or(""), "Job finished");
        result
    }
}
