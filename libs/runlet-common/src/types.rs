use crate::error::{DecodeError, PipelineError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The four things a client can ask of a snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Execute,
    Format,
    Lint,
    Test,
}

impl OperationKind {
    /// Kinds that have a request/result stream pair.
    pub const STREAMED: [OperationKind; 3] =
        [OperationKind::Format, OperationKind::Lint, OperationKind::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Execute => "execute",
            OperationKind::Format => "format",
            OperationKind::Lint => "lint",
            OperationKind::Test => "test",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "PRINTSCRIPT", alias = "printscript")]
    PrintScript,
    #[serde(rename = "JAVASCRIPT", alias = "javascript")]
    JavaScript,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::PrintScript => "printscript",
            Language::JavaScript => "javascript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine versions the pipeline knows how to dispatch.
///
/// Requests carry the version as free text; it is resolved into this enum
/// once, where the request enters the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Version {
    V1_0,
    V1_1,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::V1_0 => "1.0",
            Version::V1_1 => "1.1",
        }
    }
}

impl FromStr for Version {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" | "1.0" | "1.0.0" => Ok(Version::V1_0),
            "1.1" | "1.1.0" => Ok(Version::V1_1),
            other => Err(PipelineError::UnsupportedVersion(other.to_string())),
        }
    }
}

impl TryFrom<String> for Version {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed formatter configuration as sent by clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormatRules {
    pub has_post_ascription_space: bool,
    pub has_pre_ascription_space: bool,
    pub is_assignation_spaced: bool,
    pub println_separation_lines: u32,
    pub indentation_inside_conditionals: u32,
    pub if_brace_same_line: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentifierFormat {
    #[serde(rename = "camel case", alias = "CAMEL_CASE")]
    CamelCase,
    #[serde(rename = "snake case", alias = "SNAKE_CASE")]
    SnakeCase,
}

impl IdentifierFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierFormat::CamelCase => "camel case",
            IdentifierFormat::SnakeCase => "snake case",
        }
    }
}

/// Typed linter configuration as sent by clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LintRules {
    pub mandatory_variable_or_literal_in_println: bool,
    pub mandatory_variable_or_literal_in_read_input: bool,
    pub identifier_format: Option<IdentifierFormat>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleConfig {
    Format(FormatRules),
    Lint(LintRules),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatRequestEvent {
    pub owner_id: String,
    pub snippet_id: Uuid,
    pub language: Language,
    pub version: String,
    #[serde(default)]
    pub rules: FormatRules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LintRequestEvent {
    pub owner_id: String,
    pub snippet_id: Uuid,
    pub language: Language,
    #[serde(default, alias = "rules")]
    pub supported_rules: LintRules,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRequestEvent {
    pub owner_id: String,
    #[serde(default)]
    pub test_id: Option<Uuid>,
    pub snippet_id: Uuid,
    pub language: Language,
    pub version: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub expected_outputs: Vec<String>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

/// One unit of work, whichever surface it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub kind: OperationKind,
    pub snippet_id: Uuid,
    pub owner_id: String,
    pub test_id: Option<Uuid>,
    pub language: Language,
    /// Raw version text; resolved by the runner.
    pub version: String,
    pub rules: Option<RuleConfig>,
    pub inputs: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub expected_outputs: Option<Vec<String>>,
}

impl From<FormatRequestEvent> for JobRequest {
    fn from(event: FormatRequestEvent) -> Self {
        Self {
            kind: OperationKind::Format,
            snippet_id: event.snippet_id,
            owner_id: event.owner_id,
            test_id: None,
            language: event.language,
            version: event.version,
            rules: Some(RuleConfig::Format(event.rules)),
            inputs: Vec::new(),
            env_vars: BTreeMap::new(),
            expected_outputs: None,
        }
    }
}

impl From<LintRequestEvent> for JobRequest {
    fn from(event: LintRequestEvent) -> Self {
        Self {
            kind: OperationKind::Lint,
            snippet_id: event.snippet_id,
            owner_id: event.owner_id,
            test_id: None,
            language: event.language,
            version: event.version,
            rules: Some(RuleConfig::Lint(event.supported_rules)),
            inputs: Vec::new(),
            env_vars: BTreeMap::new(),
            expected_outputs: None,
        }
    }
}

impl From<TestRequestEvent> for JobRequest {
    fn from(event: TestRequestEvent) -> Self {
        Self {
            kind: OperationKind::Test,
            snippet_id: event.snippet_id,
            owner_id: event.owner_id,
            test_id: event.test_id,
            language: event.language,
            version: event.version,
            rules: None,
            inputs: event.inputs,
            env_vars: event.envs,
            expected_outputs: Some(event.expected_outputs),
        }
    }
}

/// Decode a stream payload for the given operation kind.
pub fn decode_request(kind: OperationKind, payload: &str) -> Result<JobRequest, DecodeError> {
    let malformed = |source| DecodeError::Malformed { kind, source };
    match kind {
        OperationKind::Format => serde_json::from_str::<FormatRequestEvent>(payload)
            .map(JobRequest::from)
            .map_err(malformed),
        OperationKind::Lint => serde_json::from_str::<LintRequestEvent>(payload)
            .map(JobRequest::from)
            .map_err(malformed),
        OperationKind::Test => serde_json::from_str::<TestRequestEvent>(payload)
            .map(JobRequest::from)
            .map_err(malformed),
        OperationKind::Execute => Err(DecodeError::NotStreamed(kind)),
    }
}

/// Captured output of one engine invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub outputs: Vec<String>,
    pub errors: Vec<String>,
}

impl ExecutionOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            outputs: Vec::new(),
            errors: vec![error.into()],
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Passed,
    Failed,
}

/// Status as persisted per snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnippetStatus {
    Pending,
    Passed,
    Failed,
}

impl SnippetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnippetStatus::Pending => "PENDING",
            SnippetStatus::Passed => "PASSED",
            SnippetStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for SnippetStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SnippetStatus::Pending),
            "PASSED" => Ok(SnippetStatus::Passed),
            "FAILED" => Ok(SnippetStatus::Failed),
            other => Err(PipelineError::Config(format!("unknown status value '{}'", other))),
        }
    }
}

impl From<ResultStatus> for SnippetStatus {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Passed => SnippetStatus::Passed,
            ResultStatus::Failed => SnippetStatus::Failed,
        }
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub kind: OperationKind,
    pub snippet_id: Uuid,
    pub owner_id: String,
    pub test_id: Option<Uuid>,
    pub status: ResultStatus,
    pub detail: Option<String>,
}

impl JobResult {
    pub fn passed(job: &JobRequest) -> Self {
        Self::with_status(job, ResultStatus::Passed, None)
    }

    pub fn failed(job: &JobRequest, detail: impl Into<String>) -> Self {
        Self::with_status(job, ResultStatus::Failed, Some(detail.into()))
    }

    fn with_status(job: &JobRequest, status: ResultStatus, detail: Option<String>) -> Self {
        Self {
            kind: job.kind,
            snippet_id: job.snippet_id,
            owner_id: job.owner_id.clone(),
            test_id: job.test_id,
            status,
            detail,
        }
    }

    pub fn to_event(&self) -> ResultEvent {
        ResultEvent {
            owner_id: self.owner_id.clone(),
            test_id: self.test_id,
            snippet_id: self.snippet_id,
            status: self.status,
        }
    }
}

/// Wire form of a result published to a result stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEvent {
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_id: Option<Uuid>,
    pub snippet_id: Uuid,
    pub status: ResultStatus,
}
