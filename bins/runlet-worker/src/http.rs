// HTTP surface of the runlet worker: synchronous runs and status queries

use crate::executor::{RunError, SnippetRunner};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use runlet_common::store::{StatusKey, StatusScope, StatusStore};
use runlet_common::types::{FormatRules, Language, LintRules, OperationKind, SnippetStatus, Version};
use runlet_common::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub runner: SnippetRunner,
    pub statuses: Arc<dyn StatusStore>,
    pub status_scope: StatusScope,
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/run/execute", post(execute_snippet))
        .route("/run/format", post(format_snippet))
        .route("/run/analyze", post(analyze_snippet))
        .route("/run/validate", post(validate_snippet))
        .route("/run/test", post(test_snippet))
        .route("/status/:snippet_id", get(get_status))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub snippet_id: Uuid,
    pub language: Language,
    pub version: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatRequest {
    pub snippet_id: Uuid,
    pub language: Language,
    pub version: String,
    #[serde(default, alias = "rules")]
    pub formatter_supported_rules: FormatRules,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub snippet_id: Uuid,
    pub language: Language,
    pub version: String,
    #[serde(default)]
    pub rules: LintRules,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub snippet_id: Uuid,
    pub language: Language,
    pub version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRequest {
    pub snippet_id: Uuid,
    pub language: Language,
    pub version: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct FormatResponse {
    pub formatted: String,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub snippet_id: Uuid,
    pub status: SnippetStatus,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub kind: Option<OperationKind>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn parse_version(raw: &str) -> Result<Version, Response> {
    raw.parse()
        .map_err(|e: PipelineError| error_response(StatusCode::BAD_REQUEST, e.to_string()))
}

fn run_error_response(e: RunError) -> Response {
    let status = match &e {
        RunError::Pipeline(PipelineError::NotFound(_)) => StatusCode::NOT_FOUND,
        RunError::Pipeline(PipelineError::UnsupportedLanguage(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        RunError::Operation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RunError::Pipeline(_) | RunError::Save(_) | RunError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e, "Run failed");
    }
    error_response(status, e.to_string())
}

/// GET /health - Liveness check
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// POST /run/execute - Run a snippet with inputs and env vars
pub async fn execute_snippet(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExecuteRequest>,
) -> Response {
    let version = match parse_version(&payload.version) {
        Ok(version) => version,
        Err(response) => return response,
    };

    let outcome = state
        .runner
        .execute(payload.snippet_id, payload.language, version, payload.inputs, payload.envs)
        .await;
    info!(snippet_id = %payload.snippet_id, errors = outcome.errors.len(), "Snippet executed");

    (StatusCode::OK, Json(outcome)).into_response()
}

/// POST /run/format - Format a snippet and save the result
pub async fn format_snippet(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<FormatRequest>,
) -> Response {
    let version = match parse_version(&payload.version) {
        Ok(version) => version,
        Err(response) => return response,
    };

    match state
        .runner
        .format(payload.snippet_id, payload.language, version, &payload.formatter_supported_rules)
        .await
    {
        Ok(formatted) => (StatusCode::OK, Json(FormatResponse { formatted })).into_response(),
        Err(e) => run_error_response(e),
    }
}

/// POST /run/analyze - Lint a snippet
pub async fn analyze_snippet(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AnalyzeRequest>,
) -> Response {
    let version = match parse_version(&payload.version) {
        Ok(version) => version,
        Err(response) => return response,
    };

    match state
        .runner
        .analyze(payload.snippet_id, payload.language, version, &payload.rules)
        .await
    {
        Ok(detail) => (StatusCode::OK, Json(AnalyzeResponse { passed: true, detail })).into_response(),
        Err(RunError::Operation(failure)) => (
            StatusCode::OK,
            Json(AnalyzeResponse {
                passed: false,
                detail: failure.message,
            }),
        )
            .into_response(),
        Err(e) => run_error_response(e),
    }
}

/// POST /run/validate - Whether a snippet runs cleanly without inputs
pub async fn validate_snippet(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ValidateRequest>,
) -> Response {
    let version = match parse_version(&payload.version) {
        Ok(version) => version,
        Err(response) => return response,
    };

    let valid = match state.runner.validate(payload.snippet_id, payload.language, version).await {
        Ok(()) => true,
        Err(failure) => {
            info!(snippet_id = %payload.snippet_id, reason = %failure, "Snippet is not valid");
            false
        }
    };
    (StatusCode::OK, Json(valid)).into_response()
}

/// POST /run/test - Run a snippet and compare its outputs
pub async fn test_snippet(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TestRequest>,
) -> Response {
    let version = match parse_version(&payload.version) {
        Ok(version) => version,
        Err(response) => return response,
    };

    let report = state
        .runner
        .test(
            payload.snippet_id,
            payload.language,
            version,
            payload.inputs,
            payload.envs,
            &payload.outputs,
        )
        .await;
    info!(snippet_id = %payload.snippet_id, status = ?report.status, "Snippet tested");

    (StatusCode::OK, Json(report)).into_response()
}

/// GET /status/{snippet_id}?kind= - Last recorded status
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(snippet_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let snippet_id = match Uuid::parse_str(&snippet_id) {
        Ok(id) => id,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid snippet ID format"),
    };

    let key = match (state.status_scope, query.kind) {
        (StatusScope::Shared, _) => StatusKey::shared(snippet_id),
        (StatusScope::PerOperation, Some(kind)) => StatusKey::new(StatusScope::PerOperation, snippet_id, kind),
        (StatusScope::PerOperation, None) => {
            return error_response(StatusCode::BAD_REQUEST, "Query parameter 'kind' is required")
        }
    };

    match state.statuses.get(&key).await {
        Ok(Some(status)) => (StatusCode::OK, Json(StatusResponse { snippet_id, status })).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "No status recorded for snippet"),
        Err(e) => {
            error!(snippet_id = %snippet_id, error = %e, "Failed to read status");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to query status: {}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineCatalog, ScriptEngine};
    use crate::testing::{MemorySnippetStore, MemoryStatusStore, ScriptedEngine};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct Fixture {
        app: Router,
        snippets: Arc<MemorySnippetStore>,
        statuses: Arc<MemoryStatusStore>,
    }

    fn make_fixture(status_scope: StatusScope) -> Fixture {
        let snippets = Arc::new(MemorySnippetStore::new());
        let statuses = Arc::new(MemoryStatusStore::new());
        let engine: Arc<dyn ScriptEngine> = Arc::new(ScriptedEngine::new());
        let runner = SnippetRunner::new(snippets.clone(), EngineCatalog::new().with_engine(Language::PrintScript, engine));
        let state = Arc::new(AppState {
            runner,
            statuses: statuses.clone(),
            status_scope,
        });
        Fixture {
            app: routes(state),
            snippets,
            statuses,
        }
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let fixture = make_fixture(StatusScope::Shared);
        let (status, body) = send(&fixture.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("OK"));
    }

    #[tokio::test]
    async fn test_execute_endpoint() {
        let fixture = make_fixture(StatusScope::Shared);
        let id = fixture.snippets.insert("print \"hi\"\nprint readInput()");

        let (status, body) = send(
            &fixture.app,
            "POST",
            "/run/execute",
            Some(json!({"snippetId": id, "language": "PRINTSCRIPT", "version": "1.1", "inputs": ["42"]})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"outputs": ["hi", "42"], "errors": []}));
    }

    #[tokio::test]
    async fn test_bad_version_is_rejected() {
        let fixture = make_fixture(StatusScope::Shared);
        let id = fixture.snippets.insert("print \"hi\"");

        let (status, body) = send(
            &fixture.app,
            "POST",
            "/run/execute",
            Some(json!({"snippetId": id, "language": "PRINTSCRIPT", "version": "7"})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "Unsupported version: 7"}));
    }

    #[tokio::test]
    async fn test_format_endpoint() {
        let fixture = make_fixture(StatusScope::Shared);
        let id = fixture.snippets.insert("let a=2");

        let (status, body) = send(
            &fixture.app,
            "POST",
            "/run/format",
            Some(json!({
                "snippetId": id,
                "language": "PRINTSCRIPT",
                "version": "1.0",
                "formatterSupportedRules": {"isAssignationSpaced": true}
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"formatted": "let a = 2"}));

        let (status, body) = send(
            &fixture.app,
            "POST",
            "/run/format",
            Some(json!({"snippetId": Uuid::new_v4(), "language": "PRINTSCRIPT", "version": "1.0"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "Snippet not found"}));
    }

    #[tokio::test]
    async fn test_analyze_endpoint() {
        let fixture = make_fixture(StatusScope::Shared);
        let id = fixture.snippets.insert("let snake_name = 1");

        let (status, body) = send(
            &fixture.app,
            "POST",
            "/run/analyze",
            Some(json!({
                "snippetId": id,
                "language": "PRINTSCRIPT",
                "version": "1.1",
                "rules": {"identifierFormat": "camel case"}
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"passed": false, "detail": "Identifier 'snake_name' is not camel case"}));
    }

    #[tokio::test]
    async fn test_validate_endpoint() {
        let fixture = make_fixture(StatusScope::Shared);
        let good = fixture.snippets.insert("print \"ok\"");
        let bad = fixture.snippets.insert("print undefinedThing");

        let (_, body) = send(
            &fixture.app,
            "POST",
            "/run/validate",
            Some(json!({"snippetId": good, "language": "PRINTSCRIPT", "version": "1.0"})),
        )
        .await;
        assert_eq!(body, json!(true));

        let (_, body) = send(
            &fixture.app,
            "POST",
            "/run/validate",
            Some(json!({"snippetId": bad, "language": "PRINTSCRIPT", "version": "1.0"})),
        )
        .await;
        assert_eq!(body, json!(false));
    }

    #[tokio::test]
    async fn test_test_endpoint() {
        let fixture = make_fixture(StatusScope::Shared);
        let id = fixture.snippets.insert("print readInput()");

        let (status, body) = send(
            &fixture.app,
            "POST",
            "/run/test",
            Some(json!({
                "snippetId": id,
                "language": "PRINTSCRIPT",
                "version": "1.0",
                "inputs": ["5"],
                "outputs": ["5"]
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"outputs": ["5"], "errors": [], "status": "PASSED"}));
    }

    #[tokio::test]
    async fn test_status_endpoint_shared_scope() {
        let fixture = make_fixture(StatusScope::Shared);
        let id = Uuid::new_v4();

        let (status, _) = send(&fixture.app, "GET", &format!("/status/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        fixture
            .statuses
            .set(&StatusKey::shared(id), SnippetStatus::Failed)
            .await
            .unwrap();

        let (status, body) = send(&fixture.app, "GET", &format!("/status/{}?kind=lint", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"snippetId": id, "status": "FAILED"}));
    }

    #[tokio::test]
    async fn test_status_endpoint_per_operation_scope() {
        let fixture = make_fixture(StatusScope::PerOperation);
        let id = Uuid::new_v4();
        fixture
            .statuses
            .set(&StatusKey::new(StatusScope::PerOperation, id, OperationKind::Test), SnippetStatus::Passed)
            .await
            .unwrap();

        let (status, _) = send(&fixture.app, "GET", &format!("/status/{}", id), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&fixture.app, "GET", &format!("/status/{}?kind=test", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"snippetId": id, "status": "PASSED"}));

        let (status, _) = send(&fixture.app, "GET", &format!("/status/{}?kind=format", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_endpoint_rejects_bad_id() {
        let fixture = make_fixture(StatusScope::Shared);
        let (status, _) = send(&fixture.app, "GET", "/status/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
