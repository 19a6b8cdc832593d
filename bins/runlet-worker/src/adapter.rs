/// Execution Adapter - One Sandboxed Engine Invocation
///
/// **Core Responsibility:**
/// Run a single execute/analyze/format call against fresh state and turn
/// whatever happens into a normalized outcome.
///
/// **Per Invocation:**
/// 1. Build a new `EvalScope` (execute only) with env vars as constants
/// 2. Install the host callables over a fresh input cursor
/// 3. Hand the engine fresh capture channels
/// 4. Catch engine failures and panics; never let either escape
/// 5. Drop the scope on every exit path
///
/// Calls are synchronous. Async callers run them on the blocking pool.

use crate::capture::CaptureChannel;
use crate::engine::{EngineError, EngineIo, EngineResult, ScriptEngine};
use crate::rules::{format_rules, lint_rules};
use crate::scope::{install_host_functions, EvalScope, InputCursor, Value};
use runlet_common::types::{ExecutionOutcome, FormatRules, LintRules, Version};
use std::any::Any;
use std::collections::BTreeMap;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

pub const NO_LINT_ERRORS: &str = "No lint errors";

/// Failure of an analyze or format call, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct OperationFailure {
    pub message: String,
}

impl OperationFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Clone)]
pub struct ExecutionAdapter {
    engine: Arc<dyn ScriptEngine>,
}

impl ExecutionAdapter {
    pub fn new(engine: Arc<dyn ScriptEngine>) -> Self {
        Self { engine }
    }

    /// Run the snippet and capture one output per print.
    ///
    /// Outputs printed before a failure are kept. When the engine reports a
    /// failure, diagnostic text precedes its message in `errors`. A fault
    /// (panic, broken process) yields its message alone.
    pub fn execute(
        &self,
        source: &str,
        version: Version,
        inputs: &[String],
        env_vars: &BTreeMap<String, String>,
    ) -> ExecutionOutcome {
        let mut output = CaptureChannel::new();
        let mut diagnostics = CaptureChannel::new();

        let cursor = InputCursor::new(inputs);

        let result = {
            let mut scope = EvalScope::new();
            for (name, value) in env_vars {
                scope.declare_constant(name, Value::Text(value.clone()));
            }
            install_host_functions(&mut scope, cursor.clone());

            let mut reader = source.as_bytes();
            guarded(|| {
                self.engine.interpret(
                    &mut reader,
                    version,
                    &mut scope,
                    EngineIo {
                        output: &mut output,
                        diagnostics: &mut diagnostics,
                    },
                )
            })
        };

        debug!(inputs = inputs.len(), consumed = cursor.consumed(), "Execution finished");
        let outputs = output.into_entries();
        match result {
            Ok(()) => {
                if !diagnostics.is_empty() {
                    debug!(diagnostics = %diagnostics.joined(), "Engine diagnostics discarded on success");
                }
                ExecutionOutcome {
                    outputs,
                    errors: Vec::new(),
                }
            }
            Err(EngineError::Fault(message)) => {
                if !diagnostics.is_empty() {
                    debug!(diagnostics = %diagnostics.joined(), "Engine diagnostics discarded after fault");
                }
                ExecutionOutcome {
                    outputs,
                    errors: vec![message],
                }
            }
            Err(EngineError::Reported(message)) => {
                let mut errors = diagnostics.into_entries();
                errors.push(message);
                ExecutionOutcome { outputs, errors }
            }
        }
    }

    /// Lint the snippet. Stray diagnostic text is appended after the
    /// engine's message.
    pub fn analyze(
        &self,
        source: &mut dyn Read,
        rules: &LintRules,
        version: Version,
    ) -> Result<String, OperationFailure> {
        let rules = lint_rules(rules);
        let mut output = CaptureChannel::new();
        let mut diagnostics = CaptureChannel::new();

        let result = guarded(|| {
            self.engine.analyze(
                source,
                &rules,
                version,
                EngineIo {
                    output: &mut output,
                    diagnostics: &mut diagnostics,
                },
            )
        });

        match result {
            Ok(()) => Ok(NO_LINT_ERRORS.to_string()),
            Err(e) => {
                let mut message = e.to_string();
                if !diagnostics.is_empty() {
                    message.push('\n');
                    message.push_str(&diagnostics.joined());
                }
                Err(OperationFailure::new(message))
            }
        }
    }

    pub fn format(
        &self,
        source: &mut dyn Read,
        rules: &FormatRules,
        version: Version,
    ) -> Result<String, OperationFailure> {
        let rules = format_rules(rules);
        let mut output = CaptureChannel::new();
        let mut diagnostics = CaptureChannel::new();

        guarded(|| {
            self.engine.format(
                source,
                &rules,
                version,
                EngineIo {
                    output: &mut output,
                    diagnostics: &mut diagnostics,
                },
            )
        })
        .map_err(|e| OperationFailure::new(e.to_string()))
    }
}

/// Run an engine call, turning a panic into `EngineError::Fault`.
fn guarded<T>(call: impl FnOnce() -> EngineResult<T>) -> EngineResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(panic = %message, "Engine invocation panicked");
            Err(EngineError::Fault(message))
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Engine panicked".to_string()
    }
}
