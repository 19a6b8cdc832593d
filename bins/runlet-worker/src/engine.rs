/// Script Engine - Boundary to the External Interpreter
///
/// **Core Responsibility:**
/// Interpret, analyze or format one snippet and report what happened.
///
/// **Critical Architectural Boundary:**
/// - The engine knows HOW to run a language version
/// - The engine does NOT know about streams, statuses or retries
/// - Output goes only to the sinks handed to each call
/// - State lives only in the scope handed to each call
///
/// Production uses `ProcessEngine`, which drives an external engine
/// executable per language version over a line-delimited JSON protocol.

use crate::capture::Sink;
use crate::config::{EngineConfig, EngineConfigManager};
use crate::rules::RuleMap;
use crate::scope::{EvalScope, Value};
use base64::{engine::general_purpose, Engine as _};
use runlet_common::types::{Language, Version};
use runlet_common::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::Read;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Safety limit to keep pathological inputs away from the engine
const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The engine ran and rejected the snippet.
    #[error("{0}")]
    Reported(String),

    /// The invocation itself broke: panic, spawn failure, protocol error.
    #[error("{0}")]
    Fault(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Per-invocation output channels.
pub struct EngineIo<'a> {
    /// One entry per print.
    pub output: &'a mut dyn Sink,
    /// Free-form diagnostic text.
    pub diagnostics: &'a mut dyn Sink,
}

pub trait ScriptEngine: Send + Sync {
    /// Run the snippet. Host callables and variables come from `scope`.
    fn interpret(
        &self,
        source: &mut dyn Read,
        version: Version,
        scope: &mut EvalScope,
        io: EngineIo<'_>,
    ) -> EngineResult<()>;

    /// Lint the snippet. `Err(Reported)` carries the rule violations.
    fn analyze(
        &self,
        source: &mut dyn Read,
        rules: &RuleMap,
        version: Version,
        io: EngineIo<'_>,
    ) -> EngineResult<()>;

    /// Return the formatted snippet.
    fn format(
        &self,
        source: &mut dyn Read,
        rules: &RuleMap,
        version: Version,
        io: EngineIo<'_>,
    ) -> EngineResult<String>;
}

/// Engines by language.
#[derive(Clone, Default)]
pub struct EngineCatalog {
    engines: HashMap<Language, Arc<dyn ScriptEngine>>,
}

impl EngineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(mut self, language: Language, engine: Arc<dyn ScriptEngine>) -> Self {
        self.engines.insert(language, engine);
        self
    }

    /// One `ProcessEngine` per configured language.
    pub fn from_config(config: &EngineConfigManager) -> Self {
        let mut catalog = Self::new();
        for language in config.list_languages() {
            let engine = ProcessEngine::new(config.engines_for(language));
            catalog = catalog.with_engine(language, Arc::new(engine));
        }
        catalog
    }

    pub fn engine_for(&self, language: Language) -> Result<Arc<dyn ScriptEngine>, PipelineError> {
        self.engines
            .get(&language)
            .cloned()
            .ok_or(PipelineError::UnsupportedLanguage(language))
    }

    pub fn languages(&self) -> Vec<Language> {
        self.engines.keys().copied().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Interpret,
    Analyze,
    Format,
}

impl Mode {
    fn as_str(&self) -> &'static str {
        match self {
            Mode::Interpret => "interpret",
            Mode::Analyze => "analyze",
            Mode::Format => "format",
        }
    }
}

/// One line written by the engine on stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Frame {
    Print {
        text: String,
    },
    Call {
        function: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Formatted {
        text: String,
    },
    Error {
        message: String,
    },
}

/// Reply to a `call` frame, written on the engine's stdin.
#[derive(Debug, Serialize)]
struct CallReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Everything the engine said during one run.
#[derive(Default)]
struct Transcript {
    formatted: Option<String>,
    error: Option<String>,
}

/// Decode one raw stdout line. Invalid UTF-8 is replaced, never dropped.
fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(&['\n', '\r'][..])
        .to_string()
}

/// Split captured stderr into diagnostic entries.
fn diagnostic_lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw).lines().map(str::to_string).collect()
}

/// Read a whole stream, capped at `limit` bytes.
async fn read_capped<R: AsyncRead + Unpin>(handle: R, limit: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = handle.take(limit as u64).read_to_end(&mut buf).await;
    buf
}

async fn write_reply(stdin: &mut ChildStdin, reply: &CallReply) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(reply)?;
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await
}

/// Drive `future` to completion from the blocking caller. Engine calls run on
/// blocking threads, so the ambient runtime is used when there is one.
fn block_on<F: Future>(future: F) -> EngineResult<F::Output> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map(|runtime| runtime.block_on(future))
            .map_err(|e| EngineError::Fault(format!("Failed to start engine runtime: {}", e))),
    }
}

/// Drives an external engine executable, one process per invocation.
pub struct ProcessEngine {
    configs: BTreeMap<Version, EngineConfig>,
}

impl ProcessEngine {
    pub fn new(configs: impl IntoIterator<Item = EngineConfig>) -> Self {
        Self {
            configs: configs.into_iter().map(|c| (c.version, c)).collect(),
        }
    }

    fn run(
        &self,
        mode: Mode,
        source: &mut dyn Read,
        version: Version,
        rules: Option<&RuleMap>,
        scope: Option<&mut EvalScope>,
        io: EngineIo<'_>,
    ) -> EngineResult<Transcript> {
        let config = self
            .configs
            .get(&version)
            .ok_or_else(|| EngineError::Reported(format!("Unsupported version: {}", version)))?;

        let mut code = Vec::new();
        source
            .read_to_end(&mut code)
            .map_err(|e| EngineError::Fault(format!("Failed to read source: {}", e)))?;
        if code.len() > MAX_SOURCE_CODE_BYTES {
            return Err(EngineError::Reported(format!(
                "Source code exceeds {} bytes",
                MAX_SOURCE_CODE_BYTES
            )));
        }

        let rules_json = rules.map(RuleMap::to_string).unwrap_or_else(|| "{}".to_string());
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .env("ENGINE_MODE", mode.as_str())
            .env("ENGINE_VERSION", version.as_str())
            .env("SOURCE_CODE", general_purpose::STANDARD.encode(&code))
            .env("ENGINE_RULES", rules_json);

        block_on(self.converse(command, config, mode, scope, io))?
    }

    /// Spawn the engine and answer its frames until it exits, is killed by
    /// the timeout, or exceeds the output limit.
    async fn converse(
        &self,
        mut command: Command,
        config: &EngineConfig,
        mode: Mode,
        mut scope: Option<&mut EvalScope>,
        io: EngineIo<'_>,
    ) -> EngineResult<Transcript> {
        // The child is killed whenever it is dropped before exiting.
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Fault(format!("Failed to start engine '{}': {}", config.command, e)))?;

        let missing = || EngineError::Fault("Engine stdio was not captured".to_string());
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;
        let mut stdin = child.stdin.take().ok_or_else(missing)?;

        debug!(pid = ?child.id(), mode = mode.as_str(), "Engine started");

        let limit = config.max_output_bytes;
        let stderr_task = tokio::spawn(read_capped(stderr, limit));

        let EngineIo { output, diagnostics } = io;
        let conversation = async {
            let mut transcript = Transcript::default();
            let mut reader = BufReader::new(stdout);
            let mut raw = Vec::new();
            let mut captured = 0usize;

            loop {
                raw.clear();
                let read = reader
                    .read_until(b'\n', &mut raw)
                    .await
                    .map_err(|e| EngineError::Fault(format!("Failed to read engine output: {}", e)))?;
                if read == 0 {
                    break;
                }
                captured += read;
                if captured > limit {
                    return Err(EngineError::Reported(format!("Engine output exceeds {} bytes", limit)));
                }

                let line = decode_line(&raw);
                match serde_json::from_str::<Frame>(&line) {
                    Ok(Frame::Print { text }) => output.emit(text),
                    Ok(Frame::Call { function, args }) => {
                        let reply = match scope.as_deref_mut() {
                            Some(scope) => match scope.call(&function, &args) {
                                Ok(value) => CallReply { value: Some(value), error: None },
                                Err(e) => CallReply { value: None, error: Some(e.to_string()) },
                            },
                            None => CallReply {
                                value: None,
                                error: Some(format!("Host functions are unavailable in {} mode", mode.as_str())),
                            },
                        };
                        if let Err(e) = write_reply(&mut stdin, &reply).await {
                            warn!(error = %e, function = %function, "Failed to answer engine call");
                        }
                    }
                    Ok(Frame::Formatted { text }) => transcript.formatted = Some(text),
                    Ok(Frame::Error { message }) => transcript.error = Some(message),
                    // Anything that is not a frame is plain program output.
                    Err(_) => output.emit(line),
                }
            }
            drop(stdin);

            let status = child
                .wait()
                .await
                .map_err(|e| EngineError::Fault(format!("Failed to wait for engine: {}", e)))?;
            Ok((transcript, status))
        };

        let finished = tokio::time::timeout(config.timeout(), conversation).await;

        let (mut transcript, status) = match finished {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                stderr_task.abort();
                return Err(e);
            }
            Err(_elapsed) => {
                stderr_task.abort();
                return Err(EngineError::Reported(format!(
                    "Execution timed out after {}ms",
                    config.timeout_ms
                )));
            }
        };

        for line in diagnostic_lines(&stderr_task.await.unwrap_or_default()) {
            diagnostics.emit(line);
        }

        if let Some(message) = transcript.error.take() {
            return Err(EngineError::Reported(message));
        }
        if status.success() {
            Ok(transcript)
        } else {
            Err(EngineError::Reported(format!("Engine exited with {}", status)))
        }
    }
}

impl ScriptEngine for ProcessEngine {
    fn interpret(
        &self,
        source: &mut dyn Read,
        version: Version,
        scope: &mut EvalScope,
        io: EngineIo<'_>,
    ) -> EngineResult<()> {
        self.run(Mode::Interpret, source, version, None, Some(scope), io)
            .map(|_| ())
    }

    fn analyze(
        &self,
        source: &mut dyn Read,
        rules: &RuleMap,
        version: Version,
        io: EngineIo<'_>,
    ) -> EngineResult<()> {
        self.run(Mode::Analyze, source, version, Some(rules), None, io)
            .map(|_| ())
    }

    fn format(
        &self,
        source: &mut dyn Read,
        rules: &RuleMap,
        version: Version,
        io: EngineIo<'_>,
    ) -> EngineResult<String> {
        let transcript = self.run(Mode::Format, source, version, Some(rules), None, io)?;
        transcript
            .formatted
            .ok_or_else(|| EngineError::Fault("Engine returned no formatted text".to_string()))
    }
}
