// In-memory collaborators for tests

use crate::capture::Sink;
use crate::engine::{EngineError, EngineIo, EngineResult, ScriptEngine};
use crate::rules::{RuleMap, IDENTIFIER_FORMAT, PRINTLN_ARGUMENT, SPACE_AROUND_EQUALS};
use crate::scope::{EvalScope, Value};
use async_trait::async_trait;
use runlet_common::store::{
    ReadFrom, SnippetStore, StatusKey, StatusStore, StreamMessage, StreamTransport,
};
use runlet_common::types::{SnippetStatus, Version};
use runlet_common::PipelineError;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

fn unavailable(what: &str) -> PipelineError {
    PipelineError::Config(format!("{} unavailable", what))
}

#[derive(Default)]
pub struct MemorySnippetStore {
    snippets: Mutex<HashMap<Uuid, String>>,
    saves: AtomicUsize,
}

impl MemorySnippetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, content: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.snippets.lock().unwrap().insert(id, content.to_string());
        id
    }

    pub fn content(&self, id: Uuid) -> Option<String> {
        self.snippets.lock().unwrap().get(&id).cloned()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnippetStore for MemorySnippetStore {
    async fn get(&self, id: Uuid) -> Result<Option<String>, PipelineError> {
        Ok(self.content(id))
    }

    async fn save(&self, id: Uuid, content: &str) -> Result<(), PipelineError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.snippets.lock().unwrap().insert(id, content.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStatusStore {
    statuses: Mutex<HashMap<StatusKey, SnippetStatus>>,
    writes: Mutex<Vec<(StatusKey, SnippetStatus)>>,
    fail_writes: AtomicBool,
    rejected: AtomicUsize,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, key: &StatusKey) -> Option<SnippetStatus> {
        self.statuses.lock().unwrap().get(key).copied()
    }

    /// Every successful write, in order.
    pub fn writes(&self) -> Vec<(StatusKey, SnippetStatus)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Writes refused while `fail_writes` was on.
    pub fn rejected_writes(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn set(&self, key: &StatusKey, status: SnippetStatus) -> Result<(), PipelineError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(unavailable("status store"));
        }
        self.statuses.lock().unwrap().insert(*key, status);
        self.writes.lock().unwrap().push((*key, status));
        Ok(())
    }

    async fn get(&self, key: &StatusKey) -> Result<Option<SnippetStatus>, PipelineError> {
        Ok(self.status(key))
    }
}

#[derive(Default)]
struct Group {
    /// Index of the next never-delivered entry.
    next: usize,
    /// Delivered, unacknowledged ids with their consumer.
    pending: BTreeMap<u64, String>,
}

#[derive(Default)]
struct Stream {
    entries: Vec<(u64, Option<String>)>,
    groups: HashMap<String, Group>,
}

/// Consumer-group stream semantics over in-memory vectors.
#[derive(Default)]
pub struct MemoryStream {
    streams: Mutex<HashMap<String, Stream>>,
    sequence: AtomicUsize,
    appended: Notify,
    failing_appends: AtomicUsize,
    append_attempts: AtomicUsize,
}

fn entry_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_entry_id(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry with an arbitrary payload field, as a producer would.
    pub fn push(&self, stream: &str, payload: Option<&str>) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        self.streams
            .lock()
            .unwrap()
            .entry(stream.to_string())
            .or_default()
            .entries
            .push((seq, payload.map(str::to_string)));
        self.appended.notify_waiters();
        entry_id(seq)
    }

    /// Make the next `count` appends fail.
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    pub fn append_attempts(&self) -> usize {
        self.append_attempts.load(Ordering::SeqCst)
    }

    pub fn payloads(&self, stream: &str) -> Vec<String> {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .map(|s| s.entries.iter().filter_map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn take(&self, stream: &str, group: &str, consumer: &str, from: &ReadFrom, count: usize) -> Result<Vec<StreamMessage>, PipelineError> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| unavailable("stream"))?;
        let Stream { entries, groups } = state;
        let group = groups.get_mut(group).ok_or_else(|| unavailable("group"))?;

        let messages = match from {
            ReadFrom::New => {
                let delivered: Vec<_> = entries.iter().skip(group.next).take(count).cloned().collect();
                group.next += delivered.len();
                for (seq, _) in &delivered {
                    group.pending.insert(*seq, consumer.to_string());
                }
                delivered
            }
            ReadFrom::PendingAfter(after) => {
                let after = parse_entry_id(after).unwrap_or(0);
                entries
                    .iter()
                    .filter(|(seq, _)| *seq > after)
                    .filter(|(seq, _)| group.pending.get(seq).map(String::as_str) == Some(consumer))
                    .take(count)
                    .cloned()
                    .collect()
            }
        };

        Ok(messages
            .into_iter()
            .map(|(seq, payload)| StreamMessage { id: entry_id(seq), payload })
            .collect())
    }
}

#[async_trait]
impl StreamTransport for MemoryStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), PipelineError> {
        self.streams
            .lock()
            .unwrap()
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
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
        let notified = self.appended.notified();
        let messages = self.take(stream, group, consumer, &from, count)?;
        if !messages.is_empty() || from.is_pending() {
            return Ok(messages);
        }
        let _ = tokio::time::timeout(block, notified).await;
        self.take(stream, group, consumer, &from, count)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), PipelineError> {
        let seq = parse_entry_id(id).ok_or_else(|| unavailable("entry"))?;
        if let Some(group) = self
            .streams
            .lock()
            .unwrap()
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            group.pending.remove(&seq);
        }
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &str) -> Result<String, PipelineError> {
        self.append_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(unavailable("stream"));
        }
        Ok(self.push(stream, Some(payload)))
    }
}

/// A tiny line-oriented language, enough to exercise the adapter.
///
/// ```text
/// print <expr>          emit one output
/// let <name> = <expr>   mutable binding
/// <name> = <expr>       assignment
/// warn "<text>"         diagnostic text
/// fail "<message>"      reported failure
/// panic "<message>"     engine panic
/// sleep <ms>            block the calling thread
/// ```
///
/// Expressions: `"literal"`, numbers, identifiers, `readInput()`,
/// `readNumber()` and `readEnv("NAME")`.
#[derive(Default)]
pub struct ScriptedEngine {
    invocations: AtomicUsize,
}

fn unquote(text: &str) -> Option<&str> {
    text.strip_prefix('"')?.strip_suffix('"')
}

fn read_source(source: &mut dyn Read) -> EngineResult<String> {
    let mut text = String::new();
    source
        .read_to_string(&mut text)
        .map_err(|e| EngineError::Fault(e.to_string()))?;
    Ok(text)
}

fn is_call(expr: &str) -> bool {
    expr.ends_with(')')
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn eval(&self, expr: &str, scope: &EvalScope) -> EngineResult<Value> {
        let expr = expr.trim();
        if let Some(text) = unquote(expr) {
            return Ok(Value::Text(text.to_string()));
        }
        if let Ok(n) = expr.parse::<f64>() {
            return Ok(Value::Number(n));
        }
        if let Some(call) = expr.strip_suffix(')') {
            let (name, arg) = call
                .split_once('(')
                .ok_or_else(|| EngineError::Reported(format!("Bad call: {}", expr)))?;
            let args = match arg.trim() {
                "" => Vec::new(),
                arg => vec![self.eval(arg, scope)?],
            };
            return scope
                .call(name.trim(), &args)
                .map_err(|e| EngineError::Reported(e.to_string()));
        }
        scope
            .variable(expr)
            .cloned()
            .ok_or_else(|| EngineError::Reported(format!("Variable '{}' is not declared", expr)))
    }

    /// Lines shared by every mode: diagnostics, failures, panics, delays.
    fn common(&self, line: &str, diagnostics: &mut dyn Sink) -> EngineResult<bool> {
        if let Some(rest) = line.strip_prefix("warn ") {
            diagnostics.emit(unquote(rest.trim()).unwrap_or(rest).to_string());
            return Ok(true);
        }
        if let Some(rest) = line.strip_prefix("fail ") {
            return Err(EngineError::Reported(unquote(rest.trim()).unwrap_or(rest).to_string()));
        }
        if let Some(rest) = line.strip_prefix("panic ") {
            panic!("{}", unquote(rest.trim()).unwrap_or(rest));
        }
        if let Some(rest) = line.strip_prefix("sleep ") {
            let ms = rest.trim().parse().unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            return Ok(true);
        }
        Ok(false)
    }
}

impl ScriptEngine for ScriptedEngine {
    fn interpret(
        &self,
        source: &mut dyn Read,
        _version: Version,
        scope: &mut EvalScope,
        mut io: EngineIo<'_>,
    ) -> EngineResult<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let text = read_source(source)?;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if self.common(line, io.diagnostics)? {
                continue;
            }
            if let Some(expr) = line.strip_prefix("print ") {
                let value = self.eval(expr, scope)?;
                io.output.emit(value.to_string());
            } else if let Some(rest) = line.strip_prefix("let ") {
                let (name, expr) = rest
                    .split_once('=')
                    .ok_or_else(|| EngineError::Reported(format!("Bad declaration: {}", line)))?;
                let value = self.eval(expr, scope)?;
                scope.declare(name.trim(), value, true);
            } else if let Some((name, expr)) = line.split_once('=') {
                let value = self.eval(expr, scope)?;
                scope
                    .assign(name.trim(), value)
                    .map_err(|e| EngineError::Reported(e.to_string()))?;
            } else {
                return Err(EngineError::Reported(format!("Unexpected statement: {}", line)));
            }
        }
        Ok(())
    }

    fn analyze(
        &self,
        source: &mut dyn Read,
        rules: &RuleMap,
        _version: Version,
        mut io: EngineIo<'_>,
    ) -> EngineResult<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let text = read_source(source)?;
        let println_rule = rules.get(PRINTLN_ARGUMENT).and_then(|v| v.as_bool()).unwrap_or(false);
        let identifier_rule = rules.get(IDENTIFIER_FORMAT).and_then(|v| v.as_str());

        let mut violations = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if self.common(line, io.diagnostics)? {
                continue;
            }
            if let Some(expr) = line.strip_prefix("print ") {
                if println_rule && is_call(expr.trim()) {
                    violations.push("println argument must be a variable or literal".to_string());
                }
            } else if let Some(rest) = line.strip_prefix("let ") {
                let name = rest.split('=').next().unwrap_or("").trim();
                let breaks_rule = match identifier_rule {
                    Some("camel case") => name.contains('_'),
                    Some("snake case") => name.chars().any(char::is_uppercase),
                    _ => false,
                };
                if let (true, Some(format)) = (breaks_rule, identifier_rule) {
                    violations.push(format!("Identifier '{}' is not {}", name, format));
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Reported(violations.join("\n")))
        }
    }

    fn format(
        &self,
        source: &mut dyn Read,
        rules: &RuleMap,
        _version: Version,
        mut io: EngineIo<'_>,
    ) -> EngineResult<String> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let text = read_source(source)?;
        let spaced = rules.get(SPACE_AROUND_EQUALS).and_then(|v| v.as_bool()).unwrap_or(false);
        let separator = if spaced { " = " } else { "=" };

        let mut formatted = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if self.common(line, io.diagnostics)? {
                continue;
            }
            match line.split_once('=') {
                Some((left, right)) => formatted.push(format!("{}{}{}", left.trim(), separator, right.trim())),
                None => formatted.push(line.to_string()),
            }
        }
        Ok(formatted.join("\n"))
    }
}
