/// Evaluation Scope - Isolated Variable and Function Bindings
///
/// **Core Responsibility:**
/// Hold the variables and host callables visible to one engine invocation.
///
/// **Ownership:**
/// - A scope is created per invocation and owned by it
/// - It is never shared between concurrent invocations
/// - Dropping it releases every binding, on success, error or panic
///
/// The input cursor is the only state shared between host callables, and
/// only between the callables of the same scope.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

pub const READ_INPUT: &str = "readInput";
pub const READ_NUMBER: &str = "readNumber";
pub const READ_ENV: &str = "readEnv";

/// Runtime value exchanged with the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
    Bool(bool),
    Null,
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Null => write!(f, "null"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub value: Value,
    pub mutable: bool,
}

#[derive(Debug, Default)]
pub struct Variables {
    bindings: HashMap<String, Binding>,
}

impl Variables {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name).map(|b| &b.value)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

pub type HostFn = Arc<dyn Fn(&Variables, &[Value]) -> Value + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ScopeError {
    #[error("Variable '{0}' is read-only")]
    ReadOnly(String),

    #[error("Variable '{0}' is not declared")]
    Undeclared(String),

    #[error("Function '{0}' is not defined")]
    UnknownFunction(String),
}

#[derive(Default)]
pub struct EvalScope {
    variables: Variables,
    functions: HashMap<String, HostFn>,
}

impl EvalScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a read-only variable, replacing any previous binding.
    pub fn declare_constant(&mut self, name: &str, value: Value) {
        self.declare(name, value, false);
    }

    pub fn declare(&mut self, name: &str, value: Value, mutable: bool) {
        self.variables
            .bindings
            .insert(name.to_string(), Binding { value, mutable });
    }

    pub fn assign(&mut self, name: &str, value: Value) -> Result<(), ScopeError> {
        match self.variables.bindings.get_mut(name) {
            Some(binding) if binding.mutable => {
                binding.value = value;
                Ok(())
            }
            Some(_) => Err(ScopeError::ReadOnly(name.to_string())),
            None => Err(ScopeError::Undeclared(name.to_string())),
        }
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn define_function(&mut self, name: &str, function: HostFn) {
        self.functions.insert(name.to_string(), function);
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, ScopeError> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| ScopeError::UnknownFunction(name.to_string()))?;
        Ok(function(&self.variables, args))
    }
}

impl Drop for EvalScope {
    fn drop(&mut self) {
        debug!(
            variables = self.variables.len(),
            functions = self.functions.len(),
            "Evaluation scope released"
        );
    }
}

/// Read position over the inputs of one invocation.
///
/// `readInput` and `readNumber` share it, so interleaved calls consume the
/// same sequence.
#[derive(Clone)]
pub struct InputCursor {
    inputs: Arc<[String]>,
    position: Arc<AtomicUsize>,
}

impl InputCursor {
    pub fn new(inputs: &[String]) -> Self {
        Self {
            inputs: inputs.into(),
            position: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Next unread input, or `None` once exhausted.
    fn advance(&self) -> Option<&str> {
        let len = self.inputs.len();
        self.position
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| (p < len).then_some(p + 1))
            .ok()
            .map(|p| self.inputs[p].as_str())
    }

    /// Next input, or the empty string once exhausted.
    pub fn next_line(&self) -> String {
        self.advance().map(str::to_string).unwrap_or_default()
    }

    /// Next input parsed as a number. Unparseable entries are consumed and
    /// read as `0.0`, as is exhaustion.
    pub fn next_number(&self) -> f64 {
        self.advance()
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .unwrap_or(0.0)
    }

    pub fn consumed(&self) -> usize {
        self.position.load(Ordering::SeqCst)
    }
}

/// Install `readInput`, `readNumber` and `readEnv` into the scope.
pub fn install_host_functions(scope: &mut EvalScope, cursor: InputCursor) {
    let lines = cursor.clone();
    scope.define_function(
        READ_INPUT,
        Arc::new(move |_: &Variables, _: &[Value]| Value::Text(lines.next_line())),
    );

    let numbers = cursor;
    scope.define_function(
        READ_NUMBER,
        Arc::new(move |_: &Variables, _: &[Value]| {
            Value::Number(numbers.next_number())
        }),
    );

    scope.define_function(READ_ENV, Arc::new(read_env));
}

// The key comes from the first argument, or from a `key` variable when the
// engine binds parameters by name. The resolved key is then looked up as a
// variable name.
fn read_env(variables: &Variables, args: &[Value]) -> Value {
    let key = match args.first() {
        Some(arg) => arg.as_text(),
        None => variables.get("key").and_then(Value::as_text),
    };

    let value = key
        .and_then(|k| variables.get(k))
        .map(|v| v.to_string())
        .unwrap_or_default();

    Value::Text(value)
}
