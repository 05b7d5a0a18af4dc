//! fOS JavaScript Engines
//!
//! Pluggable script engines for the fOS script bridge.
//!
//! Features:
//! - QuickJS backend via rquickjs (one runtime + context per engine)
//! - Stub backend for deterministic tests
//! - Console API (log, warn, error) routed to `tracing`
//! - `setTimeout`/`setInterval`, fired by the engine's owner
//! - Native channel hook + `sendMessage` prelude for script-to-host messages

mod config;
mod console;
mod engine_trait;
mod quickjs;
mod stub_engine;
mod timers;

pub use config::EngineConfig;
pub use engine_trait::{
    CallId, CallOutcome, ChannelHook, EngineBackend, EngineId, EngineOptions, EngineRuntime,
    HookOutcome, Interrupt, InterruptReason, ScriptEngine,
};
pub use quickjs::{QuickJsBackend, QuickJsEngine, QuickJsRuntime};
pub use stub_engine::{StubBackend, StubEngine};
pub use timers::{DueTimer, TimerId, TimerManager};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the native function scripts call to reach a registered channel.
pub const SEND_HOOK: &str = "__bridgeSend";

/// Name of the prelude function the bridge calls to settle a pending call.
pub const SETTLE_HOOK: &str = "__bridgeSettle";

/// Evaluate JavaScript code in a throwaway QuickJS engine
pub fn eval(code: &str) -> Result<ScriptValue, JsError> {
    let runtime = QuickJsBackend::new(EngineConfig::default()).start()?;
    let mut engine = runtime.create_engine(EngineOptions::new(0))?;
    let result = engine.evaluate(code);
    engine.close();
    result
}

/// JavaScript value marshalled out of an engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum ScriptValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Objects and arrays, as `JSON.stringify` text
    Json(String),
    Function,
}

impl ScriptValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) | ScriptValue::Json(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, ScriptValue::Undefined | ScriptValue::Null)
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Undefined => f.write_str("undefined"),
            ScriptValue::Null => f.write_str("null"),
            ScriptValue::Bool(b) => write!(f, "{}", b),
            ScriptValue::Number(n) => format_number(f, *n),
            ScriptValue::String(s) | ScriptValue::Json(s) => f.write_str(s),
            ScriptValue::Function => f.write_str("[Function]"),
        }
    }
}

/// Numbers print the way JS prints them: `2`, not `2.0`
fn format_number(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if n.is_nan() {
        f.write_str("NaN")
    } else if n.is_infinite() {
        f.write_str(if n > 0.0 { "Infinity" } else { "-Infinity" })
    } else if n == 0.0 {
        // Covers -0 too
        f.write_str("0")
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        write!(f, "{:.0}", n)
    } else {
        write!(f, "{}", n)
    }
}

/// Exception thrown by a script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptException {
    /// Error class name (`Error`, `SyntaxError`, ...) when the thrown value was an Error
    pub name: Option<String>,
    pub message: String,
    pub stack: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl ScriptException {
    /// Exception for a thrown non-Error value (`throw 'x'`)
    pub fn thrown(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message)?,
            None => write!(f, "Uncaught {}", self.message)?,
        }
        if let Some(line) = self.line {
            write!(f, " (line {}", line)?;
            if let Some(column) = self.column {
                write!(f, ", column {}", column)?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// JavaScript error
#[derive(Debug, thiserror::Error)]
pub enum JsError {
    #[error("{0}")]
    Exception(ScriptException),

    #[error("execution interrupted")]
    Interrupted,

    #[error("execution timed out after {0}ms")]
    TimedOut(u64),

    #[error("engine is closed")]
    Closed,

    #[error("JavaScript error: {0}")]
    Runtime(String),
}

impl JsError {
    /// Script-level exception details, if the script threw
    pub fn exception(&self) -> Option<&ScriptException> {
        match self {
            JsError::Exception(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rquickjs::Error> for JsError {
    fn from(e: rquickjs::Error) -> Self {
        JsError::Runtime(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_simple() {
        let result = eval("1 + 1").unwrap();
        match result {
            ScriptValue::Number(n) => assert_eq!(n, 2.0),
            _ => panic!("Expected number"),
        }
    }

    #[test]
    fn test_display_numbers() {
        assert_eq!(ScriptValue::Number(2.0).to_string(), "2");
        assert_eq!(ScriptValue::Number(0.5).to_string(), "0.5");
        assert_eq!(ScriptValue::Number(f64::NAN).to_string(), "NaN");
        assert_eq!(ScriptValue::Number(f64::NEG_INFINITY).to_string(), "-Infinity");
        assert_eq!(ScriptValue::Number(-0.0).to_string(), "0");
        assert_eq!(ScriptValue::Number(-42.0).to_string(), "-42");
    }

    #[test]
    fn test_display_large_integers() {
        // Past i64::MAX but below the exponent cutoff
        assert_eq!(ScriptValue::Number(1e20).to_string(), "100000000000000000000");
        assert_eq!(ScriptValue::Number(-1e19).to_string(), "-10000000000000000000");
        assert_eq!(
            ScriptValue::Number(9007199254740993.0).to_string(),
            "9007199254740992"
        );
        assert_eq!(eval("1e20").unwrap().to_string(), "100000000000000000000");
    }

    #[test]
    fn test_exception_display() {
        let e = ScriptException {
            name: Some("Error".into()),
            message: "x".into(),
            line: Some(3),
            column: Some(7),
            ..Default::default()
        };
        assert_eq!(e.to_string(), "Error: x (line 3, column 7)");
        assert_eq!(ScriptException::thrown("boom").to_string(), "Uncaught boom");
    }
}
