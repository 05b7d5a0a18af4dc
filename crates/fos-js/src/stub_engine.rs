//! Stub JavaScript Engine
//!
//! Minimal backend implementing the engine traits without an interpreter.
//! It understands just enough syntax to drive the bridge deterministically
//! in tests: literals, simple arithmetic, `var` bindings, `throw`,
//! `sleep(ms)` and `sendMessage(channel, message)`.

use crate::engine_trait::{
    CallId, CallOutcome, ChannelHook, EngineBackend, EngineId, EngineOptions, EngineRuntime,
    HookOutcome, Interrupt, ScriptEngine,
};
use crate::{EngineConfig, JsError, ScriptException, ScriptValue};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Stub engine family
#[derive(Debug, Clone, Default)]
pub struct StubBackend {
    config: EngineConfig,
}

impl StubBackend {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl EngineBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn start(&self) -> Result<Arc<dyn EngineRuntime>, JsError> {
        tracing::info!("Starting stub runtime");
        Ok(Arc::new(StubRuntime {
            config: self.config.clone(),
            live: Arc::new(AtomicUsize::new(0)),
            shut_down: AtomicBool::new(false),
        }))
    }
}

struct StubRuntime {
    config: EngineConfig,
    live: Arc<AtomicUsize>,
    shut_down: AtomicBool,
}

impl EngineRuntime for StubRuntime {
    fn create_engine(&self, options: EngineOptions) -> Result<Box<dyn ScriptEngine>, JsError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(JsError::Runtime("runtime has been shut down".to_string()));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubEngine {
            id: options.id,
            interrupt: options.interrupt,
            eval_timeout: self.config.eval_timeout,
            globals: HashMap::new(),
            hook: None,
            pending: HashSet::new(),
            closed: false,
            live: Arc::clone(&self.live),
        }))
    }

    fn live_engines(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Stub JavaScript engine.
pub struct StubEngine {
    id: EngineId,
    interrupt: Arc<Interrupt>,
    eval_timeout: Option<Duration>,
    globals: HashMap<String, ScriptValue>,
    hook: Option<ChannelHook>,
    pending: HashSet<CallId>,
    closed: bool,
    live: Arc<AtomicUsize>,
}

impl StubEngine {
    /// Parse a simple literal value from code.
    fn parse_literal(&self, code: &str) -> Option<ScriptValue> {
        let code = code.trim();

        match code {
            "undefined" => return Some(ScriptValue::Undefined),
            "null" => return Some(ScriptValue::Null),
            "true" => return Some(ScriptValue::Bool(true)),
            "false" => return Some(ScriptValue::Bool(false)),
            _ => {}
        }

        // Number (integer or float)
        if let Ok(n) = code.parse::<f64>() {
            return Some(ScriptValue::Number(n));
        }

        // String literal
        for quote in ['"', '\''] {
            if code.len() >= 2 && code.starts_with(quote) && code.ends_with(quote) {
                let inner = &code[1..code.len() - 1];
                if !inner.contains(quote) {
                    return Some(ScriptValue::String(inner.to_string()));
                }
            }
        }

        None
    }

    /// Literal or bound variable
    fn operand(&self, code: &str) -> Option<ScriptValue> {
        self.parse_literal(code)
            .or_else(|| self.globals.get(code.trim()).cloned())
    }

    /// Evaluate a simple arithmetic expression.
    fn eval_simple_expr(&self, code: &str) -> Option<ScriptValue> {
        for op in ['+', '-', '*', '/'] {
            if let Some(pos) = code.find(op) {
                let left = self.operand(&code[..pos])?;
                let right = self.operand(&code[pos + 1..])?;

                // String concatenation takes priority for +
                if op == '+' {
                    if let (ScriptValue::String(l), ScriptValue::String(r)) = (&left, &right) {
                        return Some(ScriptValue::String(format!("{}{}", l, r)));
                    }
                }

                if let (ScriptValue::Number(l), ScriptValue::Number(r)) = (&left, &right) {
                    let result = match op {
                        '+' => l + r,
                        '-' => l - r,
                        '*' => l * r,
                        _ => l / r,
                    };
                    return Some(ScriptValue::Number(result));
                }
            }
        }

        None
    }

    /// Check if code is a typeof expression.
    fn eval_typeof(&self, code: &str) -> Option<ScriptValue> {
        let expr = code.strip_prefix("typeof ")?.trim();
        let type_str = match self.operand(expr) {
            None | Some(ScriptValue::Undefined) => "undefined",
            Some(ScriptValue::Null) | Some(ScriptValue::Json(_)) => "object",
            Some(ScriptValue::Bool(_)) => "boolean",
            Some(ScriptValue::Number(_)) => "number",
            Some(ScriptValue::String(_)) => "string",
            Some(ScriptValue::Function) => "function",
        };
        Some(ScriptValue::String(type_str.to_string()))
    }

    /// Evaluate one statement
    fn eval_statement(&mut self, code: &str) -> Result<ScriptValue, JsError> {
        let code = code.trim();

        if code.is_empty() {
            return Ok(ScriptValue::Undefined);
        }

        if let Some(thrown) = code.strip_prefix("throw ") {
            return Err(self.throw(thrown.trim()));
        }

        if let Some(binding) = code.strip_prefix("var ") {
            let (name, expr) = binding
                .split_once('=')
                .ok_or_else(|| syntax_error("missing initializer"))?;
            let value = self.eval_statement(expr)?;
            self.globals.insert(name.trim().to_string(), value);
            return Ok(ScriptValue::Undefined);
        }

        if let Some(args) = call_args(code, "sleep") {
            let ms = args
                .first()
                .and_then(|a| a.parse::<u64>().ok())
                .ok_or_else(|| syntax_error("sleep expects milliseconds"))?;
            return self.sleep(Duration::from_millis(ms));
        }

        for name in ["sendMessage", crate::SEND_HOOK] {
            if let Some(args) = call_args(code, name) {
                return self.send(name, &args);
            }
        }

        if let Some(value) = self.eval_typeof(code) {
            return Ok(value);
        }
        if let Some(value) = self.operand(code) {
            return Ok(value);
        }
        if let Some(value) = self.eval_simple_expr(code) {
            return Ok(value);
        }

        tracing::debug!(engine_id = self.id, "[StubEngine] Cannot evaluate: {}", code);
        Err(syntax_error(&format!("unsupported expression: {}", code)))
    }

    fn throw(&self, thrown: &str) -> JsError {
        if let Some(args) = call_args(thrown, "new Error") {
            let message = args
                .first()
                .and_then(|a| self.parse_literal(a))
                .map(|v| v.to_string())
                .unwrap_or_default();
            return JsError::Exception(ScriptException {
                name: Some("Error".to_string()),
                message,
                ..Default::default()
            });
        }

        let message = self
            .operand(thrown)
            .map(|v| v.to_string())
            .unwrap_or_else(|| thrown.to_string());
        JsError::Exception(ScriptException::thrown(message))
    }

    /// Block the script thread, polling the interrupt flag
    fn sleep(&self, duration: Duration) -> Result<ScriptValue, JsError> {
        let slice = Duration::from_millis(5);
        let mut remaining = duration;

        while !remaining.is_zero() {
            if self.interrupt.should_interrupt() {
                return Err(syntax_error("interrupted"));
            }
            let step = remaining.min(slice);
            thread::sleep(step);
            remaining -= step;
        }

        Ok(ScriptValue::Undefined)
    }

    fn send(&mut self, name: &str, args: &[&str]) -> Result<ScriptValue, JsError> {
        let Some(hook) = self.hook.clone() else {
            return Err(JsError::Exception(ScriptException {
                name: Some("ReferenceError".to_string()),
                message: format!("{} is not defined", name),
                ..Default::default()
            }));
        };

        let arg = |i: usize| {
            args.get(i)
                .and_then(|a| self.operand(a))
                .map(|v| v.to_string())
                .unwrap_or_else(|| "undefined".to_string())
        };

        match hook(&arg(0), &arg(1)) {
            HookOutcome::Queued(call_id) => {
                self.pending.insert(call_id);
                Ok(ScriptValue::Number(call_id as f64))
            }
            HookOutcome::Delivered => Ok(ScriptValue::Null),
            HookOutcome::NotRegistered => Ok(ScriptValue::Undefined),
        }
    }
}

impl ScriptEngine for StubEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    fn evaluate(&mut self, code: &str) -> Result<ScriptValue, JsError> {
        if self.closed {
            return Err(JsError::Closed);
        }

        self.interrupt.arm(self.eval_timeout);
        let mut result = Ok(ScriptValue::Undefined);
        for statement in code.split(';') {
            result = self.eval_statement(statement);
            if result.is_err() {
                break;
            }
        }
        match self.interrupt.disarm() {
            Some(reason) => Err(Interrupt::error(reason, self.eval_timeout)),
            None => result,
        }
    }

    fn install_channel_hook(&mut self, hook: ChannelHook) -> Result<(), JsError> {
        if self.closed {
            return Err(JsError::Closed);
        }
        if self.hook.is_none() {
            self.hook = Some(hook);
        }
        Ok(())
    }

    fn settle_call(&mut self, call_id: CallId, _outcome: &CallOutcome) -> Result<bool, JsError> {
        if self.closed {
            return Err(JsError::Closed);
        }
        Ok(self.pending.remove(&call_id))
    }

    fn close(&mut self) {
        self.closed = true;
        self.hook = None;
        self.pending.clear();
    }
}

impl Drop for StubEngine {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Arguments of `name(a, b)`, split naively on commas
fn call_args<'a>(code: &'a str, name: &str) -> Option<Vec<&'a str>> {
    let inner = code
        .trim()
        .strip_prefix(name)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    Some(inner.split(',').map(str::trim).collect())
}

fn syntax_error(message: &str) -> JsError {
    JsError::Exception(ScriptException {
        name: Some("SyntaxError".to_string()),
        message: message.to_string(),
        ..Default::default()
    })
}
