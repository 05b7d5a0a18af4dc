//! QuickJS Backend
//!
//! Each engine owns its own QuickJS runtime and full context, so engines
//! never contend with each other. The shared `QuickJsRuntime` carries the
//! configuration, live-engine accounting and the shutdown gate.

use crate::console::install_console;
use crate::engine_trait::{
    CallId, CallOutcome, ChannelHook, EngineBackend, EngineId, EngineOptions, EngineRuntime,
    HookOutcome, Interrupt, ScriptEngine,
};
use crate::timers::{install_timers, TimerManager, TIMER_FIRE};
use crate::{EngineConfig, JsError, ScriptException, ScriptValue, SEND_HOOK, SETTLE_HOOK};
use rquickjs::convert::Coerced;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, Object, Runtime, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Script installed next to the native hook.
///
/// `sendMessage` returns a promise that settles when the host acknowledges
/// the call id handed back by the hook. A `null` or `undefined` hook result
/// (delivered without acknowledgement, or no such channel) resolves to `null`.
const BRIDGE_PRELUDE: &str = r#"
(function (global) {
    var pending = {};
    global.sendMessage = function (channel, message) {
        var payload = typeof message === 'string' ? message : JSON.stringify(message);
        var id = global.__bridgeSend(String(channel), payload);
        if (id === undefined || id === null) {
            return Promise.resolve(null);
        }
        return new Promise(function (resolve, reject) {
            pending[id] = { resolve: resolve, reject: reject };
        });
    };
    global.__bridgeSettle = function (id, ok, value) {
        var entry = pending[id];
        if (!entry) {
            return false;
        }
        delete pending[id];
        if (ok) {
            entry.resolve(value);
        } else {
            entry.reject(new Error(value));
        }
        return true;
    };
})(globalThis);
"#;

/// Upper bound on promise jobs drained after one evaluation
const MAX_PENDING_JOBS: usize = 100_000;

/// QuickJS engine family
#[derive(Debug, Clone, Default)]
pub struct QuickJsBackend {
    config: EngineConfig,
}

impl QuickJsBackend {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl EngineBackend for QuickJsBackend {
    fn name(&self) -> &'static str {
        "quickjs"
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn start(&self) -> Result<Arc<dyn EngineRuntime>, JsError> {
        tracing::info!(
            memory_limit = self.config.memory_limit,
            max_stack_size = self.config.max_stack_size,
            eval_timeout_ms = ?self.config.eval_timeout.map(|t| t.as_millis()),
            "Starting QuickJS runtime"
        );
        Ok(Arc::new(QuickJsRuntime::new(self.config.clone())))
    }
}

/// Shared state for every QuickJS engine of one registry
#[derive(Debug)]
pub struct QuickJsRuntime {
    config: EngineConfig,
    live: Arc<AtomicUsize>,
    shut_down: AtomicBool,
}

impl QuickJsRuntime {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            live: Arc::new(AtomicUsize::new(0)),
            shut_down: AtomicBool::new(false),
        }
    }
}

impl EngineRuntime for QuickJsRuntime {
    fn create_engine(&self, options: EngineOptions) -> Result<Box<dyn ScriptEngine>, JsError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(JsError::Runtime("runtime has been shut down".to_string()));
        }
        let engine = QuickJsEngine::new(&self.config, options, Arc::clone(&self.live))?;
        Ok(Box::new(engine))
    }

    fn live_engines(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::info!(live_engines = self.live_engines(), "QuickJS runtime shut down");
        }
    }
}

/// One QuickJS runtime + context
pub struct QuickJsEngine {
    id: EngineId,
    // Context is declared first so it drops before its runtime
    context: Context,
    runtime: Runtime,
    interrupt: Arc<Interrupt>,
    timers: Arc<Mutex<TimerManager>>,
    unhandled_rejections: Arc<AtomicUsize>,
    config: EngineConfig,
    hook_installed: bool,
    closed: bool,
    live: Arc<AtomicUsize>,
}

impl std::fmt::Debug for QuickJsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuickJsEngine")
            .field("id", &self.id)
            .field("hook_installed", &self.hook_installed)
            .field("closed", &self.closed)
            .finish()
    }
}

impl QuickJsEngine {
    fn new(
        config: &EngineConfig,
        options: EngineOptions,
        live: Arc<AtomicUsize>,
    ) -> Result<Self, JsError> {
        let id = options.id;
        let runtime = Runtime::new()?;
        runtime.set_memory_limit(config.memory_limit);
        runtime.set_max_stack_size(config.max_stack_size);
        if let Some(threshold) = config.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }

        let interrupt = Arc::clone(&options.interrupt);
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.should_interrupt())));

        let unhandled_rejections = Arc::new(AtomicUsize::new(0));
        let rejections = Arc::clone(&unhandled_rejections);
        runtime.set_host_promise_rejection_tracker(Some(Box::new(
            move |_ctx: Ctx<'_>, _promise: Value<'_>, reason: Value<'_>, is_handled: bool| {
                if is_handled {
                    // A handler was attached after the rejection
                    let _ = rejections.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        n.checked_sub(1)
                    });
                    return;
                }
                rejections.fetch_add(1, Ordering::SeqCst);
                let reason = reason
                    .get::<Coerced<String>>()
                    .map(|s| s.0)
                    .unwrap_or_else(|_| "[unknown]".to_string());
                tracing::warn!(engine_id = id, "Unhandled promise rejection: {}", reason);
            },
        )));

        let timers = Arc::new(Mutex::new(TimerManager::new()));
        let context = Context::full(&runtime)?;
        context.with(|ctx| {
            if config.console {
                install_console(&ctx, id)?;
            }
            install_timers(&ctx, id, Arc::clone(&timers))
        })?;

        live.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(engine_id = id, "QuickJS engine created");

        Ok(Self {
            id,
            context,
            runtime,
            interrupt: options.interrupt,
            timers,
            unhandled_rejections,
            config: config.clone(),
            hook_installed: false,
            closed: false,
            live,
        })
    }

    /// Rejected promises that currently have no handler
    pub fn unhandled_rejections(&self) -> usize {
        self.unhandled_rejections.load(Ordering::SeqCst)
    }

    fn timers(&self) -> MutexGuard<'_, TimerManager> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), JsError> {
        if self.closed {
            Err(JsError::Closed)
        } else {
            Ok(())
        }
    }

    /// Arm the interrupt, run `f` inside the context, then report an
    /// interruption over whatever `f` returned
    fn guarded<T>(
        &self,
        f: impl for<'js> FnOnce(&Ctx<'js>) -> Result<T, JsError>,
    ) -> Result<T, JsError> {
        self.interrupt.arm(self.config.eval_timeout);
        let result = self.context.with(|ctx| {
            let result = f(&ctx);
            let jobs = drain_jobs(&ctx, self.id, &self.interrupt);
            tracing::trace!(engine_id = self.id, jobs, ok = result.is_ok(), "Ran script");
            result
        });

        match self.interrupt.disarm() {
            Some(reason) => Err(Interrupt::error(reason, self.config.eval_timeout)),
            None => result,
        }
    }
}

/// Run queued promise jobs until none are left or the interrupt trips.
///
/// Jobs run through the borrowed context, so a failing job leaves its
/// exception pending on `ctx` instead of in a separately owned wrapper.
fn drain_jobs(ctx: &Ctx<'_>, engine_id: EngineId, interrupt: &Interrupt) -> usize {
    let mut executed = 0;

    while ctx.execute_pending_job() {
        executed += 1;

        let exception = ctx.catch();
        if exception.is_object() {
            let message = exception
                .get::<Coerced<String>>()
                .map(|s| s.0)
                .unwrap_or_else(|_| "[unknown]".to_string());
            tracing::warn!(engine_id, "Promise job failed: {}", message);
        }

        if interrupt.tripped().is_some() {
            break;
        }
        if executed >= MAX_PENDING_JOBS {
            tracing::warn!(engine_id, executed, "Promise job limit reached; deferring the rest");
            break;
        }
    }

    executed
}

impl ScriptEngine for QuickJsEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    fn evaluate(&mut self, code: &str) -> Result<ScriptValue, JsError> {
        self.ensure_open()?;
        self.guarded(|ctx| match ctx.eval::<Value, _>(code).catch(ctx) {
            Ok(value) => convert_value(ctx, value),
            Err(caught) => Err(convert_caught(caught)),
        })
    }

    fn install_channel_hook(&mut self, hook: ChannelHook) -> Result<(), JsError> {
        self.ensure_open()?;
        if self.hook_installed {
            return Ok(());
        }

        self.context.with(|ctx| install_hook(&ctx, hook))?;

        self.hook_installed = true;
        tracing::debug!(engine_id = self.id, "Channel hook installed");
        Ok(())
    }

    fn settle_call(&mut self, call_id: CallId, outcome: &CallOutcome) -> Result<bool, JsError> {
        self.ensure_open()?;
        if !self.hook_installed {
            return Ok(false);
        }

        let (ok, value) = match outcome {
            CallOutcome::Resolved(value) => (true, value.clone()),
            CallOutcome::Rejected(reason) => (false, reason.clone()),
        };

        self.guarded(|ctx| {
            let settle: Function = ctx.globals().get(SETTLE_HOOK)?;
            settle
                .call::<_, bool>((call_id as f64, ok, value))
                .catch(ctx)
                .map_err(convert_caught)
        })
    }

    fn run_timers(&mut self) -> Result<usize, JsError> {
        self.ensure_open()?;
        let due = self.timers().take_due(Instant::now());
        if due.is_empty() {
            return Ok(0);
        }

        let engine_id = self.id;
        let interrupt = &self.interrupt;
        self.guarded(move |ctx| {
            let fire: Function = ctx.globals().get(TIMER_FIRE)?;
            let mut fired = 0;

            for timer in due {
                if interrupt.tripped().is_some() {
                    break;
                }
                fired += 1;
                if let Err(caught) = fire.call::<_, ()>((timer.id, timer.repeat)).catch(ctx) {
                    let error = convert_caught(caught);
                    tracing::warn!(engine_id, timer_id = timer.id, error = %error, "Timer callback threw");
                }
                drain_jobs(ctx, engine_id, interrupt);
            }

            Ok(fired)
        })
    }

    fn next_timer(&self) -> Option<Duration> {
        if self.closed {
            return None;
        }
        self.timers().time_until_next(Instant::now())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.hook_installed {
            let detached = self.context.with(|ctx| {
                let globals = ctx.globals();
                globals.remove(SEND_HOOK)?;
                globals.remove(SETTLE_HOOK)
            });
            if let Err(e) = detached {
                tracing::warn!(engine_id = self.id, error = %e, "Failed to detach channel hook");
            }
        }

        self.timers().clear_all();
        self.runtime.run_gc();
        tracing::debug!(engine_id = self.id, "QuickJS engine closed");
    }
}

impl Drop for QuickJsEngine {
    fn drop(&mut self) {
        self.close();
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Register the native channel hook and evaluate the prelude
fn install_hook<'js>(ctx: &Ctx<'js>, hook: ChannelHook) -> rquickjs::Result<()> {
    let send = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, channel: Coerced<String>, message: Coerced<String>| {
            let result = match hook(&channel.0, &message.0) {
                HookOutcome::Queued(id) => Value::new_number(ctx, id as f64),
                HookOutcome::Delivered => Value::new_null(ctx),
                HookOutcome::NotRegistered => Value::new_undefined(ctx),
            };
            Ok::<Value<'js>, rquickjs::Error>(result)
        },
    )?;
    ctx.globals().set(SEND_HOOK, send)?;
    let _: Value = ctx.eval(BRIDGE_PRELUDE)?;
    Ok(())
}

/// Convert a QuickJS value into a `ScriptValue`
fn convert_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<ScriptValue, JsError> {
    if value.is_undefined() {
        return Ok(ScriptValue::Undefined);
    }
    if value.is_null() {
        return Ok(ScriptValue::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(ScriptValue::Bool(b));
    }
    if let Some(n) = value.as_int() {
        return Ok(ScriptValue::Number(n as f64));
    }
    if let Some(n) = value.as_float() {
        return Ok(ScriptValue::Number(n));
    }
    if let Some(s) = value.as_string() {
        return Ok(ScriptValue::String(s.to_string()?));
    }
    if value.is_function() {
        return Ok(ScriptValue::Function);
    }
    if value.is_object() {
        // Circular structures and BigInt members throw; keep the engine's message
        return match ctx.json_stringify(value).catch(ctx) {
            Ok(Some(json)) => Ok(ScriptValue::Json(json.to_string()?)),
            Ok(None) => Ok(ScriptValue::Undefined),
            Err(caught) => Err(convert_caught(caught)),
        };
    }

    // Symbols and BigInts have no lossless mapping; hand back their text
    Ok(value
        .get::<Coerced<String>>()
        .map(|s| ScriptValue::String(s.0))
        .unwrap_or_else(|_| ScriptValue::String("[unknown]".to_string())))
}

/// Convert a caught QuickJS failure into a `JsError`
fn convert_caught(caught: CaughtError<'_>) -> JsError {
    match caught {
        CaughtError::Exception(exception) => {
            let object: &Object = exception.as_object();
            JsError::Exception(ScriptException {
                name: object.get::<_, Option<String>>("name").ok().flatten(),
                message: exception.message().unwrap_or_default(),
                stack: exception.stack(),
                line: object.get::<_, Option<u32>>("lineNumber").ok().flatten(),
                column: object.get::<_, Option<u32>>("columnNumber").ok().flatten(),
            })
        }
        CaughtError::Value(value) => {
            let message = value
                .get::<Coerced<String>>()
                .map(|s| s.0)
                .unwrap_or_else(|_| "[unknown]".to_string());
            JsError::Exception(ScriptException::thrown(message))
        }
        CaughtError::Error(e) => JsError::Runtime(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn engine() -> Box<dyn ScriptEngine> {
        QuickJsBackend::default()
            .start()
            .unwrap()
            .create_engine(EngineOptions::new(7))
            .unwrap()
    }

    fn recording_hook(registered: &'static [&'static str]) -> (ChannelHook, Arc<Mutex<Vec<(String, String)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let hook: ChannelHook = Arc::new(move |channel: &str, message: &str| {
            if !registered.iter().any(|name| *name == channel) {
                return HookOutcome::NotRegistered;
            }
            let mut calls = seen.lock().unwrap();
            calls.push((channel.to_string(), message.to_string()));
            HookOutcome::Queued(calls.len() as CallId)
        });
        (hook, calls)
    }

    #[test]
    fn test_evaluate_number() {
        let mut engine = engine();
        assert_eq!(engine.evaluate("1 + 1").unwrap(), ScriptValue::Number(2.0));
        assert_eq!(engine.evaluate("0.5 * 3").unwrap(), ScriptValue::Number(1.5));
    }

    #[test]
    fn test_evaluate_structured() {
        let mut engine = engine();
        assert_eq!(
            engine.evaluate("({ a: 1, b: [true, null] })").unwrap(),
            ScriptValue::Json(r#"{"a":1,"b":[true,null]}"#.to_string())
        );
        assert_eq!(engine.evaluate("(function () {})").unwrap(), ScriptValue::Function);
        assert_eq!(engine.evaluate("undefined").unwrap(), ScriptValue::Undefined);
    }

    #[test]
    fn test_state_persists_between_evaluations() {
        let mut engine = engine();
        engine.evaluate("var counter = 40;").unwrap();
        engine.evaluate("counter += 2;").unwrap();
        assert_eq!(engine.evaluate("counter").unwrap(), ScriptValue::Number(42.0));
    }

    #[test]
    fn test_thrown_error() {
        let mut engine = engine();
        let err = engine.evaluate("throw new Error('x')").unwrap_err();
        let exception = err.exception().expect("script exception");
        assert_eq!(exception.name.as_deref(), Some("Error"));
        assert_eq!(exception.message, "x");
    }

    #[test]
    fn test_thrown_value() {
        let mut engine = engine();
        let err = engine.evaluate("throw 'plain'").unwrap_err();
        assert_eq!(err.exception().unwrap().message, "plain");
    }

    #[test]
    fn test_syntax_error() {
        let mut engine = engine();
        let err = engine.evaluate("var = ;").unwrap_err();
        assert_eq!(err.exception().unwrap().name.as_deref(), Some("SyntaxError"));
    }

    #[test]
    fn test_promise_jobs_drained() {
        let mut engine = engine();
        engine
            .evaluate("var resolved = 0; Promise.resolve(5).then(function (v) { resolved = v; });")
            .unwrap();
        assert_eq!(engine.evaluate("resolved").unwrap(), ScriptValue::Number(5.0));
    }

    #[test]
    fn test_channel_hook_queues_message() {
        let mut engine = engine();
        let (hook, calls) = recording_hook(&["foo"]);
        engine.install_channel_hook(hook).unwrap();

        let id = engine.evaluate("__bridgeSend('foo', 'bar')").unwrap();
        assert_eq!(id, ScriptValue::Number(1.0));
        assert_eq!(*calls.lock().unwrap(), vec![("foo".to_string(), "bar".to_string())]);
    }

    #[test]
    fn test_unregistered_channel_returns_sentinel() {
        let mut engine = engine();
        let (hook, calls) = recording_hook(&["foo"]);
        engine.install_channel_hook(hook).unwrap();

        assert_eq!(
            engine.evaluate("__bridgeSend('nope', 'bar') == null").unwrap(),
            ScriptValue::Bool(true)
        );
        assert_eq!(
            engine
                .evaluate("var got = 'pending'; sendMessage('nope', 'x').then(function (v) { got = v; }); got")
                .unwrap(),
            ScriptValue::String("pending".into())
        );
        assert_eq!(engine.evaluate("got").unwrap(), ScriptValue::Null);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_settle_call_resolves_promise() {
        let mut engine = engine();
        let (hook, _calls) = recording_hook(&["foo"]);
        engine.install_channel_hook(hook).unwrap();

        engine
            .evaluate("var reply; sendMessage('foo', { n: 1 }).then(function (v) { reply = v; });")
            .unwrap();
        assert!(engine.settle_call(1, &CallOutcome::Resolved("pong".into())).unwrap());
        assert_eq!(engine.evaluate("reply").unwrap(), ScriptValue::String("pong".into()));

        // Already settled
        assert!(!engine.settle_call(1, &CallOutcome::Resolved("again".into())).unwrap());
    }

    #[test]
    fn test_settle_call_rejects_promise() {
        let mut engine = engine();
        let (hook, _calls) = recording_hook(&["foo"]);
        engine.install_channel_hook(hook).unwrap();

        engine
            .evaluate("var failure; sendMessage('foo', 'x').catch(function (e) { failure = e.message; });")
            .unwrap();
        assert!(engine.settle_call(1, &CallOutcome::Rejected("denied".into())).unwrap());
        assert_eq!(engine.evaluate("failure").unwrap(), ScriptValue::String("denied".into()));
    }

    #[test]
    fn test_eval_timeout() {
        let runtime = QuickJsBackend::new(
            EngineConfig::default().with_eval_timeout(Duration::from_millis(50)),
        )
        .start()
        .unwrap();
        let mut engine = runtime.create_engine(EngineOptions::new(1)).unwrap();

        let err = engine.evaluate("while (true) {}").unwrap_err();
        assert!(matches!(err, JsError::TimedOut(50)));

        // Engine is still usable afterwards
        assert_eq!(engine.evaluate("2 + 2").unwrap(), ScriptValue::Number(4.0));
    }

    #[test]
    fn test_cancelled_engine() {
        let interrupt = Arc::new(Interrupt::new());
        let runtime = QuickJsBackend::default().start().unwrap();
        let mut engine = runtime
            .create_engine(EngineOptions::with_interrupt(1, Arc::clone(&interrupt)))
            .unwrap();

        interrupt.cancel();
        assert!(matches!(engine.evaluate("while (true) {}"), Err(JsError::Interrupted)));
    }

    #[test]
    fn test_timeout_inside_promise_job() {
        let runtime = QuickJsBackend::new(
            EngineConfig::default().with_eval_timeout(Duration::from_millis(50)),
        )
        .start()
        .unwrap();
        let mut engine = runtime.create_engine(EngineOptions::new(1)).unwrap();

        // The script itself finishes; its `.then` job never does
        let err = engine
            .evaluate("Promise.resolve().then(function () { while (true) {} }); 7")
            .unwrap_err();
        assert!(matches!(err, JsError::TimedOut(50)));

        assert_eq!(engine.evaluate("2 + 2").unwrap(), ScriptValue::Number(4.0));
        engine.close();
        drop(engine);
        assert_eq!(runtime.live_engines(), 0);
    }

    #[test]
    fn test_cancel_inside_promise_job() {
        let interrupt = Arc::new(Interrupt::new());
        let runtime = QuickJsBackend::default().start().unwrap();
        let mut engine = runtime
            .create_engine(EngineOptions::with_interrupt(1, Arc::clone(&interrupt)))
            .unwrap();

        let canceller = Arc::clone(&interrupt);
        let timer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let result = engine.evaluate("Promise.resolve().then(function () { while (true) {} }); 1");
        timer.join().unwrap();
        assert!(matches!(result, Err(JsError::Interrupted)));
        drop(engine);
    }

    #[test]
    fn test_failing_promise_job_keeps_draining() {
        let mut engine = engine();
        engine
            .evaluate(
                "var after = 0;\
                 Promise.resolve().then(function () { throw new Error('boom'); });\
                 Promise.resolve().then(function () { after = 1; });",
            )
            .unwrap();
        assert_eq!(engine.evaluate("after").unwrap(), ScriptValue::Number(1.0));
    }

    #[test]
    fn test_unhandled_rejection_tracked() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut engine = QuickJsEngine::new(&EngineConfig::default(), EngineOptions::new(3), live).unwrap();

        engine.evaluate("Promise.reject(new Error('lost'))").unwrap();
        assert_eq!(engine.unhandled_rejections(), 1);

        engine.evaluate("Promise.reject(2).catch(function () {})").unwrap();
        assert_eq!(engine.unhandled_rejections(), 1);
    }

    #[test]
    fn test_set_timeout_fires_when_due() {
        let mut engine = engine();
        engine
            .evaluate(
                "var fired = [];\
                 setTimeout(function (tag) { fired.push(tag); }, 30, 'late');\
                 setTimeout(function () { fired.push('soon'); });",
            )
            .unwrap();

        // Timers never run inside evaluate
        assert_eq!(engine.evaluate("fired.length").unwrap(), ScriptValue::Number(0.0));
        assert_eq!(engine.next_timer(), Some(Duration::ZERO));

        assert_eq!(engine.run_timers().unwrap(), 1);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(engine.run_timers().unwrap(), 1);

        assert_eq!(engine.evaluate("fired.join(',')").unwrap(), ScriptValue::String("soon,late".into()));
        assert_eq!(engine.next_timer(), None);
    }

    #[test]
    fn test_clear_timeout() {
        let mut engine = engine();
        engine
            .evaluate("var ran = false; var t = setTimeout(function () { ran = true; }, 0); clearTimeout(t);")
            .unwrap();
        assert_eq!(engine.next_timer(), None);
        assert_eq!(engine.run_timers().unwrap(), 0);
        assert_eq!(engine.evaluate("ran").unwrap(), ScriptValue::Bool(false));
    }

    #[test]
    fn test_set_interval_repeats_until_cleared() {
        let mut engine = engine();
        engine
            .evaluate("var ticks = 0; var i = setInterval(function () { ticks++; if (ticks === 3) clearInterval(i); }, 1);")
            .unwrap();

        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(3));
            engine.run_timers().unwrap();
        }
        assert_eq!(engine.evaluate("ticks").unwrap(), ScriptValue::Number(3.0));
        assert_eq!(engine.next_timer(), None);
    }

    #[test]
    fn test_throwing_timer_callback() {
        let mut engine = engine();
        engine
            .evaluate(
                "var second = false;\
                 setTimeout(function () { throw new Error('timer'); });\
                 setTimeout(function () { second = true; });",
            )
            .unwrap();
        assert_eq!(engine.run_timers().unwrap(), 2);
        assert_eq!(engine.evaluate("second").unwrap(), ScriptValue::Bool(true));
    }

    #[test]
    fn test_timer_timeout_interrupts_callback() {
        let runtime = QuickJsBackend::new(
            EngineConfig::default().with_eval_timeout(Duration::from_millis(50)),
        )
        .start()
        .unwrap();
        let mut engine = runtime.create_engine(EngineOptions::new(1)).unwrap();

        engine.evaluate("setTimeout(function () { while (true) {} })").unwrap();
        assert!(matches!(engine.run_timers(), Err(JsError::TimedOut(50))));
        assert_eq!(engine.evaluate("1").unwrap(), ScriptValue::Number(1.0));
    }

    #[test]
    fn test_close_clears_timers() {
        let mut engine = engine();
        engine.evaluate("setTimeout(function () {}, 1000)").unwrap();
        assert!(engine.next_timer().is_some());

        engine.close();
        assert_eq!(engine.next_timer(), None);
        assert!(matches!(engine.run_timers(), Err(JsError::Closed)));
    }

    #[test]
    fn test_send_without_acknowledgement_resolves_null() {
        let mut engine = engine();
        engine
            .install_channel_hook(Arc::new(|_: &str, _: &str| HookOutcome::Delivered))
            .unwrap();

        assert_eq!(engine.evaluate("__bridgeSend('log', 'x')").unwrap(), ScriptValue::Null);
        engine
            .evaluate("var got = 'pending'; sendMessage('log', 'x').then(function (v) { got = v; });")
            .unwrap();
        assert_eq!(engine.evaluate("got").unwrap(), ScriptValue::Null);
    }

    #[test]
    fn test_close_rejects_evaluation() {
        let mut engine = engine();
        engine.close();
        engine.close();
        assert!(matches!(engine.evaluate("1"), Err(JsError::Closed)));
    }

    #[test]
    fn test_runtime_accounting_and_shutdown() {
        let runtime = QuickJsBackend::default().start().unwrap();
        let a = runtime.create_engine(EngineOptions::new(1)).unwrap();
        let b = runtime.create_engine(EngineOptions::new(2)).unwrap();
        assert_eq!(runtime.live_engines(), 2);

        drop(a);
        assert_eq!(runtime.live_engines(), 1);

        runtime.shutdown();
        assert!(runtime.create_engine(EngineOptions::new(3)).is_err());
        drop(b);
        assert_eq!(runtime.live_engines(), 0);
    }
}
