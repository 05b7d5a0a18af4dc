//! Timer APIs
//!
//! Implements setTimeout and setInterval. Callbacks stay in the script; the
//! `TimerManager` only tracks ids and due times, and the engine fires due
//! timers when its owner asks it to.

use crate::EngineId;
use rquickjs::{Ctx, Function, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Timer id handed to scripts
pub type TimerId = u32;

/// Name of the prelude function that runs one timer's callback.
pub(crate) const TIMER_FIRE: &str = "__timerFire";

const TIMER_PRELUDE: &str = r#"
(function (global) {
    var callbacks = {};
    function schedule(repeat, callback, delay, args) {
        if (typeof callback !== 'function') {
            throw new TypeError('timer callback must be a function');
        }
        var id = global.__timerSet(Number(delay) || 0, repeat);
        callbacks[id] = { fn: callback, args: args };
        return id;
    }
    function clear(id) {
        id = Number(id);
        delete callbacks[id];
        global.__timerClear(id);
    }
    global.setTimeout = function (callback, delay) {
        return schedule(false, callback, delay, Array.prototype.slice.call(arguments, 2));
    };
    global.setInterval = function (callback, delay) {
        return schedule(true, callback, delay, Array.prototype.slice.call(arguments, 2));
    };
    global.clearTimeout = clear;
    global.clearInterval = clear;
    global.__timerFire = function (id, repeat) {
        var entry = callbacks[id];
        if (!entry) {
            return;
        }
        if (!repeat) {
            delete callbacks[id];
        }
        entry.fn.apply(global, entry.args);
    };
})(globalThis);
"#;

/// Timer entry
#[derive(Debug, Clone)]
struct Timer {
    delay: Duration,
    repeat: bool,
    due: Instant,
}

/// A timer whose callback should run now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueTimer {
    pub id: TimerId,
    pub repeat: bool,
}

/// Timer manager
#[derive(Debug, Default)]
pub struct TimerManager {
    timers: HashMap<TimerId, Timer>,
    last_id: TimerId,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a timeout
    pub fn set_timeout(&mut self, delay: Duration) -> TimerId {
        self.insert(delay, false)
    }

    /// Add an interval; intervals fire at most once per millisecond
    pub fn set_interval(&mut self, delay: Duration) -> TimerId {
        self.insert(delay.max(Duration::from_millis(1)), true)
    }

    fn insert(&mut self, delay: Duration, repeat: bool) -> TimerId {
        self.last_id = self.last_id.wrapping_add(1).max(1);
        let id = self.last_id;
        self.timers.insert(
            id,
            Timer {
                delay,
                repeat,
                due: Instant::now() + delay,
            },
        );
        id
    }

    /// Clear a timer; `false` if it was unknown or already fired
    pub fn clear(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id).is_some()
    }

    /// Timers due at `now`, earliest first.
    ///
    /// One-shot timers are removed; intervals are pushed one period ahead.
    pub fn take_due(&mut self, now: Instant) -> Vec<DueTimer> {
        let mut due: Vec<(Instant, TimerId)> = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.due <= now)
            .map(|(id, timer)| (timer.due, *id))
            .collect();
        due.sort();

        due.into_iter()
            .filter_map(|(_, id)| {
                let timer = self.timers.get_mut(&id)?;
                if timer.repeat {
                    timer.due = now + timer.delay;
                    Some(DueTimer { id, repeat: true })
                } else {
                    self.timers.remove(&id);
                    Some(DueTimer { id, repeat: false })
                }
            })
            .collect()
    }

    /// Check if there are pending timers
    pub fn has_pending(&self) -> bool {
        !self.timers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Get time until next timer fires
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.timers
            .values()
            .map(|timer| timer.due.saturating_duration_since(now))
            .min()
    }

    pub fn clear_all(&mut self) {
        self.timers.clear();
    }
}

fn delay_from(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::from_secs_f64(ms.min(u32::MAX as f64) / 1000.0)
    } else {
        Duration::ZERO
    }
}

/// Install timer APIs into the global object
pub(crate) fn install_timers<'js>(
    ctx: &Ctx<'js>,
    engine_id: EngineId,
    timers: Arc<Mutex<TimerManager>>,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let tm = Arc::clone(&timers);
    globals.set(
        "__timerSet",
        Function::new(ctx.clone(), move |delay_ms: f64, repeat: bool| {
            let delay = delay_from(delay_ms);
            let mut timers = tm.lock().unwrap_or_else(PoisonError::into_inner);
            let id = if repeat {
                timers.set_interval(delay)
            } else {
                timers.set_timeout(delay)
            };
            tracing::trace!(engine_id, timer_id = id, ?delay, repeat, "Timer scheduled");
            id
        })?,
    )?;

    let tm = timers;
    globals.set(
        "__timerClear",
        Function::new(ctx.clone(), move |id: f64| {
            if id.is_finite() && id >= 1.0 && id <= TimerId::MAX as f64 {
                tm.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear(id as TimerId);
            }
        })?,
    )?;

    let _: Value = ctx.eval(TIMER_PRELUDE)?;
    Ok(())
}
