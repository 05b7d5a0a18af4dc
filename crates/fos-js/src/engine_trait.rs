//! JavaScript Engine Trait
//!
//! Abstract interface for script engines, allowing pluggable backends.
//! The bridge is written once against these traits; QuickJS and the stub
//! backend are interchangeable implementations.

use crate::{EngineConfig, JsError, ScriptValue};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Caller-assigned engine identifier
pub type EngineId = i64;

/// Correlation id of a script-to-host channel call
pub type CallId = u64;

/// Engine family that can be started into a shared runtime.
pub trait EngineBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Configuration every engine of this backend is created with.
    fn config(&self) -> &EngineConfig;

    /// Start the process-wide runtime resource shared by all engines.
    fn start(&self) -> Result<Arc<dyn EngineRuntime>, JsError>;
}

/// Process-wide state shared by every engine a backend creates.
pub trait EngineRuntime: Send + Sync {
    /// Create one isolated execution context.
    fn create_engine(&self, options: EngineOptions) -> Result<Box<dyn ScriptEngine>, JsError>;

    /// Number of engines created by this runtime that have not been dropped.
    fn live_engines(&self) -> usize;

    /// Refuse further engine creation and release shared state.
    fn shutdown(&self);
}

/// One isolated script execution context.
///
/// Engines are used by one thread at a time; callers serialize access.
pub trait ScriptEngine: Send {
    fn id(&self) -> EngineId;

    /// Evaluate a script and run any promise jobs it queued.
    fn evaluate(&mut self, code: &str) -> Result<ScriptValue, JsError>;

    /// Install the native channel hook and the `sendMessage` prelude.
    ///
    /// Idempotent: a second call keeps the first hook.
    fn install_channel_hook(&mut self, hook: ChannelHook) -> Result<(), JsError>;

    /// Settle the promise a script got back from `sendMessage`.
    ///
    /// Returns `false` if the script has no pending call with this id.
    fn settle_call(&mut self, call_id: CallId, outcome: &CallOutcome) -> Result<bool, JsError>;

    /// Fire every timer that is due and run the promise jobs they queue.
    ///
    /// Returns how many timer callbacks ran.
    fn run_timers(&mut self) -> Result<usize, JsError> {
        Ok(0)
    }

    /// Delay until the next scheduled timer is due, if any.
    fn next_timer(&self) -> Option<Duration> {
        None
    }

    /// Detach the channel hook and release the context.
    fn close(&mut self);
}

/// Options for creating a single engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub id: EngineId,
    pub interrupt: Arc<Interrupt>,
}

impl EngineOptions {
    pub fn new(id: EngineId) -> Self {
        Self {
            id,
            interrupt: Arc::new(Interrupt::new()),
        }
    }

    pub fn with_interrupt(id: EngineId, interrupt: Arc<Interrupt>) -> Self {
        Self { id, interrupt }
    }
}

/// Result of a script invoking the channel hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// Message queued for the host; the host settles it under this call id
    Queued(CallId),
    /// Message handed to a relay that never acknowledges
    Delivered,
    /// No relay registered under the channel name
    NotRegistered,
}

/// Native callback invoked with `(channel, message)` from script.
///
/// Runs on the script's thread while the engine is locked, so it must not
/// block on the host.
pub type ChannelHook = Arc<dyn Fn(&str, &str) -> HookOutcome + Send + Sync>;

/// Host answer to a pending channel call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "camelCase")]
pub enum CallOutcome {
    Resolved(String),
    Rejected(String),
}

/// Why an evaluation was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    Cancelled,
    TimedOut,
}

/// Cooperative interrupt flag polled by engines while scripts run.
///
/// Polling is lock-free: the deadline is kept as nanoseconds since the
/// flag's creation.
#[derive(Debug)]
pub struct Interrupt {
    cancelled: AtomicBool,
    epoch: Instant,
    /// Nanoseconds after `epoch`; `NO_DEADLINE` while disarmed
    deadline: AtomicU64,
    tripped: AtomicU8,
}

const NO_DEADLINE: u64 = u64::MAX;

const NOT_TRIPPED: u8 = 0;
const TRIPPED_CANCELLED: u8 = 1;
const TRIPPED_TIMED_OUT: u8 = 2;

impl Default for Interrupt {
    fn default() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            epoch: Instant::now(),
            deadline: AtomicU64::new(NO_DEADLINE),
            tripped: AtomicU8::new(NOT_TRIPPED),
        }
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(NO_DEADLINE - 1)
}

fn decode(tripped: u8) -> Option<InterruptReason> {
    match tripped {
        TRIPPED_CANCELLED => Some(InterruptReason::Cancelled),
        TRIPPED_TIMED_OUT => Some(InterruptReason::TimedOut),
        _ => None,
    }
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the running evaluation and every later one.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Start timing an evaluation.
    pub fn arm(&self, timeout: Option<Duration>) {
        let deadline = match timeout {
            Some(timeout) => nanos(self.epoch.elapsed())
                .saturating_add(nanos(timeout))
                .min(NO_DEADLINE - 1),
            None => NO_DEADLINE,
        };
        self.deadline.store(deadline, Ordering::SeqCst);
        self.tripped.store(NOT_TRIPPED, Ordering::SeqCst);
    }

    /// Stop timing; returns the reason if the evaluation was interrupted.
    pub fn disarm(&self) -> Option<InterruptReason> {
        self.deadline.store(NO_DEADLINE, Ordering::SeqCst);
        decode(self.tripped.swap(NOT_TRIPPED, Ordering::SeqCst))
    }

    /// Why the current evaluation was interrupted, without disarming
    pub fn tripped(&self) -> Option<InterruptReason> {
        decode(self.tripped.load(Ordering::SeqCst))
    }

    /// Polled by the engine; `true` aborts the script.
    pub fn should_interrupt(&self) -> bool {
        let tripped = if self.is_cancelled() {
            TRIPPED_CANCELLED
        } else {
            let deadline = self.deadline.load(Ordering::Relaxed);
            if deadline == NO_DEADLINE || nanos(self.epoch.elapsed()) < deadline {
                return false;
            }
            TRIPPED_TIMED_OUT
        };
        self.tripped.store(tripped, Ordering::SeqCst);
        true
    }

    /// Error reported for an interrupted evaluation.
    pub fn error(reason: InterruptReason, timeout: Option<Duration>) -> JsError {
        match reason {
            InterruptReason::Cancelled => JsError::Interrupted,
            InterruptReason::TimedOut => {
                JsError::TimedOut(timeout.map(|t| t.as_millis() as u64).unwrap_or_default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_idle() {
        let interrupt = Interrupt::new();
        interrupt.arm(None);
        assert!(!interrupt.should_interrupt());
        assert_eq!(interrupt.disarm(), None);
    }

    #[test]
    fn test_interrupt_deadline() {
        let interrupt = Interrupt::new();
        interrupt.arm(Some(Duration::ZERO));
        assert!(interrupt.should_interrupt());
        assert_eq!(interrupt.tripped(), Some(InterruptReason::TimedOut));
        assert_eq!(interrupt.disarm(), Some(InterruptReason::TimedOut));
        assert_eq!(interrupt.tripped(), None);

        // Disarmed flag no longer trips
        assert!(!interrupt.should_interrupt());
    }

    #[test]
    fn test_interrupt_far_deadline() {
        let interrupt = Interrupt::new();
        interrupt.arm(Some(Duration::from_secs(60)));
        assert!(!interrupt.should_interrupt());

        // Saturates instead of wrapping
        interrupt.arm(Some(Duration::MAX));
        assert!(!interrupt.should_interrupt());
        assert_eq!(interrupt.disarm(), None);
    }

    #[test]
    fn test_interrupt_cancel_wins() {
        let interrupt = Interrupt::new();
        interrupt.arm(Some(Duration::from_secs(60)));
        interrupt.cancel();
        assert!(interrupt.should_interrupt());
        assert_eq!(interrupt.disarm(), Some(InterruptReason::Cancelled));
    }

    #[test]
    fn test_timeout_error_message() {
        let err = Interrupt::error(InterruptReason::TimedOut, Some(Duration::from_millis(250)));
        assert_eq!(err.to_string(), "execution timed out after 250ms");
    }
}
