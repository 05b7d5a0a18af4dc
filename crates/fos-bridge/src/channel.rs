//! Channels
//!
//! Named relay paths from script to host. A script calls
//! `sendMessage(channel, message)`; the bridge allocates a call id, records
//! it as pending and hands a [`ChannelCall`] to the channel's [`Relay`] on
//! the delivery thread.

use crate::bridge::Inner;
use crate::{BridgeError, Completion};
use fos_js::{CallId, CallOutcome, EngineId};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

/// One message a script sent through a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCall {
    pub engine_id: EngineId,
    pub call_id: CallId,
    pub channel: String,
    pub message: String,
}

/// Calls a script may leave unacknowledged before the oldest is rejected
pub const MAX_PENDING_CALLS: usize = 4096;

/// Reason given to a script whose call was evicted from the pending table
pub(crate) const EXPIRED_CALL: &str = "call expired without acknowledgement";

/// Host-side receiver for one channel
pub trait Relay: Send + Sync + 'static {
    fn relay(&self, call: ChannelCall, ack: Acknowledger);

    /// Whether this relay settles calls through its [`Acknowledger`].
    ///
    /// Calls to a relay that does not are never recorded as pending and the
    /// script's promise resolves to `null` at once.
    fn acknowledges(&self) -> bool {
        true
    }
}

impl<F> Relay for F
where
    F: Fn(ChannelCall, Acknowledger) + Send + Sync + 'static,
{
    fn relay(&self, call: ChannelCall, ack: Acknowledger) {
        self(call, ack)
    }
}

/// Host transport that receives every channel call of every engine
pub trait HostSink: Send + Sync + 'static {
    fn send_message(&self, call: ChannelCall);
}

/// Relay forwarding to a [`HostSink`]; the host acknowledges by request
pub struct HostRelay {
    sink: Arc<dyn HostSink>,
    acknowledges: bool,
}

impl HostRelay {
    /// Fire-and-forget forwarding
    pub fn new(sink: Arc<dyn HostSink>) -> Self {
        Self {
            sink,
            acknowledges: false,
        }
    }

    /// Forwarding whose calls stay pending until the host acknowledges them
    pub fn acknowledged(sink: Arc<dyn HostSink>) -> Self {
        Self {
            sink,
            acknowledges: true,
        }
    }
}

impl Relay for HostRelay {
    fn relay(&self, call: ChannelCall, _ack: Acknowledger) {
        self.sink.send_message(call);
    }

    fn acknowledges(&self) -> bool {
        self.acknowledges
    }
}

/// Relay used when no host sink is attached
pub(crate) struct LogRelay;

impl Relay for LogRelay {
    fn relay(&self, call: ChannelCall, _ack: Acknowledger) {
        tracing::info!(
            engine_id = call.engine_id,
            call_id = call.call_id,
            channel = %call.channel,
            "[JS] {}",
            call.message
        );
    }

    fn acknowledges(&self) -> bool {
        false
    }
}

/// Answers one pending call.
///
/// Acknowledging is optional: a call nobody answers leaves the script's
/// promise pending until [`MAX_PENDING_CALLS`] newer calls push it out. Relays run on the delivery thread, so they must not
/// block on the returned completion.
#[derive(Clone)]
pub struct Acknowledger {
    engine_id: EngineId,
    call_id: CallId,
    bridge: Weak<Inner>,
}

impl std::fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acknowledger")
            .field("engine_id", &self.engine_id)
            .field("call_id", &self.call_id)
            .finish()
    }
}

impl Acknowledger {
    pub(crate) fn new(engine_id: EngineId, call_id: CallId, bridge: Weak<Inner>) -> Self {
        Self {
            engine_id,
            call_id,
            bridge,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Resolve the script's promise with `value`
    pub fn resolve(&self, value: impl Into<String>) -> Completion<()> {
        self.settle(CallOutcome::Resolved(value.into()))
    }

    /// Reject the script's promise with `Error(reason)`
    pub fn reject(&self, reason: impl Into<String>) -> Completion<()> {
        self.settle(CallOutcome::Rejected(reason.into()))
    }

    pub fn settle(&self, outcome: CallOutcome) -> Completion<()> {
        match self.bridge.upgrade() {
            Some(bridge) => bridge.acknowledge(self.engine_id, self.call_id, outcome),
            None => Completion::ready(Err(BridgeError::Cancelled)),
        }
    }
}

/// Channel registrations and pending calls of one engine
pub(crate) struct ChannelTable {
    relays: RwLock<HashMap<String, Arc<dyn Relay>>>,
    /// Call ids grow monotonically, so the first entry is the oldest
    pending: Mutex<BTreeSet<CallId>>,
    pending_limit: usize,
    detached: AtomicBool,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::with_pending_limit(MAX_PENDING_CALLS)
    }
}

impl ChannelTable {
    pub(crate) fn with_pending_limit(pending_limit: usize) -> Self {
        Self {
            relays: RwLock::default(),
            pending: Mutex::default(),
            pending_limit: pending_limit.max(1),
            detached: AtomicBool::new(false),
        }
    }

    /// Install or overwrite the relay for `name`
    pub(crate) fn register(&self, name: String, relay: Arc<dyn Relay>) {
        self.relays
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, relay);
    }

    pub(crate) fn relay_for(&self, engine_id: EngineId, channel: &str) -> Result<Arc<dyn Relay>, BridgeError> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(BridgeError::ChannelNotRegistered {
                engine_id,
                channel: channel.to_string(),
            });
        }

        self.relays
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
            .ok_or_else(|| BridgeError::ChannelNotRegistered {
                engine_id,
                channel: channel.to_string(),
            })
    }

    /// Record a pending call; returns the oldest call evicted to make room
    pub(crate) fn add_pending(&self, call_id: CallId) -> Option<CallId> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.insert(call_id);
        if pending.len() > self.pending_limit {
            pending.pop_first()
        } else {
            None
        }
    }

    /// Remove a pending call; `false` if it was unknown or already settled
    pub(crate) fn take_pending(&self, call_id: CallId) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&call_id)
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drop every relay and pending call; later sends see no channels
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.relays.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn Relay> {
        Arc::new(|_: ChannelCall, _: Acknowledger| {})
    }

    #[test]
    fn test_unregistered_channel() {
        let table = ChannelTable::default();
        let err = table.relay_for(1, "missing").err().unwrap();
        assert_eq!(err.code(), "ChannelNotRegistered");
    }

    #[test]
    fn test_register_overwrites() {
        let table = ChannelTable::default();
        table.register("log".into(), noop());
        table.register("log".into(), noop());
        assert!(table.relay_for(1, "log").is_ok());
        assert_eq!(table.relays.read().unwrap().len(), 1);
    }

    #[test]
    fn test_pending_taken_once() {
        let table = ChannelTable::default();
        table.add_pending(9);
        assert!(table.take_pending(9));
        assert!(!table.take_pending(9));
    }

    #[test]
    fn test_pending_limit_evicts_oldest() {
        let table = ChannelTable::with_pending_limit(2);
        assert_eq!(table.add_pending(1), None);
        assert_eq!(table.add_pending(2), None);
        assert_eq!(table.add_pending(3), Some(1));
        assert_eq!(table.pending_count(), 2);

        assert!(!table.take_pending(1));
        assert!(table.take_pending(3));
    }

    #[test]
    fn test_relay_acknowledgement_modes() {
        struct Quiet;
        impl HostSink for Quiet {
            fn send_message(&self, _call: ChannelCall) {}
        }

        assert!(noop().acknowledges());
        assert!(!LogRelay.acknowledges());
        assert!(!HostRelay::new(Arc::new(Quiet)).acknowledges());
        assert!(HostRelay::acknowledged(Arc::new(Quiet)).acknowledges());
    }

    #[test]
    fn test_detach_clears_everything() {
        let table = ChannelTable::default();
        table.register("log".into(), noop());
        table.add_pending(1);

        table.detach();
        assert!(table.relay_for(1, "log").is_err());
        assert_eq!(table.pending_count(), 0);

        // Late registrations stay invisible
        table.register("log".into(), noop());
        assert!(table.relay_for(1, "log").is_err());
    }

    #[test]
    fn test_acknowledger_without_bridge() {
        let ack = Acknowledger::new(1, 2, Weak::new());
        assert_eq!(ack.resolve("ok").wait(), Err(BridgeError::Cancelled));
    }

    #[test]
    fn test_channel_call_wire_shape() {
        let call = ChannelCall {
            engine_id: 1,
            call_id: 4,
            channel: "log".into(),
            message: "hi".into(),
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["engineId"], 1);
        assert_eq!(json["callId"], 4);
    }
}
