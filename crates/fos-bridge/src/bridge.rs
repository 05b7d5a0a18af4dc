//! Call Bridge
//!
//! Routes host requests to engine handles. Engine work runs on the worker
//! pool through each handle's serial queue; outcomes and channel relays are
//! handed back on the delivery thread.

use crate::channel::{Acknowledger, ChannelCall, HostRelay, HostSink, LogRelay, Relay, EXPIRED_CALL};
use crate::delivery::{completion, Completion, DeliveryContext, DeliveryHandle, Responder};
use crate::handle::{job, EngineHandle, JobFn};
use crate::pool::WorkerPool;
use crate::protocol::{Request, Response};
use crate::registry::Registry;
use crate::timers::TimerThread;
use crate::{BridgeConfig, BridgeError};
use fos_js::{
    CallId, CallOutcome, ChannelHook, EngineBackend, EngineId, HookOutcome, QuickJsBackend,
    ScriptValue,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Engine registry plus asynchronous call bridge.
///
/// Every operation returns a [`Completion`] that is filled on the delivery
/// thread. Dropping the bridge interrupts running scripts, closes every
/// engine and stops its threads.
pub struct Bridge {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("registry", &self.inner.registry)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

impl Bridge {
    /// Bridge over any engine backend
    pub fn new(config: BridgeConfig, backend: Arc<dyn EngineBackend>) -> Result<Self, BridgeError> {
        Self::build(config, backend, None)
    }

    /// Bridge whose wire-registered channels forward to `sink`
    pub fn with_host(
        config: BridgeConfig,
        backend: Arc<dyn EngineBackend>,
        sink: Arc<dyn HostSink>,
    ) -> Result<Self, BridgeError> {
        Self::build(config, backend, Some(sink))
    }

    /// Bridge over QuickJS configured from `config.engine`
    pub fn quickjs(config: BridgeConfig) -> Result<Self, BridgeError> {
        let backend = Arc::new(QuickJsBackend::new(config.engine.clone()));
        Self::new(config, backend)
    }

    fn build(
        config: BridgeConfig,
        backend: Arc<dyn EngineBackend>,
        host: Option<Arc<dyn HostSink>>,
    ) -> Result<Self, BridgeError> {
        let pool = WorkerPool::new(config.workers)
            .map_err(|e| BridgeError::Engine(format!("failed to start worker pool: {}", e)))?;
        let delivery = DeliveryContext::start()
            .map_err(|e| BridgeError::Engine(format!("failed to start delivery thread: {}", e)))?;
        let timers = TimerThread::start()
            .map_err(|e| BridgeError::Engine(format!("failed to start timer thread: {}", e)))?;
        let pool = Arc::new(pool);

        tracing::info!(
            backend = backend.name(),
            workers = pool.worker_count(),
            "Script bridge started"
        );

        let inner = Arc::new_cyclic(|weak| Inner {
            registry: Registry::new(backend, Arc::clone(&pool), timers.handle()),
            delivery_handle: delivery.handle(),
            delivery,
            timers,
            pool,
            next_call_id: Arc::new(AtomicU64::new(1)),
            host,
            weak: weak.clone(),
        });

        Ok(Self { inner })
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Create an engine under a caller-chosen id
    pub fn create_engine(&self, id: EngineId) -> Completion<EngineId> {
        let (responder, completion) = completion(&self.inner.delivery_handle);
        self.inner.create_engine(id, responder);
        completion
    }

    /// Evaluate `script` and return its final value
    pub fn evaluate(&self, id: EngineId, script: impl Into<String>) -> Completion<ScriptValue> {
        let (responder, completion) = completion(&self.inner.delivery_handle);
        self.inner.evaluate(id, script.into(), responder);
        completion
    }

    /// Register (or replace) the relay behind a channel name
    pub fn register_channel<R: Relay>(
        &self,
        id: EngineId,
        channel: impl Into<String>,
        relay: R,
    ) -> Completion<()> {
        let (responder, completion) = completion(&self.inner.delivery_handle);
        self.inner
            .register_channel(id, channel.into(), Arc::new(relay), responder);
        completion
    }

    /// Settle the promise a script got from `sendMessage`
    pub fn acknowledge(&self, id: EngineId, call_id: CallId, outcome: CallOutcome) -> Completion<()> {
        self.inner.acknowledge(id, call_id, outcome)
    }

    /// Close one engine; closing an unknown id succeeds
    pub fn close(&self, id: EngineId) -> Completion<()> {
        let (responder, completion) = completion(&self.inner.delivery_handle);
        self.inner.close(id, responder);
        completion
    }

    /// Close every engine and release the shared runtime
    pub fn teardown(&self) -> Completion<()> {
        let (responder, completion) = completion(&self.inner.delivery_handle);
        self.inner.teardown(responder);
        completion
    }

    /// Run a wire request; `callback` gets the outcome on the delivery thread
    pub fn dispatch<F>(&self, request: Request, callback: F)
    where
        F: FnOnce(Result<Response, BridgeError>) + Send + 'static,
    {
        let inner = &self.inner;
        let delivery = inner.delivery_handle.clone();
        tracing::trace!(method = request.method(), engine_id = ?request.engine_id(), "Dispatch");

        match request {
            Request::CreateEngine { engine_id } => inner.create_engine(
                engine_id,
                Responder::new(delivery, move |r| callback(r.map(Response::EngineId))),
            ),
            Request::Evaluate { engine_id, script } => inner.evaluate(
                engine_id,
                script,
                Responder::new(delivery, move |r| callback(r.map(Response::Value))),
            ),
            Request::RegisterChannel {
                engine_id,
                channel,
                acknowledge,
            } => {
                let relay: Arc<dyn Relay> = match &inner.host {
                    Some(sink) if acknowledge => Arc::new(HostRelay::acknowledged(Arc::clone(sink))),
                    Some(sink) => Arc::new(HostRelay::new(Arc::clone(sink))),
                    None => Arc::new(LogRelay),
                };
                inner.register_channel(
                    engine_id,
                    channel,
                    relay,
                    Responder::new(delivery, move |r| callback(r.map(|()| Response::Done))),
                )
            }
            Request::Acknowledge {
                engine_id,
                call_id,
                outcome,
            } => inner.settle(
                engine_id,
                call_id,
                outcome,
                Responder::new(delivery, move |r| callback(r.map(|()| Response::Done))),
            ),
            Request::Close { engine_id } => inner.close(
                engine_id,
                Responder::new(delivery, move |r| callback(r.map(|()| Response::Done))),
            ),
            Request::Teardown => inner.teardown(Responder::new(delivery, move |r| {
                callback(r.map(|()| Response::Done))
            })),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

pub(crate) struct Inner {
    registry: Registry,
    pool: Arc<WorkerPool>,
    delivery: DeliveryContext,
    delivery_handle: DeliveryHandle,
    timers: TimerThread,
    /// Shared by every engine so call ids are unique bridge-wide
    next_call_id: Arc<AtomicU64>,
    host: Option<Arc<dyn HostSink>>,
    weak: Weak<Inner>,
}

impl Inner {
    fn create_engine(&self, id: EngineId, responder: Responder<EngineId>) {
        responder.complete(self.registry.create(id).map(|handle| handle.id()));
    }

    fn evaluate(&self, id: EngineId, script: String, responder: Responder<ScriptValue>) {
        let handle = match self.registry.lookup(id) {
            Ok(handle) => handle,
            Err(e) => return responder.complete(Err(e)),
        };

        handle.submit(job(move |engine| {
            let result = engine.and_then(|engine| {
                engine.evaluate(&script).map_err(|e| {
                    tracing::debug!(engine_id = id, error = %e, "Evaluation failed");
                    BridgeError::evaluation(id, e)
                })
            });
            responder.complete(result);
        }));
    }

    fn register_channel(
        &self,
        id: EngineId,
        channel: String,
        relay: Arc<dyn Relay>,
        responder: Responder<()>,
    ) {
        let handle = match self.registry.lookup(id) {
            Ok(handle) => handle,
            Err(e) => return responder.complete(Err(e)),
        };

        tracing::debug!(engine_id = id, channel = %channel, "Channel registered");
        handle.channels().register(channel, relay);

        if !handle.claim_hook_install() {
            return responder.complete(Ok(()));
        }

        let hook = self.channel_hook(&handle);
        handle.submit(job(move |engine| {
            let result = engine.and_then(|engine| engine.install_channel_hook(hook).map_err(BridgeError::from));
            responder.complete(result);
        }));
    }

    /// Native callback behind `sendMessage` for one engine
    fn channel_hook(&self, handle: &Arc<EngineHandle>) -> ChannelHook {
        let engine_id = handle.id();
        let engine = Arc::downgrade(handle);
        let channels = Arc::clone(handle.channels());
        let next_call_id = Arc::clone(&self.next_call_id);
        let delivery = self.delivery_handle.clone();
        let bridge = self.weak.clone();

        Arc::new(move |channel: &str, message: &str| {
            let relay = match channels.relay_for(engine_id, channel) {
                Ok(relay) => relay,
                Err(e) => {
                    tracing::warn!(engine_id, channel, "{}", e);
                    return HookOutcome::NotRegistered;
                }
            };

            let call_id = next_call_id.fetch_add(1, Ordering::Relaxed);
            let acknowledged = relay.acknowledges();
            if acknowledged {
                if let Some(expired) = channels.add_pending(call_id) {
                    tracing::warn!(
                        engine_id,
                        call_id = expired,
                        "Too many unacknowledged calls; rejecting the oldest"
                    );
                    if let Some(handle) = engine.upgrade() {
                        handle.submit(expire_job(engine_id, expired));
                    }
                }
            }

            let call = ChannelCall {
                engine_id,
                call_id,
                channel: channel.to_string(),
                message: message.to_string(),
            };
            let ack = Acknowledger::new(engine_id, call_id, bridge.clone());
            delivery.post(move || relay.relay(call, ack));

            tracing::trace!(engine_id, call_id, channel, acknowledged, "Channel call queued");
            if acknowledged {
                HookOutcome::Queued(call_id)
            } else {
                HookOutcome::Delivered
            }
        })
    }

    pub(crate) fn acknowledge(&self, id: EngineId, call_id: CallId, outcome: CallOutcome) -> Completion<()> {
        let (responder, completion) = completion(&self.delivery_handle);
        self.settle(id, call_id, outcome, responder);
        completion
    }

    fn settle(&self, id: EngineId, call_id: CallId, outcome: CallOutcome, responder: Responder<()>) {
        let handle = match self.registry.lookup(id) {
            Ok(handle) => handle,
            Err(e) => return responder.complete(Err(e)),
        };

        if !handle.channels().take_pending(call_id) {
            return responder.complete(Err(BridgeError::UnknownCall {
                engine_id: id,
                call_id,
            }));
        }

        handle.submit(job(move |engine| {
            let result = engine.and_then(|engine| match engine.settle_call(call_id, &outcome) {
                Ok(true) => Ok(()),
                Ok(false) => Err(BridgeError::UnknownCall {
                    engine_id: id,
                    call_id,
                }),
                Err(e) => Err(BridgeError::from(e)),
            });
            responder.complete(result);
        }));
    }

    fn close(&self, id: EngineId, responder: Responder<()>) {
        if !self.registry.destroy(id) {
            tracing::debug!(engine_id = id, "Close of unknown engine ignored");
        }
        responder.complete(Ok(()));
    }

    fn teardown(&self, responder: Responder<()>) {
        self.registry.destroy_all();
        responder.complete(Ok(()));
    }

    fn shutdown(&self) {
        self.registry.interrupt_all();
        self.registry.destroy_all();
        self.timers.shutdown();
        self.pool.shutdown();
        self.delivery.shutdown();
        tracing::info!("Script bridge stopped");
    }
}

/// Reject an evicted call's promise inside the script
fn expire_job(engine_id: EngineId, call_id: CallId) -> JobFn {
    job(move |engine| {
        let Ok(engine) = engine else {
            return;
        };
        if let Err(e) = engine.settle_call(call_id, &CallOutcome::Rejected(EXPIRED_CALL.to_string())) {
            tracing::debug!(engine_id, call_id, error = %e, "Failed to expire call");
        }
    })
}
