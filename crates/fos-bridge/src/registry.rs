//! Engine Registry
//!
//! Owns the id -> handle map and the backend's shared runtime. Every
//! mutation happens under one coordination mutex; the runtime is started on
//! the first create and shut down by `destroy_all`.

use crate::handle::{EngineHandle, HandleState};
use crate::pool::WorkerPool;
use crate::timers::TimerHandle;
use crate::BridgeError;
use fos_js::{EngineBackend, EngineId, EngineOptions, EngineRuntime};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct RegistryState {
    handles: HashMap<EngineId, Arc<EngineHandle>>,
    runtime: Option<Arc<dyn EngineRuntime>>,
}

pub struct Registry {
    backend: Arc<dyn EngineBackend>,
    pool: Arc<WorkerPool>,
    timers: TimerHandle,
    state: Mutex<RegistryState>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Registry")
            .field("backend", &self.backend.name())
            .field("engines", &state.handles.len())
            .field("runtime_started", &state.runtime.is_some())
            .finish()
    }
}

impl Registry {
    pub(crate) fn new(
        backend: Arc<dyn EngineBackend>,
        pool: Arc<WorkerPool>,
        timers: TimerHandle,
    ) -> Self {
        Self {
            backend,
            pool,
            timers,
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a ready handle under `id`; fails if `id` is live
    pub(crate) fn create(&self, id: EngineId) -> Result<Arc<EngineHandle>, BridgeError> {
        let mut state = self.lock();

        if state.handles.contains_key(&id) {
            return Err(BridgeError::DuplicateEngine(id));
        }

        let runtime = match &state.runtime {
            Some(runtime) => Arc::clone(runtime),
            None => {
                let runtime = self.backend.start()?;
                tracing::info!(backend = self.backend.name(), "Engine runtime started");
                state.runtime = Some(Arc::clone(&runtime));
                runtime
            }
        };

        let handle = Arc::new(EngineHandle::new(
            id,
            Arc::clone(&self.pool),
            self.timers.clone(),
        ));
        let engine = runtime.create_engine(EngineOptions::with_interrupt(
            id,
            Arc::clone(handle.interrupt()),
        ))?;
        handle.initialize(engine);
        debug_assert_eq!(handle.state(), HandleState::Ready);

        state.handles.insert(id, Arc::clone(&handle));
        tracing::debug!(engine_id = id, live = state.handles.len(), "Engine created");
        Ok(handle)
    }

    pub(crate) fn lookup(&self, id: EngineId) -> Result<Arc<EngineHandle>, BridgeError> {
        self.lock()
            .handles
            .get(&id)
            .cloned()
            .ok_or(BridgeError::EngineNotFound(id))
    }

    /// Remove and close `id`; `false` if it was not live
    pub fn destroy(&self, id: EngineId) -> bool {
        let removed = self.lock().handles.remove(&id);
        match removed {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Close every handle, then shut down the shared runtime
    pub fn destroy_all(&self) {
        let mut state = self.lock();

        let handles: Vec<_> = state.handles.drain().map(|(_, handle)| handle).collect();
        for handle in &handles {
            handle.close();
        }

        if let Some(runtime) = state.runtime.take() {
            runtime.shutdown();
        }
        tracing::info!(closed = handles.len(), "All engines destroyed");
    }

    /// Interrupt every running script
    pub(crate) fn interrupt_all(&self) {
        for handle in self.lock().handles.values() {
            handle.interrupt().cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lifecycle state of a live engine
    pub fn state(&self, id: EngineId) -> Option<HandleState> {
        self.lock().handles.get(&id).map(|handle| handle.state())
    }

    pub fn contains(&self, id: EngineId) -> bool {
        self.lock().handles.contains_key(&id)
    }

    /// Live engine ids, sorted
    pub fn ids(&self) -> Vec<EngineId> {
        let mut ids: Vec<_> = self.lock().handles.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[cfg(test)]
    pub(crate) fn runtime_started(&self) -> bool {
        self.lock().runtime.is_some()
    }
}
