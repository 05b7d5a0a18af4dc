//! fOS Script Bridge
//!
//! Keeps several independent script engines alive in one process, routes
//! host requests to them by integer id and relays messages scripts send
//! through named channels back to the host.
//!
//! Features:
//! - Engine registry with lazy shared-runtime startup and full teardown
//! - Bounded worker pool; per-engine serial job queues
//! - Single delivery thread for every completion and channel relay
//! - Optional host acknowledgement of script-to-host calls
//! - Timer thread waking engines whose setTimeout/setInterval callbacks are due
//! - Serde wire protocol for out-of-process hosts

mod bridge;
mod channel;
mod config;
mod delivery;
mod error;
mod handle;
mod pool;
mod protocol;
mod registry;
mod timers;

pub use bridge::Bridge;
pub use channel::{Acknowledger, ChannelCall, HostRelay, HostSink, Relay};
pub use config::BridgeConfig;
pub use delivery::Completion;
pub use error::BridgeError;
pub use handle::HandleState;
pub use pool::WorkerPool;
pub use protocol::{Failure, Request, Response};
pub use registry::Registry;

pub use fos_js::{CallId, CallOutcome, EngineId, ScriptValue};
