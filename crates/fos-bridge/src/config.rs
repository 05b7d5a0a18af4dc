//! Bridge Configuration

use fos_js::EngineConfig;
use std::str::FromStr;
use std::time::Duration;

/// Bridge configuration options
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Worker threads running engine jobs
    pub workers: usize,

    /// Configuration every engine is created with
    pub engine: EngineConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            engine: EngineConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Defaults overridden by `FOS_BRIDGE_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(workers) = parse_var::<usize>(&lookup, "FOS_BRIDGE_WORKERS") {
            config.workers = workers.max(1);
        }
        if let Some(limit) = parse_var(&lookup, "FOS_BRIDGE_MEMORY_LIMIT") {
            config.engine.memory_limit = limit;
        }
        if let Some(stack) = parse_var(&lookup, "FOS_BRIDGE_MAX_STACK") {
            config.engine.max_stack_size = stack;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FOS_BRIDGE_EVAL_TIMEOUT_MS") {
            // 0 disables the timeout
            config.engine.eval_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .max(2)
}
