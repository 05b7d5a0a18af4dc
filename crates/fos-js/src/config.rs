//! Engine Configuration

use std::time::Duration;

/// Per-engine configuration options
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Memory limit per engine runtime (bytes)
    pub memory_limit: usize,

    /// Maximum native stack size per engine runtime (bytes)
    pub max_stack_size: usize,

    /// Allocation threshold that triggers GC; `None` keeps the engine default
    pub gc_threshold: Option<usize>,

    /// Abort evaluations that run longer than this; `None` means unbounded
    pub eval_timeout: Option<Duration>,

    /// Install the console API
    pub console: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024, // 64MB
            max_stack_size: 1024 * 1024,    // 1MB
            gc_threshold: None,
            eval_timeout: None,
            console: true,
        }
    }
}

impl EngineConfig {
    pub fn with_eval_timeout(mut self, timeout: Duration) -> Self {
        self.eval_timeout = Some(timeout);
        self
    }
}
