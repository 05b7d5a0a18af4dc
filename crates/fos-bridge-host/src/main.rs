//! fOS Bridge Host - Main Entry Point
//!
//! Reads JSON requests from stdin, writes replies and channel events to
//! stdout. Logs go to stderr so stdout stays a clean protocol stream.

mod transport;

use anyhow::Context;
use fos_bridge::{Bridge, BridgeConfig};
use fos_js::QuickJsBackend;
use std::io;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use transport::LineWriter;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let config = BridgeConfig::from_env();
    tracing::info!(
        workers = config.workers,
        memory_limit = config.engine.memory_limit,
        eval_timeout_ms = config.engine.eval_timeout.map(|t| t.as_millis() as u64),
        "Starting fOS bridge host..."
    );

    let output = Arc::new(LineWriter::new(io::stdout()));
    let backend = Arc::new(QuickJsBackend::new(config.engine.clone()));
    let bridge = Bridge::with_host(config, backend, output.clone())
        .context("failed to start script bridge")?;

    let handled = transport::serve(&bridge, io::stdin().lock(), &output)?;

    // EOF: close every engine before the bridge stops its threads
    bridge.teardown().wait().context("teardown failed")?;
    drop(bridge);

    tracing::info!(requests = handled, "Input closed, exiting");
    Ok(())
}
