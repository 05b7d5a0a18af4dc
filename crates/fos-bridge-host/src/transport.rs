//! Line Transport
//!
//! One JSON request per input line, one JSON reply or event per output line.

use anyhow::Context;
use fos_bridge::{Bridge, BridgeError, ChannelCall, Failure, HostSink, Request, Response};
use serde::Serialize;
use serde_json::Value;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};

/// Reply to one request
#[derive(Debug, Serialize)]
pub struct Reply {
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Response>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

impl Reply {
    pub fn new(id: u64, outcome: Result<Response, BridgeError>) -> Self {
        match outcome {
            Ok(result) => Self {
                id: Some(id),
                result: Some(result),
                error: None,
            },
            Err(error) => Self::failure(Some(id), Failure::from(&error)),
        }
    }

    pub fn failure(id: Option<u64>, failure: Failure) -> Self {
        Self {
            id,
            result: None,
            error: Some(failure),
        }
    }
}

/// Script-to-host channel call pushed to the host
#[derive(Debug, Serialize)]
struct Event<'a> {
    event: &'static str,
    #[serde(flatten)]
    call: &'a ChannelCall,
}

/// Input line that is not a valid request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadRequest {
    pub id: Option<u64>,
    pub message: String,
}

impl BadRequest {
    pub fn reply(&self) -> Reply {
        Reply::failure(self.id, Failure::new("BadRequest", self.message.clone()))
    }
}

/// Parse `{"id": n, "method": ..., ...}`
pub fn parse_line(line: &str) -> Result<(u64, Request), BadRequest> {
    let value: Value = serde_json::from_str(line).map_err(|e| BadRequest {
        id: None,
        message: format!("invalid JSON: {}", e),
    })?;

    let id = value.get("id").and_then(Value::as_u64);
    let Some(id) = id else {
        return Err(BadRequest {
            id: None,
            message: "missing numeric \"id\"".to_string(),
        });
    };

    let request = serde_json::from_value(value).map_err(|e| BadRequest {
        id: Some(id),
        message: e.to_string(),
    })?;
    Ok((id, request))
}

/// Serialized, line-at-a-time output shared by replies and events
pub struct LineWriter<W> {
    out: Mutex<W>,
}

impl<W: Write> LineWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn write<T: Serialize>(&self, message: &T) {
        let line = match serde_json::to_string(message) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode output line");
                return;
            }
        };

        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            tracing::error!(error = %e, "Failed to write output line");
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send + 'static> HostSink for LineWriter<W> {
    fn send_message(&self, call: ChannelCall) {
        self.write(&Event {
            event: "sendMessage",
            call: &call,
        });
    }
}

/// Dispatch every input line until EOF
pub fn serve<R, W>(bridge: &Bridge, input: R, output: &Arc<LineWriter<W>>) -> anyhow::Result<usize>
where
    R: BufRead,
    W: Write + Send + 'static,
{
    let mut handled = 0;

    for line in input.lines() {
        let line = line.context("failed to read request line")?;
        if line.trim().is_empty() {
            continue;
        }
        handled += 1;

        match parse_line(&line) {
            Ok((id, request)) => {
                tracing::debug!(id, method = request.method(), "Request");
                let output = Arc::clone(output);
                bridge.dispatch(request, move |outcome| output.write(&Reply::new(id, outcome)));
            }
            Err(bad) => {
                tracing::warn!(id = ?bad.id, "Bad request: {}", bad.message);
                output.write(&bad.reply());
            }
        }
    }

    Ok(handled)
}
