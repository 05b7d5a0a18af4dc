//! Bridge errors

use fos_js::{CallId, EngineId, JsError};

/// Failure of one bridge operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("engine {0} was not found")]
    EngineNotFound(EngineId),

    #[error("engine {0} already exists")]
    DuplicateEngine(EngineId),

    #[error("script evaluation failed in engine {engine_id}: {message}")]
    ScriptEvaluation {
        engine_id: EngineId,
        message: String,
        line: Option<u32>,
        column: Option<u32>,
    },

    #[error("channel '{channel}' is not registered on engine {engine_id}")]
    ChannelNotRegistered { engine_id: EngineId, channel: String },

    #[error("engine {engine_id} has no pending call {call_id}")]
    UnknownCall { engine_id: EngineId, call_id: CallId },

    #[error("engine error: {0}")]
    Engine(String),

    #[error("operation was dropped before completion")]
    Cancelled,
}

impl BridgeError {
    /// Stable code sent to the host
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::EngineNotFound(_) => "EngineNotFound",
            BridgeError::DuplicateEngine(_) => "DuplicateEngine",
            BridgeError::ScriptEvaluation { .. } => "ScriptEvaluationError",
            BridgeError::ChannelNotRegistered { .. } => "ChannelNotRegistered",
            BridgeError::UnknownCall { .. } => "UnknownCall",
            BridgeError::Engine(_) => "EngineError",
            BridgeError::Cancelled => "Cancelled",
        }
    }

    /// Wrap an engine failure raised while evaluating a script
    pub fn evaluation(engine_id: EngineId, error: JsError) -> Self {
        let (line, column) = error
            .exception()
            .map(|e| (e.line, e.column))
            .unwrap_or_default();
        BridgeError::ScriptEvaluation {
            engine_id,
            message: error.to_string(),
            line,
            column,
        }
    }
}

impl From<JsError> for BridgeError {
    fn from(e: JsError) -> Self {
        BridgeError::Engine(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fos_js::ScriptException;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(BridgeError::EngineNotFound(1).code(), "EngineNotFound");
        assert_eq!(BridgeError::DuplicateEngine(1).code(), "DuplicateEngine");
        assert_eq!(BridgeError::Cancelled.code(), "Cancelled");
    }

    #[test]
    fn test_evaluation_keeps_position() {
        let err = BridgeError::evaluation(
            3,
            JsError::Exception(ScriptException {
                name: Some("Error".into()),
                message: "x".into(),
                line: Some(2),
                column: Some(5),
                ..Default::default()
            }),
        );
        assert_eq!(err.code(), "ScriptEvaluationError");
        match err {
            BridgeError::ScriptEvaluation { message, line, column, .. } => {
                assert!(message.contains('x'));
                assert_eq!((line, column), (Some(2), Some(5)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_timeout_is_an_evaluation_error() {
        let err = BridgeError::evaluation(1, JsError::TimedOut(10));
        assert_eq!(err.to_string(), "script evaluation failed in engine 1: execution timed out after 10ms");
    }
}
