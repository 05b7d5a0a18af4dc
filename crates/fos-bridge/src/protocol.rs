//! Wire Protocol
//!
//! Serde types for requests a host sends and the replies it gets back.

use crate::BridgeError;
use fos_js::{CallId, CallOutcome, EngineId, ScriptValue};
use serde::{Deserialize, Serialize};

/// Host request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    CreateEngine {
        engine_id: EngineId,
    },
    Evaluate {
        engine_id: EngineId,
        script: String,
    },
    RegisterChannel {
        engine_id: EngineId,
        channel: String,
        /// `true` if the host will `acknowledge` calls on this channel;
        /// otherwise they are fire-and-forget
        #[serde(default)]
        acknowledge: bool,
    },
    Acknowledge {
        engine_id: EngineId,
        call_id: CallId,
        outcome: CallOutcome,
    },
    Close {
        engine_id: EngineId,
    },
    Teardown,
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::CreateEngine { .. } => "createEngine",
            Request::Evaluate { .. } => "evaluate",
            Request::RegisterChannel { .. } => "registerChannel",
            Request::Acknowledge { .. } => "acknowledge",
            Request::Close { .. } => "close",
            Request::Teardown => "teardown",
        }
    }

    pub fn engine_id(&self) -> Option<EngineId> {
        match self {
            Request::CreateEngine { engine_id }
            | Request::Evaluate { engine_id, .. }
            | Request::RegisterChannel { engine_id, .. }
            | Request::Acknowledge { engine_id, .. }
            | Request::Close { engine_id } => Some(*engine_id),
            Request::Teardown => None,
        }
    }
}

/// Successful reply; serializes to the bare result value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    /// Id of a created engine
    EngineId(EngineId),
    /// Evaluation result
    Value(ScriptValue),
    /// Acknowledgement with no payload (`null`)
    Done,
}

/// Failed reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl Failure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            line: None,
            column: None,
        }
    }
}

impl From<&BridgeError> for Failure {
    fn from(error: &BridgeError) -> Self {
        let mut failure = Failure::new(error.code(), error.to_string());
        if let BridgeError::ScriptEvaluation {
            message,
            line,
            column,
            ..
        } = error
        {
            failure.message = message.clone();
            failure.line = *line;
            failure.column = *column;
        }
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_evaluate() {
        let request: Request = serde_json::from_value(json!({
            "method": "evaluate",
            "engineId": 4,
            "script": "1 + 1"
        }))
        .unwrap();
        assert_eq!(
            request,
            Request::Evaluate {
                engine_id: 4,
                script: "1 + 1".into()
            }
        );
        assert_eq!(request.method(), "evaluate");
    }

    #[test]
    fn test_parse_acknowledge() {
        let request: Request = serde_json::from_value(json!({
            "method": "acknowledge",
            "engineId": 1,
            "callId": 3,
            "outcome": {"status": "rejected", "value": "nope"}
        }))
        .unwrap();
        assert_eq!(request.engine_id(), Some(1));
        match request {
            Request::Acknowledge { call_id, outcome, .. } => {
                assert_eq!(call_id, 3);
                assert_eq!(outcome, CallOutcome::Rejected("nope".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_register_channel_defaults_to_fire_and_forget() {
        let request: Request = serde_json::from_value(json!({
            "method": "registerChannel",
            "engineId": 2,
            "channel": "log"
        }))
        .unwrap();
        assert_eq!(
            request,
            Request::RegisterChannel {
                engine_id: 2,
                channel: "log".into(),
                acknowledge: false
            }
        );

        let request: Request = serde_json::from_value(json!({
            "method": "registerChannel",
            "engineId": 2,
            "channel": "ask",
            "acknowledge": true
        }))
        .unwrap();
        assert!(matches!(request, Request::RegisterChannel { acknowledge: true, .. }));
    }

    #[test]
    fn test_unknown_method_rejected() {
        let result = serde_json::from_value::<Request>(json!({"method": "reboot"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_response_shapes() {
        assert_eq!(serde_json::to_value(Response::Done).unwrap(), json!(null));
        assert_eq!(serde_json::to_value(Response::EngineId(7)).unwrap(), json!(7));
        assert_eq!(
            serde_json::to_value(Response::Value(ScriptValue::Number(2.0))).unwrap(),
            json!({"type": "number", "value": 2.0})
        );
    }

    #[test]
    fn test_failure_from_evaluation_error() {
        let failure = Failure::from(&BridgeError::ScriptEvaluation {
            engine_id: 1,
            message: "Error: x".into(),
            line: Some(1),
            column: None,
        });
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json, json!({"code": "ScriptEvaluationError", "message": "Error: x", "line": 1}));
    }
}
