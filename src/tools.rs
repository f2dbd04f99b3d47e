use crate::error::ToolError;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// A function surfaced to the model at session setup.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema for the call arguments.
    pub parameters: Value,
}

/// A tool invocation requested by the model mid-conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// The external command executor. Implemented by the embedding application;
/// invoked synchronously, once per request.
pub trait ToolExecutor: Send + Sync {
    fn execute(&self, name: &str, args: &Value) -> Result<Value, ToolError>;
}

/// Builds exactly one response payload per request. An unanswered tool call
/// would stall the remote session's turn, so failures are converted into an
/// error descriptor rather than dropped.
pub struct ToolCallBridge {
    executor: Arc<dyn ToolExecutor>,
}

impl ToolCallBridge {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }

    pub fn respond(&self, request: &ToolCallRequest) -> Value {
        match self.executor.execute(&request.name, &request.args) {
            Ok(result) => json!({ "output": result }),
            Err(err) => {
                log::warn!(
                    "[tools] call '{}' (id={}) failed: {}",
                    request.name,
                    request.id,
                    err
                );
                json!({ "error": err.to_string() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubExecutor;

    impl ToolExecutor for StubExecutor {
        fn execute(&self, name: &str, args: &Value) -> Result<Value, ToolError> {
            match name {
                "echo" => Ok(json!({ "echoed": args.clone() })),
                "broken" => Err(ToolError::ExecutionFailed("boom".into())),
                other => Err(ToolError::UnknownTool(other.into())),
            }
        }
    }

    fn request(name: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: "call-1".into(),
            name: name.into(),
            args: json!({ "k": "v" }),
        }
    }

    #[test]
    fn success_yields_output_payload() {
        let bridge = ToolCallBridge::new(Arc::new(StubExecutor));
        let payload = bridge.respond(&request("echo"));
        assert_eq!(payload["output"]["echoed"]["k"], "v");
        assert!(payload.get("error").is_none());
    }

    #[test]
    fn execution_failure_yields_error_payload_not_silence() {
        let bridge = ToolCallBridge::new(Arc::new(StubExecutor));
        let payload = bridge.respond(&request("broken"));
        assert_eq!(payload["error"], "execution failed: boom");
    }

    #[test]
    fn unknown_tool_yields_error_payload() {
        let bridge = ToolCallBridge::new(Arc::new(StubExecutor));
        let payload = bridge.respond(&request("nope"));
        assert_eq!(payload["error"], "unknown tool: nope");
    }

    #[test]
    fn every_request_gets_exactly_one_payload() {
        let bridge = ToolCallBridge::new(Arc::new(StubExecutor));
        for name in ["echo", "broken", "nope"] {
            let payload = bridge.respond(&request(name));
            // One payload per request, success or not.
            assert!(payload.is_object());
            assert_eq!(payload.as_object().unwrap().len(), 1);
        }
    }
}
