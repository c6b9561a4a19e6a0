//! Command channel messages
//!
//! Requests are `{cmd, val}` objects; replies are `{status, result?, err?}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request sent from a device process to the model authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "val", rename_all = "kebab-case")]
pub enum CommandRequest {
    /// Run one opaque instruction against the model
    Evaluate(String),

    /// Run several instructions in order; the batch fails as a whole
    EvaluateBatch(Vec<String>),

    /// Mark the model dirty so the next ticks recompute and broadcast.
    /// The optional snapshot kind is informational.
    MarkDirty(Option<String>),

    /// Liveness check, echoes `val` back
    Echo(Value),
}

impl CommandRequest {
    pub fn evaluate(instruction: impl Into<String>) -> Self {
        CommandRequest::Evaluate(instruction.into())
    }

    pub fn evaluate_batch<I, S>(instructions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandRequest::EvaluateBatch(instructions.into_iter().map(Into::into).collect())
    }

    /// The wire name of this command
    pub fn kind(&self) -> &'static str {
        match self {
            CommandRequest::Evaluate(_) => "evaluate",
            CommandRequest::EvaluateBatch(_) => "evaluate-batch",
            CommandRequest::MarkDirty(_) => "mark-dirty",
            CommandRequest::Echo(_) => "echo",
        }
    }
}

/// Outcome of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Fail,
}

/// The reply to exactly one [`CommandRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub status: ReplyStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl CommandReply {
    /// Create a success reply
    pub fn ok(result: Option<Value>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            result,
            err: None,
        }
    }

    /// Create a failure reply
    pub fn fail(err: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Fail,
            result: None,
            err: Some(err.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// Convert into a `Result`, using the error string for failures
    pub fn into_result(self) -> Result<Option<Value>, String> {
        match self.status {
            ReplyStatus::Ok => Ok(self.result),
            ReplyStatus::Fail => Err(self.err.unwrap_or_else(|| "unspecified failure".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_string(&CommandRequest::evaluate("show ele Q*")).unwrap();
        assert_eq!(json, r#"{"cmd":"evaluate","val":"show ele Q*"}"#);

        let batch: CommandRequest =
            serde_json::from_str(r#"{"cmd":"evaluate-batch","val":["a","b"]}"#).unwrap();
        assert_eq!(batch, CommandRequest::evaluate_batch(["a", "b"]));

        let dirty: CommandRequest = serde_json::from_str(r#"{"cmd":"mark-dirty","val":"orbit"}"#).unwrap();
        assert_eq!(dirty.kind(), "mark-dirty");
    }

    #[test]
    fn test_unknown_command_rejected() {
        let result = serde_json::from_str::<CommandRequest>(r#"{"cmd":"reboot","val":null}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_reply_serialization() {
        let json = serde_json::to_string(&CommandReply::ok(None)).unwrap();
        assert_eq!(json, r#"{"status":"ok"}"#);

        let reply = CommandReply::fail("no such element");
        assert!(!reply.is_ok());
        assert_eq!(reply.into_result(), Err("no such element".to_string()));
    }
}
