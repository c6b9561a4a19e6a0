//! WebSocket Protocol Messages
//!
//! Defines the message types exchanged between PV clients and a process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use simulacrum_runtime::{ChannelUpdate, ChannelValue, RoutingError};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Read a PV
    Get {
        /// Request ID for correlation
        id: String,
        name: String,
    },

    /// Write a PV
    Put {
        id: String,
        name: String,
        value: ChannelValue,
    },

    /// Subscribe to value changes of PVs
    Subscribe {
        id: String,
        names: Vec<String>,
    },

    /// Unsubscribe from PVs
    Unsubscribe {
        id: String,
        names: Vec<String>,
    },

    /// Ping for keep-alive
    Ping {
        id: String,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Sent on initial connection
    Connected {
        session_id: String,
        server_version: String,
        process: String,
    },

    /// Response to a client request
    Response {
        id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Push notification for a subscribed PV
    Update {
        name: String,
        value: ChannelValue,
        timestamp: DateTime<Utc>,
    },

    /// Error not tied to a successful parse of a request
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        code: ErrorCode,
        message: String,
    },

    /// Pong response to ping
    Pong {
        id: String,
    },
}

/// Error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    AccessDenied,
    InvalidValue,
    HandlerFailed,
    Unavailable,
    InternalError,
}

impl From<&RoutingError> for ErrorCode {
    fn from(error: &RoutingError) -> Self {
        match error {
            RoutingError::AccessDenied(_) => ErrorCode::AccessDenied,
            RoutingError::InvalidValue { .. } => ErrorCode::InvalidValue,
            RoutingError::Handler { .. } => ErrorCode::HandlerFailed,
            RoutingError::HostUnavailable => ErrorCode::Unavailable,
            RoutingError::Configuration(_) => ErrorCode::InternalError,
        }
    }
}

impl ServerMessage {
    /// Create a success response
    pub fn success(id: impl Into<String>, data: Option<Value>) -> Self {
        Self::Response {
            id: id.into(),
            success: true,
            data,
            code: None,
            error: None,
        }
    }

    /// Create an error response
    pub fn error_response(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Response {
            id: id.into(),
            success: false,
            data: None,
            code: Some(code),
            error: Some(message.into()),
        }
    }

    /// Create an error response from a failed table operation
    pub fn routing_error(id: impl Into<String>, error: &RoutingError) -> Self {
        Self::error_response(id, ErrorCode::from(error), error.to_string())
    }

    /// Create a connected message
    pub fn connected(session_id: impl Into<String>, process: impl Into<String>) -> Self {
        Self::Connected {
            session_id: session_id.into(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            process: process.into(),
        }
    }

    /// Create a pong message
    pub fn pong(id: impl Into<String>) -> Self {
        Self::Pong { id: id.into() }
    }
}

impl From<ChannelUpdate> for ServerMessage {
    fn from(update: ChannelUpdate) -> Self {
        Self::Update {
            name: update.name,
            value: update.value,
            timestamp: update.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_deserialize() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"Put","id":"1","name":"QUAD:IN20:361:BCTRL","value":1.5}"#).unwrap();
        match msg {
            ClientMessage::Put { name, value, .. } => {
                assert_eq!(name, "QUAD:IN20:361:BCTRL");
                assert_eq!(value, ChannelValue::Float(1.5));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_server_message_serialize() {
        let msg = ServerMessage::success("1", Some(serde_json::json!({"BPMS:IN20:221:X": 0.1})));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"Response\""));
        assert!(json.contains("\"success\":true"));
        assert!(!json.contains("code"));
    }

    #[test]
    fn test_routing_error_codes() {
        let msg = ServerMessage::routing_error("2", &RoutingError::AccessDenied("BPMS:IN20:221:X".into()));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"code\":\"ACCESS_DENIED\""));
        assert!(json.contains("read-only"));
    }

    #[test]
    fn test_update_message() {
        let update = ChannelUpdate {
            name: "BPMS:IN20:221:Y".to_string(),
            value: ChannelValue::Float(-0.5),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&ServerMessage::from(update)).unwrap();
        assert!(json.contains("\"type\":\"Update\""));
        assert!(json.contains("-0.5"));
    }
}
