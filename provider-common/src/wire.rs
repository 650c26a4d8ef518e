//! Wire protocol frames exchanged over the duplex channel
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, ErrorKind};

/// A single frame on the duplex channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    /// Outbound call, correlated by `id`
    Request {
        /// Identifier allocated from the bounded pool
        id: u32,
        /// Method and parameters
        data: RequestPayload,
    },
    /// Answer to a previous request with the same `id`
    Response {
        /// Identifier of the request being answered
        id: u32,
        /// Success value, absent on error
        #[serde(default, skip_serializing_if = "Option::is_none")]
        res: Option<Value>,
        /// Error value, absent on success
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<ErrorFrame>,
    },
    /// Unsolicited push event
    Message {
        /// Event name and payload
        data: PushPayload,
    },
}

/// Method call carried by a request frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Method name
    pub method: String,
    /// Opaque structured parameters
    #[serde(default)]
    pub params: Value,
}

/// Event carried by a push frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    /// Event name
    pub event: String,
    /// Event payload
    #[serde(default)]
    pub payload: Value,
}

/// Error carried by a response frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    /// Human readable message
    pub message: String,
    /// Source chain of the error, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Machine readable code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// Additional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&Error> for ErrorFrame {
    fn from(error: &Error) -> Self {
        Self {
            message: error.to_string(),
            stack: error.source_trace(),
            code: Some(error.kind().wire_code()),
            data: None,
        }
    }
}

impl From<ErrorFrame> for Error {
    fn from(frame: ErrorFrame) -> Self {
        let kind = frame
            .code
            .map(ErrorKind::from_wire_code)
            .unwrap_or(ErrorKind::InternalError);
        Error::new(kind, frame.message)
    }
}

/// A classified request as consumed by the request pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequest {
    /// Channel request id
    pub id: u32,
    /// Method name
    pub method: String,
    /// Opaque structured parameters (prechecks may normalize these in place)
    #[serde(default)]
    pub params: Value,
    /// Identity of the external caller
    pub origin: String,
    /// Hosting tab of the external caller
    pub tab_id: i64,
}
