//! Message envelopes exchanged with the front-end.
//!
//! Only the fields needed for routing are typed. Everything else a request
//! carries is preserved so it can be forwarded to the target untouched.
//! Outbound envelopes have no `seq` field: sequence numbers are stamped by the
//! coordinator right before a message is written.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BridgeError;

const ARGUMENTS: &str = "arguments";

/// Request received from the front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub seq: i64,
    pub command: String,
    /// Every other key, `arguments` included, kept exactly as received.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Request {
    pub fn new(seq: i64, command: impl Into<String>, arguments: Option<Value>) -> Self {
        let mut extra = Map::new();
        extra.insert("type".to_string(), Value::String("request".to_string()));
        if let Some(arguments) = arguments {
            extra.insert(ARGUMENTS.to_string(), arguments);
        }
        Self {
            seq,
            command: command.into(),
            extra,
        }
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, BridgeError> {
        serde_json::from_slice(payload).map_err(|e| BridgeError::MessageParse(e.to_string()))
    }

    /// Look up a key of the `arguments` object.
    pub fn argument(&self, key: &str) -> Option<&Value> {
        self.arguments()?.get(key)
    }

    pub fn arguments(&self) -> Option<&Value> {
        self.extra.get(ARGUMENTS)
    }
}

/// Response sent to the front-end.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Response {
    pub fn success(request: &Request) -> Self {
        Self {
            kind: "response",
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body: None,
        }
    }

    pub fn failure(request: &Request, message: impl Into<String>) -> Self {
        Self {
            kind: "response",
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some(message.into()),
            body: None,
        }
    }
}

/// Event sent to the front-end.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Event {
    pub fn new(event: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            kind: "event",
            event: event.into(),
            body,
        }
    }

    /// Program output captured from a launched debuggee.
    pub fn output(category: OutputCategory, output: impl Into<String>) -> Self {
        let body = OutputBody {
            category,
            output: output.into(),
        };
        Self::new("output", serde_json::to_value(body).ok())
    }
}

#[derive(Debug, Serialize)]
struct OutputBody {
    category: OutputCategory,
    output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCategory {
    Stdout,
    Stderr,
}

impl OutputCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Overwrite the `seq` field of an outbound message.
pub fn set_sequence(message: &mut Value, seq: u64) -> Result<(), BridgeError> {
    match message {
        Value::Object(map) => {
            map.insert("seq".to_string(), Value::from(seq));
            Ok(())
        }
        other => Err(BridgeError::MessageParse(format!(
            "expected a JSON object, got {}",
            value_kind(other)
        ))),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
