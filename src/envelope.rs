//! Wire format.
//!
//! A request is any JSON object, optionally carrying `callbackID` (the sender
//! expects a reply) and `fromPath` (the channel the reply goes to). A reply is
//! `{"callbackID": "...", "params": [...]}` published to that `fromPath`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reply parameters, in the order the responder passed them.
pub type Params = Vec<Value>;

/// Errors decoding or building an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Request message body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "callbackID", default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<String>,

    #[serde(rename = "fromPath", default, skip_serializing_if = "Option::is_none")]
    pub from_path: Option<String>,

    /// Application fields. Opaque to the messaging core.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Envelope around an existing JSON object.
    pub fn new(payload: Map<String, Value>) -> Self {
        Self {
            callback_id: None,
            from_path: None,
            payload,
        }
    }

    /// Envelope from any value that serializes to a JSON object.
    pub fn from_payload<T: Serialize>(payload: &T) -> Result<Self, EnvelopeError> {
        Self::try_from(serde_json::to_value(payload)?)
    }

    /// Decode a raw bus payload.
    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        Self::try_from(serde_json::from_str::<Value>(raw)?)
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the application fields into a typed payload.
    ///
    /// Correlation fields are not included.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        Ok(serde_json::from_value(Value::Object(self.payload.clone()))?)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// A reply is only possible when both correlation fields are present.
    pub fn expects_reply(&self) -> bool {
        self.callback_id.is_some() && self.from_path.is_some()
    }

    /// Stamp correlation fields onto the envelope.
    pub fn stamp(&mut self, callback_id: impl Into<String>, from_path: impl Into<String>) {
        self.callback_id = Some(callback_id.into());
        self.from_path = Some(from_path.into());
    }
}

impl TryFrom<Value> for Envelope {
    type Error = EnvelopeError;

    /// A correlation field that is not a string is dropped, so the message
    /// is delivered as one that expects no reply.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let kind = match value {
            Value::Object(mut payload) => {
                let callback_id = take_string(&mut payload, "callbackID");
                let from_path = take_string(&mut payload, "fromPath");
                return Ok(Self {
                    callback_id,
                    from_path,
                    payload,
                });
            }
            Value::Null => "null",
            Value::Bool(_) => "a boolean",
            Value::Number(_) => "a number",
            Value::String(_) => "a string",
            Value::Array(_) => "an array",
        };
        Err(EnvelopeError::NotAnObject(kind))
    }
}

fn take_string(payload: &mut Map<String, Value>, key: &str) -> Option<String> {
    match payload.remove(key) {
        Some(Value::String(value)) => Some(value),
        _ => None,
    }
}

/// Reply message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(rename = "callbackID")]
    pub callback_id: String,

    #[serde(default)]
    pub params: Params,
}

impl Reply {
    pub fn new(callback_id: impl Into<String>, params: Params) -> Self {
        Self {
            callback_id: callback_id.into(),
            params,
        }
    }

    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }
}
