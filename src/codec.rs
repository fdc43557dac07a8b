//! Wire codec for peer frames.
//!
//! The peer speaks JSON text frames in two shapes:
//!
//! ```text
//! entry update   {"type":"entry","key":"motor_speed","value":0.42}
//!                {"key":"motor_speed","value":0.42,"type":"number"}   (what we send)
//! bridge event   {"topic_name":"/drive/left","data":"0.42,"}
//! ```
//!
//! Both entry shapes are accepted on decode. The value's type tag is always
//! derived from the JSON representation of `value`; a declared `type` is only
//! checked for being one we understand.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

/// Type tag carried next to every cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// UTF-8 string.
    String,
    /// Double-precision number.
    Number,
    /// Boolean.
    Boolean,
    /// Any other JSON value (object, array, null).
    #[serde(rename = "object", alias = "json")]
    Json,
}

impl ValueType {
    /// Wire spelling of the tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Json => "object",
        }
    }

    /// Parse a wire tag. Accepts `json` as an alias for `object`.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            "object" | "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded entry value with its tag fixed at decode time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum EntryValue {
    /// String payload.
    String(String),
    /// Numeric payload (all JSON numbers are carried as `f64`).
    Number(f64),
    /// Boolean payload.
    Boolean(bool),
    /// Structured payload: object, array or null.
    Json(Value),
}

impl EntryValue {
    /// The tag for this value.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::String(_) => ValueType::String,
            Self::Number(_) => ValueType::Number,
            Self::Boolean(_) => ValueType::Boolean,
            Self::Json(_) => ValueType::Json,
        }
    }

    /// Convert back to a plain JSON value.
    #[must_use]
    pub fn to_json(&self) -> Value {
        self.clone().into()
    }

    /// Numeric payload, if this is a number.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String payload, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean payload, if this is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<Value> for EntryValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Self::String(s),
            Value::Bool(b) => Self::Boolean(b),
            Value::Number(n) => match n.as_f64() {
                Some(f) => Self::Number(f),
                None => Self::Json(Value::Number(n)),
            },
            other => Self::Json(other),
        }
    }
}

impl From<EntryValue> for Value {
    fn from(value: EntryValue) -> Self {
        match value {
            EntryValue::String(s) => Value::String(s),
            EntryValue::Boolean(b) => Value::Bool(b),
            // NaN and infinities have no JSON spelling
            EntryValue::Number(n) => serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            EntryValue::Json(v) => v,
        }
    }
}

impl From<&str> for EntryValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for EntryValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for EntryValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for EntryValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// A key/value update, inbound or outbound.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryUpdate {
    /// Table key, e.g. `"/SmartDashboard/motor_speed"`.
    pub key: String,
    /// Decoded value.
    pub value: EntryValue,
}

impl EntryUpdate {
    /// Build an update from anything convertible into an [`EntryValue`].
    pub fn new(key: impl Into<String>, value: impl Into<EntryValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A streamed sample destined for the accumulation buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEvent {
    /// Topic the sample belongs to; used as the buffer key.
    pub topic_name: String,
    /// Sample payload, appended verbatim.
    pub data: String,
}

/// A successfully decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Entry update for the cache.
    Entry(EntryUpdate),
    /// Sample for the accumulation buffer.
    Event(BridgeEvent),
}

/// Outbound wire shape: `{key, value, type}`.
#[derive(Serialize)]
struct OutboundEntry<'a> {
    key: &'a str,
    value: &'a EntryValue,
    #[serde(rename = "type")]
    value_type: ValueType,
}

/// Encode an entry update in the outbound `{key, value, type}` shape.
pub fn encode_entry(update: &EntryUpdate) -> Result<String, RelayError> {
    let frame = OutboundEntry {
        key: &update.key,
        value: &update.value,
        value_type: update.value.value_type(),
    };
    serde_json::to_string(&frame).map_err(|e| RelayError::Decode(format!("encode failed: {e}")))
}

/// Decode one inbound text frame.
///
/// Frames carrying `topic_name` are bridge events; frames carrying `key` are
/// entry updates. A non-string `data` payload is kept as its JSON text.
pub fn decode_frame(text: &str) -> Result<InboundFrame, RelayError> {
    let Value::Object(mut map) = serde_json::from_str::<Value>(text)? else {
        return Err(RelayError::Decode("frame is not a JSON object".into()));
    };

    if let Some(topic) = map.remove("topic_name") {
        let Value::String(topic_name) = topic else {
            return Err(RelayError::Decode("topic_name must be a string".into()));
        };
        let data = match map.remove("data") {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => return Err(RelayError::Decode("event frame has no data".into())),
        };
        return Ok(InboundFrame::Event(BridgeEvent { topic_name, data }));
    }

    match map.get("type") {
        None => {}
        Some(Value::String(tag)) if tag == "entry" || ValueType::from_tag(tag).is_some() => {}
        Some(other) => {
            return Err(RelayError::Decode(format!("unsupported frame type {other}")));
        }
    }

    let key = match map.remove("key") {
        Some(Value::String(key)) => key,
        Some(_) => return Err(RelayError::Decode("key must be a string".into())),
        None => return Err(RelayError::Decode("frame has neither key nor topic_name".into())),
    };
    let value = map
        .remove("value")
        .ok_or_else(|| RelayError::Decode(format!("entry frame for {key} has no value")))?;

    Ok(InboundFrame::Entry(EntryUpdate {
        key,
        value: EntryValue::from(value),
    }))
}
