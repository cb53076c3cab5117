use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of data kinds a port can carry.
/// New kinds are added here; there is no subtyping between kinds.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Text,
    Trigger,
    Number,
    Json,
    Binary,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataKind::Text => "text",
            DataKind::Trigger => "trigger",
            DataKind::Number => "number",
            DataKind::Json => "json",
            DataKind::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// The value travelling on the bus.
///
/// `Text` is an immutable shared string, so copying it only bumps a refcount.
/// Every other variant is duplicated by [`Payload::deep_copy`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Null,
    Text(Arc<str>),
    Trigger,
    Number(f64),
    Json(Value),
    Binary(Arc<[u8]>),
}

impl Payload {
    pub fn text(s: impl AsRef<str>) -> Self {
        Payload::Text(Arc::from(s.as_ref()))
    }

    /// The kind of a non-null payload. `Null` has no kind of its own.
    pub fn kind(&self) -> Option<DataKind> {
        match self {
            Payload::Null => None,
            Payload::Text(_) => Some(DataKind::Text),
            Payload::Trigger => Some(DataKind::Trigger),
            Payload::Number(_) => Some(DataKind::Number),
            Payload::Json(_) => Some(DataKind::Json),
            Payload::Binary(_) => Some(DataKind::Binary),
        }
    }

    /// An independent copy for one receiver.
    /// Text is shared because nobody can mutate it; null stays null.
    pub fn deep_copy(&self) -> Self {
        match self {
            Payload::Null => Payload::Null,
            Payload::Text(s) => Payload::Text(Arc::clone(s)),
            Payload::Trigger => Payload::Trigger,
            Payload::Number(n) => Payload::Number(*n),
            Payload::Json(v) => Payload::Json(v.clone()),
            Payload::Binary(b) => Payload::Binary(Arc::from(b.to_vec())),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Payload::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_json_mut(&mut self) -> Option<&mut Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }

    /// Lossy JSON rendering, used at the wasm boundary and in logs.
    pub fn to_json(&self) -> Value {
        match self {
            Payload::Null | Payload::Trigger => Value::Null,
            Payload::Text(s) => Value::String(s.to_string()),
            Payload::Number(n) => serde_json::json!(n),
            Payload::Json(v) => v.clone(),
            Payload::Binary(b) => Value::Array(b.iter().map(|x| Value::from(*x)).collect()),
        }
    }
}

/// A named, typed message on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub kind: DataKind,
    pub payload: Payload,
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event whose kind follows its payload.
    /// A `Null` payload without an explicit kind is treated as `Json`.
    pub fn new(name: impl Into<String>, payload: Payload) -> Self {
        let kind = payload.kind().unwrap_or(DataKind::Json);
        Self::with_kind(name, kind, payload)
    }

    pub fn with_kind(name: impl Into<String>, kind: DataKind, payload: Payload) -> Self {
        Self {
            name: name.into(),
            kind,
            payload,
            source: None,
            timestamp: Utc::now(),
        }
    }

    pub fn null(name: impl Into<String>, kind: DataKind) -> Self {
        Self::with_kind(name, kind, Payload::Null)
    }

    pub fn text(name: impl Into<String>, text: impl AsRef<str>) -> Self {
        Self::new(name, Payload::text(text))
    }

    pub fn trigger(name: impl Into<String>) -> Self {
        Self::new(name, Payload::Trigger)
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Bus name for traffic on a port: `"{module_id}.port.{port}"`.
pub fn port_event_name(module_id: &str, port: &str) -> String {
    format!("{}.port.{}", module_id, port)
}

/// Bus name for an execute dispatch: `"{module_id}.execute"`.
pub fn execute_event_name(module_id: &str) -> String {
    format!("{}.execute", module_id)
}
