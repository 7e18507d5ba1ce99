//! Events emitted by capabilities.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Which side of a capability an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Something the capability received.
    Input,
    /// Something the capability produced.
    Output,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// A business event forwarded to the transmission fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier (UUID v4).
    pub id: String,

    /// UTC creation time.
    pub timestamp: DateTime<Utc>,

    /// Event kind, e.g. `"kv.set"`.
    pub kind: String,

    /// Contract id of the capability that produced the event.
    #[serde(default)]
    pub source: String,

    /// Free-form string headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Event body.
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// New event of the given kind with an empty body.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind: kind.into(),
            source: String::new(),
            headers: HashMap::new(),
            payload: Value::Null,
        }
    }

    /// Set the producing contract id.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Replace the body.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let event = Event::new("kv.set")
            .with_source("capkit:kv")
            .with_header("bucket", "orders")
            .with_payload(serde_json::json!({"key": "order-1"}));

        assert_eq!(event.kind, "kv.set");
        assert_eq!(event.source, "capkit:kv");
        assert_eq!(event.headers["bucket"], "orders");
        assert_eq!(event.payload["key"], "order-1");
        assert!(Uuid::parse_str(&event.id).is_ok());
    }

    #[test]
    fn test_serde_roundtrip_keeps_defaults() {
        let json = r#"{"id":"e1","timestamp":"2024-01-01T00:00:00Z","kind":"ping"}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert!(event.headers.is_empty());
        assert_eq!(event.payload, Value::Null);
        assert_eq!(Direction::Output.to_string(), "output");
    }
}
