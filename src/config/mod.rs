//! Capability configuration snapshots.
//!
//! A [`ConfigMap`] is the immutable, string-keyed bag of values a host hands to
//! a capability. Values usually come from a YAML manifest, so every accessor
//! accepts both native JSON scalars and their string spellings. Accessors take
//! a default and fall back to it when the key is absent or the value cannot
//! be read as the requested type.

pub mod duration;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use duration::{format_duration, parse_duration};

/// Errors raised while interpreting configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A duration string could not be parsed.
    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    /// A required key is absent or empty.
    #[error("missing required configuration key: {0}")]
    Missing(String),

    /// A key holds a value outside its accepted range or vocabulary.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Offending key.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidValue`].
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Immutable configuration snapshot with typed accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigMap {
    values: HashMap<String, Value>,
}

impl ConfigMap {
    /// An empty map; every accessor returns its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from `(key, value)` pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect()
    }

    /// Raw value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the map holds no keys.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over the keys in arbitrary order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// String value; numbers and booleans are rendered to text.
    pub fn string(&self, key: &str, default: &str) -> String {
        match self.values.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    /// Required non-empty string.
    pub fn require_string(&self, key: &str) -> Result<String, ConfigError> {
        let value = self.string(key, "");
        if value.trim().is_empty() {
            return Err(ConfigError::Missing(key.to_string()));
        }
        Ok(value)
    }

    /// Platform-width signed integer.
    pub fn int(&self, key: &str, default: i64) -> i64 {
        self.integer(key).unwrap_or(default)
    }

    /// 32-bit signed integer; out-of-range values yield the default.
    pub fn int32(&self, key: &str, default: i32) -> i32 {
        self.integer(key)
            .and_then(|v| i32::try_from(v).ok())
            .unwrap_or(default)
    }

    /// 64-bit signed integer.
    pub fn int64(&self, key: &str, default: i64) -> i64 {
        self.integer(key).unwrap_or(default)
    }

    /// Unsigned byte; out-of-range values yield the default.
    pub fn uint8(&self, key: &str, default: u8) -> u8 {
        self.integer(key)
            .and_then(|v| u8::try_from(v).ok())
            .unwrap_or(default)
    }

    /// Boolean; accepts `true/false`, `yes/no`, `on/off` and `1/0`.
    pub fn bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => match n.as_i64() {
                Some(0) => false,
                Some(1) => true,
                _ => default,
            },
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => true,
                "false" | "no" | "off" | "0" => false,
                _ => default,
            },
            _ => default,
        }
    }

    /// 64-bit float.
    pub fn float64(&self, key: &str, default: f64) -> f64 {
        match self.values.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Duration; see [`parse_duration`] for the accepted spellings.
    /// Plain numbers are whole seconds.
    pub fn duration(&self, key: &str, default: Duration) -> Duration {
        match self.values.get(key) {
            Some(Value::Number(n)) => n.as_u64().map(Duration::from_secs).unwrap_or(default),
            Some(Value::String(s)) => parse_duration(s).unwrap_or(default),
            _ => default,
        }
    }

    /// List of strings from a sequence or a comma-separated string.
    pub fn string_list(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.values.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    Value::Bool(b) => Some(b.to_string()),
                    _ => None,
                })
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(String::from)
                .collect(),
            _ => default.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// String-to-string map from a mapping or a `k=v,k2=v2` string.
    pub fn string_map(&self, key: &str, default: &HashMap<String, String>) -> HashMap<String, String> {
        match self.values.get(key) {
            Some(Value::Object(obj)) => obj
                .iter()
                .filter_map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        _ => return None,
                    };
                    Some((k.clone(), value))
                })
                .collect(),
            Some(Value::String(s)) => {
                let mut out = HashMap::new();
                for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                    match pair.split_once('=') {
                        Some((k, v)) => {
                            out.insert(k.trim().to_string(), v.trim().to_string());
                        }
                        None => return default.clone(),
                    }
                }
                out
            }
            _ => default.clone(),
        }
    }

    fn integer(&self, key: &str) -> Option<i64> {
        match self.values.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromIterator<(String, Value)> for ConfigMap {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl From<HashMap<String, Value>> for ConfigMap {
    fn from(values: HashMap<String, Value>) -> Self {
        Self { values }
    }
}
