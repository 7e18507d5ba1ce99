//! Pluggable value encodings.
//!
//! An [`Encoding`] turns a self-describing value into bytes and back. The
//! key-value capability looks one up by name from an [`EncodingRegistry`] at
//! setup and uses it for every read and write. `json` and `yaml` are built in;
//! further codecs can be registered under their own names.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

static GLOBAL_ENCODINGS: Lazy<Arc<EncodingRegistry>> =
    Lazy::new(|| Arc::new(EncodingRegistry::with_defaults()));

/// Marshal/unmarshal failures.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The value could not be turned into bytes.
    #[error("{encoding} marshal failed: {message}")]
    Marshal { encoding: String, message: String },

    /// The bytes could not be parsed by the encoding.
    #[error("{encoding} unmarshal failed: {message}")]
    Unmarshal { encoding: String, message: String },

    /// The decoded value does not match the requested type.
    #[error("decoded value does not match the target type: {0}")]
    Shape(String),
}

/// A named marshal/unmarshal implementation.
pub trait Encoding: Send + Sync {
    /// Registry name, e.g. `"json"`.
    fn name(&self) -> &str;

    /// MIME type of the produced bytes.
    fn content_type(&self) -> &str;

    /// Serialise a value.
    fn marshal(&self, value: &Value) -> Result<Vec<u8>, EncodingError>;

    /// Parse bytes produced by [`marshal`](Self::marshal).
    fn unmarshal(&self, data: &[u8]) -> Result<Value, EncodingError>;
}

/// Encode any serialisable value with `encoding`.
pub fn encode<T: Serialize + ?Sized>(encoding: &dyn Encoding, value: &T) -> Result<Vec<u8>, EncodingError> {
    let value = serde_json::to_value(value).map_err(|e| EncodingError::Marshal {
        encoding: encoding.name().to_string(),
        message: e.to_string(),
    })?;
    encoding.marshal(&value)
}

/// Decode bytes with `encoding` into `T`.
pub fn decode<T: DeserializeOwned>(encoding: &dyn Encoding, data: &[u8]) -> Result<T, EncodingError> {
    let value = encoding.unmarshal(data)?;
    serde_json::from_value(value).map_err(|e| EncodingError::Shape(e.to_string()))
}

/// JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoding;

impl Encoding for JsonEncoding {
    fn name(&self) -> &str {
        "json"
    }

    fn content_type(&self) -> &str {
        "application/json"
    }

    fn marshal(&self, value: &Value) -> Result<Vec<u8>, EncodingError> {
        serde_json::to_vec(value).map_err(|e| EncodingError::Marshal {
            encoding: "json".to_string(),
            message: e.to_string(),
        })
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value, EncodingError> {
        serde_json::from_slice(data).map_err(|e| EncodingError::Unmarshal {
            encoding: "json".to_string(),
            message: e.to_string(),
        })
    }
}

/// YAML via `serde_yaml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlEncoding;

impl Encoding for YamlEncoding {
    fn name(&self) -> &str {
        "yaml"
    }

    fn content_type(&self) -> &str {
        "application/yaml"
    }

    fn marshal(&self, value: &Value) -> Result<Vec<u8>, EncodingError> {
        serde_yaml::to_string(value)
            .map(String::into_bytes)
            .map_err(|e| EncodingError::Marshal {
                encoding: "yaml".to_string(),
                message: e.to_string(),
            })
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value, EncodingError> {
        serde_yaml::from_slice(data).map_err(|e| EncodingError::Unmarshal {
            encoding: "yaml".to_string(),
            message: e.to_string(),
        })
    }
}

/// Name → encoding table.
#[derive(Default)]
pub struct EncodingRegistry {
    encodings: RwLock<HashMap<String, Arc<dyn Encoding>>>,
}

impl std::fmt::Debug for EncodingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodingRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl EncodingRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in `json` and `yaml` encodings.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(JsonEncoding));
        registry.register(Arc::new(YamlEncoding));
        registry
    }

    /// The process-wide registry, pre-populated with the built-ins.
    pub fn global() -> Arc<EncodingRegistry> {
        Arc::clone(&GLOBAL_ENCODINGS)
    }

    /// Register (or replace) an encoding under its own name.
    pub fn register(&self, encoding: Arc<dyn Encoding>) {
        self.encodings
            .write()
            .insert(encoding.name().to_string(), encoding);
    }

    /// Look up an encoding by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Encoding>> {
        self.encodings.read().get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.encodings.read().keys().cloned().collect();
        names.sort();
        names
    }
}
