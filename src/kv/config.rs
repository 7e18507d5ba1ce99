//! Key-value capability configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ConfigMap};

pub const DEFAULT_BUCKET: &str = "kvstore";
pub const DEFAULT_BUCKET_DESCRIPTION: &str = "nats kvstore";
pub const DEFAULT_ENCODING: &str = "json";
pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
pub const DEFAULT_CLIENT_NAME: &str = "capkit_nats_kv";

pub const DEFAULT_MAX_RECONNECTS: i64 = 60;
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_RECONNECT_JITTER: Duration = Duration::from_millis(100);
pub const DEFAULT_RECONNECT_JITTER_TLS: Duration = Duration::from_secs(1);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_PING_OUT: i64 = 2;
pub const DEFAULT_RECONNECT_BUF_SIZE: i64 = 8 * 1024 * 1024;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the backend persists bucket data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File = 0,
    Memory = 1,
}

impl TryFrom<i64> for StorageType {
    type Error = ConfigError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StorageType::File),
            1 => Ok(StorageType::Memory),
            other => Err(ConfigError::invalid(
                "kv_bucket_storage",
                format!("expected 0 (file) or 1 (memory), got {}", other),
            )),
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::File => write!(f, "file"),
            StorageType::Memory => write!(f, "memory"),
        }
    }
}

/// Desired bucket attributes. Applied only when the bucket is created;
/// an existing bucket is used as it is.
///
/// Zero means "backend default" for `max_value_size`, `history`, `ttl`,
/// `max_bytes` and `replicas`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub bucket: String,
    pub description: String,
    pub max_value_size: i32,
    pub history: u8,
    pub ttl: Duration,
    pub max_bytes: i64,
    pub storage: StorageType,
    pub replicas: i64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            description: DEFAULT_BUCKET_DESCRIPTION.to_string(),
            max_value_size: 0,
            history: 0,
            ttl: Duration::ZERO,
            max_bytes: 0,
            storage: StorageType::File,
            replicas: 0,
        }
    }
}

impl BucketConfig {
    /// A default bucket config with the given name.
    pub fn named(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Default::default()
        }
    }
}

/// Client connection settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub url: String,
    pub client_name: String,
    pub username: String,
    pub password: String,
    pub max_reconnects: i64,
    pub reconnect_wait: Duration,
    pub timeout: Duration,
    pub reconnect_jitter: Duration,
    pub reconnect_jitter_tls: Duration,
    pub ping_interval: Duration,
    pub max_ping_out: i64,
    pub reconnect_buf_size: i64,
    pub drain_timeout: Duration,
}

// Keeps the password out of logs.
impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("url", &self.url)
            .field("client_name", &self.client_name)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("max_reconnects", &self.max_reconnects)
            .field("reconnect_wait", &self.reconnect_wait)
            .field("timeout", &self.timeout)
            .field("reconnect_jitter", &self.reconnect_jitter)
            .field("reconnect_jitter_tls", &self.reconnect_jitter_tls)
            .field("ping_interval", &self.ping_interval)
            .field("max_ping_out", &self.max_ping_out)
            .field("reconnect_buf_size", &self.reconnect_buf_size)
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_NATS_URL.to_string(),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            username: String::new(),
            password: String::new(),
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            timeout: DEFAULT_TIMEOUT,
            reconnect_jitter: DEFAULT_RECONNECT_JITTER,
            reconnect_jitter_tls: DEFAULT_RECONNECT_JITTER_TLS,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_ping_out: DEFAULT_MAX_PING_OUT,
            reconnect_buf_size: DEFAULT_RECONNECT_BUF_SIZE,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Everything the key-value capability reads from its [`ConfigMap`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KvConfig {
    pub bucket: BucketConfig,
    pub connect: ConnectOptions,
    pub encoding: String,
}

impl KvConfig {
    /// Read every recognised key, defaulting the absent ones.
    ///
    /// Only an out-of-range `kv_bucket_storage` is an error.
    pub fn from_config_map(cm: &ConfigMap) -> Result<Self, ConfigError> {
        let storage = StorageType::try_from(cm.int("kv_bucket_storage", 0))?;

        let bucket = BucketConfig {
            bucket: cm.string("kv_bucket", DEFAULT_BUCKET),
            description: cm.string("kv_bucket_description", DEFAULT_BUCKET_DESCRIPTION),
            max_value_size: cm.int32("kv_bucket_max_value_size", 0),
            history: cm.uint8("kv_bucket_history", 0),
            ttl: cm.duration("kv_bucket_ttl", Duration::ZERO),
            max_bytes: cm.int64("kv_bucket_max_bytes", 0),
            storage,
            replicas: cm.int("kv_bucket_replicas", 0),
        };

        let connect = ConnectOptions {
            url: cm.string("nats_url", DEFAULT_NATS_URL),
            client_name: cm.string("client_name", DEFAULT_CLIENT_NAME),
            username: cm.string("username", ""),
            password: cm.string("password", ""),
            max_reconnects: cm.int("max_reconnects", DEFAULT_MAX_RECONNECTS),
            reconnect_wait: cm.duration("reconnect_wait", DEFAULT_RECONNECT_WAIT),
            timeout: cm.duration("timeout", DEFAULT_TIMEOUT),
            reconnect_jitter: cm.duration("reconnect_jitter", DEFAULT_RECONNECT_JITTER),
            reconnect_jitter_tls: cm.duration("reconnect_jitter_tls", DEFAULT_RECONNECT_JITTER_TLS),
            ping_interval: cm.duration("ping_interval", DEFAULT_PING_INTERVAL),
            max_ping_out: cm.int("max_ping_out", DEFAULT_MAX_PING_OUT),
            reconnect_buf_size: cm.int("reconnect_buf_size", DEFAULT_RECONNECT_BUF_SIZE),
            drain_timeout: cm.duration("drain_timeout", DEFAULT_DRAIN_TIMEOUT),
        };

        Ok(Self {
            bucket,
            connect,
            encoding: cm.string("encoding", DEFAULT_ENCODING),
        })
    }
}
