//! Backend port for the key-value capability.
//!
//! The capability speaks to its persistent store through three small traits:
//! a [`KvConnector`] opens a [`KvSession`], a session opens or creates a
//! [`KvBucket`], and the bucket serves reads and writes. Adapters implement
//! all three. [`JetStreamConnector`](super::jetstream::JetStreamConnector)
//! talks to a NATS server and [`MemoryBackend`](super::memory::MemoryBackend)
//! keeps everything in process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::{BucketConfig, ConnectOptions, StorageType};

/// Errors raised by a backend adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key exists: {0}")]
    KeyExists(String),

    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("invalid bucket name: {0:?}")]
    InvalidBucketName(String),

    #[error("value of {size} bytes exceeds the bucket limit of {max}")]
    ValueTooLarge { size: usize, max: usize },

    #[error("bucket {0} is full")]
    BucketFull(String),

    /// The server cannot be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The session this handle belongs to was closed.
    #[error("connection closed")]
    Closed,

    /// The adapter cannot honour the request.
    #[error("unsupported by this backend: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Whether the same call may succeed later without any change.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Closed)
    }
}

/// One stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub bucket: String,
    pub key: String,
    pub value: Bytes,
    pub revision: u64,
    pub created: DateTime<Utc>,
}

/// Bucket summary as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStatus {
    pub bucket: String,
    /// Live keys.
    pub values: u64,
    pub history: u8,
    pub ttl: Duration,
    pub bytes: u64,
    pub storage: StorageType,
    pub replicas: i64,
}

/// Opens sessions against a backend.
#[async_trait]
pub trait KvConnector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn KvSession>, BackendError>;
}

/// An open connection.
#[async_trait]
pub trait KvSession: Send + Sync {
    /// Open an existing bucket; [`BackendError::BucketNotFound`] if absent.
    async fn key_value(&self, bucket: &str) -> Result<Arc<dyn KvBucket>, BackendError>;

    /// Create a bucket with exactly `config`.
    async fn create_key_value(&self, config: &BucketConfig) -> Result<Arc<dyn KvBucket>, BackendError>;

    /// Close the connection. Bucket handles opened through it stop working.
    async fn close(&self);
}

/// A handle to one bucket.
#[async_trait]
pub trait KvBucket: Send + Sync {
    fn bucket(&self) -> &str;

    /// Latest value of `key`; [`BackendError::KeyNotFound`] when absent,
    /// deleted or expired.
    async fn get(&self, key: &str) -> Result<KvEntry, BackendError>;

    /// Store `value` only if `key` has no live value. Returns the revision.
    ///
    /// `ttl` overrides the bucket TTL for this entry. Adapters without
    /// per-entry TTL must fail with [`BackendError::Unsupported`].
    async fn create(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<u64, BackendError>;

    /// Delete `key`; [`BackendError::KeyNotFound`] when it has no live value.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    async fn status(&self) -> Result<BucketStatus, BackendError>;
}
