//! JetStream key-value adapter on `async-nats`.
//!
//! A [`JetStreamConnector`] opens one NATS client per session; buckets are
//! JetStream key-value stores. This is the backend the built-in capability
//! uses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, context::GetStreamErrorKind, kv, stream, ErrorCode};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::backend::{BackendError, BucketStatus, KvBucket, KvConnector, KvEntry, KvSession};
use super::config::{BucketConfig, ConnectOptions, StorageType};

/// Connects to a NATS server and talks to its JetStream key-value API.
#[derive(Debug, Clone, Copy, Default)]
pub struct JetStreamConnector;

impl JetStreamConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Client options for `options`.
///
/// `max_ping_out` and `reconnect_buf_size` have no counterpart in the client
/// and are not applied.
pub(crate) fn client_options(options: &ConnectOptions) -> async_nats::ConnectOptions {
    let mut client = async_nats::ConnectOptions::new()
        .name(options.client_name.as_str())
        .max_reconnects(max_reconnects(options.max_reconnects))
        .connection_timeout(options.timeout)
        .request_timeout(Some(options.timeout))
        .ping_interval(options.ping_interval);

    let delay = reconnect_delay(options);
    client = client.reconnect_delay_callback(move |_attempts| delay);

    if !options.username.is_empty() {
        client = client.user_and_password(options.username.clone(), options.password.clone());
    }
    client
}

/// Negative means unlimited.
pub(crate) fn max_reconnects(configured: i64) -> Option<usize> {
    usize::try_from(configured).ok()
}

/// Delay between reconnect attempts: the wait plus the jitter that applies
/// to the server URL's scheme.
pub(crate) fn reconnect_delay(options: &ConnectOptions) -> Duration {
    let jitter = if options.url.trim_start().starts_with("tls://") {
        options.reconnect_jitter_tls
    } else {
        options.reconnect_jitter
    };
    options.reconnect_wait.saturating_add(jitter)
}

/// JetStream bucket configuration for `config`. Zero fields keep the server
/// defaults.
pub(crate) fn store_config(config: &BucketConfig) -> kv::Config {
    kv::Config {
        bucket: config.bucket.clone(),
        description: config.description.clone(),
        max_value_size: config.max_value_size,
        history: i64::from(config.history),
        max_age: config.ttl,
        max_bytes: config.max_bytes,
        storage: match config.storage {
            StorageType::File => stream::StorageType::File,
            StorageType::Memory => stream::StorageType::Memory,
        },
        num_replicas: usize::try_from(config.replicas).unwrap_or(0),
        ..Default::default()
    }
}

#[async_trait]
impl KvConnector for JetStreamConnector {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn KvSession>, BackendError> {
        let client = client_options(options)
            .connect(options.url.as_str())
            .await
            .map_err(|e| BackendError::Unavailable(format!("{}: {}", options.url, e)))?;
        log::debug!("connected to {} as {}", options.url, options.client_name);

        Ok(Arc::new(JetStreamSession {
            inner: Mutex::new(Some(SessionInner {
                js: jetstream::new(client.clone()),
                client,
            })),
            closed: Arc::new(AtomicBool::new(false)),
            drain_timeout: options.drain_timeout,
        }))
    }
}

struct SessionInner {
    client: async_nats::Client,
    js: jetstream::Context,
}

struct JetStreamSession {
    inner: Mutex<Option<SessionInner>>,
    closed: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl JetStreamSession {
    fn context(&self) -> Result<jetstream::Context, BackendError> {
        self.inner
            .lock()
            .as_ref()
            .map(|inner| inner.js.clone())
            .ok_or(BackendError::Closed)
    }

    fn handle(&self, store: kv::Store, bucket: &str) -> Arc<dyn KvBucket> {
        Arc::new(JetStreamBucket {
            store,
            bucket: bucket.to_string(),
            closed: Arc::clone(&self.closed),
        })
    }
}

/// Whether the bucket's backing stream is missing, as opposed to the lookup
/// failing for another reason.
async fn bucket_missing(js: &jetstream::Context, bucket: &str) -> bool {
    match js.get_stream(format!("KV_{}", bucket)).await {
        Ok(_) => false,
        Err(e) => matches!(
            e.kind(),
            GetStreamErrorKind::JetStream(err) if err.error_code() == ErrorCode::STREAM_NOT_FOUND
        ),
    }
}

#[async_trait]
impl KvSession for JetStreamSession {
    async fn key_value(&self, bucket: &str) -> Result<Arc<dyn KvBucket>, BackendError> {
        let js = self.context()?;
        match js.get_key_value(bucket).await {
            Ok(store) => Ok(self.handle(store, bucket)),
            Err(e) if e.kind() == jetstream::context::KeyValueErrorKind::InvalidStoreName => {
                Err(BackendError::InvalidBucketName(bucket.to_string()))
            }
            Err(e) => {
                if bucket_missing(&js, bucket).await {
                    Err(BackendError::BucketNotFound(bucket.to_string()))
                } else {
                    Err(BackendError::Unavailable(e.to_string()))
                }
            }
        }
    }

    async fn create_key_value(&self, config: &BucketConfig) -> Result<Arc<dyn KvBucket>, BackendError> {
        let js = self.context()?;
        let store = js
            .create_key_value(store_config(config))
            .await
            .map_err(|e| BackendError::Other(format!("creating bucket {}: {}", config.bucket, e)))?;
        Ok(self.handle(store, &config.bucket))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let Some(inner) = self.inner.lock().take() else {
            return;
        };
        match tokio::time::timeout(self.drain_timeout, inner.client.flush()).await {
            Ok(Ok(())) => log::debug!("nats connection flushed and closed"),
            Ok(Err(e)) => log::warn!("flushing nats connection: {}", e),
            Err(_) => log::warn!("flushing nats connection timed out after {:?}", self.drain_timeout),
        }
    }
}

struct JetStreamBucket {
    store: kv::Store,
    bucket: String,
    closed: Arc<AtomicBool>,
}

impl JetStreamBucket {
    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    async fn live_entry(&self, key: &str) -> Result<kv::Entry, BackendError> {
        let entry = self.store.entry(key).await.map_err(|e| {
            if e.kind() == kv::EntryErrorKind::InvalidKey {
                BackendError::InvalidKey(key.to_string())
            } else {
                BackendError::Unavailable(e.to_string())
            }
        })?;
        match entry {
            Some(entry) if entry.operation == kv::Operation::Put => Ok(entry),
            _ => Err(BackendError::KeyNotFound(key.to_string())),
        }
    }
}

#[async_trait]
impl KvBucket for JetStreamBucket {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get(&self, key: &str) -> Result<KvEntry, BackendError> {
        self.ensure_open()?;
        let entry = self.live_entry(key).await?;
        let created = DateTime::<Utc>::from_timestamp(
            entry.created.unix_timestamp(),
            entry.created.nanosecond(),
        )
        .unwrap_or_else(Utc::now);
        Ok(KvEntry {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            value: entry.value,
            revision: entry.revision,
            created,
        })
    }

    async fn create(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<u64, BackendError> {
        self.ensure_open()?;
        if let Some(ttl) = ttl {
            return Err(BackendError::Unsupported(format!(
                "per-entry ttl ({:?}) on bucket {}",
                ttl, self.bucket
            )));
        }
        self.store.create(key, value).await.map_err(|e| match e.kind() {
            kv::CreateErrorKind::AlreadyExists => BackendError::KeyExists(key.to_string()),
            kv::CreateErrorKind::InvalidKey => BackendError::InvalidKey(key.to_string()),
            _ => BackendError::Unavailable(e.to_string()),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.ensure_open()?;
        // the server writes a delete marker for absent keys too
        self.live_entry(key).await?;
        self.store
            .delete(key)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))
    }

    async fn status(&self) -> Result<BucketStatus, BackendError> {
        self.ensure_open()?;
        let status = self
            .store
            .status()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(BucketStatus {
            bucket: self.bucket.clone(),
            values: status.values(),
            history: u8::try_from(status.history()).unwrap_or(u8::MAX),
            ttl: status.max_age(),
            bytes: status.info.state.bytes,
            storage: match status.info.config.storage {
                stream::StorageType::Memory => StorageType::Memory,
                _ => StorageType::File,
            },
            replicas: i64::try_from(status.info.config.num_replicas).unwrap_or(i64::MAX),
        })
    }
}
