//! In-process key-value backend.
//!
//! `MemoryBackend` behaves like a single key-value server: buckets outlive
//! the sessions that created them, every write gets a bucket-wide revision,
//! and history, TTL and size limits are enforced the way a real server
//! enforces them. Clones share the same server state.
//!
//! Test hooks: [`set_available`](MemoryBackend::set_available) simulates an
//! unreachable server, [`set_latency`](MemoryBackend::set_latency) slows every
//! call down, and the counters report how many connections and bucket
//! creations happened.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::time::Instant;

use super::backend::{BackendError, BucketStatus, KvBucket, KvConnector, KvEntry, KvSession};
use super::config::{BucketConfig, ConnectOptions};

static KEY_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[-/_=\.a-zA-Z0-9]+$").unwrap());
static BUCKET_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap());

/// Whether `key` is acceptable to the backend.
pub fn is_valid_key(key: &str) -> bool {
    KEY_PATTERN.is_match(key) && !key.starts_with('.') && !key.ends_with('.')
}

/// Whether `bucket` is an acceptable bucket name.
pub fn is_valid_bucket_name(bucket: &str) -> bool {
    BUCKET_PATTERN.is_match(bucket)
}

fn validate_key(key: &str) -> Result<(), BackendError> {
    if is_valid_key(key) {
        Ok(())
    } else {
        Err(BackendError::InvalidKey(key.to_string()))
    }
}

fn validate_bucket(bucket: &str) -> Result<(), BackendError> {
    if is_valid_bucket_name(bucket) {
        Ok(())
    } else {
        Err(BackendError::InvalidBucketName(bucket.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    buckets: Mutex<HashMap<String, Arc<BucketState>>>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    connections: AtomicUsize,
    open_sessions: AtomicUsize,
    bucket_creations: AtomicUsize,
    last_connect: Mutex<Option<ConnectOptions>>,
}

impl ServerState {
    async fn round_trip(&self) -> Result<(), BackendError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("no servers available for connection".into()));
        }
        Ok(())
    }

    fn create_bucket(&self, config: &BucketConfig) -> Result<Arc<BucketState>, BackendError> {
        validate_bucket(&config.bucket)?;
        let mut buckets = self.buckets.lock();
        if let Some(existing) = buckets.get(&config.bucket) {
            if existing.config == *config {
                return Ok(Arc::clone(existing));
            }
            return Err(BackendError::Other(format!(
                "bucket {} already exists with a different configuration",
                config.bucket
            )));
        }
        let state = Arc::new(BucketState {
            config: config.clone(),
            data: Mutex::new(BucketData::default()),
        });
        buckets.insert(config.bucket.clone(), Arc::clone(&state));
        self.bucket_creations.fetch_add(1, Ordering::SeqCst);
        log::debug!("memory backend created bucket {}", config.bucket);
        Ok(state)
    }
}

struct BucketState {
    config: BucketConfig,
    data: Mutex<BucketData>,
}

#[derive(Default)]
struct BucketData {
    keys: HashMap<String, VecDeque<Record>>,
    last_revision: u64,
}

#[derive(Debug, Clone)]
struct Record {
    value: Bytes,
    revision: u64,
    created: DateTime<Utc>,
    expires_at: Option<Instant>,
    deleted: bool,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        !self.deleted && self.expires_at.map_or(true, |at| now < at)
    }
}

impl BucketData {
    fn purge_expired(&mut self, now: Instant) {
        for records in self.keys.values_mut() {
            records.retain(|r| r.expires_at.map_or(true, |at| now < at));
        }
        self.keys.retain(|_, records| !records.is_empty());
    }

    fn live(&self, key: &str, now: Instant) -> Option<&Record> {
        self.keys
            .get(key)
            .and_then(|records| records.back())
            .filter(|r| r.is_live(now))
    }

    fn stored_bytes(&self) -> u64 {
        self.keys
            .values()
            .flat_map(|records| records.iter())
            .map(|r| r.value.len() as u64)
            .sum()
    }

    fn append(&mut self, key: &str, record: Record, depth: usize) {
        let records = self.keys.entry(key.to_string()).or_default();
        records.push_back(record);
        while records.len() > depth {
            records.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// In-memory key-value server.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    server: Arc<ServerState>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("buckets", &self.bucket_names())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle reachability. While unavailable, every call fails with
    /// [`BackendError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.server.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.server.latency.lock() = latency;
    }

    /// Connections ever opened.
    pub fn connection_count(&self) -> usize {
        self.server.connections.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.server.open_sessions.load(Ordering::SeqCst)
    }

    /// Buckets ever created.
    pub fn bucket_creation_count(&self) -> usize {
        self.server.bucket_creations.load(Ordering::SeqCst)
    }

    /// Options passed to the most recent `connect`.
    pub fn last_connect_options(&self) -> Option<ConnectOptions> {
        self.server.last_connect.lock().clone()
    }

    /// Configuration the bucket was created with.
    pub fn bucket_config(&self, bucket: &str) -> Option<BucketConfig> {
        self.server
            .buckets
            .lock()
            .get(bucket)
            .map(|state| state.config.clone())
    }

    /// Existing bucket names, sorted.
    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.server.buckets.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Provision a bucket out of band, as an operator would.
    pub fn create_bucket(&self, config: &BucketConfig) -> Result<(), BackendError> {
        self.server.create_bucket(config).map(|_| ())
    }
}

#[async_trait]
impl KvConnector for MemoryBackend {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn KvSession>, BackendError> {
        self.server.round_trip().await?;
        if options.url.trim().is_empty() {
            return Err(BackendError::Unavailable("empty server url".into()));
        }

        self.server.connections.fetch_add(1, Ordering::SeqCst);
        self.server.open_sessions.fetch_add(1, Ordering::SeqCst);
        *self.server.last_connect.lock() = Some(options.clone());
        log::debug!(
            "memory backend accepted connection from {} ({})",
            options.client_name,
            options.url
        );

        Ok(Arc::new(MemorySession {
            server: Arc::clone(&self.server),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MemorySession {
    server: Arc<ServerState>,
    closed: Arc<AtomicBool>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    fn handle(&self, state: Arc<BucketState>) -> Arc<dyn KvBucket> {
        Arc::new(MemoryBucket {
            server: Arc::clone(&self.server),
            state,
            closed: Arc::clone(&self.closed),
        })
    }
}

#[async_trait]
impl KvSession for MemorySession {
    async fn key_value(&self, bucket: &str) -> Result<Arc<dyn KvBucket>, BackendError> {
        self.ensure_open()?;
        validate_bucket(bucket)?;
        self.server.round_trip().await?;
        let state = self
            .server
            .buckets
            .lock()
            .get(bucket)
            .cloned()
            .ok_or_else(|| BackendError::BucketNotFound(bucket.to_string()))?;
        Ok(self.handle(state))
    }

    async fn create_key_value(&self, config: &BucketConfig) -> Result<Arc<dyn KvBucket>, BackendError> {
        self.ensure_open()?;
        self.server.round_trip().await?;
        let state = self.server.create_bucket(config)?;
        Ok(self.handle(state))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct MemoryBucket {
    server: Arc<ServerState>,
    state: Arc<BucketState>,
    closed: Arc<AtomicBool>,
}

impl MemoryBucket {
    async fn enter(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        self.server.round_trip().await
    }

    fn depth(&self) -> usize {
        usize::from(self.state.config.history.max(1))
    }
}

#[async_trait]
impl KvBucket for MemoryBucket {
    fn bucket(&self) -> &str {
        &self.state.config.bucket
    }

    async fn get(&self, key: &str) -> Result<KvEntry, BackendError> {
        validate_key(key)?;
        self.enter().await?;

        let now = Instant::now();
        let data = self.state.data.lock();
        let record = data
            .live(key, now)
            .ok_or_else(|| BackendError::KeyNotFound(key.to_string()))?;
        Ok(KvEntry {
            bucket: self.state.config.bucket.clone(),
            key: key.to_string(),
            value: record.value.clone(),
            revision: record.revision,
            created: record.created,
        })
    }

    async fn create(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<u64, BackendError> {
        validate_key(key)?;
        let config = &self.state.config;
        if config.max_value_size > 0 && value.len() > config.max_value_size as usize {
            return Err(BackendError::ValueTooLarge {
                size: value.len(),
                max: config.max_value_size as usize,
            });
        }
        self.enter().await?;

        let now = Instant::now();
        let mut data = self.state.data.lock();
        data.purge_expired(now);
        if data.live(key, now).is_some() {
            return Err(BackendError::KeyExists(key.to_string()));
        }
        if config.max_bytes > 0 && data.stored_bytes() + value.len() as u64 > config.max_bytes as u64 {
            return Err(BackendError::BucketFull(config.bucket.clone()));
        }

        // a ttl past the representable range never expires
        let expires_at = ttl
            .or(Some(config.ttl).filter(|d| !d.is_zero()))
            .and_then(|d| now.checked_add(d));
        data.last_revision += 1;
        let revision = data.last_revision;
        let depth = self.depth();
        data.append(
            key,
            Record {
                value,
                revision,
                created: Utc::now(),
                expires_at,
                deleted: false,
            },
            depth,
        );
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        validate_key(key)?;
        self.enter().await?;

        let now = Instant::now();
        let mut data = self.state.data.lock();
        data.purge_expired(now);
        if data.live(key, now).is_none() {
            return Err(BackendError::KeyNotFound(key.to_string()));
        }
        data.last_revision += 1;
        let revision = data.last_revision;
        let depth = self.depth();
        data.append(
            key,
            Record {
                value: Bytes::new(),
                revision,
                created: Utc::now(),
                expires_at: None,
                deleted: true,
            },
            depth,
        );
        Ok(())
    }

    async fn status(&self) -> Result<BucketStatus, BackendError> {
        self.enter().await?;

        let now = Instant::now();
        let mut data = self.state.data.lock();
        data.purge_expired(now);
        let values = data
            .keys
            .keys()
            .filter(|key| data.live(key, now).is_some())
            .count() as u64;
        let config = &self.state.config;
        Ok(BucketStatus {
            bucket: config.bucket.clone(),
            values,
            history: config.history.max(1),
            ttl: config.ttl,
            bytes: data.stored_bytes(),
            storage: config.storage,
            replicas: config.replicas.max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(backend: &MemoryBackend, config: BucketConfig) -> Arc<dyn KvBucket> {
        let session = backend.connect(&ConnectOptions::default()).await.unwrap();
        match session.key_value(&config.bucket).await {
            Ok(bucket) => bucket,
            Err(BackendError::BucketNotFound(_)) => session.create_key_value(&config).await.unwrap(),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_key_validation() {
        assert!(is_valid_key("order-1"));
        assert!(is_valid_key("a/b_c=d.e"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key(".hidden"));
        assert!(!is_valid_key("trailing."));
        assert!(!is_valid_key("has space"));
        assert!(!is_valid_key("wild*"));
    }

    #[test]
    fn test_bucket_name_validation() {
        assert!(is_valid_bucket_name("orders"));
        assert!(is_valid_bucket_name("my_bucket-2"));
        assert!(!is_valid_bucket_name("with.dot"));
        assert!(!is_valid_bucket_name(""));
    }

    #[tokio::test]
    async fn test_missing_bucket_then_create() {
        let backend = MemoryBackend::new();
        let session = backend.connect(&ConnectOptions::default()).await.unwrap();
        let err = session.key_value("orders").await.err().unwrap();
        assert_eq!(err, BackendError::BucketNotFound("orders".into()));

        session
            .create_key_value(&BucketConfig::named("orders"))
            .await
            .unwrap();
        assert!(session.key_value("orders").await.is_ok());
        assert_eq!(backend.bucket_creation_count(), 1);
    }

    #[tokio::test]
    async fn test_create_only_and_recreate_after_delete() {
        let backend = MemoryBackend::new();
        let bucket = open(&backend, BucketConfig::named("b")).await;

        let r1 = bucket.create("k", Bytes::from_static(b"1"), None).await.unwrap();
        let err = bucket.create("k", Bytes::from_static(b"2"), None).await.unwrap_err();
        assert_eq!(err, BackendError::KeyExists("k".into()));
        assert_eq!(bucket.get("k").await.unwrap().value, Bytes::from_static(b"1"));

        bucket.delete("k").await.unwrap();
        assert_eq!(bucket.get("k").await.unwrap_err(), BackendError::KeyNotFound("k".into()));
        assert_eq!(bucket.delete("k").await.unwrap_err(), BackendError::KeyNotFound("k".into()));

        let r2 = bucket.create("k", Bytes::from_static(b"3"), None).await.unwrap();
        assert!(r2 > r1);
    }

    #[tokio::test]
    async fn test_history_is_trimmed() {
        let backend = MemoryBackend::new();
        let bucket = open(&backend, BucketConfig::named("h")).await;
        for _ in 0..5 {
            bucket.create("k", Bytes::from_static(b"v"), None).await.unwrap();
            bucket.delete("k").await.unwrap();
        }
        let status = bucket.status().await.unwrap();
        assert_eq!(status.values, 0);
        assert_eq!(status.history, 1);
        assert_eq!(status.bytes, 0);
    }

    #[tokio::test]
    async fn test_per_entry_ttl_expires() {
        let backend = MemoryBackend::new();
        let bucket = open(&backend, BucketConfig::named("ttl")).await;
        bucket
            .create("short", Bytes::from_static(b"v"), Some(Duration::from_millis(30)))
            .await
            .unwrap();
        bucket.create("long", Bytes::from_static(b"v"), None).await.unwrap();
        assert!(bucket.get("short").await.is_ok());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(bucket.get("short").await, Err(BackendError::KeyNotFound(_))));
        assert!(bucket.get("long").await.is_ok());
        // An expired key may be created again.
        bucket.create("short", Bytes::from_static(b"w"), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_bucket_ttl_applies_by_default() {
        let backend = MemoryBackend::new();
        let config = BucketConfig {
            ttl: Duration::from_millis(30),
            ..BucketConfig::named("bttl")
        };
        let bucket = open(&backend, config).await;
        bucket.create("k", Bytes::from_static(b"v"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(bucket.get("k").await.is_err());
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_never_expires() {
        let backend = MemoryBackend::new();
        let config = BucketConfig {
            ttl: Duration::from_secs(u64::MAX),
            ..BucketConfig::named("forever")
        };
        let bucket = open(&backend, config).await;

        let first = bucket
            .create("a", Bytes::from_static(b"v"), Some(Duration::MAX))
            .await
            .unwrap();
        let second = bucket.create("b", Bytes::from_static(b"v"), None).await.unwrap();
        assert_eq!(second, first + 1);
        assert!(bucket.get("a").await.is_ok());
        assert!(bucket.get("b").await.is_ok());
        assert_eq!(bucket.status().await.unwrap().values, 2);
    }

    #[tokio::test]
    async fn test_size_limits() {
        let backend = MemoryBackend::new();
        let config = BucketConfig {
            max_value_size: 4,
            max_bytes: 6,
            ..BucketConfig::named("small")
        };
        let bucket = open(&backend, config).await;

        let err = bucket.create("a", Bytes::from_static(b"12345"), None).await.unwrap_err();
        assert_eq!(err, BackendError::ValueTooLarge { size: 5, max: 4 });

        bucket.create("a", Bytes::from_static(b"1234"), None).await.unwrap();
        let err = bucket.create("b", Bytes::from_static(b"123"), None).await.unwrap_err();
        assert_eq!(err, BackendError::BucketFull("small".into()));
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let backend = MemoryBackend::new();
        let bucket = open(&backend, BucketConfig::named("b")).await;
        let err = bucket.create(".bad", Bytes::new(), None).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_unavailable_and_closed() {
        let backend = MemoryBackend::new();
        let session = backend.connect(&ConnectOptions::default()).await.unwrap();
        let bucket = session
            .create_key_value(&BucketConfig::named("b"))
            .await
            .unwrap();
        assert_eq!(backend.open_sessions(), 1);

        backend.set_available(false);
        assert!(matches!(
            backend.connect(&ConnectOptions::default()).await,
            Err(BackendError::Unavailable(_))
        ));
        assert!(matches!(bucket.get("k").await, Err(BackendError::Unavailable(_))));
        backend.set_available(true);

        session.close().await;
        assert_eq!(backend.open_sessions(), 0);
        assert_eq!(bucket.get("k").await.unwrap_err(), BackendError::Closed);
    }

    #[tokio::test]
    async fn test_conflicting_bucket_config() {
        let backend = MemoryBackend::new();
        backend.create_bucket(&BucketConfig::named("b")).unwrap();
        let other = BucketConfig {
            history: 9,
            ..BucketConfig::named("b")
        };
        assert!(matches!(backend.create_bucket(&other), Err(BackendError::Other(_))));
        assert_eq!(backend.bucket_config("b").unwrap().history, 0);
    }
}
