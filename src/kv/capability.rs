//! The key-value capability.
//!
//! Configuration is read in `set_config_map`, the encoding is resolved in
//! `setup`, and the backend connection plus bucket handle are resolved on the
//! first `get`/`set`/`delete`. Resolution happens at most once per instance:
//! concurrent first callers wait on the same attempt, and a failed or
//! cancelled attempt leaves nothing behind so the next call tries again.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::OnceCell;

use super::backend::{BackendError, BucketStatus, KvBucket, KvConnector, KvSession};
use super::config::KvConfig;
use super::error::KvError;
use super::jetstream::JetStreamConnector;
use crate::capabilities::{Capability, CapabilityError, LifecycleState};
use crate::config::ConfigMap;
use crate::context::Context;
use crate::encoding::{self, Encoding, EncodingRegistry};
use crate::events::{Direction, Event, EventRelay, EventTransmitter, RelayIdentity};
use crate::policy::{Authorizer, AuthorizerBinding};

pub const NAME: &str = "nats-kv";
pub const CATEGORY: &str = "kv";
pub const CONTRACT_ID: &str = "capkit:kv";

/// Methods an authorizer may be attached to.
pub const METHODS: [&str; 3] = ["get", "set", "delete"];

struct Resolved {
    session: Arc<dyn KvSession>,
    bucket: Arc<dyn KvBucket>,
}

/// A session opened during resolution. Dropped before [`PendingSession::keep`]
/// (the resolving call timed out or was cancelled), it closes the session in
/// the background.
struct PendingSession {
    session: Arc<dyn KvSession>,
    armed: bool,
}

impl PendingSession {
    fn new(session: Arc<dyn KvSession>) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    fn get(&self) -> &dyn KvSession {
        self.session.as_ref()
    }

    fn keep(mut self) -> Arc<dyn KvSession> {
        self.armed = false;
        Arc::clone(&self.session)
    }
}

impl Drop for PendingSession {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let session = Arc::clone(&self.session);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::debug!("closing session abandoned during bucket resolution");
                handle.spawn(async move { session.close().await });
            }
            Err(_) => log::warn!("session abandoned outside a runtime; left to the backend"),
        }
    }
}

/// Key-value store capability backed by a [`KvConnector`].
pub struct KvCapability {
    cm: ConfigMap,
    config: KvConfig,
    state: LifecycleState,
    connector: Arc<dyn KvConnector>,
    encodings: Arc<EncodingRegistry>,
    encoding: Option<Arc<dyn Encoding>>,
    store: OnceCell<Resolved>,
    relay: EventRelay,
    authorizers: Vec<AuthorizerBinding>,
}

impl std::fmt::Debug for KvCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCapability")
            .field("state", &self.state)
            .field("bucket", &self.config.bucket.bucket)
            .field("encoding", &self.config.encoding)
            .field("resolved", &self.store.initialized())
            .field("relay", &self.relay)
            .finish()
    }
}

impl Default for KvCapability {
    fn default() -> Self {
        Self::new()
    }
}

impl KvCapability {
    /// A prototype that talks to a NATS server through JetStream and uses
    /// the global encoding registry.
    ///
    /// Instances made with [`Capability::new_instance`] share the
    /// prototype's connector. The JetStream connector holds no state, so each
    /// instance opens its own connection.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(JetStreamConnector::new()))
    }

    /// A prototype whose instances connect through `connector`.
    ///
    /// Every instance made from this prototype shares `connector`. With a
    /// [`MemoryBackend`](super::memory::MemoryBackend) that means all of them
    /// read and write the same in-process buckets.
    pub fn with_connector(connector: Arc<dyn KvConnector>) -> Self {
        Self {
            cm: ConfigMap::new(),
            config: KvConfig::default(),
            state: LifecycleState::Unconfigured,
            connector,
            encodings: EncodingRegistry::global(),
            encoding: None,
            store: OnceCell::new(),
            relay: EventRelay::default(),
            authorizers: Vec::new(),
        }
    }

    /// Resolve encodings from `encodings` instead of the global registry.
    pub fn with_encodings(mut self, encodings: Arc<EncodingRegistry>) -> Self {
        self.encodings = encodings;
        self
    }

    /// Parsed configuration.
    pub fn config(&self) -> &KvConfig {
        &self.config
    }

    /// Whether the connection and bucket have been resolved.
    pub fn is_resolved(&self) -> bool {
        self.store.initialized()
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Fetch and decode the value stored under `key`.
    pub async fn get<T: DeserializeOwned>(&self, ctx: &Context, key: &str) -> Result<T, KvError> {
        let encoding = self.encoding()?;
        self.authorize(ctx, "get", key).await?;
        let resolved = self.resolve(ctx).await?;

        let entry = ctx
            .run(resolved.bucket.get(key))
            .await?
            .map_err(KvError::from_backend)?;
        log::debug!("kv get {}/{} rev {}", entry.bucket, key, entry.revision);
        Ok(encoding::decode(encoding.as_ref(), &entry.value)?)
    }

    /// Encode `value` and store it under `key`, failing with
    /// [`KvError::AlreadyExists`] when the key already holds a value.
    ///
    /// A zero `ttl` keeps the bucket's TTL; anything else expires this entry
    /// after `ttl`. Returns the revision assigned by the backend.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<u64, KvError> {
        let encoding = self.encoding()?;
        self.authorize(ctx, "set", key).await?;
        let data = Bytes::from(encoding::encode(encoding.as_ref(), value)?);
        let resolved = self.resolve(ctx).await?;

        let ttl = (!ttl.is_zero()).then_some(ttl);
        let size = data.len();
        let revision = ctx
            .run(resolved.bucket.create(key, data, ttl))
            .await?
            .map_err(KvError::from_backend)?;
        log::debug!(
            "kv set {}/{} rev {} ({} bytes)",
            resolved.bucket.bucket(),
            key,
            revision,
            size
        );

        self.emit(
            Event::new("kv.set")
                .with_header("bucket", resolved.bucket.bucket())
                .with_header("key", key)
                .with_payload(json!({
                    "bucket": resolved.bucket.bucket(),
                    "key": key,
                    "revision": revision,
                    "size": size,
                    "ttl_ms": ttl.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                })),
        );
        Ok(revision)
    }

    /// Delete `key`; [`KvError::NotFound`] when it holds no value.
    pub async fn delete(&self, ctx: &Context, key: &str) -> Result<(), KvError> {
        self.encoding()?;
        self.authorize(ctx, "delete", key).await?;
        let resolved = self.resolve(ctx).await?;

        ctx.run(resolved.bucket.delete(key))
            .await?
            .map_err(KvError::from_backend)?;
        log::debug!("kv delete {}/{}", resolved.bucket.bucket(), key);

        self.emit(
            Event::new("kv.delete")
                .with_header("bucket", resolved.bucket.bucket())
                .with_header("key", key)
                .with_payload(json!({
                    "bucket": resolved.bucket.bucket(),
                    "key": key,
                })),
        );
        Ok(())
    }

    /// Bucket summary from the backend.
    pub async fn status(&self, ctx: &Context) -> Result<BucketStatus, KvError> {
        self.encoding()?;
        let resolved = self.resolve(ctx).await?;
        ctx.run(resolved.bucket.status())
            .await?
            .map_err(KvError::Backend)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn encoding(&self) -> Result<Arc<dyn Encoding>, KvError> {
        self.encoding.clone().ok_or(KvError::NotSetUp)
    }

    async fn resolve(&self, ctx: &Context) -> Result<&Resolved, KvError> {
        if let Some(resolved) = self.store.get() {
            return Ok(resolved);
        }
        ctx.run(self.store.get_or_try_init(|| self.open()))
            .await?
    }

    async fn open(&self) -> Result<Resolved, KvError> {
        let connect = &self.config.connect;
        let wanted = &self.config.bucket;

        log::info!(
            "connecting to {} as {} for bucket {}",
            connect.url,
            connect.client_name,
            wanted.bucket
        );
        let session = PendingSession::new(
            self.connector
                .connect(connect)
                .await
                .map_err(KvError::NotResolved)?,
        );

        let bucket = match session.get().key_value(&wanted.bucket).await {
            Ok(bucket) => Ok(bucket),
            Err(BackendError::BucketNotFound(_)) => {
                log::info!(
                    "creating bucket {} (storage={}, history={}, replicas={})",
                    wanted.bucket,
                    wanted.storage,
                    wanted.history,
                    wanted.replicas
                );
                session.get().create_key_value(wanted).await
            }
            Err(e) => Err(e),
        };

        match bucket {
            Ok(bucket) => Ok(Resolved {
                session: session.keep(),
                bucket,
            }),
            Err(e) => {
                log::warn!("bucket {} not resolved: {}", wanted.bucket, e);
                session.keep().close().await;
                Err(KvError::NotResolved(e))
            }
        }
    }

    async fn authorize(&self, ctx: &Context, method: &str, key: &str) -> Result<(), KvError> {
        let bindings: Vec<&AuthorizerBinding> =
            self.authorizers.iter().filter(|b| b.method == method).collect();
        if bindings.is_empty() {
            return Ok(());
        }

        let metadata = HashMap::from([
            ("contract_id".to_string(), CONTRACT_ID.to_string()),
            ("bucket".to_string(), self.config.bucket.bucket.clone()),
            ("key".to_string(), key.to_string()),
        ]);
        for binding in bindings {
            let allowed = ctx
                .run(binding.authorizer.is_authorized(&binding.expression, method, &metadata))
                .await?;
            if !allowed {
                log::warn!("kv {} on {} denied by {:?}", method, key, binding.expression);
                return Err(KvError::Unauthorized {
                    method: method.to_string(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    fn emit(&self, event: Event) {
        self.relay.transmit(
            self.identity(),
            Direction::Output,
            CONTRACT_ID,
            event.with_source(CONTRACT_ID),
        );
    }

    fn identity(&self) -> RelayIdentity<'_> {
        RelayIdentity {
            name: NAME,
            version: crate::VERSION,
            contract_id: CONTRACT_ID,
        }
    }
}

#[async_trait]
impl Capability for KvCapability {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        crate::VERSION
    }

    fn category(&self) -> &str {
        CATEGORY
    }

    fn contract_id(&self) -> &str {
        CONTRACT_ID
    }

    fn new_instance(&self) -> Box<dyn Capability> {
        Box::new(
            KvCapability::with_connector(Arc::clone(&self.connector))
                .with_encodings(Arc::clone(&self.encodings)),
        )
    }

    fn state(&self) -> LifecycleState {
        self.state
    }

    fn set_config_map(&mut self, cm: ConfigMap) -> Result<(), CapabilityError> {
        if !self.state.accepts_config() {
            return Err(CapabilityError::InvalidTransition {
                from: self.state,
                to: LifecycleState::Configured,
            });
        }
        self.config = KvConfig::from_config_map(&cm)?;
        self.cm = cm;
        self.state = LifecycleState::Configured;
        Ok(())
    }

    fn config_map(&self) -> &ConfigMap {
        &self.cm
    }

    async fn setup(&mut self) -> Result<(), CapabilityError> {
        match self.state {
            LifecycleState::Unconfigured => {
                return Err(CapabilityError::InvalidTransition {
                    from: self.state,
                    to: LifecycleState::SetUp,
                })
            }
            state if state.is_set_up() => return Ok(()),
            _ => {}
        }

        let name = &self.config.encoding;
        let encoding = self
            .encodings
            .get(name)
            .ok_or_else(|| CapabilityError::EncodingNotFound(name.clone()))?;
        log::debug!(
            "kv capability set up: bucket={}, encoding={} ({})",
            self.config.bucket.bucket,
            encoding.name(),
            encoding.content_type()
        );
        self.encoding = Some(encoding);
        self.state = LifecycleState::SetUp;
        Ok(())
    }

    async fn start(&mut self, _ctx: &Context) -> Result<(), CapabilityError> {
        if !self.state.is_set_up() {
            return Err(CapabilityError::InvalidTransition {
                from: self.state,
                to: LifecycleState::Running,
            });
        }
        self.state = LifecycleState::Running;
        Ok(())
    }

    async fn stop(&mut self, ctx: &Context) -> Result<(), CapabilityError> {
        if let Some(resolved) = self.store.take() {
            log::info!("closing connection for bucket {}", resolved.bucket.bucket());
            ctx.run(resolved.session.close()).await?;
        }
        if self.state.is_set_up() {
            self.state = LifecycleState::Stopped;
        }
        Ok(())
    }

    fn set_event_transmitter(
        &mut self,
        transmitter: Option<Arc<dyn EventTransmitter>>,
    ) -> Result<(), CapabilityError> {
        self.relay.set(transmitter);
        Ok(())
    }

    fn event_transmitter(&self) -> Option<Arc<dyn EventTransmitter>> {
        self.relay.get()
    }

    fn transmit_input_event(&self, contract_id: &str, event: Event) -> Result<(), CapabilityError> {
        self.relay
            .transmit(self.identity(), Direction::Input, contract_id, event);
        Ok(())
    }

    fn transmit_output_event(&self, contract_id: &str, event: Event) -> Result<(), CapabilityError> {
        self.relay
            .transmit(self.identity(), Direction::Output, contract_id, event);
        Ok(())
    }

    fn add_authorizer(
        &mut self,
        authorizer: Arc<dyn Authorizer>,
        expression: &str,
        method: &str,
    ) -> Result<(), CapabilityError> {
        if !METHODS.contains(&method) {
            return Err(CapabilityError::UnknownMethod(method.to_string()));
        }
        self.authorizers.push(AuthorizerBinding {
            authorizer,
            expression: expression.to_string(),
            method: method.to_string(),
        });
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
