//! # Key-value capability
//!
//! A config-driven key-value store over a persistent bucket.
//!
//! ```text
//! KvCapability ──► KvConnector ──► KvSession ──► KvBucket
//!   (encoding)       connect()     key_value()     get / create / delete
//!                                  create_key_value()
//! ```
//!
//! The bucket is opened if it exists and created with the configured
//! attributes if it does not. An existing bucket is never reconfigured.

pub mod backend;
pub mod capability;
pub mod config;
pub mod error;
pub mod jetstream;
pub mod memory;

pub use backend::{BackendError, BucketStatus, KvBucket, KvConnector, KvEntry, KvSession};
pub use capability::KvCapability;
pub use config::{BucketConfig, ConnectOptions, KvConfig, StorageType};
pub use error::KvError;
pub use jetstream::JetStreamConnector;
pub use memory::MemoryBackend;
