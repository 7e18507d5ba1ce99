//! Host manifests.
//!
//! A manifest names the capabilities a host runs and the configuration each
//! one receives:
//!
//! ```yaml
//! name: orders
//! version: "1"
//! capabilities:
//!   - contract_id: capkit:nats-server
//!     values:
//!       port: 4222
//!       jetstream: true
//!   - contract_id: capkit:kv
//!     values:
//!       kv_bucket: orders
//!       kv_bucket_ttl: 24h
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigMap;

/// Errors raised while loading a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// One capability to instantiate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub contract_id: String,
    #[serde(default)]
    pub values: ConfigMap,
}

impl ManifestEntry {
    pub fn new(contract_id: impl Into<String>, values: ConfigMap) -> Self {
        Self {
            contract_id: contract_id.into(),
            values,
        }
    }
}

/// The capabilities a host runs, in start order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<ManifestEntry>,
}

impl Manifest {
    /// Parse and validate a manifest from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_yaml::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read, parse and validate a manifest file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let manifest = Self::from_yaml_str(&content)?;
        log::debug!(
            "loaded manifest {} from {} ({} capabilities)",
            manifest.name,
            path.display(),
            manifest.capabilities.len()
        );
        Ok(manifest)
    }

    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// A manifest must name itself and list at least one capability, each
    /// contract id at most once.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.name.trim().is_empty() {
            return Err(ManifestError::Validation("manifest name is empty".into()));
        }
        if self.capabilities.is_empty() {
            return Err(ManifestError::Validation(format!(
                "manifest {} lists no capabilities",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for (i, entry) in self.capabilities.iter().enumerate() {
            if entry.contract_id.trim().is_empty() {
                return Err(ManifestError::Validation(format!(
                    "capability #{} has no contract_id",
                    i
                )));
            }
            if !seen.insert(entry.contract_id.as_str()) {
                return Err(ManifestError::Validation(format!(
                    "capability {} listed twice",
                    entry.contract_id
                )));
            }
        }
        Ok(())
    }

    pub fn entry(&self, contract_id: &str) -> Option<&ManifestEntry> {
        self.capabilities
            .iter()
            .find(|e| e.contract_id == contract_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const ORDERS: &str = r#"
name: orders
version: "1"
capabilities:
  - contract_id: capkit:nats-server
    values:
      port: 4333
      jetstream: true
      routes: [nats://a:6222, nats://b:6222]
  - contract_id: capkit:kv
    values:
      kv_bucket: orders
      kv_bucket_ttl: 24h
      kv_bucket_history: "5"
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = Manifest::from_yaml_str(ORDERS).unwrap();
        assert_eq!(manifest.name, "orders");
        assert_eq!(manifest.version, "1");
        assert_eq!(manifest.capabilities.len(), 2);
        assert_eq!(manifest.capabilities[0].contract_id, "capkit:nats-server");

        let server = &manifest.capabilities[0].values;
        assert_eq!(server.int("port", 0), 4333);
        assert!(server.bool("jetstream", false));
        assert_eq!(
            server.string_list("routes", &[]),
            vec!["nats://a:6222", "nats://b:6222"]
        );

        let kv = &manifest.entry("capkit:kv").unwrap().values;
        assert_eq!(kv.string("kv_bucket", ""), "orders");
        assert_eq!(
            kv.duration("kv_bucket_ttl", Duration::ZERO),
            Duration::from_secs(86_400)
        );
        assert_eq!(kv.uint8("kv_bucket_history", 1), 5);
    }

    #[test]
    fn test_values_default_to_empty() {
        let manifest =
            Manifest::from_yaml_str("name: bare\ncapabilities:\n  - contract_id: capkit:kv\n")
                .unwrap();
        assert!(manifest.capabilities[0].values.is_empty());
        assert_eq!(manifest.version, "");
    }

    #[test]
    fn test_validation() {
        let err = Manifest::from_yaml_str("name: empty\n").unwrap_err();
        assert!(matches!(err, ManifestError::Validation(_)));

        let err = Manifest::from_yaml_str(
            "name: dup\ncapabilities:\n  - contract_id: capkit:kv\n  - contract_id: capkit:kv\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("listed twice"));

        let err = Manifest::from_yaml_str("name: \"\"\ncapabilities:\n  - contract_id: x\n")
            .unwrap_err();
        assert!(matches!(err, ManifestError::Validation(_)));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = Manifest::from_yaml_str("name: [unterminated").unwrap_err();
        assert!(matches!(err, ManifestError::Yaml(_)));
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.yaml");
        std::fs::write(&path, ORDERS).unwrap();

        let manifest = Manifest::from_path(&path).unwrap();
        assert_eq!(manifest.capabilities.len(), 2);

        let missing = Manifest::from_path(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(missing, ManifestError::Io(_)));
    }

    #[test]
    fn test_yaml_output_reloads() {
        let manifest = Manifest::from_yaml_str(ORDERS).unwrap();
        let reloaded = Manifest::from_yaml_str(&manifest.to_yaml().unwrap()).unwrap();
        assert_eq!(reloaded, manifest);
    }
}
