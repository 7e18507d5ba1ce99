//! capkit host binary.
//!
//! Loads a manifest, sets up every capability it lists, starts them and
//! runs until Ctrl-C, then stops them in reverse order.
//!
//! # Environment Variables
//!
//! - `CAPKIT_MANIFEST`: path to the YAML manifest (default: `capkit.yaml`)
//! - `CAPKIT_STOP_TIMEOUT`: shutdown deadline, e.g. `30s` (default: 30s)
//! - `RUST_LOG`: tracing filter (default: "info,capkit=debug")
//!
//! # Usage
//!
//! ```bash
//! CAPKIT_MANIFEST=deploy/orders.yaml cargo run --bin capkit-host
//! ```

use std::time::Duration;

use anyhow::Context as _;
use capkit::config::parse_duration;
use capkit::{CapabilityRegistry, Context, Host, Manifest};

const DEFAULT_MANIFEST: &str = "capkit.yaml";
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,capkit=debug".into()),
        )
        .init();

    let manifest_path =
        std::env::var("CAPKIT_MANIFEST").unwrap_or_else(|_| DEFAULT_MANIFEST.to_string());
    let stop_timeout = match std::env::var("CAPKIT_STOP_TIMEOUT") {
        Ok(raw) => parse_duration(&raw).context("invalid CAPKIT_STOP_TIMEOUT")?,
        Err(_) => DEFAULT_STOP_TIMEOUT,
    };

    let manifest = Manifest::from_path(&manifest_path)
        .with_context(|| format!("loading manifest {}", manifest_path))?;

    let registry = CapabilityRegistry::global();
    capkit::register_builtin(registry);
    tracing::info!(
        "capkit host {} ({}), registered: {:?}",
        manifest.name,
        capkit::VERSION,
        registry.contract_ids()
    );

    let mut host = Host::from_manifest(registry, &manifest)
        .await
        .context("capability setup failed")?;

    let ctx = Context::background();
    host.start_all(&ctx)
        .await
        .context("capability start failed")?;
    tracing::info!("{} capabilities running, press Ctrl-C to stop", host.len());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("shutting down");

    host.stop_all(&Context::with_timeout(stop_timeout))
        .await
        .context("capability stop failed")?;
    tracing::info!("stopped");
    Ok(())
}
