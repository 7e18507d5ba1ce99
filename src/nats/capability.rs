//! The message-bus server capability.
//!
//! `setup` validates the options and renders a server configuration;
//! `start` writes it out and launches `nats-server -c <file>`; `stop` shuts
//! the process down and removes the generated file.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::options::ServerOptions;
use crate::capabilities::{Capability, CapabilityError, LifecycleState};
use crate::config::ConfigMap;
use crate::context::Context;
use crate::events::{Direction, Event, EventRelay, EventTransmitter, RelayIdentity};
use crate::process::{ProcessError, ProcessLauncher, ProcessSlot, ProcessSpec, TokioProcessLauncher};

pub const NAME: &str = "nats-server";
pub const CATEGORY: &str = "server";
pub const CONTRACT_ID: &str = "capkit:nats-server";

pub const DEFAULT_BINARY: &str = "nats-server";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Runs a `nats-server` process configured from the capability's
/// [`ConfigMap`].
pub struct NatsCapability {
    cm: ConfigMap,
    options: ServerOptions,
    binary: String,
    shutdown_grace: Duration,
    state: LifecycleState,
    launcher: Arc<dyn ProcessLauncher>,
    runtime_dir: PathBuf,
    server_config: Option<Value>,
    config_path: Option<PathBuf>,
    spec: Option<ProcessSpec>,
    process: ProcessSlot,
    relay: EventRelay,
}

impl std::fmt::Debug for NatsCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsCapability")
            .field("state", &self.state)
            .field("binary", &self.binary)
            .field("port", &self.options.port)
            .field("process", &self.process)
            .finish()
    }
}

impl Default for NatsCapability {
    fn default() -> Self {
        Self::new()
    }
}

impl NatsCapability {
    pub fn new() -> Self {
        Self::with_launcher(Arc::new(TokioProcessLauncher))
    }

    /// A prototype whose instances start processes through `launcher`.
    pub fn with_launcher(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            cm: ConfigMap::new(),
            options: ServerOptions::default(),
            binary: DEFAULT_BINARY.to_string(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            state: LifecycleState::Unconfigured,
            launcher,
            runtime_dir: std::env::temp_dir(),
            server_config: None,
            config_path: None,
            spec: None,
            process: ProcessSlot::new(),
            relay: EventRelay::default(),
        }
    }

    /// Directory generated configuration files are written to.
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// The rendered server configuration, once set up. `None` when an
    /// explicit `config_file` is used.
    pub fn server_config(&self) -> Option<&Value> {
        self.server_config.as_ref()
    }

    /// The command line `start` runs, once set up.
    pub fn process_spec(&self) -> Option<&ProcessSpec> {
        self.spec.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    async fn write_server_config(&self) -> Result<(), CapabilityError> {
        let (Some(conf), Some(path)) = (&self.server_config, &self.config_path) else {
            return Ok(());
        };
        let body = serde_json::to_vec_pretty(conf)
            .map_err(|e| CapabilityError::Setup(format!("rendering server config: {}", e)))?;
        tokio::fs::write(path, body)
            .await
            .map_err(ProcessError::from)?;
        log::debug!("wrote server config to {}", path.display());
        Ok(())
    }

    async fn remove_server_config(&self) {
        let Some(path) = &self.config_path else {
            return;
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => log::debug!("removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("could not remove {}: {}", path.display(), e),
        }
    }

    fn identity(&self) -> RelayIdentity<'_> {
        RelayIdentity {
            name: NAME,
            version: crate::VERSION,
            contract_id: CONTRACT_ID,
        }
    }
}

fn server_spec(binary: &str, config: &Path, quiet: bool) -> ProcessSpec {
    ProcessSpec::new(binary)
        .arg("-c")
        .arg(config.to_string_lossy())
        .quiet(quiet)
}

#[async_trait]
impl Capability for NatsCapability {
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
            NatsCapability::with_launcher(Arc::clone(&self.launcher))
                .with_runtime_dir(self.runtime_dir.clone()),
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
        self.options = ServerOptions::from_config_map(&cm);
        self.binary = cm.string("binary", DEFAULT_BINARY);
        self.shutdown_grace = cm.duration("shutdown_grace", DEFAULT_SHUTDOWN_GRACE);
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
        if self.binary.trim().is_empty() {
            return Err(CapabilityError::Setup("server binary not configured".into()));
        }

        let spec = if self.options.config_file.is_empty() {
            self.options.validate()?;
            let path = self
                .runtime_dir
                .join(format!("capkit-nats-{}.conf", Uuid::new_v4()));
            let spec = server_spec(&self.binary, &path, self.options.no_log);
            self.server_config = Some(self.options.to_server_config());
            self.config_path = Some(path);
            spec
        } else {
            server_spec(
                &self.binary,
                Path::new(&self.options.config_file),
                self.options.no_log,
            )
        };

        log::debug!("nats server prepared: {}", spec.command_line());
        self.spec = Some(spec);
        self.state = LifecycleState::SetUp;
        Ok(())
    }

    async fn start(&mut self, ctx: &Context) -> Result<(), CapabilityError> {
        if !self.state.is_set_up() {
            return Err(CapabilityError::InvalidTransition {
                from: self.state,
                to: LifecycleState::Running,
            });
        }
        let Some(spec) = self.spec.clone() else {
            return Err(CapabilityError::Setup("server command not prepared".into()));
        };

        self.write_server_config().await?;
        let launched = ctx
            .run(self.process.start(self.launcher.as_ref(), &spec))
            .await??;
        if launched {
            log::info!(
                "nats server started on {}:{} (pid {:?})",
                self.options.host,
                self.options.port,
                self.process.pid()
            );
        }
        self.state = LifecycleState::Running;
        Ok(())
    }

    async fn stop(&mut self, ctx: &Context) -> Result<(), CapabilityError> {
        let result = ctx.run(self.process.stop(self.shutdown_grace)).await;
        self.remove_server_config().await;
        if self.state.is_set_up() {
            self.state = LifecycleState::Stopped;
        }
        if let Some(code) = result?? {
            log::info!("nats server exited with code {}", code);
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

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelTransmitter;
    use crate::process::testing::RecordingLauncher;

    fn capability(launcher: &Arc<RecordingLauncher>, dir: &Path) -> NatsCapability {
        NatsCapability::with_launcher(launcher.clone()).with_runtime_dir(dir)
    }

    #[test]
    fn test_identity() {
        let nats = NatsCapability::new();
        assert_eq!(nats.name(), "nats-server");
        assert_eq!(nats.category(), "server");
        assert_eq!(nats.contract_id(), "capkit:nats-server");
    }

    #[tokio::test]
    async fn test_lifecycle_with_generated_config() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = RecordingLauncher::new();
        let mut nats = capability(&launcher, dir.path());
        let ctx = Context::background();

        nats.set_config_map(ConfigMap::from_pairs([
            ("port", "4333"),
            ("jetstream", "true"),
            ("binary", "/opt/nats/nats-server"),
        ]))
        .unwrap();
        nats.setup().await.unwrap();
        assert_eq!(nats.server_config().unwrap()["port"], 4333);

        nats.start(&ctx).await.unwrap();
        assert_eq!(nats.state(), LifecycleState::Running);
        assert!(nats.is_running());

        let launches = launcher.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].program, "/opt/nats/nats-server");
        assert_eq!(launches[0].args[0], "-c");
        let written = std::fs::read(&launches[0].args[1]).unwrap();
        let conf: Value = serde_json::from_slice(&written).unwrap();
        assert_eq!(conf["port"], 4333);
        assert!(conf["jetstream"].is_object());

        nats.stop(&ctx).await.unwrap();
        assert_eq!(nats.state(), LifecycleState::Stopped);
        assert_eq!(launcher.stop_count(), 1);
        assert!(!Path::new(&launches[0].args[1]).exists());
    }

    #[tokio::test]
    async fn test_explicit_config_file_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = RecordingLauncher::new();
        let mut nats = capability(&launcher, dir.path());

        nats.set_config_map(ConfigMap::from_pairs([("config_file", "/etc/nats/nats.conf")]))
            .unwrap();
        nats.setup().await.unwrap();
        assert!(nats.server_config().is_none());
        assert_eq!(
            nats.process_spec().unwrap().args,
            vec!["-c".to_string(), "/etc/nats/nats.conf".to_string()]
        );
    }

    #[tokio::test]
    async fn test_invalid_options_fail_setup() {
        let launcher = RecordingLauncher::new();
        let mut nats = NatsCapability::with_launcher(launcher.clone());
        nats.set_config_map(ConfigMap::from_pairs([("tls_key", "key.pem")]))
            .unwrap();
        let err = nats.setup().await.unwrap_err();
        assert!(matches!(err, CapabilityError::Config(_)));
        assert_eq!(nats.state(), LifecycleState::Configured);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let mut nats = NatsCapability::with_launcher(RecordingLauncher::new());
        nats.stop(&Context::background()).await.unwrap();
        assert_eq!(nats.state(), LifecycleState::Unconfigured);
    }

    #[tokio::test]
    async fn test_start_before_setup_is_rejected() {
        let mut nats = NatsCapability::with_launcher(RecordingLauncher::new());
        nats.set_config_map(ConfigMap::new()).unwrap();
        let err = nats.start(&Context::background()).await.unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_launch_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = RecordingLauncher::failing();
        let mut nats = capability(&launcher, dir.path());
        nats.set_config_map(ConfigMap::new()).unwrap();
        nats.setup().await.unwrap();
        let err = nats.start(&Context::background()).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Process(ProcessError::Launch { .. })));
        assert_ne!(nats.state(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = RecordingLauncher::new();
        let mut nats = capability(&launcher, dir.path());
        let ctx = Context::background();
        nats.set_config_map(ConfigMap::new()).unwrap();
        nats.setup().await.unwrap();

        nats.start(&ctx).await.unwrap();
        nats.stop(&ctx).await.unwrap();
        nats.start(&ctx).await.unwrap();
        assert!(nats.is_running());
        assert_eq!(launcher.launches().len(), 2);
    }

    #[tokio::test]
    async fn test_events_forwarded() {
        let mut nats = NatsCapability::with_launcher(RecordingLauncher::new());
        let (transmitter, mut rx) = ChannelTransmitter::new(4);
        nats.set_event_transmitter(Some(Arc::new(transmitter))).unwrap();

        nats.transmit_input_event("capkit:kv", Event::new("ping")).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.direction, Direction::Input);
        assert_eq!(got.contract_id, "capkit:kv");
    }
}
