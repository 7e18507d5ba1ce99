//! The metrics exporter capability.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::options::{ExporterOptions, MonitoredServer};
use crate::capabilities::{Capability, CapabilityError, LifecycleState};
use crate::config::ConfigMap;
use crate::context::Context;
use crate::events::{Direction, Event, EventRelay, EventTransmitter, RelayIdentity};
use crate::process::{ProcessLauncher, ProcessSlot, ProcessSpec, TokioProcessLauncher};

pub const NAME: &str = "nats-metric";
pub const CATEGORY: &str = "metric";
pub const CONTRACT_ID: &str = "capkit:nats-metric";

pub const DEFAULT_BINARY: &str = "prometheus-nats-exporter";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runs `prometheus-nats-exporter` against one monitored server.
pub struct MetricCapability {
    cm: ConfigMap,
    options: ExporterOptions,
    binary: String,
    shutdown_grace: Duration,
    state: LifecycleState,
    launcher: Arc<dyn ProcessLauncher>,
    server: Option<MonitoredServer>,
    spec: Option<ProcessSpec>,
    process: ProcessSlot,
    relay: EventRelay,
}

impl std::fmt::Debug for MetricCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricCapability")
            .field("state", &self.state)
            .field("server", &self.server)
            .field("process", &self.process)
            .finish()
    }
}

impl Default for MetricCapability {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricCapability {
    pub fn new() -> Self {
        Self::with_launcher(Arc::new(TokioProcessLauncher))
    }

    pub fn with_launcher(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            cm: ConfigMap::new(),
            options: ExporterOptions::default(),
            binary: DEFAULT_BINARY.to_string(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            state: LifecycleState::Unconfigured,
            launcher,
            server: None,
            spec: None,
            process: ProcessSlot::new(),
            relay: EventRelay::default(),
        }
    }

    pub fn options(&self) -> &ExporterOptions {
        &self.options
    }

    /// The monitored server resolved by `setup`.
    pub fn server(&self) -> Option<&MonitoredServer> {
        self.server.as_ref()
    }

    pub fn process_spec(&self) -> Option<&ProcessSpec> {
        self.spec.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    /// Where Prometheus scrapes the exporter.
    pub fn scrape_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.options.listen_address, self.options.listen_port, self.options.scrape_path
        )
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
impl Capability for MetricCapability {
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
        Box::new(MetricCapability::with_launcher(Arc::clone(&self.launcher)))
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
        self.options = ExporterOptions::from_config_map(&cm);
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
            return Err(CapabilityError::Setup("exporter binary not configured".into()));
        }

        let server = self.options.validate()?;
        let spec = ProcessSpec::new(&self.binary).args(self.options.to_args(&server));
        log::debug!(
            "exporter prepared for server {} ({}): {}",
            server.id,
            server.url,
            spec.command_line()
        );
        self.server = Some(server);
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
            return Err(CapabilityError::Setup("exporter command not prepared".into()));
        };

        log::debug!("exporter starting...");
        let launched = ctx
            .run(self.process.start(self.launcher.as_ref(), &spec))
            .await??;
        if launched {
            log::info!("exporter serving {}", self.scrape_url());
        }
        self.state = LifecycleState::Running;
        Ok(())
    }

    async fn stop(&mut self, ctx: &Context) -> Result<(), CapabilityError> {
        let result = ctx.run(self.process.stop(self.shutdown_grace)).await;
        if self.state.is_set_up() {
            self.state = LifecycleState::Stopped;
        }
        if let Some(code) = result?? {
            log::info!("exporter exited with code {}", code);
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
    use crate::config::ConfigError;
    use crate::process::testing::RecordingLauncher;

    #[tokio::test]
    async fn test_lifecycle() {
        let launcher = RecordingLauncher::new();
        let mut metric = MetricCapability::with_launcher(launcher.clone());
        let ctx = Context::background();

        metric
            .set_config_map(ConfigMap::from_pairs([
                ("url", "http://localhost:8222"),
                ("get_varz", "true"),
            ]))
            .unwrap();
        metric.setup().await.unwrap();
        assert_eq!(metric.server().unwrap().id, "http://localhost:8222");
        assert_eq!(metric.scrape_url(), "http://0.0.0.0:7777/metrics");

        metric.start(&ctx).await.unwrap();
        assert!(metric.is_running());
        let launches = launcher.launches();
        assert_eq!(launches[0].program, "prometheus-nats-exporter");
        assert!(launches[0].args.contains(&"-varz".to_string()));
        assert_eq!(
            launches[0].args.last().map(String::as_str),
            Some("http://localhost:8222,http://localhost:8222")
        );

        metric.stop(&ctx).await.unwrap();
        assert_eq!(metric.state(), LifecycleState::Stopped);
        assert_eq!(launcher.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_url_fails_setup() {
        let mut metric = MetricCapability::with_launcher(RecordingLauncher::new());
        metric.set_config_map(ConfigMap::new()).unwrap();
        let err = metric.setup().await.unwrap_err();
        assert!(matches!(err, CapabilityError::Config(ConfigError::Missing(_))));
    }

    #[tokio::test]
    async fn test_invalid_url_fails_setup() {
        let mut metric = MetricCapability::with_launcher(RecordingLauncher::new());
        metric
            .set_config_map(ConfigMap::from_pairs([("url", "localhost")]))
            .unwrap();
        assert!(metric.setup().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let mut metric = MetricCapability::with_launcher(RecordingLauncher::new());
        metric.stop(&Context::background()).await.unwrap();
    }

    #[tokio::test]
    async fn test_new_instance_is_unconfigured() {
        let mut proto = MetricCapability::with_launcher(RecordingLauncher::new());
        proto
            .set_config_map(ConfigMap::from_pairs([("url", "http://h:8222")]))
            .unwrap();
        let fresh = proto.new_instance();
        assert_eq!(fresh.state(), LifecycleState::Unconfigured);
        assert!(fresh.config_map().is_empty());
    }

    #[tokio::test]
    async fn test_add_authorizer_is_noop() {
        let mut metric = MetricCapability::new();
        metric
            .add_authorizer(Arc::new(crate::policy::AllowAll), "true", "anything")
            .unwrap();
    }
}
