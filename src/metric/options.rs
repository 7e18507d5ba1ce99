//! Exporter options and `prometheus-nats-exporter` command-line translation.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{ConfigError, ConfigMap};

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_LISTEN_PORT: i64 = 7777;
pub const DEFAULT_SCRAPE_PATH: &str = "/metrics";
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

const JSZ_FILTERS: [&str; 4] = ["streams", "accounts", "consumers", "all"];

static URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]*)://(?:[^@/?#]*@)?(?P<host>[^@/?#]+)(?:[/?#].*)?$")
        .unwrap()
});

/// A monitored server: the id it is reported under and its monitoring URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredServer {
    pub id: String,
    pub url: String,
}

impl MonitoredServer {
    /// Parse `[id,]url`.
    ///
    /// Without an explicit id, the id is `scheme://host` of the URL, which
    /// leaves any credentials out. The id may itself contain commas; the
    /// URL starts after the last one.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ConfigError::Missing("url".into()));
        }

        match input.rfind(',') {
            Some(idx) => {
                let (id, url) = (&input[..idx], &input[idx + 1..]);
                parse_url(url)?;
                Ok(Self {
                    id: id.to_string(),
                    url: url.to_string(),
                })
            }
            None => {
                let (scheme, host) = parse_url(input)?;
                Ok(Self {
                    id: format!("{}://{}", scheme, host),
                    url: input.to_string(),
                })
            }
        }
    }

    /// The positional argument the exporter expects.
    pub fn to_arg(&self) -> String {
        format!("{},{}", self.id, self.url)
    }
}

fn parse_url(url: &str) -> Result<(&str, &str), ConfigError> {
    let caps = URL_PATTERN
        .captures(url)
        .ok_or_else(|| ConfigError::invalid("url", format!("not an absolute URL: {:?}", url)))?;
    match (caps.name("scheme"), caps.name("host")) {
        (Some(scheme), Some(host)) => Ok((scheme.as_str(), host.as_str())),
        _ => Err(ConfigError::invalid("url", format!("not an absolute URL: {:?}", url))),
    }
}

/// Options for one exporter process.
#[derive(Clone, PartialEq, Eq)]
pub struct ExporterOptions {
    pub url: String,
    pub listen_address: String,
    pub listen_port: i64,
    pub scrape_path: String,
    pub get_connz: bool,
    pub get_varz: bool,
    pub get_subz: bool,
    pub get_routez: bool,
    pub get_gatewayz: bool,
    pub get_leafz: bool,
    pub get_replicator_varz: bool,
    pub get_streaming_channelz: bool,
    pub get_streaming_serverz: bool,
    pub get_jsz_filter: String,
    pub retry_interval: Duration,
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
    pub http_user: String,
    pub http_password: String,
    pub prefix: String,
    pub use_internal_server_id: bool,
}

impl std::fmt::Debug for ExporterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExporterOptions")
            .field("url", &self.url)
            .field("listen_address", &self.listen_address)
            .field("listen_port", &self.listen_port)
            .field("scrape_path", &self.scrape_path)
            .field("get_jsz_filter", &self.get_jsz_filter)
            .field("retry_interval", &self.retry_interval)
            .field("http_user", &self.http_user)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl Default for ExporterOptions {
    fn default() -> Self {
        Self::from_config_map(&ConfigMap::new())
    }
}

impl ExporterOptions {
    pub fn from_config_map(cm: &ConfigMap) -> Self {
        // Older manifests spell these `scrap_path` and `user_internal_server_id`.
        let scrape_path = if cm.contains_key("scrape_path") {
            cm.string("scrape_path", DEFAULT_SCRAPE_PATH)
        } else {
            cm.string("scrap_path", DEFAULT_SCRAPE_PATH)
        };
        let use_internal_server_id = if cm.contains_key("use_internal_server_id") {
            cm.bool("use_internal_server_id", false)
        } else {
            cm.bool("user_internal_server_id", false)
        };

        Self {
            url: cm.string("url", ""),
            listen_address: cm.string("listen_address", DEFAULT_LISTEN_ADDRESS),
            listen_port: cm.int("listen_port", DEFAULT_LISTEN_PORT),
            scrape_path,
            get_connz: cm.bool("get_connz", false),
            get_varz: cm.bool("get_varz", false),
            get_subz: cm.bool("get_subz", false),
            get_routez: cm.bool("get_routez", false),
            get_gatewayz: cm.bool("get_gatewayz", false),
            get_leafz: cm.bool("get_leafz", false),
            get_replicator_varz: cm.bool("get_replicator_varz", false),
            get_streaming_channelz: cm.bool("get_streaming_channelz", false),
            get_streaming_serverz: cm.bool("get_streaming_serverz", false),
            get_jsz_filter: cm.string("get_jsz_filter", ""),
            retry_interval: cm.duration("retry_interval", DEFAULT_RETRY_INTERVAL),
            cert_file: cm.string("cert_file", ""),
            key_file: cm.string("key_file", ""),
            ca_file: cm.string("ca_file", ""),
            http_user: cm.string("http_user", ""),
            http_password: cm.string("http_password", ""),
            prefix: cm.string("prefix", ""),
            use_internal_server_id,
        }
    }

    /// Check the options and resolve the monitored server.
    pub fn validate(&self) -> Result<MonitoredServer, ConfigError> {
        let server = MonitoredServer::parse(&self.url)?;

        if !(1..=65_535).contains(&self.listen_port) {
            return Err(ConfigError::invalid(
                "listen_port",
                format!("port {} out of range", self.listen_port),
            ));
        }
        if !self.scrape_path.starts_with('/') {
            return Err(ConfigError::invalid("scrape_path", "must start with '/'"));
        }
        if !self.get_jsz_filter.is_empty() && !JSZ_FILTERS.contains(&self.get_jsz_filter.as_str()) {
            return Err(ConfigError::invalid(
                "get_jsz_filter",
                format!("expected one of {}", JSZ_FILTERS.join(", ")),
            ));
        }
        if self.cert_file.is_empty() != self.key_file.is_empty() {
            return Err(ConfigError::invalid(
                "cert_file",
                "cert_file and key_file must be given together",
            ));
        }
        if self.http_user.is_empty() != self.http_password.is_empty() {
            return Err(ConfigError::invalid(
                "http_user",
                "http_user and http_password must be given together",
            ));
        }
        Ok(server)
    }

    /// Command-line flags for the exporter, followed by the server argument.
    pub fn to_args(&self, server: &MonitoredServer) -> Vec<String> {
        let mut args = vec![
            "-addr".to_string(),
            self.listen_address.clone(),
            "-port".to_string(),
            self.listen_port.to_string(),
            "-path".to_string(),
            self.scrape_path.clone(),
        ];

        for (enabled, flag) in [
            (self.get_connz, "-connz"),
            (self.get_varz, "-varz"),
            (self.get_subz, "-subz"),
            (self.get_routez, "-routez"),
            (self.get_gatewayz, "-gatewayz"),
            (self.get_leafz, "-leafz"),
            (self.get_replicator_varz, "-replicatorVarz"),
            (self.get_streaming_channelz, "-channelz"),
            (self.get_streaming_serverz, "-serverz"),
            (self.use_internal_server_id, "-use_internal_server_id"),
        ] {
            if enabled {
                args.push(flag.to_string());
            }
        }

        let mut valued = |flag: &str, value: &str| {
            if !value.is_empty() {
                args.push(flag.to_string());
                args.push(value.to_string());
            }
        };
        valued("-jsz", &self.get_jsz_filter);
        valued("-tlscert", &self.cert_file);
        valued("-tlskey", &self.key_file);
        valued("-tlscacert", &self.ca_file);
        valued("-http_user", &self.http_user);
        valued("-http_pass", &self.http_password);
        valued("-prefix", &self.prefix);

        args.push("-ri".to_string());
        args.push(self.retry_interval.as_secs().max(1).to_string());
        args.push(server.to_arg());
        args
    }
}
