//! Server options and their translation to a `nats-server` configuration.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::{format_duration, ConfigError, ConfigMap};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: i64 = 4222;
pub const DEFAULT_MAX_CONNECTIONS: i64 = 65_536;
pub const DEFAULT_MAX_PAYLOAD: i32 = 1024 * 1024;
pub const DEFAULT_MAX_PENDING: i64 = 64 * 1024 * 1024;
pub const DEFAULT_MAX_CONTROL_LINE: i32 = 4096;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_PINGS_OUT: i64 = 2;
pub const DEFAULT_WRITE_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_LAME_DUCK_DURATION: Duration = Duration::from_secs(120);

/// Subset of `nats-server` options the capability manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerOptions {
    /// Existing configuration file; when set, it is used as is.
    pub config_file: String,
    pub server_name: String,
    pub host: String,
    pub port: i64,
    pub client_advertise: String,

    pub trace: bool,
    pub debug: bool,
    pub trace_verbose: bool,
    pub no_log: bool,
    pub logtime: bool,

    pub max_connections: i64,
    pub max_subscriptions: i64,
    pub max_payload: i32,
    pub max_pending: i64,
    pub max_control_line: i32,

    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(skip_serializing)]
    pub authorization: String,

    pub ping_interval: Duration,
    pub max_pings_out: i64,

    pub http_host: String,
    pub http_port: i64,
    pub https_port: i64,

    pub jetstream: bool,
    pub jetstream_max_memory: i64,
    pub jetstream_max_store: i64,
    pub jetstream_domain: String,
    pub store_dir: String,

    pub cluster_name: String,
    pub cluster_listen: String,
    pub routes: Vec<String>,

    pub pid_file: String,
    pub log_file: String,
    pub log_size_limit: i64,
    pub syslog: bool,
    pub remote_syslog: String,

    pub tls: bool,
    pub tls_verify: bool,
    pub tls_cert: String,
    pub tls_key: String,
    pub tls_ca_cert: String,

    pub write_deadline: Duration,
    pub lame_duck_duration: Duration,
    pub tags: Vec<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from_config_map(&ConfigMap::new())
    }
}

impl ServerOptions {
    /// Read every recognised key, defaulting the absent ones.
    pub fn from_config_map(cm: &ConfigMap) -> Self {
        Self {
            config_file: cm.string("config_file", ""),
            server_name: cm.string("server_name", ""),
            host: cm.string("host", DEFAULT_HOST),
            port: cm.int("port", DEFAULT_PORT),
            client_advertise: cm.string("client_advertise", ""),

            trace: cm.bool("trace", false),
            debug: cm.bool("debug", false),
            trace_verbose: cm.bool("trace_verbose", false),
            no_log: cm.bool("no_log", false),
            logtime: cm.bool("logtime", true),

            max_connections: cm.int("max_connections", DEFAULT_MAX_CONNECTIONS),
            max_subscriptions: cm.int("max_subscriptions", 0),
            max_payload: cm.int32("max_payload", DEFAULT_MAX_PAYLOAD),
            max_pending: cm.int64("max_pending", DEFAULT_MAX_PENDING),
            max_control_line: cm.int32("max_control_line", DEFAULT_MAX_CONTROL_LINE),

            username: cm.string("username", ""),
            password: cm.string("password", ""),
            authorization: cm.string("authorization", ""),

            ping_interval: cm.duration("ping_interval", DEFAULT_PING_INTERVAL),
            max_pings_out: cm.int("max_pings_out", DEFAULT_MAX_PINGS_OUT),

            http_host: cm.string("http_host", ""),
            http_port: cm.int("http_port", 0),
            https_port: cm.int("https_port", 0),

            jetstream: cm.bool("jetstream", false),
            jetstream_max_memory: cm.int64("jetstream_max_memory", -1),
            jetstream_max_store: cm.int64("jetstream_max_store", -1),
            jetstream_domain: cm.string("jetstream_domain", ""),
            store_dir: cm.string("store_dir", ""),

            cluster_name: cm.string("cluster_name", ""),
            cluster_listen: cm.string("cluster_listen", ""),
            routes: cm.string_list("routes", &[]),

            pid_file: cm.string("pid_file", ""),
            log_file: cm.string("log_file", ""),
            log_size_limit: cm.int64("log_size_limit", 0),
            syslog: cm.bool("syslog", false),
            remote_syslog: cm.string("remote_syslog", ""),

            tls: cm.bool("tls", false),
            tls_verify: cm.bool("tls_verify", false),
            tls_cert: cm.string("tls_cert", ""),
            tls_key: cm.string("tls_key", ""),
            tls_ca_cert: cm.string("tls_ca_cert", ""),

            write_deadline: cm.duration("write_deadline", DEFAULT_WRITE_DEADLINE),
            lame_duck_duration: cm.duration("lame_duck_duration", DEFAULT_LAME_DUCK_DURATION),
            tags: cm.string_list("tags", &[]),
        }
    }

    /// Reject option combinations the server would refuse to start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_port("port", self.port, true)?;
        check_port("http_port", self.http_port, false)?;
        check_port("https_port", self.https_port, false)?;

        if self.max_payload <= 0 {
            return Err(ConfigError::invalid("max_payload", "must be positive"));
        }
        if i64::from(self.max_payload) > self.max_pending {
            return Err(ConfigError::invalid(
                "max_payload",
                format!("{} exceeds max_pending {}", self.max_payload, self.max_pending),
            ));
        }

        if !self.authorization.is_empty() && !self.username.is_empty() {
            return Err(ConfigError::invalid(
                "authorization",
                "a token cannot be combined with username/password",
            ));
        }
        if !self.password.is_empty() && self.username.is_empty() {
            return Err(ConfigError::invalid("password", "set without a username"));
        }

        if self.tls_cert.is_empty() != self.tls_key.is_empty() {
            return Err(ConfigError::invalid(
                "tls_cert",
                "tls_cert and tls_key must be given together",
            ));
        }
        if (self.tls || self.tls_verify) && self.tls_cert.is_empty() {
            return Err(ConfigError::invalid("tls", "requires tls_cert and tls_key"));
        }
        if self.https_port > 0 && self.tls_cert.is_empty() {
            return Err(ConfigError::invalid("https_port", "requires tls_cert and tls_key"));
        }

        if !self.routes.is_empty() && self.cluster_listen.is_empty() {
            return Err(ConfigError::invalid("routes", "requires cluster_listen"));
        }
        for (key, value) in [
            ("jetstream_max_memory", self.jetstream_max_memory),
            ("jetstream_max_store", self.jetstream_max_store),
        ] {
            if value < -1 {
                return Err(ConfigError::invalid(key, "must be -1 (unlimited) or a size in bytes"));
            }
        }
        Ok(())
    }

    /// Whether TLS is configured.
    pub fn tls_enabled(&self) -> bool {
        !self.tls_cert.is_empty()
    }

    /// Render the options as a server configuration document.
    ///
    /// The server's configuration format accepts JSON, so the document is
    /// written out verbatim.
    pub fn to_server_config(&self) -> Value {
        let mut conf = Map::new();
        put_str(&mut conf, "server_name", &self.server_name);
        conf.insert("host".into(), json!(self.host));
        conf.insert("port".into(), json!(self.port));
        put_str(&mut conf, "client_advertise", &self.client_advertise);

        conf.insert("debug".into(), json!(self.debug));
        conf.insert("trace".into(), json!(self.trace || self.trace_verbose));
        if self.trace_verbose {
            conf.insert("trace_verbose".into(), json!(true));
        }
        conf.insert("logtime".into(), json!(self.logtime));

        conf.insert("max_connections".into(), json!(self.max_connections));
        if self.max_subscriptions > 0 {
            conf.insert("max_subscriptions".into(), json!(self.max_subscriptions));
        }
        conf.insert("max_payload".into(), json!(self.max_payload));
        conf.insert("max_pending".into(), json!(self.max_pending));
        conf.insert("max_control_line".into(), json!(self.max_control_line));

        conf.insert("ping_interval".into(), json!(format_duration(self.ping_interval)));
        conf.insert("ping_max".into(), json!(self.max_pings_out));
        conf.insert("write_deadline".into(), json!(format_duration(self.write_deadline)));
        conf.insert(
            "lame_duck_duration".into(),
            json!(format_duration(self.lame_duck_duration)),
        );

        if !self.username.is_empty() || !self.authorization.is_empty() {
            let mut auth = Map::new();
            put_str(&mut auth, "user", &self.username);
            put_str(&mut auth, "password", &self.password);
            put_str(&mut auth, "token", &self.authorization);
            conf.insert("authorization".into(), Value::Object(auth));
        }

        if self.http_port > 0 {
            let host = if self.http_host.is_empty() { &self.host } else { &self.http_host };
            conf.insert("http".into(), json!(format!("{}:{}", host, self.http_port)));
        }
        if self.https_port > 0 {
            let host = if self.http_host.is_empty() { &self.host } else { &self.http_host };
            conf.insert("https".into(), json!(format!("{}:{}", host, self.https_port)));
        }

        if self.jetstream {
            let mut js = Map::new();
            put_str(&mut js, "store_dir", &self.store_dir);
            put_str(&mut js, "domain", &self.jetstream_domain);
            if self.jetstream_max_memory >= 0 {
                js.insert("max_memory_store".into(), json!(self.jetstream_max_memory));
            }
            if self.jetstream_max_store >= 0 {
                js.insert("max_file_store".into(), json!(self.jetstream_max_store));
            }
            conf.insert("jetstream".into(), Value::Object(js));
        }

        if !self.cluster_listen.is_empty() {
            let mut cluster = Map::new();
            put_str(&mut cluster, "name", &self.cluster_name);
            cluster.insert("listen".into(), json!(self.cluster_listen));
            if !self.routes.is_empty() {
                cluster.insert("routes".into(), json!(self.routes));
            }
            conf.insert("cluster".into(), Value::Object(cluster));
        }

        put_str(&mut conf, "pid_file", &self.pid_file);
        put_str(&mut conf, "log_file", &self.log_file);
        if self.log_size_limit > 0 {
            conf.insert("logfile_size_limit".into(), json!(self.log_size_limit));
        }
        if self.syslog {
            conf.insert("syslog".into(), json!(true));
        }
        put_str(&mut conf, "remote_syslog", &self.remote_syslog);

        if self.tls_enabled() {
            let mut tls = Map::new();
            tls.insert("cert_file".into(), json!(self.tls_cert));
            tls.insert("key_file".into(), json!(self.tls_key));
            put_str(&mut tls, "ca_file", &self.tls_ca_cert);
            if self.tls_verify {
                tls.insert("verify".into(), json!(true));
            }
            conf.insert("tls".into(), Value::Object(tls));
        }

        if !self.tags.is_empty() {
            conf.insert("server_tags".into(), json!(self.tags));
        }
        Value::Object(conf)
    }
}

fn put_str(map: &mut Map<String, Value>, key: &str, value: &str) {
    if !value.is_empty() {
        map.insert(key.to_string(), json!(value));
    }
}

// -1 asks the server for a random port.
fn check_port(key: &str, port: i64, allow_random: bool) -> Result<(), ConfigError> {
    let min = if allow_random { -1 } else { 0 };
    if port < min || port > 65_535 {
        return Err(ConfigError::invalid(key, format!("port {} out of range", port)));
    }
    Ok(())
}
