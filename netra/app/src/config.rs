use indexmap::IndexSet;
use netra_trace::TagMaps;
use std::collections::HashSet;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

const ENV_PORT: &str = "NETRA_PORT";
const ENV_PPROF_PORT: &str = "NETRA_PPROF_PORT";
const ENV_PROMETHEUS_PORT: &str = "NETRA_PROMETHEUS_PORT";
const ENV_TRACING_CONTEXT_EXPIRATION: &str = "NETRA_TRACING_CONTEXT_EXPIRATION_MILLISECONDS";
const ENV_TRACING_CONTEXT_CLEANUP_INTERVAL: &str = "NETRA_TRACING_CONTEXT_CLEANUP_INTERVAL";
const ENV_ROUTING_CONTEXT_EXPIRATION: &str = "NETRA_ROUTING_CONTEXT_EXPIRATION_MILLISECONDS";
const ENV_ROUTING_CONTEXT_CLEANUP_INTERVAL: &str = "NETRA_ROUTING_CONTEXT_CLEANUP_INTERVAL";
const ENV_HTTP_PORTS: &str = "NETRA_HTTP_PORTS";
const ENV_REQUEST_ID_HEADER: &str = "NETRA_HTTP_REQUEST_ID_HEADER_NAME";
const ENV_X_SOURCE_HEADER: &str = "NETRA_HTTP_X_SOURCE_HEADER_NAME";
const ENV_X_SOURCE_VALUE: &str = "NETRA_HTTP_X_SOURCE_VALUE";
const ENV_ROUTING_ENABLED: &str = "NETRA_HTTP_ROUTING_ENABLED";
const ENV_ROUTING_HEADER: &str = "NETRA_HTTP_ROUTING_HEADER_NAME";
const ENV_ROUTING_COOKIE_ENABLED: &str = "NETRA_HTTP_ROUTING_COOKIE_ENABLED";
const ENV_ROUTING_COOKIE_NAME: &str = "NETRA_HTTP_ROUTING_COOKIE_NAME";
const ENV_TRACING_IGNORED_PATHS: &str = "NETRA_TRACING_IGNORED_PATHS";
const ENV_HEADER_TAG_MAP: &str = "HTTP_HEADER_TAG_MAP";
const ENV_COOKIE_TAG_MAP: &str = "HTTP_COOKIE_TAG_MAP";
const ENV_STATSD_ENABLED: &str = "NETRA_STATSD_ENABLED";
const ENV_STATSD_ADDRESS: &str = "NETRA_STATSD_ADDRESS";
const ENV_STATSD_PREFIX: &str = "NETRA_STATSD_PREFIX";

/// The source of configuration strings; abstracted from `std::env` so
/// tests can drive parsing directly.
pub trait Strings {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads from the process environment. Unset and empty variables are
/// treated the same.
#[derive(Clone, Copy, Debug, Default)]
pub struct Env;

impl Strings for Env {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("{0} is enabled but {1} is not set")]
    MissingDependent(&'static str, &'static str),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub proxy_port: u16,
    /// Introspection endpoints are run by external collaborators; the
    /// ports are parsed and validated here only.
    pub pprof_port: u16,
    pub prometheus_port: u16,

    pub tracing_context_expiration: Duration,
    pub tracing_context_cleanup_interval: Duration,
    pub routing_context_expiration: Duration,
    pub routing_context_cleanup_interval: Duration,

    pub http_ports: IndexSet<u16>,
    pub http: netra_proxy_http::Config,

    pub tag_maps: TagMaps,
    pub tracing_ignored_paths: HashSet<String>,

    pub statsd_enabled: bool,
    pub statsd_address: Option<String>,
    pub statsd_prefix: String,
}

/// The protocol a connection is handled as, decided once per connection
/// from the original destination's port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Tcp,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_port: 14956,
            pprof_port: 14957,
            prometheus_port: 14958,
            tracing_context_expiration: Duration::from_millis(5000),
            tracing_context_cleanup_interval: Duration::from_millis(1000),
            routing_context_expiration: Duration::from_millis(5000),
            routing_context_cleanup_interval: Duration::from_millis(1000),
            http_ports: vec![80, 8080].into_iter().collect(),
            http: netra_proxy_http::Config::default(),
            tag_maps: TagMaps::default(),
            tracing_ignored_paths: HashSet::new(),
            statsd_enabled: false,
            statsd_address: None,
            statsd_prefix: "netra".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::try_from_strings(&Env)
    }

    pub fn try_from_strings(strings: &dyn Strings) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(port) = parse(strings, ENV_PORT)? {
            config.proxy_port = port;
        }
        if let Some(port) = parse(strings, ENV_PPROF_PORT)? {
            config.pprof_port = port;
        }
        if let Some(port) = parse(strings, ENV_PROMETHEUS_PORT)? {
            config.prometheus_port = port;
        }

        if let Some(ms) = parse(strings, ENV_TRACING_CONTEXT_EXPIRATION)? {
            config.tracing_context_expiration = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(strings, ENV_TRACING_CONTEXT_CLEANUP_INTERVAL)? {
            config.tracing_context_cleanup_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(strings, ENV_ROUTING_CONTEXT_EXPIRATION)? {
            config.routing_context_expiration = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(strings, ENV_ROUTING_CONTEXT_CLEANUP_INTERVAL)? {
            config.routing_context_cleanup_interval = Duration::from_millis(ms);
        }

        if let Some(ports) = strings.get(ENV_HTTP_PORTS) {
            config.http_ports = parse_ports(&ports)?;
        }

        if let Some(name) = strings.get(ENV_REQUEST_ID_HEADER) {
            config.http.request_id_header = name;
        }
        if let Some(name) = strings.get(ENV_X_SOURCE_HEADER) {
            config.http.source_header = name;
        }
        if let Some(value) = strings.get(ENV_X_SOURCE_VALUE) {
            config.http.source_value = value;
        }
        if let Some(enabled) = parse(strings, ENV_ROUTING_ENABLED)? {
            config.http.routing_enabled = enabled;
        }
        if let Some(name) = strings.get(ENV_ROUTING_HEADER) {
            config.http.routing_header = name;
        }
        if let Some(enabled) = parse(strings, ENV_ROUTING_COOKIE_ENABLED)? {
            config.http.routing_cookie_enabled = enabled;
        }
        if let Some(name) = strings.get(ENV_ROUTING_COOKIE_NAME) {
            config.http.routing_cookie = name;
        }

        if let Some(paths) = strings.get(ENV_TRACING_IGNORED_PATHS) {
            config.tracing_ignored_paths = paths
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(map) = strings.get(ENV_HEADER_TAG_MAP) {
            config.tag_maps.headers = parse_tag_map(&map);
        }
        if let Some(map) = strings.get(ENV_COOKIE_TAG_MAP) {
            config.tag_maps.cookies = parse_tag_map(&map);
        }

        if let Some(enabled) = parse(strings, ENV_STATSD_ENABLED)? {
            config.statsd_enabled = enabled;
        }
        config.statsd_address = strings.get(ENV_STATSD_ADDRESS);
        if let Some(prefix) = strings.get(ENV_STATSD_PREFIX) {
            config.statsd_prefix = prefix;
        }
        if config.statsd_enabled && config.statsd_address.is_none() {
            return Err(ConfigError::MissingDependent(
                ENV_STATSD_ENABLED,
                ENV_STATSD_ADDRESS,
            ));
        }

        Ok(config)
    }

    pub fn classify(&self, port: u16) -> Protocol {
        if self.http_ports.contains(&port) {
            Protocol::Http
        } else {
            Protocol::Tcp
        }
    }
}

fn parse<T>(strings: &dyn Strings, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match strings.get(name) {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

fn parse_ports(csv: &str) -> Result<IndexSet<u16>, ConfigError> {
    let mut ports = IndexSet::new();
    for part in csv.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let port = part.parse::<u16>().map_err(|_| ConfigError::Invalid {
            name: ENV_HTTP_PORTS,
            value: part.to_string(),
        })?;
        ports.insert(port);
    }
    Ok(ports)
}

/// Parses `k1:t1,k2:t2` mappings; malformed pairs are skipped with a
/// warning rather than failing startup.
fn parse_tag_map(csv: &str) -> Vec<(String, String)> {
    csv.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .filter_map(|pair| match pair.trim().split_once(':') {
            Some((name, tag)) if !name.is_empty() && !tag.is_empty() => {
                info!(%name, %tag, "Loaded tag mapping");
                Some((name.to_string(), tag.to_string()))
            }
            _ => {
                warn!(%pair, "Ignoring malformed tag mapping");
                None
            }
        })
        .collect()
}
