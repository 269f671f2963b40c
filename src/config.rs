use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// Remote collector every forwarding unit delivers to
    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub syslog: SyslogConfig,

    #[serde(default)]
    pub service_monitor: ServiceMonitorConfig,

    #[serde(default)]
    pub system_monitor: SystemMonitorConfig,

    #[serde(default)]
    pub web_monitor: WebMonitorConfig,

    #[serde(default)]
    pub web_api: Vec<WebApiConfig>,

    #[serde(default)]
    pub event_log: EventLogConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_id")]
    pub id: String,

    #[serde(default = "default_agent_name")]
    pub name: String,

    /// Seconds the coordinator waits for units to quiesce before forcing exit
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            name: default_agent_name(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_agent_id() -> String {
    String::from("hostwatch")
}

fn default_agent_name() -> String {
    crate::util::host_name()
}

fn default_shutdown_grace() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log file; records go to stdout when unset
    pub file: Option<PathBuf>,

    #[serde(default = "default_max_log_size")]
    pub max_size_bytes: u64,

    #[serde(default = "default_keep_files")]
    pub keep_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: None,
            max_size_bytes: default_max_log_size(),
            keep_files: default_keep_files(),
        }
    }
}

fn default_max_log_size() -> u64 {
    10 * 1024 * 1024
}

fn default_keep_files() -> usize {
    5
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[serde(alias = "GET")]
    Get,
    #[default]
    #[serde(alias = "POST")]
    Post,
    #[serde(alias = "PUT")]
    Put,
    #[serde(alias = "PATCH")]
    Patch,
    #[serde(alias = "DELETE")]
    Delete,
    #[serde(alias = "HEAD")]
    Head,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        reqwest::Method::from(*self).fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

/// Credential attached to an outbound request
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Auth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: Option<String>,
    },
    #[serde(alias = "apikey")]
    ApiKey {
        key: String,
        #[serde(default = "default_api_key_header")]
        header: String,
    },
}

// Credentials never end up in trace output.
impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::None => f.write_str("None"),
            Auth::Bearer { .. } => f.write_str("Bearer(***)"),
            Auth::Basic { username, .. } => write!(f, "Basic({username}:***)"),
            Auth::ApiKey { header, .. } => write!(f, "ApiKey({header}: ***)"),
        }
    }
}

fn default_api_key_header() -> String {
    String::from("X-API-Key")
}

/// An HTTP endpoint together with everything needed to call it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HttpEndpoint {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub method: HttpMethod,

    #[serde(default)]
    pub headers: Vec<Header>,

    #[serde(default)]
    pub query: BTreeMap<String, String>,

    #[serde(default)]
    pub auth: Auth,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub skip_verify: bool,
}

impl Default for HttpEndpoint {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: HttpMethod::default(),
            headers: Vec::new(),
            query: BTreeMap::new(),
            auth: Auth::None,
            timeout_secs: default_request_timeout(),
            skip_verify: false,
        }
    }
}

fn default_request_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(flatten)]
    pub endpoint: HttpEndpoint,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: HttpEndpoint::default(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_workers() -> usize {
    crate::dispatch::DEFAULT_WORKERS
}

fn default_queue_capacity() -> usize {
    crate::dispatch::DEFAULT_QUEUE_CAPACITY
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
pub enum SyslogProtocol {
    #[default]
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "tcp+tls")]
    TcpTls,
}

impl fmt::Display for SyslogProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyslogProtocol::Udp => f.write_str("udp"),
            SyslogProtocol::Tcp => f.write_str("tcp"),
            SyslogProtocol::TcpTls => f.write_str("tcp+tls"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SyslogConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub protocol: SyslogProtocol,

    /// `host:port` of the syslog collector
    #[serde(default)]
    pub server: String,

    #[serde(default = "default_syslog_tag")]
    pub tag: String,

    #[serde(default)]
    pub skip_verify: bool,
}

impl Default for SyslogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            protocol: SyslogProtocol::default(),
            server: String::new(),
            tag: default_syslog_tag(),
            skip_verify: false,
        }
    }
}

fn default_syslog_tag() -> String {
    String::from("hostwatch")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceMonitorConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Forward samples to the delivery endpoint
    #[serde(default)]
    pub forward: bool,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default)]
    pub services: Vec<String>,
}

impl Default for ServiceMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            forward: false,
            interval_secs: default_interval(),
            services: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemMonitorConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub forward: bool,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_true")]
    pub cpu: bool,

    #[serde(default = "default_true")]
    pub memory: bool,

    #[serde(default)]
    pub disk: bool,

    #[serde(default)]
    pub network: bool,

    #[serde(default)]
    pub temperature: bool,
}

impl SystemMonitorConfig {
    pub fn any_category(&self) -> bool {
        self.cpu || self.memory || self.disk || self.network || self.temperature
    }
}

impl Default for SystemMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            forward: false,
            interval_secs: default_interval(),
            cpu: true,
            memory: true,
            disk: false,
            network: false,
            temperature: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebMonitorConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub forward: bool,

    #[serde(default = "default_web_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub skip_verify: bool,

    #[serde(default)]
    pub urls: Vec<String>,

    /// Regex the body of a successful response must match, otherwise the
    /// endpoint is reported as degraded
    pub body_pattern: Option<String>,
}

impl Default for WebMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            forward: false,
            interval_secs: default_web_interval(),
            timeout_secs: default_request_timeout(),
            skip_verify: false,
            urls: Vec::new(),
            body_pattern: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub name: String,

    #[serde(default)]
    pub subject: String,

    pub endpoint: String,

    #[serde(default = "default_api_method")]
    pub method: HttpMethod,

    #[serde(default)]
    pub headers: Vec<Header>,

    #[serde(default)]
    pub query: BTreeMap<String, String>,

    /// JSON body sent with every request
    pub body: Option<Value>,

    #[serde(default)]
    pub auth: Auth,

    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub skip_verify: bool,

    #[serde(default = "default_web_interval")]
    pub interval_secs: u64,

    #[serde(default)]
    pub forward: bool,
}

impl WebApiConfig {
    pub fn http_endpoint(&self) -> HttpEndpoint {
        HttpEndpoint {
            url: self.endpoint.clone(),
            method: self.method,
            headers: self.headers.clone(),
            query: self.query.clone(),
            auth: self.auth.clone(),
            timeout_secs: self.timeout_secs,
            skip_verify: self.skip_verify,
        }
    }
}

fn default_api_method() -> HttpMethod {
    HttpMethod::Get
}

fn default_api_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventLogConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub forward: bool,

    /// Journal units to follow
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginsConfig {
    /// Directory scanned for `*.toml` unit descriptors
    pub directory: Option<PathBuf>,
}

fn default_interval() -> u64 {
    30
}

fn default_web_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Check the cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.shutdown_grace_secs == 0 {
            return invalid("agent.shutdown_grace_secs must be greater than zero");
        }

        if self.delivery.enabled {
            validate_endpoint("delivery", &self.delivery.endpoint)?;
            if self.delivery.workers == 0 {
                return invalid("delivery.workers must be greater than zero");
            }
            if self.delivery.queue_capacity == 0 {
                return invalid("delivery.queue_capacity must be greater than zero");
            }
        }

        if self.syslog.enabled && self.syslog.server.trim().is_empty() {
            return invalid("syslog.server is required when syslog is enabled");
        }

        if self.service_monitor.enabled && self.service_monitor.interval_secs == 0 {
            return invalid("service_monitor.interval_secs must be greater than zero");
        }

        if self.system_monitor.enabled && self.system_monitor.interval_secs == 0 {
            return invalid("system_monitor.interval_secs must be greater than zero");
        }

        if self.web_monitor.enabled {
            if self.web_monitor.interval_secs == 0 {
                return invalid("web_monitor.interval_secs must be greater than zero");
            }
            if let Some(pattern) = &self.web_monitor.body_pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    ConfigError::Invalid(format!("web_monitor.body_pattern is not a valid regex: {e}"))
                })?;
            }
        }

        for api in self.web_api.iter().filter(|api| api.enabled) {
            if api.name.trim().is_empty() {
                return invalid("web_api entries need a name");
            }
            if api.interval_secs == 0 {
                return invalid(&format!("web_api '{}': interval_secs must be greater than zero", api.name));
            }
            validate_endpoint(&format!("web_api '{}'", api.name), &api.http_endpoint())?;
        }

        Ok(())
    }
}

fn validate_endpoint(section: &str, endpoint: &HttpEndpoint) -> Result<(), ConfigError> {
    if endpoint.url.trim().is_empty() {
        return invalid(&format!("{section}: url is required"));
    }
    reqwest::Url::parse(&endpoint.url)
        .map_err(|e| ConfigError::Invalid(format!("{section}: invalid url '{}': {e}", endpoint.url)))?;
    if endpoint.timeout_secs == 0 {
        return invalid(&format!("{section}: timeout_secs must be greater than zero"));
    }
    Ok(())
}

fn invalid<T>(message: &str) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(message.to_string()))
}

/// Parse configuration text. TOML is used when `is_toml` is set, JSON otherwise.
pub fn parse_config(content: &str, is_toml: bool) -> Result<Config, ConfigError> {
    let config: Config = if is_toml {
        toml::from_str(content)?
    } else {
        serde_json::from_str(content)?
    };
    config.validate()?;
    Ok(config)
}

pub fn read_config_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

    parse_config(&file_content, is_toml).inspect(|config| trace!("loaded config: {config:?}"))
}
