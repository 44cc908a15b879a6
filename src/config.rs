use crate::error::ProxyError;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

/// A header given as `name=value` on the command line or as an object in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

impl FromStr for HeaderEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Only the first '=' separates; the value may contain more.
        match s.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => Ok(HeaderEntry {
                name: name.trim().to_string(),
                value: value.to_string(),
            }),
            _ => Err(format!("expected key=value, got '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Upstream origin, `http://` or `https://`.
    pub target: Option<String>,
    /// Whether clients reach the proxy over HTTPS. Defaults to whether TLS material is configured.
    #[serde(default)]
    pub use_ssl: Option<bool>,
    #[serde(default)]
    pub request_headers: Vec<HeaderEntry>,
    #[serde(default)]
    pub response_headers: Vec<HeaderEntry>,
    #[serde(default)]
    pub preserve_compression: bool,
    #[serde(default)]
    pub disable_cache: bool,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub proxy_external: bool,
    #[serde(default)]
    pub proxy_external_ignores: Vec<String>,
    #[serde(default)]
    pub overwrite_folder: Option<PathBuf>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            target: None,
            use_ssl: None,
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            preserve_compression: false,
            disable_cache: false,
            cors: CorsConfig::default(),
            proxy_external: false,
            proxy_external_ignores: Vec::new(),
            overwrite_folder: None,
            private_key: None,
            certificate: None,
            connect_timeout_secs: Some(DEFAULT_CONNECT_TIMEOUT_SECS),
            request_timeout_secs: Some(DEFAULT_REQUEST_TIMEOUT_SECS),
            pool_max_idle_per_host: Some(DEFAULT_POOL_MAX_IDLE_PER_HOST),
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn has_tls(&self) -> bool {
        self.private_key.is_some() && self.certificate.is_some()
    }
}

/// Runtime settings shared read-only by every in-flight request.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// `scheme://host[:port]` of the upstream, without path.
    pub target: Url,
    pub use_ssl: bool,
    pub request_headers: HeaderMap,
    pub response_headers: HeaderMap,
    pub preserve_compression: bool,
    pub disable_cache: bool,
    pub cors: CorsConfig,
    pub proxy_external: bool,
    /// Lowercased host names, with or without port.
    pub proxy_external_ignores: HashSet<String>,
    pub overwrite_folder: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl ProxyConfig {
    /// Defaults for everything but the target.
    pub fn new(target: Url) -> Self {
        Self {
            target,
            use_ssl: false,
            request_headers: HeaderMap::new(),
            response_headers: HeaderMap::new(),
            preserve_compression: false,
            disable_cache: false,
            cors: CorsConfig::default(),
            proxy_external: false,
            proxy_external_ignores: HashSet::new(),
            overwrite_folder: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        let target = config
            .target
            .as_deref()
            .ok_or_else(|| ProxyError::Config("an upstream target is required".to_string()))?;

        let overwrite_folder = match &config.overwrite_folder {
            Some(folder) if folder.is_relative() => Some(std::env::current_dir()?.join(folder)),
            other => other.clone(),
        };

        Ok(Self {
            target: parse_target(target)?,
            use_ssl: config.use_ssl.unwrap_or_else(|| config.has_tls()),
            request_headers: header_map(&config.request_headers)?,
            response_headers: header_map(&config.response_headers)?,
            preserve_compression: config.preserve_compression,
            disable_cache: config.disable_cache,
            cors: config.cors.clone(),
            proxy_external: config.proxy_external,
            proxy_external_ignores: config
                .proxy_external_ignores
                .iter()
                .map(|host| host.trim().to_ascii_lowercase())
                .filter(|host| !host.is_empty())
                .collect(),
            overwrite_folder,
            connect_timeout: Duration::from_secs(
                config.connect_timeout_secs.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
            request_timeout: Duration::from_secs(
                config.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            pool_max_idle_per_host: config
                .pool_max_idle_per_host
                .unwrap_or(DEFAULT_POOL_MAX_IDLE_PER_HOST),
        })
    }
}

/// Accepts `http`/`https` URLs with a host and reduces them to their origin.
pub fn parse_target(target: &str) -> Result<Url, ProxyError> {
    let url = Url::parse(target)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ProxyError::Config(format!(
            "invalid proxy target '{}': scheme must be http or https",
            target
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::Config(format!("invalid proxy target '{}': missing host", target)))?;

    let origin = match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    };
    Ok(Url::parse(&origin)?)
}

fn header_map(entries: &[HeaderEntry]) -> Result<HeaderMap, ProxyError> {
    let mut headers = HeaderMap::new();
    for entry in entries {
        let name = HeaderName::from_bytes(entry.name.as_bytes())
            .map_err(|e| ProxyError::Config(format!("invalid header name '{}': {}", entry.name, e)))?;
        let value = HeaderValue::from_str(&entry.value)
            .map_err(|e| ProxyError::Config(format!("invalid value for header '{}': {}", entry.name, e)))?;
        headers.append(name, value);
    }
    Ok(headers)
}
