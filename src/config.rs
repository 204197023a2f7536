//! Gateway configuration loader and validation.
//!
//! Loads the YAML gateway description and converts the raw, user-facing
//! values into the typed options the pipelines are built from. Every check
//! happens here, before anything is started.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use axum::http::Method;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::codec::CodecRegistry;
use crate::dispatch::http::{HttpSinkOptions, ProtocolVersion, SinkMethod};
use crate::dispatch::websocket::WebSocketSinkOptions;
use crate::dispatch::DispatchOptions;
use crate::ingest::EndpointOptions;
use crate::retry::RetryPolicy;

pub const DEFAULT_BUFFER_SIZE: i64 = 8;
pub const DEFAULT_JITTER: f64 = 0.5;
pub const DEFAULT_HTTP_MAX_RETRIES: i64 = 0;
pub const DEFAULT_WEBSOCKET_MAX_RETRIES: i64 = 1;
pub const DEFAULT_MAX_INFLIGHT_MESSAGES: i64 = 1;

/// Paths served by the gateway itself
pub const RESERVED_PATHS: &[&str] = &["/health", "/ready"];

/// Error type for configuration problems
///
/// All of these are fatal at construction time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse jitter value '{0}', expected a number between 0 and 1")]
    InvalidJitter(String),

    #[error("Invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("maxRetries must not be negative, but was {0}")]
    InvalidMaxRetries(i64),

    #[error("Inflights must be greater than 0, but was {0}")]
    InvalidInflights(i64),

    #[error("Buffer size must be greater than 0, but was {0}")]
    InvalidBufferSize(i64),

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported scheme for the {transport} connector in URL: {url}")]
    UnsupportedScheme { transport: &'static str, url: String },

    #[error("Unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("Unsupported HTTP protocol version: {0}. The supported versions are: HTTP_1_1, HTTP_2")]
    UnsupportedProtocolVersion(String),

    #[error("Unknown serializer: {0}")]
    UnknownSerializer(String),

    #[error("Unknown deserializer: {0}")]
    UnknownDeserializer(String),

    #[error("Invalid endpoint path '{0}', paths must start with '/'")]
    InvalidPath(String),

    #[error("Endpoint path '{0}' is reserved by the gateway")]
    ReservedPath(String),

    #[error("Duplicate endpoint {0}")]
    DuplicateEndpoint(String),

    #[error("Route '{0}' conflicts with route '{1}'")]
    ConflictingRoute(String, String),

    #[error("Sink on channel '{0}' has no source to consume from")]
    UnboundChannel(String),
}

/// A number given either as a YAML number or as a string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(f64),
    Text(String),
}

impl NumberOrString {
    /// Parse into a finite float
    pub fn to_finite(&self) -> Option<f64> {
        let value = match self {
            NumberOrString::Number(n) => *n,
            NumberOrString::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }

    fn describe(&self) -> String {
        match self {
            NumberOrString::Number(n) => n.to_string(),
            NumberOrString::Text(s) => s.clone(),
        }
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub http_sources: Vec<HttpSourceConfig>,

    #[serde(default)]
    pub websocket_sources: Vec<WebSocketSourceConfig>,

    #[serde(default)]
    pub http_sinks: Vec<HttpSinkConfig>,

    #[serde(default)]
    pub websocket_sinks: Vec<WebSocketSinkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// An HTTP endpoint accepting pushed requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSourceConfig {
    pub path: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: i64,

    #[serde(default)]
    pub broadcast: bool,

    #[serde(default)]
    pub deserializer: Option<String>,

    /// Channel the endpoint publishes to
    pub channel: String,
}

/// A WebSocket endpoint accepting frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketSourceConfig {
    pub path: String,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: i64,

    #[serde(default)]
    pub broadcast: bool,

    #[serde(default)]
    pub deserializer: Option<String>,

    pub channel: String,
}

/// An HTTP endpoint messages are delivered to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSinkConfig {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub serializer: Option<String>,

    #[serde(default = "default_http_max_retries")]
    pub max_retries: i64,

    #[serde(default)]
    pub delay: Option<String>,

    #[serde(default = "default_jitter")]
    pub jitter: NumberOrString,

    #[serde(default = "default_max_inflight_messages")]
    pub max_inflight_messages: i64,

    #[serde(default = "default_true")]
    pub wait_for_completion: bool,

    #[serde(default)]
    pub timeout: Option<String>,

    #[serde(default)]
    pub max_pool_size: Option<usize>,

    #[serde(default)]
    pub max_wait_queue_size: Option<i64>,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Channel the sink consumes from
    pub channel: String,
}

/// A WebSocket endpoint messages are delivered to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketSinkConfig {
    pub url: String,

    #[serde(default)]
    pub serializer: Option<String>,

    #[serde(default = "default_websocket_max_retries")]
    pub max_retries: i64,

    #[serde(default)]
    pub delay: Option<String>,

    #[serde(default = "default_jitter")]
    pub jitter: NumberOrString,

    #[serde(default = "default_max_inflight_messages")]
    pub max_inflight_messages: i64,

    #[serde(default = "default_true")]
    pub wait_for_completion: bool,

    #[serde(default)]
    pub timeout: Option<String>,

    pub channel: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_buffer_size() -> i64 {
    DEFAULT_BUFFER_SIZE
}

fn default_jitter() -> NumberOrString {
    NumberOrString::Number(DEFAULT_JITTER)
}

fn default_http_max_retries() -> i64 {
    DEFAULT_HTTP_MAX_RETRIES
}

fn default_websocket_max_retries() -> i64 {
    DEFAULT_WEBSOCKET_MAX_RETRIES
}

fn default_max_inflight_messages() -> i64 {
    DEFAULT_MAX_INFLIGHT_MESSAGES
}

fn default_true() -> bool {
    true
}

fn default_protocol_version() -> String {
    "HTTP_1_1".to_string()
}

impl GatewayConfig {
    /// Load gateway configuration from a YAML file.
    ///
    /// # Example
    /// ```ignore
    /// use relaygate::config::GatewayConfig;
    ///
    /// let config = GatewayConfig::load_from_file("config/gateway.yaml")?;
    /// println!("{} http sources", config.http_sources.len());
    /// ```
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Check the whole configuration against the codecs available at start-up
    pub fn validate(&self, codecs: &CodecRegistry) -> Result<(), ConfigError> {
        let mut keys = HashSet::new();
        let mut channels = HashSet::new();

        for source in &self.http_sources {
            let options = source.to_options()?;
            check_deserializer(codecs, options.deserializer.as_deref())?;
            if !keys.insert((options.path.clone(), options.method.clone())) {
                return Err(ConfigError::DuplicateEndpoint(format!(
                    "{}:{}",
                    options.path, options.method
                )));
            }
            channels.insert(source.channel.clone());
        }

        let mut ws_paths = HashSet::new();
        for source in &self.websocket_sources {
            let options = source.to_options()?;
            check_deserializer(codecs, options.deserializer.as_deref())?;
            let clashes_with_http = self
                .http_sources
                .iter()
                .any(|http| http.path == options.path);
            if clashes_with_http || !ws_paths.insert(options.path.clone()) {
                return Err(ConfigError::DuplicateEndpoint(format!("websocket {}", options.path)));
            }
            channels.insert(source.channel.clone());
        }

        let mut routes: Vec<&str> = Vec::new();
        for path in self
            .http_sources
            .iter()
            .map(|s| s.path.as_str())
            .chain(self.websocket_sources.iter().map(|s| s.path.as_str()))
        {
            if !routes.contains(&path) {
                routes.push(path);
            }
        }
        check_routes(&routes)?;

        for sink in &self.http_sinks {
            let options = sink.to_options()?;
            options.target()?;
            sink.dispatch_options()?;
            check_serializer(codecs, options.serializer.as_deref())?;
            if !channels.contains(&sink.channel) {
                return Err(ConfigError::UnboundChannel(sink.channel.clone()));
            }
        }

        for sink in &self.websocket_sinks {
            let options = sink.to_options()?;
            options.target()?;
            sink.dispatch_options()?;
            check_serializer(codecs, options.serializer.as_deref())?;
            if !channels.contains(&sink.channel) {
                return Err(ConfigError::UnboundChannel(sink.channel.clone()));
            }
        }

        Ok(())
    }
}

impl HttpSourceConfig {
    pub fn to_options(&self) -> Result<EndpointOptions, ConfigError> {
        Ok(EndpointOptions {
            path: check_path(&self.path)?,
            method: parse_method(&self.method)?,
            buffer_size: check_buffer_size(self.buffer_size)?,
            broadcast: self.broadcast,
            deserializer: self.deserializer.clone(),
        })
    }
}

impl WebSocketSourceConfig {
    pub fn to_options(&self) -> Result<EndpointOptions, ConfigError> {
        Ok(EndpointOptions {
            path: check_path(&self.path)?,
            method: Method::GET,
            buffer_size: check_buffer_size(self.buffer_size)?,
            broadcast: self.broadcast,
            deserializer: self.deserializer.clone(),
        })
    }
}

impl HttpSinkConfig {
    pub fn to_options(&self) -> Result<HttpSinkOptions, ConfigError> {
        Ok(HttpSinkOptions {
            url: self.url.clone(),
            method: SinkMethod::parse(&self.method)?,
            serializer: self.serializer.clone(),
            max_pool_size: self.max_pool_size,
            max_wait_queue_size: self.max_wait_queue_size,
            protocol_version: ProtocolVersion::parse(&self.protocol_version)?,
        })
    }

    pub fn dispatch_options(&self) -> Result<DispatchOptions, ConfigError> {
        build_dispatch_options(
            &self.url,
            self.max_retries,
            self.delay.as_deref(),
            &self.jitter,
            self.max_inflight_messages,
            self.wait_for_completion,
            self.timeout.as_deref(),
        )
    }
}

impl WebSocketSinkConfig {
    pub fn to_options(&self) -> Result<WebSocketSinkOptions, ConfigError> {
        Ok(WebSocketSinkOptions {
            url: self.url.clone(),
            serializer: self.serializer.clone(),
        })
    }

    pub fn dispatch_options(&self) -> Result<DispatchOptions, ConfigError> {
        build_dispatch_options(
            &self.url,
            self.max_retries,
            self.delay.as_deref(),
            &self.jitter,
            self.max_inflight_messages,
            self.wait_for_completion,
            self.timeout.as_deref(),
        )
    }
}

fn build_dispatch_options(
    target: &str,
    max_retries: i64,
    delay: Option<&str>,
    jitter: &NumberOrString,
    max_inflight_messages: i64,
    wait_for_completion: bool,
    timeout: Option<&str>,
) -> Result<DispatchOptions, ConfigError> {
    let retry = RetryPolicy::new(
        parse_max_retries(max_retries)?,
        delay.map(parse_duration).transpose()?,
        parse_jitter(jitter)?,
    )?;

    let mut options = DispatchOptions::new(target, max_inflight_messages)?
        .with_retry(retry)
        .wait_for_completion(wait_for_completion);
    if let Some(timeout) = timeout {
        options = options.with_timeout(parse_duration(timeout)?);
    }
    Ok(options)
}

fn check_serializer(codecs: &CodecRegistry, name: Option<&str>) -> Result<(), ConfigError> {
    match name {
        Some(name) if !codecs.has_serializer(name) => Err(ConfigError::UnknownSerializer(name.to_string())),
        _ => Ok(()),
    }
}

fn check_deserializer(codecs: &CodecRegistry, name: Option<&str>) -> Result<(), ConfigError> {
    match name {
        Some(name) if !codecs.has_deserializer(name) => Err(ConfigError::UnknownDeserializer(name.to_string())),
        _ => Ok(()),
    }
}

fn check_path(path: &str) -> Result<String, ConfigError> {
    if !path.starts_with('/') {
        return Err(ConfigError::InvalidPath(path.to_string()));
    }
    if RESERVED_PATHS.contains(&path) {
        return Err(ConfigError::ReservedPath(path.to_string()));
    }
    Ok(path.to_string())
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Static(&'a str),
    Param(&'a str),
    CatchAll(&'a str),
}

/// Split a route into segments, rejecting syntax the router cannot take
fn route_segments(path: &str) -> Result<Vec<Segment<'_>>, ConfigError> {
    let invalid = || ConfigError::InvalidPath(path.to_string());
    let parts: Vec<&str> = path.split('/').skip(1).collect();
    let mut segments = Vec::with_capacity(parts.len());

    for (index, part) in parts.iter().enumerate() {
        let segment = if let Some(name) = part.strip_prefix(':') {
            Segment::Param(name)
        } else if let Some(name) = part.strip_prefix('*') {
            if index + 1 != parts.len() {
                return Err(invalid());
            }
            Segment::CatchAll(name)
        } else {
            Segment::Static(part)
        };

        match segment {
            Segment::Param(name) | Segment::CatchAll(name)
                if name.is_empty() || name.contains([':', '*']) =>
            {
                return Err(invalid())
            }
            Segment::Static(text) if text.contains([':', '*']) => return Err(invalid()),
            _ => {}
        }
        segments.push(segment);
    }
    Ok(segments)
}

/// Whether two distinct routes can not live in the same router.
///
/// Routes walking the same static prefix must use the same parameter name at
/// the same position, and a catch-all only coexists with routes that diverge
/// on a static segment before it.
fn routes_conflict(a: &[Segment<'_>], b: &[Segment<'_>]) -> bool {
    for (left, right) in a.iter().zip(b) {
        match (left, right) {
            (Segment::Static(x), Segment::Static(y)) if x == y => continue,
            (Segment::Static(_), Segment::Static(_)) => return false,
            (Segment::Param(x), Segment::Param(y)) if x == y => continue,
            (Segment::Param(_), Segment::Param(_)) => return true,
            (Segment::CatchAll(_), _) | (_, Segment::CatchAll(_)) => return true,
            // Static segments take priority over a parameter
            _ => return false,
        }
    }
    false
}

/// Reject malformed routes and pairs the router would refuse to hold together
fn check_routes(paths: &[&str]) -> Result<(), ConfigError> {
    let parsed = paths
        .iter()
        .map(|path| route_segments(path).map(|segments| (*path, segments)))
        .collect::<Result<Vec<_>, _>>()?;

    for (i, (path, segments)) in parsed.iter().enumerate() {
        for (other, other_segments) in &parsed[..i] {
            if routes_conflict(other_segments, segments) {
                return Err(ConfigError::ConflictingRoute(path.to_string(), other.to_string()));
            }
        }
    }
    Ok(())
}

fn check_buffer_size(size: i64) -> Result<usize, ConfigError> {
    if size < 1 {
        return Err(ConfigError::InvalidBufferSize(size));
    }
    usize::try_from(size).map_err(|_| ConfigError::InvalidBufferSize(size))
}

/// Parse a standard HTTP method name (case-insensitive)
pub fn parse_method(method: &str) -> Result<Method, ConfigError> {
    match method.trim().to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        "PATCH" => Ok(Method::PATCH),
        "HEAD" => Ok(Method::HEAD),
        "OPTIONS" => Ok(Method::OPTIONS),
        "TRACE" => Ok(Method::TRACE),
        _ => Err(ConfigError::UnsupportedMethod(method.to_string())),
    }
}

/// Validate a retry count
pub fn parse_max_retries(max_retries: i64) -> Result<u32, ConfigError> {
    u32::try_from(max_retries).map_err(|_| ConfigError::InvalidMaxRetries(max_retries))
}

/// Parse and validate a jitter factor
pub fn parse_jitter(jitter: &NumberOrString) -> Result<f64, ConfigError> {
    match jitter.to_finite() {
        Some(value) if (0.0..=1.0).contains(&value) => Ok(value),
        _ => Err(ConfigError::InvalidJitter(jitter.describe())),
    }
}

fn simple_duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)(ms|s|m|h|d)?$").expect("valid duration regex"))
}

fn iso_duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^P(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?)?$")
            .expect("valid ISO-8601 duration regex")
    })
}

/// Parse a duration.
///
/// Accepts ISO-8601 (`PT1S`, `PT0.5S`, `P1DT2H`), a number with a unit
/// suffix (`500ms`, `10s`, `2m`, `1h`, `1d`), or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let trimmed = value.trim();
    let invalid = || ConfigError::InvalidDuration(value.to_string());

    if let Some(caps) = simple_duration_regex().captures(trimmed) {
        let amount: u64 = caps[1].parse().map_err(|_| invalid())?;
        let duration = match caps.get(2).map(|m| m.as_str()) {
            Some("ms") => Duration::from_millis(amount),
            None | Some("s") => Duration::from_secs(amount),
            Some("m") => Duration::from_secs(amount.checked_mul(60).ok_or_else(invalid)?),
            Some("h") => Duration::from_secs(amount.checked_mul(3600).ok_or_else(invalid)?),
            Some("d") => Duration::from_secs(amount.checked_mul(86_400).ok_or_else(invalid)?),
            Some(_) => return Err(invalid()),
        };
        return Ok(duration);
    }

    let upper = trimmed.to_ascii_uppercase();
    let caps = iso_duration_regex().captures(&upper).ok_or_else(invalid)?;
    if upper == "P" || upper.ends_with('T') {
        return Err(invalid());
    }

    let part = |index: usize| -> Result<f64, ConfigError> {
        caps.get(index)
            .map(|m| m.as_str().parse::<f64>().map_err(|_| invalid()))
            .unwrap_or(Ok(0.0))
    };
    let seconds = part(1)? * 86_400.0 + part(2)? * 3600.0 + part(3)? * 60.0 + part(4)?;
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
server:
  port: 9090
http_sources:
  - path: /orders
    channel: orders
  - path: /users/:id
    method: put
    buffer_size: 13
    broadcast: true
    channel: users
websocket_sources:
  - path: /ws/prices
    deserializer: json
    channel: prices
http_sinks:
  - url: http://localhost:9000/orders/{id}
    channel: orders
    max_retries: 3
    delay: 100ms
    jitter: "0.2"
websocket_sinks:
  - url: ws://localhost:9001/prices
    channel: prices
"#;

    #[test]
    fn test_parse_sample_with_defaults() {
        let config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.http_sources.len(), 2);
        assert_eq!(config.http_sources[0].method, "POST");
        assert_eq!(config.http_sources[0].buffer_size, 8);
        assert!(!config.http_sources[0].broadcast);
        assert_eq!(config.http_sources[1].buffer_size, 13);

        let http_sink = &config.http_sinks[0];
        assert_eq!(http_sink.max_inflight_messages, 1);
        assert!(http_sink.wait_for_completion);
        let dispatch = http_sink.dispatch_options().unwrap();
        assert_eq!(dispatch.retry().max_retries(), 3);
        assert_eq!(dispatch.retry().delay(), Some(Duration::from_millis(100)));
        assert!((dispatch.retry().jitter() - 0.2).abs() < f64::EPSILON);

        let ws_sink = &config.websocket_sinks[0];
        let dispatch = ws_sink.dispatch_options().unwrap();
        assert_eq!(dispatch.retry().max_retries(), 1);
        assert!((dispatch.retry().jitter() - 0.5).abs() < f64::EPSILON);

        config.validate(&CodecRegistry::default()).unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = GatewayConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.websocket_sources[0].path, "/ws/prices");
    }

    #[test]
    fn test_missing_file_is_reported() {
        let result = GatewayConfig::load_from_file("/definitely/not/here.yaml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_source_method_is_normalized() {
        let config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        let options = config.http_sources[1].to_options().unwrap();
        assert_eq!(options.method, Method::PUT);
    }

    #[test]
    fn test_parse_duration_formats() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("PT1S").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("PT0.5S").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("pt1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("P1DT1H").unwrap(), Duration::from_secs(90_000));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("P").is_err());
        assert!(parse_duration("PT").is_err());
        assert!(parse_duration("ten seconds").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn test_parse_jitter() {
        assert_eq!(parse_jitter(&NumberOrString::Text("0.25".into())).unwrap(), 0.25);
        assert_eq!(parse_jitter(&NumberOrString::Number(1.0)).unwrap(), 1.0);
        assert!(matches!(
            parse_jitter(&NumberOrString::Text("abc".into())),
            Err(ConfigError::InvalidJitter(_))
        ));
        assert!(parse_jitter(&NumberOrString::Text("NaN".into())).is_err());
        assert!(parse_jitter(&NumberOrString::Number(2.0)).is_err());
    }

    #[test]
    fn test_negative_retries_rejected() {
        assert!(matches!(parse_max_retries(-1), Err(ConfigError::InvalidMaxRetries(-1))));
        assert_eq!(parse_max_retries(0).unwrap(), 0);
    }

    #[test]
    fn test_non_positive_inflights_rejected() {
        let mut config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        config.http_sinks[0].max_inflight_messages = 0;
        assert!(matches!(
            config.http_sinks[0].dispatch_options(),
            Err(ConfigError::InvalidInflights(0))
        ));
    }

    #[test]
    fn test_duplicate_endpoint_rejected() {
        let mut config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        let mut duplicate = config.http_sources[0].clone();
        duplicate.method = "post".to_string();
        config.http_sources.push(duplicate);

        let result = config.validate(&CodecRegistry::default());
        assert!(matches!(result, Err(ConfigError::DuplicateEndpoint(_))));
    }

    #[test]
    fn test_reserved_and_relative_paths_rejected() {
        let mut config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        config.http_sources[0].path = "/health".to_string();
        assert!(matches!(
            config.validate(&CodecRegistry::default()),
            Err(ConfigError::ReservedPath(_))
        ));

        config.http_sources[0].path = "orders".to_string();
        assert!(matches!(
            config.validate(&CodecRegistry::default()),
            Err(ConfigError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_unknown_codecs_rejected() {
        let mut config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        config.http_sinks[0].serializer = Some("protobuf".to_string());
        assert!(matches!(
            config.validate(&CodecRegistry::default()),
            Err(ConfigError::UnknownSerializer(_))
        ));

        let mut config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        config.websocket_sources[0].deserializer = Some("avro".to_string());
        assert!(matches!(
            config.validate(&CodecRegistry::default()),
            Err(ConfigError::UnknownDeserializer(_))
        ));
    }

    #[test]
    fn test_unbound_sink_channel_rejected() {
        let mut config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        config.http_sinks[0].channel = "nowhere".to_string();
        assert!(matches!(
            config.validate(&CodecRegistry::default()),
            Err(ConfigError::UnboundChannel(_))
        ));
    }

    #[test]
    fn test_sink_scheme_checked_per_transport() {
        let mut config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        config.http_sinks[0].url = "ws://localhost:9000/orders".to_string();
        assert!(matches!(
            config.validate(&CodecRegistry::default()),
            Err(ConfigError::UnsupportedScheme { transport: "http", .. })
        ));

        let mut config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        config.websocket_sinks[0].url = "https://localhost:9001/prices".to_string();
        assert!(matches!(
            config.validate(&CodecRegistry::default()),
            Err(ConfigError::UnsupportedScheme { transport: "websocket", .. })
        ));
    }

    #[test]
    fn test_conflicting_parameter_names_rejected() {
        let mut config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        config.http_sources[0].path = "/users/:name".to_string();

        assert!(matches!(
            config.validate(&CodecRegistry::default()),
            Err(ConfigError::ConflictingRoute(_, _))
        ));
    }

    #[test]
    fn test_websocket_route_conflicting_with_http_rejected() {
        let mut config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        config.websocket_sources[0].path = "/users/:user".to_string();

        assert!(matches!(
            config.validate(&CodecRegistry::default()),
            Err(ConfigError::ConflictingRoute(_, _))
        ));
    }

    #[test]
    fn test_route_shapes() {
        assert!(check_routes(&["/users/:id", "/users/:id/orders", "/users/new", "/orders"]).is_ok());
        assert!(check_routes(&["/files/*rest", "/static/logo"]).is_ok());
        assert!(check_routes(&["/users/:id", "/users/:name/orders"]).is_err());
        assert!(check_routes(&["/files/*rest", "/files/:id"]).is_err());

        for malformed in ["/users/:", "/files/*", "/files/*rest/more", "/a:b", "/users/:id:x"] {
            assert!(
                matches!(check_routes(&[malformed]), Err(ConfigError::InvalidPath(_))),
                "{} accepted",
                malformed
            );
        }
    }

    #[test]
    fn test_unsupported_sink_method_and_version() {
        let mut config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        config.http_sinks[0].method = "DELETE".to_string();
        assert!(matches!(config.http_sinks[0].to_options(), Err(ConfigError::UnsupportedMethod(_))));

        config.http_sinks[0].method = "PUT".to_string();
        config.http_sinks[0].protocol_version = "HTTP_3".to_string();
        assert!(matches!(
            config.http_sinks[0].to_options(),
            Err(ConfigError::UnsupportedProtocolVersion(_))
        ));
    }
}
