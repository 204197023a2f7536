//! HTTP sink transport.
//!
//! Sends each message as one `POST` or `PUT` request. The URL may contain
//! `{name}` tokens that are filled from the message's outgoing HTTP metadata.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Url};
use tokio::sync::Semaphore;

use crate::codec::{CodecRegistry, Serializer};
use crate::config::ConfigError;
use crate::message::{Message, Metadata, Payload};

use super::{DeliveryError, Transport};

const SUPPORTED_SCHEMES: &[&str] = &["http", "https"];

/// Methods an HTTP sink can use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkMethod {
    Post,
    Put,
}

impl SinkMethod {
    pub fn parse(method: &str) -> Result<Self, ConfigError> {
        match method.trim().to_ascii_uppercase().as_str() {
            "POST" => Ok(SinkMethod::Post),
            "PUT" => Ok(SinkMethod::Put),
            _ => Err(ConfigError::UnsupportedMethod(format!(
                "{}, only PUT and POST are supported",
                method
            ))),
        }
    }

    pub fn as_method(&self) -> Method {
        match self {
            SinkMethod::Post => Method::POST,
            SinkMethod::Put => Method::PUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[default]
    Http11,
    Http2,
}

impl ProtocolVersion {
    pub fn parse(version: &str) -> Result<Self, ConfigError> {
        match version.trim() {
            "HTTP_1_1" => Ok(ProtocolVersion::Http11),
            "HTTP_2" => Ok(ProtocolVersion::Http2),
            other => Err(ConfigError::UnsupportedProtocolVersion(other.to_string())),
        }
    }
}

/// Validated settings of an HTTP sink
#[derive(Debug, Clone, PartialEq)]
pub struct HttpSinkOptions {
    /// Absolute URL template
    pub url: String,
    pub method: SinkMethod,
    pub serializer: Option<String>,
    /// Idle connections kept per host
    pub max_pool_size: Option<usize>,
    /// Requests allowed to wait beyond the pool; negative means unbounded
    pub max_wait_queue_size: Option<i64>,
    pub protocol_version: ProtocolVersion,
}

impl HttpSinkOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: SinkMethod::Post,
            serializer: None,
            max_pool_size: None,
            max_wait_queue_size: None,
            protocol_version: ProtocolVersion::Http11,
        }
    }

    /// Parse the URL template and check its scheme
    pub fn target(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.url).map_err(|e| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(ConfigError::UnsupportedScheme {
                transport: "http",
                url: self.url.clone(),
            });
        }
        Ok(url)
    }

    /// Concurrent requests allowed before new ones are refused, if bounded
    fn request_limit(&self) -> Option<usize> {
        match (self.max_pool_size, self.max_wait_queue_size) {
            (Some(pool), Some(queue)) if queue >= 0 => Some(pool.saturating_add(queue as usize)),
            _ => None,
        }
    }
}

pub struct HttpTransport {
    url: String,
    method: SinkMethod,
    client: Client,
    serializer: Arc<dyn Serializer>,
    requests: Option<Semaphore>,
}

impl HttpTransport {
    pub fn new(options: HttpSinkOptions, codecs: &CodecRegistry) -> Result<Self, ConfigError> {
        options.target()?;
        let serializer = codecs
            .serializer(options.serializer.as_deref())
            .map_err(|_| ConfigError::UnknownSerializer(options.serializer.clone().unwrap_or_default()))?;

        let mut builder = Client::builder();
        if let Some(pool) = options.max_pool_size {
            builder = builder.pool_max_idle_per_host(pool);
        }
        builder = match options.protocol_version {
            ProtocolVersion::Http11 => builder.http1_only(),
            ProtocolVersion::Http2 => builder.http2_prior_knowledge(),
        };
        let client = builder
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            requests: options.request_limit().map(Semaphore::new),
            url: options.url,
            method: options.method,
            client,
            serializer,
        })
    }

    /// Substitute `{name}` tokens of the URL template with path parameters
    pub fn prepare_url(&self, path_params: &IndexMap<String, String>) -> String {
        fill_template(&self.url, path_params)
    }

    fn build_request(&self, metadata: &Metadata) -> Result<(Url, HeaderMap), DeliveryError> {
        let outgoing = metadata.outgoing_http();

        let prepared = match outgoing {
            Some(outgoing) => self.prepare_url(outgoing.path_params()),
            None => self.url.clone(),
        };
        let mut url = Url::parse(&prepared).map_err(|e| self.invalid(e))?;

        let mut headers: IndexMap<String, Vec<String>> = outgoing
            .map(|outgoing| outgoing.headers().clone())
            .unwrap_or_default();
        if let Some(cloud_event) = metadata.outgoing_cloud_event() {
            for (name, value) in cloud_event.to_headers() {
                headers.insert(name, vec![value]);
            }
        }

        if let Some(outgoing) = outgoing {
            if !outgoing.query().is_empty() {
                let mut pairs = url.query_pairs_mut();
                for (name, values) in outgoing.query() {
                    for value in values {
                        pairs.append_pair(name, value);
                    }
                }
            }
        }

        let mut header_map = HeaderMap::new();
        for (name, values) in &headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| self.invalid(e))?;
            for value in values {
                let value = HeaderValue::from_str(value).map_err(|e| self.invalid(e))?;
                header_map.append(name.clone(), value);
            }
        }

        Ok((url, header_map))
    }

    fn invalid(&self, error: impl std::fmt::Display) -> DeliveryError {
        DeliveryError::InvalidRequest {
            url: self.url.clone(),
            reason: error.to_string(),
        }
    }
}

/// Replace every `{name}` token of `template`; names without a token are logged and skipped.
///
/// Values are percent-encoded as a single path segment, so `/`, `?` and `#`
/// in a value can not change the path, query or fragment of the target.
pub fn fill_template(template: &str, path_params: &IndexMap<String, String>) -> String {
    let mut result = template.to_string();
    for (name, value) in path_params {
        let token = format!("{{{}}}", name);
        if template.contains(&token) {
            result = result.replace(&token, &encode_path_segment(value));
        } else {
            tracing::warn!(
                "Failed to find {} in the URL that would correspond to the {} path parameter",
                token,
                name
            );
        }
    }
    result
}

/// Percent-encode everything except RFC 3986 unreserved characters
fn encode_path_segment(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(char::from(byte))
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

#[async_trait]
impl Transport for HttpTransport {
    fn target(&self) -> &str {
        &self.url
    }

    async fn send(&self, message: &Message) -> Result<(), DeliveryError> {
        let body = self.serializer.serialize(message.payload())?;
        let (url, mut headers) = self.build_request(message.metadata())?;
        if !headers.contains_key(CONTENT_TYPE) {
            if let Payload::Json(_) = message.payload() {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
        }

        let _slot = match &self.requests {
            Some(requests) => Some(
                requests
                    .try_acquire()
                    .map_err(|_| DeliveryError::QueueFull(self.url.clone()))?,
            ),
            None => None,
        };

        tracing::debug!("Invoking request: {} {} ({} bytes)", self.method.as_method(), url, body.len());
        let response = self
            .client
            .request(self.method.as_method(), url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|source| DeliveryError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }
}
