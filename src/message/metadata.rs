//! Structured metadata attached to messages.
//!
//! A message carries at most one value per [`MetadataKind`]; kinds keep the
//! order in which they were attached.

use axum::http::{HeaderMap, Method};
use indexmap::IndexMap;

use crate::cloud_event::CloudEventMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    /// Transport event an ingested message came from
    Request,
    /// Headers, query and path parameters for an HTTP delivery
    OutgoingHttp,
    /// Cloud-event attributes decoded from an incoming request
    CloudEvent,
    /// Cloud-event attributes to encode on an outgoing request
    OutgoingCloudEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Request(RequestMetadata),
    OutgoingHttp(OutgoingHttpMetadata),
    CloudEvent(CloudEventMetadata),
    OutgoingCloudEvent(CloudEventMetadata),
}

impl MetadataValue {
    pub fn kind(&self) -> MetadataKind {
        match self {
            MetadataValue::Request(_) => MetadataKind::Request,
            MetadataValue::OutgoingHttp(_) => MetadataKind::OutgoingHttp,
            MetadataValue::CloudEvent(_) => MetadataKind::CloudEvent,
            MetadataValue::OutgoingCloudEvent(_) => MetadataKind::OutgoingCloudEvent,
        }
    }
}

impl From<RequestMetadata> for MetadataValue {
    fn from(value: RequestMetadata) -> Self {
        MetadataValue::Request(value)
    }
}

impl From<OutgoingHttpMetadata> for MetadataValue {
    fn from(value: OutgoingHttpMetadata) -> Self {
        MetadataValue::OutgoingHttp(value)
    }
}

/// Ordered mapping of metadata kind to value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: IndexMap<MetadataKind, MetadataValue>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, value: impl Into<MetadataValue>) -> Self {
        self.insert(value);
        self
    }

    /// Insert a value, replacing any previous value of the same kind
    pub fn insert(&mut self, value: impl Into<MetadataValue>) -> Option<MetadataValue> {
        let value = value.into();
        self.entries.insert(value.kind(), value)
    }

    pub fn get(&self, kind: MetadataKind) -> Option<&MetadataValue> {
        self.entries.get(&kind)
    }

    pub fn contains(&self, kind: MetadataKind) -> bool {
        self.entries.contains_key(&kind)
    }

    pub fn request(&self) -> Option<&RequestMetadata> {
        match self.get(MetadataKind::Request) {
            Some(MetadataValue::Request(m)) => Some(m),
            _ => None,
        }
    }

    pub fn outgoing_http(&self) -> Option<&OutgoingHttpMetadata> {
        match self.get(MetadataKind::OutgoingHttp) {
            Some(MetadataValue::OutgoingHttp(m)) => Some(m),
            _ => None,
        }
    }

    pub fn cloud_event(&self) -> Option<&CloudEventMetadata> {
        match self.get(MetadataKind::CloudEvent) {
            Some(MetadataValue::CloudEvent(m)) => Some(m),
            _ => None,
        }
    }

    pub fn outgoing_cloud_event(&self) -> Option<&CloudEventMetadata> {
        match self.get(MetadataKind::OutgoingCloudEvent) {
            Some(MetadataValue::OutgoingCloudEvent(m)) => Some(m),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetadataValue> {
        self.entries.values()
    }
}

/// Metadata captured from an incoming HTTP request or WebSocket upgrade.
///
/// The configured path may differ from the invoked one when the route uses
/// path parameters: `/users/:id` is invoked as `/users/42`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestMetadata {
    /// HTTP method, absent for WebSocket frames
    pub method: Option<Method>,
    pub configured_path: String,
    pub invoked_path: String,
    pub path_params: IndexMap<String, String>,
    /// Query parameters in request order, possibly repeated
    pub query_params: Vec<(String, String)>,
    pub headers: HeaderMap,
}

impl RequestMetadata {
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    /// First value of a query parameter
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn query_values(&self, name: &str) -> Vec<&str> {
        self.query_params
            .iter()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .collect()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Per-message overrides for an HTTP delivery
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingHttpMetadata {
    headers: IndexMap<String, Vec<String>>,
    query: IndexMap<String, Vec<String>>,
    path_params: IndexMap<String, String>,
}

impl OutgoingHttpMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn add_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.entry(name.into()).or_default().push(value.into());
        self
    }

    /// Value substituted for the `{name}` token of the sink URL
    pub fn add_path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.insert(name.into(), value.into());
        self
    }

    pub fn headers(&self) -> &IndexMap<String, Vec<String>> {
        &self.headers
    }

    pub fn query(&self) -> &IndexMap<String, Vec<String>> {
        &self.query
    }

    pub fn path_params(&self) -> &IndexMap<String, String> {
        &self.path_params
    }
}
