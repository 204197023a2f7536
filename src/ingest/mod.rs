//! Ingestion side of the gateway.
//!
//! Every configured source is an [`IngestEndpoint`] keyed by `(path, method)`.
//! An endpoint admits pushed bodies through its [`AdmissionGuard`], turns them
//! into messages and hands them to its subscribers; the external request is
//! completed once the message is acknowledged.

pub mod guard;
pub mod http;
pub mod stream;
pub mod websocket;

use std::fmt;
use std::sync::Arc;

use axum::http::Method;
use indexmap::IndexMap;

use crate::codec::{CodecError, CodecRegistry, Deserializer};
use crate::config::ConfigError;
use crate::message::{Completion, Message, Metadata, NackReason, Outcome};

pub use guard::{AdmissionGuard, AdmissionPermit};
pub use stream::{MessageStream, Processor};

/// Body returned to external callers on any unexpected failure
pub const UNEXPECTED_ERROR_BODY: &str = "Unexpected error while processing the message";

/// Error type for a single ingestion attempt
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("No consumer subscribed for messages sent to endpoint {0}")]
    NoSubscriber(EndpointKey),

    #[error("Buffer of endpoint {0} is full")]
    Overflow(EndpointKey),

    #[error("Failed to deserialize message body: {0}")]
    Deserialize(#[from] CodecError),

    #[error("Emitting message to endpoint {0} failed")]
    Emit(EndpointKey),

    #[error("Failed to process message: {0}")]
    Nacked(NackReason),

    #[error("Message was dropped without acknowledgement")]
    Dropped,
}

impl IngestError {
    pub fn is_overflow(&self) -> bool {
        matches!(self, IngestError::Overflow(_))
    }
}

/// Identity of one ingestion endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub path: String,
    pub method: Method,
}

impl EndpointKey {
    pub fn new(path: impl Into<String>, method: Method) -> Self {
        Self {
            path: path.into(),
            method,
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.method)
    }
}

/// Validated settings of one endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointOptions {
    pub path: String,
    pub method: Method,
    pub buffer_size: usize,
    pub broadcast: bool,
    pub deserializer: Option<String>,
}

impl EndpointOptions {
    pub fn new(path: impl Into<String>, method: Method) -> Self {
        Self {
            path: path.into(),
            method,
            buffer_size: crate::config::DEFAULT_BUFFER_SIZE as usize,
            broadcast: false,
            deserializer: None,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn with_deserializer(mut self, name: impl Into<String>) -> Self {
        self.deserializer = Some(name.into());
        self
    }
}

/// One ingestion pipeline
pub struct IngestEndpoint {
    key: EndpointKey,
    guard: Arc<AdmissionGuard>,
    processor: Processor,
    deserializer: Arc<dyn Deserializer>,
}

impl IngestEndpoint {
    /// Build an endpoint, resolving its deserializer
    pub fn new(options: EndpointOptions, codecs: &CodecRegistry) -> Result<Self, ConfigError> {
        let deserializer = codecs
            .deserializer(options.deserializer.as_deref())
            .map_err(|_| ConfigError::UnknownDeserializer(options.deserializer.clone().unwrap_or_default()))?;
        if options.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize(0));
        }

        Ok(Self {
            key: EndpointKey::new(options.path, options.method),
            guard: Arc::new(AdmissionGuard::new(options.buffer_size)),
            processor: Processor::new(options.broadcast),
            deserializer,
        })
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    /// Register a consumer of this endpoint's messages
    pub fn subscribe(&self) -> MessageStream {
        self.processor.subscribe()
    }

    pub fn has_subscribers(&self) -> bool {
        self.processor.has_subscribers()
    }

    /// Detach every consumer; later requests fail as unsubscribed
    pub fn close(&self) {
        self.processor.close();
    }

    /// Messages admitted and not yet taken by a consumer or completed
    pub fn in_use(&self) -> usize {
        self.guard.in_use()
    }

    pub fn buffer_size(&self) -> usize {
        self.guard.capacity()
    }

    /// Admit one pushed body without waiting for its acknowledgement.
    ///
    /// Never blocks: a full buffer is rejected immediately with [`IngestError::Overflow`].
    pub fn admit(&self, body: &[u8], metadata: Metadata) -> Result<Completion, IngestError> {
        if !self.processor.has_subscribers() {
            return Err(IngestError::NoSubscriber(self.key.clone()));
        }

        let Some(permit) = self.guard.try_admit() else {
            return Err(IngestError::Overflow(self.key.clone()));
        };

        // The permit is dropped with the error, freeing the slot
        let payload = self.deserializer.deserialize(body)?;

        let (message, completion) = Message::admitted(payload, metadata, permit);
        if let Err(message) = self.processor.emit(message) {
            drop(message);
            return Err(IngestError::Emit(self.key.clone()));
        }

        tracing::debug!("Message admitted on {} ({} in use)", self.key, self.guard.in_use());
        Ok(completion)
    }

    /// Admit one pushed body and wait until it is acknowledged
    pub async fn ingest(&self, body: &[u8], metadata: Metadata) -> Result<(), IngestError> {
        let completion = self.admit(body, metadata)?;
        match completion.wait().await {
            Outcome::Acked => Ok(()),
            Outcome::Nacked(reason) => Err(IngestError::Nacked(reason)),
            Outcome::Dropped => Err(IngestError::Dropped),
        }
    }
}

impl fmt::Debug for IngestEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestEndpoint")
            .field("key", &self.key)
            .field("guard", &self.guard)
            .field("broadcast", &self.processor.is_broadcast())
            .finish()
    }
}

/// Endpoints of the gateway, looked up by key while serving requests.
///
/// Populated once at start-up and read-only afterwards.
#[derive(Debug, Default)]
pub struct IngestRegistry {
    http: IndexMap<EndpointKey, Arc<IngestEndpoint>>,
    websocket: IndexMap<String, Arc<IngestEndpoint>>,
}

impl IngestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an HTTP endpoint; a second endpoint with the same key is rejected
    pub fn register_http(&mut self, endpoint: IngestEndpoint) -> Result<Arc<IngestEndpoint>, ConfigError> {
        let key = endpoint.key().clone();
        if self.http.contains_key(&key) {
            return Err(ConfigError::DuplicateEndpoint(key.to_string()));
        }
        let endpoint = Arc::new(endpoint);
        self.http.insert(key, Arc::clone(&endpoint));
        Ok(endpoint)
    }

    /// Register a WebSocket endpoint, keyed by its path
    pub fn register_websocket(&mut self, endpoint: IngestEndpoint) -> Result<Arc<IngestEndpoint>, ConfigError> {
        let path = endpoint.key().path.clone();
        if self.websocket.contains_key(&path) || self.http.keys().any(|key| key.path == path) {
            return Err(ConfigError::DuplicateEndpoint(format!("websocket {}", path)));
        }
        let endpoint = Arc::new(endpoint);
        self.websocket.insert(path, Arc::clone(&endpoint));
        Ok(endpoint)
    }

    pub fn http_endpoint(&self, path: &str, method: &Method) -> Option<&Arc<IngestEndpoint>> {
        self.http.get(&EndpointKey::new(path, method.clone()))
    }

    pub fn websocket_endpoint(&self, path: &str) -> Option<&Arc<IngestEndpoint>> {
        self.websocket.get(path)
    }

    pub fn http_endpoints(&self) -> impl Iterator<Item = &Arc<IngestEndpoint>> {
        self.http.values()
    }

    pub fn websocket_endpoints(&self) -> impl Iterator<Item = &Arc<IngestEndpoint>> {
        self.websocket.values()
    }

    /// True when every endpoint has at least one consumer
    pub fn all_subscribed(&self) -> bool {
        self.http_endpoints()
            .chain(self.websocket_endpoints())
            .all(|endpoint| endpoint.has_subscribers())
    }

    /// Detach the consumers of every endpoint
    pub fn close(&self) {
        for endpoint in self.http_endpoints().chain(self.websocket_endpoints()) {
            endpoint.close();
        }
    }

    pub fn len(&self) -> usize {
        self.http.len() + self.websocket.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
