//! Messages flowing between the gateway and the internal pipeline.
//!
//! A [`Message`] is immutable: payload and metadata are shared, and the
//! `with_*` methods produce derived messages that keep the original's
//! acknowledgement, so acking a derived message acks the original.

pub mod ack;
pub mod metadata;

use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::ingest::guard::AdmissionPermit;

pub use ack::{AckHandler, Completion, NackReason, Outcome};
pub use metadata::{Metadata, MetadataKind, MetadataValue, OutgoingHttpMetadata, RequestMetadata};

use ack::AckState;

/// Message payload
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    /// Raw bytes of the payload; JSON is rendered compactly
    pub fn to_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Payload::Bytes(bytes) => Cow::Borrowed(bytes),
            Payload::Text(text) => Cow::Borrowed(text.as_bytes()),
            Payload::Json(value) => Cow::Owned(value.to_string().into_bytes()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            Payload::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

#[derive(Clone)]
pub struct Message {
    id: Uuid,
    payload: Arc<Payload>,
    metadata: Arc<Metadata>,
    ack: Arc<AckState>,
}

impl Message {
    /// Create an untracked message; ack and nack only mark it completed
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self::build(payload.into(), Metadata::new(), None, None)
    }

    /// Create a message whose outcome can be awaited through the returned [`Completion`]
    pub fn tracked(payload: impl Into<Payload>) -> (Self, Completion) {
        let (handler, completion) = Completion::channel();
        let message = Self::build(payload.into(), Metadata::new(), Some(handler), None);
        (message, completion)
    }

    /// Create a message reporting its outcome to a custom handler
    pub fn with_ack_handler(payload: impl Into<Payload>, handler: impl AckHandler) -> Self {
        Self::build(payload.into(), Metadata::new(), Some(Box::new(handler)), None)
    }

    /// Message created on admission by an ingestion endpoint; holds the admission slot
    pub(crate) fn admitted(payload: Payload, metadata: Metadata, permit: AdmissionPermit) -> (Self, Completion) {
        let (handler, completion) = Completion::channel();
        let message = Self::build(payload, metadata, Some(handler), Some(permit));
        (message, completion)
    }

    fn build(
        payload: Payload,
        metadata: Metadata,
        handler: Option<Box<dyn AckHandler>>,
        permit: Option<AdmissionPermit>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload: Arc::new(payload),
            metadata: Arc::new(metadata),
            ack: Arc::new(AckState::new(handler, permit)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Derived message with another payload
    pub fn with_payload(&self, payload: impl Into<Payload>) -> Self {
        Self {
            payload: Arc::new(payload.into()),
            ..self.clone()
        }
    }

    /// Derived message with the metadata replaced
    pub fn with_metadata(&self, metadata: Metadata) -> Self {
        Self {
            metadata: Arc::new(metadata),
            ..self.clone()
        }
    }

    /// Derived message with one metadata value added or replaced
    pub fn add_metadata(&self, value: impl Into<MetadataValue>) -> Self {
        let mut metadata = (*self.metadata).clone();
        metadata.insert(value);
        self.with_metadata(metadata)
    }

    /// Acknowledge the message. Returns `false` if it was already completed.
    pub async fn ack(&self) -> bool {
        self.ack.complete(Ok(())).await
    }

    /// Negatively acknowledge the message. Returns `false` if it was already completed.
    pub async fn nack(&self, reason: impl Into<Box<dyn Error + Send + Sync>>) -> bool {
        let reason: NackReason = Arc::from(reason.into());
        self.ack.complete(Err(reason)).await
    }

    pub fn is_completed(&self) -> bool {
        self.ack.is_completed()
    }

    /// Set how many subscribers receive a copy of this message
    pub(crate) fn expect_receivers(&self, count: usize) {
        self.ack.expect_receivers(count);
    }

    /// Called when a consumer takes the message out of an ingestion buffer
    pub(crate) fn release_admission(&self) {
        self.ack.release_admission();
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("metadata", &self.metadata)
            .field("completed", &self.is_completed())
            .finish()
    }
}
