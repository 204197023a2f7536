//! # Relaygate: Bounded HTTP/WebSocket Gateway
//!
//! Relaygate bridges external peers with an internal message pipeline. It
//! accepts pushed HTTP requests and WebSocket frames, hands them to consumers
//! as acknowledgeable messages, and delivers processed messages to remote
//! HTTP or WebSocket endpoints.
//!
//! ## Features
//!
//! - **Bounded ingestion**: every source admits a fixed number of unacknowledged messages and rejects the rest
//! - **Bounded dispatch**: every sink keeps at most `max_inflight_messages` deliveries in flight, with retries and backoff
//! - **Shared connections**: WebSocket sinks reuse one connection and resolve concurrent connects atomically
//! - **Cloud events**: `ce-` headers are mapped to and from structured metadata
//! - **Codec registry**: named serializers and deserializers, selected per endpoint
//!
//! ## Example: Gateway Configuration
//!
//! ```yaml
//! http_sources:
//!   - path: /orders/:id
//!     method: POST
//!     buffer_size: 8
//!     channel: orders
//! http_sinks:
//!   - url: http://backend:9000/orders/{id}
//!     channel: orders
//!     max_retries: 3
//!     delay: 100ms
//!     max_inflight_messages: 16
//! ```

// Message model and acknowledgement
pub mod message;
pub mod cloud_event;
pub mod codec;
pub mod retry;

// Inbound side: HTTP and WebSocket sources
pub mod ingest;

// Outbound side: HTTP and WebSocket sinks
pub mod dispatch;

// Configuration and wiring
pub mod config;
pub mod gateway;

// Re-export key types
pub use message::{Completion, Message, Metadata, MetadataKind, MetadataValue, Outcome, Payload};
pub use cloud_event::{CloudEventError, CloudEventMetadata};
pub use codec::{CodecError, CodecRegistry, Deserializer, Serializer};
pub use retry::{RetryPolicy, Retryable};

pub use ingest::{IngestEndpoint, IngestError, IngestRegistry, MessageStream};
pub use dispatch::{DeliveryError, DispatchError, DispatchOptions, Dispatcher, Transport};

pub use config::{ConfigError, GatewayConfig};
pub use gateway::{Gateway, GatewayError};
