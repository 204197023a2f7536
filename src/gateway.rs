//! Wiring of configured sources and sinks into one running service.
//!
//! Sources and sinks meet on named channels: a sink consumes the messages of
//! every source publishing to its channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{select_all, SelectAll};
use futures::StreamExt;
use indexmap::IndexMap;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::codec::CodecRegistry;
use crate::config::{ConfigError, GatewayConfig};
use crate::dispatch::http::HttpTransport;
use crate::dispatch::websocket::WebSocketTransport;
use crate::dispatch::Dispatcher;
use crate::ingest::{self, IngestEndpoint, IngestRegistry, MessageStream};
use crate::message::{Message, MetadataValue, OutgoingHttpMetadata};

/// Time given to dispatchers to finish in-flight deliveries on shutdown
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

struct Sink {
    channel: String,
    dispatcher: Dispatcher,
}

/// A validated gateway ready to serve
pub struct Gateway {
    registry: IngestRegistry,
    channels: IndexMap<String, Vec<Arc<IngestEndpoint>>>,
    sinks: Vec<Sink>,
}

impl Gateway {
    /// Validate `config` and build every endpoint and dispatcher.
    ///
    /// Nothing is started; a configuration error leaves nothing behind.
    pub fn from_config(config: &GatewayConfig, codecs: &CodecRegistry) -> Result<Self, GatewayError> {
        config.validate(codecs)?;

        let mut registry = IngestRegistry::new();
        let mut channels: IndexMap<String, Vec<Arc<IngestEndpoint>>> = IndexMap::new();

        for source in &config.http_sources {
            let endpoint = registry.register_http(IngestEndpoint::new(source.to_options()?, codecs)?)?;
            channels.entry(source.channel.clone()).or_default().push(endpoint);
        }
        for source in &config.websocket_sources {
            let endpoint = registry.register_websocket(IngestEndpoint::new(source.to_options()?, codecs)?)?;
            channels.entry(source.channel.clone()).or_default().push(endpoint);
        }

        let mut sinks = Vec::new();
        for sink in &config.http_sinks {
            let transport = HttpTransport::new(sink.to_options()?, codecs)?;
            sinks.push(Sink {
                channel: sink.channel.clone(),
                dispatcher: Dispatcher::new(sink.dispatch_options()?, transport),
            });
        }
        for sink in &config.websocket_sinks {
            let transport = WebSocketTransport::new(sink.to_options()?, codecs)?;
            sinks.push(Sink {
                channel: sink.channel.clone(),
                dispatcher: Dispatcher::new(sink.dispatch_options()?, transport),
            });
        }

        Ok(Self {
            registry,
            channels,
            sinks,
        })
    }

    pub fn registry(&self) -> &IngestRegistry {
        &self.registry
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Consume every message published on `channel`.
    ///
    /// Must be called before [`Gateway::serve`]; requests to a source without
    /// any consumer fail.
    pub fn subscribe(&self, channel: &str) -> Option<SelectAll<MessageStream>> {
        let endpoints = self.channels.get(channel)?;
        Some(select_all(endpoints.iter().map(|endpoint| endpoint.subscribe())))
    }

    /// Serve until `shutdown` resolves, then let dispatchers finish in-flight work
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut consumers = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            let stream = self
                .subscribe(&sink.channel)
                .ok_or_else(|| ConfigError::UnboundChannel(sink.channel.clone()))?
                .map(relay_metadata);
            consumers.push((sink.dispatcher.clone(), stream));
        }

        // No delivery starts before the routes are in place
        let registry = Arc::new(self.registry);
        let app = router(Arc::clone(&registry));

        let dispatchers: Vec<_> = consumers
            .into_iter()
            .map(|(dispatcher, stream)| tokio::spawn(async move { dispatcher.run(stream).await }))
            .collect();

        tracing::info!("Gateway listening on {}", listener.local_addr()?);
        tracing::info!(
            "Serving {} sources and {} sinks",
            registry.len(),
            self.sinks.len()
        );

        axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

        tracing::info!("Shutting down, waiting for in-flight deliveries");
        registry.close();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, futures::future::join_all(dispatchers)).await;
        if drained.is_err() {
            tracing::warn!("In-flight deliveries did not finish within {:?}", SHUTDOWN_GRACE_PERIOD);
        }
        Ok(())
    }
}

/// Carry what an incoming request says about itself over to the delivery.
///
/// Path parameters fill the `{name}` tokens of an HTTP sink URL and decoded
/// cloud-event attributes are encoded again on the outgoing request. Values
/// already set for the delivery are left alone.
pub fn relay_metadata(message: Message) -> Message {
    let metadata = message.metadata();
    let mut relayed = (*metadata).clone();

    if metadata.outgoing_http().is_none() {
        if let Some(request) = metadata.request().filter(|r| !r.path_params.is_empty()) {
            let outgoing = request
                .path_params
                .iter()
                .fold(OutgoingHttpMetadata::new(), |outgoing, (name, value)| {
                    outgoing.add_path_param(name.clone(), value.clone())
                });
            relayed.insert(outgoing);
        }
    }
    if metadata.outgoing_cloud_event().is_none() {
        if let Some(cloud_event) = metadata.cloud_event() {
            relayed.insert(MetadataValue::OutgoingCloudEvent(cloud_event.clone()));
        }
    }

    if relayed.len() == metadata.len() {
        message
    } else {
        message.with_metadata(relayed)
    }
}

/// Router serving every source plus the `/health` and `/ready` routes
pub fn router(registry: Arc<IngestRegistry>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .merge(ingest::http::routes(&registry))
        .merge(ingest::websocket::routes(&registry))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(registry)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Ready once every source has a consumer
async fn ready_check(State(registry): State<Arc<IngestRegistry>>) -> impl IntoResponse {
    if registry.all_subscribed() {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "not ready" })))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Method;

    use super::*;
    use crate::cloud_event::CloudEventMetadata;
    use crate::message::{Metadata, RequestMetadata};

    const CONFIG: &str = r#"
http_sources:
  - path: /orders
    channel: orders
  - path: /audit
    channel: audit
websocket_sources:
  - path: /ws/orders
    channel: orders
http_sinks:
  - url: http://127.0.0.1:1/orders
    channel: orders
"#;

    #[test]
    fn test_from_config_builds_channels() {
        let config = GatewayConfig::from_yaml_str(CONFIG).unwrap();
        let gateway = Gateway::from_config(&config, &CodecRegistry::default()).unwrap();

        assert_eq!(gateway.registry().len(), 3);
        assert_eq!(gateway.channels().collect::<Vec<_>>(), vec!["orders", "audit"]);
        assert_eq!(gateway.sinks.len(), 1);
        assert!(gateway.subscribe("missing").is_none());
    }

    #[test]
    fn test_invalid_config_builds_nothing() {
        let mut config = GatewayConfig::from_yaml_str(CONFIG).unwrap();
        config.http_sinks[0].max_inflight_messages = 0;

        let result = Gateway::from_config(&config, &CodecRegistry::default());
        assert!(matches!(
            result,
            Err(GatewayError::Config(ConfigError::InvalidInflights(0)))
        ));
    }

    #[test]
    fn test_conflicting_routes_rejected_before_serving() {
        let mut config = GatewayConfig::from_yaml_str(CONFIG).unwrap();
        config.http_sources[0].path = "/orders/:id".to_string();
        config.websocket_sources[0].path = "/orders/:order".to_string();

        let result = Gateway::from_config(&config, &CodecRegistry::default());
        assert!(matches!(
            result,
            Err(GatewayError::Config(ConfigError::ConflictingRoute(_, _)))
        ));
    }

    #[test]
    fn test_relay_metadata_forwards_request_attributes() {
        let mut request = RequestMetadata::default();
        request.path_params.insert("id".to_string(), "42".to_string());
        let cloud_event = CloudEventMetadata::new("e-1", "/orders", "order.created");
        let metadata = Metadata::new()
            .with(request)
            .with(MetadataValue::CloudEvent(cloud_event.clone()));

        let relayed = relay_metadata(Message::new("x").with_metadata(metadata));

        let outgoing = relayed.metadata().outgoing_http().unwrap();
        assert_eq!(outgoing.path_params().get("id").map(String::as_str), Some("42"));
        assert_eq!(relayed.metadata().outgoing_cloud_event(), Some(&cloud_event));
    }

    #[test]
    fn test_relay_metadata_keeps_explicit_delivery_values() {
        let mut request = RequestMetadata::default();
        request.path_params.insert("id".to_string(), "42".to_string());
        let explicit = OutgoingHttpMetadata::new().add_path_param("id", "7");
        let message = Message::new("x").with_metadata(Metadata::new().with(request).with(explicit.clone()));

        let relayed = relay_metadata(message);
        assert_eq!(relayed.metadata().outgoing_http(), Some(&explicit));
        assert!(relayed.metadata().outgoing_cloud_event().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_merges_channel_sources() {
        let config = GatewayConfig::from_yaml_str(CONFIG).unwrap();
        let gateway = Gateway::from_config(&config, &CodecRegistry::default()).unwrap();

        let _orders = gateway.subscribe("orders").unwrap();
        let audit = gateway.registry().http_endpoint("/audit", &Method::POST).unwrap();
        assert!(!audit.has_subscribers());
        assert!(gateway.registry().websocket_endpoint("/ws/orders").unwrap().has_subscribers());
        assert!(!gateway.registry().all_subscribed());
    }
}
