//! WebSocket sources.
//!
//! Every frame received on a socket is admitted independently through the
//! endpoint's guard, so the buffer size bounds the frame backlog of all sockets
//! on the path together. Each frame gets one reply text frame on the same socket.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{MatchedPath, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::message::{Outcome, RequestMetadata};

use super::http::incoming_metadata;
use super::{IngestEndpoint, IngestError, IngestRegistry, UNEXPECTED_ERROR_BODY};

/// Reply to a frame whose message was acknowledged
pub const REPLY_ACK: &str = "ACK";
/// Reply to a frame rejected because the buffer is full
pub const REPLY_BUFFER_OVERFLOW: &str = "BUFFER_OVERFLOW";
/// Reply to a frame that failed for any other reason
pub const REPLY_EXCEPTION: &str = "EXCEPTION";

/// Routes for every WebSocket endpoint of the registry
pub fn routes(registry: &IngestRegistry) -> Router<Arc<IngestRegistry>> {
    let mut router = Router::new();
    for endpoint in registry.websocket_endpoints() {
        tracing::info!("WebSocket source listening on {}", endpoint.key().path);
        router = router.route(&endpoint.key().path, get(handle_upgrade));
    }
    router
}

async fn handle_upgrade(
    State(registry): State<Arc<IngestRegistry>>,
    matched: MatchedPath,
    uri: Uri,
    headers: HeaderMap,
    path: Option<Path<Vec<(String, String)>>>,
    query: Option<Query<Vec<(String, String)>>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let Some(endpoint) = registry.websocket_endpoint(matched.as_str()).cloned() else {
        tracing::error!("No WebSocket endpoint registered for {}", matched.as_str());
        return (StatusCode::INTERNAL_SERVER_ERROR, UNEXPECTED_ERROR_BODY).into_response();
    };

    let request = RequestMetadata {
        method: None,
        configured_path: matched.as_str().to_string(),
        invoked_path: uri.path().to_string(),
        path_params: path.map(|Path(params)| params.into_iter().collect()).unwrap_or_default(),
        query_params: query.map(|Query(params)| params).unwrap_or_default(),
        headers,
    };

    upgrade.on_upgrade(move |socket| serve_socket(socket, endpoint, request))
}

async fn serve_socket(socket: WebSocket, endpoint: Arc<IngestEndpoint>, request: RequestMetadata) {
    let (mut sender, mut receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<&'static str>();

    // Replies are written by one task; the socket half is not shared
    tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            if sender.send(WsMessage::Text(reply.to_string())).await.is_err() {
                break;
            }
        }
    });

    tracing::debug!("WebSocket connected on {}", request.invoked_path);

    while let Some(frame) = receiver.next().await {
        let body = match frame {
            Ok(WsMessage::Text(text)) => text.into_bytes(),
            Ok(WsMessage::Binary(bytes)) => bytes,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("WebSocket read failed on {}: {}", request.invoked_path, e);
                break;
            }
        };

        match endpoint.admit(&body, incoming_metadata(request.clone())) {
            Ok(completion) => {
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    let reply = match completion.wait().await {
                        Outcome::Acked => REPLY_ACK,
                        Outcome::Nacked(reason) => {
                            tracing::error!("Failed to process message: {}", reason);
                            REPLY_EXCEPTION
                        }
                        Outcome::Dropped => {
                            tracing::error!("{}", IngestError::Dropped);
                            REPLY_EXCEPTION
                        }
                    };
                    let _ = reply_tx.send(reply);
                });
            }
            Err(e) => {
                let _ = reply_tx.send(reply_for(&e));
            }
        }
    }

    tracing::debug!("WebSocket closed on {}", request.invoked_path);
}

fn reply_for(error: &IngestError) -> &'static str {
    match error {
        IngestError::Overflow(key) => {
            tracing::debug!("Rejecting frame on {}, buffer full", key);
            REPLY_BUFFER_OVERFLOW
        }
        other => {
            tracing::error!("{}", other);
            REPLY_EXCEPTION
        }
    }
}
