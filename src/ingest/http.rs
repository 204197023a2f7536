//! HTTP sources: one axum route per configured path, dispatched by method.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{MatchedPath, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, MethodRouter};
use axum::Router;
use indexmap::IndexMap;

use crate::cloud_event::CloudEventMetadata;
use crate::message::{Metadata, MetadataValue, RequestMetadata};

use super::{IngestError, IngestRegistry, UNEXPECTED_ERROR_BODY};

/// Routes for every HTTP endpoint of the registry
pub fn routes(registry: &IngestRegistry) -> Router<Arc<IngestRegistry>> {
    let mut by_path: IndexMap<&str, Vec<&Method>> = IndexMap::new();
    for endpoint in registry.http_endpoints() {
        let key = endpoint.key();
        by_path.entry(key.path.as_str()).or_default().push(&key.method);
    }

    let mut router = Router::new();
    for (path, methods) in by_path {
        let mut method_router: MethodRouter<Arc<IngestRegistry>> = MethodRouter::new();
        for method in methods {
            match MethodFilter::try_from(method.clone()) {
                Ok(filter) => method_router = method_router.on(filter, handle_request),
                Err(_) => tracing::warn!("Method {} is not routable, skipping {}", method, path),
            }
        }
        tracing::info!("HTTP source listening on {}", path);
        router = router.route(path, method_router);
    }
    router
}

#[allow(clippy::too_many_arguments)]
async fn handle_request(
    State(registry): State<Arc<IngestRegistry>>,
    matched: MatchedPath,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    path: Option<Path<Vec<(String, String)>>>,
    query: Option<Query<Vec<(String, String)>>>,
    body: Bytes,
) -> Response {
    let configured_path = matched.as_str().to_string();
    let Some(endpoint) = registry.http_endpoint(&configured_path, &method) else {
        tracing::error!("No endpoint registered for {} {}", method, configured_path);
        return unexpected_error();
    };

    let request = RequestMetadata {
        method: Some(method),
        configured_path,
        invoked_path: uri.path().to_string(),
        path_params: path.map(|Path(params)| params.into_iter().collect()).unwrap_or_default(),
        query_params: query.map(|Query(params)| params).unwrap_or_default(),
        headers,
    };

    match endpoint.ingest(&body, incoming_metadata(request)).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Metadata of an incoming message: the request itself plus decoded cloud-event headers
pub(crate) fn incoming_metadata(request: RequestMetadata) -> Metadata {
    let cloud_event = CloudEventMetadata::from_headers(&request.headers);
    let mut metadata = Metadata::new().with(request);
    if let Some(cloud_event) = cloud_event {
        metadata.insert(MetadataValue::CloudEvent(cloud_event));
    }
    metadata
}

fn unexpected_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, UNEXPECTED_ERROR_BODY).into_response()
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::Overflow(key) => {
                tracing::debug!("Rejecting request to {}, buffer full", key);
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            }
            other => {
                tracing::error!("{}", other);
                unexpected_error()
            }
        }
    }
}
