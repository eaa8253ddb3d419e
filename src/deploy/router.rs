//! Edge Router: serves published artifacts by subdomain.
//!
//! `abc12.example.com/assets/app.js` is answered from the object
//! `builds/abc12/assets/app.js`. Every failure is the same 404 to the client;
//! the log line says which failure it was.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::models::{ARTIFACT_PREFIX, DeploymentId};
use super::store::ObjectStore;
use crate::config::RouterSection;
use crate::errors::{RouterError, StoreError};

pub const NOT_FOUND_BODY: &str = "File not found";

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        match &self {
            RouterError::InvalidHost(host) => {
                tracing::debug!(host = %host, "request host names no deployment");
            }
            RouterError::ObjectNotFound { key } => {
                tracing::debug!(key = %key, "artifact not found");
            }
            RouterError::Store(StoreError::InvalidKey { key, reason }) => {
                tracing::debug!(key = %key, reason = %reason, "request path is not an artifact key");
            }
            RouterError::Store(e) => {
                tracing::warn!(error = %e, "object store read failed");
            }
        }
        (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response()
    }
}

/// Build the router over `store`.
pub fn build_router(store: Arc<dyn ObjectStore>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .fallback(serve_artifact)
        .with_state(store)
        .layer(TraceLayer::new_for_http())
}

async fn serve_artifact(
    State(store): State<Arc<dyn ObjectStore>>,
    req: Request,
) -> Result<Response, RouterError> {
    let id = deployment_from_host(request_host(&req).unwrap_or_default())?;
    let key = format!("{}/{}{}", ARTIFACT_PREFIX, id, req.uri().path());

    let body = store.get(&key).await?;
    Ok((
        [(header::CONTENT_TYPE, content_type_for(&key))],
        Body::from_stream(ReaderStream::new(body)),
    )
        .into_response())
}

/// `Host` header, falling back to the request-target authority.
fn request_host(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
}

/// Leftmost label of `host`, port stripped, as a deployment id.
pub fn deployment_from_host(host: &str) -> Result<DeploymentId, RouterError> {
    let hostname = host.split(':').next().unwrap_or_default();
    let label = hostname.split('.').next().unwrap_or_default();
    DeploymentId::parse(&label.to_ascii_lowercase())
        .map_err(|_| RouterError::InvalidHost(host.to_string()))
}

/// Content type by extension: HTML and CSS are recognised, everything else
/// is served as JavaScript.
pub fn content_type_for(path: &str) -> &'static str {
    if path.ends_with(".html") {
        "text/html"
    } else if path.ends_with(".css") {
        "text/css"
    } else {
        "application/javascript"
    }
}

/// Bind and serve until `shutdown` fires.
pub async fn serve(
    config: &RouterSection,
    store: Arc<dyn ObjectStore>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = config.addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "edge router listening");

    axum::serve(listener, build_router(store))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Router server error")?;

    tracing::info!("edge router shut down");
    Ok(())
}
