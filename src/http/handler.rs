//! Axum router and the per-request decision logic of the proxy.
//!
//! Routes:
//! - `GET /repo/{repo}/{path...}/{file}` - cached or proxied repository object
//! - `GET /healthz`                      - health check

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, instrument, warn};

use crate::AppState;
use crate::cache::RequestedFile;
use crate::cache::path::REPO_PREFIX;
use crate::coordination::{Acquisition, FetchPhase};
use crate::error::FetchError;

use super::serve;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/repo/{*path}", get(handle_repo_object))
        .route("/healthz", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /repo/{repo}/{path...}/{file}`
///
/// Immutable objects already on disk are served without touching the
/// network.  Everything else goes through the download coordinator; the
/// response starts as soon as the first mirror answers instead of after the
/// whole download.
#[instrument(skip(state, request), fields(%path))]
async fn handle_repo_object(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    request: Request,
) -> Result<Response, AppError> {
    let file = RequestedFile::parse(&state.config.pkgs_dir(), &format!("{REPO_PREFIX}{path}"))?;
    let repo = state.repos.get(&file.repo_name)?;

    let cached = is_cached(&file).await;
    if cached && !file.is_mutable() {
        debug!("cache hit");
        return Ok(serve::serve_cached(&file.cache_path, request).await);
    }

    if request.headers().contains_key(header::RANGE) {
        let timeout = state.downloads.download_timeout();
        return serve::redirect_upstream(&repo, &file, timeout).await;
    }

    let acquired = state
        .downloads
        .acquire(
            &file.key(),
            Arc::clone(&repo),
            &file.url_path(),
            &file.cache_path,
            file.is_mutable(),
        )
        .await?;
    let lease = match acquired {
        Acquisition::Cached => {
            debug!("cached by a concurrent download");
            return Ok(serve::serve_cached(&file.cache_path, request).await);
        }
        Acquisition::Joined(lease) => lease,
        Acquisition::Created(lease) => {
            state.downloads.start_fetch(&lease);
            lease
        }
    };

    let event = lease.coordinator().wait_for_first_event().await;
    match event.phase {
        FetchPhase::NotModified => {
            lease.release();
            debug!("upstream reports cached copy is current");
            Ok(serve::serve_cached(&file.cache_path, request).await)
        }
        FetchPhase::Failed(e) => {
            lease.release();
            if is_cached(&file).await {
                warn!(error = %e, "fetch failed, serving cached copy");
                return Ok(serve::serve_cached(&file.cache_path, request).await);
            }
            Err(AppError::Fetch(e))
        }
        FetchPhase::Pending | FetchPhase::MetadataKnown | FetchPhase::Completed => {
            let metadata = event.metadata.unwrap_or_default();
            let reader = lease.open_reader();
            lease.release();
            serve::serve_download(reader, metadata)
        }
    }
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        pkgs_dir: state.config.pkgs_dir(),
        repos: Arc::clone(&state.repos),
        downloads: state.downloads.clone(),
    };
    crate::health::health_handler(State(health_state)).await
}

async fn is_cached(file: &RequestedFile) -> bool {
    tokio::fs::metadata(&file.cache_path)
        .await
        .is_ok_and(|meta| meta.is_file())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The request or the download behind it failed.
    Fetch(Arc<FetchError>),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Fetch(e) => match e.as_ref() {
                FetchError::MalformedPath(_) => StatusCode::BAD_REQUEST,
                FetchError::UnknownRepository(_) | FetchError::AllMirrorsFailed(_) => {
                    StatusCode::NOT_FOUND
                }
                FetchError::MirrorAttemptFailed { .. } | FetchError::LengthMismatch { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                FetchError::NoUpstreamConfigured(_)
                | FetchError::EmptyMirrorlist(_)
                | FetchError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            AppError::Fetch(err) => {
                if status.is_server_error() {
                    error!(error = %err, "request failed");
                } else {
                    debug!(error = %err, %status, "request rejected");
                }
                (status, err.to_string()).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (status, format!("Internal server error: {err:#}")).into_response()
            }
        }
    }
}

impl From<FetchError> for AppError {
    fn from(err: FetchError) -> Self {
        AppError::Fetch(Arc::new(err))
    }
}

impl From<Arc<FetchError>> for AppError {
    fn from(err: Arc<FetchError>) -> Self {
        AppError::Fetch(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
