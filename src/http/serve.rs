//! Response builders: cached files, in-flight downloads and upstream
//! redirects.

use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, warn};

use crate::cache::RequestedFile;
use crate::coordination::fetch::{format_http_date, upstream_url};
use crate::coordination::{ObjectMetadata, StreamReader};
use crate::error::FetchError;
use crate::repo::Repository;

use super::handler::AppError;

/// Serve a fully cached object, honouring `Range` and `If-Modified-Since`.
pub async fn serve_cached(path: &Path, request: Request) -> Response {
    let response = ServeFile::new(path)
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {});
    response.map(Body::new)
}

/// Stream an in-flight download to the client as bytes arrive.  The reader
/// is dropped together with the body, so a disconnecting client only
/// releases its own reference.
pub fn serve_download(
    reader: StreamReader,
    metadata: ObjectMetadata,
) -> Result<Response, AppError> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream");
    if let Some(length) = metadata.content_length {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }
    if let Some(modified) = metadata.modified {
        builder = builder.header(header::LAST_MODIFIED, format_http_date(modified));
    }
    let response = builder
        .body(Body::from_stream(reader.into_stream()))
        .context("failed to build streaming response")?;
    Ok(response)
}

/// Answer a range request for an object that is not fully cached by
/// redirecting to the first mirror that has it.  `timeout` bounds each
/// availability check.
pub async fn redirect_upstream(
    repo: &Repository,
    file: &RequestedFile,
    timeout: Option<Duration>,
) -> Result<Response, AppError> {
    let urls = repo.effective_urls().await?;
    let url_path = file.url_path();
    for base in urls.iter() {
        let url = upstream_url(base, &url_path);
        let mut request = repo
            .client()
            .head(&url)
            .header(header::ACCEPT_ENCODING, "identity");
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(%url, "redirecting range request upstream");
                return Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response());
            }
            Ok(resp) => debug!(%url, status = %resp.status(), "mirror does not have object"),
            Err(e) => warn!(%url, error = %e, "mirror availability check failed"),
        }
    }
    Err(FetchError::AllMirrorsFailed(file.key()).into())
}
