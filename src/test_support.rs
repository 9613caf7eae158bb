//! In-process upstream mirrors for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;

use crate::coordination::fetch::{format_http_date, parse_http_date};

/// One object served by a [`MockMirror`].
#[derive(Debug, Clone)]
pub(crate) struct MockFile {
    body: Bytes,
    modified: Option<SystemTime>,
    declared_length: Option<u64>,
    delay: Duration,
    chunk_delay: Duration,
}

impl MockFile {
    pub(crate) fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            modified: None,
            declared_length: None,
            delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
        }
    }

    /// `Last-Modified` of the object; enables `304` answers.
    pub(crate) fn modified(mut self, modified: SystemTime) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Advertise `length` bytes, send the body, then drop the connection.
    /// Headers and body reach the client before the cut.
    pub(crate) fn truncated(mut self, length: u64) -> Self {
        self.declared_length = Some(length);
        self
    }

    /// Wait this long before answering.
    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Pause this long before each body chunk.
    pub(crate) fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

#[derive(Default)]
struct MirrorState {
    files: Mutex<HashMap<String, MockFile>>,
    gets: AtomicUsize,
    heads: AtomicUsize,
    last_ims: Mutex<Option<String>>,
}

/// An axum server on `127.0.0.1:0` that counts the requests it receives.
pub(crate) struct MockMirror {
    base_url: String,
    state: Arc<MirrorState>,
}

impl MockMirror {
    pub(crate) async fn start() -> Self {
        let state = Arc::new(MirrorState::default());
        let app = Router::new()
            .fallback(serve_mock)
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub(crate) fn url(&self) -> String {
        self.base_url.clone()
    }

    pub(crate) fn put(&self, path: &str, file: MockFile) {
        self.state.files.lock().insert(path.to_string(), file);
    }

    pub(crate) fn gets(&self) -> usize {
        self.state.gets.load(Ordering::SeqCst)
    }

    pub(crate) fn heads(&self) -> usize {
        self.state.heads.load(Ordering::SeqCst)
    }

    /// `If-Modified-Since` of the most recent request, if it carried one.
    pub(crate) fn last_if_modified_since(&self) -> Option<String> {
        self.state.last_ims.lock().clone()
    }
}

/// Base URL of a port nobody listens on.
pub(crate) async fn refused_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

async fn serve_mock(
    State(state): State<Arc<MirrorState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if method == Method::HEAD {
        state.heads.fetch_add(1, Ordering::SeqCst);
    } else {
        state.gets.fetch_add(1, Ordering::SeqCst);
    }
    let ims = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *state.last_ims.lock() = ims.clone();

    let file = state.files.lock().get(uri.path()).cloned();
    let Some(file) = file else {
        return StatusCode::NOT_FOUND.into_response();
    };
    tokio::time::sleep(file.delay).await;

    if let (Some(modified), Some(since)) = (file.modified, ims.as_deref().and_then(parse_http_date))
        && modified <= since
    {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    let length = file.declared_length.unwrap_or(file.body.len() as u64);
    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    if let Some(modified) = file.modified
        && let Ok(value) = HeaderValue::from_str(&format_http_date(modified))
    {
        response_headers.insert(header::LAST_MODIFIED, value);
    }

    // Streamed in small pieces so readers observe a growing file.
    let pieces: Vec<Result<Bytes, std::io::Error>> = file
        .body
        .chunks(1024)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    let chunk_delay = file.chunk_delay;
    let chunks = futures::stream::iter(pieces).then(move |piece| async move {
        if !chunk_delay.is_zero() {
            tokio::time::sleep(chunk_delay).await;
        }
        piece
    });
    // The pause lets hyper flush headers and body before the error aborts
    // the connection.
    let cut = futures::stream::iter(file.declared_length.map(|_| ())).then(|()| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Err::<Bytes, _>(std::io::Error::other("mock mirror cut the connection"))
    });
    let body = Body::from_stream(chunks.chain(cut));
    (StatusCode::OK, response_headers, body).into_response()
}
