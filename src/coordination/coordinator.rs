//! Per-key state of one in-flight upstream download.
//!
//! A [`Coordinator`] owns the hidden buffer file the fetch task writes to and
//! a small event record published through a `watch` channel.  Every waiter
//! (request handlers, stream readers, prefetch callers) subscribes to that
//! channel and re-checks the record after each wake-up.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use tokio::sync::watch;

use crate::error::FetchError;
use crate::repo::Repository;

use super::fetch::FetchOutcome;

// ---------------------------------------------------------------------------
// Event record
// ---------------------------------------------------------------------------

/// Object metadata reported by the mirror that answered `200 OK`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub content_length: Option<u64>,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone, Default)]
pub enum FetchPhase {
    /// No mirror has answered yet.
    #[default]
    Pending,
    /// A mirror answered `200 OK`; bytes are arriving in the buffer file.
    MetadataKnown,
    /// A mirror answered `304 Not Modified`; the cached copy is current.
    NotModified,
    /// The object was fully received and moved into the cache.
    Completed,
    Failed(Arc<FetchError>),
}

impl FetchPhase {
    /// `true` once the fetch task has published its final event.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::NotModified | Self::Completed | Self::Failed(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchState {
    pub phase: FetchPhase,
    pub metadata: Option<ObjectMetadata>,
    /// Bytes written to the buffer file so far.  Only ever grows.
    pub received: u64,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Single-flight owner of the download for one cache key.
#[derive(Debug)]
pub struct Coordinator {
    key: String,
    repo: Arc<Repository>,
    url_path: String,
    output_path: PathBuf,
    buffer_path: PathBuf,
    /// Written by the fetch task only; readers use positional reads.
    buffer: Arc<File>,
    /// Number of live leases.  Only modified while the registry lock is
    /// held, so reaching zero and removal from the registry are atomic.
    pub(super) refs: AtomicUsize,
    events: watch::Sender<FetchState>,
}

impl Coordinator {
    /// Create the coordinator and truncate/create its buffer file.
    pub(super) fn create(
        key: &str,
        repo: Arc<Repository>,
        url_path: &str,
        output_path: &Path,
        buffer_path: &Path,
    ) -> Result<Self, FetchError> {
        let buffer = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(buffer_path)
            .map_err(|e| FetchError::io(buffer_path, e))?;
        let (events, _) = watch::channel(FetchState::default());

        Ok(Self {
            key: key.to_string(),
            repo,
            url_path: url_path.to_string(),
            output_path: output_path.to_path_buf(),
            buffer_path: buffer_path.to_path_buf(),
            buffer: Arc::new(buffer),
            refs: AtomicUsize::new(1),
            events,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn repo(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn url_path(&self) -> &str {
        &self.url_path
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    pub(super) fn buffer(&self) -> &Arc<File> {
        &self.buffer
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> watch::Receiver<FetchState> {
        self.events.subscribe()
    }

    /// Copy of the current event record.
    pub fn snapshot(&self) -> FetchState {
        self.events.borrow().clone()
    }

    pub fn metadata(&self) -> Option<ObjectMetadata> {
        self.events.borrow().metadata
    }

    /// Wait until the first of `metadataReceived`, `notModified` or `done`.
    pub async fn wait_for_first_event(&self) -> FetchState {
        let mut events = self.subscribe();
        match events
            .wait_for(|s| !matches!(s.phase, FetchPhase::Pending))
            .await
        {
            Ok(state) => state.clone(),
            // The sender lives as long as `self`, so this cannot happen.
            Err(_) => self.snapshot(),
        }
    }

    /// Wait for the terminal event and return its result.
    pub async fn wait_for_completion(&self) -> Result<FetchOutcome, Arc<FetchError>> {
        let mut events = self.subscribe();
        let phase = match events.wait_for(|s| s.phase.is_done()).await {
            Ok(state) => state.phase.clone(),
            Err(_) => self.snapshot().phase,
        };
        match phase {
            FetchPhase::NotModified => Ok(FetchOutcome::NotModified),
            FetchPhase::Failed(e) => Err(e),
            _ => Ok(FetchOutcome::Fetched),
        }
    }

    // -- publishing, fetch task only --

    pub(super) fn publish_metadata(&self, metadata: ObjectMetadata) {
        self.events.send_modify(|s| {
            s.metadata = Some(metadata);
            s.phase = FetchPhase::MetadataKnown;
        });
    }

    /// Announce `n` more bytes.  Callers must have flushed them to the
    /// buffer file first.
    pub(super) fn publish_received(&self, n: u64) {
        self.events.send_modify(|s| s.received += n);
    }

    pub(super) fn publish_done(&self, result: Result<FetchOutcome, FetchError>) {
        let phase = match result {
            Ok(FetchOutcome::Fetched) => FetchPhase::Completed,
            Ok(FetchOutcome::NotModified) => FetchPhase::NotModified,
            Err(e) => FetchPhase::Failed(Arc::new(e)),
        };
        self.events.send_modify(|s| s.phase = phase);
    }
}
