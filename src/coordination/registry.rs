//! Registry of in-flight downloads, one [`Coordinator`] per cache key.
//!
//! Every party interested in a download holds a [`Lease`]: the request that
//! created it, the background fetch task, stream readers and any later
//! request for the same key.  Dropping the last lease removes the
//! coordinator from the registry and deletes its buffer file, whether or not
//! the fetch itself has finished.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::RequestedFile;
use crate::error::FetchError;
use crate::repo::Repository;

use super::coordinator::Coordinator;
use super::fetch::{self, FetchOutcome};
use super::reader::StreamReader;

// ---------------------------------------------------------------------------
// DownloadRegistry
// ---------------------------------------------------------------------------

/// Shared table of active downloads.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct DownloadRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    active: Mutex<HashMap<String, Arc<Coordinator>>>,
    /// Per-attempt upstream timeout.
    download_timeout: Option<Duration>,
}

impl DownloadRegistry {
    pub fn new(download_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                active: Mutex::new(HashMap::new()),
                download_timeout,
            }),
        }
    }

    /// Look up or create the coordinator for `key`.
    ///
    /// Unless `revalidate` is set, an object found in the cache once the
    /// registry lock is held yields [`Acquisition::Cached`]: a download that
    /// finished after the caller's own cache check must not be repeated.
    pub async fn acquire(
        &self,
        key: &str,
        repo: Arc<Repository>,
        url_path: &str,
        output_path: &Path,
        revalidate: bool,
    ) -> Result<Acquisition, FetchError> {
        if let Some(dir) = output_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| FetchError::io(dir, e))?;
        }

        // Creating the buffer file stays under the lock, so it is serialised
        // with the teardown of a previous coordinator for the same key.
        let mut active = self.inner.active.lock();
        if !revalidate && output_path.is_file() {
            debug!(%key, "object cached while waiting for the registry");
            return Ok(Acquisition::Cached);
        }
        if let Some(existing) = active.get(key) {
            existing.refs.fetch_add(1, Ordering::AcqRel);
            debug!(%key, refs = existing.ref_count(), "joined in-flight download");
            return Ok(Acquisition::Joined(self.lease(Arc::clone(existing))));
        }

        let buffer_path = crate::cache::path::buffer_path_for(output_path);
        let coordinator = Arc::new(Coordinator::create(
            key,
            repo,
            url_path,
            output_path,
            &buffer_path,
        )?);
        active.insert(key.to_string(), Arc::clone(&coordinator));
        debug!(%key, "created download coordinator");
        Ok(Acquisition::Created(self.lease(coordinator)))
    }

    /// Spawn the background fetch for a freshly created coordinator.  The
    /// task holds its own lease, so the download keeps running when every
    /// client goes away.
    pub fn start_fetch(&self, lease: &Lease) {
        let task_lease = lease.clone();
        let timeout = self.inner.download_timeout;
        tokio::spawn(fetch::run(task_lease, timeout));
    }

    /// Force the object behind `file` into the cache without serving it.
    ///
    /// Joins an in-flight download for the same key if there is one.
    pub async fn populate(
        &self,
        repo: Arc<Repository>,
        file: &RequestedFile,
    ) -> Result<FetchOutcome, Arc<FetchError>> {
        let lease = match self
            .acquire(&file.key(), repo, &file.url_path(), &file.cache_path, true)
            .await
            .map_err(Arc::new)?
        {
            Acquisition::Cached => return Ok(FetchOutcome::NotModified),
            Acquisition::Joined(lease) => lease,
            Acquisition::Created(lease) => {
                self.start_fetch(&lease);
                lease
            }
        };
        lease.wait_for_completion().await
    }

    /// Per-attempt timeout applied to every upstream request.
    pub fn download_timeout(&self) -> Option<Duration> {
        self.inner.download_timeout
    }

    /// Number of keys with a live coordinator.
    pub fn in_flight(&self) -> usize {
        self.inner.active.lock().len()
    }

    fn lease(&self, coordinator: Arc<Coordinator>) -> Lease {
        Lease {
            registry: Arc::clone(&self.inner),
            coordinator,
        }
    }
}

/// Result of [`DownloadRegistry::acquire`].
#[derive(Debug)]
pub enum Acquisition {
    /// The object is in the cache and needs no revalidation.
    Cached,
    /// Attached to a download already in flight.
    Joined(Lease),
    /// Created the coordinator; the caller must call
    /// [`DownloadRegistry::start_fetch`].
    Created(Lease),
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// One counted reference to a [`Coordinator`].
///
/// Cloning attaches another reference; dropping releases it.
#[derive(Debug)]
pub struct Lease {
    registry: Arc<RegistryInner>,
    coordinator: Arc<Coordinator>,
}

impl Lease {
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Attach a reader positioned at offset 0.
    pub fn open_reader(&self) -> StreamReader {
        StreamReader::new(self.clone())
    }

    pub async fn wait_for_completion(&self) -> Result<FetchOutcome, Arc<FetchError>> {
        self.coordinator.wait_for_completion().await
    }

    /// Explicit form of dropping the lease.
    pub fn release(self) {}
}

impl Clone for Lease {
    fn clone(&self) -> Self {
        // The registry lock serialises this with the last release, so a
        // coordinator that is being torn down is never revived.
        let _active = self.registry.active.lock();
        self.coordinator.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            registry: Arc::clone(&self.registry),
            coordinator: Arc::clone(&self.coordinator),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut active = self.registry.active.lock();
        if self.coordinator.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let key = self.coordinator.key();
        if active
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.coordinator))
        {
            active.remove(key);
        }

        // Removed under the lock: a successor coordinator for this key
        // reuses the buffer path.  After a successful fetch the buffer was
        // renamed into the cache and is already gone.
        let buffer_path = self.coordinator.buffer_path();
        match std::fs::remove_file(buffer_path) {
            Ok(()) => debug!(%key, path = %buffer_path.display(), "removed download buffer"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(%key, error = %e, "failed to remove download buffer"),
        }
        debug!(%key, "download coordinator released");
    }
}
