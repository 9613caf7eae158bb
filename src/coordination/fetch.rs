//! Upstream fetch with mirror failover.
//!
//! Runs as exactly one task per coordinator.  Mirrors are tried in order
//! until one answers `200 OK` or `304 Not Modified`; once a mirror has
//! published metadata its failure is terminal, because readers may already
//! be streaming its bytes.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_LENGTH, IF_MODIFIED_SINCE, LAST_MODIFIED};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, warn};

use crate::error::FetchError;

use super::coordinator::{Coordinator, ObjectMetadata};
use super::registry::Lease;

/// Successful end of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A fresh copy was downloaded into the cache.
    Fetched,
    /// The mirror confirmed the cached copy is current.
    NotModified,
}

/// Body of the background fetch task.  Publishes the terminal event and then
/// drops the task's lease.
#[instrument(skip_all, fields(key = %lease.coordinator().key()))]
pub(crate) async fn run(lease: Lease, timeout: Option<Duration>) {
    let coordinator = Arc::clone(lease.coordinator());
    info!(url_path = %coordinator.url_path(), "starting download");
    let result = download(&coordinator, timeout).await;

    match &result {
        Ok(FetchOutcome::Fetched) => info!(
            path = %coordinator.output_path().display(),
            bytes = coordinator.snapshot().received,
            "download complete"
        ),
        Ok(FetchOutcome::NotModified) => info!("cached copy is up to date"),
        Err(e) => error!(error = %e, "download failed"),
    }
    coordinator.publish_done(result);
}

async fn download(c: &Coordinator, timeout: Option<Duration>) -> Result<FetchOutcome, FetchError> {
    let urls = c.repo().effective_urls().await?;
    if urls.is_empty() {
        return Err(FetchError::NoUpstreamConfigured(c.repo().name().to_string()));
    }

    for base in urls.iter() {
        let url = upstream_url(base, c.url_path());
        debug!(%url, "requesting from mirror");
        match download_from(c, &url, timeout).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if c.metadata().is_none() => {
                warn!(%url, error = %e, "mirror failed, trying next");
            }
            Err(e) => return Err(e),
        }
    }
    Err(FetchError::AllMirrorsFailed(c.key().to_string()))
}

async fn download_from(
    c: &Coordinator,
    url: &str,
    timeout: Option<Duration>,
) -> Result<FetchOutcome, FetchError> {
    let mut request = c
        .repo()
        .client()
        .get(url)
        .header(ACCEPT_ENCODING, "identity");
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }
    let cached_modified = modified_time(c.output_path()).await;
    if let Some(modified) = cached_modified {
        request = request.header(IF_MODIFIED_SINCE, format_http_date(modified));
    }

    let response = request.send().await.map_err(|e| FetchError::mirror(url, e))?;
    match response.status() {
        StatusCode::OK => {}
        StatusCode::NOT_MODIFIED if cached_modified.is_some() => {
            return Ok(FetchOutcome::NotModified);
        }
        status => return Err(FetchError::mirror(url, format!("unexpected status {status}"))),
    }

    let headers = response.headers();
    let metadata = ObjectMetadata {
        content_length: headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()),
        modified: headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date),
    };
    c.publish_metadata(metadata);

    let buffer_path = c.buffer_path();
    let writer = c
        .buffer()
        .try_clone()
        .map_err(|e| FetchError::io(buffer_path, e))?;
    let mut writer = tokio::fs::File::from_std(writer);
    let mut body = response.bytes_stream();
    let mut received = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| FetchError::mirror(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| FetchError::io(buffer_path, e))?;
        // Bytes must reach the file before readers are told about them.
        writer
            .flush()
            .await
            .map_err(|e| FetchError::io(buffer_path, e))?;
        received += chunk.len() as u64;
        c.publish_received(chunk.len() as u64);
    }

    if let Some(expected) = metadata.content_length
        && expected != received
    {
        return Err(FetchError::LengthMismatch {
            url: url.to_string(),
            expected,
            received,
        });
    }

    if let Some(modified) = metadata.modified {
        let file = Arc::clone(c.buffer());
        tokio::task::spawn_blocking(move || file.set_modified(modified))
            .await
            .map_err(|e| FetchError::io(buffer_path, std::io::Error::other(e)))?
            .map_err(|e| FetchError::io(buffer_path, e))?;
    }
    tokio::fs::rename(buffer_path, c.output_path())
        .await
        .map_err(|e| FetchError::io(c.output_path(), e))?;
    Ok(FetchOutcome::Fetched)
}

/// `{base}{url_path}` with any trailing slash of the base removed.
pub fn upstream_url(base: &str, url_path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), url_path)
}

async fn modified_time(path: &Path) -> Option<SystemTime> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    meta.modified().ok()
}

// ---------------------------------------------------------------------------
// HTTP dates
// ---------------------------------------------------------------------------

/// Format as an IMF-fixdate, e.g. `Wed, 21 Oct 2015 07:28:00 GMT`.
pub(crate) fn format_http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

pub(crate) fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(SystemTime::from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RequestedFile;
    use crate::coordination::{Acquisition, DownloadRegistry};
    use crate::repo::Repository;
    use crate::test_support::{MockFile, MockMirror, refused_url};

    fn requested(tmp: &tempfile::TempDir, path: &str) -> RequestedFile {
        RequestedFile::parse(tmp.path(), path).unwrap()
    }

    fn repo(urls: Vec<String>) -> Arc<Repository> {
        Arc::new(Repository::with_urls("core", urls, reqwest::Client::new()))
    }

    /// The fetch task drops its own lease just after publishing the result.
    async fn wait_until_idle(registry: &DownloadRegistry) {
        for _ in 0..100 {
            if registry.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} downloads still in flight", registry.in_flight());
    }

    #[test]
    fn http_date_roundtrip_and_format() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(1_445_412_480);
        let formatted = format_http_date(time);
        assert_eq!(formatted, "Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_http_date(&formatted), Some(time));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn upstream_url_joins_without_double_slash() {
        assert_eq!(
            upstream_url("http://mirror/archlinux/", "/core/os/x86_64/a.pkg"),
            "http://mirror/archlinux/core/os/x86_64/a.pkg"
        );
        assert_eq!(upstream_url("http://mirror", "/a.pkg"), "http://mirror/a.pkg");
    }

    #[tokio::test]
    async fn fails_over_to_next_mirror() {
        let tmp = tempfile::tempdir().unwrap();
        let good = MockMirror::start().await;
        good.put("/x.pkg.tar.zst", MockFile::new("content"));
        let bad = MockMirror::start().await;

        let registry = DownloadRegistry::new(None);
        let file = requested(&tmp, "/repo/core/x.pkg.tar.zst");
        let outcome = registry
            .populate(
                repo(vec![refused_url().await, bad.url(), good.url()]),
                &file,
            )
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Fetched);
        assert_eq!(std::fs::read(&file.cache_path).unwrap(), b"content");
        assert_eq!(bad.gets(), 1);
        assert_eq!(good.gets(), 1);
    }

    #[tokio::test]
    async fn all_mirrors_failing_is_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let empty = MockMirror::start().await;

        let registry = DownloadRegistry::new(None);
        let file = requested(&tmp, "/repo/core/missing.pkg.tar.zst");
        let err = registry
            .populate(repo(vec![refused_url().await, empty.url()]), &file)
            .await
            .unwrap_err();

        assert!(matches!(*err, FetchError::AllMirrorsFailed(_)));
        assert!(!file.cache_path.exists());
        wait_until_idle(&registry).await;
        assert!(!file.buffer_path().exists());
    }

    #[tokio::test]
    async fn sets_upstream_modification_time() {
        let tmp = tempfile::tempdir().unwrap();
        let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        let mirror = MockMirror::start().await;
        mirror.put("/core.db", MockFile::new("index").modified(modified));

        let registry = DownloadRegistry::new(None);
        let file = requested(&tmp, "/repo/core/core.db");
        registry
            .populate(repo(vec![mirror.url()]), &file)
            .await
            .unwrap();

        let meta = std::fs::metadata(&file.cache_path).unwrap();
        assert_eq!(meta.modified().unwrap(), modified);
    }

    #[tokio::test]
    async fn conditional_request_yields_not_modified() {
        let tmp = tempfile::tempdir().unwrap();
        let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        let mirror = MockMirror::start().await;
        mirror.put("/core.db", MockFile::new("new index").modified(modified));

        let file = requested(&tmp, "/repo/core/core.db");
        std::fs::create_dir_all(&file.cache_dir).unwrap();
        std::fs::write(&file.cache_path, "old index").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&file.cache_path)
            .unwrap()
            .set_modified(modified)
            .unwrap();

        let registry = DownloadRegistry::new(None);
        let outcome = registry
            .populate(repo(vec![mirror.url()]), &file)
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::NotModified);
        assert_eq!(std::fs::read(&file.cache_path).unwrap(), b"old index");
        assert_eq!(
            mirror.last_if_modified_since().as_deref(),
            Some("Sun, 13 Sep 2020 12:26:40 GMT")
        );
    }

    #[tokio::test]
    async fn body_cut_short_is_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let cut = MockMirror::start().await;
        cut.put("/x.pkg.tar.zst", MockFile::new("truncated").truncated(1000));
        let spare = MockMirror::start().await;
        spare.put("/x.pkg.tar.zst", MockFile::new("complete"));

        let registry = DownloadRegistry::new(None);
        let file = requested(&tmp, "/repo/core/x.pkg.tar.zst");
        let Acquisition::Created(lease) = registry
            .acquire(
                &file.key(),
                repo(vec![cut.url(), spare.url()]),
                &file.url_path(),
                &file.cache_path,
                false,
            )
            .await
            .unwrap()
        else {
            panic!("expected a fresh coordinator");
        };
        registry.start_fetch(&lease);
        let err = lease.wait_for_completion().await.unwrap_err();

        // The mirror answered 200 before failing, so there is no failover.
        assert!(matches!(
            *err,
            FetchError::MirrorAttemptFailed { .. } | FetchError::LengthMismatch { .. }
        ));
        let state = lease.coordinator().snapshot();
        assert_eq!(
            state.metadata.and_then(|m| m.content_length),
            Some(1000)
        );
        assert_eq!(state.received, 9);
        assert_eq!(spare.gets(), 0);

        drop(lease);
        wait_until_idle(&registry).await;
        assert!(!file.cache_path.exists());
        assert!(!file.buffer_path().exists());
    }

    #[tokio::test]
    async fn timeout_moves_on_to_next_mirror() {
        let tmp = tempfile::tempdir().unwrap();
        let slow = MockMirror::start().await;
        slow.put(
            "/x.pkg.tar.zst",
            MockFile::new("slow").delay(Duration::from_secs(5)),
        );
        let fast = MockMirror::start().await;
        fast.put("/x.pkg.tar.zst", MockFile::new("fast"));

        let registry = DownloadRegistry::new(Some(Duration::from_millis(200)));
        let file = requested(&tmp, "/repo/core/x.pkg.tar.zst");
        registry
            .populate(repo(vec![slow.url(), fast.url()]), &file)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&file.cache_path).unwrap(), b"fast");
    }
}
