//! Eviction of cached objects that have not been read for too long.
//!
//! Staleness is judged by access time, so every cache hit extends an
//! object's life.  Hidden buffer files left behind by a crash age out the
//! same way.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::Config;

/// What one eviction run removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub files: u64,
    pub bytes: u64,
}

impl PurgeReport {
    fn add(&mut self, other: PurgeReport) {
        self.files += other.files;
        self.bytes += other.bytes;
    }
}

/// Delete every regular file under `dir` whose access time is older than
/// `max_age`.  A zero `max_age` disables eviction.
pub async fn purge_stale_files(dir: &Path, max_age: Duration) -> Result<PurgeReport> {
    if max_age.is_zero() {
        return Ok(PurgeReport::default());
    }
    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return Ok(PurgeReport::default());
    };
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || purge_dir(&dir, cutoff))
        .await
        .context("purge task panicked")?
}

fn purge_dir(dir: &Path, cutoff: SystemTime) -> Result<PurgeReport> {
    let mut report = PurgeReport::default();
    if !dir.exists() {
        return Ok(report);
    }

    let mut stack: Vec<PathBuf> = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %current.display(), error = %e, "cannot list cache directory");
                continue;
            }
        };
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                stack.push(entry.path());
                continue;
            }
            if !meta.is_file() {
                continue;
            }
            let Ok(accessed) = meta.accessed() else { continue };
            if accessed >= cutoff {
                continue;
            }

            let path = entry.path();
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), bytes = meta.len(), "purged stale file");
                    report.files += 1;
                    report.bytes += meta.len();
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to purge file"),
            }
        }
    }
    Ok(report)
}

/// Run one eviction pass over every repository with a non-zero window.
pub async fn purge_all(config: &Config) -> PurgeReport {
    let pkgs_dir = config.pkgs_dir();
    let mut total = PurgeReport::default();
    for name in config.repos.keys() {
        let window = config.purge_seconds(name);
        if window == 0 {
            continue;
        }
        let dir = pkgs_dir.join(name);
        match purge_stale_files(&dir, Duration::from_secs(window)).await {
            Ok(report) => {
                if report.files > 0 {
                    info!(repo = %name, files = report.files, bytes = report.bytes, "purged stale files");
                }
                total.add(report);
            }
            Err(e) => warn!(repo = %name, error = %e, "purge failed"),
        }
    }
    total
}

/// Background task: one eviction pass every `purge_interval` seconds.  The
/// first pass runs one interval after startup.
pub async fn run_purge_loop(config: Arc<Config>) {
    if config.repos.keys().all(|name| config.purge_seconds(name) == 0) {
        info!("cache eviction disabled for every repository");
        return;
    }

    let period = Duration::from_secs(config.purge_interval);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let report = purge_all(&config).await;
        debug!(files = report.files, bytes = report.bytes, "eviction pass finished");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
