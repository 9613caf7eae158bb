use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::coordination::DownloadRegistry;
use crate::repo::RepositorySet;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
    /// Cache keys with a live download coordinator.
    pub downloads_in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub cache: CheckResult,
    pub repos: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Subset of `AppState` the health check needs.
#[derive(Clone)]
pub struct HealthState {
    pub pkgs_dir: PathBuf,
    pub repos: Arc<RepositorySet>,
    pub downloads: DownloadRegistry,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_cache(pkgs_dir: &Path) -> CheckResult {
    let dir = pkgs_dir.to_path_buf();
    match tokio::task::spawn_blocking(move || cache_usage(&dir)).await {
        Ok(Ok(used)) => CheckResult::healthy(format!("{used} bytes cached")),
        Ok(Err(e)) => CheckResult::unhealthy(format!("cache directory unusable: {e:#}")),
        Err(e) => CheckResult::unhealthy(format!("cache check task failed: {e}")),
    }
}

/// Verify the cache directory is writable and return the bytes stored in it.
fn cache_usage(dir: &Path) -> anyhow::Result<u64> {
    use anyhow::Context as _;

    anyhow::ensure!(dir.is_dir(), "{} does not exist", dir.display());
    let marker = dir.join(".healthz");
    std::fs::write(&marker, b"ok")
        .with_context(|| format!("{} is not writable", dir.display()))?;
    std::fs::remove_file(&marker).ok();

    let mut used: u64 = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                used += meta.len();
            }
        }
    }
    Ok(used)
}

async fn check_repos(repos: &RepositorySet) -> CheckResult {
    let mut broken = Vec::new();
    let mut mirrors = 0;
    for repo in repos.iter() {
        match repo.effective_urls().await {
            Ok(urls) if !urls.is_empty() => mirrors += urls.len(),
            Ok(_) => broken.push(format!("{}: no upstream urls", repo.name())),
            Err(e) => broken.push(format!("{}: {e}", repo.name())),
        }
    }
    if broken.is_empty() {
        CheckResult::healthy(format!("{} repos, {mirrors} mirrors", repos.len()))
    } else {
        broken.sort();
        CheckResult::unhealthy(broken.join("; "))
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.cache.ok {
        // Nothing can be served or stored without the cache directory.
        HealthStatus::Unhealthy
    } else if !checks.repos.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (cache, repos) = tokio::join!(check_cache(&state.pkgs_dir), check_repos(&state.repos));

    let checks = HealthChecks { cache, repos };
    let status = aggregate_status(&checks);
    let body = HealthResponse {
        status,
        checks,
        downloads_in_flight: state.downloads.in_flight(),
    };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::Repository;

    fn state(pkgs_dir: PathBuf, repos: RepositorySet) -> HealthState {
        HealthState {
            pkgs_dir,
            repos: Arc::new(repos),
            downloads: DownloadRegistry::new(None),
        }
    }

    #[tokio::test]
    async fn healthy_cache_and_repos() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("core")).unwrap();
        std::fs::write(tmp.path().join("core").join("a.pkg.tar.zst"), "12345").unwrap();
        let mut repos = RepositorySet::default();
        repos.insert(Repository::with_urls(
            "core",
            vec!["http://mirror".into()],
            reqwest::Client::new(),
        ));

        let state = state(tmp.path().to_path_buf(), repos);
        let (cache, repos) = tokio::join!(check_cache(&state.pkgs_dir), check_repos(&state.repos));
        assert!(cache.ok);
        assert_eq!(cache.detail.as_deref(), Some("5 bytes cached"));
        assert!(repos.ok);

        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_cache_dir_is_unhealthy() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path().join("absent"), RepositorySet::default());
        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn broken_mirrorlist_degrades() {
        let tmp = tempfile::tempdir().unwrap();
        let mirrorlist = tmp.path().join("mirrorlist");
        std::fs::write(&mirrorlist, "# nothing here\n").unwrap();
        let mut repos = RepositorySet::default();
        repos.insert(Repository::with_mirrorlist(
            "core",
            &mirrorlist,
            reqwest::Client::new(),
        ));

        let checks = HealthChecks {
            cache: check_cache(tmp.path()).await,
            repos: check_repos(&repos).await,
        };
        assert!(!checks.repos.ok);
        assert_eq!(aggregate_status(&checks), HealthStatus::Degraded);
    }
}
