//! Upstream repositories and their candidate mirror URLs.
//!
//! A repository is configured with a single URL, a static URL list, or a
//! pacman mirrorlist file.  Mirrorlist-backed repositories re-stat their
//! file at most once per [`MIRRORLIST_RECHECK`] and only re-parse it when its
//! modification time changed, keeping the previous list if the new parse
//! yields nothing usable.

pub mod mirrorlist;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, RepoConfig};
use crate::error::FetchError;

/// Minimum delay between two stats of the same mirrorlist file.
pub const MIRRORLIST_RECHECK: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// One configured upstream repository.
#[derive(Debug)]
pub struct Repository {
    name: String,
    source: EndpointSource,
    /// Client carrying this repository's user agent and proxy settings.
    client: reqwest::Client,
}

#[derive(Debug)]
enum EndpointSource {
    Static(Arc<Vec<String>>),
    Mirrorlist {
        path: PathBuf,
        recheck: Duration,
        state: Mutex<MirrorlistState>,
    },
}

#[derive(Debug, Default)]
struct MirrorlistState {
    last_checked: Option<Instant>,
    /// Modification time of the file at the last successful parse.
    modified: Option<SystemTime>,
    urls: Arc<Vec<String>>,
    /// Number of times the file has been stat'ed.
    checks: u64,
}

impl Repository {
    /// Build a repository from its configuration section.
    pub fn from_config(name: &str, repo: &RepoConfig, config: &Config) -> Result<Self> {
        let proxy = repo.http_proxy.as_deref().or(config.http_proxy.as_deref());
        let client = build_client(&config.user_agent, proxy)
            .with_context(|| format!("failed to build HTTP client for repo {name}"))?;

        let repository = match (&repo.url, &repo.urls, &repo.mirrorlist) {
            (Some(url), None, None) => Self::with_urls(name, vec![url.clone()], client),
            (None, Some(urls), None) => Self::with_urls(name, urls.clone(), client),
            (None, None, Some(path)) => Self::with_mirrorlist(name, path, client),
            _ => anyhow::bail!("repo '{name}' must specify exactly one of url, urls or mirrorlist"),
        };
        Ok(repository)
    }

    /// Repository backed by a fixed, ordered URL list.
    pub fn with_urls(name: &str, urls: Vec<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.to_string(),
            source: EndpointSource::Static(Arc::new(urls)),
            client,
        }
    }

    /// Repository whose URLs come from a pacman mirrorlist file.
    pub fn with_mirrorlist(name: &str, path: &Path, client: reqwest::Client) -> Self {
        Self {
            name: name.to_string(),
            source: EndpointSource::Mirrorlist {
                path: path.to_path_buf(),
                recheck: MIRRORLIST_RECHECK,
                state: Mutex::new(MirrorlistState::default()),
            },
            client,
        }
    }

    /// Change how often the mirrorlist file may be re-stat'ed.  No effect on
    /// static repositories.
    #[cfg(test)]
    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        if let EndpointSource::Mirrorlist { recheck, .. } = &mut self.source {
            *recheck = interval;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// The ordered list of base URLs to try for this repository.
    ///
    /// For mirrorlist repositories a failed refresh keeps serving the last
    /// good list and only surfaces the error when there is none.
    pub async fn effective_urls(&self) -> Result<Arc<Vec<String>>, FetchError> {
        let (path, recheck, state) = match &self.source {
            EndpointSource::Static(urls) => return Ok(Arc::clone(urls)),
            EndpointSource::Mirrorlist {
                path,
                recheck,
                state,
            } => (path, *recheck, state),
        };

        let mut state = state.lock().await;
        let due = state
            .last_checked
            .is_none_or(|checked| checked.elapsed() >= recheck);

        if due {
            state.last_checked = Some(Instant::now());
            if let Err(e) = refresh_mirrorlist(path, &mut state).await {
                if state.urls.is_empty() {
                    return Err(e);
                }
                warn!(
                    repo = %self.name,
                    error = %e,
                    "mirrorlist refresh failed, keeping previous mirrors"
                );
            }
        }

        if state.urls.is_empty() {
            return Err(FetchError::EmptyMirrorlist(path.clone()));
        }
        Ok(Arc::clone(&state.urls))
    }

    /// How many times the mirrorlist file has been stat'ed.  Always zero for
    /// static repositories.
    #[cfg(test)]
    pub async fn mirrorlist_checks(&self) -> u64 {
        match &self.source {
            EndpointSource::Static(_) => 0,
            EndpointSource::Mirrorlist { state, .. } => state.lock().await.checks,
        }
    }
}

async fn refresh_mirrorlist(path: &Path, state: &mut MirrorlistState) -> Result<(), FetchError> {
    state.checks += 1;
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| FetchError::io(path, e))?;
    let modified = meta.modified().ok();
    if modified.is_some() && modified == state.modified {
        debug!(mirrorlist = %path.display(), checks = state.checks, "mirrorlist unchanged");
        return Ok(());
    }

    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| FetchError::io(path, e))?;
    let urls = mirrorlist::parse_mirrorlist(path, &contents)?;
    debug!(mirrorlist = %path.display(), mirrors = urls.len(), "mirrorlist parsed");

    state.urls = Arc::new(urls);
    state.modified = modified;
    Ok(())
}

fn build_client(user_agent: &str, proxy: Option<&str>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().user_agent(user_agent);
    if let Some(proxy) = proxy {
        builder = builder
            .proxy(reqwest::Proxy::all(proxy).with_context(|| format!("invalid proxy {proxy}"))?);
    }
    builder.build().context("failed to build reqwest client")
}

// ---------------------------------------------------------------------------
// RepositorySet
// ---------------------------------------------------------------------------

/// All configured repositories, keyed by name.
#[derive(Debug, Default)]
pub struct RepositorySet {
    repos: HashMap<String, Arc<Repository>>,
}

impl RepositorySet {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut repos = HashMap::with_capacity(config.repos.len());
        for (name, repo) in &config.repos {
            repos.insert(
                name.clone(),
                Arc::new(Repository::from_config(name, repo, config)?),
            );
        }
        Ok(Self { repos })
    }

    /// Add (or replace) a repository.
    pub fn insert(&mut self, repo: Repository) {
        self.repos.insert(repo.name.clone(), Arc::new(repo));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Repository>, FetchError> {
        self.repos
            .get(name)
            .cloned()
            .ok_or_else(|| FetchError::UnknownRepository(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Repository>> {
        self.repos.values()
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    /// Resolve every repository's URL list once, failing on the first
    /// repository that has none.  Run at startup so a broken mirrorlist is
    /// reported before the server accepts requests.
    pub async fn check_endpoints(&self) -> Result<()> {
        for repo in self.repos.values() {
            let urls = repo
                .effective_urls()
                .await
                .with_context(|| format!("repo {} has no usable upstream", repo.name))?;
            info!(repo = %repo.name, mirrors = urls.len(), "repository endpoints loaded");
        }
        Ok(())
    }
}
