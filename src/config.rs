use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Cache root.  Finished objects live under `{cache_dir}/pkgs/{repo}/`.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:9129`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Per-attempt upstream timeout in seconds.  `0` disables the timeout.
    #[serde(default)]
    pub download_timeout: u64,
    /// Delete cached files whose access time is older than this many
    /// seconds.  `0` means never purge.
    #[serde(default = "default_purge_files_after")]
    pub purge_files_after: u64,
    /// Seconds between two eviction sweeps.
    #[serde(default = "default_purge_interval")]
    pub purge_interval: u64,
    /// `User-Agent` sent to upstream mirrors.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Outbound HTTP proxy used for every repository without an override.
    #[serde(default)]
    pub http_proxy: Option<String>,
    pub repos: HashMap<String, RepoConfig>,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/pkgcache")
}

fn default_listen() -> String {
    "0.0.0.0:9129".to_string()
}

fn default_purge_files_after() -> u64 {
    // 30 days
    3600 * 24 * 30
}

fn default_purge_interval() -> u64 {
    3600 * 24
}

fn default_user_agent() -> String {
    format!("pkgcache/{}", env!("CARGO_PKG_VERSION"))
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

/// One upstream repository.  Exactly one of `url`, `urls` and `mirrorlist`
/// must be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoConfig {
    /// Single upstream base URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Ordered list of upstream base URLs, tried first to last.
    #[serde(default)]
    pub urls: Option<Vec<String>>,
    /// Path to a pacman mirrorlist file (`Server = ...` lines).
    #[serde(default)]
    pub mirrorlist: Option<PathBuf>,
    /// Outbound HTTP proxy for this repository only.
    #[serde(default)]
    pub http_proxy: Option<String>,
    /// Override the global `purge_files_after` for this repository.
    #[serde(default)]
    pub purge_files_after: Option<u64>,
}

impl RepoConfig {
    fn source_count(&self) -> usize {
        [
            self.url.is_some(),
            self.urls.is_some(),
            self.mirrorlist.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

impl Config {
    /// Effective eviction window (seconds) for `repo`, `0` meaning never.
    pub fn purge_seconds(&self, repo: &str) -> u64 {
        self.repos
            .get(repo)
            .and_then(|r| r.purge_files_after)
            .unwrap_or(self.purge_files_after)
    }

    /// Directory holding the finished objects of every repository.
    pub fn pkgs_dir(&self) -> PathBuf {
        self.cache_dir.join("pkgs")
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid YAML configuration")?;
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(!config.repos.is_empty(), "at least one repo must be configured");
    anyhow::ensure!(config.purge_interval > 0, "purge_interval must be positive");
    anyhow::ensure!(
        !config.user_agent.trim().is_empty(),
        "user_agent must not be empty"
    );
    if let Some(ref proxy) = config.http_proxy {
        reqwest::Proxy::all(proxy).with_context(|| format!("invalid http_proxy: {proxy}"))?;
    }

    for (name, repo) in &config.repos {
        anyhow::ensure!(
            !name.is_empty() && !name.contains('/'),
            "invalid repo name {name:?}"
        );
        match repo.source_count() {
            0 => anyhow::bail!("repo '{name}' must specify one of url, urls or mirrorlist"),
            1 => {}
            _ => anyhow::bail!(
                "repo '{name}' specifies more than one of url, urls and mirrorlist, please use only one of them"
            ),
        }
        if let Some(ref urls) = repo.urls {
            anyhow::ensure!(!urls.is_empty(), "repo '{name}' has an empty urls list");
        }
        if let Some(ref proxy) = repo.http_proxy {
            reqwest::Proxy::all(proxy)
                .with_context(|| format!("repo '{name}' has an invalid http_proxy: {proxy}"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let yaml = r#"
cache_dir: /tmp/pkgcache
listen: 127.0.0.1:9000
download_timeout: 200
purge_files_after: 0
user_agent: test-agent
repos:
  archlinux:
    urls:
      - http://mirror.one/archlinux
      - http://mirror.two/archlinux
  custom:
    url: http://custom.example/repo
    purge_files_after: 60
  mirrored:
    mirrorlist: /etc/pacman.d/mirrorlist
    http_proxy: http://proxy.local:3128
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/pkgcache"));
        assert_eq!(config.download_timeout, 200);
        assert_eq!(config.repos.len(), 3);
        assert_eq!(config.purge_seconds("archlinux"), 0);
        assert_eq!(config.purge_seconds("custom"), 60);
        assert_eq!(config.pkgs_dir(), PathBuf::from("/tmp/pkgcache/pkgs"));
        assert_eq!(
            config.repos["mirrored"].mirrorlist.as_deref(),
            Some(Path::new("/etc/pacman.d/mirrorlist"))
        );
    }

    #[test]
    fn defaults_apply() {
        let config = parse_config("repos:\n  core:\n    url: http://a\n").unwrap();
        assert_eq!(config.listen, "0.0.0.0:9129");
        assert_eq!(config.purge_files_after, 2_592_000);
        assert_eq!(config.purge_interval, 86_400);
        assert!(config.user_agent.starts_with("pkgcache/"));
        assert!(config.http_proxy.is_none());
    }

    #[test]
    fn rejects_both_url_and_urls() {
        let yaml = "repos:\n  core:\n    url: http://a\n    urls: [http://b]\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn rejects_repo_without_source() {
        let yaml = "repos:\n  core:\n    purge_files_after: 10\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn rejects_empty_urls() {
        let yaml = "repos:\n  core:\n    urls: []\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn rejects_no_repos() {
        assert!(parse_config("repos: {}\n").is_err());
    }
}
