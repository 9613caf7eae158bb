//! Mapping of inbound request paths onto repositories and cache files.
//!
//! Requests look like `/repo/{repo}/{optional/sub/path}/{file}`.  The sub
//! path is only relevant upstream; on disk every object of a repository is
//! flattened into `{pkgs_dir}/{repo}/{file}`.

use std::path::{Path, PathBuf};

use crate::error::FetchError;

/// Suffixes of repository index files that change in place upstream and
/// therefore must be revalidated on every request.
const MUTABLE_SUFFIXES: &[&str] = &[".db", ".db.sig", ".files"];

/// Prefix shared by every proxied path.
pub const REPO_PREFIX: &str = "/repo/";

/// A parsed request for a single repository object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedFile {
    pub repo_name: String,
    /// Remote sub path between the repo name and the file name.  Either
    /// empty or starting with `/`.
    pub path_at_repo: String,
    pub file_name: String,
    /// `{pkgs_dir}/{repo}`
    pub cache_dir: PathBuf,
    /// `{pkgs_dir}/{repo}/{file}`
    pub cache_path: PathBuf,
}

impl RequestedFile {
    /// Resolve `request_path` against the cache layout rooted at `pkgs_dir`.
    pub fn parse(pkgs_dir: &Path, request_path: &str) -> Result<Self, FetchError> {
        let malformed = || FetchError::MalformedPath(request_path.to_string());

        let rest = request_path.strip_prefix(REPO_PREFIX).ok_or_else(malformed)?;
        let (repo_name, tail) = rest.split_once('/').ok_or_else(malformed)?;
        let (path_at_repo, file_name) = match tail.rsplit_once('/') {
            Some((sub, file)) => (format!("/{sub}"), file),
            None => (String::new(), tail),
        };

        if repo_name.is_empty() || file_name.is_empty() || file_name.starts_with('.') {
            return Err(malformed());
        }
        if request_path.contains('\0') || rest.split('/').any(|segment| segment == "..") {
            return Err(malformed());
        }

        let cache_dir = pkgs_dir.join(repo_name);
        let cache_path = cache_dir.join(file_name);
        Ok(Self {
            repo_name: repo_name.to_string(),
            path_at_repo,
            file_name: file_name.to_string(),
            cache_dir,
            cache_path,
        })
    }

    /// Path of the object relative to a mirror base URL.
    pub fn url_path(&self) -> String {
        format!("{}/{}", self.path_at_repo, self.file_name)
    }

    /// Single-flight key: `{repo}:{url_path}`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.repo_name, self.url_path())
    }

    /// Hidden sibling of [`Self::cache_path`] that receives in-flight data.
    #[cfg(test)]
    pub fn buffer_path(&self) -> PathBuf {
        buffer_path_for(&self.cache_path)
    }

    pub fn is_mutable(&self) -> bool {
        is_mutable(&self.file_name)
    }
}

/// `true` for repository index and signature files that must always be
/// revalidated upstream, even when a local copy exists.
pub fn is_mutable(file_name: &str) -> bool {
    MUTABLE_SUFFIXES
        .iter()
        .any(|suffix| file_name.ends_with(suffix))
}

/// Buffer file location for a canonical cache path: same directory, file
/// name prefixed with a dot.
pub fn buffer_path_for(cache_path: &Path) -> PathBuf {
    let name = cache_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    cache_path.with_file_name(format!(".{name}"))
}
