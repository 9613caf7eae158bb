//! Parser for pacman mirrorlist files.
//!
//! Only `Server = <url>` lines are considered.  The usual pacman template
//! suffix (`$repo/os/$arch`) is cut off, since the remote sub path is taken
//! from the request instead.

use std::path::Path;

use tracing::warn;

use crate::error::FetchError;

/// Template variables that start the per-repo suffix of a mirror URL.
const TEMPLATE_VARS: &[&str] = &["$repo", "$arch"];

/// Extract the mirror base URL from a single mirrorlist line.
///
/// Returns `None` for comments, blank lines, other keys, values that are
/// not a single token and URLs without a `$repo`/`$arch` suffix.  The
/// returned URL may still contain a `$` if the line used an unknown template
/// variable.
pub fn parse_server_line(line: &str) -> Option<&str> {
    let (key, value) = line.trim().split_once('=')?;
    if key.trim() != "Server" {
        return None;
    }
    let value = value.trim();
    if value.is_empty() || value.contains(char::is_whitespace) {
        return None;
    }
    let cut = TEMPLATE_VARS
        .iter()
        .filter_map(|var| value.find(var))
        .min()?;
    let url = &value[..cut];
    (!url.is_empty()).then_some(url)
}

/// Parse every usable mirror URL out of `contents`.
///
/// Fails with [`FetchError::EmptyMirrorlist`] when no URL survives.
pub fn parse_mirrorlist(path: &Path, contents: &str) -> Result<Vec<String>, FetchError> {
    let mut urls = Vec::new();
    for url in contents.lines().filter_map(parse_server_line) {
        if url.contains('$') {
            warn!(
                %url,
                mirrorlist = %path.display(),
                "mirror url contains suspicious characters, skipping it"
            );
            continue;
        }
        urls.push(url.to_string());
    }

    if urls.is_empty() {
        return Err(FetchError::EmptyMirrorlist(path.to_path_buf()));
    }
    Ok(urls)
}
