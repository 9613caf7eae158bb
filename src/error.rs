//! Error taxonomy of the download engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The request path is not `/repo/{name}/[{path}/]{file}`.
    #[error("request path {0:?} does not match /repo/<name>/[<path>/]<file>")]
    MalformedPath(String),

    #[error("repo {0} is not configured")]
    UnknownRepository(String),

    #[error("repo {0} has no upstream urls")]
    NoUpstreamConfigured(String),

    #[error("mirrorlist {} contains no usable mirrors", .0.display())]
    EmptyMirrorlist(PathBuf),

    /// A single mirror failed.  Recovered locally by trying the next one.
    #[error("mirror request {url} failed: {reason}")]
    MirrorAttemptFailed { url: String, reason: String },

    #[error("unable to download {0} from any mirror")]
    AllMirrorsFailed(String),

    #[error("receiving {url}: Content-Length is {expected} while received body length is {received}")]
    LengthMismatch {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn mirror(url: &str, reason: impl ToString) -> Self {
        Self::MirrorAttemptFailed {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}
