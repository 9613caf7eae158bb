//! Single-flight download coordination.
//!
//! Concurrent requests for the same cache key share one upstream fetch: the
//! [`DownloadRegistry`] hands out leases on a per-key coordinator, exactly
//! one task downloads into a hidden buffer file, and any number of
//! [`StreamReader`]s follow that file as it grows.

pub mod coordinator;
pub mod fetch;
pub mod reader;
pub mod registry;

pub use coordinator::{FetchPhase, ObjectMetadata};
pub use reader::StreamReader;
pub use registry::{Acquisition, DownloadRegistry};
