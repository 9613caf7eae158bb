//! HTTP layer of the package cache.
//!
//! Serves `/repo/...` objects from the local cache or, on a miss, through
//! the single-flight download coordinator.

pub mod handler;
pub mod serve;

pub use handler::create_router;
