//! On-disk cache layout and eviction.
//!
//! Finished objects live at `{cache_dir}/pkgs/{repo}/{file}`; in-flight
//! downloads use a dot-prefixed sibling of the final path.

pub mod path;
pub mod purge;

pub use path::RequestedFile;
