//! Build Cache - HTTP cache server for remote build artifacts
//!
//! Stores action results (`ac/`) and content-addressable blobs (`cas/`) on
//! local disk and serves them over HTTP/1.1 with GET, HEAD and PUT.

pub mod atomic_writer;
pub mod cache_index;
pub mod cache_key;
pub mod config;
pub mod error;
pub mod http_cache;
pub mod logging;
pub mod server;
pub mod shutdown;
pub mod space_ensurer;
pub mod status;
pub mod upload_coordinator;

pub use error::{CacheError, Result};
