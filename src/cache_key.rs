//! Cache Key Module
//!
//! Maps request paths of the form `[prefix/](ac|cas)/<sha256>` to the cache
//! item they address on disk.

use crate::{CacheError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static BLOB_NAME_SHA256: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/?(.*/)?(ac/|cas/)([a-f0-9]{64})$").expect("blob name pattern is valid")
});

/// Top-level storage bucket of a cache item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// Action results, stored under an opaque key
    Ac,
    /// Content-addressable blobs, keyed by the SHA-256 of their content
    Cas,
}

impl Bucket {
    /// Directory name of the bucket under the cache root
    pub fn dir_name(&self) -> &'static str {
        match self {
            Bucket::Ac => "ac",
            Bucket::Cas => "cas",
        }
    }

    /// All buckets, in directory creation order
    pub fn all() -> [Bucket; 2] {
        [Bucket::Ac, Bucket::Cas]
    }
}

/// A cache artifact addressed by a request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub hash: String,
    pub bucket: Bucket,
    /// Absolute filesystem path of the stored object
    pub absolute_path: PathBuf,
    /// True for CAS items, false for AC items
    pub verify_hash: bool,
}

impl CacheItem {
    /// Parse cache artifact information from the request path.
    ///
    /// Leading segments before the bucket (such as an instance name) are
    /// accepted and ignored.
    pub fn from_request_path(path: &str, base_dir: &Path) -> Result<Self> {
        let captures = BLOB_NAME_SHA256
            .captures(path)
            .ok_or_else(|| CacheError::MalformedKey(escape_html(path)))?;

        let bucket = match &captures[2] {
            "cas/" => Bucket::Cas,
            _ => Bucket::Ac,
        };
        let hash = captures[3].to_string();

        Ok(Self {
            absolute_path: base_dir.join(bucket.dir_name()).join(&hash),
            verify_hash: bucket == Bucket::Cas,
            bucket,
            hash,
        })
    }
}

/// Escape text for safe inclusion in a response body.
pub fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&#34;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
