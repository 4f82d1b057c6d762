//! Status page with a point-in-time view of the cache counters.

use crate::cache_index::CacheIndex;
use crate::{CacheError, Result};
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;

/// Body of the status endpoint. Field names are part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusPage {
    pub curr_size: i64,
    pub max_size: i64,
    pub num_files: usize,
    /// Unix seconds
    pub server_time: i64,
}

impl StatusPage {
    /// Snapshot the index counters; never cached.
    pub fn snapshot(index: &dyn CacheIndex) -> Self {
        Self {
            curr_size: i64::try_from(index.current_size_bytes()).unwrap_or(i64::MAX),
            max_size: i64::try_from(index.max_size_bytes()).unwrap_or(i64::MAX),
            num_files: index.object_count(),
            server_time: chrono::Utc::now().timestamp(),
        }
    }

    /// Render as indented JSON followed by a newline.
    pub fn to_json(&self) -> Result<String> {
        let mut out = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b" "));
        self.serialize(&mut serializer)?;
        out.push(b'\n');
        String::from_utf8(out).map_err(|e| CacheError::SerializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_index::LruDiskIndex;
    use std::path::Path;

    #[test]
    fn test_snapshot_reads_index() {
        let index = LruDiskIndex::new("/cache", 1000);
        index.register_object(Path::new("/cache/cas/a"), 12);
        index.register_object(Path::new("/cache/ac/b"), 30);

        let page = StatusPage::snapshot(&index);

        assert_eq!(page.curr_size, 42);
        assert_eq!(page.max_size, 1000);
        assert_eq!(page.num_files, 2);
        assert!(page.server_time > 1_600_000_000);
    }

    #[test]
    fn test_json_field_names_and_indent() {
        let page = StatusPage {
            curr_size: 1,
            max_size: 2,
            num_files: 3,
            server_time: 4,
        };

        let json = page.to_json().unwrap();

        assert_eq!(
            json,
            "{\n \"CurrSize\": 1,\n \"MaxSize\": 2,\n \"NumFiles\": 3,\n \"ServerTime\": 4\n}\n"
        );
        let parsed: StatusPage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, page);
    }
}
