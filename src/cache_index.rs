//! Cache Index Module
//!
//! The request layer only needs to know which objects exist and how much
//! space they use. That contract is the [`CacheIndex`] trait; the default
//! implementation, [`LruDiskIndex`], keeps objects in least-recently-used order
//! so that a [`SpaceEnsurer`](crate::space_ensurer::SpaceEnsurer) can evict them.

use crate::atomic_writer::is_staging_file_name;
use crate::cache_key::Bucket;
use crate::{CacheError, Result};
use lru::LruCache;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Existence and size accounting for stored objects.
///
/// Implementations synchronize internally; callers treat every operation as
/// atomic.
pub trait CacheIndex: Send + Sync {
    /// Whether a fully written object exists at `path`.
    fn contains_object(&self, path: &Path) -> bool;

    /// Record a newly published object.
    fn register_object(&self, path: &Path, size_bytes: u64);

    fn current_size_bytes(&self) -> u64;

    fn max_size_bytes(&self) -> u64;

    fn object_count(&self) -> usize;

    /// Index objects already on disk. Called once at startup.
    fn load_existing_objects(&self) -> Result<()>;

    fn root_directory(&self) -> &Path;

    /// Path and size of the least recently used object, without promoting it.
    fn least_recently_used(&self) -> Option<(PathBuf, u64)>;

    /// Forget the object at `path` and return its size. The caller is
    /// responsible for deleting the file.
    fn remove_object(&self, path: &Path) -> Option<u64>;
}

struct IndexState {
    entries: LruCache<PathBuf, u64>,
    current_size: u64,
}

/// In-memory LRU index over the `ac/` and `cas/` directories of a cache root.
pub struct LruDiskIndex {
    root: PathBuf,
    max_size: u64,
    state: Mutex<IndexState>,
}

impl LruDiskIndex {
    pub fn new(root: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            root: root.into(),
            max_size,
            state: Mutex::new(IndexState {
                entries: LruCache::unbounded(),
                current_size: 0,
            }),
        }
    }

    /// Create the bucket directories under the cache root.
    pub fn ensure_layout(&self) -> Result<()> {
        for bucket in Bucket::all() {
            let dir = self.root.join(bucket.dir_name());
            std::fs::create_dir_all(&dir).map_err(|e| {
                CacheError::IoError(format!("Failed to create cache directory {:?}: {}", dir, e))
            })?;
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, IndexState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CacheIndex for LruDiskIndex {
    fn contains_object(&self, path: &Path) -> bool {
        // `get` promotes the entry to most recently used.
        self.state().entries.get(path).is_some()
    }

    fn register_object(&self, path: &Path, size_bytes: u64) {
        let mut state = self.state();
        if let Some(previous) = state.entries.put(path.to_path_buf(), size_bytes) {
            state.current_size = state.current_size.saturating_sub(previous);
        }
        state.current_size += size_bytes;
    }

    fn current_size_bytes(&self) -> u64 {
        self.state().current_size
    }

    fn max_size_bytes(&self) -> u64 {
        self.max_size
    }

    fn object_count(&self) -> usize {
        self.state().entries.len()
    }

    fn load_existing_objects(&self) -> Result<()> {
        let mut found: Vec<(SystemTime, PathBuf, u64)> = Vec::new();
        let mut stale_staging = 0usize;

        for bucket in Bucket::all() {
            let dir = self.root.join(bucket.dir_name());
            if !dir.exists() {
                continue;
            }
            for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
                let entry = entry.map_err(|e| {
                    CacheError::IoError(format!("Failed to scan {:?}: {}", dir, e))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();

                if is_staging_file_name(&name) {
                    match std::fs::remove_file(entry.path()) {
                        Ok(()) => stale_staging += 1,
                        Err(e) => warn!(
                            "Failed to remove stale staging file {:?}: {}",
                            entry.path(),
                            e
                        ),
                    }
                    continue;
                }
                if !is_object_name(&name) {
                    debug!("Ignoring unexpected file in cache: {:?}", entry.path());
                    continue;
                }

                let metadata = entry.metadata().map_err(|e| {
                    CacheError::IoError(format!("Failed to stat {:?}: {}", entry.path(), e))
                })?;
                let accessed = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                found.push((accessed, entry.into_path(), metadata.len()));
            }
        }

        // Oldest first so the newest files end up most recently used.
        found.sort_by_key(|(modified, _, _)| *modified);
        for (_, path, size) in found {
            self.register_object(&path, size);
        }

        if stale_staging > 0 {
            info!("Removed {} stale staging files", stale_staging);
        }
        info!(
            "Indexed {} existing cache objects ({} bytes) under {:?}",
            self.object_count(),
            self.current_size_bytes(),
            self.root
        );
        Ok(())
    }

    fn root_directory(&self) -> &Path {
        &self.root
    }

    fn least_recently_used(&self) -> Option<(PathBuf, u64)> {
        self.state()
            .entries
            .peek_lru()
            .map(|(path, size)| (path.clone(), *size))
    }

    fn remove_object(&self, path: &Path) -> Option<u64> {
        let mut state = self.state();
        let size = state.entries.pop(path)?;
        state.current_size = state.current_size.saturating_sub(size);
        Some(size)
    }
}

fn is_object_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn name(c: char) -> String {
        std::iter::repeat(c).take(64).collect()
    }

    #[test]
    fn test_register_and_contains() {
        let index = LruDiskIndex::new("/cache", 100);
        let path = Path::new("/cache/cas").join(name('a'));

        assert!(!index.contains_object(&path));
        index.register_object(&path, 10);

        assert!(index.contains_object(&path));
        assert_eq!(index.current_size_bytes(), 10);
        assert_eq!(index.object_count(), 1);
        assert_eq!(index.max_size_bytes(), 100);
    }

    #[test]
    fn test_reregister_replaces_size() {
        let index = LruDiskIndex::new("/cache", 100);
        let path = Path::new("/cache/ac").join(name('a'));
        index.register_object(&path, 10);
        index.register_object(&path, 4);

        assert_eq!(index.current_size_bytes(), 4);
        assert_eq!(index.object_count(), 1);
    }

    #[test]
    fn test_lru_order_follows_access() {
        let index = LruDiskIndex::new("/cache", 100);
        let a = Path::new("/cache/cas").join(name('a'));
        let b = Path::new("/cache/cas").join(name('b'));
        index.register_object(&a, 1);
        index.register_object(&b, 2);

        // Touch `a` so that `b` becomes the eviction candidate.
        assert!(index.contains_object(&a));

        assert_eq!(index.least_recently_used(), Some((b.clone(), 2)));
        // Peeking does not promote.
        assert_eq!(index.least_recently_used(), Some((b.clone(), 2)));

        assert_eq!(index.remove_object(&b), Some(2));
        assert_eq!(index.current_size_bytes(), 1);
        assert_eq!(index.least_recently_used(), Some((a.clone(), 1)));
        assert_eq!(index.remove_object(&a), Some(1));
        assert_eq!(index.remove_object(&a), None);
        assert_eq!(index.least_recently_used(), None);
        assert_eq!(index.current_size_bytes(), 0);
    }

    #[test]
    fn test_load_existing_objects() {
        let temp_dir = TempDir::new().unwrap();
        let index = LruDiskIndex::new(temp_dir.path(), 1000);
        index.ensure_layout().unwrap();

        let cas = temp_dir.path().join("cas");
        let ac = temp_dir.path().join("ac");
        std::fs::write(cas.join(name('1')), b"12345").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(ac.join(name('2')), b"123").unwrap();
        std::fs::write(cas.join("upload-deadbeef.tmp"), b"partial").unwrap();
        std::fs::write(cas.join("README"), b"ignored").unwrap();

        index.load_existing_objects().unwrap();

        assert_eq!(index.object_count(), 2);
        assert_eq!(index.current_size_bytes(), 8);
        assert!(index.contains_object(&ac.join(name('2'))));
        assert!(!cas.join("upload-deadbeef.tmp").exists());
        assert!(cas.join("README").exists());
    }

    #[test]
    fn test_load_existing_objects_oldest_first() {
        let temp_dir = TempDir::new().unwrap();
        let index = LruDiskIndex::new(temp_dir.path(), 1000);
        index.ensure_layout().unwrap();

        let old = temp_dir.path().join("cas").join(name('1'));
        let new = temp_dir.path().join("cas").join(name('2'));
        std::fs::write(&old, b"old").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(&new, b"new").unwrap();

        index.load_existing_objects().unwrap();

        let (evicted, _) = index.least_recently_used().unwrap();
        assert_eq!(evicted, old);
    }

    #[test]
    fn test_is_object_name() {
        assert!(is_object_name(&name('f')));
        assert!(!is_object_name(&name('g')));
        assert!(!is_object_name("abc"));
    }
}
