//! Space Ensurer Module
//!
//! Decides whether an incoming upload fits the storage budget, evicting
//! objects through the cache index when it has to. Space granted to an upload
//! stays reserved until the upload is registered or abandoned, so concurrent
//! uploads of different objects cannot overcommit the budget between them.

use crate::cache_index::CacheIndex;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Reserves room in the cache for an upload of known size.
pub trait SpaceEnsurer: Send + Sync {
    /// Returns false when `requested_bytes` cannot be made to fit under the
    /// index's maximum size, even after eviction. May evict entries from
    /// `index` as a side effect.
    ///
    /// A successful reservation is held until [`release_space`](Self::release_space)
    /// is called with the same amount. Performs blocking filesystem I/O.
    fn reserve_space(&self, index: &dyn CacheIndex, requested_bytes: u64) -> bool;

    /// Give back bytes granted by an earlier `reserve_space`, once the upload
    /// has been registered with the index or has failed.
    fn release_space(&self, _reserved_bytes: u64) {}
}

/// Bytes reserved for one upload, released when dropped.
pub struct SpaceReservation {
    ensurer: Arc<dyn SpaceEnsurer>,
    bytes: u64,
}

impl SpaceReservation {
    /// Reserve `bytes` through `ensurer`; `None` when they do not fit.
    pub fn acquire(
        ensurer: &Arc<dyn SpaceEnsurer>,
        index: &dyn CacheIndex,
        bytes: u64,
    ) -> Option<Self> {
        ensurer.reserve_space(index, bytes).then(|| Self {
            ensurer: Arc::clone(ensurer),
            bytes,
        })
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for SpaceReservation {
    fn drop(&mut self) {
        self.ensurer.release_space(self.bytes);
    }
}

/// Evicts least recently used objects until the request fits.
#[derive(Debug, Default)]
pub struct EvictingSpaceEnsurer {
    /// Bytes granted to uploads that are not registered yet. The lock also
    /// serializes reservations.
    pending: Mutex<u64>,
}

impl EvictingSpaceEnsurer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently reserved by uploads in progress.
    pub fn pending_bytes(&self) -> u64 {
        *self.pending()
    }

    fn pending(&self) -> MutexGuard<'_, u64> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SpaceEnsurer for EvictingSpaceEnsurer {
    fn reserve_space(&self, index: &dyn CacheIndex, requested_bytes: u64) -> bool {
        let mut pending = self.pending();
        let max_size = index.max_size_bytes();

        let committed = pending.saturating_add(requested_bytes);
        if committed > max_size {
            warn!(
                "Upload of {} bytes does not fit the cache maximum of {} bytes ({} bytes reserved by uploads in progress)",
                requested_bytes, max_size, *pending
            );
            return false;
        }

        let mut evicted = 0usize;
        let mut freed = 0u64;
        while index.current_size_bytes() + committed > max_size {
            let Some((path, size)) = index.least_recently_used() else {
                break;
            };
            // The entry stays registered until its file is gone, so no writer
            // can publish a fresh copy at this path in between.
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to delete evicted object {:?}: {}", path, e);
                }
            }
            index.remove_object(&path);
            debug!("Evicted {:?} ({} bytes)", path, size);
            evicted += 1;
            freed += size;
        }

        if evicted > 0 {
            info!(
                "Evicted {} objects ({} bytes) to make room for {} bytes",
                evicted, freed, requested_bytes
            );
        }

        if index.current_size_bytes() + committed > max_size {
            return false;
        }
        *pending = committed;
        true
    }

    fn release_space(&self, reserved_bytes: u64) {
        let mut pending = self.pending();
        *pending = pending.saturating_sub(reserved_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_index::LruDiskIndex;
    use tempfile::TempDir;

    fn object(index: &LruDiskIndex, c: char, size: usize) -> std::path::PathBuf {
        let name: String = std::iter::repeat(c).take(64).collect();
        let path = index.root_directory().join("cas").join(name);
        std::fs::write(&path, vec![0u8; size]).unwrap();
        index.register_object(&path, size as u64);
        path
    }

    fn index_in(temp_dir: &TempDir, max_size: u64) -> LruDiskIndex {
        let index = LruDiskIndex::new(temp_dir.path(), max_size);
        index.ensure_layout().unwrap();
        index
    }

    #[test]
    fn test_fits_without_eviction() {
        let temp_dir = TempDir::new().unwrap();
        let index = index_in(&temp_dir, 100);
        let a = object(&index, 'a', 40);

        let ensurer = EvictingSpaceEnsurer::new();
        assert!(ensurer.reserve_space(&index, 60));
        assert!(a.exists());
        assert_eq!(index.object_count(), 1);
        assert_eq!(ensurer.pending_bytes(), 60);
    }

    #[test]
    fn test_evicts_oldest_until_fit() {
        let temp_dir = TempDir::new().unwrap();
        let index = index_in(&temp_dir, 100);
        let a = object(&index, 'a', 40);
        let b = object(&index, 'b', 40);

        assert!(EvictingSpaceEnsurer::new().reserve_space(&index, 50));

        assert!(!a.exists());
        assert!(b.exists());
        assert_eq!(index.current_size_bytes(), 40);
    }

    #[test]
    fn test_refuses_oversized_request() {
        let temp_dir = TempDir::new().unwrap();
        let index = index_in(&temp_dir, 100);
        let a = object(&index, 'a', 10);

        let ensurer = EvictingSpaceEnsurer::new();
        assert!(!ensurer.reserve_space(&index, 101));
        // Nothing is evicted for a request that can never fit.
        assert!(a.exists());
        assert_eq!(index.object_count(), 1);
        assert_eq!(ensurer.pending_bytes(), 0);
    }

    #[test]
    fn test_pending_reservations_count_against_budget() {
        let temp_dir = TempDir::new().unwrap();
        let index = index_in(&temp_dir, 10);
        let ensurer = EvictingSpaceEnsurer::new();

        assert!(ensurer.reserve_space(&index, 6));
        assert!(!ensurer.reserve_space(&index, 6));
        assert!(ensurer.reserve_space(&index, 4));
        assert_eq!(ensurer.pending_bytes(), 10);

        ensurer.release_space(6);
        assert!(ensurer.reserve_space(&index, 6));
    }

    #[test]
    fn test_pending_reservations_do_not_trigger_eviction() {
        let temp_dir = TempDir::new().unwrap();
        let index = index_in(&temp_dir, 10);
        let a = object(&index, 'a', 2);
        let ensurer = EvictingSpaceEnsurer::new();

        assert!(ensurer.reserve_space(&index, 8));
        // 8 pending + 8 requested can never fit, so `a` is kept.
        assert!(!ensurer.reserve_space(&index, 8));
        assert!(a.exists());
        assert_eq!(index.object_count(), 1);
    }

    #[test]
    fn test_reservation_guard_releases_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let index = index_in(&temp_dir, 10);
        let concrete = Arc::new(EvictingSpaceEnsurer::new());
        let ensurer: Arc<dyn SpaceEnsurer> = concrete.clone();

        let reservation = SpaceReservation::acquire(&ensurer, &index, 7).unwrap();
        assert_eq!(reservation.bytes(), 7);
        assert!(SpaceReservation::acquire(&ensurer, &index, 7).is_none());

        drop(reservation);
        assert_eq!(concrete.pending_bytes(), 0);
        assert!(SpaceReservation::acquire(&ensurer, &index, 7).is_some());
    }

    #[test]
    fn test_eviction_deletes_file_before_dropping_entry() {
        let temp_dir = TempDir::new().unwrap();
        let index = index_in(&temp_dir, 10);
        let a = object(&index, 'a', 6);
        // File already gone; the entry is still dropped.
        std::fs::remove_file(&a).unwrap();

        assert!(EvictingSpaceEnsurer::new().reserve_space(&index, 8));
        assert!(!index.contains_object(&a));
        assert_eq!(index.current_size_bytes(), 0);
    }
}
