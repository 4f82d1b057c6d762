//! Upload coordinator for serializing writes to the same cache object.
//!
//! Concurrent PUT requests for the same destination path must not write the
//! object twice. The coordinator keeps a registry of in-flight uploads keyed by
//! destination path; each entry holds an async mutex that the writer holds for
//! the whole transfer.
//!
//! # Architecture
//!
//! 1. A writer calls [`UploadCoordinator::acquire`], which registers (or
//!    reuses) the handle for the path and waits for its lock
//! 2. A second writer for the same path blocks on the same handle
//! 3. When the first writer's [`UploadGuard`] drops, the lock is released; the
//!    registry entry is removed once no writer holds or waits for it
//! 4. The second writer wakes up, re-checks whether the object now exists and
//!    discards its payload if so
//!
//! The registry mutex is only held while the map is mutated, never across the
//! transfer itself, so uploads of different objects never contend on I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Mutual-exclusion handle shared by all writers of one destination path.
pub type UploadHandle = Arc<tokio::sync::Mutex<()>>;

struct UploadEntry {
    handle: UploadHandle,
    /// Writers holding or waiting for `handle`.
    holders: usize,
}

type Registry = Arc<Mutex<HashMap<PathBuf, UploadEntry>>>;

/// Registry of in-flight uploads keyed by absolute destination path.
#[derive(Clone, Default)]
pub struct UploadCoordinator {
    ongoing: Registry,
}

/// Releases one registration for a path when dropped.
struct Registration {
    path: PathBuf,
    ongoing: Registry,
}

/// RAII guard for an exclusive upload slot.
///
/// Dropping the guard releases the per-path lock and then the registration.
/// This runs on every exit path, including cancellation of the request
/// future.
pub struct UploadGuard {
    // Field order matters: the lock is released before the registration.
    _lock: OwnedMutexGuard<()>,
    registration: Registration,
}

impl UploadCoordinator {
    /// Creates an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the caller as a writer for `path` and returns the shared
    /// handle, creating it when no upload to that path is in flight.
    ///
    /// Every `begin` must be paired with exactly one [`end`](Self::end).
    pub fn begin(&self, path: &Path) -> UploadHandle {
        let mut ongoing = lock_registry(&self.ongoing);
        let entry = ongoing
            .entry(path.to_path_buf())
            .or_insert_with(|| UploadEntry {
                handle: Arc::new(tokio::sync::Mutex::new(())),
                holders: 0,
            });
        entry.holders += 1;
        entry.handle.clone()
    }

    /// Ends the caller's registration for `path`. The entry is removed as
    /// soon as no writer holds or waits for it.
    pub fn end(&self, path: &Path) {
        release(&self.ongoing, path);
    }

    /// Registers an upload for `path` and waits until this caller is the only
    /// writer for it.
    pub async fn acquire(&self, path: &Path) -> UploadGuard {
        let handle = self.begin(path);
        let registration = Registration {
            path: path.to_path_buf(),
            ongoing: Arc::clone(&self.ongoing),
        };

        let lock = handle.lock_owned().await;
        debug!("Acquired upload lock: path={:?}", path);

        UploadGuard {
            _lock: lock,
            registration,
        }
    }

    /// Number of destination paths with a registered upload.
    pub fn in_flight_count(&self) -> usize {
        lock_registry(&self.ongoing).len()
    }

    /// Whether an upload to `path` is currently registered.
    pub fn is_in_flight(&self, path: &Path) -> bool {
        lock_registry(&self.ongoing).contains_key(path)
    }
}

impl UploadGuard {
    /// Destination path this guard protects.
    pub fn path(&self) -> &Path {
        &self.registration.path
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        release(&self.ongoing, &self.path);
        debug!("Released upload registration: path={:?}", self.path);
    }
}

fn release(ongoing: &Registry, path: &Path) {
    let mut ongoing = lock_registry(ongoing);
    if let Some(entry) = ongoing.get_mut(path) {
        entry.holders = entry.holders.saturating_sub(1);
        if entry.holders == 0 {
            ongoing.remove(path);
        }
    }
}

// The map stays consistent even if a holder panicked, so poisoning is ignored.
fn lock_registry(ongoing: &Registry) -> MutexGuard<'_, HashMap<PathBuf, UploadEntry>> {
    ongoing.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
