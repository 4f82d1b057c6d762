//! Atomic Writer Module
//!
//! Streams an upload into a staging file next to its destination and publishes
//! it with a single rename. CAS uploads are hashed while they stream and are
//! only published when the digest matches the key.

use crate::cache_key::CacheItem;
use crate::{CacheError, Result};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Prefix of staging file names; used to recognise leftovers after a crash.
pub const STAGING_PREFIX: &str = "upload-";
/// Extension of staging file names.
pub const STAGING_EXTENSION: &str = "tmp";

/// Writes one cache object through a staging file.
///
/// Nothing is visible at the final path until [`AtomicWriter::commit`]
/// succeeds. A writer dropped before commit removes its staging file.
pub struct AtomicWriter {
    temp_file: Option<File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    /// Present when the content must hash to `expected_hash`
    hasher: Option<Sha256>,
    expected_hash: String,
    bytes_written: u64,
    finalized: bool,
}

impl AtomicWriter {
    /// Create a staging file in the destination's directory.
    pub async fn new(item: &CacheItem) -> Result<Self> {
        let final_path = item.absolute_path.clone();
        let temp_path = staging_path_for(&final_path)?;

        let temp_file = File::create(&temp_path).await.map_err(|e| {
            error!(
                "Failed to create staging file: path={:?}, error={}",
                temp_path, e
            );
            CacheError::PersistFailure(format!("Failed to create staging file: {}", e))
        })?;

        debug!(
            "Created staging file: temp_path={:?}, final_path={:?}, verify_hash={}",
            temp_path, final_path, item.verify_hash
        );

        Ok(Self {
            temp_file: Some(temp_file),
            temp_path,
            final_path,
            hasher: item.verify_hash.then(Sha256::new),
            expected_hash: item.hash.clone(),
            bytes_written: 0,
            finalized: false,
        })
    }

    /// Append a chunk to the staging file, feeding the hasher if any.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let file = self.temp_file.as_mut().ok_or_else(|| {
            CacheError::PersistFailure("Cannot write to finalized AtomicWriter".to_string())
        })?;

        file.write_all(data).await.map_err(|e| {
            error!(
                "Failed to write staging file: path={:?}, size={}, error={}",
                self.temp_path,
                data.len(),
                e
            );
            CacheError::PersistFailure(format!("Failed to write staging file: {}", e))
        })?;

        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(data);
        }
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Verify the digest, make the contents durable and rename the staging
    /// file onto the destination. Returns the number of bytes published.
    pub async fn commit(mut self) -> Result<u64> {
        if let Some(hasher) = self.hasher.take() {
            let actual = hex::encode(hasher.finalize());
            if actual != self.expected_hash {
                self.discard().await;
                return Err(CacheError::HashMismatch {
                    expected: self.expected_hash.clone(),
                    actual,
                });
            }
        }

        if let Some(mut file) = self.temp_file.take() {
            file.flush().await.map_err(|e| {
                CacheError::PersistFailure(format!("Failed to flush staging file: {}", e))
            })?;
            file.sync_all().await.map_err(|e| {
                CacheError::PersistFailure(format!("Failed to sync staging file: {}", e))
            })?;
            // Close before rename
            drop(file);
        }

        if let Err(e) = tokio::fs::rename(&self.temp_path, &self.final_path).await {
            error!(
                "Failed renaming {:?} to its final destination {:?}: {}",
                self.temp_path, self.final_path, e
            );
            if let Err(cleanup) = tokio::fs::remove_file(&self.final_path).await {
                warn!(
                    "Failed cleaning up {:?} after a failed rename: {}",
                    self.final_path, cleanup
                );
            }
            return Err(CacheError::PersistFailure(format!(
                "Failed to publish {:?}: {}",
                self.final_path, e
            )));
        }

        self.finalized = true;
        debug!(
            "Published cache object: path={:?}, bytes={}",
            self.final_path, self.bytes_written
        );
        Ok(self.bytes_written)
    }

    /// Remove the staging file. Cleanup is best-effort.
    pub async fn discard(&mut self) {
        if self.finalized {
            return;
        }
        drop(self.temp_file.take());

        if let Err(e) = tokio::fs::remove_file(&self.temp_path).await {
            warn!(
                "Failed to remove staging file: path={:?}, error={}",
                self.temp_path, e
            );
        }
        self.finalized = true;
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }
}

impl Drop for AtomicWriter {
    fn drop(&mut self) {
        if !self.finalized && self.temp_path.exists() {
            warn!(
                "AtomicWriter dropped without finalization, cleaning up: {:?}",
                self.temp_path
            );
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Stream `body` into the object addressed by `item`.
///
/// Read errors from the body fail with [`CacheError::TransferFailure`] and
/// leave the destination untouched.
pub async fn save_to_disk<B>(mut body: B, item: &CacheItem) -> Result<u64>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Display,
{
    let mut writer = AtomicWriter::new(item).await?;

    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                writer.discard().await;
                return Err(CacheError::TransferFailure(e.to_string()));
            }
        };
        if let Ok(data) = frame.into_data() {
            if let Err(e) = writer.write_chunk(&data).await {
                writer.discard().await;
                return Err(e);
            }
        }
    }

    writer.commit().await
}

/// Name a unique staging file in the same directory as `final_path`.
fn staging_path_for(final_path: &Path) -> Result<PathBuf> {
    let dir = final_path.parent().ok_or_else(|| {
        CacheError::PersistFailure(format!("Destination {:?} has no parent", final_path))
    })?;
    Ok(dir.join(format!(
        "{}{}.{}",
        STAGING_PREFIX,
        Uuid::new_v4().simple(),
        STAGING_EXTENSION
    )))
}

/// Whether a file name looks like a staging file written by this module.
pub fn is_staging_file_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX) && name.ends_with(&format!(".{}", STAGING_EXTENSION))
}
