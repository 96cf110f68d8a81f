//! Chunk store trait and driver selection
//!
//! A chunk store holds many array leaves under one checkpoint directory,
//! each leaf as its own sub-directory of chunk files plus a self-describing
//! format record. Regions are rectangular and need not align to chunk
//! boundaries; the store performs any read-modify-write and assembly needed.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use tensor_core::{Dtype, Error, Region, Result, StorageDriver};

use crate::columnar::{ColumnarStore, COLUMNAR_META_FILE};
use crate::legacy::{LegacyStore, LEGACY_INDEX_FILE};

/// Declared storage layout of one array leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafSpec {
    /// Element type
    pub dtype: Dtype,

    /// Logical array shape
    pub shape: Vec<usize>,

    /// Write/compaction chunk granularity
    pub write_chunk_shape: Vec<usize>,

    /// Finest addressable read granularity
    pub read_chunk_shape: Vec<usize>,
}

impl LeafSpec {
    /// Bytes of one element
    pub fn elem_size(&self) -> usize {
        self.dtype.size_bytes()
    }

    /// Structural sanity check of the declared geometry
    ///
    /// Full geometry validation happens before a save reaches the store;
    /// this guards the store contract itself.
    pub fn check(&self, leaf: &str) -> Result<()> {
        let rank = self.shape.len();
        if self.write_chunk_shape.len() != rank || self.read_chunk_shape.len() != rank {
            return Err(Error::InvalidChunkGeometry {
                leaf: leaf.to_string(),
                reason: format!(
                    "chunk shapes {:?}/{:?} do not match array rank {}",
                    self.write_chunk_shape, self.read_chunk_shape, rank
                ),
            });
        }
        for d in 0..rank {
            if self.write_chunk_shape[d] == 0 || self.read_chunk_shape[d] == 0 {
                return Err(Error::InvalidChunkGeometry {
                    leaf: leaf.to_string(),
                    reason: "chunk dimensions must be positive".to_string(),
                });
            }
            if self.write_chunk_shape[d] % self.read_chunk_shape[d] != 0 {
                return Err(Error::InvalidChunkGeometry {
                    leaf: leaf.to_string(),
                    reason: format!(
                        "write chunk {:?} is not a multiple of read chunk {:?} in dimension {}",
                        self.write_chunk_shape, self.read_chunk_shape, d
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Async interface to a chunked-array storage backend
///
/// One handle serves every leaf under its root directory and is safe for
/// concurrent use: writes to disjoint regions of the same leaf never corrupt
/// each other (chunks touched by both are serialized internally).
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Format this handle writes for new leaves
    fn driver(&self) -> StorageDriver;

    /// Root checkpoint directory
    fn root(&self) -> &Path;

    /// Declare a new leaf with its dtype, shape and chunk geometry
    ///
    /// Succeeds even when the directory already holds unrelated leaves.
    async fn create_leaf(&self, leaf: &str, spec: &LeafSpec) -> Result<()>;

    /// Re-read the declared layout of a stored leaf
    async fn leaf_spec(&self, leaf: &str) -> Result<LeafSpec>;

    /// Write a rectangular region of a leaf
    ///
    /// `data` holds exactly the region's bytes in row-major order. Fails
    /// with `GeometryMismatch` if the region exceeds the declared shape.
    async fn write_region(&self, leaf: &str, region: &Region, data: Bytes) -> Result<()>;

    /// Read a rectangular region of a leaf
    ///
    /// The region need not align to chunk boundaries; chunks never written
    /// read back as zeros.
    async fn read_region(&self, leaf: &str, region: &Region) -> Result<Bytes>;

    /// Check if a leaf has been declared
    async fn leaf_exists(&self, leaf: &str) -> Result<bool>;

    /// All declared leaves under the root, sorted
    async fn list_leaves(&self) -> Result<Vec<String>>;
}

/// Open a chunk store at a directory
///
/// With `create` the directory tree is created if missing; existing content
/// (other leaves, metadata files) is left untouched. Without `create` the
/// directory must already exist.
pub async fn open_store(
    path: &Path,
    driver: StorageDriver,
    create: bool,
) -> Result<Arc<dyn ChunkStore>> {
    if create {
        fs::create_dir_all(path)
            .await
            .map_err(|e| Error::StorageUnavailable {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
    } else if fs::metadata(path).await.is_err() {
        return Err(Error::StorageUnavailable {
            path: path.display().to_string(),
            reason: "directory does not exist".to_string(),
        });
    }

    let store: Arc<dyn ChunkStore> = match driver {
        StorageDriver::Legacy => Arc::new(LegacyStore::new(path)),
        StorageDriver::ColumnarV3 => Arc::new(ColumnarStore::new(path)),
    };
    Ok(store)
}

/// Identify the format a stored leaf was written with
///
/// Each driver leaves a distinctive record in the leaf directory, so a
/// checkpoint is restorable regardless of the reader's configured driver.
pub async fn detect_leaf_driver(root: &Path, leaf: &str) -> Result<StorageDriver> {
    let dir = root.join(leaf);
    if fs::metadata(&dir).await.is_err() {
        return Err(Error::LeafNotFound {
            leaf: leaf.to_string(),
        });
    }
    if fs::metadata(dir.join(COLUMNAR_META_FILE)).await.is_ok() {
        return Ok(StorageDriver::ColumnarV3);
    }
    if fs::metadata(dir.join(LEGACY_INDEX_FILE)).await.is_ok() {
        return Ok(StorageDriver::Legacy);
    }
    Err(Error::CheckpointCorrupted {
        path: dir.display().to_string(),
        reason: "leaf directory has no recognizable format record".to_string(),
    })
}

/// Atomically write a file: unique temp name, fsync, rename into place
///
/// A concurrent reader observes either the previous content or the full new
/// content, never a partial record.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| Error::Storage {
            message: format!("failed to create directory {:?}: {}", parent, e),
        })?;
    }

    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        Uuid::new_v4()
    );
    let temp_path = path.with_file_name(temp_name);

    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| Error::Storage {
            message: format!("failed to create temp file {:?}: {}", temp_path, e),
        })?;
    file.write_all(data).await.map_err(|e| Error::Storage {
        message: format!("failed to write {:?}: {}", temp_path, e),
    })?;
    file.sync_all().await.map_err(|e| Error::Storage {
        message: format!("failed to sync {:?}: {}", temp_path, e),
    })?;

    fs::rename(&temp_path, path).await.map_err(|e| Error::Storage {
        message: format!("failed to rename {:?} to {:?}: {}", temp_path, path, e),
    })?;
    Ok(())
}

/// Bounds- and length-check a region request against a leaf spec
pub(crate) fn check_region(
    leaf: &str,
    spec: &LeafSpec,
    region: &Region,
    data_len: Option<usize>,
) -> Result<()> {
    if !region.fits_within(&spec.shape) {
        return Err(Error::GeometryMismatch {
            leaf: leaf.to_string(),
            region: region.to_string(),
            shape: format!("{:?}", spec.shape),
        });
    }
    if let Some(len) = data_len {
        let expected = region.num_elements() * spec.elem_size();
        if len != expected {
            return Err(Error::Internal {
                message: format!(
                    "leaf '{}': {} bytes supplied for region {} ({} expected)",
                    leaf, len, region, expected
                ),
            });
        }
    }
    Ok(())
}

/// Directory of one leaf under a store root
pub(crate) fn leaf_dir(root: &Path, leaf: &str) -> PathBuf {
    root.join(leaf)
}

/// Shared directory scan used by both drivers
pub(crate) async fn scan_leaves(root: &Path, marker_file: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => {
            return Err(Error::Storage {
                message: format!("failed to list {:?}: {}", root, e),
            })
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if fs::metadata(path.join(marker_file)).await.is_ok() {
            out.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    out.sort();
    Ok(out)
}
