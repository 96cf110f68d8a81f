//! Legacy chunked driver
//!
//! The original on-disk format: one raw little-endian file per write chunk
//! plus a bincode index record declaring dtype, shape and chunk geometry.
//! Reads are served at write-chunk granularity; the finest addressable read
//! unit and the write unit coincide.
//!
//! Leaf directory layout:
//!
//! ```text
//! <root>/<leaf>/
//!     array.index     <- bincode LeafIndex (magic, version, spec)
//!     c0              <- chunk files, row-major grid indices joined by '.'
//!     c1
//!     ...
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, instrument};

use tensor_core::{extract_region, fill_region, Error, Region, Result, StorageDriver};

use crate::layout::{chunk_file_name, chunk_region, chunks_overlapping};
use crate::store::{check_region, leaf_dir, scan_leaves, write_atomic, ChunkStore, LeafSpec};

/// Index record file present in every legacy leaf directory
pub const LEGACY_INDEX_FILE: &str = "array.index";

/// Magic bytes of the legacy index record
pub const LEGACY_MAGIC: [u8; 4] = *b"CLA1";

/// Legacy format version
pub const LEGACY_VERSION: u32 = 1;

/// Serialized index record of one legacy leaf
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeafIndex {
    magic: [u8; 4],
    version: u32,
    spec: LeafSpec,
}

/// Legacy chunked store rooted at one checkpoint directory
pub struct LegacyStore {
    root: PathBuf,

    /// Cached leaf specs, filled on create or first read
    specs: DashMap<String, LeafSpec>,

    /// Per-chunk write locks keyed by `<leaf>/<chunk file>`
    chunk_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl LegacyStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            specs: DashMap::new(),
            chunk_locks: DashMap::new(),
        }
    }

    async fn spec(&self, leaf: &str) -> Result<LeafSpec> {
        if let Some(spec) = self.specs.get(leaf) {
            return Ok(spec.clone());
        }

        let index_path = leaf_dir(&self.root, leaf).join(LEGACY_INDEX_FILE);
        let raw = match fs::read(&index_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::LeafNotFound {
                    leaf: leaf.to_string(),
                })
            }
            Err(e) => {
                return Err(Error::Storage {
                    message: format!("failed to read {:?}: {}", index_path, e),
                })
            }
        };

        let index: LeafIndex =
            bincode::deserialize(&raw).map_err(|e| Error::CheckpointCorrupted {
                path: index_path.display().to_string(),
                reason: format!("unreadable index record: {}", e),
            })?;
        if index.magic != LEGACY_MAGIC {
            return Err(Error::CheckpointCorrupted {
                path: index_path.display().to_string(),
                reason: "bad index magic".to_string(),
            });
        }
        if index.version != LEGACY_VERSION {
            return Err(Error::CheckpointCorrupted {
                path: index_path.display().to_string(),
                reason: format!("unsupported index version {}", index.version),
            });
        }

        self.specs.insert(leaf.to_string(), index.spec.clone());
        Ok(index.spec)
    }

    fn chunk_lock(&self, leaf: &str, file: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.chunk_locks
            .entry(format!("{}/{}", leaf, file))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl ChunkStore for LegacyStore {
    fn driver(&self) -> StorageDriver {
        StorageDriver::Legacy
    }

    fn root(&self) -> &Path {
        &self.root
    }

    #[instrument(skip(self, spec), fields(driver = "legacy"))]
    async fn create_leaf(&self, leaf: &str, spec: &LeafSpec) -> Result<()> {
        spec.check(leaf)?;

        let index = LeafIndex {
            magic: LEGACY_MAGIC,
            version: LEGACY_VERSION,
            spec: spec.clone(),
        };
        let raw = bincode::serialize(&index).map_err(|e| Error::Serialization(e.to_string()))?;
        write_atomic(&leaf_dir(&self.root, leaf).join(LEGACY_INDEX_FILE), &raw).await?;

        self.specs.insert(leaf.to_string(), spec.clone());
        debug!(leaf, shape = ?spec.shape, chunks = ?spec.write_chunk_shape, "Created legacy leaf");
        Ok(())
    }

    async fn leaf_spec(&self, leaf: &str) -> Result<LeafSpec> {
        self.spec(leaf).await
    }

    #[instrument(skip(self, data), fields(driver = "legacy", size = data.len()))]
    async fn write_region(&self, leaf: &str, region: &Region, data: Bytes) -> Result<()> {
        let spec = self.spec(leaf).await?;
        check_region(leaf, &spec, region, Some(data.len()))?;
        if region.is_empty() {
            return Ok(());
        }

        let elem = spec.elem_size();
        let dir = leaf_dir(&self.root, leaf);

        for index in chunks_overlapping(region, &spec.write_chunk_shape) {
            let chunk_reg = chunk_region(&index, &spec.write_chunk_shape, &spec.shape);
            let Some(inter) = region.intersect(&chunk_reg) else {
                continue;
            };

            let file = chunk_file_name('c', &index);
            let path = dir.join(&file);
            let lock = self.chunk_lock(leaf, &file);
            let _guard = lock.lock().await;

            let patch = extract_region(&data, &region.shape, &inter.relative_to(region), elem);

            let buf = if inter == chunk_reg {
                // full-chunk write, no read-modify-write needed
                patch
            } else {
                let mut buf = match fs::read(&path).await {
                    Ok(existing) => {
                        if existing.len() != chunk_reg.num_elements() * elem {
                            return Err(Error::CheckpointCorrupted {
                                path: path.display().to_string(),
                                reason: format!(
                                    "chunk file holds {} bytes, layout expects {}",
                                    existing.len(),
                                    chunk_reg.num_elements() * elem
                                ),
                            });
                        }
                        existing
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        vec![0u8; chunk_reg.num_elements() * elem]
                    }
                    Err(e) => {
                        return Err(Error::Storage {
                            message: format!("failed to read {:?}: {}", path, e),
                        })
                    }
                };
                fill_region(
                    &mut buf,
                    &chunk_reg.shape,
                    &inter.relative_to(&chunk_reg),
                    &patch,
                    elem,
                );
                buf
            };

            write_atomic(&path, &buf).await?;
        }

        Ok(())
    }

    #[instrument(skip(self), fields(driver = "legacy"))]
    async fn read_region(&self, leaf: &str, region: &Region) -> Result<Bytes> {
        let spec = self.spec(leaf).await?;
        check_region(leaf, &spec, region, None)?;
        if region.is_empty() {
            return Ok(Bytes::new());
        }

        let elem = spec.elem_size();
        let dir = leaf_dir(&self.root, leaf);
        let mut out = vec![0u8; region.num_elements() * elem];

        for index in chunks_overlapping(region, &spec.write_chunk_shape) {
            let chunk_reg = chunk_region(&index, &spec.write_chunk_shape, &spec.shape);
            let Some(inter) = region.intersect(&chunk_reg) else {
                continue;
            };

            let path = dir.join(chunk_file_name('c', &index));
            let chunk = match fs::read(&path).await {
                Ok(chunk) => chunk,
                // chunks never written read back as zeros
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::Storage {
                        message: format!("failed to read {:?}: {}", path, e),
                    })
                }
            };
            if chunk.len() != chunk_reg.num_elements() * elem {
                return Err(Error::CheckpointCorrupted {
                    path: path.display().to_string(),
                    reason: format!(
                        "chunk file holds {} bytes, layout expects {}",
                        chunk.len(),
                        chunk_reg.num_elements() * elem
                    ),
                });
            }

            let piece = extract_region(&chunk, &chunk_reg.shape, &inter.relative_to(&chunk_reg), elem);
            fill_region(&mut out, &region.shape, &inter.relative_to(region), &piece, elem);
        }

        Ok(Bytes::from(out))
    }

    async fn leaf_exists(&self, leaf: &str) -> Result<bool> {
        let path = leaf_dir(&self.root, leaf).join(LEGACY_INDEX_FILE);
        Ok(fs::metadata(path).await.is_ok())
    }

    async fn list_leaves(&self) -> Result<Vec<String>> {
        scan_leaves(&self.root, LEGACY_INDEX_FILE).await
    }
}
