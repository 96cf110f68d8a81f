//! Columnar "v3" chunked driver
//!
//! The newer format generation. Each write chunk is one shard file holding
//! its read chunks as independently addressable slices, indexed by a bincode
//! trailer at the end of the file, so a read touches only the read chunks it
//! needs. The leaf is described by a JSON metadata record.
//!
//! Leaf directory layout:
//!
//! ```text
//! <root>/<leaf>/
//!     meta.json       <- LeafMeta (driver tag, version, spec)
//!     s0              <- shard files, row-major write-chunk indices
//!     s1
//!     ...
//! ```
//!
//! Shard file layout:
//!
//! ```text
//! +--------------------------+
//! | Magic "ACS3" (4 bytes)   |
//! +--------------------------+
//! | Read-chunk payloads      |  <- row-major inner-grid order, clipped
//! +--------------------------+
//! | Trailer (bincode)        |  <- per-read-chunk { offset, len }
//! +--------------------------+
//! | Trailer length (u32 LE)  |
//! +--------------------------+
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument};

use tensor_core::{extract_region, fill_region, Error, Region, Result, StorageDriver};

use crate::layout::{cartesian, chunk_file_name, chunk_region, chunks_overlapping};
use crate::store::{check_region, leaf_dir, scan_leaves, write_atomic, ChunkStore, LeafSpec};

/// Metadata record file present in every columnar leaf directory
pub const COLUMNAR_META_FILE: &str = "meta.json";

/// Magic bytes at the start of every shard file
pub const SHARD_MAGIC: [u8; 4] = *b"ACS3";

/// Columnar format version
pub const COLUMNAR_VERSION: u32 = 3;

/// Size of the trailer length field at the end of a shard file
const TRAILER_LEN_SIZE: usize = 4;

/// JSON metadata record of one columnar leaf
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeafMeta {
    driver: StorageDriver,
    format_version: u32,
    created_at: DateTime<Utc>,
    spec: LeafSpec,
}

/// Location of one read chunk inside its shard file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkEntry {
    offset: u64,
    len: u64,
}

/// Trailer indexing the read chunks of a shard file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShardTrailer {
    chunks: Vec<ChunkEntry>,
}

/// Columnar chunked store rooted at one checkpoint directory
pub struct ColumnarStore {
    root: PathBuf,
    specs: DashMap<String, LeafSpec>,
    chunk_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ColumnarStore {
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

        let meta_path = leaf_dir(&self.root, leaf).join(COLUMNAR_META_FILE);
        let raw = match fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::LeafNotFound {
                    leaf: leaf.to_string(),
                })
            }
            Err(e) => {
                return Err(Error::Storage {
                    message: format!("failed to read {:?}: {}", meta_path, e),
                })
            }
        };

        let meta: LeafMeta =
            serde_json::from_slice(&raw).map_err(|e| Error::CheckpointCorrupted {
                path: meta_path.display().to_string(),
                reason: format!("unreadable metadata record: {}", e),
            })?;
        if meta.format_version != COLUMNAR_VERSION {
            return Err(Error::CheckpointCorrupted {
                path: meta_path.display().to_string(),
                reason: format!("unsupported format version {}", meta.format_version),
            });
        }

        self.specs.insert(leaf.to_string(), meta.spec.clone());
        Ok(meta.spec)
    }

    fn chunk_lock(&self, leaf: &str, file: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.chunk_locks
            .entry(format!("{}/{}", leaf, file))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Serialize a full write-chunk buffer into shard file bytes
    fn encode_shard(chunk_reg: &Region, buf: &[u8], spec: &LeafSpec) -> Result<Vec<u8>> {
        let elem = spec.elem_size();
        let inner = inner_chunks(chunk_reg, &spec.read_chunk_shape);

        let mut out = Vec::with_capacity(buf.len() + 64);
        out.extend_from_slice(&SHARD_MAGIC);

        let mut entries = Vec::with_capacity(inner.len());
        for region in &inner {
            let payload = extract_region(buf, &chunk_reg.shape, &region.relative_to(chunk_reg), elem);
            entries.push(ChunkEntry {
                offset: out.len() as u64,
                len: payload.len() as u64,
            });
            out.extend_from_slice(&payload);
        }

        let trailer = bincode::serialize(&ShardTrailer { chunks: entries })
            .map_err(|e| Error::Serialization(e.to_string()))?;
        out.extend_from_slice(&trailer);
        out.extend_from_slice(&(trailer.len() as u32).to_le_bytes());
        Ok(out)
    }

    /// Read a whole shard file back into a write-chunk buffer
    fn decode_shard(path: &Path, raw: &[u8], chunk_reg: &Region, spec: &LeafSpec) -> Result<Vec<u8>> {
        let elem = spec.elem_size();
        let inner = inner_chunks(chunk_reg, &spec.read_chunk_shape);
        let trailer = parse_trailer(path, raw, inner.len())?;

        let mut buf = vec![0u8; chunk_reg.num_elements() * elem];
        for (region, entry) in inner.iter().zip(&trailer.chunks) {
            let start = entry.offset as usize;
            let end = start + entry.len as usize;
            if end > raw.len() {
                return Err(corrupt(path, "read chunk extends past end of shard file"));
            }
            fill_region(
                &mut buf,
                &chunk_reg.shape,
                &region.relative_to(chunk_reg),
                &raw[start..end],
                elem,
            );
        }
        Ok(buf)
    }
}

#[async_trait]
impl ChunkStore for ColumnarStore {
    fn driver(&self) -> StorageDriver {
        StorageDriver::ColumnarV3
    }

    fn root(&self) -> &Path {
        &self.root
    }

    #[instrument(skip(self, spec), fields(driver = "columnar-v3"))]
    async fn create_leaf(&self, leaf: &str, spec: &LeafSpec) -> Result<()> {
        spec.check(leaf)?;

        let meta = LeafMeta {
            driver: StorageDriver::ColumnarV3,
            format_version: COLUMNAR_VERSION,
            created_at: Utc::now(),
            spec: spec.clone(),
        };
        let raw = serde_json::to_vec_pretty(&meta)?;
        write_atomic(&leaf_dir(&self.root, leaf).join(COLUMNAR_META_FILE), &raw).await?;

        self.specs.insert(leaf.to_string(), spec.clone());
        debug!(
            leaf,
            shape = ?spec.shape,
            write_chunks = ?spec.write_chunk_shape,
            read_chunks = ?spec.read_chunk_shape,
            "Created columnar leaf"
        );
        Ok(())
    }

    async fn leaf_spec(&self, leaf: &str) -> Result<LeafSpec> {
        self.spec(leaf).await
    }

    #[instrument(skip(self, data), fields(driver = "columnar-v3", size = data.len()))]
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

            let file = chunk_file_name('s', &index);
            let path = dir.join(&file);
            let lock = self.chunk_lock(leaf, &file);
            let _guard = lock.lock().await;

            let mut buf = match fs::read(&path).await {
                Ok(raw) => Self::decode_shard(&path, &raw, &chunk_reg, &spec)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    vec![0u8; chunk_reg.num_elements() * elem]
                }
                Err(e) => {
                    return Err(Error::Storage {
                        message: format!("failed to read {:?}: {}", path, e),
                    })
                }
            };

            let patch = extract_region(&data, &region.shape, &inter.relative_to(region), elem);
            fill_region(
                &mut buf,
                &chunk_reg.shape,
                &inter.relative_to(&chunk_reg),
                &patch,
                elem,
            );

            let encoded = Self::encode_shard(&chunk_reg, &buf, &spec)?;
            write_atomic(&path, &encoded).await?;
        }

        Ok(())
    }

    #[instrument(skip(self), fields(driver = "columnar-v3"))]
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
            if region.intersect(&chunk_reg).is_none() {
                continue;
            }

            let path = dir.join(chunk_file_name('s', &index));
            let mut file = match fs::File::open(&path).await {
                Ok(file) => file,
                // shards never written read back as zeros
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::Storage {
                        message: format!("failed to open {:?}: {}", path, e),
                    })
                }
            };

            let inner = inner_chunks(&chunk_reg, &spec.read_chunk_shape);
            let trailer = read_trailer(&path, &mut file, inner.len()).await?;

            // seek only to the read chunks the request touches
            for (read_reg, entry) in inner.iter().zip(&trailer.chunks) {
                let Some(need) = region.intersect(read_reg) else {
                    continue;
                };

                let mut payload = vec![0u8; entry.len as usize];
                file.seek(std::io::SeekFrom::Start(entry.offset))
                    .await
                    .map_err(Error::Io)?;
                file.read_exact(&mut payload).await.map_err(Error::Io)?;

                let piece =
                    extract_region(&payload, &read_reg.shape, &need.relative_to(read_reg), elem);
                fill_region(&mut out, &region.shape, &need.relative_to(region), &piece, elem);
            }
        }

        Ok(Bytes::from(out))
    }

    async fn leaf_exists(&self, leaf: &str) -> Result<bool> {
        let path = leaf_dir(&self.root, leaf).join(COLUMNAR_META_FILE);
        Ok(fs::metadata(path).await.is_ok())
    }

    async fn list_leaves(&self) -> Result<Vec<String>> {
        scan_leaves(&self.root, COLUMNAR_META_FILE).await
    }
}

/// Absolute regions of the read chunks tiling a write chunk, row-major
fn inner_chunks(chunk_reg: &Region, read_chunk: &[usize]) -> Vec<Region> {
    let ranges: Vec<std::ops::Range<usize>> = (0..chunk_reg.rank())
        .map(|d| 0..chunk_reg.shape[d].div_ceil(read_chunk[d]))
        .collect();

    cartesian(&ranges)
        .into_iter()
        .map(|index| {
            let origin: Vec<usize> = (0..chunk_reg.rank())
                .map(|d| chunk_reg.origin[d] + index[d] * read_chunk[d])
                .collect();
            let shape: Vec<usize> = (0..chunk_reg.rank())
                .map(|d| read_chunk[d].min(chunk_reg.end(d) - origin[d]))
                .collect();
            Region::new(origin, shape)
        })
        .collect()
}

fn corrupt(path: &Path, reason: &str) -> Error {
    Error::CheckpointCorrupted {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Parse the trailer of a fully buffered shard file
fn parse_trailer(path: &Path, raw: &[u8], expected_chunks: usize) -> Result<ShardTrailer> {
    if raw.len() < SHARD_MAGIC.len() + TRAILER_LEN_SIZE || raw[..4] != SHARD_MAGIC {
        return Err(corrupt(path, "bad shard magic"));
    }
    let len_start = raw.len() - TRAILER_LEN_SIZE;
    let trailer_len = u32::from_le_bytes([
        raw[len_start],
        raw[len_start + 1],
        raw[len_start + 2],
        raw[len_start + 3],
    ]) as usize;
    if trailer_len > len_start {
        return Err(corrupt(path, "trailer length exceeds file size"));
    }

    let trailer: ShardTrailer = bincode::deserialize(&raw[len_start - trailer_len..len_start])
        .map_err(|_| corrupt(path, "unreadable shard trailer"))?;
    if trailer.chunks.len() != expected_chunks {
        return Err(corrupt(path, "trailer chunk count does not match layout"));
    }
    Ok(trailer)
}

/// Read the trailer of an open shard file without buffering the payloads
async fn read_trailer(
    path: &Path,
    file: &mut fs::File,
    expected_chunks: usize,
) -> Result<ShardTrailer> {
    let total = file.metadata().await.map_err(Error::Io)?.len();
    if total < (SHARD_MAGIC.len() + TRAILER_LEN_SIZE) as u64 {
        return Err(corrupt(path, "shard file too short"));
    }

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).await.map_err(Error::Io)?;
    if magic != SHARD_MAGIC {
        return Err(corrupt(path, "bad shard magic"));
    }

    file.seek(std::io::SeekFrom::End(-(TRAILER_LEN_SIZE as i64)))
        .await
        .map_err(Error::Io)?;
    let trailer_len = file.read_u32_le().await.map_err(Error::Io)? as u64;

    let len_start = total - TRAILER_LEN_SIZE as u64;
    if trailer_len > len_start {
        return Err(corrupt(path, "trailer length exceeds file size"));
    }
    file.seek(std::io::SeekFrom::Start(len_start - trailer_len))
        .await
        .map_err(Error::Io)?;
    let mut raw = vec![0u8; trailer_len as usize];
    file.read_exact(&mut raw).await.map_err(Error::Io)?;

    let trailer: ShardTrailer =
        bincode::deserialize(&raw).map_err(|_| corrupt(path, "unreadable shard trailer"))?;
    if trailer.chunks.len() != expected_chunks {
        return Err(corrupt(path, "trailer chunk count does not match layout"));
    }
    Ok(trailer)
}
