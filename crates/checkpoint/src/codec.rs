//! Array codec: one logical leaf to and from chunk-store regions
//!
//! The codec owns geometry validation and the shard-level fan-out. Encoding
//! is sharding-driven: each shard region becomes one independent store
//! write. Decoding is equally sharding-driven, so read-chunk granularity is
//! a storage-layout concern invisible in the logical result.

use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::debug;

use chunk_store::{ChunkStore, LeafSpec};
use tensor_core::{
    fill_region, ChunkGeometry, Error, Region, Result, ShardingSpec, StorageDriver, Tensor,
};

/// Chunk geometry after validation and defaulting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGeometry {
    pub write_chunk_shape: Vec<usize>,
    pub read_chunk_shape: Vec<usize>,
}

/// Validate and default the chunk geometry of one leaf
///
/// All constraints are checked here, before any filesystem side effect, so a
/// geometry error never leaves partial chunk files behind:
/// - write and read chunk shapes must be supplied together
/// - ranks must match the array rank
/// - every chunk dimension must be positive
/// - each write dimension must be an integer multiple of the read dimension
/// - neither may exceed the array shape
///
/// With no override the driver picks the geometry: the shard shape when the
/// sharding is a uniform aligned tiling, otherwise the full array shape. The
/// legacy driver reads at write-chunk granularity, so its read chunk shape
/// is normalized to the write chunk shape.
pub fn resolve_geometry(
    leaf: &str,
    tensor: &Tensor,
    geometry: Option<&ChunkGeometry>,
    driver: StorageDriver,
) -> Result<ResolvedGeometry> {
    let shape = tensor.shape();
    let fail = |reason: String| Error::InvalidChunkGeometry {
        leaf: leaf.to_string(),
        reason,
    };

    let (write, read) = match geometry {
        None
        | Some(ChunkGeometry {
            write_chunk_shape: None,
            read_chunk_shape: None,
        }) => {
            let default = default_chunk_shape(tensor);
            (default.clone(), default)
        }
        Some(ChunkGeometry {
            write_chunk_shape: Some(write),
            read_chunk_shape: Some(read),
        }) => (write.clone(), read.clone()),
        Some(_) => {
            return Err(fail(
                "write and read chunk shapes must be supplied together".to_string(),
            ))
        }
    };

    if write.len() != shape.len() || read.len() != shape.len() {
        return Err(fail(format!(
            "chunk shapes {:?}/{:?} do not match array rank {}",
            write,
            read,
            shape.len()
        )));
    }
    for d in 0..shape.len() {
        if write[d] == 0 || read[d] == 0 {
            return Err(fail(format!(
                "chunk dimension {} must be positive (write {:?}, read {:?})",
                d, write, read
            )));
        }
        if write[d] % read[d] != 0 {
            return Err(fail(format!(
                "write chunk {:?} is not an integer multiple of read chunk {:?} in dimension {}",
                write, read, d
            )));
        }
        if write[d] > shape[d].max(1) || read[d] > shape[d].max(1) {
            return Err(fail(format!(
                "chunk shapes {:?}/{:?} exceed array shape {:?}",
                write, read, shape
            )));
        }
    }

    let read = match driver {
        StorageDriver::Legacy => write.clone(),
        StorageDriver::ColumnarV3 => read,
    };

    Ok(ResolvedGeometry {
        write_chunk_shape: write,
        read_chunk_shape: read,
    })
}

/// Driver-chosen chunk shape when the caller supplies none
fn default_chunk_shape(tensor: &Tensor) -> Vec<usize> {
    if let Some(sharding) = tensor.sharding() {
        if sharding.is_uniform_tiling() {
            return sharding.shards[0].region.shape.clone();
        }
    }
    tensor.shape().iter().map(|&e| e.max(1)).collect()
}

/// Split a leaf into independent (region, bytes) writes
///
/// One entry per shard; a single full-array entry when unsharded.
pub fn encode(tensor: &Tensor) -> Result<Vec<(Region, Bytes)>> {
    match tensor.sharding() {
        Some(sharding) => sharding
            .shards
            .iter()
            .map(|shard| Ok((shard.region.clone(), tensor.extract(&shard.region)?)))
            .collect(),
        None => Ok(vec![(
            Region::full(tensor.shape()),
            tensor.data().clone(),
        )]),
    }
}

/// Write one leaf through the chunk store
///
/// Validates sharding and geometry before creating the leaf; shard regions
/// are written concurrently.
pub async fn save_leaf(
    store: &Arc<dyn ChunkStore>,
    key: &str,
    tensor: &Tensor,
    geometry: Option<&ChunkGeometry>,
) -> Result<()> {
    if let Some(sharding) = tensor.sharding() {
        sharding.validate_for_leaf(tensor.shape(), key)?;
    }
    let resolved = resolve_geometry(key, tensor, geometry, store.driver())?;

    let spec = LeafSpec {
        dtype: tensor.dtype(),
        shape: tensor.shape().to_vec(),
        write_chunk_shape: resolved.write_chunk_shape,
        read_chunk_shape: resolved.read_chunk_shape,
    };
    store.create_leaf(key, &spec).await?;

    let writes = encode(tensor)?;
    debug!(leaf = key, regions = writes.len(), "Writing leaf regions");

    if writes.len() == 1 {
        let (region, data) = writes.into_iter().next().expect("one write planned");
        return store.write_region(key, &region, data).await;
    }

    let mut tasks = JoinSet::new();
    for (region, data) in writes {
        let store = store.clone();
        let key = key.to_string();
        tasks.spawn(async move { store.write_region(&key, &region, data).await });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| Error::TaskJoin {
            message: e.to_string(),
        })?;
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Read one leaf back from the chunk store
///
/// With a target sharding descriptor the result's per-shard regions match
/// the descriptor exactly and the descriptor is attached; with none the full
/// shape is read as a single unsharded block.
pub async fn restore_leaf(
    store: &Arc<dyn ChunkStore>,
    key: &str,
    target_sharding: Option<&ShardingSpec>,
) -> Result<Tensor> {
    let spec = store.leaf_spec(key).await?;

    let Some(sharding) = target_sharding else {
        let data = store.read_region(key, &Region::full(&spec.shape)).await?;
        return Tensor::from_bytes(spec.dtype, spec.shape, data);
    };

    sharding.validate_for_leaf(&spec.shape, key)?;

    let mut tasks = JoinSet::new();
    for shard in &sharding.shards {
        let store = store.clone();
        let key = key.to_string();
        let region = shard.region.clone();
        tasks.spawn(async move {
            let data = store.read_region(&key, &region).await?;
            Ok::<_, Error>((region, data))
        });
    }

    let elem = spec.elem_size();
    let mut buf = vec![0u8; tensor_core::num_elements(&spec.shape) * elem];
    while let Some(joined) = tasks.join_next().await {
        let (region, data) = joined.map_err(|e| Error::TaskJoin {
            message: e.to_string(),
        })??;
        fill_region(
            &mut buf,
            &spec.shape,
            &region,
            &data,
            elem,
        );
    }

    Tensor::from_bytes(spec.dtype, spec.shape, Bytes::from(buf))?
        .with_sharding(sharding.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunk_store::open_store;
    use tempfile::TempDir;
    use tensor_core::Dtype;

    fn tensor_1d(n: usize) -> Tensor {
        Tensor::from_vec(vec![n], (0..n as i32).collect()).unwrap()
    }

    #[test]
    fn test_resolve_default_unsharded() {
        let t = tensor_1d(10);
        let g = resolve_geometry("x", &t, None, StorageDriver::ColumnarV3).unwrap();
        assert_eq!(g.write_chunk_shape, vec![10]);
        assert_eq!(g.read_chunk_shape, vec![10]);
    }

    #[test]
    fn test_resolve_default_uses_shard_tiling() {
        let placements = vec!["device:0".to_string(), "device:1".to_string()];
        let sharding = ShardingSpec::split_axis(&[10], 0, &placements).unwrap();
        let t = tensor_1d(10).with_sharding(sharding).unwrap();
        let g = resolve_geometry("x", &t, None, StorageDriver::ColumnarV3).unwrap();
        assert_eq!(g.write_chunk_shape, vec![5]);
    }

    #[test]
    fn test_resolve_rejects_lone_write_chunk() {
        let t = tensor_1d(10);
        let geometry = ChunkGeometry {
            write_chunk_shape: Some(vec![3]),
            read_chunk_shape: None,
        };
        let result = resolve_geometry("x", &t, Some(&geometry), StorageDriver::ColumnarV3);
        assert!(matches!(result, Err(Error::InvalidChunkGeometry { .. })));
    }

    #[test]
    fn test_resolve_rejects_lone_read_chunk() {
        let t = tensor_1d(10);
        let geometry = ChunkGeometry {
            write_chunk_shape: None,
            read_chunk_shape: Some(vec![3]),
        };
        let result = resolve_geometry("x", &t, Some(&geometry), StorageDriver::ColumnarV3);
        assert!(matches!(result, Err(Error::InvalidChunkGeometry { .. })));
    }

    #[test]
    fn test_resolve_rejects_non_multiple() {
        let t = tensor_1d(10);
        let geometry = ChunkGeometry::new(vec![5], vec![2]);
        let result = resolve_geometry("x", &t, Some(&geometry), StorageDriver::ColumnarV3);
        assert!(matches!(result, Err(Error::InvalidChunkGeometry { .. })));
    }

    #[test]
    fn test_resolve_rejects_rank_mismatch() {
        let t = tensor_1d(10);
        let geometry = ChunkGeometry::new(vec![2, 2], vec![1, 1]);
        assert!(resolve_geometry("x", &t, Some(&geometry), StorageDriver::ColumnarV3).is_err());
    }

    #[test]
    fn test_resolve_rejects_oversized_chunk() {
        let t = tensor_1d(10);
        let geometry = ChunkGeometry::new(vec![12], vec![12]);
        assert!(resolve_geometry("x", &t, Some(&geometry), StorageDriver::ColumnarV3).is_err());
    }

    #[test]
    fn test_legacy_normalizes_read_chunk() {
        let t = tensor_1d(10);
        let geometry = ChunkGeometry::new(vec![4], vec![2]);
        let g = resolve_geometry("x", &t, Some(&geometry), StorageDriver::Legacy).unwrap();
        assert_eq!(g.read_chunk_shape, vec![4]);
    }

    #[test]
    fn test_encode_sharded_regions() {
        let placements = vec!["device:0".to_string(), "device:1".to_string()];
        let sharding = ShardingSpec::split_axis(&[10], 0, &placements).unwrap();
        let t = tensor_1d(10).with_sharding(sharding).unwrap();

        let writes = encode(&t).unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].0, Region::new(vec![0], vec![5]));
        assert_eq!(writes[1].0, Region::new(vec![5], vec![5]));
        assert_eq!(writes[0].1.len(), 5 * 4);
    }

    #[tokio::test]
    async fn test_save_restore_leaf_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), StorageDriver::ColumnarV3, true)
            .await
            .unwrap();

        let placements = vec!["device:0".to_string(), "device:1".to_string()];
        let sharding = ShardingSpec::split_axis(&[8], 0, &placements).unwrap();
        let t = tensor_1d(8).with_sharding(sharding.clone()).unwrap();

        save_leaf(&store, "x", &t, None).await.unwrap();

        let plain = restore_leaf(&store, "x", None).await.unwrap();
        assert_eq!(plain.to_vec::<i32>().unwrap(), (0..8).collect::<Vec<_>>());
        assert!(plain.sharding().is_none());

        let sharded = restore_leaf(&store, "x", Some(&sharding)).await.unwrap();
        assert_eq!(sharded.sharding(), Some(&sharding));
        assert_eq!(sharded.to_vec::<i32>().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_geometry_error_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), StorageDriver::ColumnarV3, true)
            .await
            .unwrap();

        let t = tensor_1d(10);
        let geometry = ChunkGeometry::new(vec![5], vec![2]);
        let result = save_leaf(&store, "x", &t, Some(&geometry)).await;
        assert!(matches!(result, Err(Error::InvalidChunkGeometry { .. })));
        assert!(!dir.path().join("x").exists());
    }

    #[tokio::test]
    async fn test_restore_scalar() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), StorageDriver::Legacy, true)
            .await
            .unwrap();
        let t = Tensor::from_vec(vec![], vec![3.5f64]).unwrap();
        save_leaf(&store, "s", &t, None).await.unwrap();

        let back = restore_leaf(&store, "s", None).await.unwrap();
        assert_eq!(back.to_vec::<f64>().unwrap(), vec![3.5]);
        assert_eq!(back.dtype(), Dtype::F64);
    }
}
