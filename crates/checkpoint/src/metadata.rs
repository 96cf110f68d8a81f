//! Tree metadata records
//!
//! The optional metadata file maps each leaf path to its dtype, shape,
//! sharding descriptor and storage driver, and records the container-kind
//! ancestry of the whole tree. With it a restore rehydrates a typed, sharded
//! tree; without it restore degrades to plain unsharded arrays. The record
//! is written once, atomically, at save time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::debug;

use chunk_store::write_atomic;
use tensor_core::{
    storage_key, Dtype, Error, Result, ShardingSpec, StorageDriver, Structure, Tree,
};

/// Well-known metadata file name at the checkpoint root
pub const TREE_METADATA_FILE: &str = "tree_metadata.json";

/// Current metadata record version
pub const METADATA_VERSION: u32 = 1;

/// Persisted description of one leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafMetadata {
    /// Storage key derived from the leaf's tree path
    pub key: String,

    pub dtype: Dtype,

    pub shape: Vec<usize>,

    /// Shard layout at save time, if the leaf was sharded
    pub sharding: Option<ShardingSpec>,

    /// Format the leaf was written with
    pub driver: StorageDriver,
}

/// Persisted description of a whole checkpoint tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeMetadata {
    pub format_version: u32,

    pub created_at: DateTime<Utc>,

    /// Container kinds and key order of the tree
    pub structure: Structure,

    /// One entry per leaf, in deterministic walk order
    pub leaves: Vec<LeafMetadata>,
}

impl TreeMetadata {
    /// Describe a tree about to be saved with the given driver
    pub fn describe(tree: &Tree, driver: StorageDriver) -> Self {
        let leaves = tree
            .leaves()
            .into_iter()
            .map(|(path, tensor)| LeafMetadata {
                key: storage_key(&path),
                dtype: tensor.dtype(),
                shape: tensor.shape().to_vec(),
                sharding: tensor.sharding().cloned(),
                driver,
            })
            .collect();

        Self {
            format_version: METADATA_VERSION,
            created_at: Utc::now(),
            structure: tree.structure(),
            leaves,
        }
    }

    /// Look up the entry for a storage key
    pub fn leaf(&self, key: &str) -> Option<&LeafMetadata> {
        self.leaves.iter().find(|l| l.key == key)
    }
}

/// Write the tree metadata record atomically
pub async fn write_tree_metadata(directory: &Path, metadata: &TreeMetadata) -> Result<()> {
    let raw = serde_json::to_vec_pretty(metadata)?;
    write_atomic(&directory.join(TREE_METADATA_FILE), &raw).await?;
    debug!(
        path = %directory.display(),
        leaves = metadata.leaves.len(),
        "Wrote tree metadata"
    );
    Ok(())
}

/// Read the tree metadata record, if present
///
/// A missing file is a recognized state (degraded restore), not an error.
pub async fn read_tree_metadata(directory: &Path) -> Result<Option<TreeMetadata>> {
    let path = directory.join(TREE_METADATA_FILE);
    let raw = match fs::read(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::Storage {
                message: format!("failed to read {:?}: {}", path, e),
            })
        }
    };

    let metadata: TreeMetadata =
        serde_json::from_slice(&raw).map_err(|e| Error::CheckpointCorrupted {
            path: path.display().to_string(),
            reason: format!("unreadable tree metadata: {}", e),
        })?;
    if metadata.format_version != METADATA_VERSION {
        return Err(Error::CheckpointCorrupted {
            path: path.display().to_string(),
            reason: format!(
                "unsupported tree metadata version {}",
                metadata.format_version
            ),
        });
    }
    Ok(Some(metadata))
}
