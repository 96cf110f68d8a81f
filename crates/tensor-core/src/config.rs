//! Handler options and per-call arguments

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::sharding::ShardingSpec;

/// On-disk chunked-array format for newly written leaves
///
/// Both formats are self-describing on disk; the driver selection only
/// affects how new leaves are written, never whether an existing checkpoint
/// can be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageDriver {
    /// One raw file per write chunk, bincode index record
    #[serde(rename = "legacy")]
    Legacy,

    /// Columnar shard files with independently addressable read chunks
    #[serde(rename = "columnar-v3")]
    ColumnarV3,
}

impl StorageDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageDriver::Legacy => "legacy",
            StorageDriver::ColumnarV3 => "columnar-v3",
        }
    }
}

impl std::fmt::Display for StorageDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied chunk shapes for one leaf
///
/// `None` for both means the driver picks its own geometry. Supplying only
/// one of the two is a configuration error, surfaced before any write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkGeometry {
    /// Write/compaction granularity per dimension
    pub write_chunk_shape: Option<Vec<usize>>,

    /// Finest addressable read granularity per dimension
    pub read_chunk_shape: Option<Vec<usize>>,
}

impl ChunkGeometry {
    pub fn new(write_chunk_shape: Vec<usize>, read_chunk_shape: Vec<usize>) -> Self {
        Self {
            write_chunk_shape: Some(write_chunk_shape),
            read_chunk_shape: Some(read_chunk_shape),
        }
    }

    /// Returns true when no override is present
    pub fn is_default(&self) -> bool {
        self.write_chunk_shape.is_none() && self.read_chunk_shape.is_none()
    }
}

/// Construction-time options of a checkpoint handler
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Format for newly written leaves
    pub driver: StorageDriver,

    /// Persist full shape/sharding metadata enabling typed restore
    pub write_tree_metadata: bool,

    /// Maximum leaves written or read concurrently
    pub max_concurrent_leaves: usize,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            driver: StorageDriver::Legacy,
            write_tree_metadata: true,
            max_concurrent_leaves: 16,
        }
    }
}

/// Per-save arguments
#[derive(Debug, Clone, Default)]
pub struct SaveArgs {
    /// Chunk geometry overrides keyed by leaf storage key
    pub per_leaf_geometry: HashMap<String, ChunkGeometry>,
}

impl SaveArgs {
    /// Add a geometry override for one leaf
    pub fn with_geometry(mut self, leaf: impl Into<String>, geometry: ChunkGeometry) -> Self {
        self.per_leaf_geometry.insert(leaf.into(), geometry);
        self
    }
}

/// Per-restore arguments
#[derive(Debug, Clone, Default)]
pub struct RestoreArgs {
    /// Target sharding overrides keyed by leaf storage key
    pub per_leaf_sharding: HashMap<String, ShardingSpec>,
}

impl RestoreArgs {
    /// Request a shard layout for one restored leaf
    pub fn with_sharding(mut self, leaf: impl Into<String>, sharding: ShardingSpec) -> Self {
        self.per_leaf_sharding.insert(leaf.into(), sharding);
        self
    }
}

/// Identity of one participant in a multi-participant save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    /// This participant's rank, `0 <= rank < count`
    pub rank: usize,

    /// Total number of participants
    pub count: usize,
}

impl Participant {
    /// The single participant of a local save
    pub fn solo() -> Self {
        Self { rank: 0, count: 1 }
    }

    /// Returns true if this participant writes the finalize marker
    ///
    /// By convention the lowest rank finalizes.
    pub fn is_finalizer(&self) -> bool {
        self.rank == 0
    }

    /// Returns true if this participant owns the leaf at `index` in the
    /// deterministic walk order
    pub fn owns_leaf(&self, index: usize) -> bool {
        index % self.count == self.rank
    }

    pub fn validate(&self) -> Result<()> {
        if self.count == 0 || self.rank >= self.count {
            return Err(Error::InvalidConfig {
                message: format!(
                    "invalid participant rank {} of {}",
                    self.rank, self.count
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_serde_names() {
        assert_eq!(
            serde_json::to_string(&StorageDriver::ColumnarV3).unwrap(),
            "\"columnar-v3\""
        );
        let back: StorageDriver = serde_json::from_str("\"legacy\"").unwrap();
        assert_eq!(back, StorageDriver::Legacy);
    }

    #[test]
    fn test_participant_ownership() {
        let p0 = Participant { rank: 0, count: 2 };
        let p1 = Participant { rank: 1, count: 2 };
        assert!(p0.owns_leaf(0) && !p0.owns_leaf(1));
        assert!(p1.owns_leaf(1) && !p1.owns_leaf(0));
        assert!(p0.is_finalizer() && !p1.is_finalizer());
    }

    #[test]
    fn test_participant_validation() {
        assert!(Participant::solo().validate().is_ok());
        assert!(Participant { rank: 2, count: 2 }.validate().is_err());
        assert!(Participant { rank: 0, count: 0 }.validate().is_err());
    }

    #[test]
    fn test_default_geometry() {
        assert!(ChunkGeometry::default().is_default());
        assert!(!ChunkGeometry::new(vec![2], vec![1]).is_default());
    }
}
