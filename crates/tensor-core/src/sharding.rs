//! Sharding descriptors
//!
//! A sharding descriptor partitions the logical shape of an array into named
//! rectangular shards, each owned by one placement (a device or process
//! identifier). The engine treats placements as opaque strings.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{num_elements, Region};

/// One shard of a sharded array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Placement identifier owning this shard
    pub placement: String,

    /// Sub-region of the logical array owned by this shard
    pub region: Region,
}

/// Partition of a logical array shape across placements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingSpec {
    /// Shards in a stable, deterministic order
    pub shards: Vec<Shard>,
}

impl ShardingSpec {
    /// A single shard covering the whole array on one placement
    pub fn single_device(shape: &[usize], placement: impl Into<String>) -> Self {
        Self {
            shards: vec![Shard {
                placement: placement.into(),
                region: Region::full(shape),
            }],
        }
    }

    /// Split an array near-evenly along one axis, one shard per placement
    ///
    /// The remainder of an uneven split is distributed one element at a time
    /// to the leading shards.
    pub fn split_axis(shape: &[usize], axis: usize, placements: &[String]) -> Result<Self> {
        if axis >= shape.len() {
            return Err(Error::InvalidConfig {
                message: format!("split axis {} out of range for shape {:?}", axis, shape),
            });
        }
        if placements.is_empty() {
            return Err(Error::InvalidConfig {
                message: "split requires at least one placement".to_string(),
            });
        }
        if shape[axis] < placements.len() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "cannot split dimension of extent {} across {} placements",
                    shape[axis],
                    placements.len()
                ),
            });
        }

        let base = shape[axis] / placements.len();
        let remainder = shape[axis] % placements.len();

        let mut shards = Vec::with_capacity(placements.len());
        let mut start = 0;
        for (i, placement) in placements.iter().enumerate() {
            let extent = base + usize::from(i < remainder);
            let mut origin = vec![0; shape.len()];
            origin[axis] = start;
            let mut shard_shape = shape.to_vec();
            shard_shape[axis] = extent;
            shards.push(Shard {
                placement: placement.clone(),
                region: Region::new(origin, shard_shape),
            });
            start += extent;
        }

        Ok(Self { shards })
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Returns true if all shards have the same extents and their origins are
    /// aligned to a grid of that shard shape
    pub fn is_uniform_tiling(&self) -> bool {
        let Some(first) = self.shards.first() else {
            return false;
        };
        let tile = &first.region.shape;
        self.shards.iter().all(|s| {
            s.region.shape == *tile
                && s.region
                    .origin
                    .iter()
                    .zip(tile)
                    .all(|(&o, &t)| t > 0 && o % t == 0)
        })
    }

    /// Validate the partition against a logical array shape
    ///
    /// Checks rank, bounds, pairwise disjointness and full coverage.
    pub fn validate(&self, shape: &[usize]) -> Result<()> {
        let fail = |reason: String| Error::InvalidSharding {
            leaf: String::new(),
            reason,
        };

        if self.shards.is_empty() {
            return Err(fail("descriptor has no shards".to_string()));
        }

        let mut covered = 0usize;
        for (i, shard) in self.shards.iter().enumerate() {
            if shard.region.rank() != shape.len() {
                return Err(fail(format!(
                    "shard {} has rank {}, array has rank {}",
                    i,
                    shard.region.rank(),
                    shape.len()
                )));
            }
            if !shard.region.fits_within(shape) {
                return Err(fail(format!(
                    "shard {} region {} exceeds array shape {:?}",
                    i, shard.region, shape
                )));
            }
            if shard.region.is_empty() {
                return Err(fail(format!("shard {} region {} is empty", i, shard.region)));
            }
            for (j, other) in self.shards.iter().enumerate().skip(i + 1) {
                if shard.region.intersect(&other.region).is_some() {
                    return Err(fail(format!(
                        "shards {} and {} overlap ({} vs {})",
                        i, j, shard.region, other.region
                    )));
                }
            }
            covered += shard.region.num_elements();
        }

        if covered != num_elements(shape) {
            return Err(fail(format!(
                "shards cover {} of {} elements",
                covered,
                num_elements(shape)
            )));
        }

        Ok(())
    }

    /// Attach a leaf name to validation errors
    pub fn validate_for_leaf(&self, shape: &[usize], leaf: &str) -> Result<()> {
        self.validate(shape).map_err(|e| match e {
            Error::InvalidSharding { reason, .. } => Error::InvalidSharding {
                leaf: leaf.to_string(),
                reason,
            },
            other => other,
        })
    }
}
