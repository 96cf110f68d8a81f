//! Tensor Core - Foundation types for the checkpoint persistence engine
//!
//! Provides the tensor/tree data model, sharding descriptors, error handling
//! and the barrier capability consumed by the checkpoint handler.

pub mod barrier;
pub mod config;
pub mod error;
pub mod sharding;
pub mod tensor;
pub mod tree;
pub mod types;

pub use barrier::{Barrier, LocalBarrier, NoopBarrier};
pub use config::{
    ChunkGeometry, HandlerOptions, Participant, RestoreArgs, SaveArgs, StorageDriver,
};
pub use error::{Error, Result};
pub use sharding::{Shard, ShardingSpec};
pub use tensor::{extract_region, fill_region, Element, Tensor};
pub use tree::{storage_key, validate_key, PathElem, Structure, Tree, TreePath};
pub use types::{num_elements, Dtype, Region};
