//! Checkpoint persistence for trees of sharded arrays
//!
//! Provides the array codec, tree metadata records and the save/restore
//! handler orchestrating parallel leaf writes, finalization and restore.

pub mod codec;
pub mod handler;
pub mod metadata;

pub use codec::{encode, resolve_geometry, restore_leaf, save_leaf, ResolvedGeometry};
pub use handler::{CheckpointHandler, WriteStatus, COMMIT_MARKER_FILE};
pub use metadata::{
    read_tree_metadata, write_tree_metadata, LeafMetadata, TreeMetadata, METADATA_VERSION,
    TREE_METADATA_FILE,
};
