//! Chunked on-disk array storage
//!
//! Two format generations sit behind one [`ChunkStore`] trait: the legacy
//! driver (one raw file per write chunk) and the columnar "v3" driver
//! (shard files with independently addressable read chunks). Both are
//! self-describing on disk, so either can read a checkpoint written by the
//! other's handler.

pub mod columnar;
pub mod layout;
pub mod legacy;
pub mod store;

pub use columnar::{ColumnarStore, COLUMNAR_META_FILE};
pub use legacy::{LegacyStore, LEGACY_INDEX_FILE};
pub use store::{detect_leaf_driver, open_store, write_atomic, ChunkStore, LeafSpec};
