//! Checkpoint handler: save/restore orchestration and finalization
//!
//! A save stages per-leaf chunk writes in parallel, optionally persists tree
//! metadata, then publishes the directory by writing the finalize marker —
//! in a multi-participant save exactly the lowest rank writes it, and every
//! participant synchronizes on the injected barrier before returning. A
//! directory without the marker is rejected by restore as incomplete; the
//! missing marker, not cleanup, is the recovery signal after a failed save.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

use chunk_store::{detect_leaf_driver, open_store, write_atomic, ChunkStore};
use tensor_core::{
    storage_key, validate_key, Barrier, Error, HandlerOptions, NoopBarrier, Participant, PathElem,
    RestoreArgs, Result, SaveArgs, StorageDriver, Tensor, Tree,
};

use crate::codec::{resolve_geometry, restore_leaf, save_leaf};
use crate::metadata::{read_tree_metadata, write_tree_metadata, TreeMetadata};

/// Finalize marker written last; its presence signals a complete checkpoint
pub const COMMIT_MARKER_FILE: &str = "commit_success.txt";

/// Per-leaf write progress of the most recent save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Save/restore entry point for trees of array leaves
pub struct CheckpointHandler {
    options: HandlerOptions,

    /// Cross-participant synchronization, injected
    barrier: Arc<dyn Barrier>,

    /// Leaf write statuses of the save in progress (or last finished)
    writes: Arc<RwLock<HashMap<String, WriteStatus>>>,
}

impl CheckpointHandler {
    /// Handler for single-participant saves
    pub fn new(options: HandlerOptions) -> Self {
        Self::with_barrier(options, Arc::new(NoopBarrier))
    }

    /// Handler synchronizing multi-participant saves on `barrier`
    pub fn with_barrier(options: HandlerOptions, barrier: Arc<dyn Barrier>) -> Self {
        Self {
            options,
            barrier,
            writes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    /// Leaf write statuses, keyed by storage key
    pub fn write_statuses(&self) -> HashMap<String, WriteStatus> {
        self.writes.read().clone()
    }

    /// Save a tree as the only participant
    pub async fn save(&self, directory: &Path, tree: &Tree) -> Result<()> {
        self.save_with_args(directory, tree, &SaveArgs::default(), Participant::solo())
            .await
    }

    /// Save this participant's share of a tree
    ///
    /// Every participant calls this with the identical tree and args; leaf
    /// ownership is split round-robin over the deterministic walk order, so
    /// no two participants write the same leaf. Geometry and sharding are
    /// validated for all owned leaves before any filesystem side effect.
    #[instrument(skip(self, tree, args), fields(rank = participant.rank, count = participant.count))]
    pub async fn save_with_args(
        &self,
        directory: &Path,
        tree: &Tree,
        args: &SaveArgs,
        participant: Participant,
    ) -> Result<()> {
        participant.validate()?;

        let leaves = collect_leaves(tree)?;
        let owned: Vec<(String, Tensor)> = leaves
            .iter()
            .enumerate()
            .filter(|(i, _)| participant.owns_leaf(*i))
            .map(|(_, (key, tensor))| (key.clone(), (*tensor).clone()))
            .collect();

        // eager validation: a config error must precede any write
        for (key, tensor) in &owned {
            if let Some(sharding) = tensor.sharding() {
                sharding.validate_for_leaf(tensor.shape(), key)?;
            }
            resolve_geometry(
                key,
                tensor,
                args.per_leaf_geometry.get(key),
                self.options.driver,
            )?;
        }

        info!(
            path = %directory.display(),
            leaves = leaves.len(),
            owned = owned.len(),
            driver = %self.options.driver,
            "Starting checkpoint save"
        );

        let store = open_store(directory, self.options.driver, true).await?;

        {
            let mut writes = self.writes.write();
            writes.clear();
            for (key, _) in &owned {
                writes.insert(key.clone(), WriteStatus::Pending);
            }
        }

        self.write_owned_leaves(&store, owned, args).await?;

        if participant.is_finalizer() {
            if self.options.write_tree_metadata {
                let metadata = TreeMetadata::describe(tree, self.options.driver);
                write_tree_metadata(directory, &metadata).await?;
            }
            self.finalize(directory).await?;
        }

        let tag = format!("checkpoint_save:{}", directory.display());
        self.barrier.synchronize(&tag).await?;

        info!(path = %directory.display(), "Checkpoint save complete");
        Ok(())
    }

    /// Fan out the owned leaf writes under the concurrency limit
    async fn write_owned_leaves(
        &self,
        store: &Arc<dyn ChunkStore>,
        owned: Vec<(String, Tensor)>,
        args: &SaveArgs,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_leaves));
        let mut tasks = JoinSet::new();

        for (key, tensor) in owned {
            let store = store.clone();
            let semaphore = semaphore.clone();
            let geometry = args.per_leaf_geometry.get(&key).cloned();
            let writes = self.writes.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| Error::TaskJoin {
                    message: e.to_string(),
                })?;
                writes.write().insert(key.clone(), WriteStatus::InProgress);

                let result = save_leaf(&store, &key, &tensor, geometry.as_ref()).await;
                let status = if result.is_ok() {
                    WriteStatus::Completed
                } else {
                    WriteStatus::Failed
                };
                writes.write().insert(key.clone(), status);

                match &result {
                    Ok(()) => debug!(leaf = %key, "Leaf write completed"),
                    Err(e) => debug!(leaf = %key, error = %e, "Leaf write failed"),
                }
                result
            });
        }

        // let every leaf settle; report the first failure, no rollback
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

    /// Write the finalize marker, making the checkpoint visible as complete
    async fn finalize(&self, directory: &Path) -> Result<()> {
        let content = format!("{}\n", chrono::Utc::now().to_rfc3339());
        write_atomic(&directory.join(COMMIT_MARKER_FILE), content.as_bytes()).await?;
        debug!(path = %directory.display(), "Wrote finalize marker");
        Ok(())
    }

    /// Restore a tree with the stored shard layout
    pub async fn restore(&self, directory: &Path) -> Result<Tree> {
        self.restore_with_args(directory, &RestoreArgs::default())
            .await
    }

    /// Restore a tree, optionally overriding shard layouts per leaf
    ///
    /// With tree metadata present the restored tree reproduces container
    /// kinds, key order and sharding descriptors exactly; without it the
    /// result degrades to plain unsharded arrays under nested maps. Either
    /// way the stored per-leaf format wins over this handler's configured
    /// driver.
    #[instrument(skip(self, args))]
    pub async fn restore_with_args(&self, directory: &Path, args: &RestoreArgs) -> Result<Tree> {
        if fs::metadata(directory).await.is_err() {
            return Err(Error::StorageUnavailable {
                path: directory.display().to_string(),
                reason: "checkpoint directory does not exist".to_string(),
            });
        }
        if fs::metadata(directory.join(COMMIT_MARKER_FILE)).await.is_err() {
            return Err(Error::IncompleteCheckpoint {
                path: directory.display().to_string(),
            });
        }

        match read_tree_metadata(directory).await? {
            Some(metadata) => self.restore_typed(directory, metadata, args).await,
            None => self.restore_degraded(directory, args).await,
        }
    }

    /// Typed restore driven by the tree metadata record
    async fn restore_typed(
        &self,
        directory: &Path,
        metadata: TreeMetadata,
        args: &RestoreArgs,
    ) -> Result<Tree> {
        info!(
            path = %directory.display(),
            leaves = metadata.leaves.len(),
            "Restoring checkpoint from tree metadata"
        );

        let mut stores: HashMap<StorageDriver, Arc<dyn ChunkStore>> = HashMap::new();
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_leaves));
        let mut tasks = JoinSet::new();

        for leaf in &metadata.leaves {
            let store = match stores.get(&leaf.driver) {
                Some(store) => store.clone(),
                None => {
                    let store = open_store(directory, leaf.driver, false).await?;
                    stores.insert(leaf.driver, store.clone());
                    store
                }
            };

            let key = leaf.key.clone();
            let sharding = args
                .per_leaf_sharding
                .get(&key)
                .or(leaf.sharding.as_ref())
                .cloned();
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| Error::TaskJoin {
                    message: e.to_string(),
                })?;
                let tensor = restore_leaf(&store, &key, sharding.as_ref()).await?;
                Ok::<_, Error>((key, tensor))
            });
        }

        let mut restored = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (key, tensor) = joined.map_err(|e| Error::TaskJoin {
                message: e.to_string(),
            })??;
            restored.insert(key, tensor);
        }

        Tree::rebuild(&metadata.structure, &mut restored)
    }

    /// Degraded restore from the leaf directories alone
    async fn restore_degraded(&self, directory: &Path, args: &RestoreArgs) -> Result<Tree> {
        let keys = scan_leaf_dirs(directory).await?;
        info!(
            path = %directory.display(),
            leaves = keys.len(),
            "Restoring checkpoint without tree metadata"
        );

        let mut stores: HashMap<StorageDriver, Arc<dyn ChunkStore>> = HashMap::new();
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_leaves));
        let mut tasks = JoinSet::new();

        for key in &keys {
            let driver = detect_leaf_driver(directory, key).await?;
            let store = match stores.get(&driver) {
                Some(store) => store.clone(),
                None => {
                    let store = open_store(directory, driver, false).await?;
                    stores.insert(driver, store.clone());
                    store
                }
            };

            let key = key.clone();
            let sharding = args.per_leaf_sharding.get(&key).cloned();
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| Error::TaskJoin {
                    message: e.to_string(),
                })?;
                let tensor = restore_leaf(&store, &key, sharding.as_ref()).await?;
                Ok::<_, Error>((key, tensor))
            });
        }

        let mut restored: Vec<(String, Tensor)> = Vec::with_capacity(keys.len());
        while let Some(joined) = tasks.join_next().await {
            let pair = joined.map_err(|e| Error::TaskJoin {
                message: e.to_string(),
            })??;
            restored.push(pair);
        }
        restored.sort_by(|a, b| a.0.cmp(&b.0));

        Tree::from_flat(restored)
    }
}

/// Walk a tree into (storage key, leaf) pairs, validating keys and uniqueness
fn collect_leaves(tree: &Tree) -> Result<Vec<(String, &Tensor)>> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (path, tensor) in tree.leaves() {
        for elem in &path {
            if let PathElem::Key(key) = elem {
                validate_key(key)?;
            }
        }
        let key = storage_key(&path);
        if !seen.insert(key.clone()) {
            return Err(Error::InvalidConfig {
                message: format!("duplicate leaf path '{}'", key),
            });
        }
        out.push((key, tensor));
    }
    Ok(out)
}

/// Leaf directories under a checkpoint root, sorted by storage key
async fn scan_leaf_dirs(directory: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut entries = fs::read_dir(directory).await.map_err(|e| Error::Storage {
        message: format!("failed to list {:?}: {}", directory, e),
    })?;

    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.path().is_dir() {
            out.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    out.sort();
    Ok(out)
}
