//! End-to-end save/restore tests over a single participant

use anyhow::Result;
use rand::Rng;
use tempfile::TempDir;

use checkpoint::{CheckpointHandler, COMMIT_MARKER_FILE};
use chunk_store::{open_store, ChunkStore};
use tensor_core::{
    ChunkGeometry, Dtype, Error, HandlerOptions, RestoreArgs, SaveArgs, ShardingSpec,
    StorageDriver, Tensor, Tree,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn random_tensor(shape: &[usize]) -> Tensor {
    let mut rng = rand::thread_rng();
    let n: usize = shape.iter().product();
    let values: Vec<f32> = (0..n).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect();
    Tensor::from_vec(shape.to_vec(), values).unwrap()
}

fn placements(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("device:{}", i)).collect()
}

fn handler(driver: StorageDriver, write_tree_metadata: bool) -> CheckpointHandler {
    CheckpointHandler::new(HandlerOptions {
        driver,
        write_tree_metadata,
        ..Default::default()
    })
}

#[tokio::test]
async fn save_and_restore_single_device_sharded_array() -> Result<()> {
    init_tracing();
    for write_tree_metadata in [false, true] {
        let dir = TempDir::new()?;
        let h = handler(StorageDriver::Legacy, write_tree_metadata);

        let sharding = ShardingSpec::single_device(&[10], "device:0");
        let x = random_tensor(&[10]).with_sharding(sharding.clone())?;
        let tree = Tree::Map(vec![("array_x".to_string(), Tree::Leaf(x.clone()))]);

        h.save(dir.path(), &tree).await?;
        let restored = h.restore(dir.path()).await?;
        let restored_x = restored.leaf_at("array_x").unwrap();

        assert_eq!(restored_x.to_vec::<f32>()?, x.to_vec::<f32>()?);
        if write_tree_metadata {
            assert_eq!(restored_x.sharding(), Some(&sharding));
        } else {
            // without metadata the restore degrades to a plain array
            assert!(restored_x.sharding().is_none());
        }
    }
    Ok(())
}

#[tokio::test]
async fn save_and_restore_with_either_driver() -> Result<()> {
    for driver in [StorageDriver::Legacy, StorageDriver::ColumnarV3] {
        let dir = TempDir::new()?;
        let h = handler(driver, true);

        let x = random_tensor(&[10]);
        let tree = Tree::Map(vec![("x".to_string(), Tree::Leaf(x.clone()))]);

        h.save(dir.path(), &tree).await?;
        let restored = h.restore(dir.path()).await?;
        assert_eq!(
            restored.leaf_at("x").unwrap().to_vec::<f32>()?,
            x.to_vec::<f32>()?
        );
    }
    Ok(())
}

#[tokio::test]
async fn custom_chunk_geometry_persists_on_disk() -> Result<()> {
    let dir = TempDir::new()?;
    let h = handler(StorageDriver::ColumnarV3, false);

    let x = random_tensor(&[10]);
    let tree = Tree::Map(vec![("x".to_string(), Tree::Leaf(x.clone()))]);
    let args = SaveArgs::default().with_geometry("x", ChunkGeometry::new(vec![2], vec![1]));

    h.save_with_args(
        dir.path(),
        &tree,
        &args,
        tensor_core::Participant::solo(),
    )
    .await?;

    // validate the stored leaf declares exactly the requested chunk layout
    let store = open_store(dir.path(), StorageDriver::ColumnarV3, false).await?;
    let spec = store.leaf_spec("x").await?;
    assert_eq!(spec.write_chunk_shape, vec![2]);
    assert_eq!(spec.read_chunk_shape, vec![1]);
    assert_eq!(spec.dtype, Dtype::F32);

    // one shard file per write chunk
    for i in 0..5 {
        assert!(dir.path().join("x").join(format!("s{}", i)).exists());
    }

    let restored = h.restore(dir.path()).await?;
    assert_eq!(
        restored.leaf_at("x").unwrap().to_vec::<f32>()?,
        x.to_vec::<f32>()?
    );
    Ok(())
}

#[tokio::test]
async fn invalid_chunk_geometry_is_rejected_before_writing() -> Result<()> {
    let cases = [
        ChunkGeometry {
            write_chunk_shape: Some(vec![3]),
            read_chunk_shape: None,
        },
        ChunkGeometry {
            write_chunk_shape: None,
            read_chunk_shape: Some(vec![3]),
        },
        // not an integer multiple
        ChunkGeometry::new(vec![5], vec![2]),
    ];

    for geometry in cases {
        let dir = TempDir::new()?;
        let h = handler(StorageDriver::ColumnarV3, false);
        let tree = Tree::Map(vec![("x".to_string(), Tree::Leaf(random_tensor(&[10])))]);
        let args = SaveArgs::default().with_geometry("x", geometry);

        let result = h
            .save_with_args(dir.path(), &tree, &args, tensor_core::Participant::solo())
            .await;
        assert!(matches!(result, Err(Error::InvalidChunkGeometry { .. })));
        assert!(!dir.path().join("x").exists());
    }
    Ok(())
}

#[tokio::test]
async fn checkpoint_restores_across_driver_configurations() -> Result<()> {
    for (save_driver, restore_driver) in [
        (StorageDriver::ColumnarV3, StorageDriver::Legacy),
        (StorageDriver::Legacy, StorageDriver::ColumnarV3),
    ] {
        let dir = TempDir::new()?;
        let x = random_tensor(&[10]);
        let tree = Tree::Map(vec![("x".to_string(), Tree::Leaf(x.clone()))]);

        handler(save_driver, true).save(dir.path(), &tree).await?;

        // the stored format is self-describing; the reader's default driver
        // does not matter
        let restored = handler(restore_driver, true).restore(dir.path()).await?;
        assert_eq!(
            restored.leaf_at("x").unwrap().to_vec::<f32>()?,
            x.to_vec::<f32>()?
        );
    }
    Ok(())
}

#[tokio::test]
async fn missing_finalize_marker_fails_restore() -> Result<()> {
    let dir = TempDir::new()?;
    let h = handler(StorageDriver::Legacy, true);
    let tree = Tree::Map(vec![("x".to_string(), Tree::Leaf(random_tensor(&[4])))]);

    h.save(dir.path(), &tree).await?;
    std::fs::remove_file(dir.path().join(COMMIT_MARKER_FILE))?;

    let result = h.restore(dir.path()).await;
    assert!(matches!(result, Err(Error::IncompleteCheckpoint { .. })));
    Ok(())
}

#[tokio::test]
async fn nested_tree_structure_round_trips() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let h = handler(StorageDriver::ColumnarV3, true);

    let tree = Tree::Map(vec![
        (
            "encoder".to_string(),
            Tree::Map(vec![
                ("kernel".to_string(), Tree::Leaf(random_tensor(&[4, 3]))),
                ("bias".to_string(), Tree::Leaf(random_tensor(&[3]))),
            ]),
        ),
        (
            "layers".to_string(),
            Tree::List(vec![
                Tree::Leaf(random_tensor(&[2, 2])),
                Tree::Map(vec![("scale".to_string(), Tree::Leaf(random_tensor(&[2])))]),
            ]),
        ),
        ("step".to_string(), Tree::Leaf(random_tensor(&[]))),
    ]);

    h.save(dir.path(), &tree).await?;
    let restored = h.restore(dir.path()).await?;

    // container kinds and key order are reproduced bit-for-bit
    assert_eq!(restored.structure(), tree.structure());
    assert_eq!(restored, tree);
    Ok(())
}

#[tokio::test]
async fn degraded_restore_yields_values_without_sharding() -> Result<()> {
    let dir = TempDir::new()?;
    let h = handler(StorageDriver::ColumnarV3, false);

    let sharding = ShardingSpec::split_axis(&[8], 0, &placements(2))?;
    let w = random_tensor(&[8]).with_sharding(sharding)?;
    let tree = Tree::Map(vec![(
        "block".to_string(),
        Tree::Map(vec![
            ("w".to_string(), Tree::Leaf(w.clone())),
            ("b".to_string(), Tree::Leaf(random_tensor(&[2]))),
        ]),
    )]);

    h.save(dir.path(), &tree).await?;
    let restored = h.restore(dir.path()).await?;

    let restored_w = restored.leaf_at("block.w").unwrap();
    assert_eq!(restored_w.to_vec::<f32>()?, w.to_vec::<f32>()?);
    assert!(restored_w.sharding().is_none());
    Ok(())
}

#[tokio::test]
async fn restore_applies_requested_sharding() -> Result<()> {
    let dir = TempDir::new()?;
    let h = handler(StorageDriver::ColumnarV3, true);

    let x = random_tensor(&[12]);
    let tree = Tree::Map(vec![("x".to_string(), Tree::Leaf(x.clone()))]);
    h.save(dir.path(), &tree).await?;

    // request a different shard layout than the (absent) stored one
    let target = ShardingSpec::split_axis(&[12], 0, &placements(3))?;
    let args = RestoreArgs::default().with_sharding("x", target.clone());
    let restored = h.restore_with_args(dir.path(), &args).await?;

    let restored_x = restored.leaf_at("x").unwrap();
    assert_eq!(restored_x.sharding(), Some(&target));
    assert_eq!(restored_x.to_vec::<f32>()?, x.to_vec::<f32>()?);
    Ok(())
}

#[tokio::test]
async fn sharded_matrix_with_custom_geometry_round_trips() -> Result<()> {
    let dir = TempDir::new()?;
    let h = handler(StorageDriver::ColumnarV3, true);

    let sharding = ShardingSpec::split_axis(&[8, 6], 0, &placements(4))?;
    let m = random_tensor(&[8, 6]).with_sharding(sharding.clone())?;
    let tree = Tree::Map(vec![("m".to_string(), Tree::Leaf(m.clone()))]);
    let args = SaveArgs::default().with_geometry("m", ChunkGeometry::new(vec![2, 6], vec![1, 3]));

    h.save_with_args(dir.path(), &tree, &args, tensor_core::Participant::solo())
        .await?;
    let restored = h.restore(dir.path()).await?;

    let restored_m = restored.leaf_at("m").unwrap();
    assert_eq!(restored_m.sharding(), Some(&sharding));
    assert_eq!(restored_m.to_vec::<f32>()?, m.to_vec::<f32>()?);
    Ok(())
}

#[tokio::test]
async fn unrelated_leaves_share_one_directory() -> Result<()> {
    let dir = TempDir::new()?;

    // two saves into sibling directories under one root work independently;
    // a second create-open of the same directory must not clobber leaves
    let store = open_store(dir.path(), StorageDriver::Legacy, true).await?;
    let t = random_tensor(&[4]);
    checkpoint::save_leaf(&store, "a", &t, None).await?;

    let reopened = open_store(dir.path(), StorageDriver::ColumnarV3, true).await?;
    checkpoint::save_leaf(&reopened, "b", &t, None).await?;

    assert!(store.leaf_exists("a").await?);
    assert!(reopened.leaf_exists("b").await?);
    Ok(())
}
