//! Multi-participant saves coordinated through the barrier

use anyhow::Result;
use std::sync::Arc;
use tempfile::TempDir;

use checkpoint::{CheckpointHandler, WriteStatus, COMMIT_MARKER_FILE};
use tensor_core::{
    Error, HandlerOptions, LocalBarrier, NoopBarrier, Participant, SaveArgs, StorageDriver,
    Tensor, Tree,
};

fn tensor(seed: i64, n: usize) -> Tensor {
    Tensor::from_vec(vec![n], (0..n as i64).map(|i| i + seed).collect()).unwrap()
}

fn four_leaf_tree() -> Tree {
    Tree::Map(vec![
        ("a".to_string(), Tree::Leaf(tensor(0, 4))),
        ("b".to_string(), Tree::Leaf(tensor(100, 6))),
        ("c".to_string(), Tree::Leaf(tensor(200, 3))),
        ("d".to_string(), Tree::Leaf(tensor(300, 5))),
    ])
}

#[tokio::test]
async fn two_participants_write_disjoint_leaves() -> Result<()> {
    let dir = TempDir::new()?;
    let barrier = Arc::new(LocalBarrier::new(2));
    let tree = four_leaf_tree();

    let mut handles = Vec::new();
    for rank in 0..2 {
        let barrier = barrier.clone();
        let tree = tree.clone();
        let path = dir.path().to_path_buf();

        handles.push(tokio::spawn(async move {
            let handler = CheckpointHandler::with_barrier(
                HandlerOptions {
                    driver: StorageDriver::ColumnarV3,
                    ..Default::default()
                },
                barrier,
            );
            let participant = Participant { rank, count: 2 };
            handler
                .save_with_args(&path, &tree, &SaveArgs::default(), participant)
                .await?;

            // each participant wrote exactly its owned leaves
            let statuses = handler.write_statuses();
            Ok::<_, Error>(statuses)
        }));
    }

    let statuses_0 = handles.remove(0).await.unwrap()?;
    let statuses_1 = handles.remove(0).await.unwrap()?;

    let mut keys_0: Vec<_> = statuses_0.keys().cloned().collect();
    let mut keys_1: Vec<_> = statuses_1.keys().cloned().collect();
    keys_0.sort();
    keys_1.sort();
    assert_eq!(keys_0, vec!["a", "c"]);
    assert_eq!(keys_1, vec!["b", "d"]);
    assert!(statuses_0.values().all(|s| *s == WriteStatus::Completed));
    assert!(statuses_1.values().all(|s| *s == WriteStatus::Completed));

    // single finalize marker, full tree restorable
    assert!(dir.path().join(COMMIT_MARKER_FILE).exists());
    let reader = CheckpointHandler::new(HandlerOptions::default());
    let restored = reader.restore(dir.path()).await?;
    assert_eq!(restored, tree);
    Ok(())
}

#[tokio::test]
async fn non_finalizing_participant_leaves_checkpoint_incomplete() -> Result<()> {
    let dir = TempDir::new()?;

    // rank 1 alone writes its leaves but never the marker
    let handler = CheckpointHandler::with_barrier(
        HandlerOptions::default(),
        Arc::new(NoopBarrier),
    );
    let participant = Participant { rank: 1, count: 2 };
    handler
        .save_with_args(dir.path(), &four_leaf_tree(), &SaveArgs::default(), participant)
        .await?;

    assert!(!dir.path().join(COMMIT_MARKER_FILE).exists());

    let result = handler.restore(dir.path()).await;
    assert!(matches!(result, Err(Error::IncompleteCheckpoint { .. })));
    Ok(())
}

#[tokio::test]
async fn concurrent_saves_to_distinct_directories() -> Result<()> {
    // independent solo saves running in parallel share nothing
    let dirs: Vec<TempDir> = (0..4).map(|_| TempDir::new().unwrap()).collect();
    let tree = four_leaf_tree();

    let mut handles = Vec::new();
    for dir in &dirs {
        let tree = tree.clone();
        let path = dir.path().to_path_buf();
        handles.push(tokio::spawn(async move {
            let handler = CheckpointHandler::new(HandlerOptions::default());
            handler.save(&path, &tree).await?;
            handler.restore(&path).await
        }));
    }

    for handle in handles {
        let restored = handle.await.unwrap()?;
        assert_eq!(restored, tree);
    }
    Ok(())
}
