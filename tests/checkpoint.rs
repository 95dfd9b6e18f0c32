// tests/checkpoint.rs

mod common;
use crate::common::builders::diamond;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tempfile::tempdir;

use conductor::checkpoint::{
    Checkpoint, CheckpointManager, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
};
use conductor::dag::resolver;
use conductor::errors::PersistenceError;
use conductor::fs::mock::MockFileSystem;
use conductor::fs::FileSystem;
use conductor::state::StateStore;
use conductor::types::RunPhase;

fn checkpoint(thread: &str, sequence: u64) -> Checkpoint {
    let graph = resolver::build(diamond(), None).unwrap();
    let store = StateStore::new();
    store.increment("seq", sequence as i64);
    let state = store.snapshot();
    Checkpoint {
        thread_id: thread.to_string(),
        sequence,
        state_sequence: state.sequence(),
        phase: RunPhase::Running,
        description: "build the thing".into(),
        context: json!({"repo": "demo"}),
        synthesis: None,
        nodes: graph.nodes().cloned().collect(),
        state,
        created_at: Utc::now(),
    }
}

#[test]
fn file_store_round_trips_the_latest_checkpoint() {
    let dir = tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path());

    store.save(&checkpoint("run-1", 1)).unwrap();
    store.save(&checkpoint("run-1", 2)).unwrap();
    store.save(&checkpoint("run-2", 1)).unwrap();

    let latest = store.load_latest("run-1").unwrap().unwrap();
    assert_eq!(latest.sequence, 2);
    assert_eq!(latest.state.counter("seq"), 2);
    assert_eq!(latest.context, json!({"repo": "demo"}));
    assert_eq!(latest.nodes.len(), 4);
    assert!(latest.graph().is_ok());

    assert_eq!(store.threads().unwrap(), vec!["run-1".to_string(), "run-2".to_string()]);
    assert!(store.load_latest("nobody").unwrap().is_none());
}

#[test]
fn file_store_skips_a_corrupt_latest_record() {
    let dir = tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path());
    store.save(&checkpoint("run-1", 1)).unwrap();
    store.save(&checkpoint("run-1", 2)).unwrap();

    let newest = dir
        .path()
        .join("run-1")
        .join(format!("{:020}.ckpt", 2));
    let mut bytes = std::fs::read(&newest).unwrap();
    let last = bytes.len() - 2;
    bytes[last] ^= 0x20;
    std::fs::write(&newest, bytes).unwrap();

    let latest = store.load_latest("run-1").unwrap().unwrap();
    assert_eq!(latest.sequence, 1);
}

#[test]
fn file_store_prunes_the_oldest_records() {
    let dir = tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path());
    for seq in 1..=5 {
        store.save(&checkpoint("run-1", seq)).unwrap();
    }

    assert_eq!(store.prune("run-1", 2).unwrap(), 3);
    let mut left: Vec<String> = std::fs::read_dir(dir.path().join("run-1"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    left.sort();
    assert_eq!(
        left,
        vec![format!("{:020}.ckpt", 4), format!("{:020}.ckpt", 5)]
    );
    assert_eq!(store.load_latest("run-1").unwrap().unwrap().sequence, 5);
}

#[test]
fn file_store_rejects_thread_ids_that_escape_the_root() {
    let dir = tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path());
    let err = store.save(&checkpoint("../evil", 1)).unwrap_err();
    assert!(matches!(err, PersistenceError::Io(_)));
}

#[test]
fn file_store_works_over_the_mock_filesystem() {
    let fs = MockFileSystem::new();
    let store = FileCheckpointStore::with_fs("/ckpt", Arc::new(fs.clone()));

    store.save(&checkpoint("run-1", 7)).unwrap();
    assert_eq!(
        fs.paths(),
        vec![Path::new("/ckpt/run-1").join(format!("{:020}.ckpt", 7))]
    );
    assert_eq!(store.load_latest("run-1").unwrap().unwrap().sequence, 7);

    fs.set_fail_writes(true);
    assert!(matches!(
        store.save(&checkpoint("run-1", 8)),
        Err(PersistenceError::Io(_))
    ));
    // The failed save left no partial record behind.
    assert_eq!(store.load_latest("run-1").unwrap().unwrap().sequence, 7);
}

#[test]
fn garbage_files_are_ignored() {
    let fs = MockFileSystem::new();
    fs.add_file("/ckpt/run-1/notes.txt", "hello");
    fs.add_file(
        Path::new("/ckpt/run-1").join(format!("{:020}.ckpt", 3)),
        "not a checksum\n{}",
    );
    let store = FileCheckpointStore::with_fs("/ckpt", Arc::new(fs.clone()));

    assert!(store.load_latest("run-1").unwrap().is_none());
    assert!(fs.is_dir(Path::new("/ckpt/run-1")));
}

#[test]
fn manager_enforces_monotonic_sequences_and_prunes() {
    let store = InMemoryCheckpointStore::new();
    let manager = CheckpointManager::new(Arc::new(store.clone())).with_keep(2);

    manager.save(&checkpoint("run-1", 1)).unwrap();
    manager.save(&checkpoint("run-1", 2)).unwrap();
    manager.save(&checkpoint("run-1", 3)).unwrap();

    let err = manager.save(&checkpoint("run-1", 3)).unwrap_err();
    assert!(matches!(
        err,
        PersistenceError::NonMonotonic {
            last: 3,
            attempted: 3,
            ..
        }
    ));

    let kept: Vec<u64> = store.history("run-1").iter().map(|c| c.sequence).collect();
    assert_eq!(kept, vec![2, 3]);
    assert_eq!(manager.last_sequence("run-1"), Some(3));
}

#[test]
fn manager_learns_the_last_sequence_from_a_load() {
    let store = InMemoryCheckpointStore::new();
    store.insert(checkpoint("run-1", 9));
    let manager = CheckpointManager::new(Arc::new(store));

    assert_eq!(manager.last_sequence("run-1"), None);
    assert_eq!(manager.load_latest("run-1").unwrap().unwrap().sequence, 9);
    assert_eq!(manager.last_sequence("run-1"), Some(9));
    assert!(manager.save(&checkpoint("run-1", 9)).is_err());
    assert!(manager.save(&checkpoint("run-1", 10)).is_ok());
}

#[test]
fn failed_save_does_not_advance_the_sequence() {
    let store = InMemoryCheckpointStore::new();
    let manager = CheckpointManager::new(Arc::new(store.clone()));
    manager.save(&checkpoint("run-1", 1)).unwrap();

    store.set_fail_saves(true);
    assert!(manager.save(&checkpoint("run-1", 2)).is_err());
    assert_eq!(manager.last_sequence("run-1"), Some(1));

    store.set_fail_saves(false);
    manager.save(&checkpoint("run-1", 2)).unwrap();
    assert_eq!(manager.last_sequence("run-1"), Some(2));
}
