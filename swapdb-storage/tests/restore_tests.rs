//! Restore: epoch rotation, rollback and the guard around it

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use swapdb_core::{Config, Error, ForkStrategy, Partition};
use swapdb_storage::engine::{Engine, EngineOptions, WriteOptions};
use swapdb_storage::{EngineHandle, ForkController, SwapStore};
use tempfile::TempDir;

fn config(base: &Path) -> Config {
    let mut config = Config::default();
    config.engine.base_dir = base.to_path_buf();
    config.engine.persistence_enabled = true;
    config.engine.background_workers = 2;
    config
}

/// A complete engine directory holding `key -> value` in the data partition
fn build_source(dir: &Path, key: &str, value: &str) -> PathBuf {
    let engine = Engine::open(dir, &EngineOptions::default()).unwrap();
    engine
        .put(
            Partition::Data,
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
            &WriteOptions::default(),
        )
        .unwrap();
    engine.close().unwrap();
    dir.to_path_buf()
}

fn corrupt_source(dir: &Path) -> PathBuf {
    std::fs::create_dir_all(dir.join("data")).unwrap();
    std::fs::write(dir.join("data").join("MANIFEST"), b"{not json").unwrap();
    dir.to_path_buf()
}

#[test]
fn test_restore_rotates_epoch() {
    let base = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let mut store = SwapStore::open(config(base.path())).unwrap();
    store.put(Partition::Data, "before", "0").unwrap();
    assert_eq!(store.epoch(), 0);

    let source = build_source(&staging.path().join("incoming"), "restored", "1");
    store.restore(&source).unwrap();

    assert_eq!(store.epoch(), 1);
    assert!(!source.exists());
    assert_eq!(store.get(Partition::Data, b"restored").unwrap(), Some(Bytes::from("1")));
    assert_eq!(store.get(Partition::Data, b"before").unwrap(), None);

    assert!(store.wait_for_tasks(Duration::from_secs(5)));
    assert!(!base.path().join("0").exists());
    assert!(base.path().join("1").exists());
    assert_eq!(store.metrics().snapshot().restores, 1);
}

#[test]
fn test_epoch_advances_once_per_restore() {
    let base = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let mut store = SwapStore::open(config(base.path())).unwrap();

    for n in 1..=3u32 {
        let source = build_source(&staging.path().join(format!("src{}", n)), "n", &n.to_string());
        store.restore(&source).unwrap();
        assert_eq!(store.epoch(), n);
    }
    assert!(store.wait_for_tasks(Duration::from_secs(5)));
    for old in 0..3 {
        assert!(!base.path().join(old.to_string()).exists());
    }
    assert_eq!(store.get(Partition::Data, b"n").unwrap(), Some(Bytes::from("3")));
}

#[test]
fn test_failed_reopen_rolls_back() {
    let base = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let mut store = SwapStore::open(config(base.path())).unwrap();
    store.put(Partition::Meta, "kept", "yes").unwrap();

    let source = corrupt_source(&staging.path().join("bad"));
    let err = store.restore(&source).unwrap_err();
    assert!(matches!(err, Error::ReopenFailed { epoch: 1, .. }));

    assert_eq!(store.epoch(), 0);
    assert!(!base.path().join("1").exists());
    assert_eq!(store.get(Partition::Meta, b"kept").unwrap(), Some(Bytes::from("yes")));
    store.put(Partition::Meta, "after", "ok").unwrap();
    assert_eq!(store.metrics().snapshot().restore_failures, 1);

    // The epoch name is free again
    let good = build_source(&staging.path().join("good"), "k", "v");
    store.restore(&good).unwrap();
    assert_eq!(store.epoch(), 1);
}

#[test]
fn test_corrupt_segment_count_rolls_back() {
    let base = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let mut store = SwapStore::open(config(base.path())).unwrap();
    store.put(Partition::Data, "kept", "yes").unwrap();

    let source = build_source(&staging.path().join("incoming"), "k", "v");
    let segment = std::fs::read_dir(source.join("data"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_some_and(|ext| ext == "seg"))
        .unwrap();
    let mut raw = std::fs::read(&segment).unwrap();
    let count_at = raw.len() - 20;
    raw[count_at..count_at + 8].copy_from_slice(&u64::MAX.to_le_bytes());
    std::fs::write(&segment, &raw).unwrap();

    let err = store.restore(&source).unwrap_err();
    assert!(matches!(err, Error::ReopenFailed { epoch: 1, .. }));
    assert_eq!(store.epoch(), 0);
    assert_eq!(store.get(Partition::Data, b"kept").unwrap(), Some(Bytes::from("yes")));
}

#[cfg(unix)]
#[test]
fn test_rollback_with_live_forked_child() {
    let base = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let mut store = SwapStore::open(config(base.path())).unwrap();
    store.put(Partition::Data, "kept", "yes").unwrap();

    // A persistence child inherits every descriptor, the epoch's LOCK included
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        thread::sleep(Duration::from_secs(2));
        unsafe { libc::_exit(0) };
    }

    let source = corrupt_source(&staging.path().join("bad"));
    let err = store.restore(&source).unwrap_err();
    assert!(matches!(err, Error::ReopenFailed { epoch: 1, .. }));
    assert_eq!(store.epoch(), 0);
    assert_eq!(store.get(Partition::Data, b"kept").unwrap(), Some(Bytes::from("yes")));

    let mut status = 0;
    assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
}

#[test]
fn test_rename_failure_changes_nothing() {
    let base = TempDir::new().unwrap();
    let mut store = SwapStore::open(config(base.path())).unwrap();
    store.put(Partition::Data, "k", "v").unwrap();

    let err = store.restore(&base.path().join("does-not-exist")).unwrap_err();
    assert!(matches!(err, Error::RenameFailed { .. }));
    assert_eq!(store.epoch(), 0);
    assert_eq!(store.get(Partition::Data, b"k").unwrap(), Some(Bytes::from("v")));
}

#[test]
fn test_checkpoint_survives_rename_failure() {
    let base = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let mut store = SwapStore::open(config(base.path())).unwrap();
    store.put(Partition::Data, "k", "v").unwrap();

    let mut controller = ForkController::new(ForkStrategy::Checkpoint);
    controller.init().unwrap();
    controller.before_fork(&mut store).unwrap();
    let checkpoint = store.checkpoints().checkpoint_dir().unwrap().to_path_buf();

    let err = store.restore(&base.path().join("does-not-exist")).unwrap_err();
    assert!(matches!(err, Error::RenameFailed { .. }));
    assert_eq!(store.checkpoints().checkpoint_dir(), Some(checkpoint.as_path()));
    assert!(checkpoint.exists());

    // A restore that gets past the rename does release it
    let source = build_source(&staging.path().join("incoming"), "k", "w");
    store.restore(&source).unwrap();
    assert!(store.checkpoints().is_empty());
    assert!(!checkpoint.exists());
    controller.deinit();
}

#[test]
fn test_rollback_failure_leaves_handle_closed() {
    let base = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let mut handle = EngineHandle::open(&config(base.path()).engine).unwrap();

    // A directory where the manifest should be: close cannot save it and
    // the rollback cannot read it
    let manifest = base.path().join("0").join("data").join("MANIFEST");
    std::fs::remove_file(&manifest).unwrap();
    std::fs::create_dir(&manifest).unwrap();

    let source = corrupt_source(&staging.path().join("bad"));
    let err = handle.restore(&source).unwrap_err();
    assert!(matches!(err, Error::RollbackFailed { epoch: 0, .. }));
    assert!(!handle.is_open());
    assert!(matches!(handle.engine(), Err(Error::Closed)));
}

#[test]
fn test_startup_reopens_latest_epoch() {
    let base = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    {
        let mut store = SwapStore::open(config(base.path())).unwrap();
        let source = build_source(&staging.path().join("incoming"), "k", "v");
        store.restore(&source).unwrap();
        store.shutdown().unwrap();
    }
    std::fs::create_dir(base.path().join("tmp_123")).unwrap();

    let store = SwapStore::open(config(base.path())).unwrap();
    assert_eq!(store.epoch(), 1);
    assert_eq!(store.get(Partition::Data, b"k").unwrap(), Some(Bytes::from("v")));
    assert!(!base.path().join("tmp_123").exists());
}

#[test]
fn test_startup_without_persistence_starts_empty() {
    let base = TempDir::new().unwrap();
    let mut cfg = config(base.path());
    {
        let mut store = SwapStore::open(cfg.clone()).unwrap();
        store.put(Partition::Data, "k", "v").unwrap();
        store.shutdown().unwrap();
    }
    cfg.engine.persistence_enabled = false;
    let store = SwapStore::open(cfg).unwrap();
    assert_eq!(store.epoch(), 0);
    assert_eq!(store.get(Partition::Data, b"k").unwrap(), None);
}

#[test]
fn test_restart_without_persistence_can_restore_again() {
    let base = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let mut cfg = config(base.path());
    cfg.engine.persistence_enabled = false;
    {
        let mut store = SwapStore::open(cfg.clone()).unwrap();
        let source = build_source(&staging.path().join("a"), "k", "1");
        store.restore(&source).unwrap();
        assert_eq!(store.epoch(), 1);
        store.shutdown().unwrap();
    }

    let mut store = SwapStore::open(cfg).unwrap();
    assert_eq!(store.epoch(), 0);
    assert!(!base.path().join("1").exists());
    let source = build_source(&staging.path().join("b"), "k", "2");
    store.restore(&source).unwrap();
    assert_eq!(store.epoch(), 1);
    assert_eq!(store.get(Partition::Data, b"k").unwrap(), Some(Bytes::from("2")));
}

#[test]
fn test_readers_never_see_closed_handle_during_restore() {
    let base = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let mut store = SwapStore::open(config(base.path())).unwrap();
    let guard = Arc::clone(store.engine());

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let reader = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut reads = 0u64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let handle = guard.acquire_read();
                assert!(handle.is_open());
                handle.engine().unwrap().get(Partition::Data, b"k", handle.read_opts()).unwrap();
                reads += 1;
            }
            reads
        })
    };

    for n in 0..5 {
        let source = build_source(&staging.path().join(format!("src{}", n)), "k", "v");
        store.restore(&source).unwrap();
    }
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    assert!(reader.join().unwrap() > 0);
    assert_eq!(store.epoch(), 5);
}

#[test]
fn test_try_read_fails_while_write_held() {
    let base = TempDir::new().unwrap();
    let store = SwapStore::open(config(base.path())).unwrap();
    let write = store.engine().acquire_write();
    assert!(store.engine().try_acquire_read().is_none());
    drop(write);
    assert!(store.engine().try_acquire_read().is_some());
}
