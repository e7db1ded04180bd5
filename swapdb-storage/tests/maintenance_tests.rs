//! Cron tick: health probe, usage accounting, stats refresh and meta flush

use std::path::Path;
use std::time::Duration;

use swapdb_core::{Config, Partition};
use swapdb_storage::SwapStore;
use tempfile::TempDir;

/// Every sub-task due on every tick
fn config(base: &Path) -> Config {
    let mut config = Config::default();
    config.engine.base_dir = base.to_path_buf();
    config.engine.background_workers = 2;
    config.maintenance.hz = 10;
    config.maintenance.usage_check_period_ms = 100;
    config.maintenance.stats_refresh_period_ms = 100;
    config.maintenance.meta_flush_delete_percentage = 40;
    config.maintenance.meta_flush_delete_floor = 100;
    config
}

fn tick(store: &mut SwapStore) {
    store.cron();
    assert!(store.wait_for_tasks(Duration::from_secs(10)));
}

fn meta_active_entries(store: &SwapStore) -> u64 {
    store
        .property_sum("meta", "num-entries-active-mem-table")
        .unwrap()
}

#[test]
fn test_stats_refresh_populates_model() {
    let base = TempDir::new().unwrap();
    let mut store = SwapStore::open(config(base.path())).unwrap();
    store.put(Partition::Meta, "a", "1").unwrap();
    assert!(store.stats().is_none());

    tick(&mut store);

    let report = store.stats().unwrap();
    assert_eq!(report.epoch, 0);
    assert_eq!(report.partitions.len(), Partition::COUNT);
    let meta = report.partition(Partition::Meta).unwrap();
    assert_eq!(meta.counters.active_entries, 1);
    assert!(meta.fields.iter().any(|f| f.name == "active-entries"));
    assert!(store.info().contains("meta.memtable.active-entries:1\n"));
    assert_eq!(store.metrics().snapshot().stats_refreshes, 1);
}

#[test]
fn test_tombstone_heavy_meta_is_flushed() {
    let base = TempDir::new().unwrap();
    let mut store = SwapStore::open(config(base.path())).unwrap();
    for i in 0..200 {
        store.put(Partition::Meta, format!("k{}", i), "v").unwrap();
    }
    for i in 0..150 {
        store.delete(Partition::Meta, format!("k{}", i)).unwrap();
    }
    assert_eq!(meta_active_entries(&store), 350);

    // First tick only learns the counters
    tick(&mut store);
    assert_eq!(meta_active_entries(&store), 350);
    assert_eq!(store.metrics().snapshot().flushes_submitted, 0);

    tick(&mut store);
    assert_eq!(store.metrics().snapshot().flushes_submitted, 1);
    assert_eq!(meta_active_entries(&store), 0);
    assert_eq!(store.get(Partition::Meta, b"k199").unwrap().as_deref(), Some(&b"v"[..]));
    assert_eq!(store.get(Partition::Meta, b"k0").unwrap(), None);
}

#[test]
fn test_few_deletes_do_not_flush() {
    let base = TempDir::new().unwrap();
    let mut store = SwapStore::open(config(base.path())).unwrap();
    for i in 0..20 {
        store.put(Partition::Meta, format!("k{}", i), "v").unwrap();
        store.delete(Partition::Meta, format!("k{}", i)).unwrap();
    }

    tick(&mut store);
    tick(&mut store);
    assert_eq!(store.metrics().snapshot().flushes_submitted, 0);
    assert_eq!(meta_active_entries(&store), 40);
}

#[test]
fn test_disk_health_transitions() {
    let base = TempDir::new().unwrap();
    let mut store = SwapStore::open(config(base.path())).unwrap();
    let sentinel = base.path().join("disk_health");

    tick(&mut store);
    assert!(sentinel.is_file());
    assert!(store.info().contains("disk_error:0\n"));

    std::fs::remove_file(&sentinel).unwrap();
    std::fs::create_dir(&sentinel).unwrap();
    tick(&mut store);
    tick(&mut store);
    assert!(store.maintenance().health().disk_error());
    assert!(store.info().contains("disk_error:1\n"));
    assert_eq!(store.metrics().snapshot().disk_error_transitions, 1);

    std::fs::remove_dir(&sentinel).unwrap();
    tick(&mut store);
    assert!(!store.maintenance().health().disk_error());
    assert_eq!(store.metrics().snapshot().disk_error_transitions, 2);
}

#[test]
fn test_usage_accounting() {
    let base = TempDir::new().unwrap();
    let mut cfg = config(base.path());
    cfg.maintenance.max_db_size = 1;
    let mut store = SwapStore::open(cfg).unwrap();
    store.put(Partition::Data, "k", "v").unwrap();

    tick(&mut store);
    let used = store.maintenance().used_db_size();
    assert!(used > 0);
    assert_eq!(store.metrics().snapshot().disk_usage, used);
    // Advisory only: writes still go through
    store.put(Partition::Data, "k2", "v").unwrap();
}

#[test]
fn test_restore_drops_stale_report() {
    let base = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let mut cfg = config(base.path());
    cfg.engine.persistence_enabled = true;
    let mut store = SwapStore::open(cfg).unwrap();

    tick(&mut store);
    assert!(store.stats().is_some());

    let source = staging.path().join("incoming");
    swapdb_storage::Engine::open(&source, &Default::default())
        .unwrap()
        .close()
        .unwrap();
    store.restore(&source).unwrap();
    assert!(store.stats().is_none());

    tick(&mut store);
    assert_eq!(store.stats().unwrap().epoch, 1);
}
