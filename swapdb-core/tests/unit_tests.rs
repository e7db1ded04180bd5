//! Unit tests for swapdb-core

use std::io::Write;

use swapdb_core::{
    config::{LogFormat, LogLevel, PartitionConfig},
    metrics::Timer,
    utils::format_bytes,
    Config, Error, ForkStrategy, Metrics, Partition,
};
use tempfile::TempDir;

mod partition_tests {
    use super::*;

    #[test]
    fn test_canonical_order() {
        let names: Vec<_> = Partition::ALL.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["data", "meta", "score"]);
        for (i, p) in Partition::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
        assert_eq!(Partition::COUNT, 3);
    }

    #[test]
    fn test_from_name_is_case_insensitive() {
        assert_eq!(Partition::from_name("META"), Some(Partition::Meta));
        assert_eq!(Partition::from_name("Score"), Some(Partition::Score));
        assert_eq!(Partition::from_name("default"), None);
        assert_eq!(Partition::from_name(""), None);
    }

    #[test]
    fn test_strategy_display() {
        assert_eq!(ForkStrategy::Snapshot.to_string(), "snapshot");
        assert_eq!(ForkStrategy::Checkpoint.to_string(), "checkpoint");
    }
}

mod config_tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(!config.engine.persistence_enabled);
        assert_eq!(config.fork.strategy, ForkStrategy::Snapshot);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("swapdb.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "engine": {{ "base_dir": "/var/lib/swap", "persistence_enabled": true }},
                "maintenance": {{ "hz": 5, "meta_flush_delete_percentage": 20 }},
                "fork": {{ "strategy": "checkpoint" }},
                "logging": {{ "level": "debug", "format": "json" }}
            }}"#
        )
        .unwrap();

        let config = Config::from_json_file(&path).unwrap();
        assert!(config.engine.persistence_enabled);
        assert_eq!(config.engine.base_dir, std::path::PathBuf::from("/var/lib/swap"));
        assert_eq!(config.maintenance.hz, 5);
        assert_eq!(config.maintenance.meta_flush_delete_percentage, 20);
        assert_eq!(config.maintenance.stats_refresh_period_ms, 5000);
        assert_eq!(config.fork.strategy, ForkStrategy::Checkpoint);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(
            config.engine.partitions.get(Partition::Data),
            &PartitionConfig::default()
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.maintenance.hz = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration { .. })));

        let mut config = Config::default();
        config.maintenance.meta_flush_delete_percentage = 101;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.partitions.get_mut(Partition::Meta).memtable_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("meta"));
    }

    #[test]
    fn test_malformed_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Config::from_json_file(&path).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");

        let err = Config::from_json_file(dir.path().join("missing.json")).unwrap_err();
        assert_eq!(err.error_code(), "IO_ERROR");
    }
}

mod metrics_tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        metrics.record_restore();
        clone.record_restore();
        clone.record_handoff_abandoned();
        metrics.update_disk(4096);

        let snap = metrics.snapshot();
        assert_eq!(snap.restores, 2);
        assert_eq!(snap.handoffs_abandoned, 1);
        assert_eq!(snap.disk_usage, 4096);
        assert_eq!(snap.checkpoints_created, 0);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new("noop");
        let elapsed = timer.stop();
        assert!(elapsed.as_secs() < 5);
    }
}

mod utils_tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(64 * 1024 * 1024), "64.0 MB");
    }
}
