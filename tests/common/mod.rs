#![allow(dead_code)]

use pg_cdc_backup::config::{BackupConfig, Config, PostgresConfig, ReplicationConfig, ScheduleConfig};
use std::env;
use std::path::Path;

/// Get test configuration from environment variables
pub fn get_test_config(work_dir: &Path) -> Config {
    // Use TEST_ prefix for test environment variables
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        slot_name: format!("test_slot_{}", std::process::id()),
        output_plugin: "test_decoding".to_string(),
        connect_timeout_secs: 10,
    };

    let replication = ReplicationConfig {
        poll_interval_ms: 100,
        batch_size: 50,
        checkpoint_file: work_dir.join("last_processed_state.json"),
        ..Default::default()
    };

    let backup = BackupConfig {
        directory: work_dir.join("backups"),
        capture_window_secs: 2,
        ..Default::default()
    };

    let schedule = ScheduleConfig {
        enabled: false,
        cdc_capture_interval_secs: 10,
        ..Default::default()
    };

    Config {
        postgres,
        replication,
        backup,
        schedule,
    }
}

/// File names in `dir` starting with `prefix`, sorted.
pub fn artifacts_with_prefix(dir: &Path, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter(|name| name.starts_with(prefix))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
