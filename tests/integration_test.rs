//! Tests against a live PostgreSQL with `wal_level = logical`.
//!
//! Configure with `TEST_PG_HOST`, `TEST_PG_PORT`, `TEST_PG_DATABASE`,
//! `TEST_PG_USERNAME` and `TEST_PG_PASSWORD`.

mod common;

use pg_cdc_backup::backup::{ArtifactStore, IncrementalBackupWriter, PgCatalog, TableCatalog, TableSnapshotter};
use pg_cdc_backup::checkpoint::StateStore;
use pg_cdc_backup::postgres::{connect, ReplicationConnection, ReplicationSlotManager, SlotStatus, TableRef};
use pg_cdc_backup::stream::{ConsumerState, ShutdownSignal, StreamConsumer};
use pg_cdc_backup::Config;
use std::time::Duration;
use tempfile::TempDir;
use tokio_postgres::Client;
use tracing::info;

#[tokio::test]
#[ignore] // Run with: cargo test --ignored integration_test::test_ensure_slot_is_idempotent
async fn test_ensure_slot_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let config = common::get_test_config(temp_dir.path());
    let client = connect(&config.pg_config(), "test").await.unwrap();
    let slot = format!("{}_idem", config.postgres.slot_name);

    let manager = ReplicationSlotManager::new(&client);
    let first = manager.ensure(&slot, "test_decoding").await.unwrap();
    let second = manager.ensure(&slot, "test_decoding").await.unwrap();

    assert!(matches!(first, SlotStatus::Created { .. }));
    assert_eq!(second, SlotStatus::AlreadyExists);

    let info = manager.verify(&slot, "test_decoding").await.unwrap();
    assert_eq!(info.plugin.as_deref(), Some("test_decoding"));
    assert!(manager.verify(&slot, "pgoutput").await.is_err());

    manager.drop_slot(&slot).await.unwrap();
    manager.drop_slot(&slot).await.unwrap();
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored integration_test::test_stream_backs_up_changed_table
async fn test_stream_backs_up_changed_table() {
    tracing_subscriber::fmt()
        .with_env_filter("pg_cdc_backup=debug")
        .try_init()
        .ok();

    let temp_dir = TempDir::new().unwrap();
    let config = common::get_test_config(temp_dir.path());
    let client = setup_test_database(&config, "cdc_stream_test").await;

    let source = ReplicationConnection::new(
        &config.pg_config(),
        config.postgres.slot_name.clone(),
        config.postgres.output_plugin.clone(),
        config.replication.batch_size,
        config.poll_interval(),
    )
    .await
    .unwrap();
    let writer = IncrementalBackupWriter::new(
        config.pg_config(),
        ArtifactStore::new(&config.backup.directory),
    );
    let shutdown = ShutdownSignal::new();
    let mut consumer = StreamConsumer::new(
        source,
        writer,
        StateStore::new(&config.replication.checkpoint_file),
        shutdown.clone(),
    );

    let handle = tokio::spawn(async move {
        let result = consumer.run().await;
        (result, consumer.state())
    });

    // Give the consumer time to create the slot
    tokio::time::sleep(Duration::from_secs(2)).await;

    client
        .batch_execute(
            "INSERT INTO cdc_stream_test (name, age) VALUES ('Alice', 30);
             UPDATE cdc_stream_test SET age = 31 WHERE name = 'Alice';",
        )
        .await
        .unwrap();

    let mut artifacts = Vec::new();
    for _ in 0..50 {
        artifacts = common::artifacts_with_prefix(&config.backup.directory, "cdc_stream_test_backup_");
        if artifacts.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    info!("Artifacts: {:?}", artifacts);
    assert!(artifacts.len() >= 2, "expected one snapshot per change");

    let latest = std::fs::read_to_string(config.backup.directory.join(artifacts.last().unwrap())).unwrap();
    let mut lines = latest.lines();
    assert_eq!(lines.next(), Some("id,name,age"));
    assert!(latest.contains("Alice,31"));

    shutdown.request();
    let (result, state) = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    let stats = result.unwrap();
    assert!(stats.backups_ok >= 2);
    assert_eq!(stats.acknowledged, stats.messages);
    assert_eq!(state, ConsumerState::Closed);

    let checkpoint = StateStore::new(&config.replication.checkpoint_file).load().await;
    assert!(checkpoint.is_some());

    cleanup_test_database(&client, &config, "cdc_stream_test").await;
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored integration_test::test_row_level_snapshot
async fn test_row_level_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let config = common::get_test_config(temp_dir.path());
    let client = setup_test_database(&config, "cdc_row_test").await;

    client
        .batch_execute(
            "INSERT INTO cdc_row_test (name, age) VALUES ('Alice', 30), ('Bob', 40), ('Carol', 50)",
        )
        .await
        .unwrap();

    let writer = IncrementalBackupWriter::new(
        config.pg_config(),
        ArtifactStore::new(&config.backup.directory),
    );
    let table = TableRef::qualified("public", "cdc_row_test");

    let keys = vec!["2".to_string()];
    let filtered = writer.snapshot_table(&table, Some(&keys)).await.unwrap();
    let contents = std::fs::read_to_string(&filtered.path).unwrap();
    assert_eq!(contents.lines().count(), 2);
    assert!(contents.contains("Bob,40"));

    let full = writer.snapshot_table(&table, None).await.unwrap();
    let contents = std::fs::read_to_string(&full.path).unwrap();
    assert_eq!(contents.lines().count(), 4);
    assert_ne!(filtered.path, full.path);

    cleanup_test_database(&client, &config, "cdc_row_test").await;
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored integration_test::test_catalog_lists_public_tables
async fn test_catalog_lists_public_tables() {
    let temp_dir = TempDir::new().unwrap();
    let config = common::get_test_config(temp_dir.path());
    let client = setup_test_database(&config, "cdc_catalog_test").await;

    let tables = PgCatalog::new(config.pg_config()).list_tables().await.unwrap();
    assert!(tables.contains(&TableRef::qualified("public", "cdc_catalog_test")));

    cleanup_test_database(&client, &config, "cdc_catalog_test").await;
}

async fn setup_test_database(config: &Config, table: &str) -> Client {
    let client = connect(&config.pg_config(), "test setup").await.unwrap();

    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS {table} CASCADE;
             CREATE TABLE {table} (id SERIAL PRIMARY KEY, name TEXT NOT NULL, age INT)"
        ))
        .await
        .unwrap();

    client
}

async fn cleanup_test_database(client: &Client, config: &Config, table: &str) {
    client
        .batch_execute(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
        .await
        .ok();
    ReplicationSlotManager::new(client)
        .drop_slot(&config.postgres.slot_name)
        .await
        .ok();
}
