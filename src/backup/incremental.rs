use async_trait::async_trait;
use chrono::Utc;
use futures::{pin_mut, StreamExt};
use postgres_protocol::escape::escape_identifier;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use super::artifact::{ArtifactKind, ArtifactStore, BackupArtifact};
use crate::postgres::{connect, ChangeEvent, TableRef, WalMessage};
use crate::Result;

/// Produces a restorable snapshot of one table.
#[async_trait]
pub trait TableSnapshotter: Send + Sync {
    /// Snapshots `table`. With `row_keys`, only rows whose key column
    /// matches one of the keys are written.
    async fn snapshot_table(
        &self,
        table: &TableRef,
        row_keys: Option<&[String]>,
    ) -> Result<BackupArtifact>;
}

/// Writes `COPY ... TO STDOUT WITH CSV HEADER` output of a table to
/// `{table}_backup_{timestamp}.csv`, over a fresh short-lived connection.
#[derive(Debug, Clone)]
pub struct IncrementalBackupWriter {
    pg: tokio_postgres::Config,
    store: ArtifactStore,
    key_column: String,
}

impl IncrementalBackupWriter {
    pub fn new(pg: tokio_postgres::Config, store: ArtifactStore) -> Self {
        Self {
            pg,
            store,
            key_column: "id".to_string(),
        }
    }

    /// Column matched against row keys in filtered snapshots.
    pub fn with_key_column(mut self, key_column: impl Into<String>) -> Self {
        self.key_column = key_column.into();
        self
    }

    async fn copy_into(
        &self,
        table: &TableRef,
        row_keys: Option<&[String]>,
        mut file: File,
    ) -> Result<u64> {
        let client = connect(&self.pg, "incremental backup").await?;

        // Table names come from the server's own relation descriptor and are
        // quoted; key values only ever travel as bound parameters.
        let statement = match row_keys {
            Some(keys) => {
                client
                    .batch_execute("CREATE TEMP TABLE pg_cdc_backup_keys (k text)")
                    .await?;
                client
                    .execute(
                        "INSERT INTO pg_cdc_backup_keys SELECT unnest($1::text[])",
                        &[&keys],
                    )
                    .await?;
                format!(
                    "COPY (SELECT t.* FROM {} t WHERE t.{}::text IN (SELECT k FROM pg_cdc_backup_keys)) TO STDOUT WITH CSV HEADER",
                    table.quoted(),
                    escape_identifier(&self.key_column)
                )
            }
            None => format!("COPY {} TO STDOUT WITH CSV HEADER", table.quoted()),
        };
        debug!(statement = %statement, "Starting table copy");

        let stream = client.copy_out(statement.as_str()).await?;
        pin_mut!(stream);

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

#[async_trait]
impl TableSnapshotter for IncrementalBackupWriter {
    async fn snapshot_table(
        &self,
        table: &TableRef,
        row_keys: Option<&[String]>,
    ) -> Result<BackupArtifact> {
        let (artifact, file) = self
            .store
            .reserve(ArtifactKind::Incremental, Some(table), "csv")
            .await?;

        match self.copy_into(table, row_keys, file).await {
            Ok(bytes) => {
                info!(
                    bytes,
                    filtered = row_keys.is_some(),
                    "Backup for table '{}' saved to {:?}",
                    table,
                    artifact.path
                );
                Ok(artifact)
            }
            Err(e) => {
                error!("Error saving backup for table '{}': {}", table, e);
                self.store.discard(&artifact).await;
                Err(e)
            }
        }
    }
}

#[derive(Serialize)]
struct ChangeRecord<'a> {
    captured_at: chrono::DateTime<Utc>,
    lsn: Option<&'a str>,
    xid: Option<u32>,
    payload: &'a str,
    change: &'a ChangeEvent,
}

/// Writes the decoded message itself, with its parsed form, as
/// `cdc_backup_{timestamp}.json`.
#[derive(Debug, Clone)]
pub struct RawChangeWriter {
    store: ArtifactStore,
}

impl RawChangeWriter {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    pub async fn write(&self, message: &WalMessage, event: &ChangeEvent) -> Result<BackupArtifact> {
        let table = event.table_ref();
        let (mut artifact, mut file) = self
            .store
            .reserve(ArtifactKind::ChangePayload, None, "json")
            .await?;
        artifact.table = table;

        let record = ChangeRecord {
            captured_at: artifact.timestamp,
            lsn: message.lsn.as_deref(),
            xid: message.xid,
            payload: &message.data,
            change: event,
        };

        let written = async {
            let json = serde_json::to_vec_pretty(&record)?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            Ok::<_, crate::Error>(())
        }
        .await;

        match written {
            Ok(()) => {
                info!("Backup saved to {:?}", artifact.path);
                Ok(artifact)
            }
            Err(e) => {
                error!("Error saving backup: {}", e);
                self.store.discard(&artifact).await;
                Err(e)
            }
        }
    }
}
