use async_trait::async_trait;
use tracing::{error, info, warn};

use super::artifact::{ArtifactKind, BackupArtifact};
use super::dump::TableDumper;
use crate::postgres::{connect, TableRef};
use crate::Result;

/// Enumerates the tables a schema backup covers.
#[async_trait]
pub trait TableCatalog: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<TableRef>>;
}

/// Lists ordinary tables in the `public` schema.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pg: tokio_postgres::Config,
}

impl PgCatalog {
    pub fn new(pg: tokio_postgres::Config) -> Self {
        Self { pg }
    }
}

#[async_trait]
impl TableCatalog for PgCatalog {
    async fn list_tables(&self) -> Result<Vec<TableRef>> {
        let client = connect(&self.pg, "schema catalog").await?;
        let rows = client
            .query(
                "SELECT table_schema::text, table_name::text
                 FROM information_schema.tables
                 WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
                 ORDER BY table_name",
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| TableRef::qualified(row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }
}

/// Outcome of one pass over a set of tables.
#[derive(Debug, Default)]
pub struct DumpReport {
    pub artifacts: Vec<BackupArtifact>,
    pub failed: Vec<(TableRef, String)>,
}

impl DumpReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Dumps the schema and data of every table the catalog lists, one table at
/// a time. A failed table is logged and recorded; the rest still run.
pub struct SchemaChangeDetector<C, D> {
    catalog: C,
    dumper: D,
}

impl<C: TableCatalog, D: TableDumper> SchemaChangeDetector<C, D> {
    pub fn new(catalog: C, dumper: D) -> Self {
        Self { catalog, dumper }
    }

    pub fn dumper(&self) -> &D {
        &self.dumper
    }

    pub async fn dump_all_tables(&self) -> Result<DumpReport> {
        let tables = self.catalog.list_tables().await.map_err(|e| {
            error!("Error listing tables for schema backup: {}", e);
            e
        })?;

        if tables.is_empty() {
            warn!("No tables found for schema backup");
        }

        Ok(self.dump_tables(&tables, ArtifactKind::Schema).await)
    }

    pub async fn dump_tables(&self, tables: &[TableRef], kind: ArtifactKind) -> DumpReport {
        let mut report = DumpReport::default();

        for table in tables {
            match self.dumper.dump_table(table, kind).await {
                Ok(artifact) => report.artifacts.push(artifact),
                Err(e) => {
                    error!(table = %table, "Error backing up table '{}': {}", table, e);
                    report.failed.push((table.clone(), e.to_string()));
                }
            }
        }

        info!(
            dumped = report.artifacts.len(),
            failed = report.failed.len(),
            "Table dump pass finished"
        );
        report
    }
}
