//! Backup artifact naming and write-once file reservation.
//!
//! Every artifact name embeds its kind, the table (when there is one) and a
//! second-resolution timestamp. Paths are claimed with an exclusive create,
//! so two artifacts that land in the same second get `_1`, `_2`, ... suffixes
//! instead of overwriting each other.

use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tracing::{debug, warn};

use crate::postgres::TableRef;
use crate::Result;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const MAX_SEQUENCE: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Whole-database dump
    Full,
    /// Per-table schema and data dump
    Schema,
    /// Per-table CSV snapshot triggered by a streamed change
    Incremental,
    /// Raw output of a change capture window
    CdcRaw,
    /// Per-table dump of a table seen in a capture window
    CdcTable,
    /// A single decoded change written as JSON
    ChangePayload,
}

impl ArtifactKind {
    fn stem(&self, table: Option<&str>) -> String {
        match (self, table) {
            (ArtifactKind::Full, _) => "full_backup".to_string(),
            (ArtifactKind::CdcRaw, _) => "cdc_changes".to_string(),
            (ArtifactKind::ChangePayload, _) => "cdc_backup".to_string(),
            (ArtifactKind::Schema, Some(table)) => format!("{}_schema_backup", table),
            (ArtifactKind::Schema, None) => "schema_backup".to_string(),
            (ArtifactKind::Incremental, Some(table)) => format!("{}_backup", table),
            (ArtifactKind::Incremental, None) => "backup".to_string(),
            (ArtifactKind::CdcTable, Some(table)) => format!("{}_cdc_backup", table),
            (ArtifactKind::CdcTable, None) => "cdc_backup".to_string(),
        }
    }
}

/// A file written once by one backup operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub table: Option<TableRef>,
    pub kind: ArtifactKind,
    pub timestamp: DateTime<Utc>,
    pub path: PathBuf,
}

/// File name for an artifact. `sequence` 0 means no suffix.
pub fn artifact_file_name(
    kind: ArtifactKind,
    table: Option<&TableRef>,
    timestamp: DateTime<Utc>,
    extension: &str,
    sequence: u32,
) -> String {
    let table = table.map(|t| sanitize(&table_component(t)));
    let stem = kind.stem(table.as_deref());
    let stamp = timestamp.format(TIMESTAMP_FORMAT);
    if sequence == 0 {
        format!("{}_{}.{}", stem, stamp, extension)
    } else {
        format!("{}_{}_{}.{}", stem, stamp, sequence, extension)
    }
}

/// Tables in `public` are named bare; other schemas stay as a prefix.
fn table_component(table: &TableRef) -> String {
    match table.schema.as_deref() {
        Some(schema) if schema != "public" => format!("{}.{}", schema, table.name),
        _ => table.name.clone(),
    }
}

/// Keeps table names usable as file name components.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The backup directory, and the only place artifact paths are handed out.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    directory: PathBuf,
}

impl ArtifactStore {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.directory).await?;
        Ok(())
    }

    /// Claims a fresh path for an artifact and returns it with the open,
    /// empty file.
    pub async fn reserve(
        &self,
        kind: ArtifactKind,
        table: Option<&TableRef>,
        extension: &str,
    ) -> Result<(BackupArtifact, File)> {
        self.reserve_at(kind, table, extension, Utc::now()).await
    }

    pub async fn reserve_at(
        &self,
        kind: ArtifactKind,
        table: Option<&TableRef>,
        extension: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(BackupArtifact, File)> {
        self.ensure_dir().await?;

        let mut sequence = 0;
        loop {
            let name = artifact_file_name(kind, table, timestamp, extension, sequence);
            let path = self.directory.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => {
                    debug!(path = ?path, "Reserved backup artifact");
                    let artifact = BackupArtifact {
                        table: table.cloned(),
                        kind,
                        timestamp,
                        path,
                    };
                    return Ok((artifact, file));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists && sequence < MAX_SEQUENCE => {
                    sequence += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Removes a reserved artifact whose write failed.
    pub async fn discard(&self, artifact: &BackupArtifact) {
        if let Err(e) = fs::remove_file(&artifact.path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = ?artifact.path, "Could not remove incomplete artifact: {}", e);
            }
        }
    }
}
