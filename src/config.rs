use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub slot_name: String,
    /// Logical decoding output plugin the slot is created with.
    #[serde(default = "default_output_plugin")]
    pub output_plugin: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// What the stream consumer writes for each actionable change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    /// Snapshot the affected table to CSV.
    #[default]
    Table,
    /// Write the decoded message itself as a JSON artifact.
    RawPayload,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: PathBuf,
    #[serde(default)]
    pub backup_mode: BackupMode,
    /// Restrict incremental snapshots to the changed row's key.
    #[serde(default)]
    pub row_level: bool,
    #[serde(default = "default_key_column")]
    pub key_column: String,
    #[serde(default = "default_true")]
    pub handle_signals: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DumpFormat {
    #[default]
    Custom,
    Plain,
}

impl DumpFormat {
    pub fn pg_dump_flag(&self) -> &'static str {
        match self {
            DumpFormat::Custom => "c",
            DumpFormat::Plain => "p",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DumpFormat::Custom => "dump",
            DumpFormat::Plain => "sql",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_pg_dump_path")]
    pub pg_dump_path: PathBuf,
    #[serde(default = "default_pg_recvlogical_path")]
    pub pg_recvlogical_path: PathBuf,
    /// Slot drained by the periodic capture job. Defaults to `<slot_name>_capture`.
    #[serde(default)]
    pub capture_slot: Option<String>,
    #[serde(default = "default_capture_window_secs")]
    pub capture_window_secs: u64,
    #[serde(default)]
    pub dump_format: DumpFormat,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_full_backup_interval_secs")]
    pub full_backup_interval_secs: u64,
    #[serde(default = "default_schema_backup_interval_secs")]
    pub schema_backup_interval_secs: u64,
    #[serde(default = "default_cdc_capture_interval_secs")]
    pub cdc_capture_interval_secs: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_CDC_BACKUP")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.postgres.slot_name.trim().is_empty() {
            return Err(Error::Config("postgres.slot_name must not be empty".to_string()));
        }
        if self.postgres.output_plugin.trim().is_empty() {
            return Err(Error::Config("postgres.output_plugin must not be empty".to_string()));
        }
        if self.replication.batch_size == 0 {
            return Err(Error::Config("replication.batch_size must be positive".to_string()));
        }
        if self.capture_slot() == self.postgres.slot_name {
            return Err(Error::Config(
                "backup.capture_slot must differ from postgres.slot_name".to_string(),
            ));
        }

        let schedule = &self.schedule;
        for (name, secs) in [
            ("full_backup_interval_secs", schedule.full_backup_interval_secs),
            ("schema_backup_interval_secs", schedule.schema_backup_interval_secs),
            ("cdc_capture_interval_secs", schedule.cdc_capture_interval_secs),
        ] {
            if secs == 0 {
                return Err(Error::Config(format!("schedule.{} must be positive", name)));
            }
        }
        if self.backup.capture_window_secs == 0
            || self.backup.capture_window_secs >= schedule.cdc_capture_interval_secs
        {
            return Err(Error::Config(
                "backup.capture_window_secs must be positive and shorter than schedule.cdc_capture_interval_secs"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Connection settings for ordinary (non-streaming) sessions.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.postgres.host)
            .port(self.postgres.port)
            .dbname(&self.postgres.database)
            .user(&self.postgres.username)
            .password(&self.postgres.password)
            .application_name("pg-cdc-backup")
            .connect_timeout(Duration::from_secs(self.postgres.connect_timeout_secs));
        pg
    }

    pub fn capture_slot(&self) -> String {
        self.backup
            .capture_slot
            .clone()
            .unwrap_or_else(|| format!("{}_capture", self.postgres.slot_name))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.replication.poll_interval_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            checkpoint_file: default_checkpoint_file(),
            backup_mode: BackupMode::default(),
            row_level: false,
            key_column: default_key_column(),
            handle_signals: true,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: default_backup_dir(),
            pg_dump_path: default_pg_dump_path(),
            pg_recvlogical_path: default_pg_recvlogical_path(),
            capture_slot: None,
            capture_window_secs: default_capture_window_secs(),
            dump_format: DumpFormat::default(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            full_backup_interval_secs: default_full_backup_interval_secs(),
            schema_backup_interval_secs: default_schema_backup_interval_secs(),
            cdc_capture_interval_secs: default_cdc_capture_interval_secs(),
        }
    }
}

fn default_output_plugin() -> String {
    "test_decoding".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_batch_size() -> u32 {
    100
}

fn default_checkpoint_file() -> PathBuf {
    PathBuf::from("last_processed_state.json")
}

fn default_key_column() -> String {
    "id".to_string()
}

fn default_true() -> bool {
    true
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_pg_dump_path() -> PathBuf {
    PathBuf::from("pg_dump")
}

fn default_pg_recvlogical_path() -> PathBuf {
    PathBuf::from("pg_recvlogical")
}

fn default_capture_window_secs() -> u64 {
    30
}

fn default_full_backup_interval_secs() -> u64 {
    3600
}

fn default_schema_backup_interval_secs() -> u64 {
    3600
}

fn default_cdc_capture_interval_secs() -> u64 {
    300
}
