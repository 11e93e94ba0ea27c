use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::artifact::{ArtifactKind, ArtifactStore, BackupArtifact};
use crate::config::{Config, DumpFormat};
use crate::postgres::TableRef;
use crate::{Error, Result};

/// How long an interrupted receiver gets to flush and exit before it is killed.
const RECEIVER_STOP_GRACE: Duration = Duration::from_secs(5);

/// Writes a restorable dump of a single table.
#[async_trait]
pub trait TableDumper: Send + Sync {
    async fn dump_table(&self, table: &TableRef, kind: ArtifactKind) -> Result<BackupArtifact>;
}

/// Runs `pg_dump` and `pg_recvlogical` with explicit connection arguments.
/// The password is passed through `PGPASSWORD`, never on the command line.
#[derive(Debug, Clone)]
pub struct PgTools {
    pg_dump: PathBuf,
    pg_recvlogical: PathBuf,
    host: String,
    port: u16,
    username: String,
    password: String,
    database: String,
    format: DumpFormat,
    store: ArtifactStore,
    stop_grace: Duration,
}

impl PgTools {
    pub fn from_config(config: &Config, store: ArtifactStore) -> Self {
        Self {
            pg_dump: config.backup.pg_dump_path.clone(),
            pg_recvlogical: config.backup.pg_recvlogical_path.clone(),
            host: config.postgres.host.clone(),
            port: config.postgres.port,
            username: config.postgres.username.clone(),
            password: config.postgres.password.clone(),
            database: config.postgres.database.clone(),
            format: config.backup.dump_format,
            store,
            stop_grace: RECEIVER_STOP_GRACE,
        }
    }

    fn command(&self, program: &Path) -> Command {
        let mut command = Command::new(program);
        command
            .arg("-h")
            .arg(&self.host)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-U")
            .arg(&self.username)
            .arg("-d")
            .arg(&self.database)
            .env("PGPASSWORD", &self.password)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    fn pg_dump_command(&self, output: &Path) -> Command {
        let mut command = self.command(&self.pg_dump);
        command
            .arg("-F")
            .arg(self.format.pg_dump_flag())
            .arg("-f")
            .arg(output);
        command
    }

    /// Dumps the whole database to `full_backup_{timestamp}`.
    pub async fn full_backup(&self) -> Result<BackupArtifact> {
        let (artifact, file) = self
            .store
            .reserve(ArtifactKind::Full, None, self.format.extension())
            .await?;
        drop(file);

        let command = self.pg_dump_command(&artifact.path);
        match run_to_completion(command, &self.pg_dump).await {
            Ok(()) => {
                info!("Full backup saved to {:?}", artifact.path);
                Ok(artifact)
            }
            Err(e) => {
                error!("Error performing full backup: {}", e);
                self.store.discard(&artifact).await;
                Err(e)
            }
        }
    }

    /// Streams changes from `slot` into `cdc_changes_{timestamp}.txt` for
    /// `window`, then stops the receiver. The receiver exiting with an error
    /// before the window closes fails the capture.
    pub async fn capture_changes(&self, slot: &str, window: Duration) -> Result<BackupArtifact> {
        let (artifact, file) = self.store.reserve(ArtifactKind::CdcRaw, None, "txt").await?;
        drop(file);

        let mut command = self.command(&self.pg_recvlogical);
        command
            .arg("--slot")
            .arg(slot)
            .arg("--start")
            .arg("-f")
            .arg(&artifact.path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let program = self.pg_recvlogical.display().to_string();
        let mut child = command.spawn().map_err(|e| {
            error!("Error starting {}: {}", program, e);
            e
        })?;

        match tokio::time::timeout(window, child.wait()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => {
                error!("Error capturing CDC changes: {} exited with {}", program, status);
                return Err(Error::Subprocess { program, status });
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!(window = ?window, "Capture window closed, stopping receiver");
                stop_receiver(&mut child, self.stop_grace).await?;
            }
        }

        info!("CDC changes saved to {:?}", artifact.path);
        Ok(artifact)
    }
}

#[async_trait]
impl TableDumper for PgTools {
    async fn dump_table(&self, table: &TableRef, kind: ArtifactKind) -> Result<BackupArtifact> {
        let (artifact, file) = self
            .store
            .reserve(kind, Some(table), self.format.extension())
            .await?;
        drop(file);

        let mut command = self.pg_dump_command(&artifact.path);
        command.arg("-t").arg(table.quoted());

        match run_to_completion(command, &self.pg_dump).await {
            Ok(()) => {
                info!("Backup with data for table '{}' saved to {:?}", table, artifact.path);
                Ok(artifact)
            }
            Err(e) => {
                self.store.discard(&artifact).await;
                Err(e)
            }
        }
    }
}

/// Interrupts the receiver so it writes out what it has and confirms its
/// position on the slot. A receiver still running after `grace` is killed.
async fn stop_receiver(child: &mut Child, grace: Duration) -> Result<()> {
    if interrupt(child) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                debug!(status = ?status?, "Receiver stopped");
                return Ok(());
            }
            Err(_) => warn!(grace = ?grace, "Receiver did not exit after interrupt, killing it"),
        }
    }

    child.start_kill()?;
    child.wait().await?;
    Ok(())
}

#[cfg(unix)]
fn interrupt(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGINT) {
        Ok(()) => true,
        Err(e) => {
            warn!("Error interrupting receiver: {}", e);
            false
        }
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) -> bool {
    false
}

async fn run_to_completion(mut command: Command, program: &Path) -> Result<()> {
    let output = command
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    warn!(program = ?program, stderr = %stderr.trim(), "External tool failed");
    Err(Error::Subprocess {
        program: program.display().to_string(),
        status: output.status,
    })
}
