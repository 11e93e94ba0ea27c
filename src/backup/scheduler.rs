//! Timer-driven backup jobs that run beside the stream consumer.
//!
//! Three jobs run on independent intervals: a full database dump, a
//! per-table schema dump, and a change capture window whose affected tables
//! are then dumped. Each job carries a running flag; a tick that arrives
//! while the previous invocation is still going is skipped.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::artifact::{ArtifactKind, ArtifactStore};
use super::correlator::CdcLogCorrelator;
use super::dump::{PgTools, TableDumper};
use super::schema::{DumpReport, PgCatalog, SchemaChangeDetector, TableCatalog};
use crate::config::{Config, ScheduleConfig};
use crate::postgres::{connect, ReplicationSlotManager, SlotStatus};
use crate::stream::ShutdownSignal;
use crate::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub started: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub full: JobStats,
    pub schema: JobStats,
    pub cdc: JobStats,
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Invokes `job` every `period` until `shutdown` is requested, never running
/// two invocations at once. The first invocation happens one period after
/// start. An invocation still in flight at shutdown is awaited.
pub async fn run_every<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: ShutdownSignal,
    job: F,
) -> JobStats
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(false));
    let mut stats = JobStats::default();
    let mut in_flight: Option<JoinHandle<()>> = None;

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    info!(job = name, period = ?period, "Scheduled backup job");

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                if running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    warn!(job = name, "Previous run still in progress, skipping this tick");
                    stats.skipped += 1;
                    continue;
                }

                stats.started += 1;
                debug!(job = name, run = stats.started, "Starting scheduled job");
                let guard = RunningGuard(running.clone());
                let run = job();
                in_flight = Some(tokio::spawn(async move {
                    let _guard = guard;
                    run.await;
                }));
            }
        }
    }

    if let Some(handle) = in_flight {
        if !handle.is_finished() {
            info!(job = name, "Waiting for in-flight run to finish");
        }
        if let Err(e) = handle.await {
            error!(job = name, "Scheduled job panicked: {}", e);
        }
    }

    info!(job = name, started = stats.started, skipped = stats.skipped, "Backup job stopped");
    stats
}

/// Prepares the slot a capture window reads from.
#[async_trait]
pub trait SlotProvisioner: Send + Sync {
    async fn ensure_slot(&self, slot: &str, plugin: &str) -> Result<SlotStatus>;
}

/// Creates capture slots over a short-lived connection.
pub struct PgSlotProvisioner {
    pg: tokio_postgres::Config,
}

impl PgSlotProvisioner {
    pub fn new(pg: tokio_postgres::Config) -> Self {
        Self { pg }
    }
}

#[async_trait]
impl SlotProvisioner for PgSlotProvisioner {
    async fn ensure_slot(&self, slot: &str, plugin: &str) -> Result<SlotStatus> {
        let client = connect(&self.pg, "capture slot").await?;
        ReplicationSlotManager::new(&client).ensure(slot, plugin).await
    }
}

/// The work behind each scheduled job.
pub struct BackupJobs<C = PgCatalog, D = PgTools, P = PgSlotProvisioner> {
    tools: PgTools,
    detector: SchemaChangeDetector<C, D>,
    slots: P,
    correlator: CdcLogCorrelator,
    capture_slot: String,
    plugin: String,
    capture_window: Duration,
}

impl BackupJobs {
    pub fn from_config(config: &Config) -> Self {
        let pg = config.pg_config();
        let store = ArtifactStore::new(&config.backup.directory);
        let tools = PgTools::from_config(config, store);
        let detector = SchemaChangeDetector::new(PgCatalog::new(pg.clone()), tools.clone());

        Self::new(config, tools, detector, PgSlotProvisioner::new(pg))
    }
}

impl<C: TableCatalog, D: TableDumper, P: SlotProvisioner> BackupJobs<C, D, P> {
    pub fn new(config: &Config, tools: PgTools, detector: SchemaChangeDetector<C, D>, slots: P) -> Self {
        Self {
            tools,
            detector,
            slots,
            correlator: CdcLogCorrelator::default(),
            capture_slot: config.capture_slot(),
            plugin: config.postgres.output_plugin.clone(),
            capture_window: Duration::from_secs(config.backup.capture_window_secs),
        }
    }

    #[instrument(skip(self))]
    pub async fn full_backup(&self) -> Result<()> {
        self.tools.full_backup().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn schema_backup(&self) -> Result<()> {
        let report = self.detector.dump_all_tables().await?;
        if !report.is_complete() {
            warn!(failed = report.failed.len(), "Schema backup finished with failures");
        }
        Ok(())
    }

    /// Opens a capture window on the capture slot, then dumps every table
    /// the captured changes touched.
    #[instrument(skip(self), fields(slot = %self.capture_slot))]
    pub async fn cdc_backup(&self) -> Result<DumpReport> {
        let status = self.slots.ensure_slot(&self.capture_slot, &self.plugin).await?;
        debug!(status = ?status, "Capture slot ready");

        let capture = self
            .tools
            .capture_changes(&self.capture_slot, self.capture_window)
            .await?;

        let tables: Vec<_> = self
            .correlator
            .extract_affected_tables(&capture.path)
            .await
            .into_iter()
            .collect();

        if tables.is_empty() {
            info!("No affected tables in capture window");
            return Ok(DumpReport::default());
        }

        let report = self.detector.dump_tables(&tables, ArtifactKind::CdcTable).await;
        if !report.is_complete() {
            warn!(failed = report.failed.len(), "CDC backup finished with failures");
        }
        Ok(report)
    }
}

pub struct PeriodicBackupScheduler {
    jobs: Arc<BackupJobs>,
    schedule: ScheduleConfig,
    shutdown: ShutdownSignal,
}

impl PeriodicBackupScheduler {
    pub fn from_config(config: &Config, shutdown: ShutdownSignal) -> Self {
        Self {
            jobs: Arc::new(BackupJobs::from_config(config)),
            schedule: config.schedule.clone(),
            shutdown,
        }
    }

    /// Runs all three jobs until shutdown. Job failures are logged and never
    /// end the scheduler.
    pub async fn run(self) -> SchedulerStats {
        info!("Starting periodic backup scheduler");

        let full = {
            let jobs = self.jobs.clone();
            run_every(
                "full_backup",
                Duration::from_secs(self.schedule.full_backup_interval_secs),
                self.shutdown.clone(),
                move || {
                    let jobs = jobs.clone();
                    async move {
                        if let Err(e) = jobs.full_backup().await {
                            error!("Error performing full backup: {}", e);
                        }
                    }
                },
            )
        };

        let schema = {
            let jobs = self.jobs.clone();
            run_every(
                "schema_backup",
                Duration::from_secs(self.schedule.schema_backup_interval_secs),
                self.shutdown.clone(),
                move || {
                    let jobs = jobs.clone();
                    async move {
                        if let Err(e) = jobs.schema_backup().await {
                            error!("Error detecting or backing up schema changes: {}", e);
                        }
                    }
                },
            )
        };

        let cdc = {
            let jobs = self.jobs.clone();
            run_every(
                "cdc_backup",
                Duration::from_secs(self.schedule.cdc_capture_interval_secs),
                self.shutdown.clone(),
                move || {
                    let jobs = jobs.clone();
                    async move {
                        if let Err(e) = jobs.cdc_backup().await {
                            error!("Error capturing CDC changes: {}", e);
                        }
                    }
                },
            )
        };

        let (full, schema, cdc) = tokio::join!(full, schema, cdc);
        info!("Periodic backup scheduler stopped");
        SchedulerStats { full, schema, cdc }
    }
}
