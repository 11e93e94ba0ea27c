pub mod artifact;
pub mod correlator;
pub mod dump;
pub mod incremental;
pub mod scheduler;
pub mod schema;

pub use artifact::{artifact_file_name, ArtifactKind, ArtifactStore, BackupArtifact};
pub use correlator::CdcLogCorrelator;
pub use dump::{PgTools, TableDumper};
pub use incremental::{IncrementalBackupWriter, RawChangeWriter, TableSnapshotter};
pub use scheduler::{
    run_every, BackupJobs, JobStats, PeriodicBackupScheduler, PgSlotProvisioner, SchedulerStats,
    SlotProvisioner,
};
pub use schema::{DumpReport, PgCatalog, SchemaChangeDetector, TableCatalog};
