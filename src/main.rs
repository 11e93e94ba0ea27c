use clap::Parser;
use pg_cdc_backup::backup::{ArtifactStore, IncrementalBackupWriter, PeriodicBackupScheduler, RawChangeWriter};
use pg_cdc_backup::checkpoint::StateStore;
use pg_cdc_backup::config::BackupMode;
use pg_cdc_backup::postgres::ReplicationConnection;
use pg_cdc_backup::stream::{install_signal_handlers, ShutdownSignal, StreamConsumer};
use pg_cdc_backup::{Config, Result};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-cdc-backup")]
#[command(about = "PostgreSQL change-driven incremental backups", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Do not run the periodic full, schema and CDC backup jobs")]
    no_scheduler: bool,

    #[arg(long, help = "Do not consume the replication stream")]
    no_stream: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-cdc-backup");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        slot_name = %config.postgres.slot_name,
        output_plugin = %config.postgres.output_plugin,
        backup_dir = ?config.backup.directory,
        backup_mode = ?config.replication.backup_mode,
        "Configuration summary"
    );

    let shutdown = ShutdownSignal::new();
    let signal_task = if config.replication.handle_signals {
        Some(install_signal_handlers(shutdown.clone())?)
    } else {
        info!("Signal handling disabled");
        None
    };

    let scheduler = if config.schedule.enabled && !args.no_scheduler {
        let scheduler = PeriodicBackupScheduler::from_config(&config, shutdown.clone());
        Some(tokio::spawn(scheduler.run()))
    } else {
        None
    };

    let result = if args.no_stream {
        shutdown.wait().await;
        Ok(())
    } else {
        run_stream(&config, shutdown.clone()).await
    };

    shutdown.request();

    if let Some(scheduler) = scheduler {
        match scheduler.await {
            Ok(stats) => info!(?stats, "Scheduler finished"),
            Err(e) => error!("Scheduler task failed: {}", e),
        }
    }
    if let Some(task) = signal_task {
        task.abort();
    }

    if let Err(e) = &result {
        error!("Stopped with error: {}", e);
    }
    info!("pg-cdc-backup stopped");
    result
}

async fn run_stream(config: &Config, shutdown: ShutdownSignal) -> Result<()> {
    let store = ArtifactStore::new(&config.backup.directory);
    store.ensure_dir().await?;

    let source = ReplicationConnection::new(
        &config.pg_config(),
        config.postgres.slot_name.clone(),
        config.postgres.output_plugin.clone(),
        config.replication.batch_size,
        config.poll_interval(),
    )
    .await?;

    let writer = IncrementalBackupWriter::new(config.pg_config(), store.clone())
        .with_key_column(config.replication.key_column.clone());
    let state_store = StateStore::new(&config.replication.checkpoint_file);

    let mut consumer = StreamConsumer::new(source, writer, state_store, shutdown);
    if config.replication.row_level {
        consumer = consumer.with_row_level(config.replication.key_column.clone());
    }
    if config.replication.backup_mode == BackupMode::RawPayload {
        consumer = consumer.with_raw_payload(RawChangeWriter::new(store));
    }

    let stats = consumer.run().await?;
    info!(
        messages = stats.messages,
        events = stats.events,
        backups_ok = stats.backups_ok,
        backups_failed = stats.backups_failed,
        cancelled = stats.cancelled,
        "Replication stream finished"
    );
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_cdc_backup=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_cdc_backup=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
