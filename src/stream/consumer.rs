use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::shutdown::ShutdownSignal;
use crate::backup::{RawChangeWriter, TableSnapshotter};
use crate::checkpoint::{Checkpoint, StateStore};
use crate::postgres::{is_framing_message, ChangeEvent, ChangeEventParser, SlotStatus, WalMessage};
use crate::{Error, Result};

/// A decoded logical replication stream.
#[async_trait]
pub trait ChangeSource: Send {
    /// Creates the slot if needed. An existing slot is not an error.
    async fn ensure_slot(&mut self) -> Result<SlotStatus>;

    async fn start(&mut self) -> Result<()>;

    /// Next decoded message, or `None` when nothing arrived within one
    /// poll interval.
    async fn recv(&mut self) -> Result<Option<WalMessage>>;

    /// Acknowledges one delivered message.
    async fn send_feedback(&mut self, message: &WalMessage) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumerState {
    #[default]
    Init,
    SlotReady,
    Streaming,
    ShuttingDown,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub messages: u64,
    pub acknowledged: u64,
    pub framing_skipped: u64,
    pub events: u64,
    pub non_actionable: u64,
    pub backups_ok: u64,
    pub backups_failed: u64,
    pub errors: u64,
    /// The server ended the stream with an administrative cancel.
    pub cancelled: bool,
    pub final_state: ConsumerState,
}

enum Step {
    Continue,
    Stop,
}

/// Drives one replication stream from slot setup to close.
///
/// Every delivered message is acknowledged exactly once, whether or not it
/// parsed and whether or not its backup succeeded. A successful backup is
/// followed by a checkpoint write.
pub struct StreamConsumer<S, B> {
    source: S,
    snapshotter: B,
    state_store: StateStore,
    shutdown: ShutdownSignal,
    parser: ChangeEventParser,
    key_column: Option<String>,
    raw_writer: Option<RawChangeWriter>,
    error_backoff: Duration,
    state: ConsumerState,
    stats: StreamStats,
}

impl<S: ChangeSource, B: TableSnapshotter> StreamConsumer<S, B> {
    pub fn new(source: S, snapshotter: B, state_store: StateStore, shutdown: ShutdownSignal) -> Self {
        Self {
            source,
            snapshotter,
            state_store,
            shutdown,
            parser: ChangeEventParser::new(),
            key_column: None,
            raw_writer: None,
            error_backoff: Duration::from_secs(1),
            state: ConsumerState::Init,
            stats: StreamStats::default(),
        }
    }

    /// Restricts snapshots to the changed row, matched on `key_column`.
    pub fn with_row_level(mut self, key_column: impl Into<String>) -> Self {
        self.key_column = Some(key_column.into());
        self
    }

    /// Writes each change as a JSON artifact instead of snapshotting its table.
    pub fn with_raw_payload(mut self, writer: RawChangeWriter) -> Self {
        self.raw_writer = Some(writer);
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Runs until shutdown, an administrative cancel, or a connection-level
    /// failure. Only the last (and a failed slot setup) is returned as an error.
    pub async fn run(&mut self) -> Result<StreamStats> {
        if self.state != ConsumerState::Init {
            return Err(Error::Replication {
                message: format!("Stream consumer cannot run from state {:?}", self.state),
            });
        }

        let result = self.open().await;
        let result = match result {
            Ok(()) => self.stream().await,
            Err(e) => Err(e),
        };

        if let Err(e) = self.source.close().await {
            warn!("Error closing replication stream: {}", e);
        }
        self.transition(ConsumerState::Closed);
        self.stats.final_state = self.state;

        info!(
            messages = self.stats.messages,
            acknowledged = self.stats.acknowledged,
            backups_ok = self.stats.backups_ok,
            backups_failed = self.stats.backups_failed,
            "Stream consumer closed"
        );

        result.map(|()| self.stats.clone())
    }

    async fn open(&mut self) -> Result<()> {
        match self.source.ensure_slot().await {
            Ok(status) => debug!(status = ?status, "Replication slot ready"),
            Err(e) => {
                error!("Error creating replication slot: {}", e);
                return Err(e);
            }
        }
        self.transition(ConsumerState::SlotReady);

        match self.state_store.load().await {
            Some(checkpoint) => info!(
                last_processed = %checkpoint.last_processed,
                lsn = ?checkpoint.lsn,
                "Loaded last processed state"
            ),
            None => info!("No previous state found, starting fresh"),
        }

        self.source.start().await.map_err(|e| {
            error!("Error starting replication: {}", e);
            e
        })?;
        self.transition(ConsumerState::Streaming);
        info!("Started consuming changes");
        Ok(())
    }

    async fn stream(&mut self) -> Result<()> {
        loop {
            if self.shutdown.is_requested() {
                self.transition(ConsumerState::ShuttingDown);
                return Ok(());
            }

            let received = tokio::select! {
                biased;
                _ = self.shutdown.wait() => continue,
                received = self.source.recv() => received,
            };

            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => match self.on_error(e, "reading from replication stream").await? {
                    Step::Continue => continue,
                    Step::Stop => return Ok(()),
                },
            };

            self.stats.messages += 1;
            self.dispatch(&message).await;

            match self.source.send_feedback(&message).await {
                Ok(()) => self.stats.acknowledged += 1,
                Err(e) => {
                    if let Step::Stop = self.on_error(e, "sending stream feedback").await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Cancellation stops the stream cleanly, a lost connection ends it with
    /// an error, and anything else is logged before the loop moves on.
    async fn on_error(&mut self, e: Error, context: &str) -> Result<Step> {
        if e.is_stream_cancelled() {
            info!("Replication stream stopped by server: {}", e);
            self.stats.cancelled = true;
            return Ok(Step::Stop);
        }
        if e.is_connection_lost() {
            error!("Replication connection lost while {}: {}", context, e);
            return Err(e);
        }

        error!("Error {}: {}", context, e);
        self.stats.errors += 1;
        tokio::select! {
            _ = self.shutdown.wait() => {}
            _ = tokio::time::sleep(self.error_backoff) => {}
        }
        Ok(Step::Continue)
    }

    async fn dispatch(&mut self, message: &WalMessage) {
        if is_framing_message(&message.data) {
            trace!(data = %message.data, "Skipping framing message");
            self.stats.framing_skipped += 1;
            return;
        }

        let event = self.parser.parse(&message.data);
        if !event.is_actionable() {
            self.stats.non_actionable += 1;
            return;
        }
        self.stats.events += 1;
        info!(
            table = %event.table,
            operation = %event.operation,
            lsn = ?message.lsn,
            "Change detected"
        );

        match self.back_up(message, &event).await {
            Ok(()) => {
                self.stats.backups_ok += 1;
                self.state_store
                    .save(&Checkpoint::now(message.lsn.clone()))
                    .await;
            }
            Err(e) => {
                self.stats.backups_failed += 1;
                error!(table = %event.table, "Backup failed for change: {}", e);
            }
        }
    }

    async fn back_up(&self, message: &WalMessage, event: &ChangeEvent) -> Result<()> {
        if let Some(writer) = &self.raw_writer {
            writer.write(message, event).await?;
            return Ok(());
        }

        let table = event.table_ref().ok_or_else(|| Error::InvalidMessage {
            message: "change has no table".to_string(),
        })?;

        let row_keys = self.key_column.as_ref().and_then(|column| {
            let key = event.values.get(column);
            if key.is_none() {
                debug!(table = %table, column = %column, "Key column absent, snapshotting whole table");
            }
            key.map(|key| vec![key.clone()])
        });

        self.snapshotter
            .snapshot_table(&table, row_keys.as_deref())
            .await?;
        Ok(())
    }

    fn transition(&mut self, next: ConsumerState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Stream consumer state change");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{ArtifactKind, ArtifactStore, BackupArtifact};
    use crate::postgres::test_utils::MockMessageBuilder;
    use crate::postgres::TableRef;
    use chrono::{DateTime, Utc};
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct SourceLog {
        calls: Vec<&'static str>,
        acked: Vec<WalMessage>,
        checkpoints_at_ack: Vec<Option<DateTime<Utc>>>,
    }

    struct MockSource {
        script: VecDeque<Result<Option<WalMessage>>>,
        log: Arc<Mutex<SourceLog>>,
        checkpoint_path: Option<PathBuf>,
        shutdown_after: Option<(usize, ShutdownSignal)>,
        ensure_error: bool,
    }

    impl MockSource {
        fn new(messages: Vec<WalMessage>) -> (Self, Arc<Mutex<SourceLog>>) {
            let log = Arc::new(Mutex::new(SourceLog::default()));
            let mut script: VecDeque<_> = messages.into_iter().map(|m| Ok(Some(m))).collect();
            script.push_back(Err(Error::StreamCancelled {
                message: "canceling statement due to user request".to_string(),
            }));
            let source = Self {
                script,
                log: log.clone(),
                checkpoint_path: None,
                shutdown_after: None,
                ensure_error: false,
            };
            (source, log)
        }
    }

    #[async_trait]
    impl ChangeSource for MockSource {
        async fn ensure_slot(&mut self) -> Result<SlotStatus> {
            self.log.lock().unwrap().calls.push("ensure_slot");
            if self.ensure_error {
                return Err(Error::Connection("permission denied".to_string()));
            }
            Ok(SlotStatus::AlreadyExists)
        }

        async fn start(&mut self) -> Result<()> {
            self.log.lock().unwrap().calls.push("start");
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<WalMessage>> {
            self.log.lock().unwrap().calls.push("recv");
            if let Some((after, signal)) = &self.shutdown_after {
                if self.log.lock().unwrap().acked.len() + 1 >= *after {
                    signal.request();
                }
            }
            match self.script.pop_front() {
                Some(item) => item,
                None => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(None)
                }
            }
        }

        async fn send_feedback(&mut self, message: &WalMessage) -> Result<()> {
            let checkpoint = match &self.checkpoint_path {
                Some(path) => StateStore::new(path).load().await.map(|c| c.last_processed),
                None => None,
            };
            let mut log = self.log.lock().unwrap();
            log.acked.push(message.clone());
            log.checkpoints_at_ack.push(checkpoint);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.log.lock().unwrap().calls.push("close");
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    struct MockSnapshotter {
        calls: Arc<Mutex<Vec<(TableRef, Option<Vec<String>>)>>>,
        failing_table: Option<String>,
    }

    #[async_trait]
    impl TableSnapshotter for MockSnapshotter {
        async fn snapshot_table(
            &self,
            table: &TableRef,
            row_keys: Option<&[String]>,
        ) -> Result<BackupArtifact> {
            self.calls
                .lock()
                .unwrap()
                .push((table.clone(), row_keys.map(<[String]>::to_vec)));
            if self.failing_table.as_deref() == Some(table.name.as_str()) {
                return Err(Error::Connection("connection refused".to_string()));
            }
            Ok(BackupArtifact {
                table: Some(table.clone()),
                kind: ArtifactKind::Incremental,
                timestamp: Utc::now(),
                path: PathBuf::from(format!("{}_backup.csv", table.name)),
            })
        }
    }

    fn consumer(
        source: MockSource,
        snapshotter: MockSnapshotter,
        dir: &TempDir,
        shutdown: ShutdownSignal,
    ) -> StreamConsumer<MockSource, MockSnapshotter> {
        let store = StateStore::new(dir.path().join("last_processed_state.json"));
        StreamConsumer::new(source, snapshotter, store, shutdown)
            .with_error_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_framing_is_skipped_and_everything_acked() {
        let dir = TempDir::new().unwrap();
        let builder = MockMessageBuilder::new();
        let mut messages = builder.transaction(&["orders"]);
        messages.push(WalMessage::new("  BEGIN  "));
        messages.push(WalMessage::new("COMMIT"));
        let total = messages.len();

        let (source, log) = MockSource::new(messages);
        let snapshotter = MockSnapshotter::default();
        let mut consumer = consumer(source, snapshotter.clone(), &dir, ShutdownSignal::new());

        let stats = consumer.run().await.unwrap();

        assert_eq!(stats.messages, total as u64);
        assert_eq!(stats.acknowledged, total as u64);
        assert_eq!(stats.framing_skipped, 4);
        assert_eq!(stats.events, 1);
        assert_eq!(snapshotter.calls.lock().unwrap().len(), 1);
        assert_eq!(log.lock().unwrap().acked.len(), total);
        assert!(stats.cancelled);
        assert_eq!(consumer.state(), ConsumerState::Closed);
    }

    #[tokio::test]
    async fn test_failures_are_still_acknowledged_once() {
        let dir = TempDir::new().unwrap();
        let builder = MockMessageBuilder::new();
        let messages = vec![
            builder.insert_message("public", "broken", &[("id", "integer", "1")]),
            WalMessage::new("garbage").with_lsn("0/99"),
            builder.insert_message("public", "orders", &[("id", "integer", "2")]),
        ];

        let (source, log) = MockSource::new(messages.clone());
        let snapshotter = MockSnapshotter {
            failing_table: Some("broken".to_string()),
            ..Default::default()
        };
        let mut consumer = consumer(source, snapshotter, &dir, ShutdownSignal::new());

        let stats = consumer.run().await.unwrap();

        assert_eq!(stats.backups_failed, 1);
        assert_eq!(stats.backups_ok, 1);
        assert_eq!(stats.non_actionable, 1);
        assert_eq!(log.lock().unwrap().acked, messages);
    }

    #[tokio::test]
    async fn test_checkpoint_written_only_after_successful_backup() {
        let dir = TempDir::new().unwrap();
        let builder = MockMessageBuilder::new();
        let messages = vec![
            builder.insert_message("public", "broken", &[("id", "integer", "1")]),
            builder.insert_message("public", "orders", &[("id", "integer", "2")]),
            builder.insert_message("public", "orders", &[("id", "integer", "3")]),
            builder.insert_message("public", "orders", &[("id", "integer", "4")]),
        ];

        let (mut source, log) = MockSource::new(messages);
        let checkpoint_path = dir.path().join("last_processed_state.json");
        source.checkpoint_path = Some(checkpoint_path.clone());
        let snapshotter = MockSnapshotter {
            failing_table: Some("broken".to_string()),
            ..Default::default()
        };
        let mut consumer = consumer(source, snapshotter, &dir, ShutdownSignal::new());
        consumer.run().await.unwrap();

        let seen = log.lock().unwrap().checkpoints_at_ack.clone();
        assert_eq!(seen[0], None);
        let written: Vec<_> = seen[1..].iter().map(|c| c.unwrap()).collect();
        assert!(written.windows(2).all(|w| w[0] <= w[1]));

        let saved = StateStore::new(&checkpoint_path).load().await.unwrap();
        assert!(saved.lsn.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_stops_after_in_flight_message() {
        let dir = TempDir::new().unwrap();
        let builder = MockMessageBuilder::new();
        let messages: Vec<_> = (0..10)
            .map(|i| builder.insert_message("public", "orders", &[("id", "integer", &i.to_string())]))
            .collect();

        let shutdown = ShutdownSignal::new();
        let (mut source, log) = MockSource::new(messages);
        source.shutdown_after = Some((2, shutdown.clone()));
        let mut consumer = consumer(source, MockSnapshotter::default(), &dir, shutdown);

        let stats = consumer.run().await.unwrap();

        assert_eq!(stats.acknowledged, 2);
        assert!(!stats.cancelled);
        assert_eq!(stats.final_state, ConsumerState::Closed);
        let log = log.lock().unwrap();
        assert_eq!(log.acked.len(), 2);
        assert_eq!(log.calls.last(), Some(&"close"));
    }

    #[tokio::test]
    async fn test_idle_stream_observes_shutdown() {
        let dir = TempDir::new().unwrap();
        let shutdown = ShutdownSignal::new();
        let (mut source, _log) = MockSource::new(vec![]);
        source.script.clear();
        let mut consumer = consumer(source, MockSnapshotter::default(), &dir, shutdown.clone());

        let runner = tokio::spawn(async move { consumer.run().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.request();

        let stats = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.messages, 0);
        assert_eq!(stats.final_state, ConsumerState::Closed);
    }

    #[tokio::test]
    async fn test_per_message_error_continues() {
        let dir = TempDir::new().unwrap();
        let builder = MockMessageBuilder::new();
        let (mut source, log) = MockSource::new(vec![]);
        source.script = VecDeque::from(vec![
            Err(Error::InvalidMessage {
                message: "bad row".to_string(),
            }),
            Ok(Some(builder.insert_message("public", "orders", &[("id", "integer", "1")]))),
            Err(Error::StreamCancelled {
                message: "terminating connection due to administrator command".to_string(),
            }),
        ]);
        let mut consumer = consumer(source, MockSnapshotter::default(), &dir, ShutdownSignal::new());

        let stats = consumer.run().await.unwrap();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(log.lock().unwrap().acked.len(), 1);
    }

    #[tokio::test]
    async fn test_connection_loss_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (mut source, log) = MockSource::new(vec![]);
        source.script = VecDeque::from(vec![Err(Error::Connection("server closed the connection".to_string()))]);
        let mut consumer = consumer(source, MockSnapshotter::default(), &dir, ShutdownSignal::new());

        let result = consumer.run().await;
        assert!(result.is_err());
        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert_eq!(log.lock().unwrap().calls.last(), Some(&"close"));
    }

    #[tokio::test]
    async fn test_slot_failure_aborts_startup() {
        let dir = TempDir::new().unwrap();
        let (mut source, log) = MockSource::new(vec![]);
        source.ensure_error = true;
        let mut consumer = consumer(source, MockSnapshotter::default(), &dir, ShutdownSignal::new());

        assert!(consumer.run().await.is_err());
        let calls = log.lock().unwrap().calls.clone();
        assert_eq!(calls, vec!["ensure_slot", "close"]);
    }

    #[tokio::test]
    async fn test_row_level_passes_key() {
        let dir = TempDir::new().unwrap();
        let builder = MockMessageBuilder::new();
        let messages = vec![
            builder.insert_message("public", "orders", &[("id", "integer", "42"), ("status", "text", "new")]),
            builder.insert_message("public", "audit", &[("event", "text", "x")]),
        ];
        let (source, _log) = MockSource::new(messages);
        let snapshotter = MockSnapshotter::default();
        let mut consumer =
            consumer(source, snapshotter.clone(), &dir, ShutdownSignal::new()).with_row_level("id");

        consumer.run().await.unwrap();

        let calls = snapshotter.calls.lock().unwrap().clone();
        assert_eq!(calls[0].1, Some(vec!["42".to_string()]));
        assert_eq!(calls[1].1, None);
    }

    #[tokio::test]
    async fn test_raw_payload_mode_writes_json() {
        let dir = TempDir::new().unwrap();
        let backups = dir.path().join("backups");
        let builder = MockMessageBuilder::new();
        let (source, _log) = MockSource::new(builder.transaction(&["orders", "customers"]));
        let snapshotter = MockSnapshotter::default();
        let mut consumer = consumer(source, snapshotter.clone(), &dir, ShutdownSignal::new())
            .with_raw_payload(RawChangeWriter::new(ArtifactStore::new(&backups)));

        let stats = consumer.run().await.unwrap();

        assert_eq!(stats.backups_ok, 2);
        assert!(snapshotter.calls.lock().unwrap().is_empty());
        let written = std::fs::read_dir(&backups).unwrap().count();
        assert_eq!(written, 2);
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (source, _log) = MockSource::new(vec![]);
        let mut consumer = consumer(source, MockSnapshotter::default(), &dir, ShutdownSignal::new());

        consumer.run().await.unwrap();
        assert!(consumer.run().await.is_err());
    }
}
