use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, trace, warn};

use super::decoder::is_framing_message;
use super::slot::{ReplicationSlotManager, SlotStatus};
use super::types::WalMessage;
use crate::error::is_cancellation_code;
use crate::stream::ChangeSource;
use crate::{Error, Result};

/// Opens an ordinary connection and drives it on a background task.
pub async fn connect(config: &tokio_postgres::Config, purpose: &'static str) -> Result<Client> {
    let (client, connection) = config.connect(NoTls).await.map_err(|e| {
        error!("Error connecting to the database ({}): {}", purpose, e);
        Error::Postgres(e)
    })?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("{} connection error: {}", purpose, e);
        }
    });

    debug!("Connected to PostgreSQL for {}", purpose);
    Ok(client)
}

/// The streaming side of the pipeline: one dedicated connection that pulls
/// decoded changes from a logical slot and acknowledges them.
///
/// Changes are read with `pg_logical_slot_peek_changes`, which returns whole
/// transactions. Acknowledging a transaction's `COMMIT` advances the slot's
/// confirmed position to the commit's end LSN; acknowledging any other
/// message only moves the local flush position, because the server can
/// only skip whole transactions.
pub struct ReplicationConnection {
    client: Client,
    connection_task: tokio::task::JoinHandle<()>,
    slot_name: String,
    plugin: String,
    batch_size: i32,
    poll_interval: Duration,
    buffer: VecDeque<WalMessage>,
    delivered_upto: Option<u64>,
    ack_in_txn: bool,
    replication_started: bool,
}

impl ReplicationConnection {
    pub async fn new(
        config: &tokio_postgres::Config,
        slot_name: String,
        plugin: String,
        batch_size: u32,
        poll_interval: Duration,
    ) -> Result<Self> {
        info!("Creating replication connection to PostgreSQL");

        let (client, connection) = config.connect(NoTls).await.map_err(|e| {
            error!("Error connecting to the database: {}", e);
            Error::Postgres(e)
        })?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Replication connection error: {}", e);
            }
        });

        info!("Successfully connected to PostgreSQL for streaming");

        Ok(Self {
            client,
            connection_task,
            slot_name,
            plugin,
            batch_size: i32::try_from(batch_size).unwrap_or(i32::MAX),
            poll_interval,
            buffer: VecDeque::new(),
            delivered_upto: None,
            ack_in_txn: false,
            replication_started: false,
        })
    }

    async fn fill_buffer(&mut self) -> Result<()> {
        let rows = self
            .client
            .query(
                "SELECT lsn::text, xid::text, data FROM pg_logical_slot_peek_changes($1, NULL, $2)",
                &[&self.slot_name, &self.batch_size],
            )
            .await
            .map_err(classify)?;

        let messages = rows
            .iter()
            .map(|row| {
                let lsn: Option<String> = row.get(0);
                let xid: Option<String> = row.get(1);
                let data: Option<String> = row.get(2);
                WalMessage {
                    lsn,
                    xid: xid.and_then(|xid| xid.parse().ok()),
                    data: data.unwrap_or_default(),
                }
            })
            .collect();

        let (fresh, delivered_upto) = collect_units(messages, self.delivered_upto);
        trace!(rows = rows.len(), fresh = fresh.len(), "Peeked slot changes");
        self.delivered_upto = delivered_upto;

        if let Some(lsn) = stalled_at(rows.len(), fresh.len(), delivered_upto) {
            warn!(lsn = %lsn, "Slot is behind delivered changes, retrying advance");
            self.advance(&lsn).await?;
        }

        self.buffer.extend(fresh);
        Ok(())
    }

    async fn advance(&self, lsn: &str) -> Result<()> {
        let row = self
            .client
            .query_one(
                "SELECT end_lsn::text FROM pg_replication_slot_advance($1, $2::text::pg_lsn)",
                &[&self.slot_name, &lsn],
            )
            .await
            .map_err(classify)?;
        let end_lsn: Option<String> = row.get(0);
        debug!(lsn = %lsn, confirmed = ?end_lsn, "Advanced replication slot");
        Ok(())
    }
}

#[async_trait]
impl ChangeSource for ReplicationConnection {
    async fn ensure_slot(&mut self) -> Result<SlotStatus> {
        ReplicationSlotManager::new(&self.client)
            .ensure(&self.slot_name, &self.plugin)
            .await
    }

    async fn start(&mut self) -> Result<()> {
        info!(slot = %self.slot_name, "Starting replication");

        let slot = ReplicationSlotManager::new(&self.client)
            .verify(&self.slot_name, &self.plugin)
            .await?;

        self.replication_started = true;
        info!(
            confirmed_flush_lsn = ?slot.confirmed_flush_lsn,
            "Started replication."
        );
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<WalMessage>> {
        if !self.replication_started {
            return Err(Error::Replication {
                message: "Replication not started".to_string(),
            });
        }

        if self.buffer.is_empty() {
            self.fill_buffer().await?;
        }

        match self.buffer.pop_front() {
            Some(message) => Ok(Some(message)),
            None => {
                tokio::time::sleep(self.poll_interval).await;
                Ok(None)
            }
        }
    }

    async fn send_feedback(&mut self, message: &WalMessage) -> Result<()> {
        if !self.replication_started {
            return Err(Error::Replication {
                message: "No active replication stream".to_string(),
            });
        }

        let closes = closes_unit(message, &mut self.ack_in_txn);
        let Some(lsn) = message.lsn.as_deref() else {
            return Ok(());
        };

        if !closes {
            trace!(lsn = %lsn, "Recorded flush position");
            return Ok(());
        }

        self.advance(lsn).await
    }

    async fn close(&mut self) -> Result<()> {
        info!("Closing replication connection");
        self.replication_started = false;
        self.ack_in_txn = false;
        self.buffer.clear();
        self.connection_task.abort();
        Ok(())
    }
}

fn classify(e: tokio_postgres::Error) -> Error {
    match e.code() {
        Some(code) if is_cancellation_code(code) => Error::StreamCancelled {
            message: e.to_string(),
        },
        _ => Error::Postgres(e),
    }
}

/// Parses an `X/X` log position.
pub fn parse_lsn(lsn: &str) -> Option<u64> {
    let (hi, lo) = lsn.split_once('/')?;
    let hi = u64::from_str_radix(hi, 16).ok()?;
    let lo = u64::from_str_radix(lo, 16).ok()?;
    Some((hi << 32) | lo)
}

fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// A peek that returned rows but nothing new means the slot still sits
/// before units that were already handed out and acknowledged, which
/// happens when their advance failed. Returns the position to advance to.
fn stalled_at(peeked: usize, fresh: usize, delivered_upto: Option<u64>) -> Option<String> {
    if peeked > 0 && fresh == 0 {
        delivered_upto.map(format_lsn)
    } else {
        None
    }
}

/// A message ends a delivery unit when it commits a transaction, or when it
/// arrives outside any BEGIN/COMMIT framing. `in_txn` tracks the framing
/// across successive acknowledgements.
fn closes_unit(message: &WalMessage, in_txn: &mut bool) -> bool {
    match message.data.split_whitespace().next() {
        Some("BEGIN") => {
            *in_txn = true;
            false
        }
        Some("COMMIT") => {
            *in_txn = false;
            true
        }
        _ => !*in_txn && !is_framing_message(&message.data),
    }
}

/// Splits a peeked batch into delivery units and drops those already handed
/// out. Transactions arrive in commit order, so the key of a unit (the LSN
/// of its last message) only grows. A trailing transaction without its
/// COMMIT is held back until a later peek returns it whole.
fn collect_units(
    messages: Vec<WalMessage>,
    mut delivered_upto: Option<u64>,
) -> (Vec<WalMessage>, Option<u64>) {
    let mut fresh = Vec::new();
    let mut pending = Vec::new();
    let mut in_txn = false;

    for message in messages {
        let first = message.data.split_whitespace().next();
        let begins = first == Some("BEGIN");
        let commits = first == Some("COMMIT");
        let key = message.lsn.as_deref().and_then(parse_lsn);

        if begins {
            in_txn = true;
        }
        pending.push(message);

        if commits || !in_txn {
            in_txn = false;
            let unit = std::mem::take(&mut pending);
            match (key, delivered_upto) {
                (Some(key), Some(upto)) if key <= upto => continue,
                (Some(key), _) => delivered_upto = Some(key),
                (None, _) => {}
            }
            fresh.extend(unit);
        }
    }

    (fresh, delivered_upto)
}
