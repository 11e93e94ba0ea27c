use tokio_postgres::error::SqlState;
use tokio_postgres::Client;
use tracing::{error, info, warn};

use crate::{Error, Result};

/// Outcome of [`ReplicationSlotManager::ensure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotStatus {
    /// The slot was created; carries the consistent point reported by the server.
    Created { lsn: String },
    /// A slot with this name was already there.
    AlreadyExists,
}

/// What the server reports about an existing slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot_name: String,
    pub plugin: Option<String>,
    pub slot_type: String,
    pub active: bool,
    pub confirmed_flush_lsn: Option<String>,
}

/// Creates, inspects and drops logical replication slots on the server.
pub struct ReplicationSlotManager<'a> {
    client: &'a Client,
}

impl<'a> ReplicationSlotManager<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Creates the slot if it is absent. An existing slot is reported as
    /// [`SlotStatus::AlreadyExists`] and logged as a warning; any other
    /// failure is returned.
    pub async fn ensure(&self, slot_name: &str, plugin: &str) -> Result<SlotStatus> {
        info!(slot = %slot_name, plugin = %plugin, "Creating replication slot");

        let result = self
            .client
            .query_one(
                "SELECT slot_name::text, lsn::text FROM pg_create_logical_replication_slot($1, $2)",
                &[&slot_name, &plugin],
            )
            .await;

        match result {
            Ok(row) => {
                let lsn: Option<String> = row.get(1);
                let lsn = lsn.unwrap_or_else(|| "unknown".to_string());
                info!("Replication slot '{}' created at LSN {}", slot_name, lsn);
                Ok(SlotStatus::Created { lsn })
            }
            Err(e) if is_duplicate_slot(e.code(), &e.to_string()) => {
                warn!("Replication slot '{}' already exists", slot_name);
                Ok(SlotStatus::AlreadyExists)
            }
            Err(e) => {
                error!("Error creating replication slot '{}': {}", slot_name, e);
                Err(Error::Postgres(e))
            }
        }
    }

    pub async fn describe(&self, slot_name: &str) -> Result<Option<SlotInfo>> {
        let row = self
            .client
            .query_opt(
                "SELECT slot_name::text, plugin::text, slot_type, active, confirmed_flush_lsn::text \
                 FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot_name],
            )
            .await?;

        Ok(row.map(|row| SlotInfo {
            slot_name: row.get(0),
            plugin: row.get(1),
            slot_type: row.get(2),
            active: row.get(3),
            confirmed_flush_lsn: row.get(4),
        }))
    }

    /// Checks that `slot_name` exists, is logical, and decodes with `plugin`.
    pub async fn verify(&self, slot_name: &str, plugin: &str) -> Result<SlotInfo> {
        let info = self.describe(slot_name).await?.ok_or_else(|| Error::Replication {
            message: format!("Replication slot '{}' does not exist", slot_name),
        })?;

        if info.slot_type != "logical" {
            return Err(Error::Replication {
                message: format!(
                    "Replication slot '{}' is a {} slot, not logical",
                    slot_name, info.slot_type
                ),
            });
        }

        match info.plugin.as_deref() {
            Some(actual) if actual == plugin => Ok(info),
            actual => Err(Error::SlotMismatch {
                slot: slot_name.to_string(),
                expected: plugin.to_string(),
                actual: actual.unwrap_or("none").to_string(),
            }),
        }
    }

    pub async fn drop_slot(&self, slot_name: &str) -> Result<()> {
        info!("Dropping replication slot: {}", slot_name);

        match self
            .client
            .execute("SELECT pg_drop_replication_slot($1)", &[&slot_name])
            .await
        {
            Ok(_) => {
                info!("Dropped replication slot '{}'", slot_name);
                Ok(())
            }
            Err(e) if e.code() == Some(&SqlState::UNDEFINED_OBJECT) => {
                warn!("Replication slot '{}' does not exist", slot_name);
                Ok(())
            }
            Err(e) => Err(Error::Postgres(e)),
        }
    }
}

/// Whether a slot creation failure means "a slot with that name exists".
pub fn is_duplicate_slot(code: Option<&SqlState>, message: &str) -> bool {
    code == Some(&SqlState::DUPLICATE_OBJECT) || message.contains("already exists")
}
