//! Durable "last processed" marker for the change stream.
//!
//! The checkpoint is advisory: the replication slot on the server carries
//! the real resume position. The file exists so operators (and the next
//! process) can see how far backups got, so every failure here is logged
//! and swallowed by [`StateStore::load`] and [`StateStore::save`].
//!
//! # Example
//!
//! ```rust,no_run
//! use pg_cdc_backup::checkpoint::{Checkpoint, StateStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = StateStore::new("last_processed_state.json");
//!
//!     if let Some(checkpoint) = store.load().await {
//!         println!("Last processed at {}", checkpoint.last_processed);
//!     }
//!
//!     store.save(&Checkpoint::now(Some("0/16B3748".to_string()))).await;
//! }
//! ```

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// The persisted progress record: `{"last_processed": "<RFC 3339>"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// When the last change was successfully backed up
    pub last_processed: DateTime<Utc>,
    /// Log position of that change, when the stream reported one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsn: Option<String>,
}

impl Checkpoint {
    /// Creates a checkpoint stamped with the current time.
    ///
    /// ```rust
    /// use pg_cdc_backup::checkpoint::Checkpoint;
    ///
    /// let checkpoint = Checkpoint::now(None);
    /// assert!(checkpoint.lsn.is_none());
    /// ```
    pub fn now(lsn: Option<String>) -> Self {
        Self {
            last_processed: Utc::now(),
            lsn,
        }
    }
}

/// Reads and atomically overwrites the checkpoint file.
#[derive(Debug)]
pub struct StateStore {
    file_path: PathBuf,
    last_saved: Mutex<Option<DateTime<Utc>>>,
}

impl StateStore {
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: checkpoint_path.as_ref().to_path_buf(),
            last_saved: Mutex::new(None),
        }
    }

    /// Loads the prior checkpoint.
    ///
    /// Returns `None` on first run and also when the file cannot be read or
    /// parsed; the error is logged and the pipeline starts fresh.
    pub async fn load(&self) -> Option<Checkpoint> {
        match self.try_load().await {
            Ok(Some(checkpoint)) => {
                info!(
                    last_processed = %checkpoint.last_processed,
                    lsn = ?checkpoint.lsn,
                    "Loaded checkpoint"
                );
                self.remember(checkpoint.last_processed);
                Some(checkpoint)
            }
            Ok(None) => {
                debug!("No checkpoint file found at {:?}", self.file_path);
                None
            }
            Err(e) => {
                error!("Error loading last processed state from {:?}: {}", self.file_path, e);
                None
            }
        }
    }

    /// Persists the checkpoint, logging instead of failing.
    ///
    /// The stored timestamp never moves backwards relative to what this store
    /// last wrote, even if the wall clock steps back.
    pub async fn save(&self, checkpoint: &Checkpoint) -> bool {
        let checkpoint = self.monotonic(checkpoint);
        match self.try_save(&checkpoint).await {
            Ok(()) => {
                info!(last_processed = %checkpoint.last_processed, "Last processed state saved");
                true
            }
            Err(e) => {
                error!("Error saving last processed state to {:?}: {}", self.file_path, e);
                false
            }
        }
    }

    /// Reads the checkpoint file, propagating I/O and parse errors.
    pub async fn try_load(&self) -> Result<Option<Checkpoint>> {
        let content = match fs::read_to_string(&self.file_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str::<Checkpoint>(&content)?))
    }

    /// Writes the checkpoint atomically: temp file, fsync, rename.
    pub async fn try_save(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!("Saving checkpoint: last_processed={}", checkpoint.last_processed);

        let temp_path = self.file_path.with_extension("tmp");

        let json = serde_json::to_string(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;
        Ok(())
    }

    fn monotonic(&self, checkpoint: &Checkpoint) -> Checkpoint {
        let mut last_saved = match self.last_saved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut checkpoint = checkpoint.clone();
        if let Some(previous) = *last_saved {
            if checkpoint.last_processed < previous {
                warn!(
                    previous = %previous,
                    requested = %checkpoint.last_processed,
                    "Clock moved backwards, keeping previous checkpoint time"
                );
                checkpoint.last_processed = previous;
            }
        }
        *last_saved = Some(checkpoint.last_processed);
        checkpoint
    }

    fn remember(&self, at: DateTime<Utc>) {
        let mut last_saved = match self.last_saved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last_saved = Some(at);
    }
}
