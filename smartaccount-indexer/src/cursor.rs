//! Sync cursor persistence.
//!
//! The data directory carries a `cursor.json` recording the last block
//! whose events were fully dispatched and snapshotted, so subsequent runs
//! only fetch the delta. The cursor is bound to the factory it was synced
//! against: reusing a data directory with a different factory is a
//! configuration mistake, not a resume.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use smartaccount::EntityId;

/// Sync progress for one factory deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Cursor {
    /// The factory this data directory was synced against.
    pub factory: EntityId,
    /// Last block whose events are reflected in the state snapshot.
    pub last_block: u64,
    /// Unix timestamp (seconds) of the last successful sync.
    pub synced_at: u64,
}

impl Cursor {
    /// A cursor at `last_block` stamped with the current time.
    #[must_use]
    pub fn now(factory: EntityId, last_block: u64) -> Self {
        let synced_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            factory,
            last_block,
            synced_at,
        }
    }

    /// Read the cursor from `<dir>/cursor.json`.
    ///
    /// Returns `None` when the file does not exist (first sync) or holds
    /// invalid JSON (logged, triggers a fresh sync).
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read, or when it belongs
    /// to a different factory than `factory`.
    pub fn load(dir: &Path, factory: EntityId) -> Result<Option<Self>> {
        let path = dir.join("cursor.json");
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cursor: Self = match serde_json::from_str(&data) {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupted cursor, starting fresh");
                return Ok(None);
            }
        };
        if cursor.factory != factory {
            bail!(
                "data directory {} was synced against factory {}, not {factory}",
                dir.display(),
                cursor.factory
            );
        }
        Ok(Some(cursor))
    }

    /// Persist the cursor to `<dir>/cursor.json` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        let path = dir.join("cursor.json");
        let tmp = dir.join("cursor.json.tmp");

        std::fs::write(&tmp, serde_json::to_string_pretty(self)?.as_bytes())
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;

        Ok(())
    }
}
