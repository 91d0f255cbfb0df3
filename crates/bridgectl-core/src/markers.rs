//! Marker files shared between the updater, the controller and the bridge.
//!
//! `data/restart-requested` tells the bridge (or the watchdog) that newer code
//! has been pulled and a restart is due at the next idle point. The bridge
//! polls for the file; whoever restarts it clears the marker.
//!
//! `data/upgrade-pending` records a deferred dependency upgrade. It is only
//! ever surfaced as a warning.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::{io, paths};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartRequest {
    pub requested_at: DateTime<Utc>,
    /// Number of commits pulled by the update that asked for the restart.
    pub commits: u32,
    pub from: String,
    pub to: String,
}

impl RestartRequest {
    pub fn new(commits: u32, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            requested_at: Utc::now(),
            commits,
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn write(&self, root: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        io::atomic_write(&paths::restart_requested_path(root), &data)
    }

    /// The pending request, if any. An unreadable marker still counts as a
    /// request, with its details unknown.
    pub fn read(root: &Path) -> Result<Option<Self>> {
        let path = paths::restart_requested_path(root);
        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&data) {
            Ok(req) => Ok(Some(req)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unparseable restart marker");
                Ok(Some(Self {
                    requested_at: std::fs::metadata(&path)?.modified()?.into(),
                    commits: 0,
                    from: String::new(),
                    to: String::new(),
                }))
            }
        }
    }

    pub fn clear(root: &Path) -> Result<bool> {
        io::remove_if_exists(&paths::restart_requested_path(root))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradePending {
    pub since: DateTime<Utc>,
    pub reason: String,
}

impl UpgradePending {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            since: Utc::now(),
            reason: reason.into(),
        }
    }

    pub fn write(&self, root: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        io::atomic_write(&paths::upgrade_pending_path(root), &data)
    }

    pub fn read(root: &Path) -> Result<Option<Self>> {
        let path = paths::upgrade_pending_path(root);
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        // Older tooling wrote free text here.
        Ok(Some(serde_json::from_str(&data).unwrap_or_else(|_| Self {
            since: Utc::now(),
            reason: data.trim().to_string(),
        })))
    }

    pub fn clear(root: &Path) -> Result<bool> {
        io::remove_if_exists(&paths::upgrade_pending_path(root))
    }
}
