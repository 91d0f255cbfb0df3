//! Periodic supervision pass, run by the service manager on a fixed interval.
//!
//! - bridge down: start it.
//! - restart requested by the updater: restart, but only once the bridge's
//!   logs have been quiet for `service.idle_secs`, so an in-flight
//!   response is never cut off.
//! - log heuristics unhealthy: report only.

use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::controller::{Controller, StartOutcome, StopOutcome};
use crate::error::{BridgeError, Result};
use crate::health::{self, HealthReport};
use crate::markers::RestartRequest;
use crate::paths;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WatchdogAction {
    Healthy,
    Started { start: StartOutcome },
    RestartedForUpdate {
        commits: u32,
        stopped: StopOutcome,
        start: StartOutcome,
    },
    RestartDeferred { quiet_secs: u64, needed_secs: u64 },
    Degraded { report: HealthReport },
    /// Another lifecycle operation holds the lock; try again next cycle.
    Skipped { reason: String },
}

pub struct Watchdog<'a> {
    controller: &'a Controller,
}

impl<'a> Watchdog<'a> {
    pub fn new(controller: &'a Controller) -> Self {
        Self { controller }
    }

    pub fn run(&self) -> Result<WatchdogAction> {
        let _lock = match self.controller.lock("watchdog") {
            Ok(lock) => lock,
            Err(e @ BridgeError::LockHeld { .. }) => {
                tracing::info!(reason = %e, "watchdog skipped");
                return Ok(WatchdogAction::Skipped {
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let root = self.controller.root();
        let config = self.controller.config();

        let Some(process) = self.controller.locate()? else {
            tracing::warn!("bridge not running; starting it");
            let start = self.controller.start_locked()?;
            return Ok(WatchdogAction::Started { start });
        };

        if let Some(request) = RestartRequest::read(root)? {
            let quiet = quiet_for(root);
            let needed = Duration::from_secs(config.service.idle_secs);
            if quiet >= needed {
                // A restart that cannot start again must not stop the bridge.
                self.controller.check_preconditions()?;
                tracing::info!(commits = request.commits, "bridge idle; applying requested restart");
                let stopped = self.controller.stop_locked()?;
                let start = self.controller.start_locked()?;
                return Ok(WatchdogAction::RestartedForUpdate {
                    commits: request.commits,
                    stopped,
                    start,
                });
            }
            tracing::info!(quiet_secs = quiet.as_secs(), "bridge busy; deferring requested restart");
            return Ok(WatchdogAction::RestartDeferred {
                quiet_secs: quiet.as_secs(),
                needed_secs: needed.as_secs(),
            });
        }

        let report = health::check(root, config, Some(&process))?;
        if report.healthy {
            Ok(WatchdogAction::Healthy)
        } else {
            tracing::warn!(issues = ?report.issues, "bridge degraded");
            Ok(WatchdogAction::Degraded { report })
        }
    }
}

/// Time since the bridge last wrote to either log. No logs at all counts
/// as idle forever.
fn quiet_for(root: &Path) -> Duration {
    [paths::bridge_log_path(root), paths::bridge_error_log_path(root)]
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok()?.modified().ok())
        .map(|m| SystemTime::now().duration_since(m).unwrap_or(Duration::ZERO))
        .min()
        .unwrap_or(Duration::MAX)
}
