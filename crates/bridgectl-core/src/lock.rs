//! Directory-based mutual exclusion between lifecycle operations.
//!
//! `create_dir` is atomic, so whoever creates the directory owns the lock.
//! The owner records its PID inside; a lock whose owner is dead, whose PID
//! now belongs to a process started after the lock was taken, or which
//! carries no owner record and is older than the stale threshold, is
//! reclaimed once. A live owner makes acquisition fail immediately.
//!
//! Reclaiming is serialized through an `flock` on `<lock>.reclaim`, and
//! staleness is re-checked under it, so two callers that both saw the same
//! dead owner can never both end up holding the lock.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::paths::LOCK_OWNER_FILE;
use crate::process;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
}

const START_TIME_SLACK_SECS: u64 = 2;

/// Held lock; the directory is removed when this is dropped.
#[derive(Debug)]
pub struct LockGuard {
    dir: PathBuf,
}

impl LockGuard {
    pub fn acquire(dir: &Path, operation: &str, stale_after: Duration) -> Result<Self> {
        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match try_create(dir, operation) {
            Ok(guard) => return Ok(guard),
            Err(BridgeError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        let owner = read_owner(dir);
        if !is_stale(dir, owner.as_ref(), stale_after) {
            return Err(held(dir, owner.as_ref()));
        }
        reclaim(dir, operation, stale_after)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.dir.display(), error = %e, "failed to release lock");
            }
        }
    }
}

fn try_create(dir: &Path, operation: &str) -> Result<LockGuard> {
    std::fs::create_dir(dir)?;
    // From here on the guard owns the directory, so a failed owner write
    // still releases it on drop.
    let guard = LockGuard {
        dir: dir.to_path_buf(),
    };
    let owner = LockOwner {
        pid: std::process::id(),
        operation: operation.to_string(),
        acquired_at: Utc::now(),
    };
    std::fs::write(dir.join(LOCK_OWNER_FILE), serde_json::to_vec(&owner)?)?;
    tracing::debug!(path = %dir.display(), operation, "lock acquired");
    Ok(guard)
}

/// Replace a stale lock with our own, holding the reclaim flock throughout.
/// Only reclaimers remove a lock they do not own, and they take turns here.
fn reclaim(dir: &Path, operation: &str, stale_after: Duration) -> Result<LockGuard> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(reclaim_path(dir))?;
    let _reclaiming = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| errno)?;

    // A previous reclaimer may have installed a live lock since we looked.
    if dir.exists() {
        let owner = read_owner(dir);
        if !is_stale(dir, owner.as_ref(), stale_after) {
            return Err(held(dir, owner.as_ref()));
        }
        tracing::warn!(
            path = %dir.display(),
            owner_pid = owner.as_ref().map(|o| o.pid),
            "reclaiming stale lock"
        );
        match std::fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    // A plain acquirer may still slip in before us; that is a normal loss.
    match try_create(dir, operation) {
        Ok(guard) => Ok(guard),
        Err(BridgeError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(held(dir, read_owner(dir).as_ref()))
        }
        Err(e) => Err(e),
    }
}

fn reclaim_path(dir: &Path) -> PathBuf {
    let mut name = dir.as_os_str().to_owned();
    name.push(".reclaim");
    PathBuf::from(name)
}

/// Owner record of an existing lock, if readable.
pub fn read_owner(dir: &Path) -> Option<LockOwner> {
    let data = std::fs::read(dir.join(LOCK_OWNER_FILE)).ok()?;
    serde_json::from_slice(&data).ok()
}

fn is_stale(dir: &Path, owner: Option<&LockOwner>, stale_after: Duration) -> bool {
    match owner {
        Some(o) => match process::start_time(o.pid) {
            None => true,
            // The PID was recycled by a process started after the lock was
            // taken. Start times are whole seconds, hence the slack.
            Some(started) => started > o.acquired_at.timestamp().max(0) as u64 + START_TIME_SLACK_SECS,
        },
        // No owner record: either a lock from an older tool that only did
        // mkdir, or an owner mid-write. Age decides.
        None => age(dir).map(|a| a >= stale_after).unwrap_or(false),
    }
}

fn age(dir: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(dir).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn held(dir: &Path, owner: Option<&LockOwner>) -> BridgeError {
    let owner = match owner {
        Some(o) => format!(
            ", owner: pid {} running '{}' since {}",
            o.pid,
            o.operation,
            o.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => String::new(),
    };
    BridgeError::LockHeld {
        path: dir.to_path_buf(),
        owner,
    }
}
