use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const DATA_DIR: &str = "data";
pub const LOGS_DIR: &str = "logs";

pub const PID_FILE: &str = "data/bridge.pid";
pub const START_LOCK: &str = "data/bridge-start.lock";
pub const UPDATE_LOCK: &str = "data/update.lock";
pub const RESTART_REQUESTED: &str = "data/restart-requested";
pub const UPGRADE_PENDING: &str = "data/upgrade-pending";

pub const BRIDGE_LOG: &str = "logs/bridge.log";
pub const BRIDGE_ERROR_LOG: &str = "logs/bridge.error.log";
pub const UPDATE_LOG: &str = "logs/update.log";
pub const WATCHDOG_LOG: &str = "logs/watchdog.log";

pub const CONFIG_FILE: &str = "bridgectl.yaml";

/// File written inside a lock directory naming its holder.
pub const LOCK_OWNER_FILE: &str = "owner.json";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn data_dir(root: &Path) -> PathBuf {
    root.join(DATA_DIR)
}

pub fn logs_dir(root: &Path) -> PathBuf {
    root.join(LOGS_DIR)
}

pub fn pid_path(root: &Path) -> PathBuf {
    root.join(PID_FILE)
}

pub fn start_lock_path(root: &Path) -> PathBuf {
    root.join(START_LOCK)
}

pub fn update_lock_path(root: &Path) -> PathBuf {
    root.join(UPDATE_LOCK)
}

pub fn restart_requested_path(root: &Path) -> PathBuf {
    root.join(RESTART_REQUESTED)
}

pub fn upgrade_pending_path(root: &Path) -> PathBuf {
    root.join(UPGRADE_PENDING)
}

pub fn bridge_log_path(root: &Path) -> PathBuf {
    root.join(BRIDGE_LOG)
}

pub fn bridge_error_log_path(root: &Path) -> PathBuf {
    root.join(BRIDGE_ERROR_LOG)
}

pub fn update_log_path(root: &Path) -> PathBuf {
    root.join(UPDATE_LOG)
}

pub fn watchdog_log_path(root: &Path) -> PathBuf {
    root.join(WATCHDOG_LOG)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        let root = Path::new("/srv/valor");
        assert_eq!(pid_path(root), PathBuf::from("/srv/valor/data/bridge.pid"));
        assert_eq!(
            start_lock_path(root),
            PathBuf::from("/srv/valor/data/bridge-start.lock")
        );
        assert_eq!(
            update_lock_path(root),
            PathBuf::from("/srv/valor/data/update.lock")
        );
        assert_eq!(
            bridge_error_log_path(root),
            PathBuf::from("/srv/valor/logs/bridge.error.log")
        );
    }
}
