//! Start / stop / restart / status for the single bridge process.
//!
//! Every mutating operation holds `data/bridge-start.lock` for its whole
//! duration; restart holds it once across stop and start. Start and stop are
//! idempotent: start on a running bridge restarts it, stop on a stopped
//! bridge succeeds.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use serde::Serialize;

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::health::{self, HealthReport};
use crate::lock::{self, LockGuard, LockOwner};
use crate::markers::{RestartRequest, UpgradePending};
use crate::process::{self, ProcessInfo};
use crate::service::{Backend, ServiceManager, BRIDGE_JOB};
use crate::{command, io, paths};

/// How long to wait for a SIGKILLed process to leave the process table.
const KILL_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: u32, waited_ms: u64 },
    /// The bridge ignored SIGTERM for the whole timeout and was SIGKILLed.
    Forced { pid: u32, timeout_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartOutcome {
    pub pid: u32,
    /// Present when a running instance was stopped first.
    pub replaced: Option<StopOutcome>,
    pub supervised: bool,
    pub upgrade_pending: Option<UpgradePending>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestartOutcome {
    pub stopped: StopOutcome,
    pub started: StartOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub process: Option<ProcessInfo>,
    pub supervision_installed: bool,
    pub backend: Option<Backend>,
    pub lock_owner: Option<LockOwner>,
    pub restart_requested: Option<RestartRequest>,
    pub upgrade_pending: Option<UpgradePending>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct Controller {
    root: PathBuf,
    config: Config,
    supervisor: Option<ServiceManager>,
}

impl Controller {
    pub fn new(root: impl Into<PathBuf>, config: Config) -> Self {
        let supervisor = ServiceManager::for_config(&config).ok();
        Self {
            root: root.into(),
            config,
            supervisor,
        }
    }

    /// Replace the detected service manager (`None` disables supervision).
    pub fn with_supervisor(mut self, supervisor: Option<ServiceManager>) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn bridge_label(&self) -> String {
        self.config.service.label(BRIDGE_JOB)
    }

    /// The service manager, if the bridge job is installed with it.
    fn supervising(&self) -> Option<&ServiceManager> {
        self.supervisor
            .as_ref()
            .filter(|m| m.is_installed(&self.bridge_label()))
    }

    pub fn locate(&self) -> Result<Option<ProcessInfo>> {
        process::locate(self.config.bridge.pattern(), &paths::pid_path(&self.root))
    }

    pub fn lock(&self, operation: &str) -> Result<LockGuard> {
        LockGuard::acquire(
            &paths::start_lock_path(&self.root),
            operation,
            self.config.lock.stale_after(),
        )
    }

    // -----------------------------------------------------------------------
    // start
    // -----------------------------------------------------------------------

    pub fn start(&self) -> Result<StartOutcome> {
        let _lock = self.lock("start")?;
        self.start_locked()
    }

    /// Start with the start lock already held by the caller.
    pub(crate) fn start_locked(&self) -> Result<StartOutcome> {
        // Preconditions come first so a broken environment never takes
        // down a bridge that is currently running.
        self.check_preconditions()?;

        let replaced = match self.locate()? {
            Some(existing) => {
                tracing::info!(pid = existing.pid, "bridge already running; stopping it first");
                Some(self.stop_locked()?)
            }
            None => None,
        };

        let upgrade_pending = UpgradePending::read(&self.root)?;
        if let Some(p) = &upgrade_pending {
            tracing::warn!(reason = %p.reason, "dependency upgrade pending; apply it before relying on this start");
        }

        let supervised = self.supervising().is_some();
        let pid = match self.supervising() {
            Some(manager) => self.launch_supervised(manager)?,
            None => self.launch_direct()?,
        };

        RestartRequest::clear(&self.root)?;
        tracing::info!(pid, supervised, "bridge started");

        Ok(StartOutcome {
            pid,
            replaced,
            supervised,
            upgrade_pending,
        })
    }

    /// Fail before any side effect if the bridge could not be started.
    pub(crate) fn check_preconditions(&self) -> Result<()> {
        for pre in &self.config.bridge.preconditions {
            if !self.root.join(&pre.path).exists() {
                return Err(BridgeError::PreconditionFailed {
                    artifact: pre.path.clone(),
                    remedy: pre.remedy.clone(),
                });
            }
        }
        if let Some(check) = &self.config.deps.check {
            let out = command::run_allow_failure(check, &self.root)?;
            if !out.success {
                tracing::debug!(detail = %out.detail(), "dependency check failed");
                return Err(BridgeError::PreconditionFailed {
                    artifact: format!("installed dependencies (`{}` failed)", check.join(" ")),
                    remedy: self.config.deps.install.join(" "),
                });
            }
        }
        Ok(())
    }

    fn launch_direct(&self) -> Result<u32> {
        let program = self.config.bridge.program_path(&self.root);
        let stdout = io::open_append(&paths::bridge_log_path(&self.root))?;
        let stderr = io::open_append(&paths::bridge_error_log_path(&self.root))?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.config.bridge.args)
            .current_dir(&self.root)
            .envs(&self.config.bridge.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }

        let mut child = cmd.spawn().map_err(|e| BridgeError::CommandFailed {
            program: program.display().to_string(),
            detail: e.to_string(),
        })?;
        let pid = child.id();
        io::atomic_write(&paths::pid_path(&self.root), pid.to_string().as_bytes())?;
        tracing::debug!(pid, program = %program.display(), "bridge launched; settling");

        std::thread::sleep(self.config.timing.settle());

        if let Some(status) = child.try_wait()? {
            tracing::warn!(pid, %status, "bridge exited during settle period");
            return self.start_failed();
        }
        match self.locate()? {
            Some(found) => Ok(found.pid),
            None => self.start_failed(),
        }
    }

    fn launch_supervised(&self, manager: &ServiceManager) -> Result<u32> {
        let label = self.bridge_label();
        tracing::debug!(label = %label, "starting bridge through service manager");
        manager.start(&label)?;

        std::thread::sleep(self.config.timing.settle());

        match self.locate()? {
            Some(found) => {
                io::atomic_write(&paths::pid_path(&self.root), found.pid.to_string().as_bytes())?;
                Ok(found.pid)
            }
            None => self.start_failed(),
        }
    }

    fn start_failed<T>(&self) -> Result<T> {
        io::remove_if_exists(&paths::pid_path(&self.root))?;
        Err(BridgeError::StartFailed {
            error_log: paths::bridge_error_log_path(&self.root),
        })
    }

    // -----------------------------------------------------------------------
    // stop
    // -----------------------------------------------------------------------

    pub fn stop(&self) -> Result<StopOutcome> {
        let _lock = self.lock("stop")?;
        self.stop_locked()
    }

    /// Stop with the start lock already held by the caller.
    pub(crate) fn stop_locked(&self) -> Result<StopOutcome> {
        let found = self.locate()?;

        // Keep the service manager from respawning what we are stopping.
        if let Some(manager) = self.supervising() {
            manager.stop(&self.bridge_label())?;
        }

        let Some(found) = found else {
            io::remove_if_exists(&paths::pid_path(&self.root))?;
            return Ok(StopOutcome::NotRunning);
        };
        let pid = found.pid;

        process::send_signal(pid, Signal::SIGTERM)?;
        let timeout = self.config.timing.stop_timeout();
        let started = Instant::now();
        let outcome = if self.wait_for_exit(pid, timeout) {
            StopOutcome::Stopped {
                pid,
                waited_ms: started.elapsed().as_millis() as u64,
            }
        } else {
            tracing::warn!(pid, timeout_secs = timeout.as_secs(), "bridge ignored SIGTERM; sending SIGKILL");
            process::send_signal(pid, Signal::SIGKILL)?;
            if !self.wait_for_exit(pid, KILL_GRACE) {
                tracing::warn!(pid, "bridge still present after SIGKILL");
            }
            StopOutcome::Forced {
                pid,
                timeout_secs: timeout.as_secs(),
            }
        };

        io::remove_if_exists(&paths::pid_path(&self.root))?;
        tracing::info!(pid, "bridge stopped");
        Ok(outcome)
    }

    fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !process::is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.config.timing.poll_interval());
        }
    }

    // -----------------------------------------------------------------------
    // restart / status / health
    // -----------------------------------------------------------------------

    pub fn restart(&self) -> Result<RestartOutcome> {
        let _lock = self.lock("restart")?;
        self.check_preconditions()?;
        let stopped = self.stop_locked()?;
        let started = self.start_locked()?;
        Ok(RestartOutcome { stopped, started })
    }

    pub fn status(&self) -> Result<StatusReport> {
        let process = self.locate()?;
        let start_lock = paths::start_lock_path(&self.root);
        let lock_owner = if start_lock.is_dir() {
            lock::read_owner(&start_lock)
        } else {
            None
        };
        Ok(StatusReport {
            running: process.is_some(),
            process,
            supervision_installed: self.supervising().is_some(),
            backend: self.supervisor.as_ref().map(|m| m.backend()),
            lock_owner,
            restart_requested: RestartRequest::read(&self.root)?,
            upgrade_pending: UpgradePending::read(&self.root)?,
        })
    }

    pub fn health(&self) -> Result<HealthReport> {
        let process = self.locate()?;
        health::check(&self.root, &self.config, process.as_ref())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A project root with a shell-script bridge and fast timings.
    pub(crate) fn fixture(script: &str) -> (TempDir, Controller) {
        let dir = TempDir::new().unwrap();
        let script_path = dir.path().join("bridge.sh");
        std::fs::write(&script_path, script).unwrap();

        let mut config = Config::default();
        config.bridge.program = "/bin/sh".to_string();
        config.bridge.args = vec![script_path.display().to_string()];
        config.bridge.preconditions.clear();
        config.timing.settle_secs = 1;
        config.timing.stop_timeout_secs = 2;
        config.timing.poll_interval_ms = 100;

        let controller = Controller::new(dir.path(), config).with_supervisor(None);
        (dir, controller)
    }

    pub(crate) const LOOP: &str = "while true; do sleep 1; done\n";

    #[test]
    fn stop_when_not_running_is_ok() {
        let (_dir, controller) = fixture(LOOP);
        assert_eq!(controller.stop().unwrap(), StopOutcome::NotRunning);
    }

    #[test]
    fn start_writes_pid_and_stop_removes_it() {
        let (dir, controller) = fixture(LOOP);
        let started = controller.start().unwrap();
        assert!(started.replaced.is_none());
        assert_eq!(
            process::read_pid_file(&paths::pid_path(dir.path())),
            Some(started.pid)
        );
        assert!(!paths::start_lock_path(dir.path()).exists());

        let stopped = controller.stop().unwrap();
        assert!(matches!(stopped, StopOutcome::Stopped { pid, .. } if pid == started.pid));
        assert!(!paths::pid_path(dir.path()).exists());
        assert!(controller.locate().unwrap().is_none());
    }

    #[test]
    fn start_twice_replaces_existing_instance() {
        let (_dir, controller) = fixture(LOOP);
        let first = controller.start().unwrap();
        let second = controller.start().unwrap();
        assert!(matches!(
            second.replaced,
            Some(StopOutcome::Stopped { pid, .. }) if pid == first.pid
        ));
        assert_ne!(first.pid, second.pid);
        assert_eq!(controller.locate().unwrap().map(|p| p.pid), Some(second.pid));
        controller.stop().unwrap();
    }

    #[test]
    fn stop_escalates_when_term_is_ignored() {
        let (_dir, controller) = fixture("trap '' TERM\nwhile true; do sleep 1; done\n");
        let started = controller.start().unwrap();
        let stopped = controller.stop().unwrap();
        assert_eq!(
            stopped,
            StopOutcome::Forced {
                pid: started.pid,
                timeout_secs: 2
            }
        );
        assert!(!process::is_alive(started.pid));
    }

    #[test]
    fn start_reports_early_exit() {
        let (dir, controller) = fixture("echo 'fatal: bad token' >&2\nexit 1\n");
        let err = controller.start().unwrap_err();
        assert!(matches!(err, BridgeError::StartFailed { .. }));
        assert!(!paths::pid_path(dir.path()).exists());
        let log = std::fs::read_to_string(paths::bridge_error_log_path(dir.path())).unwrap();
        assert!(log.contains("fatal: bad token"));
    }

    #[test]
    fn missing_precondition_aborts_before_launch() {
        let (dir, mut controller) = fixture(LOOP);
        controller.config.bridge.preconditions.push(crate::config::Precondition {
            path: ".env".to_string(),
            remedy: "cp .env.example .env".to_string(),
        });
        let err = controller.start().unwrap_err();
        assert_eq!(err.to_string(), ".env not found, run: cp .env.example .env");
        assert!(!paths::pid_path(dir.path()).exists());
        assert!(controller.locate().unwrap().is_none());
    }

    fn missing_env() -> crate::config::Precondition {
        crate::config::Precondition {
            path: ".env".to_string(),
            remedy: "cp .env.example .env".to_string(),
        }
    }

    #[test]
    fn restart_with_missing_precondition_keeps_bridge_running() {
        let (_dir, mut controller) = fixture(LOOP);
        let started = controller.start().unwrap();

        controller.config.bridge.preconditions.push(missing_env());
        let err = controller.restart().unwrap_err();
        assert!(matches!(err, BridgeError::PreconditionFailed { .. }));
        assert_eq!(controller.locate().unwrap().map(|p| p.pid), Some(started.pid));

        controller.config.bridge.preconditions.clear();
        controller.stop().unwrap();
    }

    #[test]
    fn restart_fails_fast_when_lock_held() {
        let (dir, controller) = fixture(LOOP);
        let started = controller.start().unwrap();
        {
            let _held = controller.lock("update").unwrap();
            let err = controller.restart().unwrap_err();
            assert!(matches!(err, BridgeError::LockHeld { .. }));
            assert_eq!(
                process::read_pid_file(&paths::pid_path(dir.path())),
                Some(started.pid)
            );
        }
        controller.stop().unwrap();
    }

    /// Records the lock owner when the bridge starts and when it is asked to stop.
    const RECORDS_LOCK: &str = "\
record() { cat data/bridge-start.lock/owner.json >> lock-seen; echo >> lock-seen; }
trap 'record; exit 0' TERM
record
while true; do sleep 1 & wait $!; done
";

    #[test]
    fn restart_holds_one_lock_across_stop_and_start() {
        let (dir, controller) = fixture(RECORDS_LOCK);
        controller.start().unwrap();
        controller.restart().unwrap();
        controller.stop().unwrap();

        let seen = std::fs::read_to_string(dir.path().join("lock-seen")).unwrap();
        let owners: Vec<LockOwner> = seen
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        // start, restart's stop, restart's start, final stop
        assert_eq!(owners.len(), 4);
        assert_eq!(owners[0].operation, "start");
        assert_eq!(owners[1].operation, "restart");
        assert_eq!(owners[1], owners[2]);
        assert_eq!(owners[3].operation, "stop");
    }

    #[test]
    fn held_lock_fails_fast_without_side_effects() {
        let (dir, controller) = fixture(LOOP);
        let _held = controller.lock("update").unwrap();
        let began = Instant::now();
        let err = controller.start().unwrap_err();
        assert!(matches!(err, BridgeError::LockHeld { .. }));
        assert!(began.elapsed() < Duration::from_secs(1));
        assert!(!paths::pid_path(dir.path()).exists());
        assert!(controller.locate().unwrap().is_none());
    }

    #[test]
    fn successful_start_clears_restart_request() {
        let (dir, controller) = fixture(LOOP);
        RestartRequest::new(2, "a", "b").write(dir.path()).unwrap();
        controller.start().unwrap();
        assert!(RestartRequest::read(dir.path()).unwrap().is_none());
        controller.stop().unwrap();
    }

    #[test]
    fn status_reports_running_process() {
        let (_dir, controller) = fixture(LOOP);
        let report = controller.status().unwrap();
        assert!(!report.running);
        let started = controller.start().unwrap();
        let report = controller.status().unwrap();
        assert_eq!(report.process.map(|p| p.pid), Some(started.pid));
        assert!(!report.supervision_installed);
        controller.stop().unwrap();
    }
}
