//! Finding and signalling the bridge process.
//!
//! The PID file is a hint: it is trusted only when that PID is alive and its
//! command line still contains the bridge pattern. Otherwise the process
//! table is scanned. More than one match is an error, never a guess.

use std::path::Path;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use serde::Serialize;
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, RefreshKind, System, UpdateKind};

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: String,
    pub uptime_secs: u64,
    pub memory_bytes: u64,
}

fn refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::new()
        .with_cmd(UpdateKind::Always)
        .with_memory()
}

fn snapshot() -> System {
    System::new_with_specifics(RefreshKind::new().with_processes(refresh_kind()))
}

fn command_line(p: &Process) -> String {
    if p.cmd().is_empty() {
        p.name().to_string()
    } else {
        p.cmd().join(" ")
    }
}

fn is_live(p: &Process) -> bool {
    !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

fn info(pid: Pid, p: &Process) -> ProcessInfo {
    ProcessInfo {
        pid: pid.as_u32(),
        command: command_line(p),
        uptime_secs: p.run_time(),
        memory_bytes: p.memory(),
    }
}

/// Read the cached PID, if any. Garbage in the file counts as no PID.
pub fn read_pid_file(pid_file: &Path) -> Option<u32> {
    let data = std::fs::read_to_string(pid_file).ok()?;
    data.trim().parse().ok()
}

/// Locate the single running process whose command line contains `pattern`.
pub fn locate(pattern: &str, pid_file: &Path) -> Result<Option<ProcessInfo>> {
    let system = snapshot();

    if let Some(cached) = read_pid_file(pid_file) {
        if let Some(p) = system.process(Pid::from_u32(cached)) {
            if is_live(p) && command_line(p).contains(pattern) {
                return Ok(Some(info(Pid::from_u32(cached), p)));
            }
        }
        tracing::debug!(pid = cached, "pid file is stale; scanning process table");
    }

    let mut matches = scan(&system, pattern);
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        _ => Err(BridgeError::AmbiguousProcess(
            matches.iter().map(|m| m.pid).collect(),
        )),
    }
}

fn scan(system: &System, pattern: &str) -> Vec<ProcessInfo> {
    let own = std::process::id();
    let candidates: Vec<(&Pid, &Process)> = system
        .processes()
        .iter()
        .filter(|(pid, p)| pid.as_u32() != own && is_live(p))
        .filter(|(_, p)| command_line(p).contains(pattern))
        .collect();

    // Threads and forks of the bridge carry its command line too; only the
    // outermost matching process counts.
    let mut found: Vec<ProcessInfo> = candidates
        .iter()
        .filter(|(_, p)| {
            p.parent()
                .map(|parent| !candidates.iter().any(|(pid, _)| **pid == parent))
                .unwrap_or(true)
        })
        .map(|(pid, p)| info(**pid, p))
        .collect();
    found.sort_by_key(|p| p.pid);
    found
}

/// True if `pid` exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    if !system.refresh_process_specifics(pid, ProcessRefreshKind::new()) {
        return false;
    }
    system.process(pid).map(is_live).unwrap_or(false)
}

/// Start time of a live `pid`, in seconds since the Unix epoch.
pub fn start_time(pid: u32) -> Option<u64> {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    if !system.refresh_process_specifics(pid, ProcessRefreshKind::new()) {
        return None;
    }
    system
        .process(pid)
        .filter(|p| is_live(p))
        .map(|p| p.start_time())
}

/// Deliver `sig` to `pid`. A process that is already gone is not an error.
pub fn send_signal(pid: u32, sig: Signal) -> Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| BridgeError::InvalidConfig(format!("pid {pid} out of range")))?;
    match signal::kill(NixPid::from_raw(raw), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
