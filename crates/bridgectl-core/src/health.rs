//! Health heuristic: the bridge must be running, and the tail of its error
//! log must be free of error keywords. There is no readiness probe into the
//! process itself.

use std::path::Path;

use serde::Serialize;

use crate::config::Config;
use crate::error::Result;
use crate::markers::RestartRequest;
use crate::process::ProcessInfo;
use crate::{io, paths};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub running: bool,
    pub pid: Option<u32>,
    /// Error-log lines that matched a keyword.
    pub recent_errors: Vec<String>,
    pub restart_requested: bool,
    pub issues: Vec<String>,
}

/// Evaluate health from already-gathered facts.
pub fn assess(
    process: Option<&ProcessInfo>,
    error_tail: &[String],
    keywords: &[String],
    restart_requested: bool,
) -> HealthReport {
    let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    let recent_errors: Vec<String> = error_tail
        .iter()
        .filter(|line| {
            let l = line.to_lowercase();
            lowered.iter().any(|k| !k.is_empty() && l.contains(k.as_str()))
        })
        .cloned()
        .collect();

    let mut issues = Vec::new();
    if process.is_none() {
        issues.push("bridge is not running".to_string());
    }
    if !recent_errors.is_empty() {
        issues.push(format!(
            "{} recent error-log line(s) mention errors, exceptions or disconnects",
            recent_errors.len()
        ));
    }

    HealthReport {
        healthy: issues.is_empty(),
        running: process.is_some(),
        pid: process.map(|p| p.pid),
        recent_errors,
        restart_requested,
        issues,
    }
}

/// Gather the error-log tail and markers for `root` and assess them.
pub fn check(root: &Path, config: &Config, process: Option<&ProcessInfo>) -> Result<HealthReport> {
    let tail = io::tail_lines(&paths::bridge_error_log_path(root), config.health.tail_lines)?;
    let restart_requested = RestartRequest::read(root)?.is_some();
    Ok(assess(
        process,
        &tail,
        &config.health.keywords,
        restart_requested,
    ))
}
