//! Subprocess helpers for the external tools the controller drives:
//! `git`, the dependency installer, and the OS service manager.

use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::{BridgeError, Result};

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    /// stderr if present, else stdout, trimmed and capped for error messages.
    pub fn detail(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        text.trim().chars().take(500).collect()
    }
}

/// Run `argv` in `cwd` and capture its output, whatever the exit status.
/// Only a failure to spawn is an error.
pub fn run_allow_failure(argv: &[String], cwd: &Path) -> Result<CmdOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| BridgeError::InvalidConfig("empty command".to_string()))?;

    tracing::debug!(program = %program, ?args, cwd = %cwd.display(), "running command");

    let output = Command::new(resolve_program(program, cwd))
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| BridgeError::CommandFailed {
            program: program.clone(),
            detail: e.to_string(),
        })?;

    Ok(CmdOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run `argv` in `cwd`; a non-zero exit becomes [`BridgeError::CommandFailed`].
pub fn run(argv: &[String], cwd: &Path) -> Result<CmdOutput> {
    let out = run_allow_failure(argv, cwd)?;
    if !out.success {
        return Err(BridgeError::CommandFailed {
            program: argv.join(" "),
            detail: out.detail(),
        });
    }
    Ok(out)
}

/// `./x` and `.venv/bin/x` are relative to `cwd`; bare names go through `PATH`.
fn resolve_program(program: &str, cwd: &Path) -> std::path::PathBuf {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        cwd.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Build an argv from string slices.
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn run_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let out = run(&argv(&["sh", "-c", "echo hello"]), dir.path()).unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn run_reports_failure_detail() {
        let dir = TempDir::new().unwrap();
        let err = run(&argv(&["sh", "-c", "echo boom >&2; exit 3"]), dir.path()).unwrap_err();
        match err {
            BridgeError::CommandFailed { detail, .. } => assert_eq!(detail, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn run_allow_failure_keeps_exit_code() {
        let dir = TempDir::new().unwrap();
        let out = run_allow_failure(&argv(&["sh", "-c", "exit 7"]), dir.path()).unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(7));
    }

    #[test]
    fn relative_program_resolves_against_cwd() {
        let cwd = Path::new("/srv/valor");
        assert_eq!(
            resolve_program(".venv/bin/pip", cwd),
            Path::new("/srv/valor/.venv/bin/pip")
        );
        assert_eq!(resolve_program("git", cwd), Path::new("git"));
        assert_eq!(resolve_program("/usr/bin/git", cwd), Path::new("/usr/bin/git"));
    }

    #[test]
    fn empty_argv_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(run(&[], dir.path()).is_err());
    }
}
