//! Pull new code without interrupting the bridge.
//!
//! Only fast-forwards are applied. Diverged history is a hard failure and is
//! never merged or rebased automatically. Dependencies are resynced only when
//! a manifest changed. The bridge is never signalled from here: a restart
//! request marker is written instead and honored at the next idle point.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::command::{self, CmdOutput};
use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::lock::LockGuard;
use crate::markers::{RestartRequest, UpgradePending};
use crate::paths;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DepsSync {
    /// No manifest changed; the installer was not run.
    Skipped,
    Synced,
    /// The installer failed; an upgrade-pending marker was written.
    Failed { detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StashState {
    /// The working tree had no local changes.
    Clean,
    Restored,
    /// `git stash pop` conflicted; the changes remain in `git stash list`.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateOutcome {
    pub from: String,
    pub to: String,
    pub commits: u32,
    pub changed_files: Vec<String>,
    pub deps: DepsSync,
    pub restart_requested: bool,
    pub stash: StashState,
}

impl UpdateOutcome {
    pub fn up_to_date(&self) -> bool {
        self.from == self.to
    }

    fn unchanged(rev: String) -> Self {
        Self {
            from: rev.clone(),
            to: rev,
            commits: 0,
            changed_files: Vec::new(),
            deps: DepsSync::Skipped,
            restart_requested: false,
            stash: StashState::Clean,
        }
    }
}

pub struct Updater<'a> {
    root: PathBuf,
    config: &'a Config,
}

impl<'a> Updater<'a> {
    pub fn new(root: &Path, config: &'a Config) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
        }
    }

    pub fn run(&self) -> Result<UpdateOutcome> {
        let _lock = LockGuard::acquire(
            &paths::update_lock_path(&self.root),
            "update",
            self.config.lock.stale_after(),
        )?;

        let from = self.rev_parse("HEAD")?;
        let target = self.fetch()?;
        let to = self.rev_parse(&target)?;

        // Local commits ahead of the remote are left alone, like `pull --ff-only`.
        if from == to || self.is_ancestor(&to, &from)? {
            tracing::info!(rev = %short(&from), "already up to date");
            return Ok(UpdateOutcome::unchanged(from));
        }
        if !self.is_ancestor(&from, &to)? {
            return Err(BridgeError::NonFastForward);
        }

        let stashed = self.stash_if_dirty()?;
        let merged = self.git(&["merge", "--ff-only", &target]);
        let stash = if stashed {
            self.restore_stash()?
        } else {
            StashState::Clean
        };
        merged?;

        let range = format!("{from}..{to}");
        let commits = parse_count(&self.git(&["rev-list", "--count", &range])?.stdout)?;
        let changed_files: Vec<String> = self
            .git(&["diff", "--name-only", &from, &to])?
            .stdout
            .lines()
            .map(|l| l.to_string())
            .collect();
        tracing::info!(from = %short(&from), to = %short(&to), commits, "pulled new commits");

        let deps = self.sync_deps(&changed_files, &to)?;

        let restart_requested = !matches!(deps, DepsSync::Failed { .. });
        if restart_requested {
            RestartRequest::new(commits, from.clone(), to.clone()).write(&self.root)?;
            tracing::info!("restart requested; the bridge restarts at its next idle point");
        }

        Ok(UpdateOutcome {
            from,
            to,
            commits,
            changed_files,
            deps,
            restart_requested,
            stash,
        })
    }

    /// Fetch and return the ref to fast-forward to.
    fn fetch(&self) -> Result<String> {
        let remote = self.config.update.remote.as_str();
        match &self.config.update.branch {
            Some(branch) => {
                self.git(&["fetch", remote, branch])?;
                Ok(format!("{remote}/{branch}"))
            }
            None => {
                self.git(&["fetch", remote])?;
                Ok("@{u}".to_string())
            }
        }
    }

    fn sync_deps(&self, changed: &[String], to: &str) -> Result<DepsSync> {
        let touched: Vec<&String> = changed
            .iter()
            .filter(|f| self.config.deps.manifests.iter().any(|m| m == *f))
            .collect();
        if touched.is_empty() {
            tracing::debug!("no dependency manifest changed; skipping install");
            return Ok(DepsSync::Skipped);
        }

        tracing::info!(manifests = ?touched, "dependency manifests changed; running installer");
        let out = command::run_allow_failure(&self.config.deps.install, &self.root)?;
        if out.success {
            UpgradePending::clear(&self.root)?;
            return Ok(DepsSync::Synced);
        }

        let detail = out.detail();
        tracing::warn!(detail = %detail, "dependency install failed; deferring upgrade");
        UpgradePending::new(format!(
            "dependency install failed after update to {}: {detail}",
            short(to)
        ))
        .write(&self.root)?;
        Ok(DepsSync::Failed { detail })
    }

    fn stash_if_dirty(&self) -> Result<bool> {
        let status = self.git(&["status", "--porcelain", "--untracked-files=no"])?;
        if status.stdout.trim().is_empty() {
            return Ok(false);
        }
        tracing::info!("stashing local changes before update");
        // Stash commits are throwaway; a fixed identity keeps this working on
        // machines with no git user configured.
        self.git(&[
            "-c",
            "user.name=bridgectl",
            "-c",
            "user.email=bridgectl@localhost",
            "stash",
            "push",
            "-m",
            "bridgectl auto-stash before update",
        ])?;
        Ok(true)
    }

    fn restore_stash(&self) -> Result<StashState> {
        let out = self.git_allow_failure(&["stash", "pop"])?;
        if out.success {
            return Ok(StashState::Restored);
        }
        tracing::warn!(
            detail = %out.detail(),
            "could not restore local changes; they remain in `git stash list`"
        );
        Ok(StashState::Conflict)
    }

    fn rev_parse(&self, rev: &str) -> Result<String> {
        Ok(self
            .git(&["rev-parse", "--verify", rev])?
            .stdout
            .trim()
            .to_string())
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let out = self.git_allow_failure(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match out.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(BridgeError::CommandFailed {
                program: "git merge-base".to_string(),
                detail: out.detail(),
            }),
        }
    }

    fn git(&self, args: &[&str]) -> Result<CmdOutput> {
        command::run(&git_argv(args), &self.root)
    }

    fn git_allow_failure(&self, args: &[&str]) -> Result<CmdOutput> {
        command::run_allow_failure(&git_argv(args), &self.root)
    }
}

fn git_argv(args: &[&str]) -> Vec<String> {
    std::iter::once("git")
        .chain(args.iter().copied())
        .map(|s| s.to_string())
        .collect()
}

fn parse_count(stdout: &str) -> Result<u32> {
    stdout
        .trim()
        .parse()
        .map_err(|e| BridgeError::CommandFailed {
            program: "git rev-list --count".to_string(),
            detail: format!("unexpected output {:?}: {e}", stdout.trim()),
        })
}

/// Abbreviated commit id for display.
pub fn short(rev: &str) -> &str {
    &rev[..rev.len().min(8)]
}
