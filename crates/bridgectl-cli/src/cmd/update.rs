use crate::output::{print_json, stamp};
use bridgectl_core::updater::{short, DepsSync, StashState, Updater};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let outcome = Updater::new(root, &config).run()?;

    if json {
        return print_json(&outcome);
    }

    let now = stamp();
    if outcome.up_to_date() {
        println!("[{now}] Already up to date ({}).", short(&outcome.to));
        return Ok(());
    }

    println!(
        "[{now}] Updated {}..{} ({} commit(s), {} file(s) changed).",
        short(&outcome.from),
        short(&outcome.to),
        outcome.commits,
        outcome.changed_files.len()
    );
    match &outcome.deps {
        DepsSync::Skipped => println!("[{now}] Dependencies unchanged."),
        DepsSync::Synced => println!("[{now}] Dependencies reinstalled."),
        DepsSync::Failed { detail } => {
            eprintln!("[{now}] warning: dependency install failed; upgrade left pending: {detail}")
        }
    }
    if outcome.stash == StashState::Conflict {
        eprintln!(
            "[{now}] warning: local changes conflicted with the update; \
             they are kept in `git stash list` and need manual resolution"
        );
    }
    if outcome.restart_requested {
        println!("[{now}] Restart requested; the bridge restarts when idle.");
    }
    Ok(())
}
