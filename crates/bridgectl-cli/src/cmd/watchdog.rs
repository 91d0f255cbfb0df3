use crate::output::{print_json, stamp};
use bridgectl_core::watchdog::{Watchdog, WatchdogAction};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let controller = super::controller(root)?;
    let action = Watchdog::new(&controller).run()?;

    if json {
        return print_json(&action);
    }

    let now = stamp();
    match &action {
        WatchdogAction::Healthy => println!("[{now}] Bridge healthy."),
        WatchdogAction::Started { start } => {
            println!("[{now}] Bridge was down; started (pid {}).", start.pid)
        }
        WatchdogAction::RestartedForUpdate { commits, start, .. } => println!(
            "[{now}] Restarted for update ({commits} commit(s)); new pid {}.",
            start.pid
        ),
        WatchdogAction::RestartDeferred {
            quiet_secs,
            needed_secs,
        } => println!(
            "[{now}] Restart pending; bridge active {quiet_secs}s ago, waiting for {needed_secs}s of quiet."
        ),
        WatchdogAction::Degraded { report } => {
            for issue in &report.issues {
                println!("[{now}] warning: {issue}");
            }
        }
        WatchdogAction::Skipped { reason } => println!("[{now}] Skipped: {reason}"),
    }
    Ok(())
}
