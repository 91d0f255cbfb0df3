use crate::output::print_json;
use bridgectl_core::controller::{StartOutcome, StopOutcome};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let controller = super::controller(root)?;
    let outcome = controller.start()?;

    if json {
        return print_json(&outcome);
    }
    print_start(&outcome);
    Ok(())
}

pub(crate) fn print_start(outcome: &StartOutcome) {
    if let Some(stopped) = &outcome.replaced {
        if *stopped != StopOutcome::NotRunning {
            println!("Stopped existing instance first.");
        }
        super::stop::print_stop(stopped);
    }
    if let Some(pending) = &outcome.upgrade_pending {
        eprintln!(
            "warning: upgrade pending since {}: {}",
            pending.since.format("%Y-%m-%d %H:%M"),
            pending.reason
        );
    }
    let how = if outcome.supervised {
        " under the service manager"
    } else {
        ""
    };
    println!("Bridge started{how} (pid {}).", outcome.pid);
}
