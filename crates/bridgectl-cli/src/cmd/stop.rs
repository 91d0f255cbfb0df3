use crate::output::print_json;
use bridgectl_core::controller::StopOutcome;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let controller = super::controller(root)?;
    let outcome = controller.stop()?;

    if json {
        return print_json(&outcome);
    }
    print_stop(&outcome);
    Ok(())
}

pub(crate) fn print_stop(outcome: &StopOutcome) {
    match outcome {
        StopOutcome::NotRunning => println!("Bridge not running."),
        StopOutcome::Stopped { pid, waited_ms } => {
            println!("Bridge stopped (pid {pid}, {:.1}s).", *waited_ms as f64 / 1000.0)
        }
        StopOutcome::Forced { pid, timeout_secs } => {
            eprintln!(
                "warning: bridge (pid {pid}) ignored SIGTERM for {timeout_secs}s; sent SIGKILL"
            );
            println!("Bridge stopped (pid {pid}, forced).");
        }
    }
}
