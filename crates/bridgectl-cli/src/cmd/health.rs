use crate::output::print_json;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let controller = super::controller(root)?;
    let report = controller.health()?;

    if json {
        print_json(&report)?;
    } else if report.healthy {
        println!(
            "Bridge healthy (pid {}).",
            report.pid.map(|p| p.to_string()).unwrap_or_default()
        );
    } else {
        for issue in &report.issues {
            println!("[unhealthy] {issue}");
        }
        for line in &report.recent_errors {
            println!("  {line}");
        }
    }
    if report.restart_requested && !json {
        println!("A restart is pending and will be applied when the bridge is idle.");
    }

    if !report.healthy {
        anyhow::bail!("bridge is unhealthy");
    }
    Ok(())
}
