use crate::output::print_json;
use anyhow::Context;
use bridgectl_core::service::{ServiceManager, BRIDGE_JOB, UPDATE_JOB, WATCHDOG_JOB};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let manager = ServiceManager::for_config(&config)?;
    let labels: Vec<String> = [BRIDGE_JOB, UPDATE_JOB, WATCHDOG_JOB]
        .iter()
        .map(|job| config.service.label(job))
        .collect();
    let removed = manager
        .uninstall(&labels)
        .context("failed to unregister jobs")?;

    if json {
        let value = serde_json::json!({ "labels": labels, "removed": removed });
        return print_json(&value);
    }
    if removed.is_empty() {
        println!("No service jobs were installed.");
    }
    for path in &removed {
        println!("Removed {}", path.display());
    }
    Ok(())
}
