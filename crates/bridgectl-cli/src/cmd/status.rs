use crate::output::{format_uptime, print_fields, print_json};
use bridgectl_core::service::Backend;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let controller = super::controller(root)?;
    let report = controller.status()?;

    if json {
        return print_json(&report);
    }

    let mut fields = Vec::new();
    match &report.process {
        Some(p) => {
            fields.push(("status", "running".to_string()));
            fields.push(("pid", p.pid.to_string()));
            fields.push(("uptime", format_uptime(p.uptime_secs)));
            fields.push(("memory", format!("{:.1} MiB", p.memory_bytes as f64 / 1_048_576.0)));
            fields.push(("command", p.command.clone()));
        }
        None => fields.push(("status", "stopped".to_string())),
    }

    let supervision = match (report.backend, report.supervision_installed) {
        (Some(Backend::Launchd), true) => "installed (launchd)".to_string(),
        (Some(Backend::Systemd), true) => "installed (systemd --user)".to_string(),
        (Some(_), false) => "not installed".to_string(),
        (None, _) => "unavailable on this platform".to_string(),
    };
    fields.push(("supervision", supervision));

    if let Some(owner) = &report.lock_owner {
        fields.push((
            "lock",
            format!(
                "held by {} (pid {}) since {}",
                owner.operation,
                owner.pid,
                owner.acquired_at.format("%H:%M:%S")
            ),
        ));
    }
    if let Some(req) = &report.restart_requested {
        fields.push((
            "restart",
            format!(
                "requested {} ({} new commit(s))",
                req.requested_at.format("%Y-%m-%d %H:%M"),
                req.commits
            ),
        ));
    }
    if let Some(pending) = &report.upgrade_pending {
        fields.push(("upgrade", format!("pending: {}", pending.reason)));
    }

    print_fields(&fields);
    Ok(())
}
