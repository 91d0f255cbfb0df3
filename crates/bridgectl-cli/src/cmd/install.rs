use crate::output::print_json;
use anyhow::Context;
use bridgectl_core::service::{self, Backend, ServiceManager};
use std::path::Path;

pub fn run(root: &Path, dry_run: bool, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let exe = std::env::current_exe().context("cannot locate the bridgectl binary")?;
    let jobs = service::jobs(root, &config, &exe)?;

    if dry_run {
        if json {
            return print_json(&jobs);
        }
        for job in &jobs {
            match Backend::detect()? {
                Backend::Launchd => {
                    println!("# {}.plist", job.label);
                    print!("{}", service::render_launchd_plist(job));
                }
                Backend::Systemd => {
                    let units = service::render_systemd_units(job);
                    println!("# {}.service", job.label);
                    print!("{}", units.service);
                    if let Some(timer) = units.timer {
                        println!("# {}.timer", job.label);
                        print!("{timer}");
                    }
                }
            }
        }
        return Ok(());
    }

    let manager = ServiceManager::for_config(&config)?;
    let written = manager
        .install(&jobs)
        .context("failed to register jobs with the service manager")?;

    if json {
        let value = serde_json::json!({
            "backend": manager.backend(),
            "labels": jobs.iter().map(|j| &j.label).collect::<Vec<_>>(),
            "files": written,
        });
        return print_json(&value);
    }
    for job in &jobs {
        println!("Installed {}", job.label);
    }
    for path in &written {
        println!("  {}", path.display());
    }
    Ok(())
}
