//! OS supervision descriptors for the bridge and its periodic jobs.
//!
//! Three jobs are generated: the bridge itself (started at load, restarted on
//! exit with a throttle), the updater (fixed times of day) and the watchdog
//! (fixed interval). macOS gets launchd plists in `~/Library/LaunchAgents`,
//! Linux gets systemd user units in `~/.config/systemd/user`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::command::{self, argv};
use crate::config::{Config, TimeOfDay};
use crate::error::{BridgeError, Result};
use crate::paths;

pub const BRIDGE_JOB: &str = "bridge";
pub const UPDATE_JOB: &str = "update";
pub const WATCHDOG_JOB: &str = "watchdog";

const DEFAULT_PATH: &str = "/opt/homebrew/bin:/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

// ---------------------------------------------------------------------------
// Job model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Run at load and restart whenever it exits, at most once per `throttle_secs`.
    KeepAlive { throttle_secs: u64 },
    /// Run at each listed time of day.
    Daily { times: Vec<TimeOfDay> },
    /// Run every `secs` seconds.
    Interval { secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceJob {
    pub label: String,
    pub program_arguments: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub schedule: Schedule,
}

/// Build the bridge, updater and watchdog jobs. `controller` is the path of
/// the `bridgectl` binary the periodic jobs invoke.
pub fn jobs(root: &Path, config: &Config, controller: &Path) -> Result<Vec<ServiceJob>> {
    let mut base_env = BTreeMap::new();
    base_env.insert(
        "PATH".to_string(),
        std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
    );
    let home = home::home_dir().ok_or(BridgeError::HomeNotFound)?;
    base_env.insert("HOME".to_string(), home.display().to_string());

    let mut bridge_env = base_env.clone();
    bridge_env.extend(config.bridge.env.clone());

    let mut bridge_args = vec![config.bridge.program_path(root).display().to_string()];
    bridge_args.extend(config.bridge.args.iter().cloned());

    let controller_args = |sub: &str| {
        vec![
            controller.display().to_string(),
            "--root".to_string(),
            root.display().to_string(),
            sub.to_string(),
        ]
    };

    Ok(vec![
        ServiceJob {
            label: config.service.label(BRIDGE_JOB),
            program_arguments: bridge_args,
            working_dir: root.to_path_buf(),
            env: bridge_env,
            stdout: paths::bridge_log_path(root),
            stderr: paths::bridge_error_log_path(root),
            schedule: Schedule::KeepAlive {
                throttle_secs: config.service.throttle_secs,
            },
        },
        ServiceJob {
            label: config.service.label(UPDATE_JOB),
            program_arguments: controller_args(UPDATE_JOB),
            working_dir: root.to_path_buf(),
            env: base_env.clone(),
            stdout: paths::update_log_path(root),
            stderr: paths::update_log_path(root),
            schedule: Schedule::Daily {
                times: config.service.parsed_update_times()?,
            },
        },
        ServiceJob {
            label: config.service.label(WATCHDOG_JOB),
            program_arguments: controller_args(WATCHDOG_JOB),
            working_dir: root.to_path_buf(),
            env: base_env,
            stdout: paths::watchdog_log_path(root),
            stderr: paths::watchdog_log_path(root),
            schedule: Schedule::Interval {
                secs: config.service.watchdog_interval_secs,
            },
        },
    ])
}

// ---------------------------------------------------------------------------
// launchd
// ---------------------------------------------------------------------------

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn render_launchd_plist(job: &ServiceJob) -> String {
    let mut body = String::new();
    let mut key = |k: &str, v: String| {
        body.push_str(&format!("    <key>{k}</key>\n{v}"));
    };
    let string = |s: &str| format!("    <string>{}</string>\n", xml_escape(s));

    key("Label", string(&job.label));

    let mut args = String::from("    <array>\n");
    for a in &job.program_arguments {
        args.push_str(&format!("        <string>{}</string>\n", xml_escape(a)));
    }
    args.push_str("    </array>\n");
    key("ProgramArguments", args);

    key(
        "WorkingDirectory",
        string(&job.working_dir.display().to_string()),
    );

    let mut env = String::from("    <dict>\n");
    for (k, v) in &job.env {
        env.push_str(&format!(
            "        <key>{}</key>\n        <string>{}</string>\n",
            xml_escape(k),
            xml_escape(v)
        ));
    }
    env.push_str("    </dict>\n");
    key("EnvironmentVariables", env);

    key("StandardOutPath", string(&job.stdout.display().to_string()));
    key("StandardErrorPath", string(&job.stderr.display().to_string()));

    match &job.schedule {
        Schedule::KeepAlive { throttle_secs } => {
            key("RunAtLoad", "    <true/>\n".to_string());
            key("KeepAlive", "    <true/>\n".to_string());
            key(
                "ThrottleInterval",
                format!("    <integer>{throttle_secs}</integer>\n"),
            );
        }
        Schedule::Daily { times } => {
            let mut cal = String::from("    <array>\n");
            for t in times {
                cal.push_str(&format!(
                    "        <dict>\n            <key>Hour</key>\n            <integer>{}</integer>\n            <key>Minute</key>\n            <integer>{}</integer>\n        </dict>\n",
                    t.hour, t.minute
                ));
            }
            cal.push_str("    </array>\n");
            key("StartCalendarInterval", cal);
        }
        Schedule::Interval { secs } => {
            key("StartInterval", format!("    <integer>{secs}</integer>\n"));
        }
    }

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
         <plist version=\"1.0\">\n<dict>\n{body}</dict>\n</plist>\n"
    )
}

// ---------------------------------------------------------------------------
// systemd
// ---------------------------------------------------------------------------

fn systemd_quote(arg: &str) -> String {
    if !arg.is_empty()
        && !arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | '%' | '$'))
    {
        return arg.to_string();
    }
    let mut out = String::from("\"");
    for c in arg.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '%' => out.push_str("%%"),
            '$' => out.push_str("$$"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// A rendered systemd unit set: the `.service` and, for scheduled jobs, a `.timer`.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemdUnits {
    pub service: String,
    pub timer: Option<String>,
}

pub fn render_systemd_units(job: &ServiceJob) -> SystemdUnits {
    let exec: Vec<String> = job.program_arguments.iter().map(|a| systemd_quote(a)).collect();
    let mut service = format!("[Unit]\nDescription={}\n\n[Service]\n", job.label);

    match &job.schedule {
        Schedule::KeepAlive { throttle_secs } => {
            service.push_str("Type=simple\n");
            service.push_str("Restart=always\n");
            service.push_str(&format!("RestartSec={throttle_secs}\n"));
        }
        Schedule::Daily { .. } | Schedule::Interval { .. } => {
            service.push_str("Type=oneshot\n");
        }
    }
    service.push_str(&format!(
        "WorkingDirectory={}\n",
        systemd_quote(&job.working_dir.display().to_string())
    ));
    for (k, v) in &job.env {
        service.push_str(&format!("Environment={}\n", systemd_quote(&format!("{k}={v}"))));
    }
    service.push_str(&format!("ExecStart={}\n", exec.join(" ")));
    service.push_str(&format!("StandardOutput=append:{}\n", job.stdout.display()));
    service.push_str(&format!("StandardError=append:{}\n", job.stderr.display()));

    let timer = match &job.schedule {
        Schedule::KeepAlive { .. } => {
            service.push_str("\n[Install]\nWantedBy=default.target\n");
            None
        }
        Schedule::Daily { times } => {
            let mut t = format!("[Unit]\nDescription={} schedule\n\n[Timer]\n", job.label);
            for time in times {
                t.push_str(&format!("OnCalendar=*-*-* {time}:00\n"));
            }
            t.push_str("Persistent=true\n");
            t.push_str(&format!("Unit={}.service\n", job.label));
            t.push_str("\n[Install]\nWantedBy=timers.target\n");
            Some(t)
        }
        Schedule::Interval { secs } => {
            let mut t = format!("[Unit]\nDescription={} schedule\n\n[Timer]\n", job.label);
            t.push_str(&format!("OnBootSec={secs}\n"));
            t.push_str(&format!("OnUnitActiveSec={secs}\n"));
            t.push_str(&format!("Unit={}.service\n", job.label));
            t.push_str("\n[Install]\nWantedBy=timers.target\n");
            Some(t)
        }
    };

    SystemdUnits { service, timer }
}

// ---------------------------------------------------------------------------
// ServiceManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Launchd,
    Systemd,
}

impl Backend {
    pub fn detect() -> Result<Self> {
        if cfg!(target_os = "macos") {
            Ok(Backend::Launchd)
        } else if cfg!(target_os = "linux") {
            Ok(Backend::Systemd)
        } else {
            Err(BridgeError::UnsupportedPlatform)
        }
    }

    fn default_dir(self) -> Result<PathBuf> {
        let home = home::home_dir().ok_or(BridgeError::HomeNotFound)?;
        Ok(match self {
            Backend::Launchd => home.join("Library/LaunchAgents"),
            Backend::Systemd => home.join(".config/systemd/user"),
        })
    }
}

/// Registers jobs with the OS service manager and controls them by label.
#[derive(Debug, Clone)]
pub struct ServiceManager {
    backend: Backend,
    dir: PathBuf,
}

impl ServiceManager {
    pub fn new(backend: Backend, dir: PathBuf) -> Self {
        Self { backend, dir }
    }

    pub fn for_config(config: &Config) -> Result<Self> {
        let backend = Backend::detect()?;
        let dir = match &config.service.install_dir {
            Some(d) => PathBuf::from(d),
            None => backend.default_dir()?,
        };
        Ok(Self::new(backend, dir))
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Path of the primary descriptor for `label` (plist or `.service`).
    pub fn descriptor_path(&self, label: &str) -> PathBuf {
        match self.backend {
            Backend::Launchd => self.dir.join(format!("{label}.plist")),
            Backend::Systemd => self.dir.join(format!("{label}.service")),
        }
    }

    fn timer_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}.timer"))
    }

    pub fn is_installed(&self, label: &str) -> bool {
        self.descriptor_path(label).exists()
    }

    /// Render and write the descriptors for `job` without registering them.
    pub fn write_descriptors(&self, job: &ServiceJob) -> Result<Vec<PathBuf>> {
        crate::io::ensure_dir(&self.dir)?;
        let mut written = Vec::new();
        match self.backend {
            Backend::Launchd => {
                let path = self.descriptor_path(&job.label);
                crate::io::atomic_write(&path, render_launchd_plist(job).as_bytes())?;
                written.push(path);
            }
            Backend::Systemd => {
                let units = render_systemd_units(job);
                let path = self.descriptor_path(&job.label);
                crate::io::atomic_write(&path, units.service.as_bytes())?;
                written.push(path);
                if let Some(timer) = units.timer {
                    let path = self.timer_path(&job.label);
                    crate::io::atomic_write(&path, timer.as_bytes())?;
                    written.push(path);
                }
            }
        }
        Ok(written)
    }

    /// Unload any previous registration, write fresh descriptors and load them.
    pub fn install(&self, jobs: &[ServiceJob]) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for job in jobs {
            self.deactivate(&job.label)?;
            written.extend(self.write_descriptors(job)?);
        }
        if self.backend == Backend::Systemd {
            self.systemctl(&["daemon-reload"])?;
        }
        for job in jobs {
            self.activate(job)?;
            tracing::info!(label = %job.label, "service job installed");
        }
        Ok(written)
    }

    /// Unload and delete every descriptor for `labels`. Returns the files removed.
    pub fn uninstall(&self, labels: &[String]) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for label in labels {
            self.deactivate(label)?;
            for path in [self.descriptor_path(label), self.timer_path(label)] {
                if crate::io::remove_if_exists(&path)? {
                    removed.push(path);
                }
            }
        }
        if self.backend == Backend::Systemd {
            self.systemctl(&["daemon-reload"])?;
        }
        Ok(removed)
    }

    /// Start a keep-alive job through the service manager.
    pub fn start(&self, label: &str) -> Result<()> {
        match self.backend {
            Backend::Launchd => {
                let plist = self.descriptor_path(label).display().to_string();
                command::run(&argv(&["launchctl", "load", "-w", &plist]), &self.dir)?;
            }
            Backend::Systemd => {
                self.systemctl(&["start", &format!("{label}.service")])?;
            }
        }
        Ok(())
    }

    /// Stop a keep-alive job so the service manager does not respawn it.
    pub fn stop(&self, label: &str) -> Result<()> {
        match self.backend {
            Backend::Launchd => {
                let plist = self.descriptor_path(label).display().to_string();
                let out = command::run_allow_failure(&argv(&["launchctl", "unload", &plist]), &self.dir)?;
                if !out.success {
                    tracing::debug!(label, detail = %out.detail(), "launchctl unload reported failure");
                }
            }
            Backend::Systemd => {
                self.systemctl(&["stop", &format!("{label}.service")])?;
            }
        }
        Ok(())
    }

    fn activate(&self, job: &ServiceJob) -> Result<()> {
        match self.backend {
            Backend::Launchd => self.start(&job.label),
            Backend::Systemd => {
                let unit = match job.schedule {
                    Schedule::KeepAlive { .. } => format!("{}.service", job.label),
                    _ => format!("{}.timer", job.label),
                };
                self.systemctl(&["enable", "--now", &unit])
            }
        }
    }

    /// Best-effort unregister; a job that was never loaded is fine.
    fn deactivate(&self, label: &str) -> Result<()> {
        if !self.is_installed(label) {
            return Ok(());
        }
        match self.backend {
            Backend::Launchd => self.stop(label),
            Backend::Systemd => {
                for unit in [format!("{label}.timer"), format!("{label}.service")] {
                    let out = command::run_allow_failure(
                        &argv(&["systemctl", "--user", "disable", "--now", &unit]),
                        &self.dir,
                    )?;
                    if !out.success {
                        tracing::debug!(unit = %unit, detail = %out.detail(), "systemctl disable reported failure");
                    }
                }
                Ok(())
            }
        }
    }

    fn systemctl(&self, args: &[&str]) -> Result<()> {
        let mut full = vec!["systemctl", "--user"];
        full.extend_from_slice(args);
        command::run(&argv(&full), &self.dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_jobs(root: &Path) -> Vec<ServiceJob> {
        let mut config = Config::default();
        config.bridge.env.insert("BRIDGE_MODE".to_string(), "prod".to_string());
        jobs(root, &config, Path::new("/usr/local/bin/bridgectl")).unwrap()
    }

    #[test]
    fn jobs_cover_bridge_update_and_watchdog() {
        let jobs = sample_jobs(Path::new("/srv/valor"));
        let labels: Vec<&str> = jobs.iter().map(|j| j.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["com.valor.bridge", "com.valor.update", "com.valor.watchdog"]
        );

        let bridge = &jobs[0];
        assert_eq!(
            bridge.program_arguments,
            vec!["/srv/valor/.venv/bin/python", "bridge/telegram_bridge.py"]
        );
        assert_eq!(bridge.env.get("BRIDGE_MODE").map(String::as_str), Some("prod"));
        assert!(bridge.env.contains_key("PATH"));
        assert!(bridge.env.contains_key("HOME"));

        assert_eq!(
            jobs[1].program_arguments,
            vec!["/usr/local/bin/bridgectl", "--root", "/srv/valor", "update"]
        );
        assert!(matches!(jobs[2].schedule, Schedule::Interval { secs: 300 }));
        // Only the bridge carries its own env overrides.
        assert!(!jobs[1].env.contains_key("BRIDGE_MODE"));
    }

    #[test]
    fn plist_for_keep_alive_job() {
        let jobs = sample_jobs(Path::new("/srv/valor"));
        let plist = render_launchd_plist(&jobs[0]);
        assert!(plist.starts_with("<?xml"));
        assert!(plist.contains("<string>com.valor.bridge</string>"));
        assert!(plist.contains("<key>RunAtLoad</key>\n    <true/>"));
        assert!(plist.contains("<key>KeepAlive</key>\n    <true/>"));
        assert!(plist.contains("<key>ThrottleInterval</key>\n    <integer>10</integer>"));
        assert!(plist.contains("<string>/srv/valor/logs/bridge.error.log</string>"));
        assert!(!plist.contains("StartInterval"));
    }

    #[test]
    fn plist_for_daily_and_interval_jobs() {
        let jobs = sample_jobs(Path::new("/srv/valor"));
        let update = render_launchd_plist(&jobs[1]);
        assert!(update.contains("<key>StartCalendarInterval</key>"));
        assert!(update.contains("<key>Hour</key>\n            <integer>16</integer>"));
        assert!(!update.contains("KeepAlive"));

        let watchdog = render_launchd_plist(&jobs[2]);
        assert!(watchdog.contains("<key>StartInterval</key>\n    <integer>300</integer>"));
    }

    #[test]
    fn plist_escapes_xml() {
        let mut job = sample_jobs(Path::new("/srv/valor"))[0].clone();
        job.program_arguments.push("a&b<c>".to_string());
        let plist = render_launchd_plist(&job);
        assert!(plist.contains("<string>a&amp;b&lt;c&gt;</string>"));
    }

    #[test]
    fn systemd_units_for_each_schedule() {
        let jobs = sample_jobs(Path::new("/srv/valor"));

        let bridge = render_systemd_units(&jobs[0]);
        assert!(bridge.service.contains("Restart=always\nRestartSec=10\n"));
        assert!(bridge.service.contains("StandardError=append:/srv/valor/logs/bridge.error.log"));
        assert!(bridge.service.contains("WantedBy=default.target"));
        assert!(bridge.timer.is_none());

        let update = render_systemd_units(&jobs[1]);
        assert!(update.service.contains("Type=oneshot"));
        let timer = update.timer.unwrap();
        assert!(timer.contains("OnCalendar=*-*-* 04:00:00"));
        assert!(timer.contains("OnCalendar=*-*-* 16:00:00"));
        assert!(timer.contains("Unit=com.valor.update.service"));

        let watchdog = render_systemd_units(&jobs[2]).timer.unwrap();
        assert!(watchdog.contains("OnUnitActiveSec=300"));
    }

    #[test]
    fn systemd_quote_handles_spaces_and_specials() {
        assert_eq!(systemd_quote("plain"), "plain");
        assert_eq!(systemd_quote("/my dir/x"), "\"/my dir/x\"");
        assert_eq!(systemd_quote("100%"), "\"100%%\"");
    }

    #[test]
    fn write_descriptors_lays_out_files() {
        let dir = TempDir::new().unwrap();
        let jobs = sample_jobs(Path::new("/srv/valor"));

        let launchd = ServiceManager::new(Backend::Launchd, dir.path().join("agents"));
        let written = launchd.write_descriptors(&jobs[0]).unwrap();
        assert_eq!(written, vec![dir.path().join("agents/com.valor.bridge.plist")]);
        assert!(launchd.is_installed("com.valor.bridge"));
        assert!(!launchd.is_installed("com.valor.update"));

        let systemd = ServiceManager::new(Backend::Systemd, dir.path().join("units"));
        let written = systemd.write_descriptors(&jobs[2]).unwrap();
        assert_eq!(written.len(), 2);
        assert!(dir.path().join("units/com.valor.watchdog.timer").is_file());
    }
}
