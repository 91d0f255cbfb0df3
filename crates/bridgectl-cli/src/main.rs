mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "bridgectl",
    about = "Lifecycle controller for the bridge process: start, stop, supervise and update",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from bridgectl.yaml or .git/)
    #[arg(long, global = true, env = "BRIDGECTL_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge (stops a running instance first)
    Start,

    /// Stop the bridge (SIGTERM, then SIGKILL after the stop timeout)
    Stop,

    /// Stop and start under a single lock
    Restart,

    /// Show whether the bridge is running and any pending markers
    Status,

    /// Check the bridge process and its recent error log; exits 1 when unhealthy
    Health,

    /// Register the bridge, updater and watchdog jobs with the service manager
    Install {
        /// Print the rendered descriptors instead of installing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove all service manager jobs
    Uninstall,

    /// Print the tail of the bridge log
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Show the error log instead of the output log
        #[arg(long)]
        error: bool,

        /// Keep printing new lines as they are written
        #[arg(short, long)]
        follow: bool,
    },

    /// Fast-forward to the remote branch and request a restart when idle
    Update,

    /// One supervision pass: start a dead bridge, apply a pending restart when idle
    Watchdog,

    /// Create, show and validate bridgectl.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    // update and watchdog run unattended; their output lands in log files.
    let default_level = match &cli.command {
        Commands::Update | Commands::Watchdog => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Start => cmd::start::run(&root, cli.json),
        Commands::Stop => cmd::stop::run(&root, cli.json),
        Commands::Restart => cmd::restart::run(&root, cli.json),
        Commands::Status => cmd::status::run(&root, cli.json),
        Commands::Health => cmd::health::run(&root, cli.json),
        Commands::Install { dry_run } => cmd::install::run(&root, dry_run, cli.json),
        Commands::Uninstall => cmd::uninstall::run(&root, cli.json),
        Commands::Logs {
            lines,
            error,
            follow,
        } => cmd::logs::run(&root, lines, error, follow),
        Commands::Update => cmd::update::run(&root, cli.json),
        Commands::Watchdog => cmd::watchdog::run(&root, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
