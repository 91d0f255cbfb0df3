use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{artifact} not found, run: {remedy}")]
    PreconditionFailed { artifact: String, remedy: String },

    #[error("another operation is in progress (lock held: {}{})", .path.display(), .owner)]
    LockHeld { path: PathBuf, owner: String },

    #[error("more than one process matches the bridge command line (pids: {0:?}); refusing to act")]
    AmbiguousProcess(Vec<u32>),

    #[error("bridge failed to start; check {}", .error_log.display())]
    StartFailed { error_log: PathBuf },

    #[error(
        "local branch has diverged from the remote; refusing to merge or rebase automatically.\n\
         Resolve it by hand. Do not force-push or force-merge."
    )]
    NonFastForward,

    #[error("{program} failed: {detail}")]
    CommandFailed { program: String, detail: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("service management is not supported on this platform")]
    UnsupportedPlatform,

    #[error("home directory not found: set HOME environment variable")]
    HomeNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Nix(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
