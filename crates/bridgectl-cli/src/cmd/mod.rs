pub mod config;
pub mod health;
pub mod install;
pub mod logs;
pub mod restart;
pub mod start;
pub mod status;
pub mod stop;
pub mod uninstall;
pub mod update;
pub mod watchdog;

use anyhow::Context;
use bridgectl_core::config::Config;
use bridgectl_core::controller::Controller;
use std::path::Path;

pub(crate) fn load_config(root: &Path) -> anyhow::Result<Config> {
    Config::load(root).context("failed to load bridgectl.yaml")
}

pub(crate) fn controller(root: &Path) -> anyhow::Result<Controller> {
    Ok(Controller::new(root, load_config(root)?))
}
