pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod io;
pub mod lock;
pub mod markers;
pub mod paths;
pub mod process;
pub mod service;
pub mod updater;
pub mod watchdog;

pub use error::{BridgeError, Result};
