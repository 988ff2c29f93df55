//! syncable-daemon library: command-line front end over on-disk stores.
//!
//! The binary is a thin layer over these modules, which integration tests
//! drive directly.

pub mod commands;
pub mod config;

pub use commands::{Command, run};
pub use config::{Config, ConfigError, StoreArgs};
