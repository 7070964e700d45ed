//! CLI subcommand definitions and handlers.
//!
//! - `start` (default) -- run the gateway
//! - `config show|path` -- inspect configuration
//! - `version` -- print build info

use clap::{Parser, Subcommand};

use crate::config;

/// Real-time WebSocket gateway for a local messaging bridge.
#[derive(Parser, Debug)]
#[command(
    name = "bridgegate",
    version = env!("CARGO_PKG_VERSION"),
    about = "bridgegate: a WebSocket gateway for a local messaging bridge"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Start the gateway (default when no subcommand is given).
    Start,

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print version and platform.
    Version,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum ConfigCommand {
    /// Print the effective configuration with the password masked.
    Show,

    /// Print the config file path.
    Path,
}

/// Run the `config show` subcommand.
pub fn handle_config_show() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    let mut value = serde_json::to_value(&cfg)?;
    if let Some(map) = value.as_object_mut() {
        if !cfg.password.is_empty() {
            map.insert("password".to_string(), "[REDACTED]".into());
        }
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Run the `config path` subcommand.
pub fn handle_config_path() {
    println!("{}", config::get_config_path().display());
}

pub fn handle_version() {
    println!("bridgegate {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}
