//! Configuration management commands

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Subcommand;

use crate::config::{Config, CONFIG_FILE};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show {
        /// Config file to read instead of the default locations
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Write a default configuration file
    Init {
        /// Target path
        #[arg(default_value = CONFIG_FILE)]
        path: PathBuf,
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub fn run(cmd: ConfigCommands) -> Result<()> {
    match cmd {
        ConfigCommands::Show { config } => show(config.as_deref()),
        ConfigCommands::Init { path, force } => init(&path, force).map(|_| ()),
    }
}

fn show(explicit: Option<&Path>) -> Result<()> {
    let (config, path) = Config::load(explicit)?;

    println!("Current Configuration");
    println!("=====================\n");
    match path {
        Some(path) => println!("Config file: {}\n", path.display()),
        None => println!("No configuration file found. Using defaults.\n"),
    }
    println!("{}", config.to_toml()?);
    Ok(())
}

/// Returns whether the file was written.
fn init(path: &Path, force: bool) -> Result<bool> {
    if path.exists() && !force {
        println!("Configuration file already exists: {}", path.display());
        println!("Use --force to overwrite");
        return Ok(false);
    }

    std::fs::write(path, Config::default().to_toml()?)?;
    println!("Configuration file created: {}", path.display());
    Ok(true)
}
