// CLI module - command-line argument parsing and handlers
//
// Provides subcommands for configuration management:
// - config --show: Display effective configuration
// - config --reset: Regenerate config file with defaults
// - config --path: Show config file path

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};

/// sigrelay - local event-routing engine for host signals
#[derive(Parser)]
#[command(name = "sigrelay")]
#[command(version = VERSION)]
#[command(about = "Route host signals through user-defined pipelines", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Reset config file to defaults
        #[arg(long)]
        reset: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle CLI commands. Returns true if a command was handled (exit after).
pub fn handle_cli() -> bool {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { show, reset, path }) => {
            if path {
                handle_config_path();
            } else if show {
                handle_config_show();
            } else if reset {
                handle_config_reset();
            } else {
                println!("Usage: sigrelay config [--show|--reset|--path]");
                println!();
                println!("Options:");
                println!("  --show    Display effective configuration");
                println!("  --reset   Reset config file to defaults");
                println!("  --path    Show config file path");
            }
            true
        }
        None => false,
    }
}

fn handle_config_path() {
    match Config::config_path() {
        Some(path) => println!("{}", path.display()),
        None => eprintln!("No config directory available on this platform"),
    }
}

fn handle_config_show() {
    match Config::load() {
        Ok(config) => print!("{}", config.to_toml()),
        Err(err) => eprintln!("Failed to load config: {err:#}"),
    }
}

fn handle_config_reset() {
    let Some(path) = Config::config_path() else {
        eprintln!("No config directory available on this platform");
        return;
    };
    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            eprintln!("Failed to create {}: {err}", parent.display());
            return;
        }
    }
    match std::fs::write(&path, Config::default().to_toml()) {
        Ok(()) => println!("Wrote defaults to {}", path.display()),
        Err(err) => eprintln!("Failed to write {}: {err}", path.display()),
    }
}
