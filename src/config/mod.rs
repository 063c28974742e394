//! Configuration for the event-routing engine
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/sigrelay/config.toml)
//! 3. Built-in defaults (lowest priority)
//!
//! The loaded `Config` is an explicit value threaded through the
//! constructors that need it; nothing reads configuration globally.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

mod observability;
mod permissions;
mod signals;

#[cfg(test)]
mod tests;

pub use observability::{FileLogging, LogRotation, LoggingConfig};
pub use permissions::{
    FilePermissions, Permissions, PERM_CLIPBOARD, PERM_FILE_OPS, PERM_MICROPHONE, PERM_NETWORK,
    PERM_PROCESS, PERM_SHELL,
};
pub use signals::{FileSignals, SignalsConfig};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the server (WebSocket hub + status API) to
    pub bind_addr: SocketAddr,

    /// SQLite database holding pipelines and event/action logs
    pub db_path: PathBuf,

    /// Seconds between system status broadcasts on the `system` channel
    pub status_interval_secs: u64,

    /// Signal source cadences and thresholds
    pub signals: SignalsConfig,

    /// Capability grants for sensitive sources and actions
    pub permissions: Permissions,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".parse().unwrap(),
            db_path: PathBuf::from("sigrelay.db"),
            status_interval_secs: 30,
            signals: SignalsConfig::default(),
            permissions: Permissions::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,
    pub db_path: Option<String>,
    pub status_interval_secs: Option<u64>,

    /// Optional [signals] section
    pub signals: Option<FileSignals>,

    /// Optional [permissions] section
    pub permissions: Option<FilePermissions>,

    /// Optional [logging] section
    pub logging: Option<FileLogging>,
}

impl Config {
    /// Path to the config file, if a config directory exists on this platform
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sigrelay").join("config.toml"))
    }

    /// Load configuration with the documented precedence.
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Some(path) = Self::config_path() {
            if path.exists() {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                let file: FileConfig = toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?;
                config.apply_file(file)?;
            }
        }

        config.apply_env()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<()> {
        if let Some(addr) = file.bind_addr {
            self.bind_addr = addr
                .parse()
                .with_context(|| format!("invalid bind_addr in config: {addr}"))?;
        }
        if let Some(path) = file.db_path {
            self.db_path = PathBuf::from(path);
        }
        if let Some(secs) = file.status_interval_secs {
            self.status_interval_secs = secs;
        }
        if let Some(signals) = file.signals {
            self.signals.apply_file(signals);
        }
        if let Some(perms) = file.permissions {
            self.permissions.apply_file(perms);
        }
        if let Some(logging) = file.logging {
            self.logging.apply_file(logging);
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("SIGRELAY_BIND_ADDR") {
            self.bind_addr = addr
                .parse()
                .with_context(|| format!("invalid SIGRELAY_BIND_ADDR: {addr}"))?;
        }
        if let Ok(path) = std::env::var("SIGRELAY_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Ok(level) = std::env::var("SIGRELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Render the effective configuration as a commented TOML document.
    /// Used by `sigrelay config --show` and `--reset`.
    pub fn to_toml(&self) -> String {
        let s = &self.signals;
        let p = &self.permissions;
        let l = &self.logging;
        format!(
            r#"# sigrelay configuration
# Delete a line to fall back to the built-in default.

bind_addr = "{bind_addr}"
db_path = "{db_path}"
status_interval_secs = {status_interval}

[signals]
cpu_poll_interval = {cpu_poll}
battery_poll_interval = {battery_poll}
network_poll_interval = {network_poll}
clipboard_poll_interval = {clipboard_poll}
window_poll_interval = {window_poll}
filesystem_poll_interval = {fs_poll}
microphone_poll_interval = {mic_poll}
cpu_change_step = {cpu_step}
cpu_low_threshold = {cpu_low}
cpu_high_threshold = {cpu_high}
ram_high_threshold = {ram_high}
battery_critical_threshold = {battery_critical}
microphone_threshold = {mic_threshold}
watch_paths = {watch_paths:?}
watch_patterns = {watch_patterns:?}
watch_ignore_patterns = {watch_ignore:?}
watch_recursive = {watch_recursive}

[permissions]
# Clipboard and microphone monitoring are privacy-sensitive; leave off
# unless a pipeline needs them.
clipboard = {perm_clipboard}
microphone = {perm_microphone}
shell_execution = {perm_shell}
file_operations = {perm_file}
process_control = {perm_process}
network_control = {perm_network}

[logging]
level = "{log_level}"
json = {log_json}
file_enabled = {log_file_enabled}
file_dir = "{log_file_dir}"
file_rotation = "{log_rotation}"
file_prefix = "{log_prefix}"
"#,
            bind_addr = self.bind_addr,
            db_path = self.db_path.display(),
            status_interval = self.status_interval_secs,
            cpu_poll = s.cpu_poll_interval,
            battery_poll = s.battery_poll_interval,
            network_poll = s.network_poll_interval,
            clipboard_poll = s.clipboard_poll_interval,
            window_poll = s.window_poll_interval,
            fs_poll = s.filesystem_poll_interval,
            mic_poll = s.microphone_poll_interval,
            cpu_step = s.cpu_change_step,
            cpu_low = s.cpu_low_threshold,
            cpu_high = s.cpu_high_threshold,
            ram_high = s.ram_high_threshold,
            battery_critical = s.battery_critical_threshold,
            mic_threshold = s.microphone_threshold,
            watch_paths = s.watch_paths,
            watch_patterns = s.watch_patterns,
            watch_ignore = s.watch_ignore_patterns,
            watch_recursive = s.watch_recursive,
            perm_clipboard = p.clipboard,
            perm_microphone = p.microphone,
            perm_shell = p.shell_execution,
            perm_file = p.file_operations,
            perm_process = p.process_control,
            perm_network = p.network_control,
            log_level = l.level,
            log_json = l.json,
            log_file_enabled = l.file_enabled,
            log_file_dir = l.file_dir.display(),
            log_rotation = l.file_rotation.as_str(),
            log_prefix = l.file_prefix,
        )
    }
}
