//! Signal source tunables: poll cadences, thresholds, watch paths

use serde::Deserialize;

/// Per-source polling cadences and change-detection thresholds
#[derive(Debug, Clone)]
pub struct SignalsConfig {
    /// CPU/RAM polling interval in seconds
    pub cpu_poll_interval: f64,
    /// Battery polling interval in seconds
    pub battery_poll_interval: f64,
    /// Network polling interval in seconds
    pub network_poll_interval: f64,
    /// Clipboard polling interval in seconds
    pub clipboard_poll_interval: f64,
    /// Window focus polling interval in seconds
    pub window_poll_interval: f64,
    /// Filesystem bridge-queue drain interval in seconds
    pub filesystem_poll_interval: f64,
    /// Microphone peak-queue drain interval in seconds
    pub microphone_poll_interval: f64,

    /// Minimum CPU/RAM percentage delta that counts as a change
    pub cpu_change_step: f64,
    /// CPU threshold band
    pub cpu_low_threshold: f64,
    pub cpu_high_threshold: f64,
    /// RAM high-water threshold (low end of the band is 0)
    pub ram_high_threshold: f64,
    /// Battery band: low end doubles as the critical alert level
    pub battery_critical_threshold: f64,
    /// Normalized (0-1) audio peak level that triggers a microphone event
    pub microphone_threshold: f64,

    /// Paths the filesystem source watches
    pub watch_paths: Vec<String>,
    /// Include globs; empty means everything
    pub watch_patterns: Vec<String>,
    /// Ignore globs, applied before includes
    pub watch_ignore_patterns: Vec<String>,
    /// Watch subdirectories recursively
    pub watch_recursive: bool,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            cpu_poll_interval: 2.0,
            battery_poll_interval: 10.0,
            network_poll_interval: 5.0,
            clipboard_poll_interval: 1.0,
            window_poll_interval: 0.5,
            filesystem_poll_interval: 0.1,
            microphone_poll_interval: 0.1,
            cpu_change_step: 5.0,
            cpu_low_threshold: 20.0,
            cpu_high_threshold: 80.0,
            ram_high_threshold: 85.0,
            battery_critical_threshold: 10.0,
            microphone_threshold: 0.5,
            watch_paths: Vec::new(),
            watch_patterns: Vec::new(),
            watch_ignore_patterns: vec![
                "*.tmp".to_string(),
                "*.swp".to_string(),
                "~*".to_string(),
                "**/.git/**".to_string(),
            ],
            watch_recursive: true,
        }
    }
}

/// `[signals]` section as loaded from the config file
#[derive(Debug, Deserialize, Default)]
pub struct FileSignals {
    pub cpu_poll_interval: Option<f64>,
    pub battery_poll_interval: Option<f64>,
    pub network_poll_interval: Option<f64>,
    pub clipboard_poll_interval: Option<f64>,
    pub window_poll_interval: Option<f64>,
    pub filesystem_poll_interval: Option<f64>,
    pub microphone_poll_interval: Option<f64>,
    pub cpu_change_step: Option<f64>,
    pub cpu_low_threshold: Option<f64>,
    pub cpu_high_threshold: Option<f64>,
    pub ram_high_threshold: Option<f64>,
    pub battery_critical_threshold: Option<f64>,
    pub microphone_threshold: Option<f64>,
    pub watch_paths: Option<Vec<String>>,
    pub watch_patterns: Option<Vec<String>>,
    pub watch_ignore_patterns: Option<Vec<String>>,
    pub watch_recursive: Option<bool>,
}

impl SignalsConfig {
    pub(super) fn apply_file(&mut self, file: FileSignals) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = file.$field {
                    self.$field = v;
                }
            };
        }
        take!(cpu_poll_interval);
        take!(battery_poll_interval);
        take!(network_poll_interval);
        take!(clipboard_poll_interval);
        take!(window_poll_interval);
        take!(filesystem_poll_interval);
        take!(microphone_poll_interval);
        take!(cpu_change_step);
        take!(cpu_low_threshold);
        take!(cpu_high_threshold);
        take!(ram_high_threshold);
        take!(battery_critical_threshold);
        take!(microphone_threshold);
        take!(watch_paths);
        take!(watch_patterns);
        take!(watch_ignore_patterns);
        take!(watch_recursive);
    }
}
