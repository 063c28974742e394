//! Configuration tests
//!
//! The round-trip tests are a guard on the hand-rendered TOML in
//! `Config::to_toml`: every field written there must parse back through
//! `FileConfig`. Adding a config field without updating both sides fails
//! here instead of at a user's first `config --reset`.

use super::*;

#[test]
fn test_config_roundtrip_default() {
    let config = Config::default();
    let toml_str = config.to_toml();

    let parsed: Result<FileConfig, _> = toml::from_str(&toml_str);
    assert!(
        parsed.is_ok(),
        "Default config should round-trip.\nTOML:\n{}\nError: {:?}",
        toml_str,
        parsed.err()
    );
}

#[test]
fn test_file_overlay_applies_to_every_section() {
    let toml_str = r#"
bind_addr = "0.0.0.0:9000"
db_path = "/tmp/test.db"
status_interval_secs = 5

[signals]
cpu_poll_interval = 1.5
cpu_high_threshold = 90.0
watch_paths = ["/tmp/watched"]

[permissions]
clipboard = true
microphone = true
shell_execution = false

[logging]
level = "debug"
file_enabled = true
file_rotation = "hourly"
"#;
    let file: FileConfig = toml::from_str(toml_str).unwrap();
    let mut config = Config::default();
    config.apply_file(file).unwrap();

    assert_eq!(config.bind_addr.port(), 9000);
    assert_eq!(config.db_path, std::path::PathBuf::from("/tmp/test.db"));
    assert_eq!(config.status_interval_secs, 5);
    assert_eq!(config.signals.cpu_poll_interval, 1.5);
    assert_eq!(config.signals.cpu_high_threshold, 90.0);
    assert_eq!(config.signals.watch_paths, vec!["/tmp/watched".to_string()]);
    // Untouched fields keep defaults
    assert_eq!(config.signals.cpu_low_threshold, 20.0);
    assert_eq!(config.signals.microphone_threshold, 0.5);
    assert!(config.permissions.clipboard);
    assert!(config.permissions.microphone);
    assert!(!config.permissions.shell_execution);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.file_rotation, LogRotation::Hourly);
}

#[test]
fn test_invalid_bind_addr_is_rejected() {
    let file: FileConfig = toml::from_str(r#"bind_addr = "not-an-addr""#).unwrap();
    let mut config = Config::default();
    assert!(config.apply_file(file).is_err());
}

#[test]
fn test_empty_file_keeps_defaults() {
    let file: FileConfig = toml::from_str("").unwrap();
    let mut config = Config::default();
    config.apply_file(file).unwrap();
    assert_eq!(config.bind_addr, Config::default().bind_addr);
    assert_eq!(
        config.signals.watch_ignore_patterns,
        Config::default().signals.watch_ignore_patterns
    );
}

#[test]
fn test_rotation_parse_falls_back_to_daily() {
    assert_eq!(LogRotation::parse("hourly"), LogRotation::Hourly);
    assert_eq!(LogRotation::parse("NEVER"), LogRotation::Never);
    assert_eq!(LogRotation::parse("weekly"), LogRotation::Daily);
}
