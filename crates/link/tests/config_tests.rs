//! Integration tests for configuration parsing
//!
//! Covers loading, saving and validating `link.toml`.

use common::Role;
use link::config::{LinkConfig, load_config};
use link::usb::DeviceFilter;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
[link]
role = "sender"
log_level = "debug"

[usb]
filters = ["0x18d1:*", "0x1234:0x5678"]
interface = 1

[transfer]
write_timeout_ms = 2000
read_timeout_ms = 20
max_frame_bytes = 1048576

[permission]
auto_grant = false
approved_devices = ["0x18d1:0x4ee7"]
"#;

#[test]
fn test_full_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("link.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let config = LinkConfig::load(Some(path)).unwrap();
    assert_eq!(config.link.role, Role::Sender);
    assert_eq!(config.usb.interface, Some(1));

    let filters = config.device_filters().unwrap();
    assert_eq!(filters.len(), 2);
    assert!(DeviceFilter::any_matches(&filters, 0x18d1, 0x0001));
    assert!(!DeviceFilter::any_matches(&filters, 0x1234, 0x0001));

    let settings = config.transfer.settings();
    assert_eq!(settings.write_timeout, Duration::from_secs(2));
    assert_eq!(settings.read_timeout, Duration::from_millis(20));
    assert_eq!(settings.max_frame_bytes, 1024 * 1024);

    let approved = config.approved_devices().unwrap();
    assert!(approved[0].matches(0x18d1, 0x4ee7));
}

#[test]
fn test_save_and_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("link.toml");

    let mut config = LinkConfig::default();
    config.link.role = Role::Sender;
    config.permission.auto_grant = true;
    config.usb.filters = vec!["0x04f9:*".to_string()];
    config.save(&path).unwrap();

    let loaded = LinkConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.link.role, Role::Sender);
    assert!(loaded.permission.auto_grant);
    assert_eq!(loaded.usb.filters, vec!["0x04f9:*".to_string()]);
    assert_eq!(loaded.transfer.read_timeout_ms, 50);
}

#[test]
fn test_load_config_path_string() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("link.toml");
    fs::write(&path, "[link]\nrole = \"receiver\"\nlog_level = \"warn\"\n").unwrap();

    let config = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(config.link.role, Role::Receiver);
    assert_eq!(config.link.log_level, "warn");
}

#[test]
fn test_missing_file_is_error() {
    let dir = TempDir::new().unwrap();
    assert!(LinkConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}

#[test]
fn test_invalid_values_rejected_on_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("link.toml");

    fs::write(
        &path,
        "[link]\nrole = \"receiver\"\nlog_level = \"info\"\n[transfer]\nread_timeout_ms = 0\n",
    )
    .unwrap();
    assert!(LinkConfig::load(Some(path.clone())).is_err());

    fs::write(&path, "[link]\nrole = \"relay\"\nlog_level = \"info\"\n").unwrap();
    assert!(LinkConfig::load(Some(path.clone())).is_err());

    fs::write(&path, "not toml at all [").unwrap();
    assert!(LinkConfig::load(Some(path)).is_err());
}
