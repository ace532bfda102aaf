use redirproxy_config::{Config, ConfigError, matches_host_pattern};
use std::path::PathBuf;

fn get_test_config_path(filename: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("test_configs");
    path.push(filename);
    path
}

#[test]
fn test_basic_config_loads() {
    let config = Config::from_file(&get_test_config_path("test_basic.yaml"))
        .expect("Failed to load basic config");

    assert_eq!(config.listen_addrs.len(), 2);
    assert_eq!(config.listen_addrs[0], "0.0.0.0:8080");
    assert!(config.transparent);
    assert!(config.sniffing);

    assert_eq!(config.timeouts.connect, 10);
    assert_eq!(config.timeouts.sniff, 5);
    assert_eq!(config.timeouts.idle, 300);

    assert!(config.metrics.enabled);
    assert_eq!(config.metrics.address, "0.0.0.0:9091");

    assert!(config.state_table.is_none());
    assert!(config.rate_limit.is_none());
    assert!(config.bypass.is_none());
    assert!(config.shutdown_timeout.is_none());
}

#[test]
fn test_full_config_loads() {
    let config = Config::from_file(&get_test_config_path("test_full.yaml"))
        .expect("Failed to load full config");

    assert!(!config.transparent);
    assert_eq!(config.max_connections, Some(50000));
    assert_eq!(config.shutdown_timeout, Some(20));
    assert_eq!(
        config.state_command().expect("state command"),
        vec!["sudo", "-n", "/sbin/pfctl", "-s", "state"]
    );

    let limit = config.rate_limit.expect("rate limit should be configured");
    assert_eq!(limit.requests_per_second, 50);
    assert!(limit.burst.is_none());
    assert_eq!(limit.exempt.len(), 2);

    let bypass = config.bypass.expect("bypass should be configured");
    assert!(!bypass.whitelist);
    assert!(matches_host_pattern("git.corp.example", &bypass.patterns[0]));
}

#[test]
fn test_empty_listen_addrs_rejected() {
    let result = Config::from_file(&get_test_config_path("test_invalid.yaml"));
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_missing_file() {
    let result = Config::from_file(&get_test_config_path("does_not_exist.yaml"));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}
