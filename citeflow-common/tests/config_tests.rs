//! Tests for configuration loading and resolution
//!
//! Tests that touch CITEFLOW_CONFIG are #[serial] to avoid environment races.

use citeflow_common::config::{
    resolve_config_path, validate, TomlConfig, CONFIG_ENV_VAR,
};
use serial_test::serial;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_defaults_match_documented_values() {
    let config = TomlConfig::default();

    assert_eq!(config.dispatch.stall_timeout_secs, 30);
    assert_eq!(config.dispatch.requeue_multiplier, 10);
    assert_eq!(config.dispatch.response_expire_interval_secs, None);
    assert_eq!(config.dispatch.response_expire_schedule, None);
    assert_eq!(config.dispatch.poll_interval_secs, 5);
    assert!(config.menu_skip.mode.is_none());
    assert!(config.registry.default_services.is_empty());
}

#[test]
fn test_partial_toml_keeps_defaults_for_missing_keys() {
    let config = TomlConfig::from_toml_str(
        r#"
        [dispatch]
        stall_timeout_secs = 45
        "#,
    )
    .unwrap();

    assert_eq!(config.dispatch.stall_timeout_secs, 45);
    assert_eq!(config.dispatch.requeue_multiplier, 10);
    assert_eq!(config.dispatch.max_concurrent_services, 8);
}

#[test]
fn test_full_toml_parses_all_sections() {
    let config = TomlConfig::from_toml_str(
        r#"
        database_path = "/var/lib/citeflow/test.db"

        [dispatch]
        response_expire_interval_secs = 86400
        response_expire_schedule = "0 0 3 * * *"
        max_poll_attempts = 12

        [menu_skip]
        mode = "rule"
        service_types = ["fulltext"]
        excluded_referrers = ["info:sid/journal-list"]

        [registry]
        default_services = ["sfx", "amazon"]

        [[registry.institutions]]
        name = "main-campus"
        ip_networks = ["10.0.0.0/8"]
        services = ["local-catalog"]
        "#,
    )
    .unwrap();

    assert_eq!(config.database_path, Some(PathBuf::from("/var/lib/citeflow/test.db")));
    assert_eq!(config.dispatch.response_expire_interval_secs, Some(86400));
    assert_eq!(config.dispatch.response_expire_schedule.as_deref(), Some("0 0 3 * * *"));
    assert_eq!(config.dispatch.max_poll_attempts, Some(12));
    assert_eq!(config.menu_skip.mode.as_deref(), Some("rule"));
    assert_eq!(config.menu_skip.allowed_services, None);
    assert_eq!(config.registry.default_services, vec!["sfx", "amazon"]);
    assert_eq!(config.registry.institutions.len(), 1);
    assert_eq!(config.registry.institutions[0].ip_networks, vec!["10.0.0.0/8"]);
}

#[test]
fn test_malformed_toml_is_config_error() {
    let result = TomlConfig::from_toml_str("[dispatch\nstall_timeout_secs = ");
    assert!(matches!(result, Err(citeflow_common::Error::Config(_))));
}

#[test]
fn test_validate_rejects_zero_stall_timeout() {
    let mut config = TomlConfig::default();
    config.dispatch.stall_timeout_secs = 0;
    assert!(validate(&config).is_err());
}

#[test]
fn test_validate_rejects_zero_multiplier_and_concurrency() {
    let mut config = TomlConfig::default();
    config.dispatch.requeue_multiplier = 0;
    assert!(validate(&config).is_err());

    let mut config = TomlConfig::default();
    config.dispatch.max_concurrent_services = 0;
    assert!(validate(&config).is_err());

    assert!(validate(&TomlConfig::default()).is_ok());
}

#[test]
#[serial]
fn test_explicit_path_beats_environment() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/from-env.toml");

    let resolved = resolve_config_path(Some(PathBuf::from("/tmp/explicit.toml").as_path()));
    assert_eq!(resolved, Some(PathBuf::from("/tmp/explicit.toml")));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_environment_variable_used_without_explicit_path() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/from-env.toml");

    assert_eq!(resolve_config_path(None), Some(PathBuf::from("/tmp/from-env.toml")));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_load_missing_file_falls_back_to_defaults() {
    env::remove_var(CONFIG_ENV_VAR);
    let dir = TempDir::new().unwrap();

    let config = TomlConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
    assert_eq!(config, TomlConfig::default());
}

#[test]
#[serial]
fn test_load_reads_existing_file() {
    env::remove_var(CONFIG_ENV_VAR);
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[dispatch]\npoll_interval_secs = 2\n").unwrap();

    let config = TomlConfig::load(Some(&path)).unwrap();
    assert_eq!(config.dispatch.poll_interval_secs, 2);
}

#[test]
fn test_database_path_defaults_when_unset() {
    let config = TomlConfig::default();
    assert!(config.database_path().ends_with("citeflow.db"));
}
