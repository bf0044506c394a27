//! Integration tests for layered configuration loading

use canopy::config::{ConfigLoader, StorageBackend};
use canopy::engine::Engine;
use canopy::store::MemoryNodeStore;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

use super::support::Script;

#[test]
fn test_layers_override_in_order() {
    let global_dir = TempDir::new().unwrap();
    let global_file = global_dir.path().join("config.toml");
    fs::write(
        &global_file,
        r#"
[explorer]
batch_size = 4
variants_per_node = 5

[provider]
critic_model = "global-critic"
"#,
    )
    .unwrap();

    let workspace = TempDir::new().unwrap();
    let config_dir = workspace.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("config.toml"),
        r#"
[explorer]
batch_size = 8

[budget]
limit_usd = 2.0
"#,
    )
    .unwrap();
    fs::write(
        config_dir.join("development.toml"),
        r#"
[priority]
trend = 0.9
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_with_global(workspace.path(), Some(global_file)).unwrap();
    assert_eq!(config.explorer.batch_size, 8);
    assert_eq!(config.explorer.variants_per_node, 5);
    assert_eq!(config.budget.limit_usd, 2.0);
    assert_eq!(config.priority.trend, 0.9);
    assert_eq!(config.priority.depth, 0.05);
    assert_eq!(config.provider.critic_model, "global-critic");
    assert_eq!(config.storage.backend, StorageBackend::Sled);
}

#[test]
fn test_environment_overrides_files() {
    let workspace = TempDir::new().unwrap();
    let config_dir = workspace.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("config.toml"), "[explorer]\nheartbeat_interval_ms = 500\n").unwrap();

    std::env::set_var("CANOPY__EXPLORER__HEARTBEAT_INTERVAL_MS", "750");
    let config = ConfigLoader::load_with_global(workspace.path(), None);
    std::env::remove_var("CANOPY__EXPLORER__HEARTBEAT_INTERVAL_MS");

    assert_eq!(config.unwrap().explorer.heartbeat_interval_ms, 750);
}

#[test]
fn test_missing_files_fall_back_to_defaults() {
    let workspace = TempDir::new().unwrap();
    let config = ConfigLoader::load_with_global(workspace.path(), None).unwrap();
    assert_eq!(config.explorer.batch_size, 20);
    assert_eq!(config.budget.limit_usd, 5.0);
    assert!(config.validate().is_ok());
}

#[test]
fn test_invalid_values_are_reported() {
    let workspace = TempDir::new().unwrap();
    let config_dir = workspace.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("config.toml"),
        "[explorer]\nbatch_size = 0\n\n[budget]\nlimit_usd = -3.0\n",
    )
    .unwrap();

    let config = ConfigLoader::load_with_global(workspace.path(), None).unwrap();
    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 2);
}

#[test]
fn test_config_drives_engine_settings() {
    let workspace = TempDir::new().unwrap();
    let config_dir = workspace.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("config.toml"),
        "[explorer]\nmax_traversal_depth = 8\ntop_k = 2\n\n[focus]\nboost_delta = 0.75\n\n[budget]\nlimit_usd = 0.5\n",
    )
    .unwrap();
    let config = ConfigLoader::load_with_global(workspace.path(), None).unwrap();

    let (_script, caps) = Script::new(&[]).into_capabilities();
    let engine = Engine::new(
        Arc::new(MemoryNodeStore::new()),
        caps,
        config.run_configuration(),
        config.explorer.engine_options(),
    );
    let settings = engine.settings().snapshot();
    assert_eq!(settings.top_k, 2);
    assert_eq!(settings.focus_boost, 0.75);
    assert_eq!(engine.ledger().limit(), 0.5);
    assert_eq!(engine.options().max_traversal_depth, 8);
}
