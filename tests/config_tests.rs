// Config file tests
// Saving and loading through the process-wide path override.

use anyhow::Result;

use parley::config::{self, AppConfig, EngineSettings};
use parley::models::ConversationContext;

mod common;

#[test]
fn test_config_saved_and_loaded_through_override() -> Result<()> {
    common::setup_logging();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("conversation.json");
    assert!(config::set_config_path_override(path.clone()));

    assert!(config::load_config()?.is_none());

    let mut cfg = AppConfig::new(ConversationContext::new("finder", "owner", "lost-umbrella", 25));
    cfg.engine = EngineSettings {
        near_bottom_threshold: 3.0,
        top_threshold: 1.0,
        scroll_debounce_ms: 50,
        echo_window_secs: 5,
    };
    config::save_config(&cfg)?;
    assert!(path.exists());

    let loaded = config::load_config()?.expect("config was just saved");
    assert_eq!(loaded, cfg);
    loaded.validate()?;

    let raw = std::fs::read_to_string(&path)?;
    assert!(!raw.contains("token"));
    Ok(())
}

#[test]
fn test_malformed_config_is_an_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json")?;
    assert!(config::load_config_from(&path).is_err());
    Ok(())
}
