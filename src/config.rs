use anyhow::{anyhow, Result};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::conversation::{TokenSource, ViewportSettings};
use crate::models::ConversationContext;

/// Tuning knobs for the conversation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub near_bottom_threshold: f64,
    pub top_threshold: f64,
    pub scroll_debounce_ms: u64,
    pub echo_window_secs: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let viewport = ViewportSettings::default();
        EngineSettings {
            near_bottom_threshold: viewport.near_bottom_threshold,
            top_threshold: viewport.top_threshold,
            scroll_debounce_ms: viewport.debounce.as_millis() as u64,
            echo_window_secs: 10,
        }
    }
}

impl EngineSettings {
    /// Thresholds for hosts that measure the view in text rows.
    pub fn rows() -> Self {
        EngineSettings {
            near_bottom_threshold: 2.0,
            top_threshold: 1.0,
            ..Self::default()
        }
    }

    pub fn viewport(&self) -> ViewportSettings {
        ViewportSettings {
            near_bottom_threshold: self.near_bottom_threshold,
            top_threshold: self.top_threshold,
            debounce: std::time::Duration::from_millis(self.scroll_debounce_ms),
        }
    }

    pub fn echo_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.echo_window_secs.max(0))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    pub conversation: ConversationContext,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl AppConfig {
    pub fn new(conversation: ConversationContext) -> Self {
        AppConfig {
            conversation,
            engine: EngineSettings::default(),
            token: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.conversation;
        if c.local_user_id.trim().is_empty() || c.remote_user_id.trim().is_empty() {
            return Err(anyhow!("Both participant ids must be set"));
        }
        if c.local_user_id == c.remote_user_id {
            return Err(anyhow!("Local and remote participant are the same user: {}", c.local_user_id));
        }
        if c.conversation_id.trim().is_empty() {
            return Err(anyhow!("Conversation id must be set"));
        }
        if c.page_size == 0 {
            return Err(anyhow!("Page size must be at least 1"));
        }
        if self.engine.scroll_debounce_ms > 5_000 {
            return Err(anyhow!("Scroll debounce of {}ms is too long", self.engine.scroll_debounce_ms));
        }
        Ok(())
    }

    /// Apply `PARLEY_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(local) = lookup("PARLEY_LOCAL_USER") {
            self.conversation.local_user_id = local;
        }
        if let Some(remote) = lookup("PARLEY_REMOTE_USER") {
            self.conversation.remote_user_id = remote;
        }
        if let Some(conversation) = lookup("PARLEY_CONVERSATION") {
            self.conversation.conversation_id = conversation;
        }
        if let Some(page_size) = lookup("PARLEY_PAGE_SIZE") {
            self.conversation.page_size = page_size
                .trim()
                .parse()
                .map_err(|e| anyhow!("Invalid PARLEY_PAGE_SIZE {:?}: {}", page_size, e))?;
        }
        if let Some(token) = lookup("PARLEY_TOKEN") {
            self.token = if token.is_empty() { None } else { Some(token) };
        }
        Ok(())
    }
}

/// Bearer token held in memory for the lifetime of the process.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        StaticToken(token)
    }
}

impl TokenSource for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point config loading and saving at `path` for the rest of the process.
pub fn set_config_path_override(path: PathBuf) -> bool {
    CONFIG_PATH_OVERRIDE.set(path).is_ok()
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("parley");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("conversation.json"))
}

pub fn load_config() -> Result<Option<AppConfig>> {
    let config_path = get_config_path()?;
    if !config_path.exists() {
        return Ok(None);
    }
    load_config_from(&config_path).map(Some)
}

pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config: AppConfig = serde_json::from_str(&contents)
        .map_err(|e| anyhow!("Invalid config {}: {}", path.display(), e))?;
    info!(
        "Loaded conversation {} for {} from {}",
        config.conversation.conversation_id,
        config.conversation.local_user_id,
        path.display()
    );
    Ok(config)
}

pub fn save_config(config: &AppConfig) -> Result<()> {
    save_config_to(config, &get_config_path()?)
}

pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;

    info!("Config saved to {}", path.display());
    Ok(())
}
