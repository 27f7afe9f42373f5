use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::debug;
use vidpub_core::Settings;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub state_path: PathBuf,
    pub media_dir: PathBuf,
    pub settings_path: PathBuf,
    pub scheduler_enabled: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            state_path: lookup("VIDPUB_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state/site.json")),
            media_dir: lookup("VIDPUB_MEDIA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state/media")),
            settings_path: lookup("VIDPUB_SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./settings.yaml")),
            scheduler_enabled: lookup("VIDPUB_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            user_agent: lookup("VIDPUB_USER_AGENT")
                .unwrap_or_else(|| format!("vidpub/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: lookup("VIDPUB_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            http_max_retries: lookup("VIDPUB_HTTP_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            web_port: lookup("VIDPUB_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

/// Reads settings from YAML (when the file exists) and overlays the API env vars.
pub async fn load_settings(path: &Path) -> Result<Settings> {
    let from_file = if fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        parse_settings(&text).with_context(|| format!("parsing {}", path.display()))?
    } else {
        debug!(path = %path.display(), "settings file not found, using defaults");
        Settings::default()
    };
    Ok(apply_env_overrides(from_file, |key| std::env::var(key).ok()))
}

pub fn parse_settings(text: &str) -> Result<Settings> {
    if text.trim().is_empty() {
        return Ok(Settings::default());
    }
    Ok(serde_yaml::from_str::<Settings>(text)?.sanitized())
}

pub fn apply_env_overrides(mut settings: Settings, lookup: impl Fn(&str) -> Option<String>) -> Settings {
    if let Some(base) = lookup("VIDPUB_API_BASE_URL") {
        settings.api_base_url = base;
    }
    if let Some(key) = lookup("VIDPUB_API_KEY") {
        settings.api_key = key;
    }
    if let Some(project) = lookup("VIDPUB_PROJECT_ID") {
        settings.project_id = project;
    }
    settings.sanitized()
}
