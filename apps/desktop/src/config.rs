use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use client_core::EngineSettings;
use serde::Deserialize;
use shared::domain::{IdFormat, UserName, DEFAULT_ID_HEX_LEN};
use tracing::warn;
use url::Url;

pub const CONFIG_FILE: &str = "chat.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server_url: String,
    pub username: Option<String>,
    pub token: Option<String>,
    pub confirm_tolerance_ms: u64,
    pub id_hex_len: usize,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            username: None,
            token: None,
            confirm_tolerance_ms: 5_000,
            id_hex_len: DEFAULT_ID_HEX_LEN,
            log_filter: "info".into(),
        }
    }
}

impl Settings {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            confirm_tolerance: Duration::from_millis(self.confirm_tolerance_ms),
            id_format: IdFormat::hex(self.id_hex_len),
        }
    }

    /// Event stream endpoint: `ws(s)://host/ws/{username}?token=...`.
    pub fn ws_url(&self, username: &UserName) -> anyhow::Result<String> {
        let mut url = Url::parse(self.server_url.trim())
            .with_context(|| format!("invalid server_url '{}'", self.server_url))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            _ => return Err(anyhow!("server_url must start with http:// or https://")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("failed to derive websocket url from '{}'", self.server_url))?;
        url.set_path(&format!("/ws/{username}"));
        url.set_query(None);
        if let Some(token) = self.token.as_deref().filter(|token| !token.is_empty()) {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.to_string())
    }
}

pub fn load_settings(path: &Path) -> Settings {
    load_settings_with(path, |key| std::env::var(key).ok())
}

/// File values override defaults; environment overrides the file.
pub fn load_settings_with(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<Settings>(&raw) {
            Ok(file_cfg) => settings = file_cfg,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "config: ignoring unreadable config file");
            }
        }
    }

    if let Some(v) = env("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = env("CHAT_USERNAME") {
        settings.username = Some(v);
    }
    if let Some(v) = env("CHAT_TOKEN") {
        settings.token = Some(v);
    }

    if let Some(v) = env("APP__CONFIRM_TOLERANCE_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.confirm_tolerance_ms = parsed;
        }
    }
    if let Some(v) = env("APP__ID_HEX_LEN") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.id_hex_len = parsed;
        }
    }

    if let Some(v) = env("APP__LOG_FILTER") {
        settings.log_filter = v;
    }

    settings
}
