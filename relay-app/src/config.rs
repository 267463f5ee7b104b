//! chatrelay configuration loader.
//!
//! `~/.chatrelay/config.toml`, then environment overrides, then validation.

use relay_core::StreamingConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant replying in a chat app. Keep answers concise and use Markdown code blocks for code.";

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Overrides the provider endpoint, e.g. a local OpenAI-compatible server.
    #[serde(default)]
    pub llm_base_url: Option<String>,
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub webchat: WebChatConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebChatConfig {
    #[serde(default = "default_webchat_enabled")]
    pub enabled: bool,
}

fn default_webchat_enabled() -> bool {
    true
}

impl Default for WebChatConfig {
    fn default() -> Self {
        Self {
            enabled: default_webchat_enabled(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// Senders allowed on external channels, as `sender_id` or `channel:sender_id`.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    /// Respond to any sender on non-webchat channels.
    ///
    /// Off by default: Telegram bots are publicly reachable.
    #[serde(default)]
    pub allow_all_senders: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Capacity of the queue all channel adapters feed into.
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_max_in_flight() -> usize {
    256
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_inbound_queue() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_in_flight: default_max_in_flight(),
            request_timeout_secs: default_request_timeout_secs(),
            inbound_queue: default_inbound_queue(),
        }
    }
}

impl RelayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::from_toml_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Applies overrides from `lookup`; blank values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("CHATRELAY_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = var("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Some(v) = var("TELEGRAM_BOT_TOKEN") {
            self.channels.telegram.bot_token = v;
            self.channels.telegram.enabled = true;
        }
        if let Some(v) = var("CHATRELAY_BIND") {
            self.server.bind = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        self.bind_addr()?;
        if self.server.max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.max_in_flight must be > 0"));
        }
        if self.server.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("server.request_timeout_secs must be > 0"));
        }
        if self.server.inbound_queue == 0 {
            return Err(anyhow::anyhow!("server.inbound_queue must be > 0"));
        }
        if !self.channels.webchat.enabled && !self.channels.telegram.enabled {
            return Err(anyhow::anyhow!("at least one channel must be enabled"));
        }
        if self.channels.telegram.enabled && self.channels.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "channels.telegram.bot_token is required when telegram is enabled"
            ));
        }
        self.streaming
            .validate()
            .map_err(|e| anyhow::anyhow!("streaming: {e}"))?;
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("server.bind {:?} is invalid: {e}", self.server.bind))
    }

    pub fn api_key_for_model(&self) -> Option<String> {
        let model = self.general.model.to_ascii_lowercase();
        if model.starts_with("claude-") {
            return self
                .keys
                .anthropic_api_key
                .clone()
                .filter(|s| !s.is_empty());
        }
        self.keys.openai_api_key.clone().filter(|s| !s.is_empty())
    }

    /// WebChat is local and always open; other channels need an allowlist
    /// entry unless `allow_all_senders` is set.
    pub fn sender_allowed(&self, channel_id: &str, sender_id: &str) -> bool {
        if channel_id == "webchat" || self.security.allow_all_senders {
            return true;
        }
        let sender_id = sender_id.trim();
        self.security.allowed_users.iter().any(|entry| {
            let entry = entry.trim();
            match entry.split_once(':') {
                Some((channel, sender)) => {
                    channel.eq_ignore_ascii_case(channel_id) && sender == sender_id
                }
                None => entry == sender_id,
            }
        })
    }

    pub fn enabled_channels(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.channels.webchat.enabled {
            out.push("webchat");
        }
        if self.channels.telegram.enabled {
            out.push("telegram");
        }
        out
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".chatrelay").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
[general]
model = "gpt-4o-mini"
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = RelayConfig::from_toml_str(MINIMAL).expect("parse");
        assert!(cfg.channels.webchat.enabled);
        assert!(!cfg.channels.telegram.enabled);
        assert_eq!(cfg.server.bind, "127.0.0.1:3000");
        assert_eq!(cfg.streaming, StreamingConfig::default());
        assert!(cfg.general.system_prompt.contains("code blocks"));
        cfg.validate().expect("valid");
    }

    #[test]
    fn streaming_table_overrides_individual_knobs() {
        let cfg = RelayConfig::from_toml_str(
            r#"
[general]
model = "gpt-4o-mini"

[streaming]
size_threshold_chars = 200
breaker_threshold = 3
abandon_streaming_threshold = 4
"#,
        )
        .expect("parse");
        assert_eq!(cfg.streaming.size_threshold_chars, 200);
        assert_eq!(cfg.streaming.breaker_threshold, 3);
        assert_eq!(cfg.streaming.time_threshold_ms, 3_000);
        cfg.validate().expect("valid");
    }

    #[test]
    fn env_overrides_win_and_blank_values_are_ignored() {
        let mut cfg = RelayConfig::from_toml_str(MINIMAL).expect("parse");
        cfg.apply_env_overrides(env(&[
            ("CHATRELAY_MODEL", "claude-sonnet-4-5"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("OPENAI_API_KEY", "   "),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("CHATRELAY_BIND", "0.0.0.0:8080"),
        ]));
        assert_eq!(cfg.general.model, "claude-sonnet-4-5");
        assert_eq!(cfg.api_key_for_model().as_deref(), Some("sk-ant"));
        assert_eq!(cfg.keys.openai_api_key, None);
        assert!(cfg.channels.telegram.enabled);
        assert_eq!(cfg.bind_addr().expect("addr").port(), 8080);
        assert_eq!(cfg.enabled_channels(), vec!["webchat", "telegram"]);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = RelayConfig::from_toml_str(MINIMAL).expect("parse");
        cfg.server.bind = "not-an-addr".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::from_toml_str(MINIMAL).expect("parse");
        cfg.channels.telegram.enabled = true;
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::from_toml_str(MINIMAL).expect("parse");
        cfg.channels.webchat.enabled = false;
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::from_toml_str(MINIMAL).expect("parse");
        cfg.streaming.abandon_streaming_threshold = cfg.streaming.breaker_threshold;
        let err = cfg.validate().expect_err("abandon must exceed breaker");
        assert!(err.to_string().starts_with("streaming:"));
    }

    #[test]
    fn missing_model_is_a_parse_error() {
        assert!(RelayConfig::from_toml_str("[channels.webchat]\nenabled = true\n").is_err());
    }

    #[test]
    fn allowlist_matches_plain_and_channel_scoped_entries() {
        let mut cfg = RelayConfig::from_toml_str(MINIMAL).expect("parse");
        cfg.security.allowed_users = vec!["42".to_string(), "telegram:7".to_string()];

        assert!(cfg.sender_allowed("webchat", "anyone"));
        assert!(cfg.sender_allowed("telegram", "42"));
        assert!(cfg.sender_allowed("telegram", "7"));
        assert!(!cfg.sender_allowed("telegram", "8"));
        assert!(!cfg.sender_allowed("discord", "7"));

        cfg.security.allow_all_senders = true;
        assert!(cfg.sender_allowed("telegram", "8"));
    }
}
