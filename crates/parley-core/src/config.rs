use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::{ReplyTo, ResponseTiming};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 256 * 1024; // text files only
pub const DEFAULT_RESPONSE_RESERVE: u32 = 512;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 30;

/// Top-level config (parley.toml + PARLEY_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParleyConfig {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Falls back to the DISCORD_BOT_TOKEN env var when empty.
    #[serde(default)]
    pub bot_token: String,
    /// online | idle | dnd | invisible
    #[serde(default = "default_status")]
    pub status: String,
    pub activity_name: Option<String>,
    /// playing | listening | watching | competing | custom
    pub activity_type: Option<String>,
    /// Register slash commands when the gateway reports ready.
    #[serde(default = "bool_true")]
    pub register_commands: bool,
    /// Register commands for a single guild instead of globally.
    pub guild_id: Option<u64>,
    /// Attachments larger than this are not downloaded.
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
    /// Per-request limit for attachment and session card downloads.
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            status: default_status(),
            activity_name: None,
            activity_type: None,
            register_commands: true,
            guild_id: None,
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

/// OpenAI-compatible completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Falls back to the OPENAI_API_KEY env var when empty.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_openai_base_url(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Defaults for new chat sessions. Most of these can be overridden per
/// thread through `/chat` options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Literal system message; wins over `preset` when set.
    pub system_message: Option<String>,
    #[serde(default)]
    pub response_timing: ResponseTiming,
    #[serde(default)]
    pub reply_to: ReplyTo,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    pub max_tokens: Option<u32>,
    /// Tokens kept free for the completion when trimming context.
    #[serde(default = "default_response_reserve")]
    pub response_reserve: u32,
    /// Overrides the built-in context window table for the model.
    pub context_window: Option<u32>,
    #[serde(default)]
    pub stream_responses: bool,
    #[serde(default = "bool_true")]
    pub auto_title: bool,
    /// Fraction of the context window above which a warning is posted.
    #[serde(default = "default_token_warning_ratio")]
    pub token_warning_ratio: f32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            preset: default_preset(),
            system_message: None,
            response_timing: ResponseTiming::default(),
            reply_to: ReplyTo::default(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: None,
            response_reserve: DEFAULT_RESPONSE_RESERVE,
            context_window: None,
            stream_responses: false,
            auto_title: true,
            token_warning_ratio: default_token_warning_ratio(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_status() -> String {
    "online".to_string()
}
fn default_max_attachment_bytes() -> u64 {
    DEFAULT_MAX_ATTACHMENT_BYTES
}
fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}
fn default_preset() -> String {
    "chatgpt".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    1.0
}
fn default_response_reserve() -> u32 {
    DEFAULT_RESPONSE_RESERVE
}
fn default_token_warning_ratio() -> f32 {
    0.75
}

impl ParleyConfig {
    /// Load config from a TOML file with PARLEY_* env var overrides.
    ///
    /// Nested keys use a double underscore: `PARLEY_CHAT__MODEL=gpt-4o`.
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. PARLEY_CONFIG env var
    ///   3. ~/.parley/parley.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("PARLEY_CONFIG").ok())
            .unwrap_or_else(default_config_path);
        tracing::debug!(path = %path, "loading config");

        let mut config: ParleyConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("PARLEY_").split("__"))
            .extract()
            .map_err(|e| crate::error::ParleyError::Config(e.to_string()))?;

        config.apply_secret_fallbacks();
        config.validate()?;
        Ok(config)
    }

    /// Fill empty secrets from the conventional env vars.
    fn apply_secret_fallbacks(&mut self) {
        if self.discord.bot_token.is_empty() {
            if let Ok(token) = std::env::var("DISCORD_BOT_TOKEN") {
                self.discord.bot_token = token;
            }
        }
        if self.provider.api_key.is_empty() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                self.provider.api_key = key;
            }
        }
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if !(0.0..=1.0).contains(&self.chat.token_warning_ratio) {
            return Err(crate::error::ParleyError::Config(format!(
                "chat.token_warning_ratio must be within 0..=1, got {}",
                self.chat.token_warning_ratio
            )));
        }
        if !(0.0..=2.0).contains(&self.chat.temperature) {
            return Err(crate::error::ParleyError::Config(format!(
                "chat.temperature must be within 0..=2, got {}",
                self.chat.temperature
            )));
        }
        if self.discord.download_timeout_secs == 0 {
            return Err(crate::error::ParleyError::Config(
                "discord.download_timeout_secs must be at least 1".to_string(),
            ));
        }
        self.chat
            .preset
            .parse::<crate::preset::Preset>()
            .map(|_| ())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.parley/parley.toml", home)
}
