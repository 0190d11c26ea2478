//! System-message presets.
//!
//! Each preset is a pure function from [`PresetParams`] to an optional system
//! message. Custom system messages go through the same `${name}` substitution
//! over the same fixed parameter set; unknown placeholders are left as-is.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

/// Values available to preset templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetParams {
    /// Mention of the bot, e.g. `<@1234>`.
    pub assistant: String,
    /// Mention of the invoking user.
    pub user: String,
    /// Server (guild) name, `None` outside a guild.
    pub server: Option<String>,
    /// Mention of the channel the command was used in.
    pub channel: Option<String>,
    pub current_date: NaiveDate,
}

impl PresetParams {
    fn lookup(&self, name: &str) -> Option<String> {
        let value = match name {
            "assistant" => self.assistant.clone(),
            "user" => self.user.clone(),
            "server" => self.server.clone().unwrap_or_else(|| "(none)".to_string()),
            "channel" => self.channel.clone().unwrap_or_else(|| "(none)".to_string()),
            "current_date" => self.current_date.format("%Y-%m-%d").to_string(),
            "discord" => self.discord_line(),
            _ => return None,
        };
        Some(value)
    }

    fn discord_line(&self) -> String {
        format!(
            "You are talking to {} over Discord. Server name: {}. Channel: {}",
            self.user,
            self.server.as_deref().unwrap_or("(none)"),
            self.channel.as_deref().unwrap_or("(none)"),
        )
    }
}

/// The closed set of named presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    #[default]
    #[serde(rename = "chatgpt")]
    ChatGpt,
    Assistant,
    Empty,
}

impl Preset {
    pub const ALL: [Preset; 3] = [Self::ChatGpt, Self::Assistant, Self::Empty];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatGpt => "chatgpt",
            Self::Assistant => "assistant",
            Self::Empty => "empty",
        }
    }

    /// Human-facing label used for command choices.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ChatGpt => "ChatGPT",
            Self::Assistant => "Discord assistant",
            Self::Empty => "Empty",
        }
    }

    /// Render the system message, or `None` for presets without one.
    pub fn render(&self, params: &PresetParams) -> Option<String> {
        match self {
            Self::ChatGpt => Some(format!(
                "You are ChatGPT, a large language model trained by OpenAI. \
                 Answer as detailed and insightful as possible. \
                 You are taking questions from {} over Discord.",
                params.user
            )),
            Self::Assistant => Some(format!(
                "You are {}, a helpful assistant. {}. Current date: {}.",
                params.assistant,
                params.discord_line(),
                params.current_date.format("%Y-%m-%d"),
            )),
            Self::Empty => None,
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted || p.label().to_lowercase() == wanted)
            .ok_or_else(|| ParleyError::UnknownPreset(s.to_string()))
    }
}

/// Where a session's system message comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum SystemSource {
    Preset(Preset),
    Custom(String),
}

impl SystemSource {
    /// A literal system message wins over the preset name.
    pub fn resolve(preset: &str, system_message: Option<&str>) -> Result<Self> {
        match system_message.map(str::trim).filter(|m| !m.is_empty()) {
            Some(message) => Ok(Self::Custom(message.to_string())),
            None => Ok(Self::Preset(preset.parse()?)),
        }
    }

    pub fn render(&self, params: &PresetParams) -> Option<String> {
        match self {
            Self::Preset(preset) => preset.render(params),
            Self::Custom(template) => Some(substitute(template, params)),
        }
    }
}

/// Replace `${name}` placeholders with values from `params`.
pub fn substitute(template: &str, params: &PresetParams) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match params.lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
