use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParleyError;

/// When the bot answers a qualifying message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseTiming {
    /// Answer after every qualifying message.
    #[default]
    EveryMessage,
    /// Answer only when the bot is explicitly mentioned.
    MentionOnly,
}

impl ResponseTiming {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EveryMessage => "every-message",
            Self::MentionOnly => "mention-only",
        }
    }

    pub const ALL: [ResponseTiming; 2] = [Self::EveryMessage, Self::MentionOnly];
}

impl fmt::Display for ResponseTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseTiming {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(' ', "-").as_str() {
            "every-message" | "immediately" => Ok(Self::EveryMessage),
            "mention-only" | "when-mentioned" => Ok(Self::MentionOnly),
            _ => Err(ParleyError::InvalidOption {
                option: "response_timing".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Which authors may trigger a response.
///
/// Messages from excluded authors still become context; they just never
/// cause the bot to answer on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplyTo {
    /// Any actor, including other bots and Discord system events.
    Anyone,
    /// Any human actor.
    AnyHuman,
    /// Only the user who started the thread.
    #[default]
    PrimaryUserOnly,
}

impl ReplyTo {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anyone => "anyone",
            Self::AnyHuman => "any-human",
            Self::PrimaryUserOnly => "primary-user-only",
        }
    }

    pub const ALL: [ReplyTo; 3] = [Self::Anyone, Self::AnyHuman, Self::PrimaryUserOnly];
}

impl fmt::Display for ReplyTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplyTo {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(' ', "-").as_str() {
            "anyone" => Ok(Self::Anyone),
            "any-human" => Ok(Self::AnyHuman),
            "primary-user-only" | "initial-user" => Ok(Self::PrimaryUserOnly),
            _ => Err(ParleyError::InvalidOption {
                option: "reply_to".to_string(),
                value: s.to_string(),
            }),
        }
    }
}
