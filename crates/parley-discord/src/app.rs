use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parley_agent::{CompletionDispatcher, LlmProvider};
use parley_core::ParleyConfig;
use serenity::http::Http;
use serenity::model::id::UserId;
use tracing::warn;

use crate::context::Budget;
use crate::error::{DiscordError, Result};
use crate::registry::{DiscordHistory, SessionRegistry};

/// Shared state for the event handler and command handlers.
pub struct ParleyApp {
    pub config: Arc<ParleyConfig>,
    pub dispatcher: CompletionDispatcher,
    pub sessions: SessionRegistry,
    /// Client for attachment and session card downloads.
    pub http_client: reqwest::Client,
    bot_id: OnceLock<UserId>,
}

impl ParleyApp {
    pub fn new(config: Arc<ParleyConfig>, provider: Box<dyn LlmProvider>) -> Self {
        let dispatcher = CompletionDispatcher::from_config(provider, &config.chat);
        Self {
            http_client: download_client(config.discord.download_timeout_secs),
            config,
            dispatcher,
            sessions: SessionRegistry::new(),
            bot_id: OnceLock::new(),
        }
    }

    /// Set once the gateway reports ready.
    pub fn bot_id(&self) -> Option<UserId> {
        self.bot_id.get().copied()
    }

    pub(crate) fn set_bot_id(&self, id: UserId) {
        self.bot_id.set(id).ok();
    }

    /// History reader for rebuilding sessions; needs the bot id from `ready`.
    pub fn history(&self, http: &Arc<Http>) -> Result<DiscordHistory> {
        let bot = self.bot_id().ok_or(DiscordError::NotReady)?;
        Ok(DiscordHistory {
            http: Arc::clone(http),
            client: self.http_client.clone(),
            bot: bot.get(),
            max_attachment_bytes: self.config.discord.max_attachment_bytes,
        })
    }

    pub fn budget(&self, model: &str) -> Budget {
        Budget {
            window: self.dispatcher.context_window(model),
            reserve: self.config.chat.response_reserve,
        }
    }
}

/// Client for Discord CDN downloads, bounded by `discord.download_timeout_secs`.
fn download_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "falling back to default download client");
            reqwest::Client::new()
        })
}
