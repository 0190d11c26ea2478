use std::sync::Arc;
use std::time::Duration;

use serenity::model::gateway::GatewayIntents;
use serenity::Client;
use tracing::{error, info, warn};

use crate::app::ParleyApp;
use crate::error::{DiscordError, Result};
use crate::handler::ParleyHandler;

const RETRY_DELAY: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Wraps a serenity `Client` and drives the event loop until the process exits.
/// Reconnects whenever the gateway drops.
pub struct DiscordAdapter {
    app: Arc<ParleyApp>,
}

impl DiscordAdapter {
    pub fn new(app: Arc<ParleyApp>) -> Result<Self> {
        if app.config.discord.bot_token.trim().is_empty() {
            return Err(DiscordError::NoToken);
        }
        Ok(Self { app })
    }

    fn intents() -> GatewayIntents {
        GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
    }

    /// Connect to Discord and keep reconnecting whenever the gateway drops.
    ///
    /// Never returns; runs for the lifetime of the process.
    pub async fn run(self) {
        let mut client = self.connect("initial connect").await;

        loop {
            info!("Discord: gateway connecting");

            if let Err(e) = client.start().await {
                warn!(error = %e, "Discord: gateway error, reconnecting in 5s");
            } else {
                info!("Discord: gateway stopped cleanly, reconnecting in 5s");
            }

            tokio::time::sleep(RECONNECT_DELAY).await;
            client = self.connect("reconnect").await;
        }
    }

    /// Build a client, retrying until it succeeds.
    async fn connect(&self, attempt: &str) -> Client {
        loop {
            match self.build_client().await {
                Ok(c) => break c,
                Err(e) => {
                    error!(error = %e, "Discord: {attempt} failed, retrying in 30s");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    /// Build a fresh serenity `Client` with our event handler.
    async fn build_client(&self) -> std::result::Result<Client, serenity::Error> {
        let handler = ParleyHandler::new(Arc::clone(&self.app));
        Client::builder(&self.app.config.discord.bot_token, Self::intents())
            .event_handler(handler)
            .await
    }
}
