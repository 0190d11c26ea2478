/// Errors produced by the Discord adapter.
#[derive(Debug, thiserror::Error)]
pub enum DiscordError {
    #[error("serenity error: {0}")]
    Serenity(#[from] serenity::Error),

    #[error("no bot token configured")]
    NoToken,

    #[error("completion failed: {0}")]
    Provider(#[from] parley_agent::ProviderError),

    #[error("invalid session options: {0}")]
    Options(#[from] parley_core::ParleyError),

    #[error("session card could not be read: {0}")]
    InvalidSession(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("This command only works inside a chat thread.")]
    NotAChatThread,

    #[error("This command only works in a server text channel.")]
    NotATextChannel,

    #[error("There is no answer to regenerate yet.")]
    NothingToRegenerate,

    #[error("Only the person who started this chat can do that.")]
    NotChatOwner,

    #[error("bot is not connected yet")]
    NotReady,
}

impl DiscordError {
    /// Message shown to the user, without internal detail where possible.
    pub fn user_reason(&self) -> String {
        match self {
            DiscordError::Provider(e) => e.user_reason(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DiscordError>;
