use std::sync::Arc;

use parley_core::config::DiscordConfig;
use serenity::all::ActivityData;
use serenity::async_trait;
use serenity::model::application::Interaction;
use serenity::model::channel::{GuildChannel, Message, MessageFlags, PartialGuildChannel};
use serenity::model::event::MessageUpdateEvent;
use serenity::model::gateway::Ready;
use serenity::model::id::{ChannelId, GuildId, MessageId};
use serenity::model::user::OnlineStatus;
use serenity::prelude::{Context, EventHandler};
use tracing::{debug, info, warn};

use crate::app::ParleyApp;
use crate::attach;
use crate::commands;
use crate::model::SourceMessage;
use crate::respond;

/// Serenity event handler wired to the chat sessions.
pub struct ParleyHandler {
    pub app: Arc<ParleyApp>,
}

impl ParleyHandler {
    pub fn new(app: Arc<ParleyApp>) -> Self {
        Self { app }
    }

    async fn source(&self, msg: &Message) -> SourceMessage {
        let attachments = attach::fetch_all(
            &self.app.http_client,
            &msg.attachments,
            self.app.config.discord.max_attachment_bytes,
        )
        .await;
        SourceMessage::from_message(msg, attachments)
    }
}

#[async_trait]
impl EventHandler for ParleyHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        self.app.set_bot_id(ready.user.id);

        // Config-driven presence.
        let discord = &self.app.config.discord;
        ctx.set_presence(build_activity(discord), parse_online_status(&discord.status));

        info!(name = %ready.user.name, guilds = ready.guilds.len(), "Discord bot connected");

        if discord.register_commands {
            let guild = discord.guild_id.map(GuildId::new);
            if let Err(e) = commands::register_commands(&ctx.http, guild).await {
                warn!(error = %e, "failed to register slash commands");
            }
        }
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let Some(bot) = self.app.bot_id() else {
            return;
        };
        if msg.guild_id.is_none() || msg.author.id == bot {
            return;
        }
        let thread = msg.channel_id.get();
        if self.app.sessions.is_invalid(thread) {
            return;
        }

        let history = match self.app.history(&ctx.http) {
            Ok(h) => h,
            Err(e) => {
                debug!(error = %e, "message before ready");
                return;
            }
        };
        let source = self.source(&msg).await;

        let mut guard = match self.app.sessions.acquire(thread, &history).await {
            Ok(Some(guard)) => guard,
            Ok(None) => return,
            Err(e) => {
                warn!(thread, error = %e, "failed to load session");
                return;
            }
        };
        let Some(session) = guard.as_mut() else {
            return;
        };

        let respond = session.should_respond(&source);
        session.ingest(&source);
        if !(respond && session.is_latest(source.id)) {
            return;
        }

        if let Err(e) = respond::answer(&self.app, &ctx.http, session).await {
            warn!(thread, error = %e, "failed to post answer");
        }
    }

    async fn message_update(
        &self,
        ctx: Context,
        old_if_available: Option<Message>,
        new: Option<Message>,
        event: MessageUpdateEvent,
    ) {
        let thread = event.channel_id.get();
        let Some(mut guard) = self.app.sessions.cached(thread).await else {
            return;
        };
        let Some(session) = guard.as_mut() else {
            return;
        };

        let msg = match new {
            Some(msg) => msg,
            None => match event.channel_id.message(&ctx.http, event.id).await {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(thread, message = %event.id, error = %e, "failed to fetch edited message");
                    return;
                }
            },
        };
        let source = self.source(&msg).await;
        // Without a cached copy, a command reply we never took in is assumed
        // to have been the loading placeholder.
        let was_loading = match &old_if_available {
            Some(old) => old.flags.is_some_and(|f| f.contains(MessageFlags::LOADING)),
            None => source.interaction.is_some() && !session.contains(source.id),
        };
        if !session.update(&source) {
            return;
        }
        debug!(thread, message = %event.id, "entry updated");

        if session.answers_edit(was_loading, &source) {
            if let Err(e) = respond::answer(&self.app, &ctx.http, session).await {
                warn!(thread, error = %e, "failed to post answer");
            }
        }
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        remove_messages(&self.app, channel_id, &[deleted_message_id]).await;
    }

    async fn message_delete_bulk(
        &self,
        _ctx: Context,
        channel_id: ChannelId,
        multiple_deleted_messages_ids: Vec<MessageId>,
        _guild_id: Option<GuildId>,
    ) {
        remove_messages(&self.app, channel_id, &multiple_deleted_messages_ids).await;
    }

    async fn thread_delete(
        &self,
        _ctx: Context,
        thread: PartialGuildChannel,
        _full_thread_data: Option<GuildChannel>,
    ) {
        self.app.sessions.forget(thread.id.get());
        self.app.dispatcher.ledger().forget(thread.id.get());
        debug!(thread = %thread.id, "thread deleted, session dropped");
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            commands::handle_interaction(&self.app, &ctx, &command).await;
        }
    }
}

async fn remove_messages(app: &ParleyApp, channel_id: ChannelId, ids: &[MessageId]) {
    let thread = channel_id.get();
    let Some(mut guard) = app.sessions.cached(thread).await else {
        return;
    };
    let Some(session) = guard.as_mut() else {
        return;
    };
    let removed = ids.iter().filter(|id| session.remove(id.get())).count();
    if removed > 0 {
        debug!(thread, removed, "entries removed");
    }
}

/// Parse a config status string into serenity's `OnlineStatus`.
fn parse_online_status(s: &str) -> OnlineStatus {
    match s.to_lowercase().as_str() {
        "idle" => OnlineStatus::Idle,
        "dnd" | "do_not_disturb" => OnlineStatus::DoNotDisturb,
        "invisible" => OnlineStatus::Invisible,
        _ => OnlineStatus::Online,
    }
}

/// Build an `ActivityData` from the Discord config.
fn build_activity(config: &DiscordConfig) -> Option<ActivityData> {
    let name = config.activity_name.as_deref()?;
    let kind = config.activity_type.as_deref().unwrap_or("playing");
    Some(match kind.to_lowercase().as_str() {
        "listening" => ActivityData::listening(name),
        "watching" => ActivityData::watching(name),
        "competing" => ActivityData::competing(name),
        "custom" => ActivityData::custom(name),
        _ => ActivityData::playing(name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings() {
        assert_eq!(parse_online_status("DND"), OnlineStatus::DoNotDisturb);
        assert_eq!(parse_online_status("idle"), OnlineStatus::Idle);
        assert_eq!(parse_online_status("whatever"), OnlineStatus::Online);
    }

    #[test]
    fn activity_needs_a_name() {
        let mut config = DiscordConfig::default();
        assert!(build_activity(&config).is_none());

        config.activity_name = Some("threads".into());
        config.activity_type = Some("watching".into());
        let activity = build_activity(&config).unwrap();
        assert_eq!(activity.name, "threads");
    }
}
