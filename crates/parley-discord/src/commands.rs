//! Slash commands: `/chat`, `/ask`, `/regenerate`, `/stats`, `/comment`,
//! plus the thread management commands `/rebuild`, `/rename`, `/end` and the
//! "Chat: Delete" message command.
//!
//! Registration happens in `ready()` when `discord.register_commands` is set,
//! or from `parley sync-commands`. Interactions are dispatched from
//! `interaction_create` in the event handler.

use std::sync::Arc;

use chrono::Utc;
use parley_agent::Message;
use parley_core::{Preset, ReplyTo, ResponseTiming, SystemSource};
use serenity::builder::{
    CreateAttachment, CreateCommand, CreateCommandOption, CreateEmbed, CreateInteractionResponse,
    CreateInteractionResponseMessage, CreateMessage, CreateThread, EditInteractionResponse,
    EditThread,
};
use serenity::http::Http;
use serenity::model::application::{
    Command, CommandDataOption, CommandInteraction, CommandOptionType, CommandType, ResolvedTarget,
};
use serenity::model::channel::ChannelType;
use serenity::model::id::{ChannelId, GuildId};
use serenity::prelude::Context;
use tracing::{info, warn};

use crate::app::ParleyApp;
use crate::error::{DiscordError, Result};
use crate::notice;
use crate::respond;
use crate::send::{self, Chunk};
use crate::model::SourceMessage;
use crate::normalize;
use crate::session::{ChatSession, SessionOptions};

/// Discord caps thread names at 100 characters.
const THREAD_NAME_CHARS: usize = 100;
const DEFAULT_THREAD_NAME: &str = "New chat";
const DELETE_MESSAGE: &str = "Chat: Delete";

/// Command definitions, shared by `ready()` and `parley sync-commands`.
pub fn definitions() -> Vec<CreateCommand> {
    vec![
        CreateCommand::new("chat")
            .description("Start a chat thread with the bot")
            .add_option(CreateCommandOption::new(
                CommandOptionType::String,
                "message",
                "Opening message",
            ))
            .add_option(preset_option())
            .add_option(CreateCommandOption::new(
                CommandOptionType::String,
                "system_message",
                "Custom system message; ${user}, ${assistant}, ${server}, ${channel}, ${current_date} are filled in",
            ))
            .add_option(model_option())
            .add_option(
                ResponseTiming::ALL.iter().fold(
                    CreateCommandOption::new(
                        CommandOptionType::String,
                        "response_timing",
                        "When the bot answers",
                    ),
                    |opt, t| opt.add_string_choice(t.as_str(), t.as_str()),
                ),
            )
            .add_option(ReplyTo::ALL.iter().fold(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "reply_to",
                    "Whose messages the bot answers",
                ),
                |opt, r| opt.add_string_choice(r.as_str(), r.as_str()),
            ))
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::Number,
                    "temperature",
                    "Sampling temperature",
                )
                .min_number_value(0.0)
                .max_number_value(2.0),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::Integer,
                    "max_tokens",
                    "Upper bound on the length of each answer",
                )
                .min_int_value(1),
            )
            .add_option(CreateCommandOption::new(
                CommandOptionType::Boolean,
                "private",
                "Start a private thread",
            )),
        CreateCommand::new("ask")
            .description("Ask the bot a one-off question")
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "message", "Your question")
                    .required(true),
            )
            .add_option(preset_option())
            .add_option(model_option()),
        CreateCommand::new("regenerate").description("Replace the last answer in this thread"),
        CreateCommand::new("stats").description("Show this thread's settings and token usage"),
        CreateCommand::new("comment")
            .description("Post a remark the bot will not read")
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "text", "Your remark")
                    .required(true),
            ),
        CreateCommand::new("rebuild").description("Re-read this thread's history"),
        CreateCommand::new("rename")
            .description("Rename this chat thread")
            .add_option(CreateCommandOption::new(
                CommandOptionType::String,
                "title",
                "New name; leave empty to let the model suggest one",
            )),
        CreateCommand::new("end").description("Delete this chat thread"),
        CreateCommand::new(DELETE_MESSAGE).kind(CommandType::Message),
    ]
}

fn preset_option() -> CreateCommandOption {
    Preset::ALL.iter().fold(
        CreateCommandOption::new(CommandOptionType::String, "preset", "System message preset"),
        |opt, p| opt.add_string_choice(p.label(), p.as_str()),
    )
}

fn model_option() -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::String, "model", "Model to use")
}

/// Register the commands globally, or for one guild. Returns how many
/// commands Discord accepted.
pub async fn register_commands(http: &Http, guild_id: Option<GuildId>) -> Result<usize> {
    let commands = definitions();
    let count = match guild_id {
        Some(gid) => {
            let cmds = gid.set_commands(http, commands).await?;
            info!(guild = %gid, count = cmds.len(), "registered guild slash commands");
            cmds.len()
        }
        None => {
            let cmds = Command::set_global_commands(http, commands).await?;
            info!(count = cmds.len(), "registered global slash commands");
            cmds.len()
        }
    };
    Ok(count)
}

/// Dispatch a slash command interaction to the appropriate handler.
pub async fn handle_interaction(app: &Arc<ParleyApp>, ctx: &Context, command: &CommandInteraction) {
    let result = match command.data.name.as_str() {
        "chat" => handle_chat(app, ctx, command).await,
        "ask" => handle_ask(app, ctx, command).await,
        "regenerate" => handle_regenerate(app, ctx, command).await,
        "stats" => handle_stats(app, ctx, command).await,
        "comment" => handle_comment(ctx, command).await,
        "rebuild" => handle_rebuild(app, ctx, command).await,
        "rename" => handle_rename(app, ctx, command).await,
        "end" => handle_end(app, ctx, command).await,
        DELETE_MESSAGE => handle_delete(app, ctx, command).await,
        _ => {
            respond_ephemeral(ctx, command, notice::error("Error", "Unknown command.")).await;
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!(command = %command.data.name, error = %e, "slash command error");
        let embed = notice::error("Error", &e.user_reason());
        // The interaction may already be deferred; try both ways.
        if command
            .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed.clone()))
            .await
            .is_err()
        {
            respond_ephemeral(ctx, command, embed).await;
        }
    }
}

/// Options given to `/chat`, applied over the configured defaults.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChatArgs {
    pub message: Option<String>,
    pub preset: Option<String>,
    pub system_message: Option<String>,
    pub model: Option<String>,
    pub response_timing: Option<String>,
    pub reply_to: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
    pub private: bool,
}

impl ChatArgs {
    fn from_options(options: &[CommandDataOption]) -> Self {
        let mut args = ChatArgs::default();
        for opt in options {
            let text = || opt.value.as_str().map(String::from);
            match opt.name.as_str() {
                "message" => args.message = text(),
                "preset" => args.preset = text(),
                "system_message" => args.system_message = text(),
                "model" => args.model = text(),
                "response_timing" => args.response_timing = text(),
                "reply_to" => args.reply_to = text(),
                "temperature" => args.temperature = opt.value.as_f64(),
                "max_tokens" => args.max_tokens = opt.value.as_i64(),
                "private" => args.private = opt.value.as_bool().unwrap_or(false),
                _ => {}
            }
        }
        args
    }

    /// Apply the arguments to `options`. Invalid values are rejected rather
    /// than silently replaced with defaults.
    pub fn apply(&self, mut options: SessionOptions) -> Result<SessionOptions> {
        if self.preset.is_some() || self.system_message.is_some() {
            let preset = self.preset.as_deref().unwrap_or(Preset::default().as_str());
            options.system = SystemSource::resolve(preset, self.system_message.as_deref())?;
        }
        if let Some(model) = self.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            options.model = model.to_string();
        }
        if let Some(timing) = self.response_timing.as_deref() {
            options.response_timing = timing.parse()?;
        }
        if let Some(reply_to) = self.reply_to.as_deref() {
            options.reply_to = reply_to.parse()?;
        }
        if let Some(temperature) = self.temperature {
            options.temperature = temperature as f32;
        }
        if let Some(max_tokens) = self.max_tokens {
            options.max_tokens = u32::try_from(max_tokens).ok().filter(|m| *m > 0);
        }
        options.opening = self
            .message
            .clone()
            .filter(|m| !m.trim().is_empty());
        Ok(options)
    }
}

/// Thread name for a new chat: the opening message, cut to Discord's limit.
pub fn thread_name(opening: Option<&str>) -> String {
    let line = opening
        .and_then(|m| m.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or(DEFAULT_THREAD_NAME);
    if line.chars().count() <= THREAD_NAME_CHARS {
        return line.to_string();
    }
    let mut name: String = line.chars().take(THREAD_NAME_CHARS - 3).collect();
    name.push_str("...");
    name
}

fn guild_name(ctx: &Context, guild_id: Option<GuildId>) -> Option<String> {
    guild_id
        .and_then(|gid| ctx.cache.guild(gid))
        .map(|g| g.name.clone())
}

/// `/chat`: start a thread with its own session.
async fn handle_chat(app: &Arc<ParleyApp>, ctx: &Context, command: &CommandInteraction) -> Result<()> {
    let bot = app.bot_id().ok_or(DiscordError::NotReady)?;
    let channel = command
        .channel_id
        .to_channel(&ctx.http)
        .await?
        .guild()
        .filter(|c| c.kind == ChannelType::Text)
        .ok_or(DiscordError::NotATextChannel)?;

    let args = ChatArgs::from_options(&command.data.options);
    let defaults = SessionOptions::from_config(
        &app.config.chat,
        command.user.id.get(),
        Utc::now().date_naive(),
    )?;
    let mut options = args.apply(defaults)?;
    options.server = guild_name(ctx, command.guild_id);
    options.channel = Some(channel.id.get());

    defer_ephemeral(ctx, command).await?;

    let kind = if args.private {
        ChannelType::PrivateThread
    } else {
        ChannelType::PublicThread
    };
    let thread = channel
        .id
        .create_thread(
            &ctx.http,
            CreateThread::new(thread_name(options.opening.as_deref())).kind(kind),
        )
        .await?;

    let session = ChatSession::new(thread.id.get(), bot.get(), options);
    let card = CreateMessage::new()
        .embed(notice::session_card(&session.options, bot.get(), Default::default()))
        .add_file(notice::session_file(&session)?);
    let has_opening = session.options.opening.is_some();
    info!(
        thread = %thread.id,
        user = %command.user.id,
        model = %session.options.model,
        "chat session started"
    );

    // Registered before anything is posted, so early messages in the thread
    // find the session instead of a thread without a card.
    app.sessions.insert(session).await;
    if let Err(e) = thread.id.send_message(&ctx.http, card).await {
        app.sessions.forget(thread.id.get());
        return Err(e.into());
    }
    thread.id.add_thread_member(&ctx.http, command.user.id).await?;

    command
        .edit_response(
            &ctx.http,
            EditInteractionResponse::new().content(format!("Started <#{}>.", thread.id)),
        )
        .await?;

    if has_opening {
        if let Some(mut guard) = app.sessions.cached(thread.id.get()).await {
            // an early message in the thread may have been answered already
            if let Some(session) = guard.as_mut().filter(|s| !s.has_answered()) {
                respond::answer(app, &ctx.http, session).await?;
            }
        }
    }
    Ok(())
}

/// `/ask`: one-shot question, nothing is remembered.
async fn handle_ask(app: &Arc<ParleyApp>, ctx: &Context, command: &CommandInteraction) -> Result<()> {
    let args = ChatArgs::from_options(&command.data.options);
    let Some(question) = args.message.clone().filter(|m| !m.trim().is_empty()) else {
        respond_ephemeral(ctx, command, notice::error("Error", "Please provide a message.")).await;
        return Ok(());
    };
    let bot = app.bot_id().ok_or(DiscordError::NotReady)?;

    let mut options = args.apply(SessionOptions::from_config(
        &app.config.chat,
        command.user.id.get(),
        Utc::now().date_naive(),
    )?)?;
    options.server = guild_name(ctx, command.guild_id);
    options.channel = Some(command.channel_id.get());

    // Defer the response (shows "thinking...").
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let mut request = options.request_template();
    if let Some(system) = options.system_message(bot.get()) {
        request.messages.push(Message::system(system));
    }
    request.messages.push(Message::user(question.as_str()));

    let completion = match respond::complete_once(app, request).await {
        Ok(c) => c,
        Err(e) => {
            warn!(user = %command.user.id, error = %e, "/ask failed");
            command
                .edit_response(
                    &ctx.http,
                    EditInteractionResponse::new().embed(notice::error("Error", &e.user_reason())),
                )
                .await?;
            return Ok(());
        }
    };

    let mut chunks = send::split_chunks(&completion.response.content).into_iter();
    let first = match chunks.next() {
        Some(Chunk::Text(text)) => EditInteractionResponse::new().content(text),
        Some(Chunk::File { name, content }) => EditInteractionResponse::new()
            .new_attachment(CreateAttachment::bytes(content.into_bytes(), name)),
        None => EditInteractionResponse::new().content("(empty response)"),
    };
    command.edit_response(&ctx.http, first).await?;
    send::send_chunks(&ctx.http, command.channel_id, chunks.collect()).await?;

    for warning in &completion.warnings {
        let msg = CreateMessage::new().embed(notice::warning(warning));
        if let Err(e) = command.channel_id.send_message(&ctx.http, msg).await {
            warn!(error = %e, "failed to post warning");
        }
    }
    Ok(())
}

/// `/regenerate`: drop the last answer and ask again.
async fn handle_regenerate(
    app: &Arc<ParleyApp>,
    ctx: &Context,
    command: &CommandInteraction,
) -> Result<()> {
    let history = app.history(&ctx.http)?;
    let thread = command.channel_id;

    defer_ephemeral(ctx, command).await?;

    let mut guard = app
        .sessions
        .acquire(thread.get(), &history)
        .await?
        .ok_or(DiscordError::NotAChatThread)?;
    let session = guard.as_mut().ok_or(DiscordError::NotAChatThread)?;

    let removed = session
        .take_trailing_assistant()
        .ok_or(DiscordError::NothingToRegenerate)?;
    delete_messages(&ctx.http, thread, &removed).await;
    info!(thread = %thread, deleted = removed.len(), "regenerating answer");

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content("Regenerating..."))
        .await?;
    let answered = respond::answer(app, &ctx.http, session).await?;
    let status = if answered {
        "Regenerated."
    } else {
        "Regeneration failed; see the thread for details."
    };
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(status))
        .await?;
    Ok(())
}

async fn delete_messages(http: &Http, channel: ChannelId, ids: &[u64]) {
    for id in ids {
        if let Err(e) = channel.delete_message(http, *id).await {
            warn!(channel = %channel, message = id, error = %e, "failed to delete message");
        }
    }
}

/// `/stats`: session card with usage counters, plus the last request.
async fn handle_stats(app: &Arc<ParleyApp>, ctx: &Context, command: &CommandInteraction) -> Result<()> {
    let history = app.history(&ctx.http)?;
    let thread = command.channel_id.get();

    let guard = app
        .sessions
        .acquire(thread, &history)
        .await?
        .ok_or(DiscordError::NotAChatThread)?;
    let session = guard.as_ref().ok_or(DiscordError::NotAChatThread)?;

    let usage = app.dispatcher.ledger().get(thread);
    let card = notice::session_card(&session.options, history.bot, usage);
    let mut reply = CreateInteractionResponseMessage::new()
        .embed(card)
        .ephemeral(true);
    if let Some(request) = &session.last_request {
        let json = serde_json::to_vec_pretty(request)?;
        reply = reply.add_file(CreateAttachment::bytes(json, "request.json"));
    }
    drop(guard);

    command
        .create_response(&ctx.http, CreateInteractionResponse::Message(reply))
        .await?;
    Ok(())
}

/// `/comment`: a notice the context builder skips.
async fn handle_comment(ctx: &Context, command: &CommandInteraction) -> Result<()> {
    let text = command
        .data
        .options
        .iter()
        .find(|o| o.name == "text")
        .and_then(|o| o.value.as_str())
        .unwrap_or("");
    if text.trim().is_empty() {
        respond_ephemeral(ctx, command, notice::error("Error", "Please provide a comment.")).await;
        return Ok(());
    }

    let author = command
        .user
        .global_name
        .as_deref()
        .unwrap_or(&command.user.name);
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().embed(notice::comment(author, text)),
            ),
        )
        .await?;
    Ok(())
}

/// Only the user who started a chat may manage it.
fn ensure_owner(session: &ChatSession, user: u64) -> Result<()> {
    if session.is_owner(user) {
        Ok(())
    } else {
        Err(DiscordError::NotChatOwner)
    }
}

async fn defer_ephemeral(ctx: &Context, command: &CommandInteraction) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new().ephemeral(true)),
        )
        .await?;
    Ok(())
}

/// `/rebuild`: throw the session away and read it back from the thread.
async fn handle_rebuild(app: &Arc<ParleyApp>, ctx: &Context, command: &CommandInteraction) -> Result<()> {
    let history = app.history(&ctx.http)?;
    let thread = command.channel_id.get();
    defer_ephemeral(ctx, command).await?;

    app.sessions.forget(thread);
    let guard = app
        .sessions
        .acquire(thread, &history)
        .await?
        .ok_or(DiscordError::NotAChatThread)?;
    let collected = guard.as_ref().map_or(0, |s| s.entries().len());
    drop(guard);
    info!(thread, collected, "history rebuilt on request");

    command
        .edit_response(
            &ctx.http,
            EditInteractionResponse::new()
                .content(format!("Done rebuilding history: collected {collected} messages.")),
        )
        .await?;
    Ok(())
}

/// `/rename`: set the thread name, or ask the model for one.
async fn handle_rename(app: &Arc<ParleyApp>, ctx: &Context, command: &CommandInteraction) -> Result<()> {
    let history = app.history(&ctx.http)?;
    let thread = command.channel_id;
    defer_ephemeral(ctx, command).await?;

    let guard = app
        .sessions
        .acquire(thread.get(), &history)
        .await?
        .ok_or(DiscordError::NotAChatThread)?;
    let session = guard.as_ref().ok_or(DiscordError::NotAChatThread)?;
    ensure_owner(session, command.user.id.get())?;

    let given = command
        .data
        .options
        .iter()
        .find(|o| o.name == "title")
        .and_then(|o| o.value.as_str())
        .filter(|t| !t.trim().is_empty())
        .map(String::from);
    let title = match given {
        Some(title) => Some(title),
        None => respond::write_title(app, session).await,
    };
    drop(guard);

    let Some(title) = title else {
        command
            .edit_response(
                &ctx.http,
                EditInteractionResponse::new().content("Could not come up with a title."),
            )
            .await?;
        return Ok(());
    };
    let name = thread_name(Some(&title));
    thread
        .edit_thread(ctx, EditThread::new().name(&name))
        .await?;
    info!(thread = %thread, %name, "thread renamed on request");
    command.delete_response(&ctx.http).await?;
    Ok(())
}

/// `/end`: delete the thread and everything kept about it.
async fn handle_end(app: &Arc<ParleyApp>, ctx: &Context, command: &CommandInteraction) -> Result<()> {
    let history = app.history(&ctx.http)?;
    let thread = command.channel_id;
    defer_ephemeral(ctx, command).await?;

    let guard = app
        .sessions
        .acquire(thread.get(), &history)
        .await?
        .ok_or(DiscordError::NotAChatThread)?;
    let session = guard.as_ref().ok_or(DiscordError::NotAChatThread)?;
    ensure_owner(session, command.user.id.get())?;
    drop(guard);

    thread.delete(ctx).await?;
    app.sessions.forget(thread.get());
    app.dispatcher.ledger().forget(thread.get());
    info!(thread = %thread, "chat ended");
    Ok(())
}

/// "Chat: Delete": remove one message from the chat. The deletion event
/// takes it out of the session.
async fn handle_delete(app: &Arc<ParleyApp>, ctx: &Context, command: &CommandInteraction) -> Result<()> {
    let history = app.history(&ctx.http)?;
    defer_ephemeral(ctx, command).await?;

    let Some(ResolvedTarget::Message(target)) = command.data.target() else {
        command.delete_response(&ctx.http).await?;
        return Ok(());
    };
    if normalize::is_notice(&SourceMessage::from_message(target, Vec::new())) {
        command.delete_response(&ctx.http).await?;
        return Ok(());
    }

    let guard = app
        .sessions
        .acquire(command.channel_id.get(), &history)
        .await?
        .ok_or(DiscordError::NotAChatThread)?;
    let session = guard.as_ref().ok_or(DiscordError::NotAChatThread)?;
    ensure_owner(session, command.user.id.get())?;
    drop(guard);

    command.delete_response(&ctx.http).await?;
    command
        .channel_id
        .delete_message(&ctx.http, target.id)
        .await?;
    Ok(())
}

/// Send an ephemeral response to a slash command (only visible to the invoker).
async fn respond_ephemeral(ctx: &Context, command: &CommandInteraction, embed: CreateEmbed) {
    let _ = command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .embed(embed)
                    .ephemeral(true),
            ),
        )
        .await;
}
