//! Answer flow: build the request, call the dispatcher, post the reply.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_agent::tokens;
use parley_agent::{ChatRequest, Completion, Message, Role, StreamEvent};
use serenity::builder::{CreateMessage, EditMessage, EditThread};
use serenity::http::Http;
use serenity::model::id::{ChannelId, MessageId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::ParleyApp;
use crate::context;
use crate::error::{DiscordError, Result};
use crate::notice;
use crate::send::{self, Chunk};
use crate::session::ChatSession;

/// Placeholder edits are rate limited by Discord; one per second is safe.
const EDIT_INTERVAL: Duration = Duration::from_secs(1);
/// Conversations shorter than this are not worth a title yet.
const TITLE_MIN_TOKENS: u32 = 128;
const TITLE_MAX_CHARS: usize = 100;
/// Only the tail of long conversations is sent to the title request.
const TITLE_TRANSCRIPT_CHARS: usize = 8_000;

const TITLE_PROMPT: &str = "Role: Copy editor\n\
Task: The following conversation has been edited into a news article.\n\
Please write an attractive title for it.\n\
Requirements: Should be in the conversation's original language; \
Must be a single sentence or phrase\n\
Conversation:";

/// Answer the conversation in `session` and record the reply.
///
/// Completion failures are reported into the thread and yield `Ok(false)`;
/// only Discord failures are returned as errors.
pub async fn answer(app: &ParleyApp, http: &Arc<Http>, session: &mut ChatSession) -> Result<bool> {
    let thread_id = session.thread_id();
    let channel = ChannelId::new(thread_id);
    let titled_before = session.has_answered() && is_long(session);

    let request = context::build_request(session, app.budget(&session.options.model));
    session.last_request = Some(request.clone());

    let outcome = {
        let _typing = channel.start_typing(http);
        if app.config.chat.stream_responses {
            stream_completion(app, http, channel, Some(thread_id), request).await
        } else {
            app.dispatcher
                .dispatch(Some(thread_id), request)
                .await
                .map(|c| (c, None))
                .map_err(DiscordError::from)
        }
    };

    let (completion, placeholder) = match outcome {
        Ok(done) => done,
        Err(e) => {
            warn!(thread = thread_id, error = %e, "answer failed");
            report_error(http, channel, &e).await;
            return Ok(false);
        }
    };

    let content = completion.response.content.clone();
    let ids = post_reply(http, channel, &content, placeholder).await?;
    info!(
        thread = thread_id,
        messages = ids.len(),
        chars = content.len(),
        "reply posted"
    );

    session.record_reply(content, ids.iter().map(|id| id.get()).collect());
    session.last_request = Some(completion.request.clone());
    post_warnings(http, channel, &completion).await;

    if app.config.chat.auto_title && !titled_before && is_long(session) {
        retitle(app, http, channel, session).await;
    }
    Ok(true)
}

/// One-shot answer with no thread state, used by `/ask`.
pub async fn complete_once(app: &ParleyApp, request: ChatRequest) -> Result<Completion> {
    Ok(app.dispatcher.dispatch(None, request).await?)
}

async fn stream_completion(
    app: &ParleyApp,
    http: &Http,
    channel: ChannelId,
    thread_id: Option<u64>,
    request: ChatRequest,
) -> Result<(Completion, Option<MessageId>)> {
    let placeholder = channel
        .send_message(http, CreateMessage::new().content("…"))
        .await?;

    let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);

    let editor = async {
        let mut text = String::new();
        let mut last_edit = Instant::now();
        while let Some(event) = rx.recv().await {
            let StreamEvent::TextDelta { text: delta } = event else {
                continue;
            };
            text.push_str(&delta);
            if last_edit.elapsed() >= EDIT_INTERVAL && !text.trim().is_empty() {
                last_edit = Instant::now();
                let edit = EditMessage::new().content(send::preview(&text));
                if let Err(e) = channel.edit_message(http, placeholder.id, edit).await {
                    debug!(error = %e, "placeholder edit failed");
                }
            }
        }
    };

    let (result, ()) = tokio::join!(app.dispatcher.dispatch_stream(thread_id, request, tx), editor);

    match result {
        Ok(completion) => Ok((completion, Some(placeholder.id))),
        Err(e) => {
            if let Err(del) = channel.delete_message(http, placeholder.id).await {
                debug!(error = %del, "placeholder cleanup failed");
            }
            Err(e.into())
        }
    }
}

/// Post the reply, reusing the streaming placeholder for the first chunk
/// when there is one.
async fn post_reply(
    http: &Http,
    channel: ChannelId,
    content: &str,
    placeholder: Option<MessageId>,
) -> Result<Vec<MessageId>> {
    let mut chunks = send::split_chunks(content);
    if chunks.is_empty() {
        chunks.push(Chunk::Text("(empty response)".to_string()));
    }

    let mut ids = Vec::with_capacity(chunks.len());
    if let Some(placeholder) = placeholder {
        match chunks.first() {
            Some(Chunk::Text(first)) => {
                channel
                    .edit_message(http, placeholder, EditMessage::new().content(first))
                    .await?;
                ids.push(placeholder);
                chunks.remove(0);
            }
            _ => channel.delete_message(http, placeholder).await?,
        }
    }
    ids.extend(send::send_chunks(http, channel, chunks).await?);
    Ok(ids)
}

async fn post_warnings(http: &Http, channel: ChannelId, completion: &Completion) {
    for text in &completion.warnings {
        let msg = CreateMessage::new().embed(notice::warning(text));
        if let Err(e) = channel.send_message(http, msg).await {
            warn!(error = %e, "failed to post warning");
        }
    }
}

/// Post a red error notice; failures to post are only logged.
pub async fn report_error(http: &Http, channel: ChannelId, error: &DiscordError) {
    let msg = CreateMessage::new().embed(notice::error("Error", &error.user_reason()));
    if let Err(e) = channel.send_message(http, msg).await {
        warn!(error = %e, "failed to report error");
    }
}

fn is_long(session: &ChatSession) -> bool {
    let messages: Vec<Message> = session.entries().iter().map(|e| e.message.clone()).collect();
    tokens::estimate_messages(&messages) > TITLE_MIN_TOKENS
}

async fn retitle(app: &ParleyApp, http: &Http, channel: ChannelId, session: &ChatSession) {
    let Some(title) = write_title(app, session).await else {
        return;
    };
    match channel.edit_thread(http, EditThread::new().name(&title)).await {
        Ok(_) => info!(thread = session.thread_id(), %title, "thread renamed"),
        Err(e) => warn!(thread = session.thread_id(), error = %e, "failed to rename thread"),
    }
}

/// Ask the model for a short title for the conversation.
pub async fn write_title(app: &ParleyApp, session: &ChatSession) -> Option<String> {
    let request = title_request(session);
    match app.dispatcher.dispatch(None, request).await {
        Ok(done) => clean_title(&done.response.content),
        Err(e) => {
            warn!(thread = session.thread_id(), error = %e, "title request failed");
            None
        }
    }
}

fn title_request(session: &ChatSession) -> ChatRequest {
    let transcript: Vec<String> = session
        .entries()
        .iter()
        .filter(|e| e.message.role != Role::System)
        .map(|e| format!("{}: {}", e.message.role.as_str(), e.message.content))
        .collect();
    let transcript = transcript.join("\n");
    let skip = transcript.chars().count().saturating_sub(TITLE_TRANSCRIPT_CHARS);
    let transcript: String = transcript.chars().skip(skip).collect();

    let mut req = ChatRequest::new(session.options.model.clone());
    req.max_tokens = Some(64);
    req.temperature = 0.5;
    req.messages = vec![
        Message::user(TITLE_PROMPT),
        Message::user(transcript),
        Message::user("Answer:"),
    ];
    req
}

/// First non-empty line, without surrounding quotes, at most 100 characters.
pub fn clean_title(raw: &str) -> Option<String> {
    const QUOTES: &[char] = &['"', '\'', '“', '”', '‘', '’', '«', '»', '*', '#'];

    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line.strip_prefix("Title:").unwrap_or(line).trim();
    let title = line.trim_matches(QUOTES).trim().trim_end_matches('.').trim();
    if title.is_empty() {
        return None;
    }
    if title.chars().count() <= TITLE_MAX_CHARS {
        return Some(title.to_string());
    }
    let mut short: String = title.chars().take(TITLE_MAX_CHARS - 3).collect();
    short.truncate(short.trim_end().len());
    short.push_str("...");
    Some(short)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Author, SourceMessage};
    use crate::session::SessionOptions;
    use chrono::NaiveDate;
    use parley_core::{Preset, ReplyTo, ResponseTiming, SystemSource};

    #[test]
    fn title_quotes_are_stripped() {
        assert_eq!(clean_title("\"Borrowing in Rust\"").as_deref(), Some("Borrowing in Rust"));
        assert_eq!(clean_title("\n  “Lifetimes”.\n").as_deref(), Some("Lifetimes"));
        assert_eq!(clean_title("Title: **Async Rust**").as_deref(), Some("Async Rust"));
        assert_eq!(clean_title("   \n \"\""), None);
    }

    #[test]
    fn title_is_capped() {
        let raw = "word ".repeat(40);
        let title = clean_title(&raw).unwrap();
        assert!(title.chars().count() <= TITLE_MAX_CHARS);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn title_request_leaves_out_system_entries() {
        let options = SessionOptions {
            model: "gpt-4o".into(),
            system: SystemSource::Preset(Preset::ChatGpt),
            temperature: 0.7,
            top_p: 1.0,
            max_tokens: None,
            response_timing: ResponseTiming::EveryMessage,
            reply_to: ReplyTo::PrimaryUserOnly,
            primary_user: 1,
            server: None,
            channel: None,
            created: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            opening: None,
        };
        let mut session = ChatSession::new(7, 9, options);
        let author = Author {
            id: 1,
            name: "ann".into(),
            bot: false,
        };
        session.ingest(&SourceMessage::text(10, author, "What is a borrow checker?"));
        session.record_reply("It checks references.", vec![11]);

        let req = title_request(&session);
        assert_eq!(req.model, "gpt-4o");
        assert_eq!(req.max_tokens, Some(64));
        assert_eq!(req.messages.len(), 3);
        assert_eq!(
            req.messages[1].content,
            "user: What is a borrow checker?\nassistant: It checks references."
        );
    }
}
