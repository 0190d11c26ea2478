//! Message normalizer: one Discord message in, at most one role-tagged
//! completion entry out.

use parley_agent::Message;

use crate::embed;
use crate::model::{mention, AttachmentBody, AttachmentInfo, MessageKind, SourceMessage, SystemEvent};
use crate::notice::NOTICE_FOOTER;

/// Who the conversation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participants {
    pub primary_user: u64,
    pub bot: u64,
}

/// Session cards, error reports, warnings and comments carry this footer.
pub fn is_notice(msg: &SourceMessage) -> bool {
    msg.embeds
        .iter()
        .any(|e| e.footer.as_deref() == Some(NOTICE_FOOTER))
}

/// A message opening with a mention of somebody else is a side remark
/// addressed to that person, not to the bot.
pub fn is_mention_aside(msg: &SourceMessage, who: &Participants) -> bool {
    msg.leading_mention()
        .is_some_and(|id| id != who.primary_user && id != who.bot)
}

/// Normalize one message. `None` means the message contributes nothing.
pub fn normalize(msg: &SourceMessage, who: &Participants) -> Option<Message> {
    if msg.loading || is_notice(msg) || is_mention_aside(msg, who) {
        return None;
    }

    if let MessageKind::System(event) = &msg.kind {
        return Some(Message::system(describe_event(event, msg)));
    }

    let author = msg.author.mention();
    let mut parts: Vec<String> = Vec::new();

    if let Some(interaction) = &msg.interaction {
        parts.push(format!(
            "{} used /{} command from {}",
            mention(interaction.invoker),
            interaction.name,
            author
        ));
    }

    if !msg.content.trim().is_empty() {
        if msg.author.id == who.primary_user || msg.author.id == who.bot {
            parts.push(msg.content.clone());
        } else {
            parts.push(format!("{author} says: {}", msg.content));
        }
    }

    for e in &msg.embeds {
        parts.push(format!(
            "Discord: {author} sent {}:\n\n{}",
            embed::document_kind(e.kind.as_deref()),
            embed::to_markdown(e)
        ));
    }

    for att in &msg.attachments {
        parts.push(describe_attachment(&author, att));
    }

    if parts.is_empty() {
        return None;
    }

    let content = parts.join("\n\n");
    if msg.author.id == who.bot {
        Some(Message::assistant(content))
    } else {
        Some(Message::user(content))
    }
}

fn describe_attachment(author: &str, att: &AttachmentInfo) -> String {
    let mut out = format!("Discord: {author} uploaded a file. ");
    if !att.filename.is_empty() {
        out.push_str(&format!("Filename: {}. ", att.filename));
    }
    if let Some(ct) = att.content_type.as_deref().filter(|c| !c.is_empty()) {
        out.push_str(&format!("Content type: {ct}. "));
    }
    match &att.body {
        AttachmentBody::Text(text) => out.push_str(&format!("Content:\n\n{text}")),
        AttachmentBody::Binary => out.push_str("Content: (binary)."),
        AttachmentBody::Unavailable => out.push_str("Content: (unavailable)."),
    }
    out
}

fn describe_event(event: &SystemEvent, msg: &SourceMessage) -> String {
    let actor = msg.author.mention();
    let target = |t: &Option<u64>| t.map(mention).unwrap_or_else(|| "someone".to_string());
    let sentence = match event {
        SystemEvent::MemberAdded { target: t } => {
            format!("{actor} added {} to the thread.", target(t))
        }
        SystemEvent::MemberRemoved { target: t } => {
            format!("{actor} removed {} from the thread.", target(t))
        }
        SystemEvent::ThreadRenamed { name } => {
            format!("{actor} changed the thread name: {name}")
        }
        SystemEvent::MessagePinned => format!("{actor} pinned a message to this channel."),
        SystemEvent::ThreadCreated { name } => format!("{actor} started a thread: {name}"),
        SystemEvent::MemberJoined => format!("{actor} joined the server."),
        SystemEvent::Other { code } => {
            format!("{actor} triggered a channel event (type {code}).")
        }
    };
    format!("Discord: {sentence}")
}
