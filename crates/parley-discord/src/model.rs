//! Platform-neutral snapshot of a Discord message.
//!
//! Everything downstream (normalizer, session, context builder) works on
//! [`SourceMessage`] so it can be tested without a gateway connection.

use chrono::{DateTime, Utc};
use serenity::model::channel::{Embed, Message, MessageFlags, MessageType};
use serenity::model::id::UserId;
use serenity::model::mention::Mentionable;
use serenity::utils::parse_user_mention;

/// Author of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: u64,
    pub name: String,
    pub bot: bool,
}

impl Author {
    pub fn mention(&self) -> String {
        mention(self.id)
    }
}

/// Discord mention markup for a user id.
pub fn mention(user_id: u64) -> String {
    UserId::new(user_id).mention().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Human,
    Bot,
    System(SystemEvent),
}

/// Events Discord renders into the channel on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    MemberAdded { target: Option<u64> },
    MemberRemoved { target: Option<u64> },
    ThreadRenamed { name: String },
    MessagePinned,
    ThreadCreated { name: String },
    MemberJoined,
    Other { code: u8 },
}

/// Downloaded attachment content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentBody {
    Text(String),
    Binary,
    /// Download failed or the file was over the size limit.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub filename: String,
    pub content_type: Option<String>,
    pub size: u32,
    pub body: AttachmentBody,
}

/// A name and/or url pair, as used by embed providers and authors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Addressable {
    pub name: Option<String>,
    pub url: Option<String>,
}

impl Addressable {
    /// `name <url>`, `name`, `url`, or nothing.
    pub fn render(&self) -> Option<String> {
        let name = self.name.as_deref().filter(|s| !s.is_empty());
        let url = self.url.as_deref().filter(|s| !s.is_empty());
        match (name, url) {
            (Some(n), Some(u)) => Some(format!("{n} <{u}>")),
            (Some(n), None) => Some(n.to_string()),
            (None, Some(u)) => Some(u.to_string()),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedInfo {
    pub provider: Option<Addressable>,
    pub author: Option<Addressable>,
    pub url: Option<String>,
    /// Discord embed type: `rich`, `image`, `article`, ...
    pub kind: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub fields: Vec<(String, String)>,
    pub footer: Option<String>,
}

impl From<&Embed> for EmbedInfo {
    fn from(embed: &Embed) -> Self {
        Self {
            provider: embed.provider.as_ref().map(|p| Addressable {
                name: p.name.clone(),
                url: p.url.clone(),
            }),
            author: embed.author.as_ref().map(|a| Addressable {
                name: Some(a.name.clone()),
                url: a.url.clone(),
            }),
            url: embed.url.clone(),
            kind: embed.kind.clone(),
            title: embed.title.clone(),
            description: embed.description.clone(),
            fields: embed
                .fields
                .iter()
                .map(|f| (f.name.clone(), f.value.clone()))
                .collect(),
            footer: embed.footer.as_ref().map(|f| f.text.clone()),
        }
    }
}

/// The slash command a bot message was sent in response to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionInfo {
    pub invoker: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    pub id: u64,
    pub author: Author,
    pub content: String,
    pub mentions: Vec<u64>,
    pub attachments: Vec<AttachmentInfo>,
    pub embeds: Vec<EmbedInfo>,
    pub kind: MessageKind,
    pub interaction: Option<InteractionInfo>,
    /// Deferred interaction placeholder that will be edited later.
    pub loading: bool,
    pub timestamp: DateTime<Utc>,
}

impl SourceMessage {
    /// Plain text message, mostly useful for building fixtures.
    pub fn text(id: u64, author: Author, content: impl Into<String>) -> Self {
        let kind = if author.bot {
            MessageKind::Bot
        } else {
            MessageKind::Human
        };
        let content = content.into();
        Self {
            id,
            mentions: mentions_in(&content),
            author,
            content,
            attachments: Vec::new(),
            embeds: Vec::new(),
            kind,
            interaction: None,
            loading: false,
            timestamp: DateTime::<Utc>::default(),
        }
    }

    /// Snapshot a serenity message. Attachments are fetched separately
    /// (see [`crate::attach::fetch_all`]) since that needs the network.
    #[allow(deprecated)]
    pub fn from_message(msg: &Message, attachments: Vec<AttachmentInfo>) -> Self {
        let mentions: Vec<u64> = msg.mentions.iter().map(|u| u.id.get()).collect();
        let kind = match system_event(msg, &mentions) {
            Some(event) => MessageKind::System(event),
            None if msg.author.bot => MessageKind::Bot,
            None => MessageKind::Human,
        };

        Self {
            id: msg.id.get(),
            author: Author {
                id: msg.author.id.get(),
                name: msg
                    .author
                    .global_name
                    .clone()
                    .unwrap_or_else(|| msg.author.name.clone()),
                bot: msg.author.bot,
            },
            content: msg.content.clone(),
            mentions,
            attachments,
            embeds: msg.embeds.iter().map(EmbedInfo::from).collect(),
            kind,
            interaction: msg.interaction.as_ref().map(|i| InteractionInfo {
                invoker: i.user.id.get(),
                name: i.name.clone(),
            }),
            loading: msg
                .flags
                .is_some_and(|f| f.contains(MessageFlags::LOADING)),
            timestamp: DateTime::from_timestamp(msg.timestamp.unix_timestamp(), 0)
                .unwrap_or_default(),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self.kind, MessageKind::System(_))
    }

    pub fn mentions_user(&self, user_id: u64) -> bool {
        self.mentions.contains(&user_id)
    }

    /// The user mentioned at the very start of the content, if any.
    pub fn leading_mention(&self) -> Option<u64> {
        leading_mention(&self.content)
    }
}

fn system_event(msg: &Message, mentions: &[u64]) -> Option<SystemEvent> {
    let event = match msg.kind {
        MessageType::Regular
        | MessageType::InlineReply
        | MessageType::ChatInputCommand
        | MessageType::ContextMenuCommand
        | MessageType::ThreadStarterMessage => return None,
        MessageType::GroupRecipientAddition => SystemEvent::MemberAdded {
            target: mentions.first().copied(),
        },
        MessageType::GroupRecipientRemoval => SystemEvent::MemberRemoved {
            target: mentions.first().copied(),
        },
        MessageType::GroupNameUpdate => SystemEvent::ThreadRenamed {
            name: msg.content.clone(),
        },
        MessageType::PinsAdd => SystemEvent::MessagePinned,
        MessageType::ThreadCreated => SystemEvent::ThreadCreated {
            name: msg.content.clone(),
        },
        MessageType::MemberJoin => SystemEvent::MemberJoined,
        other => SystemEvent::Other { code: other.into() },
    };
    Some(event)
}

/// Parse `<@123>` or `<@!123>` at the start of `content`.
pub fn leading_mention(content: &str) -> Option<u64> {
    let head = content.trim_start();
    let end = head.find('>')?;
    parse_user_mention(&head[..=end]).map(UserId::get)
}

/// All user mentions in `content`, in order of appearance.
fn mentions_in(content: &str) -> Vec<u64> {
    let mut found = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find("<@") {
        rest = &rest[start..];
        if let Some(id) = leading_mention(rest) {
            found.push(id);
        }
        rest = &rest[2..];
    }
    found
}
