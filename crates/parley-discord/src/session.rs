//! Per-thread chat session.
//!
//! A session is the in-memory view of one chat thread: the options stored in
//! the thread's session card plus the normalized conversation so far. It is
//! never persisted; after a restart it is rebuilt from the thread history.

use chrono::NaiveDate;
use parley_agent::{ChatRequest, Message, Role};
use parley_core::config::ChatConfig;
use parley_core::{PresetParams, ReplyTo, ResponseTiming, SystemSource};
use serde::{Deserialize, Serialize};

use crate::model::{mention, SourceMessage};
use crate::normalize::{self, Participants};

/// Options fixed when the session starts. Serialized into `session.json`
/// on the session card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub model: String,
    pub system: SystemSource,
    pub temperature: f32,
    pub top_p: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub response_timing: ResponseTiming,
    #[serde(default)]
    pub reply_to: ReplyTo,
    pub primary_user: u64,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub channel: Option<u64>,
    /// Date the session started; keeps the rendered system message stable.
    pub created: NaiveDate,
    /// Opening message given to `/chat`, replayed as the first user turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opening: Option<String>,
}

impl SessionOptions {
    /// Session defaults from `[chat]` config.
    pub fn from_config(
        chat: &ChatConfig,
        primary_user: u64,
        created: NaiveDate,
    ) -> parley_core::Result<Self> {
        Ok(Self {
            model: chat.model.clone(),
            system: SystemSource::resolve(&chat.preset, chat.system_message.as_deref())?,
            temperature: chat.temperature,
            top_p: chat.top_p,
            max_tokens: chat.max_tokens,
            response_timing: chat.response_timing,
            reply_to: chat.reply_to,
            primary_user,
            server: None,
            channel: None,
            created,
            opening: None,
        })
    }

    pub fn preset_params(&self, bot: u64) -> PresetParams {
        PresetParams {
            assistant: mention(bot),
            user: mention(self.primary_user),
            server: self.server.clone(),
            channel: self.channel.map(|c| format!("<#{c}>")),
            current_date: self.created,
        }
    }

    /// Rendered system message, if the preset has one.
    pub fn system_message(&self, bot: u64) -> Option<String> {
        self.system.render(&self.preset_params(bot))
    }

    /// Empty request carrying the model parameters.
    pub fn request_template(&self) -> ChatRequest {
        let mut req = ChatRequest::new(self.model.clone());
        req.temperature = self.temperature;
        req.top_p = self.top_p;
        req.max_tokens = self.max_tokens;
        req.user = Some(self.primary_user.to_string());
        req
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// One conversation turn and the Discord messages it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub message: Message,
    /// Empty for the seeded opening message.
    pub source_ids: Vec<u64>,
}

impl Entry {
    fn position(&self) -> u64 {
        self.source_ids.first().copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct ChatSession {
    thread_id: u64,
    who: Participants,
    pub options: SessionOptions,
    entries: Vec<Entry>,
    /// The last request sent for this thread, shown by `/stats`.
    pub last_request: Option<ChatRequest>,
}

impl ChatSession {
    pub fn new(thread_id: u64, bot: u64, options: SessionOptions) -> Self {
        let mut entries = Vec::new();
        if let Some(opening) = options.opening.as_deref().filter(|o| !o.trim().is_empty()) {
            entries.push(Entry {
                message: Message::user(opening),
                source_ids: Vec::new(),
            });
        }
        Self {
            thread_id,
            who: Participants {
                primary_user: options.primary_user,
                bot,
            },
            options,
            entries,
            last_request: None,
        }
    }

    /// Rebuild from thread history (oldest first). Consecutive messages of
    /// this bot collapse into one assistant entry.
    pub fn rebuild(thread_id: u64, bot: u64, options: SessionOptions, history: &[SourceMessage]) -> Self {
        let mut session = Self::new(thread_id, bot, options);
        for msg in history {
            let Some(message) = normalize::normalize(msg, &session.who) else {
                continue;
            };
            if message.role == Role::Assistant {
                if let Some(last) = session.entries.last_mut() {
                    if last.message.role == Role::Assistant {
                        last.message.content.push('\n');
                        last.message.content.push_str(&message.content);
                        last.source_ids.push(msg.id);
                        continue;
                    }
                }
            }
            session.entries.push(Entry {
                message,
                source_ids: vec![msg.id],
            });
        }
        session
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    pub fn participants(&self) -> Participants {
        self.who
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Add a newly posted message. Returns `false` when it contributes
    /// nothing. Own messages are ignored: replies are recorded through
    /// [`ChatSession::record_reply`].
    pub fn ingest(&mut self, msg: &SourceMessage) -> bool {
        if msg.author.id == self.who.bot || self.find(msg.id).is_some() {
            return false;
        }
        match normalize::normalize(msg, &self.who) {
            Some(message) => {
                self.insert_ordered(Entry {
                    message,
                    source_ids: vec![msg.id],
                });
                true
            }
            None => false,
        }
    }

    /// Re-normalize an edited message in place.
    pub fn update(&mut self, msg: &SourceMessage) -> bool {
        if msg.author.id == self.who.bot {
            return false;
        }
        let normalized = normalize::normalize(msg, &self.who);
        match (self.find(msg.id), normalized) {
            (Some(idx), Some(message)) => {
                if self.entries[idx].message == message {
                    return false;
                }
                self.entries[idx].message = message;
                true
            }
            (Some(idx), None) => {
                self.entries.remove(idx);
                true
            }
            (None, Some(message)) => {
                self.insert_ordered(Entry {
                    message,
                    source_ids: vec![msg.id],
                });
                true
            }
            (None, None) => false,
        }
    }

    /// Drop the entry built from `message_id`.
    pub fn remove(&mut self, message_id: u64) -> bool {
        match self.find(message_id) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Record the bot's answer along with the messages it was posted as.
    pub fn record_reply(&mut self, content: impl Into<String>, message_ids: Vec<u64>) {
        self.entries.push(Entry {
            message: Message::assistant(content),
            source_ids: message_ids,
        });
    }

    pub fn has_answered(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.message.role == Role::Assistant)
    }

    /// Remove the assistant turn(s) at the end of the conversation, skipping
    /// over interleaved system events. Returns the Discord messages that made
    /// them up, or `None` when the conversation does not end in an answer.
    pub fn take_trailing_assistant(&mut self) -> Option<Vec<u64>> {
        let mut removed = Vec::new();
        let mut found = false;
        let mut idx = self.entries.len();
        while idx > 0 {
            idx -= 1;
            match self.entries[idx].message.role {
                Role::System => continue,
                Role::Assistant => {
                    let entry = self.entries.remove(idx);
                    removed.extend(entry.source_ids);
                    found = true;
                }
                Role::User => break,
            }
        }
        found.then_some(removed)
    }

    /// Whether `msg` should trigger an answer, given the session's audience
    /// and timing policy. Excluded messages may still be context.
    pub fn should_respond(&self, msg: &SourceMessage) -> bool {
        if msg.author.id == self.who.bot
            || msg.loading
            || normalize::is_notice(msg)
            || normalize::is_mention_aside(msg, &self.who)
        {
            return false;
        }
        if normalize::normalize(msg, &self.who).is_none() {
            return false;
        }

        let audience = match self.options.reply_to {
            ReplyTo::Anyone => true,
            ReplyTo::AnyHuman => !msg.author.bot && !msg.is_system(),
            ReplyTo::PrimaryUserOnly => msg.author.id == self.who.primary_user && !msg.is_system(),
        };
        let timing = match self.options.response_timing {
            ResponseTiming::EveryMessage => true,
            ResponseTiming::MentionOnly => msg.mentions_user(self.who.bot),
        };
        audience && timing
    }

    /// Whether `message_id` produced the newest entry. After a rebuild the
    /// triggering message is already in the history and is answered only if
    /// nothing came after it.
    pub fn is_latest(&self, message_id: u64) -> bool {
        self.entries
            .last()
            .is_some_and(|e| e.source_ids.contains(&message_id))
    }

    /// Whether an edit deserves an answer. Only a deferred command reply that
    /// has finished loading does; ordinary edits just update the context.
    pub fn answers_edit(&self, was_loading: bool, msg: &SourceMessage) -> bool {
        was_loading && self.should_respond(msg) && self.is_latest(msg.id)
    }

    /// The user who started the chat.
    pub fn is_owner(&self, user_id: u64) -> bool {
        self.who.primary_user == user_id
    }

    pub fn contains(&self, message_id: u64) -> bool {
        self.find(message_id).is_some()
    }

    fn find(&self, message_id: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.source_ids.contains(&message_id))
    }

    fn insert_ordered(&mut self, entry: Entry) {
        let pos = entry.position();
        let idx = self
            .entries
            .iter()
            .rposition(|e| e.position() <= pos)
            .map_or(0, |i| i + 1);
        self.entries.insert(idx, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Author, MessageKind, SystemEvent};
    use parley_core::Preset;

    const THREAD: u64 = 5;
    const PRIMARY: u64 = 100;
    const BOT: u64 = 900;

    fn options() -> SessionOptions {
        SessionOptions {
            model: "gpt-4".into(),
            system: SystemSource::Preset(Preset::ChatGpt),
            temperature: 0.7,
            top_p: 1.0,
            max_tokens: None,
            response_timing: ResponseTiming::EveryMessage,
            reply_to: ReplyTo::PrimaryUserOnly,
            primary_user: PRIMARY,
            server: Some("Rust".into()),
            channel: Some(42),
            created: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            opening: None,
        }
    }

    fn author(id: u64) -> Author {
        Author {
            id,
            name: format!("u{id}"),
            bot: id == BOT,
        }
    }

    fn said(id: u64, by: u64, text: &str) -> SourceMessage {
        SourceMessage::text(id, author(by), text)
    }

    #[test]
    fn options_round_trip_through_json() {
        let mut opts = options();
        opts.opening = Some("hi".into());
        let json = opts.to_json().unwrap();
        assert!(json.contains("\"kind\": \"preset\""));
        assert_eq!(SessionOptions::from_json(json.as_bytes()).unwrap(), opts);
    }

    #[test]
    fn ingest_ignores_own_and_duplicate_messages() {
        let mut s = ChatSession::new(THREAD, BOT, options());
        assert!(s.ingest(&said(10, PRIMARY, "hi")));
        assert!(!s.ingest(&said(10, PRIMARY, "hi")));
        assert!(!s.ingest(&said(11, BOT, "hello")));
        assert_eq!(s.entries().len(), 1);
    }

    #[test]
    fn rebuild_collapses_consecutive_bot_messages() {
        let history = vec![
            said(10, PRIMARY, "write a poem"),
            said(11, BOT, "Roses are red,"),
            said(12, BOT, "violets are blue."),
            said(13, PRIMARY, "thanks"),
        ];
        let s = ChatSession::rebuild(THREAD, BOT, options(), &history);
        assert_eq!(s.entries().len(), 3);
        assert_eq!(
            s.entries()[1].message,
            Message::assistant("Roses are red,\nviolets are blue.")
        );
        assert_eq!(s.entries()[1].source_ids, vec![11, 12]);
    }

    #[test]
    fn edits_and_deletes_splice_entries() {
        let mut s = ChatSession::new(THREAD, BOT, options());
        s.ingest(&said(10, PRIMARY, "first"));
        s.ingest(&said(12, PRIMARY, "third"));

        assert!(s.update(&said(10, PRIMARY, "first, edited")));
        assert_eq!(s.entries()[0].message.content, "first, edited");

        // an aside edited into a real message lands in chronological order
        assert!(s.update(&said(11, PRIMARY, "second")));
        let contents: Vec<&str> = s.entries().iter().map(|e| e.message.content.as_str()).collect();
        assert_eq!(contents, vec!["first, edited", "second", "third"]);

        assert!(s.update(&said(11, PRIMARY, "<@200> never mind")));
        assert_eq!(s.entries().len(), 2);

        assert!(s.remove(12));
        assert!(!s.remove(12));
        assert_eq!(s.entries().len(), 1);
    }

    #[test]
    fn regenerate_takes_trailing_answer() {
        let mut s = ChatSession::new(THREAD, BOT, options());
        s.ingest(&said(10, PRIMARY, "question"));
        s.record_reply("answer part", vec![11, 12]);

        assert_eq!(s.take_trailing_assistant(), Some(vec![11, 12]));
        assert_eq!(s.entries().len(), 1);
        assert_eq!(s.take_trailing_assistant(), None);
    }

    #[test]
    fn audience_policy() {
        let mut s = ChatSession::new(THREAD, BOT, options());
        assert!(s.should_respond(&said(10, PRIMARY, "hi")));
        assert!(!s.should_respond(&said(11, 200, "hi")));
        assert!(!s.should_respond(&said(12, BOT, "hi")));

        s.options.reply_to = ReplyTo::AnyHuman;
        assert!(s.should_respond(&said(13, 200, "hi")));
        let mut other_bot = said(14, 300, "beep");
        other_bot.author.bot = true;
        assert!(!s.should_respond(&other_bot));

        s.options.reply_to = ReplyTo::Anyone;
        assert!(s.should_respond(&other_bot));
        assert!(!s.should_respond(&said(15, PRIMARY, "<@200> psst")));
    }

    #[test]
    fn system_events_answered_only_for_anyone() {
        let mut s = ChatSession::new(THREAD, BOT, options());
        let mut joined = said(20, 300, "");
        joined.kind = MessageKind::System(SystemEvent::MemberJoined);

        for reply_to in [ReplyTo::PrimaryUserOnly, ReplyTo::AnyHuman] {
            s.options.reply_to = reply_to;
            assert!(!s.should_respond(&joined), "{reply_to}");
        }
        s.options.reply_to = ReplyTo::Anyone;
        assert!(s.should_respond(&joined));

        // context either way
        assert!(s.ingest(&joined));
        assert_eq!(s.entries()[0].message.role, Role::System);
    }

    #[test]
    fn only_the_newest_message_is_answered() {
        let history = vec![said(10, PRIMARY, "first"), said(11, PRIMARY, "second")];
        let mut s = ChatSession::rebuild(THREAD, BOT, options(), &history);

        // a rebuild already holds both; the older trigger must not be answered
        assert!(!s.ingest(&history[0]));
        assert!(!s.is_latest(10));
        assert!(s.is_latest(11));

        s.record_reply("answer", vec![12]);
        assert!(!s.is_latest(11));
    }

    #[test]
    fn finished_command_reply_is_answered() {
        let mut s = ChatSession::new(THREAD, BOT, options());
        s.options.reply_to = ReplyTo::Anyone;

        let mut reply = said(30, 300, "");
        reply.author.bot = true;
        reply.kind = MessageKind::Bot;
        reply.loading = true;
        assert!(!s.ingest(&reply));

        reply.loading = false;
        reply.content = "Rolled a 4".into();
        assert!(s.update(&reply));
        assert!(s.answers_edit(true, &reply));
        // an ordinary edit only updates the context
        assert!(!s.answers_edit(false, &reply));

        s.options.reply_to = ReplyTo::AnyHuman;
        assert!(!s.answers_edit(true, &reply));
    }

    #[test]
    fn ownership() {
        let s = ChatSession::new(THREAD, BOT, options());
        assert!(s.is_owner(PRIMARY));
        assert!(!s.is_owner(200));
    }

    #[test]
    fn mention_only_timing() {
        let mut s = ChatSession::new(THREAD, BOT, options());
        s.options.response_timing = ResponseTiming::MentionOnly;
        assert!(!s.should_respond(&said(10, PRIMARY, "thinking out loud")));
        assert!(s.should_respond(&said(11, PRIMARY, "<@900> your turn")));
        assert!(s.should_respond(&said(12, PRIMARY, "what do you think, <@900>?")));
    }

    #[test]
    fn opening_message_is_first_turn() {
        let mut opts = options();
        opts.opening = Some("Tell me about Rust".into());
        let s = ChatSession::new(THREAD, BOT, opts);
        assert_eq!(s.entries()[0].message, Message::user("Tell me about Rust"));
        assert!(!s.has_answered());
    }
}
