//! Session registry: one lockable slot per thread.
//!
//! The per-thread `tokio::sync::Mutex` is held for the whole
//! read-modify-answer cycle, so events in one thread are handled one at a
//! time while other threads proceed. Rebuilding from history happens under
//! the same lock, so concurrent events never rebuild twice.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serenity::builder::GetMessages;
use serenity::http::Http;
use serenity::model::channel::{ChannelType, Message};
use serenity::model::id::{ChannelId, MessageId};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::attach;
use crate::error::{DiscordError, Result};
use crate::model::SourceMessage;
use crate::notice::SESSION_FILE;
use crate::session::{ChatSession, SessionOptions};

pub type SessionSlot = Arc<Mutex<Option<ChatSession>>>;
pub type SessionGuard = OwnedMutexGuard<Option<ChatSession>>;

/// Where sessions come from when they are not in memory.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Rebuild the session for `thread_id`, or `None` when the channel is not
    /// a chat thread.
    async fn load(&self, thread_id: u64) -> Result<Option<ChatSession>>;
}

#[derive(Default)]
pub struct SessionRegistry {
    slots: DashMap<u64, SessionSlot>,
    /// Channels known not to be chat threads.
    invalid: DashSet<u64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, thread_id: u64) -> SessionSlot {
        self.slots.entry(thread_id).or_default().clone()
    }

    pub fn is_invalid(&self, thread_id: u64) -> bool {
        self.invalid.contains(&thread_id)
    }

    /// Sessions currently held in memory.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Register a freshly started session. A session already in the slot
    /// (rebuilt by a concurrent event) is kept and `false` is returned.
    #[instrument(skip(self, session), fields(thread = session.thread_id()))]
    pub async fn insert(&self, session: ChatSession) -> bool {
        let thread_id = session.thread_id();
        loop {
            let slot = self.slot(thread_id);
            let mut guard = slot.lock().await;
            // acquire() drops the slot of a channel it found to be no chat
            // thread; that slot is no longer reachable
            let current = self
                .slots
                .get(&thread_id)
                .is_some_and(|s| Arc::ptr_eq(s.value(), &slot));
            if !current {
                continue;
            }
            self.invalid.remove(&thread_id);
            if guard.is_some() {
                debug!("session already loaded, keeping it");
                return false;
            }
            *guard = Some(session);
            debug!("session registered");
            return true;
        }
    }

    /// Drop a session (thread deleted, or a rebuild was requested).
    pub fn forget(&self, thread_id: u64) {
        self.slots.remove(&thread_id);
        self.invalid.remove(&thread_id);
    }

    /// Lock the session of `thread_id` without loading it.
    /// Returns `None` unless the session is already in memory.
    pub async fn cached(&self, thread_id: u64) -> Option<SessionGuard> {
        let slot = self.slots.get(&thread_id).map(|s| s.clone())?;
        let guard = slot.lock_owned().await;
        guard.is_some().then_some(guard)
    }

    /// Lock the session of `thread_id`, rebuilding it from history on first
    /// use. Returns `None` for channels that are not chat threads.
    #[instrument(skip(self, source))]
    pub async fn acquire<S: HistorySource + ?Sized>(
        &self,
        thread_id: u64,
        source: &S,
    ) -> Result<Option<SessionGuard>> {
        if self.is_invalid(thread_id) {
            return Ok(None);
        }

        let mut guard = self.slot(thread_id).lock_owned().await;
        if guard.is_some() {
            return Ok(Some(guard));
        }
        // another task may have found out while we waited for the lock
        if self.is_invalid(thread_id) {
            return Ok(None);
        }

        match source.load(thread_id).await? {
            Some(session) => {
                info!(entries = session.entries().len(), "session rebuilt from history");
                *guard = Some(session);
                Ok(Some(guard))
            }
            None => {
                debug!("not a chat thread");
                self.invalid.insert(thread_id);
                drop(guard);
                self.slots.remove(&thread_id);
                Ok(None)
            }
        }
    }
}

/// Rebuilds sessions by reading thread history over the Discord REST API.
pub struct DiscordHistory {
    pub http: Arc<Http>,
    pub client: reqwest::Client,
    pub bot: u64,
    pub max_attachment_bytes: u64,
}

#[async_trait]
impl HistorySource for DiscordHistory {
    async fn load(&self, thread_id: u64) -> Result<Option<ChatSession>> {
        let channel = ChannelId::new(thread_id).to_channel(&self.http).await?;
        let Some(thread) = channel.guild() else {
            return Ok(None);
        };
        if !matches!(
            thread.kind,
            ChannelType::PublicThread | ChannelType::PrivateThread
        ) {
            return Ok(None);
        }

        let history = fetch_history(&self.http, thread.id).await?;

        // The session card is the first message the bot posted in the thread.
        let Some(card) = history.iter().find(|m| m.author.id.get() == self.bot) else {
            return Ok(None);
        };
        let Some(file) = card.attachments.iter().find(|a| a.filename == SESSION_FILE) else {
            return Ok(None);
        };

        let bytes = attach::download(&self.client, &file.url)
            .await
            .map_err(|e| DiscordError::InvalidSession(e.to_string()))?;
        let options = match SessionOptions::from_json(&bytes) {
            Ok(options) => options,
            Err(e) => {
                warn!(thread = thread_id, error = %e, "session card is unreadable");
                return Ok(None);
            }
        };

        let mut sources = Vec::new();
        for msg in history.iter().filter(|m| m.id > card.id) {
            let attachments =
                attach::fetch_all(&self.client, &msg.attachments, self.max_attachment_bytes).await;
            sources.push(SourceMessage::from_message(msg, attachments));
        }

        Ok(Some(ChatSession::rebuild(thread_id, self.bot, options, &sources)))
    }
}

/// Every message in a channel, oldest first.
async fn fetch_history(http: &Http, channel: ChannelId) -> Result<Vec<Message>> {
    const PAGE: u8 = 100;

    let mut all: Vec<Message> = Vec::new();
    let mut before: Option<MessageId> = None;
    loop {
        let mut query = GetMessages::new().limit(PAGE);
        if let Some(id) = before {
            query = query.before(id);
        }
        let page = channel.messages(http, query).await?;
        let count = page.len();
        before = page.iter().map(|m| m.id).min();
        all.extend(page);
        if count < usize::from(PAGE) || before.is_none() {
            break;
        }
    }
    all.sort_by_key(|m| m.id);
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Author, SourceMessage};
    use chrono::NaiveDate;
    use parley_core::{Preset, ReplyTo, ResponseTiming, SystemSource};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BOT: u64 = 900;

    struct FakeHistory {
        loads: AtomicUsize,
        chat_threads: Vec<u64>,
    }

    fn options() -> SessionOptions {
        SessionOptions {
            model: "gpt-4".into(),
            system: SystemSource::Preset(Preset::Empty),
            temperature: 0.7,
            top_p: 1.0,
            max_tokens: None,
            response_timing: ResponseTiming::EveryMessage,
            reply_to: ReplyTo::PrimaryUserOnly,
            primary_user: 100,
            server: None,
            channel: None,
            created: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            opening: None,
        }
    }

    #[async_trait]
    impl HistorySource for FakeHistory {
        async fn load(&self, thread_id: u64) -> Result<Option<ChatSession>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if !self.chat_threads.contains(&thread_id) {
                return Ok(None);
            }
            let author = Author {
                id: 100,
                name: "ann".into(),
                bot: false,
            };
            let history = vec![SourceMessage::text(10, author, "hello")];
            Ok(Some(ChatSession::rebuild(thread_id, BOT, options(), &history)))
        }
    }

    fn fake(chat_threads: Vec<u64>) -> FakeHistory {
        FakeHistory {
            loads: AtomicUsize::new(0),
            chat_threads,
        }
    }

    #[tokio::test]
    async fn concurrent_acquire_rebuilds_once() {
        let registry = Arc::new(SessionRegistry::new());
        let source = Arc::new(fake(vec![1]));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let source = Arc::clone(&source);
            handles.push(tokio::spawn(async move {
                let guard = registry.acquire(1, source.as_ref()).await.unwrap();
                guard.map(|g| g.as_ref().map(|s| s.entries().len()))
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some(Some(1)));
        }
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_chat_threads_are_remembered() {
        let registry = SessionRegistry::new();
        let source = fake(vec![]);

        assert!(registry.acquire(2, &source).await.unwrap().is_none());
        assert!(registry.is_invalid(2));
        assert!(registry.acquire(2, &source).await.unwrap().is_none());
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn inserted_sessions_skip_loading() {
        let registry = SessionRegistry::new();
        let source = fake(vec![]);
        registry
            .insert(ChatSession::new(3, BOT, options()))
            .await;

        let guard = registry.acquire(3, &source).await.unwrap();
        assert!(guard.is_some());
        assert_eq!(source.loads.load(Ordering::SeqCst), 0);
        drop(guard);

        assert!(registry.cached(3).await.is_some());
        registry.forget(3);
        assert!(registry.cached(3).await.is_none());
    }

    #[tokio::test]
    async fn insert_keeps_a_session_rebuilt_first() {
        let registry = SessionRegistry::new();
        let source = fake(vec![4]);

        // a message in the new thread got there first and rebuilt it
        let guard = registry.acquire(4, &source).await.unwrap();
        assert!(guard.is_some());
        drop(guard);

        let mut fresh = ChatSession::new(4, BOT, options());
        fresh.record_reply("should not replace", vec![99]);
        assert!(!registry.insert(fresh).await);

        let guard = registry.cached(4).await.unwrap();
        let entries = guard.as_ref().map(|s| s.entries().len());
        assert_eq!(entries, Some(1));
        assert!(!guard.as_ref().is_some_and(|s| s.has_answered()));
    }

    #[tokio::test]
    async fn insert_revives_a_thread_marked_invalid() {
        let registry = SessionRegistry::new();
        let source = fake(vec![]);

        // rebuilt before the session card was posted
        assert!(registry.acquire(5, &source).await.unwrap().is_none());
        assert!(registry.is_invalid(5));

        assert!(registry.insert(ChatSession::new(5, BOT, options())).await);
        assert!(!registry.is_invalid(5));
        assert!(registry.acquire(5, &source).await.unwrap().is_some());
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }
}
