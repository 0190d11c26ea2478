//! Conversation assembly, from Discord-shaped messages to the request sent
//! to the completion API.

use async_trait::async_trait;
use chrono::NaiveDate;
use parley_agent::tokens;
use parley_agent::{
    ChatRequest, ChatResponse, CompletionDispatcher, LlmProvider, Message, ProviderError, Role,
    Usage,
};
use parley_core::{Preset, ReplyTo, ResponseTiming, SystemSource};
use parley_discord::context::{build_request, Budget};
use parley_discord::model::{Author, EmbedInfo, Addressable};
use parley_discord::session::{ChatSession, SessionOptions};
use parley_discord::SourceMessage;

const THREAD: u64 = 1_000;
const PRIMARY: u64 = 100;
const OTHER: u64 = 200;
const BOT: u64 = 900;

const BUDGET: Budget = Budget {
    window: 8_192,
    reserve: 512,
};

fn options(reply_to: ReplyTo) -> SessionOptions {
    SessionOptions {
        model: "gpt-4".into(),
        system: SystemSource::Preset(Preset::ChatGpt),
        temperature: 0.7,
        top_p: 1.0,
        max_tokens: None,
        response_timing: ResponseTiming::EveryMessage,
        reply_to,
        primary_user: PRIMARY,
        server: Some("Rustaceans".into()),
        channel: Some(42),
        created: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        opening: None,
    }
}

fn human(id: u64) -> Author {
    Author {
        id,
        name: format!("user{id}"),
        bot: false,
    }
}

fn roles(req: &ChatRequest) -> Vec<Role> {
    req.messages.iter().map(|m| m.role).collect()
}

#[test]
fn greetings_from_primary_and_other_users() {
    let mut session = ChatSession::new(THREAD, BOT, options(ReplyTo::AnyHuman));
    session.ingest(&SourceMessage::text(1, human(PRIMARY), "Hello, ChatGPT!"));
    session.ingest(&SourceMessage::text(2, human(OTHER), "Hello!"));

    let req = build_request(&session, BUDGET);
    assert_eq!(roles(&req), [Role::System, Role::User, Role::User]);
    assert_eq!(req.messages[1], Message::user("Hello, ChatGPT!"));
    assert_eq!(req.messages[2], Message::user("<@200> says: Hello!"));
}

#[test]
fn building_twice_gives_the_same_request() {
    let mut session = ChatSession::new(THREAD, BOT, options(ReplyTo::PrimaryUserOnly));
    session.ingest(&SourceMessage::text(1, human(PRIMARY), "What is a lifetime?"));
    session.record_reply("A region of code where a reference is valid.", vec![2]);
    session.ingest(&SourceMessage::text(3, human(PRIMARY), "Thanks"));

    let first = build_request(&session, BUDGET);
    let second = build_request(&session, BUDGET);
    assert_eq!(first, second);
    assert_eq!(roles(&first), [Role::System, Role::User, Role::Assistant, Role::User]);
}

#[test]
fn mention_asides_never_reach_the_request() {
    for reply_to in ReplyTo::ALL {
        let mut session = ChatSession::new(THREAD, BOT, options(reply_to));
        let aside = SourceMessage::text(1, human(PRIMARY), "<@200> can you check this?");
        session.ingest(&aside);
        session.ingest(&SourceMessage::text(2, human(OTHER), "<@!300> psst"));
        session.ingest(&SourceMessage::text(3, human(PRIMARY), "Back to the question"));

        assert!(!session.should_respond(&aside), "{reply_to}");
        let req = build_request(&session, BUDGET);
        assert!(
            req.messages
                .iter()
                .all(|m| !m.content.contains("check this") && !m.content.contains("psst")),
            "{reply_to}"
        );
        assert_eq!(req.messages.last(), Some(&Message::user("Back to the question")));
    }
}

#[test]
fn mentioning_the_bot_is_not_an_aside() {
    let mut session = ChatSession::new(THREAD, BOT, options(ReplyTo::PrimaryUserOnly));
    let msg = SourceMessage::text(1, human(PRIMARY), "<@900> what do you think?");
    assert!(session.should_respond(&msg));
    assert!(session.ingest(&msg));
}

#[test]
fn truncation_respects_the_budget() {
    let mut session = ChatSession::new(THREAD, BOT, options(ReplyTo::PrimaryUserOnly));
    for i in 0..40u64 {
        let text = format!("message {i}: {}", "lorem ipsum ".repeat(20));
        if i % 2 == 0 {
            session.ingest(&SourceMessage::text(i * 2 + 1, human(PRIMARY), text));
        } else {
            session.record_reply(text, vec![i * 2 + 1]);
        }
    }
    let budget = Budget {
        window: 1_000,
        reserve: 200,
    };

    let full = build_request(&session, BUDGET);
    let trimmed = build_request(&session, budget);

    assert!(tokens::estimate_messages(&trimmed.messages) <= budget.prompt_limit());
    assert_eq!(trimmed.messages[0], full.messages[0]);
    assert_eq!(trimmed.messages[0].role, Role::System);
    assert!(trimmed.messages.len() < full.messages.len());
    // newest entries survive
    assert_eq!(trimmed.messages.last(), full.messages.last());
}

#[test]
fn regenerating_the_only_answer() {
    let mut session = ChatSession::new(THREAD, BOT, options(ReplyTo::PrimaryUserOnly));
    session.ingest(&SourceMessage::text(1, human(PRIMARY), "Hello, ChatGPT!"));
    session.record_reply("Hi! How can I help?", vec![2, 3]);

    let removed = session.take_trailing_assistant();
    assert_eq!(removed, Some(vec![2, 3]));

    let req = build_request(&session, BUDGET);
    assert_eq!(roles(&req), [Role::System, Role::User]);
    assert_eq!(session.take_trailing_assistant(), None);
}

#[test]
fn opening_message_seeds_the_conversation() {
    let mut opts = options(ReplyTo::PrimaryUserOnly);
    opts.opening = Some("Explain ownership".into());
    let session = ChatSession::new(THREAD, BOT, opts);

    let req = build_request(&session, BUDGET);
    assert_eq!(roles(&req), [Role::System, Role::User]);
    assert_eq!(req.messages[1].content, "Explain ownership");
}

#[test]
fn rebuild_matches_the_live_session() {
    let bot = Author {
        id: BOT,
        name: "parley".into(),
        bot: true,
    };
    let history = vec![
        SourceMessage::text(1, human(PRIMARY), "Tell me a long story"),
        SourceMessage::text(2, bot.clone(), "Once upon a time"),
        SourceMessage::text(3, bot, "the end."),
        SourceMessage::text(4, human(PRIMARY), "Shorter please"),
    ];
    let rebuilt = ChatSession::rebuild(THREAD, BOT, options(ReplyTo::PrimaryUserOnly), &history);

    let mut live = ChatSession::new(THREAD, BOT, options(ReplyTo::PrimaryUserOnly));
    live.ingest(&history[0]);
    live.record_reply("Once upon a time\nthe end.", vec![2, 3]);
    live.ingest(&history[3]);

    assert_eq!(build_request(&rebuilt, BUDGET), build_request(&live, BUDGET));
}

#[test]
fn embeds_become_markdown_documents() {
    let mut session = ChatSession::new(THREAD, BOT, options(ReplyTo::AnyHuman));
    let mut msg = SourceMessage::text(1, human(OTHER), "");
    msg.embeds.push(EmbedInfo {
        provider: Some(Addressable {
            name: Some("Docs".into()),
            url: None,
        }),
        kind: Some("article".into()),
        title: Some("The Book".into()),
        description: Some("Chapter 4".into()),
        ..Default::default()
    });
    session.ingest(&msg);

    let req = build_request(&session, BUDGET);
    let content = &req.messages[1].content;
    assert!(content.starts_with("Discord: <@200> sent an article:"), "{content}");
    assert!(content.contains("source: Docs"));
    assert!(content.contains("__**The Book**__"));
    assert!(content.ends_with("Chapter 4"));
}

/// Echoes the last user message and reports fixed usage.
struct Echo;

#[async_trait]
impl LlmProvider for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let last = req.messages.last().ok_or(ProviderError::EmptyRequest)?;
        Ok(ChatResponse {
            content: format!("echo: {}", last.content),
            model: req.model.clone(),
            usage: Usage {
                prompt_tokens: 40,
                completion_tokens: 10,
                total_tokens: 50,
            },
            finish_reason: "stop".into(),
        })
    }
}

#[tokio::test]
async fn answers_accumulate_usage_per_thread() {
    let dispatcher = CompletionDispatcher::new(Box::new(Echo), None, 0.75);
    let mut session = ChatSession::new(THREAD, BOT, options(ReplyTo::PrimaryUserOnly));

    for (id, text) in [(1, "first"), (3, "second")] {
        session.ingest(&SourceMessage::text(id, human(PRIMARY), text));
        let req = build_request(&session, BUDGET);
        let done = dispatcher.dispatch(Some(THREAD), req).await.unwrap();
        assert!(done.warnings.is_empty());
        session.record_reply(done.response.content, vec![id + 1]);
    }

    let usage = dispatcher.ledger().get(THREAD);
    assert_eq!(usage.requests, 2);
    assert_eq!(usage.total_tokens, 100);
    assert_eq!(dispatcher.ledger().get(THREAD + 1).requests, 0);

    let req = build_request(&session, BUDGET);
    assert_eq!(req.messages.last(), Some(&Message::assistant("echo: second")));
}
