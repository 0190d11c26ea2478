//! Notices: embeds the bot posts about a session rather than as part of it.
//!
//! Every notice carries the [`NOTICE_FOOTER`] so the normalizer can leave it
//! out of the conversation.

use parley_agent::ThreadUsage;
use serenity::builder::{CreateAttachment, CreateEmbed, CreateEmbedAuthor, CreateEmbedFooter};
use serenity::model::colour::Colour;

use crate::session::{ChatSession, SessionOptions};

pub const NOTICE_FOOTER: &str = "System message";
pub const SESSION_FILE: &str = "session.json";

const RED: Colour = Colour(0xe7_4c_3c);
const ORANGE: Colour = Colour(0xe6_7e_22);
const BLURPLE: Colour = Colour(0x58_65_f2);

/// Discord caps embed descriptions at 4096 characters.
const DESCRIPTION_LIMIT: usize = 4000;

/// Bare notice embed.
pub fn notice() -> CreateEmbed {
    CreateEmbed::new().footer(CreateEmbedFooter::new(NOTICE_FOOTER))
}

/// Red error report.
pub fn error(title: &str, reason: &str) -> CreateEmbed {
    notice()
        .title(title)
        .description(clip(reason, DESCRIPTION_LIMIT))
        .colour(RED)
}

/// Orange warning.
pub fn warning(text: &str) -> CreateEmbed {
    notice()
        .title("Warning")
        .description(clip(text, DESCRIPTION_LIMIT))
        .colour(ORANGE)
}

/// `/comment`: a remark the model never sees.
pub fn comment(author: &str, text: &str) -> CreateEmbed {
    notice()
        .author(CreateEmbedAuthor::new(author))
        .description(clip(text, DESCRIPTION_LIMIT))
}

/// The session card: settings at a glance plus token counters.
pub fn session_card(options: &SessionOptions, bot: u64, usage: ThreadUsage) -> CreateEmbed {
    let system = options
        .system_message(bot)
        .map(|s| clip(&s, 1000))
        .unwrap_or_else(|| "(no system message)".to_string());

    let source = match &options.system {
        parley_core::SystemSource::Preset(p) => p.label().to_string(),
        parley_core::SystemSource::Custom(_) => "Custom".to_string(),
    };

    let max_tokens = options
        .max_tokens
        .map(|m| m.to_string())
        .unwrap_or_else(|| "auto".to_string());

    let mut embed = notice()
        .title("Chat session")
        .description(format!("**System message**\n{system}"))
        .colour(BLURPLE)
        .field("Model", &options.model, true)
        .field("Preset", source, true)
        .field("Temperature", format!("{:.2}", options.temperature), true)
        .field("Max tokens", max_tokens, true)
        .field("Response timing", options.response_timing.as_str(), true)
        .field("Reply to", options.reply_to.as_str(), true)
        .field(
            "Tokens used",
            format!(
                "{} total ({} prompt, {} completion) over {} requests",
                usage.total_tokens, usage.prompt_tokens, usage.completion_tokens, usage.requests
            ),
            false,
        );
    if let Some(opening) = options.opening.as_deref() {
        embed = embed.field("Opening message", clip(opening, 1000), false);
    }
    embed
}

/// `session.json` attachment that lets the session be rebuilt later.
pub fn session_file(session: &ChatSession) -> serde_json::Result<CreateAttachment> {
    let json = session.options.to_json()?;
    Ok(CreateAttachment::bytes(json.into_bytes(), SESSION_FILE))
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max - 1).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn footer(embed: &CreateEmbed) -> serde_json::Value {
        serde_json::to_value(embed).unwrap()["footer"]["text"].clone()
    }

    #[test]
    fn every_notice_has_footer() {
        assert_eq!(footer(&error("Error", "boom")), NOTICE_FOOTER);
        assert_eq!(footer(&warning("careful")), NOTICE_FOOTER);
        assert_eq!(footer(&comment("ann", "aside")), NOTICE_FOOTER);
    }

    #[test]
    fn long_reasons_are_clipped() {
        let reason = "e".repeat(5000);
        let json = serde_json::to_value(error("Error", &reason)).unwrap();
        let description = json["description"].as_str().unwrap();
        assert_eq!(description.chars().count(), DESCRIPTION_LIMIT);
    }
}
