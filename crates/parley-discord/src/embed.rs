//! Embed rendering: turns a Discord embed into a Markdown document the
//! model can read.
//!
//! Layout:
//!
//! ```text
//! ---
//! source: YouTube <https://youtube.com>
//! author: Some Channel
//! url: https://youtu.be/xyz
//! type: video
//! ---
//!
//! __**Title**__
//!
//! Description
//!
//! **Field name**
//! Field value
//! ```
//!
//! The front matter only carries the keys that are present and is left out
//! entirely when none are.

use serde::Serialize;
use tracing::warn;

use crate::model::EmbedInfo;

#[derive(Serialize)]
struct FrontMatter<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<&'a str>,
}

impl FrontMatter<'_> {
    fn is_empty(&self) -> bool {
        self.source.is_none() && self.author.is_none() && self.url.is_none() && self.kind.is_none()
    }
}

/// What the embed is, phrased for `Discord: <@user> sent <kind>:`.
pub fn document_kind(kind: Option<&str>) -> &'static str {
    match kind.unwrap_or("rich") {
        "article" => "an article",
        "gifv" => "a GIF",
        "image" => "an image",
        "link" => "a link",
        "video" => "a video",
        "rich" => "a Markdown document",
        _ => "an embed",
    }
}

/// Render an embed as Markdown with optional YAML front matter.
pub fn to_markdown(embed: &EmbedInfo) -> String {
    let front = FrontMatter {
        source: embed.provider.as_ref().and_then(|p| p.render()),
        author: embed.author.as_ref().and_then(|a| a.render()),
        url: non_empty(&embed.url),
        kind: non_empty(&embed.kind),
    };

    let mut lines: Vec<String> = Vec::new();

    if !front.is_empty() {
        match serde_yaml::to_string(&front) {
            Ok(yaml) => {
                lines.push("---".to_string());
                lines.push(yaml.trim().to_string());
                lines.push("---".to_string());
                lines.push(String::new());
            }
            Err(e) => warn!(error = %e, "failed to serialize embed front matter"),
        }
    }

    if let Some(title) = non_empty(&embed.title) {
        lines.push(format!("__**{title}**__"));
        lines.push(String::new());
    }
    if let Some(description) = non_empty(&embed.description) {
        lines.push(description.to_string());
        lines.push(String::new());
    }
    for (name, value) in &embed.fields {
        lines.push(format!("**{name}**"));
        lines.push(value.clone());
        lines.push(String::new());
    }

    lines.join("\n").trim_end().to_string()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
