use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag};
use serenity::builder::{CreateAttachment, CreateMessage};
use serenity::http::Http;
use serenity::model::id::{ChannelId, MessageId};

/// Discord allows 2000 characters per message; keep a little headroom.
pub const MAX_MESSAGE_LENGTH: usize = 1996;

/// Characters a chunk may end on when a paragraph has to be split.
const SENTENCE_DELIMITERS: &[char] = &['\n', '.', ';', '?', '!'];

/// One outgoing Discord message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Text(String),
    /// A code block too long for a message, sent as a file.
    File { name: String, content: String },
}

enum Block {
    Prose(String),
    Fence { lang: String, code: String, raw: String },
}

/// Split a model response into Discord-sized messages.
///
/// Paragraphs are packed together up to [`MAX_MESSAGE_LENGTH`]; a paragraph
/// that is too long is broken at sentence boundaries. Fenced code blocks are
/// never split: each is its own message, or a `code.<lang>` file when it does
/// not fit.
pub fn split_chunks(text: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut prose: Vec<String> = Vec::new();

    for block in parse_blocks(text) {
        match block {
            Block::Prose(paragraph) => prose.extend(divide(&paragraph, MAX_MESSAGE_LENGTH)),
            Block::Fence { lang, code, raw } => {
                flush_prose(&mut prose, &mut chunks);
                if raw.chars().count() > MAX_MESSAGE_LENGTH {
                    let ext = if lang.is_empty() { "txt".to_string() } else { lang };
                    chunks.push(Chunk::File {
                        name: format!("code.{ext}"),
                        content: code,
                    });
                } else {
                    chunks.push(Chunk::Text(raw));
                }
            }
        }
    }
    flush_prose(&mut prose, &mut chunks);
    chunks
}

/// Pack paragraphs into as few messages as fit.
fn flush_prose(prose: &mut Vec<String>, chunks: &mut Vec<Chunk>) {
    let mut current = String::new();
    for piece in prose.drain(..) {
        if current.is_empty() {
            current = piece;
        } else if current.chars().count() + 2 + piece.chars().count() <= MAX_MESSAGE_LENGTH {
            current.push_str("\n\n");
            current.push_str(&piece);
        } else {
            chunks.push(Chunk::Text(std::mem::take(&mut current)));
            current = piece;
        }
    }
    if !current.is_empty() {
        chunks.push(Chunk::Text(current));
    }
}

/// Cut `text` into prose and top-level fenced code blocks. Fence boundaries
/// come from a CommonMark parser, so longer outer fences and `~~~` fences
/// nest the way Discord renders them.
fn parse_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut prose_from = 0;
    let mut depth = 0usize;
    let mut fence: Option<(String, String)> = None;

    for (event, range) in Parser::new(text).into_offset_iter() {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) if depth == 0 => {
                push_prose(&text[prose_from..range.start], &mut blocks);
                let lang = info.split_whitespace().next().unwrap_or_default().to_string();
                fence = Some((lang, String::new()));
                depth += 1;
            }
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth > 0 {
                    continue;
                }
                if let Some((lang, code)) = fence.take() {
                    blocks.push(Block::Fence {
                        lang,
                        code: code.trim_end_matches('\n').to_string(),
                        raw: text[range.clone()].trim_end().to_string(),
                    });
                    prose_from = range.end;
                }
            }
            Event::Text(t) => {
                if let Some((_, code)) = fence.as_mut() {
                    code.push_str(&t);
                }
            }
            _ => {}
        }
    }

    push_prose(&text[prose_from..], &mut blocks);
    blocks
}

/// Prose between fences, one block per blank-line separated paragraph.
fn push_prose(segment: &str, blocks: &mut Vec<Block>) {
    let mut paragraph: Vec<&str> = Vec::new();
    for line in segment.lines() {
        if line.trim().is_empty() {
            flush_paragraph(&mut paragraph, blocks);
        } else {
            paragraph.push(line);
        }
    }
    flush_paragraph(&mut paragraph, blocks);
}

fn flush_paragraph(paragraph: &mut Vec<&str>, blocks: &mut Vec<Block>) {
    let joined = paragraph.join("\n");
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        blocks.push(Block::Prose(trimmed.to_string()));
    }
    paragraph.clear();
}

/// Break `text` into pieces of at most `max` characters, preferring to cut
/// after a sentence delimiter, then at whitespace.
fn divide(text: &str, max: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = text;

    while rest.chars().count() > max {
        let window_end = rest
            .char_indices()
            .nth(max)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..window_end];

        let split_at = window
            .rfind(SENTENCE_DELIMITERS)
            .map(|i| i + 1)
            .or_else(|| window.rfind(char::is_whitespace).filter(|&i| i > 0))
            .unwrap_or(window_end);

        let piece = rest[..split_at].trim_end();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        rest = rest[split_at..].trim_start();
    }

    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

/// Text shown in a streaming placeholder: the head of the answer so far.
pub fn preview(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_LENGTH {
        return text.to_string();
    }
    let mut head: String = text.chars().take(MAX_MESSAGE_LENGTH - 1).collect();
    head.push('…');
    head
}

/// Post chunks to `channel_id` in order. Returns the ids of the messages sent.
pub async fn send_chunks(
    http: &Http,
    channel_id: ChannelId,
    chunks: Vec<Chunk>,
) -> Result<Vec<MessageId>, serenity::Error> {
    let mut sent = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let message = match chunk {
            Chunk::Text(text) => CreateMessage::new().content(text),
            Chunk::File { name, content } => {
                CreateMessage::new().add_file(CreateAttachment::bytes(content.into_bytes(), name))
            }
        };
        let msg = channel_id.send_message(http, message).await?;
        sent.push(msg.id);
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(chunks: &[Chunk]) -> Vec<&str> {
        chunks
            .iter()
            .filter_map(|c| match c {
                Chunk::Text(t) => Some(t.as_str()),
                Chunk::File { .. } => None,
            })
            .collect()
    }

    #[test]
    fn short_text_is_single_chunk() {
        let chunks = split_chunks("Hello, world!\n\nSecond paragraph.");
        assert_eq!(
            chunks,
            vec![Chunk::Text("Hello, world!\n\nSecond paragraph.".into())]
        );
    }

    #[test]
    fn paragraphs_pack_up_to_limit() {
        let para = "a".repeat(900);
        let text = format!("{para}\n\n{para}\n\n{para}");
        let chunks = split_chunks(&text);
        assert_eq!(chunks.len(), 2);
        for c in texts(&chunks) {
            assert!(c.chars().count() <= MAX_MESSAGE_LENGTH);
        }
    }

    #[test]
    fn long_paragraph_splits_at_sentences() {
        let sentence = format!("{}. ", "word ".repeat(60).trim_end());
        let text = sentence.repeat(20);
        let chunks = split_chunks(&text);
        assert!(chunks.len() >= 2);
        for c in texts(&chunks) {
            assert!(c.chars().count() <= MAX_MESSAGE_LENGTH);
            assert!(c.ends_with('.'), "chunk should end on a sentence: {c:?}");
        }
    }

    #[test]
    fn unbroken_text_still_splits() {
        let chunks = split_chunks(&"x".repeat(4500));
        assert_eq!(chunks.len(), 3);
        for c in texts(&chunks) {
            assert!(c.chars().count() <= MAX_MESSAGE_LENGTH);
        }
    }

    #[test]
    fn code_fence_kept_whole() {
        let text = "Here:\n\n```rust\nfn main() {\n\n    println!(\"hi\");\n}\n```\n\nDone.";
        let chunks = split_chunks(text);
        assert_eq!(
            chunks,
            vec![
                Chunk::Text("Here:".into()),
                Chunk::Text("```rust\nfn main() {\n\n    println!(\"hi\");\n}\n```".into()),
                Chunk::Text("Done.".into()),
            ]
        );
    }

    #[test]
    fn oversized_fence_becomes_file() {
        let code = "let x = 1;\n".repeat(300);
        let text = format!("Big one:\n```py\n{code}```");
        let chunks = split_chunks(&text);
        assert_eq!(chunks[0], Chunk::Text("Big one:".into()));
        match &chunks[1] {
            Chunk::File { name, content } => {
                assert_eq!(name, "code.py");
                assert!(content.starts_with("let x = 1;"));
            }
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[test]
    fn nested_fence_stays_one_block() {
        let text = "````md\n```rust\nlet x = 1;\n```\n````";
        assert_eq!(split_chunks(text), vec![Chunk::Text(text.into())]);
    }

    #[test]
    fn tilde_fence_with_backticks_inside() {
        let text = "Example:\n\n~~~\n```\nnot a fence\n~~~\n\nAfter.";
        assert_eq!(
            split_chunks(text),
            vec![
                Chunk::Text("Example:".into()),
                Chunk::Text("~~~\n```\nnot a fence\n~~~".into()),
                Chunk::Text("After.".into()),
            ]
        );
    }

    #[test]
    fn preview_is_bounded() {
        let long = "y".repeat(3000);
        assert_eq!(preview(&long).chars().count(), MAX_MESSAGE_LENGTH);
        assert_eq!(preview("short"), "short");
    }
}
