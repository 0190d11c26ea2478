use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use parley_core::config::ProviderConfig;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError, Usage};
use crate::stream::{parse_sse_line, StreamEvent};

const CHAT_PATH: &str = "/v1/chat/completions";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout_secs: u64,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self {
            client,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://api.openai.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout_secs,
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        let base_url = Some(config.base_url.clone()).filter(|u| !u.is_empty());
        Self::new(config.api_key.clone(), base_url, config.timeout_secs)
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}{}", self.base_url, CHAT_PATH);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000) // convert seconds to ms
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "OpenAI API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        Ok(resp)
    }

    fn map_transport(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout {
                secs: self.timeout_secs,
            }
        } else {
            ProviderError::Http(e)
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(req, false)?;

        debug!(model = %req.model, messages = req.messages.len(), "sending request to OpenAI");

        let resp = self.post(&body).await?;
        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        parse_response(api_resp)
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, true)?;

        debug!(model = %req.model, messages = req.messages.len(), "sending streaming request to OpenAI");

        let resp = self.post(&body).await?;
        process_openai_stream(resp, req.model.clone(), tx).await;
        Ok(())
    }
}

fn build_request_body(req: &ChatRequest, stream: bool) -> Result<serde_json::Value, ProviderError> {
    let mut body = serde_json::to_value(req).map_err(|e| ProviderError::Parse(e.to_string()))?;
    body["stream"] = serde_json::Value::Bool(stream);
    if stream {
        // usage only arrives on the final chunk when explicitly requested
        body["stream_options"] = serde_json::json!({ "include_usage": true });
    }
    Ok(body)
}

fn parse_response(resp: ApiResponse) -> Result<ChatResponse, ProviderError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Parse("response contained no choices".to_string()))?;
    let usage = resp.usage.map(Usage::from).unwrap_or_default();

    Ok(ChatResponse {
        content: choice.message.content.unwrap_or_default(),
        model: resp.model,
        usage,
        finish_reason: choice.finish_reason.unwrap_or_default(),
    })
}

/// Parse OpenAI streaming SSE response and emit StreamEvents.
/// Each data line contains a JSON delta object; `data: [DONE]` signals end.
async fn process_openai_stream(
    resp: reqwest::Response,
    model: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    pump_sse(resp.bytes_stream(), model, tx).await;
}

/// Drive an SSE byte stream. Bytes are buffered until a full line has
/// arrived, so a UTF-8 sequence split across network chunks survives.
async fn pump_sse<S, B, E>(byte_stream: S, model: String, tx: mpsc::Sender<StreamEvent>)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut byte_stream = std::pin::pin!(byte_stream);
    let mut state = SseState::default();
    let mut line_buf: Vec<u8> = Vec::new();

    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        line_buf.extend_from_slice(chunk.as_ref());
        while let Some(pos) = line_buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = line_buf.drain(..=pos).collect();
            match state.feed(&String::from_utf8_lossy(&line), &tx).await {
                Flow::Continue => {}
                Flow::Done => break 'outer,
                Flow::Closed => return,
            }
        }
    }

    // a final line without a trailing newline
    if !line_buf.is_empty() {
        if let Flow::Closed = state.feed(&String::from_utf8_lossy(&line_buf), &tx).await {
            return;
        }
    }

    let _ = tx
        .send(StreamEvent::Done {
            model,
            usage: state.usage,
            finish_reason: state.finish_reason,
        })
        .await;
}

enum Flow {
    Continue,
    Done,
    Closed,
}

#[derive(Default)]
struct SseState {
    usage: Usage,
    finish_reason: String,
}

impl SseState {
    async fn feed(&mut self, line: &str, tx: &mpsc::Sender<StreamEvent>) -> Flow {
        let Some(data) = parse_sse_line(line.trim()) else {
            return Flow::Continue;
        };
        if data == "[DONE]" {
            return Flow::Done;
        }
        let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) else {
            debug!(line = %data, "skipping unparseable stream chunk");
            return Flow::Continue;
        };

        if let Some(u) = chunk.usage {
            self.usage = u.into();
        }
        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
                self.finish_reason = reason;
            }
            if let Some(text) = choice.delta.content.filter(|c| !c.is_empty()) {
                if tx.send(StreamEvent::TextDelta { text }).await.is_err() {
                    return Flow::Closed; // receiver dropped
                }
            }
        }
        Flow::Continue
    }
}

// OpenAI API response types (private, deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: Option<u32>,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u
                .total_tokens
                .unwrap_or(u.prompt_tokens + u.completion_tokens),
        }
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Message;

    #[test]
    fn parses_completion_response() {
        let json = r#"{
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello there"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let api: ApiResponse = serde_json::from_str(json).unwrap();
        let resp = parse_response(api).unwrap();
        assert_eq!(resp.content, "Hello there");
        assert_eq!(resp.usage.total_tokens, 15);
        assert_eq!(resp.finish_reason, "stop");
        assert!(!resp.truncated());
    }

    #[test]
    fn empty_choices_is_parse_error() {
        let json = r#"{"model": "gpt-4", "choices": []}"#;
        let api: ApiResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(parse_response(api), Err(ProviderError::Parse(_))));
    }

    #[test]
    fn stream_body_requests_usage() {
        let mut req = ChatRequest::new("gpt-4");
        req.messages.push(Message::system("be nice"));
        req.messages.push(Message::user("hi"));
        let body = build_request_body(&req, true).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["messages"][0]["role"], "system");

        let body = build_request_body(&req, false).unwrap();
        assert_eq!(body["stream"], false);
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn stream_chunk_without_choices_carries_usage() {
        let data = r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":7,"total_tokens":12}}"#;
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        let usage: Usage = chunk.usage.unwrap().into();
        assert_eq!(usage.total_tokens, 12);
    }

    async fn collect(chunks: Vec<&'static [u8]>) -> Vec<StreamEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        let body = futures_util::stream::iter(
            chunks
                .into_iter()
                .map(Ok::<&'static [u8], std::io::Error>),
        );
        pump_sse(body, "gpt-4o".to_string(), tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn text_of(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn character_split_across_chunks_survives() {
        let body: &'static [u8] = "data: {\"choices\":[{\"delta\":{\"content\":\"h\u{e9}llo\"},\"finish_reason\":null}]}\n\n\
data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n\
data: [DONE]\n\n"
            .as_bytes();
        let cut = body.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let events = collect(vec![&body[..cut], &body[cut..]]).await;

        assert_eq!(text_of(&events), "h\u{e9}llo");
        match events.last() {
            Some(StreamEvent::Done { usage, model, .. }) => {
                assert_eq!(usage.total_tokens, 5);
                assert_eq!(model, "gpt-4o");
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_collects_deltas_and_finish_reason() {
        let events = collect(vec![
            &b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n"[..],
            &b"\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"length\"}]}\n\n"[..],
            &b": keep-alive\n\ndata: [DONE]"[..],
        ])
        .await;

        assert_eq!(text_of(&events), "Hello");
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done { finish_reason, .. }) if finish_reason == "length"
        ));
    }

    #[tokio::test]
    async fn transport_error_is_reported() {
        let (tx, mut rx) = mpsc::channel(8);
        let body = futures_util::stream::iter(vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n".as_slice()),
            Err(std::io::Error::other("connection reset")),
        ]);
        pump_sse(body, "gpt-4o".to_string(), tx).await;

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error { message }) if message.contains("connection reset")
        ));
    }
}
