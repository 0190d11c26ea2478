//! Completion dispatch and per-thread token accounting.

use dashmap::DashMap;
use parley_core::config::ChatConfig;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError, Usage};
use crate::stream::StreamEvent;
use crate::tokens;

/// Accumulated usage for one thread, as reported by the API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub requests: u32,
    /// Total tokens of the most recent request (prompt + completion).
    pub last_total: u32,
}

/// Per-thread usage totals. Updates go through a `DashMap` entry so
/// concurrent requests in one thread never lose an increment.
#[derive(Debug, Default)]
pub struct UsageLedger {
    threads: DashMap<u64, ThreadUsage>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, thread_id: u64, usage: &Usage) -> ThreadUsage {
        let mut entry = self.threads.entry(thread_id).or_default();
        entry.prompt_tokens += u64::from(usage.prompt_tokens);
        entry.completion_tokens += u64::from(usage.completion_tokens);
        entry.total_tokens += u64::from(usage.total_tokens);
        entry.requests += 1;
        entry.last_total = usage.total_tokens;
        *entry
    }

    pub fn get(&self, thread_id: u64) -> ThreadUsage {
        self.threads
            .get(&thread_id)
            .map(|e| *e)
            .unwrap_or_default()
    }

    pub fn forget(&self, thread_id: u64) {
        self.threads.remove(&thread_id);
    }
}

/// A finished completion plus any warnings worth showing to the user.
#[derive(Debug, Clone)]
pub struct Completion {
    pub response: ChatResponse,
    /// The request as it was actually sent (after `max_tokens` clamping).
    pub request: ChatRequest,
    pub warnings: Vec<String>,
}

/// Sends completion requests and keeps the usage ledger.
///
/// Fail-fast: provider errors are returned to the caller unchanged, there is
/// no retry loop here.
pub struct CompletionDispatcher {
    provider: Box<dyn LlmProvider>,
    ledger: UsageLedger,
    context_override: Option<u32>,
    warning_ratio: f32,
}

impl CompletionDispatcher {
    pub fn new(
        provider: Box<dyn LlmProvider>,
        context_override: Option<u32>,
        warning_ratio: f32,
    ) -> Self {
        Self {
            provider,
            ledger: UsageLedger::new(),
            context_override,
            warning_ratio,
        }
    }

    /// Dispatcher using the `[chat]` context window override and warning ratio.
    pub fn from_config(provider: Box<dyn LlmProvider>, chat: &ChatConfig) -> Self {
        Self::new(provider, chat.context_window, chat.token_warning_ratio)
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Context window for `model`, honoring the configured override.
    pub fn context_window(&self, model: &str) -> u32 {
        self.context_override
            .unwrap_or_else(|| tokens::context_window(model))
    }

    /// Clamp `max_tokens` so prompt + completion fit in the context window.
    ///
    /// Returns a warning when the limit had to be reduced.
    pub fn fit_max_tokens(&self, req: &mut ChatRequest) -> Result<Option<String>, ProviderError> {
        if req.messages.is_empty() {
            return Err(ProviderError::EmptyRequest);
        }

        let limit = self.context_window(&req.model);
        let estimated = tokens::estimate_messages(&req.messages);
        if estimated >= limit {
            return Err(ProviderError::ContextOverflow { estimated, limit });
        }

        let quota = limit - estimated;
        match req.max_tokens {
            Some(max) if max > quota => {
                // round down to compensate for tokenizer drift
                let reduced = if quota >= 10 { quota / 10 * 10 } else { quota };
                req.max_tokens = Some(reduced);
                Ok(Some(format!(
                    "max_tokens was reduced to {reduced} to avoid exceeding the token limit"
                )))
            }
            _ => Ok(None),
        }
    }

    /// Send a request and wait for the whole response.
    ///
    /// `thread_id` selects the ledger entry; one-shot requests pass `None`.
    pub async fn dispatch(
        &self,
        thread_id: Option<u64>,
        mut req: ChatRequest,
    ) -> Result<Completion, ProviderError> {
        let mut warnings = Vec::new();
        if let Some(w) = self.fit_max_tokens(&mut req)? {
            warnings.push(w);
        }
        req.stream = false;

        info!(
            model = %req.model, provider = %self.provider.name(),
            messages = req.messages.len(), thread = ?thread_id, "dispatching completion"
        );

        let response = self.provider.send(&req).await.map_err(|e| {
            warn!(error = %e, code = e.code(), thread = ?thread_id, "completion failed");
            e
        })?;

        Ok(self.finish(thread_id, req, response, warnings))
    }

    /// Stream a request. Text deltas are forwarded to `tx` as they arrive;
    /// the assembled response is returned once the stream ends.
    pub async fn dispatch_stream(
        &self,
        thread_id: Option<u64>,
        mut req: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<Completion, ProviderError> {
        let mut warnings = Vec::new();
        if let Some(w) = self.fit_max_tokens(&mut req)? {
            warnings.push(w);
        }
        req.stream = true;

        info!(
            model = %req.model, provider = %self.provider.name(),
            messages = req.messages.len(), thread = ?thread_id, "dispatching streaming completion"
        );

        let (inner_tx, mut inner_rx) = mpsc::channel::<StreamEvent>(64);

        let forward = async {
            let mut text = String::new();
            let mut done: Option<(String, Usage, String)> = None;
            let mut failure: Option<String> = None;

            while let Some(event) = inner_rx.recv().await {
                match event {
                    StreamEvent::TextDelta { text: delta } => {
                        text.push_str(&delta);
                        let _ = tx.send(StreamEvent::TextDelta { text: delta }).await;
                    }
                    StreamEvent::Done {
                        model,
                        usage,
                        finish_reason,
                    } => done = Some((model, usage, finish_reason)),
                    StreamEvent::Error { message } => failure = Some(message),
                }
            }
            (text, done, failure)
        };

        let (sent, (text, done, failure)) =
            tokio::join!(self.provider.send_stream(&req, inner_tx), forward);

        if let Err(e) = sent {
            warn!(error = %e, code = e.code(), thread = ?thread_id, "streaming completion failed");
            return Err(e);
        }
        if let Some(message) = failure {
            warn!(error = %message, thread = ?thread_id, "completion stream broke off");
            return Err(ProviderError::Stream(message));
        }
        let Some((model, usage, finish_reason)) = done else {
            return Err(ProviderError::Stream(
                "stream ended without a completion event".to_string(),
            ));
        };

        let response = ChatResponse {
            content: text,
            model,
            usage,
            finish_reason,
        };
        let _ = tx
            .send(StreamEvent::Done {
                model: response.model.clone(),
                usage,
                finish_reason: response.finish_reason.clone(),
            })
            .await;

        Ok(self.finish(thread_id, req, response, warnings))
    }

    fn finish(
        &self,
        thread_id: Option<u64>,
        req: ChatRequest,
        response: ChatResponse,
        mut warnings: Vec<String>,
    ) -> Completion {
        info!(
            model = %response.model,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            finish_reason = %response.finish_reason,
            thread = ?thread_id,
            "completion received"
        );

        if let Some(id) = thread_id {
            self.ledger.record(id, &response.usage);
        }

        if !response.finish_reason.is_empty() && response.finish_reason != "stop" {
            warnings.push(format!(
                "Finish reason was \"{}\"",
                response.finish_reason
            ));
        }

        let limit = self.context_window(&req.model);
        let ratio = response.usage.total_tokens as f32 / limit as f32;
        if ratio > self.warning_ratio {
            warnings.push(format!(
                "Token usage is at {:.0}% of the model's limit.",
                ratio * 100.0
            ));
        }

        Completion {
            response,
            request: req,
            warnings,
        }
    }
}
