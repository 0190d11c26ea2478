use crate::provider::Usage;

/// Events emitted during a streaming completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text content from the model.
    TextDelta { text: String },

    /// Stream completed successfully.
    Done {
        model: String,
        usage: Usage,
        finish_reason: String,
    },

    /// Error during streaming.
    Error { message: String },
}

/// Payload of an SSE `data:` line. Other fields (`event:`, `id:`,
/// comments) carry nothing for chat completions.
pub fn parse_sse_line(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}
