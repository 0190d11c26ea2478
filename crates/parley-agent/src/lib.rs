pub mod dispatcher;
pub mod openai;
pub mod provider;
pub mod stream;
pub mod tokens;

pub use dispatcher::{Completion, CompletionDispatcher, ThreadUsage, UsageLedger};
pub use provider::{ChatRequest, ChatResponse, LlmProvider, Message, ProviderError, Role, Usage};
pub use stream::StreamEvent;
