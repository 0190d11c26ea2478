pub mod adapter;
pub mod app;
pub mod attach;
pub mod commands;
pub mod context;
pub mod embed;
pub mod error;
pub mod handler;
pub mod model;
pub mod normalize;
pub mod notice;
pub mod registry;
pub mod respond;
pub mod send;
pub mod session;

pub use adapter::DiscordAdapter;
pub use app::ParleyApp;
pub use error::DiscordError;
pub use model::SourceMessage;
pub use session::{ChatSession, SessionOptions};
