pub mod config;
pub mod error;
pub mod preset;
pub mod types;

pub use config::ParleyConfig;
pub use error::{ParleyError, Result};
pub use preset::{Preset, PresetParams, SystemSource};
pub use types::{ReplyTo, ResponseTiming};
