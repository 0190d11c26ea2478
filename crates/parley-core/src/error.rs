use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown preset: {0}")]
    UnknownPreset(String),

    #[error("Invalid option value for {option}: {value}")]
    InvalidOption { option: String, value: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ParleyError {
    /// Short error code string used in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            ParleyError::Config(_) => "CONFIG_ERROR",
            ParleyError::UnknownPreset(_) => "UNKNOWN_PRESET",
            ParleyError::InvalidOption { .. } => "INVALID_OPTION",
            ParleyError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
