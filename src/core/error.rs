use thiserror::Error;

/// Core error type for the actiongraph execution engine.
///
/// This error type uses `thiserror` with proper `#[source]` annotations
/// to preserve error chains for debugging and error handling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Serialization failed when encoding a value.
    #[error("serialization failed")]
    Serialization(#[source] serde_json::Error),

    /// Deserialization failed when decoding a value.
    #[error("deserialization failed")]
    Deserialization(#[source] serde_json::Error),

    /// A YAML document could not be parsed.
    #[error("invalid YAML document")]
    Yaml(#[source] serde_yaml::Error),

    /// An invalid status string was encountered during parsing.
    #[error("invalid status: {0}")]
    InvalidStatus(String),

    /// A status transition that the state machine does not allow.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
