use thiserror::Error;
use uuid::Uuid;

/// Main error type for the autotuning search engine
#[derive(Error, Debug)]
pub enum DsatError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown trial: {0}")]
    UnknownTrial(Uuid),

    #[error("Invalid hyperparameters: {message}")]
    InvalidHyperparameters { message: String },

    #[error("Invalid model profile info: {message}")]
    ProfileInfo { message: String },

    #[error("Trial {0} reported a validation without any metrics")]
    InvalidMetrics(Uuid),

    #[error("The model profile info trial has not reported its metrics yet")]
    ProfileNotResolved,

    #[error("Experiment submission failed: {0}")]
    Submission(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DsatError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn invalid_hparams(message: impl Into<String>) -> Self {
        Self::InvalidHyperparameters {
            message: message.into(),
        }
    }

    pub fn profile_info(message: impl Into<String>) -> Self {
        Self::ProfileInfo {
            message: message.into(),
        }
    }

    /// Errors caused by a misbehaving driver rather than by the search itself.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownTrial(_)
                | Self::InvalidMetrics(_)
                | Self::ProfileInfo { .. }
                | Self::ProfileNotResolved
        )
    }
}

/// Result type alias for search operations
pub type DsatResult<T> = Result<T, DsatError>;
