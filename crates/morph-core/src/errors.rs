use std::time::Duration;

/// Failure modes of a single model call.
///
/// Nothing here is retried automatically; the caller decides what to do.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No model access configured. Reported before any network attempt.
    #[error("model access is not configured")]
    NotConfigured,

    /// The endpoint answered with a non-2xx status.
    #[error("{status}: {body}")]
    Status { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::NotConfigured)
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotConfigured => "not_configured",
            Self::Status { .. } => "status",
            Self::Network(_) => "network",
            Self::Decode(_) => "decode",
            Self::Timeout(_) => "timeout",
        }
    }
}
