//! Error types for kopivoice

use thiserror::Error;

/// Result type alias for kopivoice operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in kopivoice
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A required API credential is missing or empty
    #[error("missing credential: {0}")]
    CredentialMissing(String),

    /// No compatible audio device exists (fatal, session never starts)
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The hardware stream dropped mid-session (fatal, device-side)
    #[error("audio stream interrupted: {0}")]
    StreamInterrupted(String),

    /// Generic audio processing error
    #[error("audio error: {0}")]
    Audio(String),

    /// Cloud backend rate limit exhausted after bounded retries
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Connection-level network failure (recoverable via session reconnect)
    #[error("network error: {0}")]
    Network(String),

    /// Duplex streaming connection dropped (recoverable via session reconnect)
    #[error("connection dropped: {0}")]
    ConnectionDropped(String),

    /// Local model failed to load (fatal, reported once)
    #[error("model load error: {0}")]
    ModelLoad(String),

    /// Per-segment inference failure (segment skipped, session continues)
    #[error("inference error: {0}")]
    Inference(String),

    /// Terminal report after exhausted recovery
    #[error("session failed: {0}")]
    SessionFailed(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the session controller may attempt reconnection after this error
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::ConnectionDropped(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(Error::Network("reset".into()).is_recoverable());
        assert!(Error::ConnectionDropped("eof".into()).is_recoverable());
        assert!(!Error::StreamInterrupted("xrun".into()).is_recoverable());
        assert!(!Error::ModelLoad("missing".into()).is_recoverable());
        assert!(!Error::RateLimited("429".into()).is_recoverable());
    }
}
