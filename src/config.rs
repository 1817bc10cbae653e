//! Configuration for kopivoice sessions

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::{Error, Result};

/// Which transcription backend a session uses.
///
/// Selected once at session construction and immutable for the
/// lifetime of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    /// On-device Whisper inference, no network
    LocalModel(ModelSize),
    /// Groq Whisper HTTP API, one request per voice segment
    CloudStt,
    /// Gemini Live full-duplex WebSocket session with audio responses
    LiveMultimodal,
}

/// Local Whisper model size variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ModelSize {
    Small,
    Medium,
    #[default]
    Turbo,
}

impl ModelSize {
    /// File name of the ggml model weights for this size
    #[must_use]
    pub const fn model_file(self) -> &'static str {
        match self {
            Self::Small => "ggml-small.bin",
            Self::Medium => "ggml-medium.bin",
            Self::Turbo => "ggml-large-v3-turbo.bin",
        }
    }
}

/// Voice-activity gate tuning.
///
/// Exact threshold and durations are deployment-dependent, so they are
/// configuration rather than constants.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// RMS energy (over samples normalized to [-1, 1]) above which a frame
    /// counts as speech
    pub energy_threshold: f32,

    /// Consecutive speech frames required before a segment opens
    pub debounce_frames: usize,

    /// Trailing low-energy duration that closes a segment
    pub gap: Duration,

    /// Leading/trailing silence padding kept around each segment
    pub padding: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.015,
            debounce_frames: 3,
            gap: Duration::from_millis(700),
            padding: Duration::from_millis(200),
        }
    }
}

/// API keys for cloud backends
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// Groq API key (cloud Whisper transcription)
    pub groq: Option<SecretString>,

    /// Gemini API key (live sessions and file analysis)
    pub gemini: Option<SecretString>,
}

impl ApiKeys {
    /// Read keys from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from)
        };

        Self {
            groq: read("GROQ_API_KEY"),
            gemini: read("GEMINI_API_KEY"),
        }
    }

    /// Return the Groq key, validated non-empty
    ///
    /// # Errors
    ///
    /// Returns `CredentialMissing` if the key is not configured
    pub fn groq(&self) -> Result<&str> {
        self.groq
            .as_ref()
            .map(ExposeSecret::expose_secret)
            .ok_or_else(|| Error::CredentialMissing("GROQ_API_KEY".to_string()))
    }

    /// Return the Gemini key, validated non-empty
    ///
    /// # Errors
    ///
    /// Returns `CredentialMissing` if the key is not configured
    pub fn gemini(&self) -> Result<&str> {
        self.gemini
            .as_ref()
            .map(ExposeSecret::expose_secret)
            .ok_or_else(|| Error::CredentialMissing("GEMINI_API_KEY".to_string()))
    }
}

/// Session configuration, passed explicitly into the controller
#[derive(Debug, Clone)]
pub struct Config {
    /// Selected backend variant
    pub backend: BackendChoice,

    /// Voice-activity gate tuning
    pub vad: VadConfig,

    /// API keys for cloud backends
    pub api_keys: ApiKeys,

    /// Directory holding local model weights
    pub model_dir: PathBuf,

    /// Verbosity flag (observability only, never protocol behavior)
    pub verbose: bool,
}

impl Config {
    /// Build a configuration for the given backend, reading keys and paths
    /// from the environment
    #[must_use]
    pub fn for_backend(backend: BackendChoice) -> Self {
        Self {
            backend,
            vad: VadConfig::default(),
            api_keys: ApiKeys::from_env(),
            model_dir: default_model_dir(),
            verbose: false,
        }
    }
}

/// Default directory for local model weights, `KOPIVOICE_MODEL_DIR`
/// overriding the XDG cache location
#[must_use]
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KOPIVOICE_MODEL_DIR") {
        return PathBuf::from(dir);
    }

    directories::ProjectDirs::from("dev", "kopivoice", "kopivoice").map_or_else(
        || PathBuf::from(".cache/kopivoice/models"),
        |d| d.cache_dir().join("models"),
    )
}

/// Load environment variables from a `.env` file if present
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!(error = %e, "failed to load .env"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_file_names() {
        assert_eq!(ModelSize::Small.model_file(), "ggml-small.bin");
        assert_eq!(ModelSize::Turbo.model_file(), "ggml-large-v3-turbo.bin");
    }

    #[test]
    fn vad_defaults_are_sane() {
        let vad = VadConfig::default();
        assert!(vad.energy_threshold > 0.0);
        assert!(vad.debounce_frames >= 1);
        assert!(vad.gap > vad.padding);
    }

    #[test]
    fn missing_keys_are_credential_errors() {
        let keys = ApiKeys::default();
        assert!(matches!(keys.groq(), Err(Error::CredentialMissing(_))));
        assert!(matches!(keys.gemini(), Err(Error::CredentialMissing(_))));
    }

    #[test]
    fn present_key_is_exposed() {
        let keys = ApiKeys {
            groq: Some(SecretString::from("gsk_test".to_string())),
            gemini: None,
        };
        assert_eq!(keys.groq().unwrap(), "gsk_test");
    }
}
