//! Transcription backend adapters
//!
//! A closed union of the three backend variants behind one shared
//! surface: `start` yields a [`BackendHandle`] carrying the input sender
//! and event receiver for the adapter's worker tasks. Selection happens
//! once at session construction and is never re-dispatched per frame.

pub mod cloud;
pub mod live;
pub mod local;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use cloud::CloudSttAdapter;
pub use live::LiveAdapter;
pub use local::LocalModelAdapter;

use crate::audio::AudioFrame;
use crate::config::{BackendChoice, Config};
use crate::transcript::TranscriptFragment;
use crate::vad::{GateMode, VoiceSegment};
use crate::{Error, Result};

/// Audio pushed into a backend: whole segments for request/response
/// backends, frame-by-frame for streaming backends
#[derive(Debug)]
pub enum BackendInput {
    Segment(VoiceSegment),
    Frame(AudioFrame),
}

/// Output produced by a backend worker
#[derive(Debug)]
pub enum BackendEvent {
    /// Raw transcript fragment (pre-filter)
    Transcript(TranscriptFragment),
    /// Native audio response for playback (duplex backend only)
    Audio(AudioFrame),
    /// The backend terminated; the error decides whether the session
    /// may reconnect
    Closed(Error),
}

const INPUT_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Grace period for resource release after stop before forced close
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Handle to a started backend: input sender, event receiver, and the
/// session-wide cancellation token observed by the worker tasks
pub struct BackendHandle {
    input_tx: mpsc::Sender<BackendInput>,
    event_rx: mpsc::Receiver<BackendEvent>,
    cancel: CancellationToken,
}

impl BackendHandle {
    /// Create a handle plus the worker-side channel ends
    pub(crate) fn channel(
        cancel: CancellationToken,
    ) -> (
        Self,
        mpsc::Receiver<BackendInput>,
        mpsc::Sender<BackendEvent>,
    ) {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                input_tx,
                event_rx,
                cancel,
            },
            input_rx,
            event_tx,
        )
    }

    /// Push audio into the backend
    ///
    /// # Errors
    ///
    /// Returns `ConnectionDropped` if the worker has terminated
    pub async fn send(&self, input: BackendInput) -> Result<()> {
        self.input_tx
            .send(input)
            .await
            .map_err(|_| Error::ConnectionDropped("backend input channel closed".to_string()))
    }

    /// Receive the next backend event; `None` once the worker has
    /// terminated and drained
    pub async fn next_event(&mut self) -> Option<BackendEvent> {
        self.event_rx.recv().await
    }

    /// Cancel the worker and wait up to [`STOP_GRACE`] for it to release
    /// its resources
    pub async fn stop(mut self) {
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        loop {
            match tokio::time::timeout_at(deadline, self.event_rx.recv()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("backend stop grace period elapsed, forcing close");
                    break;
                }
            }
        }
    }
}

/// The three backend variants as a closed tagged union
pub enum Backend {
    Local(LocalModelAdapter),
    Cloud(CloudSttAdapter),
    Live(LiveAdapter),
}

impl Backend {
    /// Build the adapter selected by the configuration.
    ///
    /// Pre-flight checks (credentials, model files) run here, before any
    /// device or network I/O.
    ///
    /// # Errors
    ///
    /// Returns `CredentialMissing` or `ModelLoad` when pre-flight
    /// validation fails
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.backend {
            BackendChoice::LocalModel(size) => Ok(Self::Local(LocalModelAdapter::new(
                size,
                &config.model_dir,
            )?)),
            BackendChoice::CloudStt => Ok(Self::Cloud(CloudSttAdapter::new(&config.api_keys)?)),
            BackendChoice::LiveMultimodal => {
                Ok(Self::Live(LiveAdapter::new(&config.api_keys)?))
            }
        }
    }

    /// How the voice-activity gate should feed this backend
    #[must_use]
    pub const fn gate_mode(&self) -> GateMode {
        match self {
            Self::Local(_) | Self::Cloud(_) => GateMode::Segmented,
            Self::Live(_) => GateMode::PassThrough,
        }
    }

    /// Whether this backend produces audio responses for playback
    #[must_use]
    pub const fn has_audio_output(&self) -> bool {
        matches!(self, Self::Live(_))
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Cloud(_) => "cloud",
            Self::Live(_) => "live",
        }
    }

    /// Start the backend's worker tasks and return the session handle
    ///
    /// # Errors
    ///
    /// Returns a connection-level error if the backend cannot be reached
    pub async fn start(&self) -> Result<BackendHandle> {
        match self {
            Self::Local(adapter) => adapter.start(),
            Self::Cloud(adapter) => Ok(adapter.start()),
            Self::Live(adapter) => adapter.start().await,
        }
    }
}
