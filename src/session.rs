//! Session lifecycle: device setup, streaming, reconnection, teardown
//!
//! The controller owns the capture/playback devices, the voice-activity
//! gate, the transcript filter, and one backend handle. A single select
//! loop moves audio toward the backend and events back out; backend
//! drops with recoverable errors enter a bounded reconnect cycle while
//! captured audio buffers with drop-oldest semantics.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioCapture, AudioPlayback, FrameStream};
use crate::backend::{Backend, BackendEvent, BackendHandle, BackendInput};
use crate::config::{Config, VadConfig};
use crate::transcript::{FilterDecision, TranscriptFilter, TranscriptFragment};
use crate::vad::{GateMode, GateOutput, VoiceActivityGate};
use crate::{Error, Result};

/// Reconnection attempts before the session gives up: waits 1 s, 2 s, 4 s
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Audio items buffered while reconnecting; oldest dropped on overflow
const RECONNECT_BUFFER_CAPACITY: usize = 128;

/// Speech ranges remembered for hallucination-window checks
const SPEECH_LEDGER_CAPACITY: usize = 16;

/// How often held transcript units are flushed during silence
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Playback drain allowance at teardown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Output of a running session
#[derive(Debug)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Interim hypothesis, superseded by later events
    Partial(TranscriptFragment),
    /// Committed transcript unit, post-filter
    Final(TranscriptFragment),
}

/// Exponential backoff schedule for reconnection
#[derive(Debug, Default)]
struct ReconnectPolicy {
    attempt: u32,
}

impl ReconnectPolicy {
    /// Delay before the next attempt, `None` once attempts are exhausted
    fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= MAX_RECONNECT_ATTEMPTS {
            return None;
        }
        let delay = Duration::from_secs(1 << self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    const fn attempts_used(&self) -> u32 {
        self.attempt
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Bounded drop-oldest buffer for audio held across a reconnect
#[derive(Debug, Default)]
struct ReconnectBuffer {
    items: VecDeque<BackendInput>,
    dropped: u64,
}

impl ReconnectBuffer {
    fn push(&mut self, input: BackendInput) {
        if self.items.len() >= RECONNECT_BUFFER_CAPACITY {
            self.items.pop_front();
            self.dropped += 1;
        }
        self.items.push_back(input);
    }

    fn drain(&mut self) -> impl Iterator<Item = BackendInput> + '_ {
        self.items.drain(..)
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    const fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Recent speech time ranges, used to decide whether a transcript
/// fragment overlapped actual voice activity
#[derive(Debug, Default)]
struct SpeechLedger {
    ranges: VecDeque<(Duration, Duration)>,
    open_since: Option<Duration>,
}

impl SpeechLedger {
    fn record(&mut self, start: Duration, end: Duration) {
        if self.ranges.len() >= SPEECH_LEDGER_CAPACITY {
            self.ranges.pop_front();
        }
        self.ranges.push_back((start, end));
    }

    /// Speech started (pass-through mode activity tracking)
    fn open(&mut self, at: Duration) {
        self.open_since = Some(at);
    }

    /// Speech ended; the open range is committed
    fn close(&mut self, at: Duration) {
        if let Some(start) = self.open_since.take() {
            self.record(start, at);
        }
    }

    /// Whether the fragment's range overlapped any recorded speech
    fn overlaps(&self, start: Duration, end: Duration) -> bool {
        let in_open = self.open_since.is_some_and(|open| end >= open);
        in_open
            || self
                .ranges
                .iter()
                .any(|&(s, e)| start <= e && end >= s)
    }
}

/// Drives one transcription session from device open to teardown.
pub struct SessionController {
    config: Config,
    backend: Backend,
    state: SessionState,
    cancel: CancellationToken,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl SessionController {
    /// Construct a controller and its event stream.
    ///
    /// Credential and model validation happen here, before any device or
    /// network I/O.
    ///
    /// # Errors
    ///
    /// Returns `CredentialMissing` or `ModelLoad` on failed pre-flight
    /// validation
    pub fn new(config: Config) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        let backend = Backend::from_config(&config)?;
        let (event_tx, event_rx) = mpsc::channel(256);

        Ok((
            Self {
                config,
                backend,
                state: SessionState::Idle,
                cancel: CancellationToken::new(),
                event_tx,
            },
            event_rx,
        ))
    }

    /// Token that stops the session when cancelled
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the session to completion.
    ///
    /// Returns `Ok(())` after a user-initiated stop, or the fatal error
    /// that closed the session.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if audio devices cannot be opened,
    /// `SessionFailed` when reconnection attempts are exhausted, or the
    /// first non-recoverable backend error
    #[allow(clippy::future_not_send)]
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            backend,
            state,
            cancel,
            event_tx,
        } = self;
        let mut core = SessionCore {
            state,
            cancel,
            event_tx,
        };

        core.set_state(SessionState::Connecting).await;

        let mut capture = AudioCapture::open()?;
        let mut playback = if backend.has_audio_output() {
            let mut playback = AudioPlayback::open()?;
            playback.start()?;
            Some(playback)
        } else {
            None
        };
        let mut frames = capture.start()?;

        tracing::info!(backend = backend.name(), "session starting");

        let mut connector = async || backend.start().await;
        let result = core
            .drive(
                config.vad.clone(),
                backend.gate_mode(),
                &mut frames,
                playback.as_ref(),
                &mut connector,
            )
            .await;

        capture.stop();
        if let Some(playback) = &mut playback {
            playback.stop();
        }
        tracing::info!("session closed");
        result
    }
}

/// State, cancellation, and event emission for one session, driven over
/// an injected frame stream and backend connector
struct SessionCore {
    state: SessionState,
    cancel: CancellationToken,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl SessionCore {
    /// Run the select loop from first connect through backend teardown
    #[allow(clippy::too_many_lines)]
    async fn drive<C>(
        &mut self,
        vad: VadConfig,
        gate_mode: GateMode,
        frames: &mut FrameStream,
        playback: Option<&AudioPlayback>,
        connector: &mut C,
    ) -> Result<()>
    where
        C: AsyncFnMut() -> Result<BackendHandle>,
    {
        let mut gate = VoiceActivityGate::new(vad, gate_mode);
        let mut filter = TranscriptFilter::new();
        let mut ledger = SpeechLedger::default();
        let mut policy = ReconnectPolicy::default();
        let mut buffer = ReconnectBuffer::default();

        let mut handle: Option<BackendHandle> = match connector().await {
            Ok(handle) => {
                self.set_state(SessionState::Streaming).await;
                Some(handle)
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "initial connection failed, retrying");
                self.set_state(SessionState::Reconnecting).await;
                None
            }
            Err(e) => {
                self.set_state(SessionState::Closed).await;
                return Err(e);
            }
        };

        let mut reconnect_at = if handle.is_some() {
            None
        } else {
            // next_delay always yields on a fresh policy
            policy.next_delay().map(|d| tokio::time::Instant::now() + d)
        };

        let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!("session stop requested");
                    break Ok(());
                }

                frame = frames.recv() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => break Err(e),
                        None => break Err(Error::StreamInterrupted(
                            "capture channel closed".to_string(),
                        )),
                    };

                    let was_active = gate.is_active();
                    let frame_start = frame.start_offset();
                    let frame_end = frame.end_offset();
                    let output = gate.push(frame);

                    // Pass-through mode tracks speech ranges by gate
                    // activity transitions
                    if gate_mode == GateMode::PassThrough {
                        if !was_active && gate.is_active() {
                            ledger.open(frame_start);
                        } else if was_active && !gate.is_active() {
                            ledger.close(frame_end);
                        }
                    }

                    let input = match output {
                        GateOutput::None => None,
                        GateOutput::Forward(frame) => Some(BackendInput::Frame(frame)),
                        GateOutput::Segment(segment) => {
                            ledger.record(segment.start(), segment.end());
                            tracing::debug!(
                                duration_ms = segment.duration().as_millis(),
                                "voice segment closed"
                            );
                            Some(BackendInput::Segment(segment))
                        }
                    };

                    if let Some(input) = input {
                        match (&handle, self.state) {
                            (Some(h), SessionState::Streaming) => {
                                if let Err(e) = h.send(input).await {
                                    tracing::warn!(error = %e, "backend send failed");
                                }
                            }
                            _ => buffer.push(input),
                        }
                    }
                }

                event = next_backend_event(&mut handle) => {
                    match event {
                        Some(BackendEvent::Transcript(fragment)) => {
                            self.dispatch_fragment(fragment, &mut filter, &ledger).await;
                        }
                        Some(BackendEvent::Audio(frame)) => {
                            if let Some(playback) = playback {
                                playback.enqueue(&frame);
                            }
                        }
                        Some(BackendEvent::Closed(e)) => {
                            handle = None;
                            if !e.is_recoverable() {
                                break Err(e);
                            }
                            // No continuation is coming over this connection
                            if let Some(fragment) = filter.flush() {
                                let _ = self
                                    .event_tx
                                    .send(SessionEvent::Final(fragment))
                                    .await;
                            }
                            self.set_state(SessionState::Reconnecting).await;
                            match policy.next_delay() {
                                Some(delay) => {
                                    tracing::warn!(
                                        error = %e,
                                        retry_in_secs = delay.as_secs(),
                                        "backend connection lost"
                                    );
                                    reconnect_at =
                                        Some(tokio::time::Instant::now() + delay);
                                }
                                None => {
                                    break Err(Error::SessionFailed(format!(
                                        "reconnection failed after \
                                         {MAX_RECONNECT_ATTEMPTS} attempts: {e}"
                                    )));
                                }
                            }
                        }
                        None => {
                            // Worker ended without a close event
                            handle = None;
                            self.set_state(SessionState::Reconnecting).await;
                            match policy.next_delay() {
                                Some(delay) => {
                                    reconnect_at =
                                        Some(tokio::time::Instant::now() + delay);
                                }
                                None => {
                                    break Err(Error::SessionFailed(format!(
                                        "reconnection failed after \
                                         {MAX_RECONNECT_ATTEMPTS} attempts"
                                    )));
                                }
                            }
                        }
                    }
                }

                () = wait_until(reconnect_at) => {
                    reconnect_at = None;
                    tracing::info!(
                        attempt = policy.attempts_used(),
                        "attempting reconnection"
                    );
                    match connector().await {
                        Ok(new_handle) => {
                            let buffered = buffer.len();
                            let dropped = buffer.dropped();
                            for input in buffer.drain() {
                                if new_handle.send(input).await.is_err() {
                                    break;
                                }
                            }
                            if buffered > 0 || dropped > 0 {
                                tracing::info!(buffered, dropped, "reconnect buffer replayed");
                            }
                            policy.reset();
                            handle = Some(new_handle);
                            self.set_state(SessionState::Streaming).await;
                        }
                        Err(e) if e.is_recoverable() => {
                            match policy.next_delay() {
                                Some(delay) => {
                                    tracing::warn!(
                                        error = %e,
                                        retry_in_secs = delay.as_secs(),
                                        "reconnection failed"
                                    );
                                    reconnect_at =
                                        Some(tokio::time::Instant::now() + delay);
                                }
                                None => {
                                    break Err(Error::SessionFailed(format!(
                                        "reconnection failed after \
                                         {MAX_RECONNECT_ATTEMPTS} attempts: {e}"
                                    )));
                                }
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }

                _ = flush_tick.tick() => {
                    if !gate.is_active() {
                        if let Some(fragment) = filter.flush() {
                            let _ = self.event_tx.send(SessionEvent::Final(fragment)).await;
                        }
                    }
                }
            }
        };

        // Teardown: flush the gate toward the backend, give playback a
        // bounded drain, then release the backend
        if let Some(segment) = gate.flush() {
            if let Some(h) = &handle {
                let _ = h.send(BackendInput::Segment(segment)).await;
            }
        }
        if let Some(playback) = playback {
            playback.drain(DRAIN_TIMEOUT).await;
        }
        if let Some(handle) = handle.take() {
            handle.stop().await;
        }
        if let Some(fragment) = filter.flush() {
            let _ = self.event_tx.send(SessionEvent::Final(fragment)).await;
        }

        self.set_state(SessionState::Closed).await;
        result
    }

    async fn dispatch_fragment(
        &self,
        fragment: TranscriptFragment,
        filter: &mut TranscriptFilter,
        ledger: &SpeechLedger,
    ) {
        let silence_window = !ledger.overlaps(fragment.start, fragment.end);

        match filter.push(fragment, silence_window) {
            FilterDecision::Emit(unit) => {
                let _ = self.event_tx.send(SessionEvent::Final(unit)).await;
            }
            FilterDecision::Hold => {
                if let Some(partial) = filter.pending_partial() {
                    let _ = self
                        .event_tx
                        .send(SessionEvent::Partial(partial.clone()))
                        .await;
                }
            }
            FilterDecision::Suppress(flagged) => {
                tracing::debug!(text = %flagged.text, "hallucination suppressed");
            }
        }
    }

    async fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        tracing::info!(from = %self.state, to = %state, "session state changed");
        self.state = state;
        let _ = self.event_tx.send(SessionEvent::StateChanged(state)).await;
    }
}

/// Next event from the backend, pending forever while disconnected
async fn next_backend_event(handle: &mut Option<BackendHandle>) -> Option<BackendEvent> {
    match handle {
        Some(h) => h.next_event().await,
        None => std::future::pending().await,
    }
}

/// Sleep until the reconnect deadline, pending forever if none is set
async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
