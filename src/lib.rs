//! Kopivoice - real-time speech transcription gateway
//!
//! This library provides the core pipeline for live microphone
//! transcription and one-shot audio file understanding:
//! - Audio capture/playback (16 kHz in, 24 kHz out, mono 16-bit PCM)
//! - Energy-based voice-activity gating with hallucination filtering
//! - Three interchangeable transcription backends
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Microphone (cpal)                   │
//! └────────────────────┬────────────────────────────────┘
//!                      │ 1024-sample frames
//! ┌────────────────────▼────────────────────────────────┐
//! │   Voice-Activity Gate ──► Session Controller         │
//! │   (segments / pass-through)      │                   │
//! └────────────────────┬─────────────┼───────────────────┘
//!                      │             │ transcript filter
//! ┌────────────────────▼────────────────────────────────┐
//! │   Backend: local whisper │ cloud STT │ live duplex   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod backend;
pub mod config;
pub mod error;
pub mod session;
pub mod transcript;
pub mod understand;
pub mod vad;

pub use backend::{Backend, BackendEvent, BackendHandle, BackendInput};
pub use config::{ApiKeys, BackendChoice, Config, ModelSize, VadConfig};
pub use error::{Error, Result};
pub use session::{SessionController, SessionEvent, SessionState};
pub use transcript::{Finality, FilterDecision, TranscriptFilter, TranscriptFragment};
pub use vad::{GateMode, GateOutput, GateState, VoiceActivityGate, VoiceSegment};
