//! On-device transcription via a local whisper.cpp installation
//!
//! Segments are written to a temporary WAV file and handed to the
//! `whisper-cli` binary. Model weights are resolved and validated before
//! the session opens any device, so a missing model fails fast.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{BackendEvent, BackendHandle, BackendInput};
use crate::audio::wav;
use crate::config::ModelSize;
use crate::transcript::TranscriptFragment;
use crate::vad::VoiceSegment;
use crate::{Error, Result};

/// Environment override for the transcriber binary path
const WHISPER_BIN_ENV: &str = "KOPIVOICE_WHISPER_BIN";
const WHISPER_BIN_NAME: &str = "whisper-cli";

#[derive(Debug)]
pub struct LocalModelAdapter {
    binary: PathBuf,
    model_path: PathBuf,
}

impl LocalModelAdapter {
    /// Resolve the transcriber binary and model weights.
    ///
    /// # Errors
    ///
    /// Returns `ModelLoad` if the binary is not on `PATH` or the weights
    /// file for the selected size does not exist under `model_dir`
    pub fn new(size: ModelSize, model_dir: &Path) -> Result<Self> {
        let binary = match std::env::var(WHISPER_BIN_ENV) {
            Ok(path) => PathBuf::from(path),
            Err(_) => which::which(WHISPER_BIN_NAME).map_err(|_| {
                Error::ModelLoad(format!(
                    "{WHISPER_BIN_NAME} not found on PATH (set {WHISPER_BIN_ENV} to override)"
                ))
            })?,
        };

        let model_path = model_dir.join(size.model_file());
        if !model_path.is_file() {
            return Err(Error::ModelLoad(format!(
                "model weights not found: {}",
                model_path.display()
            )));
        }

        tracing::debug!(
            binary = %binary.display(),
            model = %model_path.display(),
            "local model adapter ready"
        );

        Ok(Self { binary, model_path })
    }

    /// Spawn the segment worker
    ///
    /// # Errors
    ///
    /// Infallible once construction succeeded; kept fallible for parity
    /// with the other adapters
    pub(crate) fn start(&self) -> Result<BackendHandle> {
        let cancel = CancellationToken::new();
        let (handle, mut input_rx, event_tx) = BackendHandle::channel(cancel.clone());

        let binary = self.binary.clone();
        let model_path = self.model_path.clone();

        tokio::spawn(async move {
            loop {
                let input = tokio::select! {
                    () = cancel.cancelled() => break,
                    input = input_rx.recv() => match input {
                        Some(input) => input,
                        None => break,
                    },
                };

                let segment = match input {
                    BackendInput::Segment(segment) => segment,
                    BackendInput::Frame(_) => {
                        tracing::trace!("local backend ignores frame input");
                        continue;
                    }
                };

                match transcribe_segment(&binary, &model_path, &segment).await {
                    Ok(fragment) => {
                        if event_tx
                            .send(BackendEvent::Transcript(fragment))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e @ Error::Inference(_)) => {
                        // Skip the segment, keep the session running
                        tracing::warn!(error = %e, "segment transcription failed");
                    }
                    Err(e) => {
                        let _ = event_tx.send(BackendEvent::Closed(e)).await;
                        break;
                    }
                }
            }
            tracing::debug!("local backend worker stopped");
        });

        Ok(handle)
    }
}

/// Run one segment through the external transcriber
async fn transcribe_segment(
    binary: &Path,
    model_path: &Path,
    segment: &VoiceSegment,
) -> Result<TranscriptFragment> {
    if segment.is_empty() {
        return Err(Error::Inference("empty voice segment".to_string()));
    }

    let wav_bytes = wav::samples_to_wav(&segment.samples(), segment.sample_rate())?;
    let wav_file = tempfile::Builder::new()
        .prefix("kopivoice-seg-")
        .suffix(".wav")
        .tempfile()?;
    std::fs::write(wav_file.path(), &wav_bytes)?;

    let output = Command::new(binary)
        .arg("-m")
        .arg(model_path)
        .arg("-f")
        .arg(wav_file.path())
        .arg("--no-timestamps")
        .arg("--no-prints")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Inference(format!("failed to run transcriber: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Inference(format!(
            "transcriber exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        return Err(Error::Inference("transcriber produced no text".to_string()));
    }

    tracing::debug!(
        chars = text.len(),
        duration_ms = segment.duration().as_millis(),
        "segment transcribed locally"
    );

    Ok(TranscriptFragment::final_(
        text,
        segment.start(),
        segment.end(),
    ))
}
