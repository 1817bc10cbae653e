//! Audio capture from microphone

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::{AudioFrame, CAPTURE_SAMPLE_RATE, FRAME_SAMPLES};
use crate::{Error, Result};

/// Channel capacity for captured frames (~4 s of audio at 1024-sample frames)
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Captured frames plus the out-of-band stream error slot.
///
/// Frames and hardware errors travel on separate channels so a backlog of
/// undelivered frames can never mask a stream failure. [`FrameStream::recv`]
/// folds both back into one ordered view: queued frames first, then the
/// error.
pub struct FrameStream {
    frames: mpsc::Receiver<AudioFrame>,
    errors: mpsc::Receiver<Error>,
}

impl FrameStream {
    pub(crate) fn from_parts(
        frames: mpsc::Receiver<AudioFrame>,
        errors: mpsc::Receiver<Error>,
    ) -> Self {
        Self { frames, errors }
    }

    /// Next frame, or the stream error once queued frames are drained.
    ///
    /// Returns `None` when capture has stopped cleanly.
    pub async fn recv(&mut self) -> Option<Result<AudioFrame>> {
        tokio::select! {
            biased;
            Some(frame) = self.frames.recv() => Some(Ok(frame)),
            Some(err) = self.errors.recv() => Some(Err(err)),
            else => None,
        }
    }
}

/// Captures fixed-size PCM frames from the default input device.
///
/// Frames arrive on the [`FrameStream`] returned by [`AudioCapture::start`];
/// a hardware stream failure surfaces there as [`Error::StreamInterrupted`]
/// so the consumer can distinguish it from a graceful close.
pub struct AudioCapture {
    #[allow(dead_code)]
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
    dropped: Arc<AtomicU64>,
}

impl AudioCapture {
    /// Acquire the default input device at 16 kHz mono
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if no compatible device or config exists
    pub fn open() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("no input device".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(CAPTURE_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(CAPTURE_SAMPLE_RATE)
            })
            .ok_or_else(|| {
                Error::DeviceUnavailable("no mono 16 kHz input config found".to_string())
            })?;

        let config = supported_config
            .with_sample_rate(SampleRate(CAPTURE_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = CAPTURE_SAMPLE_RATE,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            stream: None,
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Start capturing and return the frame stream.
    ///
    /// The hardware callback never blocks: when the frame channel is full
    /// the frame is dropped and counted. Stream errors use their own
    /// single-slot channel, so they are delivered even when the frame
    /// channel is saturated.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the stream cannot be built
    pub fn start(&mut self) -> Result<FrameStream> {
        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(FRAME_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel::<Error>(1);

        let dropped = Arc::clone(&self.dropped);
        let mut pending: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES);
        let mut seq: u64 = 0;

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for &sample in data {
                        #[allow(clippy::cast_possible_truncation)]
                        let sample_i16 =
                            (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
                        pending.push(sample_i16);

                        if pending.len() == FRAME_SAMPLES {
                            let samples = std::mem::replace(
                                &mut pending,
                                Vec::with_capacity(FRAME_SAMPLES),
                            );
                            let frame =
                                AudioFrame::new(samples, CAPTURE_SAMPLE_RATE, seq);
                            seq += 1;

                            if frame_tx.try_send(frame).is_err() {
                                dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio capture stream error");
                    // Single-slot channel: the first error wins, repeats drop
                    let _ = error_tx.try_send(Error::StreamInterrupted(err.to_string()));
                },
                None,
            )
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(FrameStream::from_parts(frame_rx, error_rx))
    }

    /// Stop capturing and release the device
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);

            let dropped = self.dropped.load(Ordering::Relaxed);
            if dropped > 0 {
                tracing::warn!(dropped, "capture frames dropped on channel overflow");
            }
            tracing::debug!("audio capture stopped");
        }
    }

    /// Frames dropped because the consumer fell behind
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
