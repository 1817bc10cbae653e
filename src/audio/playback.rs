//! Audio playback to speakers

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};

use super::{AudioFrame, PLAYBACK_SAMPLE_RATE};
use crate::{Error, Result};

/// Maximum buffered playback samples (10 s at 24 kHz); overflow drops the
/// oldest audio to bound latency growth
const MAX_QUEUE_SAMPLES: usize = PLAYBACK_SAMPLE_RATE as usize * 10;

/// Plays backend audio frames through the default output device.
///
/// [`AudioPlayback::enqueue`] is non-blocking; the hardware callback pops
/// from a shared bounded queue and writes silence when it runs dry.
pub struct AudioPlayback {
    #[allow(dead_code)]
    device: Device,
    config: StreamConfig,
    queue: Arc<Mutex<VecDeque<i16>>>,
    dropped: Arc<AtomicU64>,
    stream: Option<Stream>,
}

impl AudioPlayback {
    /// Acquire the default output device at 24 kHz
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if no compatible device or config exists
    pub fn open() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::DeviceUnavailable("no output device".to_string()))?;

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
            .or_else(|| {
                // Fallback: stereo, with the mono signal duplicated per channel
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                        && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
                })
            })
            .ok_or_else(|| {
                Error::DeviceUnavailable("no 24 kHz output config found".to_string())
            })?;

        let config = supported_config
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self {
            device,
            config,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            dropped: Arc::new(AtomicU64::new(0)),
            stream: None,
        })
    }

    /// Start the output stream
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the stream cannot be built
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let queue = Arc::clone(&self.queue);
        let channels = self.config.channels as usize;

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut popped = queue.lock().ok();
                    for frame in data.chunks_mut(channels) {
                        let sample = popped
                            .as_mut()
                            .and_then(|q| q.pop_front())
                            .map_or(0.0, |s| f32::from(s) / 32768.0);
                        for out in frame.iter_mut() {
                            *out = sample;
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback stream error");
                },
                None,
            )
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio playback started");
        Ok(())
    }

    /// Queue a frame for playback, dropping the oldest audio on overflow
    pub fn enqueue(&self, frame: &AudioFrame) {
        if let Ok(mut queue) = self.queue.lock() {
            let incoming = frame.samples().len();
            let excess = (queue.len() + incoming).saturating_sub(MAX_QUEUE_SAMPLES);
            if excess > 0 {
                let drain_count = excess.min(queue.len());
                queue.drain(..drain_count);
                self.dropped.fetch_add(excess as u64, Ordering::Relaxed);
            }
            queue.extend(frame.samples().iter().copied());
        }
    }

    /// Samples currently queued
    #[must_use]
    pub fn queued_samples(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Wait for the queue to empty, up to `timeout`
    pub async fn drain(&self, timeout: Duration) {
        let start = tokio::time::Instant::now();
        while self.queued_samples() > 0 {
            if start.elapsed() > timeout {
                tracing::warn!(
                    remaining = self.queued_samples(),
                    "playback drain timed out"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop playback and release the device
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);

            let dropped = self.dropped.load(Ordering::Relaxed);
            if dropped > 0 {
                tracing::warn!(dropped, "playback samples dropped on queue overflow");
            }
            tracing::debug!("audio playback stopped");
        }
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}
