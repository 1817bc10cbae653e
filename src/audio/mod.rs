//! Audio frames and device I/O

pub mod capture;
pub mod playback;
pub mod wav;

use std::time::Duration;

pub use capture::{AudioCapture, FrameStream};
pub use playback::AudioPlayback;

/// Sample rate for microphone capture (16 kHz for speech)
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate for playback (matches live backend audio output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Samples per capture frame
pub const FRAME_SAMPLES: usize = 1024;

/// One immutable frame of mono 16-bit PCM audio.
///
/// Capture frames are fixed at [`FRAME_SAMPLES`] samples; playback frames
/// carry whatever chunk size the backend produced. Sequence indices are
/// strictly increasing per direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    seq: u64,
}

impl AudioFrame {
    #[must_use]
    pub const fn new(samples: Vec<i16>, sample_rate: u32, seq: u64) -> Self {
        Self {
            samples,
            sample_rate,
            seq,
        }
    }

    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    #[must_use]
    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Duration covered by this frame
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    /// Stream offset of the first sample, derived from the sequence index.
    ///
    /// Only meaningful for fixed-size capture frames.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn start_offset(&self) -> Duration {
        Duration::from_secs_f64(
            self.seq as f64 * FRAME_SAMPLES as f64 / f64::from(self.sample_rate),
        )
    }

    /// Stream offset just past the last sample
    #[must_use]
    pub fn end_offset(&self) -> Duration {
        self.start_offset() + self.duration()
    }

    /// RMS energy of this frame
    #[must_use]
    pub fn energy(&self) -> f32 {
        rms_energy(&self.samples)
    }

    /// Raw little-endian PCM bytes
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }
}

/// RMS energy of samples, normalized to [0, 1]
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / f64::from(i16::MAX);
            v * v
        })
        .sum();
    #[allow(clippy::cast_possible_truncation)]
    let rms = (sum_squares / samples.len() as f64).sqrt() as f32;
    rms
}

/// Interleave raw little-endian PCM bytes into i16 samples
#[must_use]
pub fn samples_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_of_silence_is_zero() {
        let silence = vec![0i16; 1024];
        assert!(rms_energy(&silence) < 0.001);
    }

    #[test]
    fn energy_of_full_scale_is_high() {
        let loud = vec![i16::MAX / 2; 1024];
        assert!(rms_energy(&loud) > 0.4);
    }

    #[test]
    fn frame_offsets_follow_sequence() {
        let frame = AudioFrame::new(vec![0; FRAME_SAMPLES], CAPTURE_SAMPLE_RATE, 0);
        assert_eq!(frame.start_offset(), Duration::ZERO);

        let later = AudioFrame::new(vec![0; FRAME_SAMPLES], CAPTURE_SAMPLE_RATE, 16);
        // 16 frames of 1024 samples at 16 kHz = 1.024 s
        let expected = Duration::from_secs_f64(16.0 * 1024.0 / 16_000.0);
        assert_eq!(later.start_offset(), expected);
        assert_eq!(later.end_offset(), expected + later.duration());
    }

    #[test]
    fn pcm_byte_round_trip() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];
        let frame = AudioFrame::new(samples.clone(), CAPTURE_SAMPLE_RATE, 0);
        assert_eq!(samples_from_le_bytes(&frame.to_le_bytes()), samples);
    }
}
