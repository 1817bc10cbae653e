//! WAV encoding/decoding and the standalone recording utility

use std::path::Path;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait};

use super::{AudioCapture, CAPTURE_SAMPLE_RATE};
use crate::{Error, Result};

/// Encode mono i16 samples as WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Read a WAV file into mono i16 samples, averaging stereo channels
///
/// # Errors
///
/// Returns error if the file cannot be read or uses an unsupported format
pub fn read_wav_file(path: &Path) -> Result<(Vec<i16>, u32)> {
    let mut reader =
        hound::WavReader::open(path).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();

    let samples: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| {
                s.map(|v| {
                    #[allow(clippy::cast_possible_truncation)]
                    let i = (v * 32767.0).clamp(-32768.0, 32767.0) as i16;
                    i
                })
            })
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
    };

    let mono = match spec.channels {
        1 => samples,
        2 => samples
            .chunks_exact(2)
            .map(|c| i16::try_from((i32::from(c[0]) + i32::from(c[1])) / 2).unwrap_or(0))
            .collect(),
        n => {
            return Err(Error::Audio(format!("unsupported channel count: {n}")));
        }
    };

    Ok((mono, spec.sample_rate))
}

/// Record from the default microphone for `duration` and write a WAV file
///
/// # Errors
///
/// Returns error if no device is available or the file cannot be written
#[allow(clippy::future_not_send)]
pub async fn record_to_file(path: &Path, duration: Duration) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut capture = AudioCapture::open()?;
    let mut frames = capture.start()?;

    tracing::info!(secs = duration.as_secs_f32(), "recording");

    let mut samples: Vec<i16> = Vec::new();
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let target = (duration.as_secs_f64() * f64::from(CAPTURE_SAMPLE_RATE)) as usize;
    let mut last_logged = 0usize;

    while samples.len() < target {
        match frames.recv().await {
            Some(Ok(frame)) => {
                samples.extend_from_slice(frame.samples());
                // Progress roughly once per second
                if samples.len() / CAPTURE_SAMPLE_RATE as usize
                    > last_logged / CAPTURE_SAMPLE_RATE as usize
                {
                    last_logged = samples.len();
                    tracing::info!(
                        secs = samples.len() / CAPTURE_SAMPLE_RATE as usize,
                        "recording progress"
                    );
                }
            }
            Some(Err(e)) => {
                capture.stop();
                return Err(e);
            }
            None => {
                capture.stop();
                return Err(Error::StreamInterrupted(
                    "capture channel closed".to_string(),
                ));
            }
        }
    }

    capture.stop();
    samples.truncate(target);

    let wav = samples_to_wav(&samples, CAPTURE_SAMPLE_RATE)?;
    std::fs::write(path, &wav)?;

    tracing::info!(
        path = %path.display(),
        bytes = wav.len(),
        "recording saved (WAV 16 kHz mono 16-bit)"
    );
    Ok(())
}

/// List available audio input devices, default first
///
/// # Errors
///
/// Returns error if the host cannot enumerate devices
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|d| d.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    let mut names = Vec::new();
    for device in devices {
        let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
        let marker = if Some(&name) == default_name.as_ref() {
            " (default)"
        } else {
            ""
        };
        names.push(format!("{name}{marker}"));
    }

    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_round_trip() {
        let samples: Vec<i16> = (0..2048).map(|i| (i % 256 - 128) * 100).collect();
        let wav = samples_to_wav(&samples, CAPTURE_SAMPLE_RATE).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.wav");
        std::fs::write(&path, &wav).unwrap();

        let (decoded, rate) = read_wav_file(&path).unwrap();
        assert_eq!(rate, CAPTURE_SAMPLE_RATE);
        assert_eq!(decoded, samples);
    }

    #[test]
    fn stereo_wav_is_downmixed() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: CAPTURE_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..100 {
            writer.write_sample(1000i16).unwrap();
            writer.write_sample(2000i16).unwrap();
        }
        writer.finalize().unwrap();

        let (decoded, _) = read_wav_file(&path).unwrap();
        assert_eq!(decoded.len(), 100);
        assert!(decoded.iter().all(|&s| s == 1500));
    }
}
