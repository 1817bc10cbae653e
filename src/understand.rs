//! One-shot audio file operations: transcription and free-form analysis
//!
//! Transcription routes a whole file through the configured backend as a
//! single voice segment. Analysis sends the file inline to the Gemini
//! `generateContent` endpoint with a caller-supplied prompt.

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use secrecy::ExposeSecret;

use crate::audio::wav;
use crate::backend::{Backend, BackendEvent, BackendInput};
use crate::config::{ApiKeys, Config};
use crate::transcript::Finality;
use crate::vad::VoiceSegment;
use crate::{Error, Result};

const GENERATE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const ANALYSIS_MODEL: &str = "gemini-3-flash-preview";

/// Files at or above this size cannot be sent inline
pub const INLINE_SIZE_LIMIT: u64 = 20 * 1024 * 1024;

/// Overall deadline for a one-shot transcription
const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(120);

const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(120);

/// Transcribe a WAV file through the configured backend.
///
/// # Errors
///
/// Returns `Audio` for unreadable or non-WAV input, backend pre-flight
/// errors, or the error that closed the backend
pub async fn transcribe_file(path: &Path, config: &Config) -> Result<String> {
    let (samples, sample_rate) = wav::read_wav_file(path)?;
    if samples.is_empty() {
        return Err(Error::Audio(format!(
            "no audio samples in {}",
            path.display()
        )));
    }

    let segment = VoiceSegment::from_samples(samples, sample_rate);
    tracing::info!(
        path = %path.display(),
        duration_ms = segment.duration().as_millis(),
        "transcribing file"
    );

    let backend = Backend::from_config(config)?;
    let mut handle = backend.start().await?;
    handle.send(BackendInput::Segment(segment)).await?;

    let text = tokio::time::timeout(TRANSCRIBE_TIMEOUT, async {
        let mut collected = String::new();
        while let Some(event) = handle.next_event().await {
            match event {
                BackendEvent::Transcript(fragment) => {
                    if fragment.finality == Finality::Final {
                        if !collected.is_empty() {
                            collected.push(' ');
                        }
                        collected.push_str(fragment.text.trim());
                        break;
                    }
                }
                BackendEvent::Audio(_) => {}
                BackendEvent::Closed(e) => return Err(e),
            }
        }
        Ok(collected)
    })
    .await
    .map_err(|_| Error::Inference("transcription timed out".to_string()))??;

    handle.stop().await;

    if text.is_empty() {
        return Err(Error::Inference(
            "backend produced no transcription".to_string(),
        ));
    }
    Ok(text)
}

/// Analyze an audio file with a free-form prompt via Gemini.
///
/// The file is embedded inline in the request, so it must be under
/// [`INLINE_SIZE_LIMIT`].
///
/// # Errors
///
/// Returns `CredentialMissing` without a Gemini key, `Audio` for
/// unsupported or oversized files, and `Network`/`Inference` for API
/// failures
pub async fn analyze_file(path: &Path, prompt: &str, api_keys: &ApiKeys) -> Result<String> {
    let api_key = secrecy::SecretString::from(api_keys.gemini()?.to_string());

    let mime_type = audio_mime_type(path)?;
    let metadata = std::fs::metadata(path)?;
    if metadata.len() >= INLINE_SIZE_LIMIT {
        return Err(Error::Audio(format!(
            "file is {} bytes; inline analysis is limited to {INLINE_SIZE_LIMIT}",
            metadata.len()
        )));
    }

    let audio_bytes = std::fs::read(path)?;
    tracing::info!(
        path = %path.display(),
        bytes = audio_bytes.len(),
        mime = mime_type,
        "analyzing audio file"
    );

    let body = analysis_request(prompt, mime_type, &audio_bytes);
    let url = format!(
        "{GENERATE_URL}/{ANALYSIS_MODEL}:generateContent?key={}",
        api_key.expose_secret()
    );

    let client = reqwest::Client::builder()
        .timeout(ANALYSIS_TIMEOUT)
        .build()?;
    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| Error::Network(format!("analysis request failed: {e}")))?;

    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::RateLimited("analysis API rate limit".to_string()));
    }
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(Error::Inference(format!(
            "analysis API returned {status}: {}",
            detail.trim()
        )));
    }

    let payload: serde_json::Value = response.json().await?;
    extract_response_text(&payload)
        .ok_or_else(|| Error::Inference("analysis API returned no text".to_string()))
}

/// MIME type by extension for the formats the analysis API accepts
fn audio_mime_type(path: &Path) -> Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "mp3" => Ok("audio/mp3"),
        "wav" => Ok("audio/wav"),
        "aiff" | "aif" => Ok("audio/aiff"),
        "aac" => Ok("audio/aac"),
        "ogg" => Ok("audio/ogg"),
        "flac" => Ok("audio/flac"),
        "m4a" => Ok("audio/m4a"),
        "opus" => Ok("audio/opus"),
        "webm" | "weba" => Ok("audio/webm"),
        other => Err(Error::Audio(format!(
            "unsupported audio format: {other:?}"
        ))),
    }
}

fn analysis_request(prompt: &str, mime_type: &str, audio: &[u8]) -> serde_json::Value {
    let encoded = base64::engine::general_purpose::STANDARD.encode(audio);
    serde_json::json!({
        "contents": [{
            "parts": [
                { "text": prompt },
                { "inline_data": { "mime_type": mime_type, "data": encoded } },
            ]
        }]
    })
}

/// Concatenate text parts of the first candidate
fn extract_response_text(payload: &serde_json::Value) -> Option<String> {
    let parts = payload
        .pointer("/candidates/0/content/parts")?
        .as_array()?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(serde_json::Value::as_str))
        .collect::<Vec<_>>()
        .join("");

    let text = text.trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_detection_by_extension() {
        assert_eq!(audio_mime_type(Path::new("a.mp3")).unwrap(), "audio/mp3");
        assert_eq!(audio_mime_type(Path::new("b.WAV")).unwrap(), "audio/wav");
        assert_eq!(audio_mime_type(Path::new("c.flac")).unwrap(), "audio/flac");
        assert!(audio_mime_type(Path::new("d.txt")).is_err());
        assert!(audio_mime_type(Path::new("noext")).is_err());
    }

    #[test]
    fn request_embeds_prompt_and_audio() {
        let body = analysis_request("Summarize this", "audio/wav", &[1, 2, 3]);

        assert_eq!(
            body.pointer("/contents/0/parts/0/text")
                .and_then(serde_json::Value::as_str),
            Some("Summarize this")
        );
        let encoded = body
            .pointer("/contents/0/parts/1/inline_data/data")
            .and_then(serde_json::Value::as_str)
            .unwrap();
        assert_eq!(
            base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .unwrap(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn response_text_is_joined_from_parts() {
        let payload = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "A podcast " },
                        { "text": "about birds." },
                    ]
                }
            }]
        });
        assert_eq!(
            extract_response_text(&payload).unwrap(),
            "A podcast about birds."
        );
    }

    #[test]
    fn empty_response_yields_none() {
        let payload = serde_json::json!({ "candidates": [] });
        assert!(extract_response_text(&payload).is_none());
    }

    #[tokio::test]
    async fn analysis_without_key_fails_fast() {
        let err = analyze_file(Path::new("/tmp/x.wav"), "describe", &ApiKeys::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CredentialMissing(_)));
    }
}
