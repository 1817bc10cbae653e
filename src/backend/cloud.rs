//! Cloud transcription via the Groq Whisper endpoint
//!
//! One multipart request per voice segment. Rate limiting is retried
//! with exponential backoff inside the adapter; transport failures close
//! the handle so the session layer can reconnect.

use std::time::Duration;

use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{BackendEvent, BackendHandle, BackendInput};
use crate::audio::wav;
use crate::config::ApiKeys;
use crate::transcript::TranscriptFragment;
use crate::vad::VoiceSegment;
use crate::{Error, Result};

const TRANSCRIBE_URL: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const TRANSCRIBE_MODEL: &str = "whisper-large-v3-turbo";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Rate-limit retries before surfacing the error: waits of 1 s, 2 s, 4 s
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

pub struct CloudSttAdapter {
    client: reqwest::Client,
    api_key: secrecy::SecretString,
}

impl CloudSttAdapter {
    /// # Errors
    ///
    /// Returns `CredentialMissing` if no Groq API key is configured
    pub fn new(api_keys: &ApiKeys) -> Result<Self> {
        let api_key = secrecy::SecretString::from(api_keys.groq()?.to_string());

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { client, api_key })
    }

    /// Spawn the segment worker
    pub(crate) fn start(&self) -> BackendHandle {
        let cancel = CancellationToken::new();
        let (handle, mut input_rx, event_tx) = BackendHandle::channel(cancel.clone());

        let client = self.client.clone();
        let api_key = self.api_key.clone();

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
                        tracing::trace!("cloud backend ignores frame input");
                        continue;
                    }
                };

                match transcribe_segment(&client, &api_key, &segment).await {
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
                        tracing::warn!(error = %e, "segment rejected by transcription API");
                    }
                    Err(e) => {
                        let _ = event_tx.send(BackendEvent::Closed(e)).await;
                        break;
                    }
                }
            }
            tracing::debug!("cloud backend worker stopped");
        });

        handle
    }
}

/// Transcribe one segment, retrying rate limits with backoff
async fn transcribe_segment(
    client: &reqwest::Client,
    api_key: &secrecy::SecretString,
    segment: &VoiceSegment,
) -> Result<TranscriptFragment> {
    if segment.is_empty() {
        return Err(Error::Inference("empty voice segment".to_string()));
    }

    let wav_bytes = wav::samples_to_wav(&segment.samples(), segment.sample_rate())?;

    for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav_bytes.clone())
                    .file_name("segment.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Inference(e.to_string()))?,
            )
            .text("model", TRANSCRIBE_MODEL)
            .text("response_format", "json")
            .text("temperature", "0");

        let response = client
            .post(TRANSCRIBE_URL)
            .bearer_auth(api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Network(format!("transcription request failed: {e}")))?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            if attempt < MAX_RATE_LIMIT_RETRIES {
                let wait = rate_limit_backoff(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    wait_secs = wait.as_secs(),
                    "rate limited, backing off"
                );
                tokio::time::sleep(wait).await;
                continue;
            }
            return Err(Error::RateLimited(format!(
                "transcription API rate limit persisted after {MAX_RATE_LIMIT_RETRIES} retries"
            )));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_failure(status, &body));
        }

        let parsed: TranscriptionResponse = response.json().await?;
        let text = parsed.text.trim().to_string();
        if text.is_empty() {
            return Err(Error::Inference("transcription API returned no text".to_string()));
        }

        tracing::debug!(
            chars = text.len(),
            duration_ms = segment.duration().as_millis(),
            "segment transcribed via cloud"
        );

        return Ok(TranscriptFragment::final_(
            text,
            segment.start(),
            segment.end(),
        ));
    }

    unreachable!("retry loop returns on every path")
}

const fn rate_limit_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt)
}

/// Server-side failures are retryable at the session layer; other client
/// errors only poison the one segment
fn classify_http_failure(status: reqwest::StatusCode, body: &str) -> Error {
    let detail = format!("transcription API returned {status}: {}", body.trim());
    if status.is_server_error() {
        Error::Network(detail)
    } else {
        Error::Inference(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(rate_limit_backoff(0), Duration::from_secs(1));
        assert_eq!(rate_limit_backoff(1), Duration::from_secs(2));
        assert_eq!(rate_limit_backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = classify_http_failure(reqwest::StatusCode::BAD_GATEWAY, "upstream down");
        assert!(matches!(err, Error::Network(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn client_errors_poison_only_the_segment() {
        let err = classify_http_failure(reqwest::StatusCode::BAD_REQUEST, "file too short");
        assert!(matches!(err, Error::Inference(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn response_payload_parses() {
        let parsed: TranscriptionResponse =
            serde_json::from_str(r#"{"text": "hello there", "x_groq": {"id": "req_1"}}"#)
                .unwrap();
        assert_eq!(parsed.text, "hello there");
    }
}
