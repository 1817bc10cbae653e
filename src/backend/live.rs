//! Full-duplex streaming over the Gemini Live WebSocket API
//!
//! Protocol: open the socket, send a `setup` frame, wait for
//! `setupComplete`, then stream base64 PCM as `realtimeInput` while the
//! server pushes transcription and audio back. The server wraps all of
//! its messages (including JSON control frames) in Binary frames, so
//! inbound handling sniffs for a leading `{` before parsing.

use std::time::{Duration, Instant};

use base64::Engine;
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::{BackendEvent, BackendHandle, BackendInput};
use crate::audio::{self, AudioFrame, PLAYBACK_SAMPLE_RATE};
use crate::config::ApiKeys;
use crate::transcript::TranscriptFragment;
use crate::{Error, Result};

const LIVE_WS_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const LIVE_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-12-2025";
const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";
const SYSTEM_INSTRUCTION: &str = "You are a silent assistant. Just listen quietly.";
const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

pub struct LiveAdapter {
    api_key: secrecy::SecretString,
}

impl LiveAdapter {
    /// # Errors
    ///
    /// Returns `CredentialMissing` if no Gemini API key is configured
    pub fn new(api_keys: &ApiKeys) -> Result<Self> {
        let api_key = secrecy::SecretString::from(api_keys.gemini()?.to_string());
        Ok(Self { api_key })
    }

    /// Connect, complete setup, and spawn the send/receive loops
    ///
    /// # Errors
    ///
    /// Returns `ConnectionDropped` if the socket cannot be opened or
    /// setup does not complete within [`SETUP_TIMEOUT`]
    pub(crate) async fn start(&self) -> Result<BackendHandle> {
        let url = format!("{LIVE_WS_URL}?key={}", self.api_key.expose_secret());

        let (mut ws, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| Error::ConnectionDropped(format!("websocket connect failed: {e}")))?;

        let setup_json = serde_json::to_string(&setup_message())?;
        ws.send(WsMessage::Text(setup_json.into()))
            .await
            .map_err(|e| Error::ConnectionDropped(format!("setup send failed: {e}")))?;

        wait_for_setup_complete(&mut ws).await?;
        tracing::info!(model = LIVE_MODEL, "live session established");

        let cancel = CancellationToken::new();
        let (handle, input_rx, event_tx) = BackendHandle::channel(cancel.clone());

        let (ws_sink, ws_stream) = ws.split();
        tokio::spawn(outbound_loop(input_rx, ws_sink, cancel.clone()));
        tokio::spawn(inbound_loop(ws_stream, event_tx, cancel));

        Ok(handle)
    }
}

type WsSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn wait_for_setup_complete(ws: &mut WsSocket) -> Result<()> {
    let wait = async {
        while let Some(msg) = ws.next().await {
            let msg =
                msg.map_err(|e| Error::ConnectionDropped(format!("websocket error: {e}")))?;
            match msg {
                WsMessage::Binary(data) if data.first() == Some(&b'{') => {
                    if let Ok(text) = std::str::from_utf8(&data) {
                        if server_events(text)
                            .iter()
                            .any(|e| matches!(e, ServerEvent::SetupComplete))
                        {
                            return Ok(());
                        }
                    }
                }
                WsMessage::Text(text)
                    if server_events(&text)
                        .iter()
                        .any(|e| matches!(e, ServerEvent::SetupComplete)) =>
                {
                    return Ok(());
                }
                WsMessage::Close(frame) => {
                    return Err(Error::ConnectionDropped(format!(
                        "closed before setup completed: {frame:?}"
                    )));
                }
                _ => {}
            }
        }
        Err(Error::ConnectionDropped(
            "stream ended before setup completed".to_string(),
        ))
    };

    tokio::time::timeout(SETUP_TIMEOUT, wait)
        .await
        .map_err(|_| Error::ConnectionDropped("setup timed out".to_string()))?
}

/// Forward captured audio to the socket until cancelled
async fn outbound_loop(
    mut input_rx: tokio::sync::mpsc::Receiver<BackendInput>,
    mut ws_sink: futures::stream::SplitSink<WsSocket, WsMessage>,
    cancel: CancellationToken,
) {
    loop {
        let input = tokio::select! {
            () = cancel.cancelled() => {
                let _ = ws_sink.send(WsMessage::Close(None)).await;
                break;
            }
            input = input_rx.recv() => match input {
                Some(input) => input,
                None => {
                    let _ = ws_sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
        };

        let pcm = match input {
            BackendInput::Frame(frame) => frame.to_le_bytes(),
            BackendInput::Segment(segment) => {
                audio::AudioFrame::new(segment.samples(), segment.sample_rate(), 0).to_le_bytes()
            }
        };

        let message = audio_message(&pcm);
        let Ok(json) = serde_json::to_string(&message) else {
            continue;
        };
        if ws_sink.send(WsMessage::Text(json.into())).await.is_err() {
            tracing::warn!("websocket send failed, stopping outbound loop");
            cancel.cancel();
            break;
        }
    }
    tracing::debug!("live outbound loop stopped");
}

/// Dispatch server frames as backend events until the socket closes
async fn inbound_loop(
    mut ws_stream: futures::stream::SplitStream<WsSocket>,
    event_tx: tokio::sync::mpsc::Sender<BackendEvent>,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    // Transcription chunks accumulate across a turn; turnComplete
    // promotes the accumulated text to a final fragment
    let mut turn_text = String::new();
    let mut turn_start: Option<Duration> = None;
    let mut out_seq: u64 = 0;

    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = ws_stream.next() => msg,
        };

        let Some(msg) = msg else {
            let _ = event_tx
                .send(BackendEvent::Closed(Error::ConnectionDropped(
                    "server closed the stream".to_string(),
                )))
                .await;
            break;
        };

        let text = match msg {
            Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                match std::str::from_utf8(&data) {
                    Ok(text) => text.to_owned(),
                    Err(_) => continue,
                }
            }
            Ok(WsMessage::Text(text)) => text.to_string(),
            Ok(WsMessage::Close(frame)) => {
                let _ = event_tx
                    .send(BackendEvent::Closed(Error::ConnectionDropped(format!(
                        "server closed the connection: {frame:?}"
                    ))))
                    .await;
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                let _ = event_tx
                    .send(BackendEvent::Closed(Error::ConnectionDropped(format!(
                        "websocket error: {e}"
                    ))))
                    .await;
                break;
            }
        };

        for event in server_events(&text) {
            let forwarded = match event {
                ServerEvent::SetupComplete => None,
                ServerEvent::InputTranscript(chunk) => {
                    if turn_start.is_none() {
                        turn_start = Some(started.elapsed());
                    }
                    turn_text.push_str(&chunk);
                    Some(BackendEvent::Transcript(TranscriptFragment::partial(
                        turn_text.clone(),
                        turn_start.unwrap_or_default(),
                        started.elapsed(),
                    )))
                }
                ServerEvent::TurnComplete => {
                    let start = turn_start.take().unwrap_or_else(|| started.elapsed());
                    let text = std::mem::take(&mut turn_text);
                    if text.trim().is_empty() {
                        None
                    } else {
                        Some(BackendEvent::Transcript(TranscriptFragment::final_(
                            text,
                            start,
                            started.elapsed(),
                        )))
                    }
                }
                ServerEvent::Audio(pcm) => {
                    let samples = audio::samples_from_le_bytes(&pcm);
                    let frame = AudioFrame::new(samples, PLAYBACK_SAMPLE_RATE, out_seq);
                    out_seq += 1;
                    Some(BackendEvent::Audio(frame))
                }
                ServerEvent::Interrupted => {
                    tracing::debug!("server reported playback interruption");
                    None
                }
                ServerEvent::Error(message) => {
                    let _ = event_tx
                        .send(BackendEvent::Closed(Error::ConnectionDropped(message)))
                        .await;
                    return;
                }
            };

            if let Some(event) = forwarded {
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
    tracing::debug!("live inbound loop stopped");
}

/// Parsed server-side protocol events
#[derive(Debug)]
enum ServerEvent {
    SetupComplete,
    /// Incremental user-speech transcription chunk
    InputTranscript(String),
    TurnComplete,
    /// Raw 24 kHz PCM response audio
    Audio(Vec<u8>),
    Interrupted,
    Error(String),
}

fn setup_message() -> serde_json::Value {
    serde_json::json!({
        "setup": {
            "model": LIVE_MODEL,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
            },
            "inputAudioTranscription": {},
            "systemInstruction": {
                "parts": [{ "text": SYSTEM_INSTRUCTION }]
            },
        }
    })
}

fn audio_message(pcm: &[u8]) -> serde_json::Value {
    let encoded = base64::engine::general_purpose::STANDARD.encode(pcm);
    serde_json::json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": INPUT_AUDIO_MIME,
                "data": encoded,
            }]
        }
    })
}

/// One server frame can carry several events (audio plus transcription)
fn server_events(json_text: &str) -> Vec<ServerEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            events.push(ServerEvent::Error(format!("unparseable server frame: {e}")));
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = value.get("serverContent") {
        if content.get("interrupted").and_then(serde_json::Value::as_bool) == Some(true) {
            events.push(ServerEvent::Interrupted);
        }

        // Transcription of user speech arrives nested under serverContent
        if let Some(text) = content
            .pointer("/inputTranscription/text")
            .and_then(serde_json::Value::as_str)
        {
            if !text.is_empty() {
                events.push(ServerEvent::InputTranscript(text.to_string()));
            }
        }

        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(serde_json::Value::as_array)
        {
            for part in parts {
                if let Some(data) = part
                    .pointer("/inlineData/data")
                    .and_then(serde_json::Value::as_str)
                {
                    if let Ok(pcm) = base64::engine::general_purpose::STANDARD.decode(data) {
                        events.push(ServerEvent::Audio(pcm));
                    }
                }
            }
        }

        if content.get("turnComplete").and_then(serde_json::Value::as_bool) == Some(true) {
            events.push(ServerEvent::TurnComplete);
        }
    }

    // Some server builds emit inputTranscription at the top level
    if let Some(text) = value
        .pointer("/inputTranscription/text")
        .and_then(serde_json::Value::as_str)
    {
        if !text.is_empty() {
            events.push(ServerEvent::InputTranscript(text.to_string()));
        }
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown server error");
        events.push(ServerEvent::Error(message.to_string()));
    }

    events
}
