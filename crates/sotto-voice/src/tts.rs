//! Speech synthesis and playback.
//!
//! [`TtsBackend`] turns text into audio bytes (WAV/MP3); [`PlaybackBackend`]
//! plays bytes and blocks until audible output completes. The rodio handles
//! are not `Send`, so [`RodioPlayback`] parks them on a dedicated thread and
//! talks to it over a channel; `play_blocking` waits for the thread's ack.

use crate::error::{VoiceError, VoiceResult};
use rodio::{OutputStream, Sink, Source};
use std::io::Cursor;
use std::sync::mpsc;
use std::thread;
use tracing::{debug, info};

/// Backend that turns text into audio bytes. Returning an empty vec skips
/// playback for the turn.
pub trait TtsBackend: Send + Sync {
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>>;
}

/// Placeholder TTS: returns empty audio so nothing plays.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

impl TtsBackend for PlaceholderTts {
    fn synthesize(&self, _text: &str) -> VoiceResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Remote TTS backend: OpenAI-compatible `/audio/speech` endpoint.
/// Uses `TTS_API_URL` (default https://api.openai.com/v1), `TTS_API_KEY`,
/// `TTS_MODEL` (default tts-1), and `TTS_VOICE` (default alloy).
#[derive(Debug, Clone)]
pub struct RemoteTts {
    /// Base URL without trailing slash.
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// TTS model name.
    pub model: String,
    /// Voice id (alloy, echo, fable, onyx, nova, shimmer, ...).
    pub voice: String,
    client: reqwest::blocking::Client,
}

impl RemoteTts {
    /// Build from environment: TTS_API_URL, TTS_API_KEY, TTS_MODEL, TTS_VOICE.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("TTS_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .map_err(|_| VoiceError::Config("remote TTS requires TTS_API_KEY".to_string()))?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let voice = std::env::var("TTS_VOICE").unwrap_or_else(|_| "alloy".to_string());
        Self::new(base_url, api_key, model, voice)
    }

    /// Create with explicit config.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: voice.into(),
            client,
        })
    }
}

impl TtsBackend for RemoteTts {
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {status}: {body}")));
        }
        let bytes = res.bytes().map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Plays synthesized audio, blocking until audible output completes. The
/// orchestrator pauses the frame bus around this call.
pub trait PlaybackBackend: Send + Sync {
    /// Decode and play `bytes`, returning once playback has finished.
    /// An empty slice is a no-op.
    fn play_blocking(&self, bytes: &[u8]) -> VoiceResult<()>;
}

enum PlaybackCommand {
    Play {
        bytes: Vec<u8>,
        done: mpsc::Sender<VoiceResult<()>>,
    },
}

/// Rodio-backed playback on a dedicated thread.
pub struct RodioPlayback {
    tx: mpsc::Sender<PlaybackCommand>,
}

impl RodioPlayback {
    /// Spawn the playback thread and open the default output device.
    /// A missing output device is fatal here, before the turn loop starts.
    pub fn new() -> VoiceResult<Self> {
        let (tx, rx) = mpsc::channel::<PlaybackCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<VoiceResult<()>>();

        thread::Builder::new()
            .name("sotto-playback".to_string())
            .spawn(move || {
                // OutputStream/Sink are not Send; they live and die here.
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };
                let _stream = stream;
                let _ = ready_tx.send(Ok(()));
                info!("playback thread ready");

                while let Ok(PlaybackCommand::Play { bytes, done }) = rx.recv() {
                    let result = play_on_sink(&sink, bytes);
                    let _ = done.send(result);
                }
                debug!("playback thread exiting");
            })
            .map_err(|e| VoiceError::Playback(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("playback thread died during init".to_string()))??;
        Ok(Self { tx })
    }
}

fn play_on_sink(sink: &Sink, bytes: Vec<u8>) -> VoiceResult<()> {
    let source = rodio::Decoder::new(Cursor::new(bytes))
        .map_err(|e| VoiceError::Playback(format!("decode failed: {e}")))?;
    sink.append(source.convert_samples::<f32>());
    sink.sleep_until_end();
    Ok(())
}

impl PlaybackBackend for RodioPlayback {
    fn play_blocking(&self, bytes: &[u8]) -> VoiceResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let (done_tx, done_rx) = mpsc::channel();
        self.tx
            .send(PlaybackCommand::Play {
                bytes: bytes.to_vec(),
                done: done_tx,
            })
            .map_err(|_| VoiceError::Playback("playback thread gone".to_string()))?;
        done_rx
            .recv()
            .map_err(|_| VoiceError::Playback("playback thread gone".to_string()))?
    }
}
