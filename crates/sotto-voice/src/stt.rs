//! Speech-to-text: convert a finished [`Utterance`] into a transcript.
//!
//! Implement [`SttBackend`] for local Whisper or a remote OpenAI-compatible
//! transcription API. Use [`transcribe_utterance`] with any backend: it trims
//! the result and filters the fixed hallucination-phrase list down to an
//! empty transcript, which the orchestrator treats as "no speech".

use crate::error::{VoiceError, VoiceResult};
use crate::segmentation::Utterance;
use std::io::Write;

/// Phrases a silence-fed transcription engine commonly invents. A transcript
/// that is exactly one of these is treated as empty.
const HALLUCINATIONS: [&str; 5] = ["You", "Thank you.", "Thank you", "MBC", "You."];

/// Backend for converting utterance PCM to text.
pub trait SttBackend: Send + Sync {
    /// Transcribe one utterance. PCM is mono f32 at `utterance.sample_rate`;
    /// an empty string is a valid "no speech" result.
    fn transcribe(&self, utterance: &Utterance) -> VoiceResult<String>;
}

/// Transcribe with the given backend, trimming and hallucination-filtering.
pub fn transcribe_utterance(backend: &dyn SttBackend, utterance: &Utterance) -> VoiceResult<String> {
    let text = backend.transcribe(utterance)?;
    let text = text.trim();
    if HALLUCINATIONS.contains(&text) {
        return Ok(String::new());
    }
    Ok(text.to_string())
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes for API upload. This is the
/// only audio artifact the pipeline produces, and it lives in memory.
fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = samples.len() * 2; // 16-bit samples
    let header_len = 44u32;
    let file_len = header_len + data_len as u32;

    let mut buf = Vec::with_capacity(44 + data_len);
    // RIFF header
    buf.write_all(b"RIFF").unwrap();
    buf.write_all(&(file_len - 8).to_le_bytes()).unwrap();
    buf.write_all(b"WAVE").unwrap();
    // fmt subchunk
    buf.write_all(b"fmt ").unwrap();
    buf.write_all(&16u32.to_le_bytes()).unwrap();
    buf.write_all(&1u16.to_le_bytes()).unwrap(); // PCM
    buf.write_all(&1u16.to_le_bytes()).unwrap(); // mono
    buf.write_all(&sample_rate.to_le_bytes()).unwrap();
    buf.write_all(&(sample_rate * 2).to_le_bytes()).unwrap(); // byte rate
    buf.write_all(&2u16.to_le_bytes()).unwrap(); // block align
    buf.write_all(&16u16.to_le_bytes()).unwrap(); // bits per sample
    // data subchunk
    buf.write_all(b"data").unwrap();
    buf.write_all(&(data_len as u32).to_le_bytes()).unwrap();
    for &s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        let i = (clamped * 32767.0).round() as i16;
        buf.write_all(&i.to_le_bytes()).unwrap();
    }
    buf
}

/// Placeholder STT: returns a fixed string. Lets the turn loop run without a
/// model or API key.
#[derive(Debug, Default)]
pub struct PlaceholderStt {
    /// If set, returned instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

impl SttBackend for PlaceholderStt {
    fn transcribe(&self, utterance: &Utterance) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        Ok(format!(
            "[transcription placeholder: {} samples, {:.1}s]",
            utterance.samples.len(),
            utterance.duration.as_secs_f32()
        ))
    }
}

/// Remote STT backend: OpenAI-compatible transcription API.
/// Uses `STT_API_URL` (default https://api.openai.com/v1), `STT_API_KEY`,
/// and `STT_MODEL` (default whisper-1).
#[derive(Debug, Clone)]
pub struct RemoteStt {
    /// Base URL without trailing slash.
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Transcription model name.
    pub model: String,
    client: reqwest::blocking::Client,
}

impl RemoteStt {
    /// Build from environment: STT_API_URL, STT_API_KEY, STT_MODEL.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("STT_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("STT_API_KEY")
            .map_err(|_| VoiceError::Config("remote STT requires STT_API_KEY".to_string()))?;
        let model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        Self::new(base_url, api_key, model)
    }

    /// Create with explicit config.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }
}

impl SttBackend for RemoteStt {
    fn transcribe(&self, utterance: &Utterance) -> VoiceResult<String> {
        if utterance.samples.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_f32_to_wav(&utterance.samples, utterance.sample_rate);
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {status}: {body}")));
        }
        let json: serde_json::Value = res.json().map_err(|e| VoiceError::Stt(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        Ok(text)
    }
}

// -----------------------------------------------------------------------------
// Local Whisper STT (optional feature). Requires a ggml model on disk.
// -----------------------------------------------------------------------------
#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use std::sync::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Local Whisper STT: loads a ggml quantized model and runs inference
    /// on-device. Utterances must be 16 kHz mono f32 (the pipeline default).
    pub struct WhisperStt {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Mutex<whisper_rs::WhisperState>,
    }

    impl WhisperStt {
        /// Load the model from `model_path` (e.g. ggml-base.en.bin). A
        /// missing or unloadable model is fatal here, before the turn loop
        /// starts.
        pub fn new(model_path: &str) -> VoiceResult<Self> {
            let params = WhisperContextParameters::default();
            let context = WhisperContext::new_with_params(model_path, params)
                .map_err(|e| VoiceError::Stt(format!("whisper load failed: {e}")))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Stt(format!("whisper state init failed: {e}")))?;
            Ok(Self {
                context,
                state: Mutex::new(state),
            })
        }

        /// Build from env: `WHISPER_MODEL_PATH` must point to a .bin model.
        pub fn from_env() -> VoiceResult<Self> {
            let path = std::env::var("WHISPER_MODEL_PATH")
                .map_err(|_| VoiceError::Config("WHISPER_MODEL_PATH not set".to_string()))?;
            let path = path.trim();
            if path.is_empty() {
                return Err(VoiceError::Config("WHISPER_MODEL_PATH is empty".to_string()));
            }
            Self::new(path)
        }
    }

    impl SttBackend for WhisperStt {
        fn transcribe(&self, utterance: &Utterance) -> VoiceResult<String> {
            if utterance.samples.is_empty() {
                return Ok(String::new());
            }
            if utterance.sample_rate != 16000 {
                return Err(VoiceError::Stt(format!(
                    "whisper expects 16 kHz; got {} Hz",
                    utterance.sample_rate
                )));
            }
            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_no_timestamps(true);
            params.set_language(Some("en"));

            let mut state = self
                .state
                .lock()
                .map_err(|e| VoiceError::Stt(format!("whisper lock poisoned: {e}")))?;
            state
                .full(&params, &utterance.samples)
                .map_err(|e| VoiceError::Stt(format!("whisper inference failed: {e}")))?;
            let text = state
                .as_iter()
                .filter_map(|seg| seg.to_str().ok())
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string();
            Ok(text)
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperStt;

/// Create the best available STT backend from the environment.
/// Priority: WhisperStt if `WHISPER_MODEL_PATH` is set and loads (requires
/// the `whisper` feature), then RemoteStt if `STT_API_KEY` is set, then
/// PlaceholderStt.
pub fn create_best_stt() -> VoiceResult<Box<dyn SttBackend>> {
    #[cfg(feature = "whisper")]
    {
        if let Ok(path) = std::env::var("WHISPER_MODEL_PATH") {
            let path = path.trim();
            if !path.is_empty() {
                if let Ok(w) = whisper_stt::WhisperStt::new(path) {
                    return Ok(Box::new(w));
                }
            }
        }
    }
    if let Ok(remote) = RemoteStt::from_env() {
        return Ok(Box::new(remote));
    }
    Ok(Box::new(PlaceholderStt::new()))
}
