//! # Sotto Voice — real-time conversational turn-taking
//!
//! Continuously ingests microphone audio, detects speech boundaries frame by
//! frame, assembles complete utterances, transcribes them, optionally pulls
//! in live web context, generates a reply, and speaks it — then re-arms for
//! the next utterance without ever hearing its own voice.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  ┌─────────┐   ┌──────────────────────┐   ┌───────────────────┐  │
//! │  │ Capture │ → │ FrameBus             │ → │ Segmentation      │  │
//! │  │ (cpal)  │   │ pre-roll + gate      │   │ VAD + endpointing │  │
//! │  └─────────┘   └──────────────────────┘   └───────────────────┘  │
//! │        ▲             pause/resume                │ utterance     │
//! │        │                  ▲                      ▼               │
//! │  ┌─────┴────┐   ┌─────────┴──────────────────────────────────┐   │
//! │  │ Playback │ ← │ TurnOrchestrator                           │   │
//! │  │ (rodio)  │   │ STT → [web context] → LLM → TTS → re-arm   │   │
//! │  └──────────┘   └────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The capture path stays non-blocking: VAD scoring runs inline per 30ms
//! frame, while transcription, generation, web fetches and playback run on
//! worker contexts. The [`state::TurnStateMachine`] is the single source of
//! truth for what phase the conversation is in.

pub mod assistant;
pub mod audio;
pub mod bus;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod segmentation;
pub mod state;
pub mod stt;
pub mod tts;
pub mod vad;

pub use assistant::{Assistant, AssistantConfig, EngineSet};
pub use audio::{AudioCapture, AudioConfig, AudioFrame};
pub use bus::{FrameBus, RingPreroll};
pub use error::{VoiceError, VoiceResult};
pub use llm::{construct_messages, grounded_prompt, ChatMessage, LlmBackend, PlaceholderLlm, RemoteLlm};
pub use orchestrator::{AugmentPolicy, TurnOrchestrator, APOLOGY};
pub use segmentation::{SegmentationConfig, SegmentationController, Utterance};
pub use state::{ConversationState, TurnStateMachine};
pub use stt::{create_best_stt, transcribe_utterance, PlaceholderStt, RemoteStt, SttBackend};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use tts::{PlaceholderTts, PlaybackBackend, RemoteTts, RodioPlayback, TtsBackend};
pub use vad::{
    SpeechEvent, SpeechScorer, VadConfig, VadFrame, VadState, VoiceActivityDetector, WebrtcScorer,
};
