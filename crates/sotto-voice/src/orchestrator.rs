//! Turn orchestration: transcription, optional augmentation, generation,
//! and spoken playback.
//!
//! One turn runs at a time, driven off the utterance channel. Engine calls
//! (STT, LLM, TTS, playback) run on the blocking pool, never on the capture
//! path. The frame bus is paused before playback and resumed on every exit
//! path so the pipeline cannot hear itself speak. Every turn, however it
//! fails, terminates by re-arming segmentation and returning to Listening.

use crate::bus::FrameBus;
use crate::error::VoiceResult;
use crate::llm::{construct_messages, LlmBackend};
use crate::segmentation::{SegmentationController, Utterance};
use crate::state::{ConversationState, TurnStateMachine};
use crate::stt::{transcribe_utterance, SttBackend};
use crate::tts::{PlaybackBackend, TtsBackend};
use sotto_web::SearchContextAggregator;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Spoken when the generation engine fails or returns nothing.
pub const APOLOGY: &str = "I'm having trouble thinking.";

/// Keyword heuristic deciding when a transcript needs live web context, and
/// how to turn it into a search query. A policy is plain data: swap in a
/// different instance to change behavior.
#[derive(Debug, Clone)]
pub struct AugmentPolicy {
    /// Case-insensitive substring cues. Any hit triggers augmentation.
    keywords: Vec<String>,
    /// Leading phrases stripped from the transcript to form the query.
    strip_prefixes: Vec<String>,
}

impl Default for AugmentPolicy {
    fn default() -> Self {
        Self::new(
            [
                // People/place lookups
                "who is", "who's", "where is", "where's",
                // Time-sensitive
                "latest", "current", "today", "recent", "news",
                // Explicit information requests
                "tell me about", "information about", "look up", "search for",
            ],
            ["who is ", "who's ", "tell me about ", "look up ", "search for "],
        )
    }
}

impl AugmentPolicy {
    pub fn new(
        keywords: impl IntoIterator<Item = impl Into<String>>,
        strip_prefixes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            keywords: keywords.into_iter().map(Into::into).collect(),
            strip_prefixes: strip_prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the transcript should be augmented with web context.
    pub fn needs_search(&self, transcript: &str) -> bool {
        let lower = transcript.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }

    /// Derive a search query by stripping the first matching lead-in phrase.
    pub fn derive_query(&self, transcript: &str) -> String {
        let lower = transcript.to_lowercase();
        for prefix in &self.strip_prefixes {
            if lower.contains(prefix.as_str()) {
                return lower.replacen(prefix.as_str(), "", 1).trim().to_string();
            }
        }
        lower.trim().to_string()
    }
}

/// Sequences one conversational turn end to end.
pub struct TurnOrchestrator {
    state: Arc<TurnStateMachine>,
    bus: Arc<FrameBus>,
    segmentation: Arc<Mutex<SegmentationController>>,
    stt: Arc<dyn SttBackend>,
    llm: Arc<dyn LlmBackend>,
    tts: Arc<dyn TtsBackend>,
    playback: Arc<dyn PlaybackBackend>,
    search: Arc<SearchContextAggregator>,
    policy: AugmentPolicy,
    utterance_rx: mpsc::UnboundedReceiver<Utterance>,
}

impl TurnOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<TurnStateMachine>,
        bus: Arc<FrameBus>,
        segmentation: Arc<Mutex<SegmentationController>>,
        stt: Arc<dyn SttBackend>,
        llm: Arc<dyn LlmBackend>,
        tts: Arc<dyn TtsBackend>,
        playback: Arc<dyn PlaybackBackend>,
        search: Arc<SearchContextAggregator>,
        policy: AugmentPolicy,
        utterance_rx: mpsc::UnboundedReceiver<Utterance>,
    ) -> Self {
        Self {
            state,
            bus,
            segmentation,
            stt,
            llm,
            tts,
            playback,
            search,
            policy,
            utterance_rx,
        }
    }

    /// Drive turns until the utterance channel closes. Every turn ends by
    /// re-arming to Listening, whatever happened along the way.
    pub async fn run(mut self) {
        while let Some(utterance) = self.utterance_rx.recv().await {
            self.handle_turn(utterance).await;
            self.rearm();
        }
        debug!("utterance channel closed, orchestrator stopping");
    }

    async fn handle_turn(&self, utterance: Utterance) {
        if self.state.transition(ConversationState::Processing).is_err() {
            return;
        }

        let transcript = self.transcribe(utterance).await;
        if transcript.is_empty() {
            info!("no speech detected");
            return;
        }
        info!("user: {transcript}");

        if self.state.transition(ConversationState::Thinking).is_err() {
            return;
        }
        let reply = self.generate_reply(&transcript).await;
        info!("assistant: {reply}");

        if self.state.transition(ConversationState::Speaking).is_err() {
            return;
        }
        self.speak(reply).await;
    }

    /// Transcribe on the blocking pool. Engine failure degrades to an empty
    /// transcript, which ends the turn quietly.
    async fn transcribe(&self, utterance: Utterance) -> String {
        let stt = Arc::clone(&self.stt);
        let joined =
            tokio::task::spawn_blocking(move || transcribe_utterance(stt.as_ref(), &utterance))
                .await;
        match joined {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!("transcription failed: {e}");
                String::new()
            }
            Err(e) => {
                error!("transcription task panicked: {e}");
                String::new()
            }
        }
    }

    /// Generate the reply, augmenting with live web context when the policy
    /// triggers. Any failure maps to the fixed apology.
    async fn generate_reply(&self, transcript: &str) -> String {
        let llm = Arc::clone(&self.llm);
        let joined = if self.policy.needs_search(transcript) {
            let query = self.policy.derive_query(transcript);
            info!("augmenting reply with web context: {query:?}");
            let context = self.search.get_context(&query).await;
            let question = transcript.to_string();
            tokio::task::spawn_blocking(move || llm.generate_with_context(&question, &context))
                .await
        } else {
            let messages = construct_messages(transcript);
            tokio::task::spawn_blocking(move || llm.generate(&messages)).await
        };
        match joined {
            Ok(Ok(reply)) if !reply.trim().is_empty() => reply,
            Ok(Ok(_)) => {
                warn!("generation returned an empty reply");
                APOLOGY.to_string()
            }
            Ok(Err(e)) => {
                warn!("generation failed: {e}");
                APOLOGY.to_string()
            }
            Err(e) => {
                error!("generation task panicked: {e}");
                APOLOGY.to_string()
            }
        }
    }

    /// Synthesize and play the reply with the frame bus paused. The bus is
    /// resumed on every exit path, including engine failure.
    async fn speak(&self, text: String) {
        self.bus.pause();
        let tts = Arc::clone(&self.tts);
        let playback = Arc::clone(&self.playback);
        let joined = tokio::task::spawn_blocking(move || -> VoiceResult<()> {
            let bytes = tts.synthesize(&text)?;
            playback.play_blocking(&bytes)
        })
        .await;
        self.bus.resume();

        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("speech output failed: {e}"),
            Err(e) => error!("speech task panicked: {e}"),
        }
    }

    /// Reset segmentation and VAD for the next utterance and return to
    /// Listening. If the direct edge is illegal (error left us in an odd
    /// phase), force-reset to Idle first.
    fn rearm(&self) {
        self.segmentation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rearm();
        if self.state.transition(ConversationState::Listening).is_err() {
            self.state.reset();
            if let Err(e) = self.state.transition(ConversationState::Listening) {
                error!("failed to re-arm to Listening: {e}");
                return;
            }
        }
        info!("listening");
    }
}
