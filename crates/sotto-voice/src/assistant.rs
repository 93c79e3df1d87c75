//! Pipeline assembly: wire capture, bus, VAD, segmentation, state machine
//! and orchestrator into a running assistant.

use crate::audio::{AudioCapture, AudioConfig};
use crate::bus::FrameBus;
use crate::error::{VoiceError, VoiceResult};
use crate::llm::LlmBackend;
use crate::orchestrator::{AugmentPolicy, TurnOrchestrator};
use crate::segmentation::{SegmentationConfig, SegmentationController};
use crate::state::{ConversationState, TurnStateMachine};
use crate::stt::SttBackend;
use crate::tts::{PlaybackBackend, TtsBackend};
use crate::vad::{VadConfig, VoiceActivityDetector, WebrtcScorer};
use sotto_web::{SearchClient, SearchContextAggregator};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Top-level configuration for one assistant instance.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub segmentation: SegmentationConfig,
    /// Pre-roll retention window (default 500ms).
    pub preroll_window: Duration,
    pub policy: AugmentPolicy,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            segmentation: SegmentationConfig::default(),
            preroll_window: Duration::from_millis(500),
            policy: AugmentPolicy::default(),
        }
    }
}

/// The external engines one assistant consumes.
pub struct EngineSet {
    pub stt: Arc<dyn SttBackend>,
    pub llm: Arc<dyn LlmBackend>,
    pub tts: Arc<dyn TtsBackend>,
    pub playback: Arc<dyn PlaybackBackend>,
    pub search: Arc<dyn SearchClient>,
}

/// A fully wired assistant. Owns the capture stream, so it is bound to the
/// thread that starts it; everything downstream runs on worker contexts.
pub struct Assistant {
    state: Arc<TurnStateMachine>,
    bus: Arc<FrameBus>,
    capture: Option<AudioCapture>,
    orchestrator: Option<TurnOrchestrator>,
    stream: Option<cpal::Stream>,
    turn_task: Option<tokio::task::JoinHandle<()>>,
}

impl Assistant {
    /// Build the pipeline. Engine construction failures (missing device,
    /// missing model) surface here, and the turn loop never starts.
    pub fn new(config: AssistantConfig, engines: EngineSet) -> VoiceResult<Self> {
        if config.audio.sample_rate != config.vad.sample_rate {
            return Err(VoiceError::Config(format!(
                "audio sample rate ({}) must match VAD sample rate ({})",
                config.audio.sample_rate, config.vad.sample_rate
            )));
        }
        if config.audio.sample_rate != config.segmentation.sample_rate {
            return Err(VoiceError::Config(format!(
                "audio sample rate ({}) must match segmentation sample rate ({})",
                config.audio.sample_rate, config.segmentation.sample_rate
            )));
        }

        let bus = Arc::new(FrameBus::new(
            config.audio.preroll_samples(config.preroll_window),
        ));
        let state = Arc::new(TurnStateMachine::new());

        let scorer = WebrtcScorer::new(config.vad.clone())?;
        let detector = VoiceActivityDetector::new(Box::new(scorer), config.vad.threshold);

        let (utterance_tx, utterance_rx) = mpsc::unbounded_channel();
        let segmentation = Arc::new(Mutex::new(SegmentationController::new(
            config.segmentation.clone(),
            detector,
            Arc::clone(&state),
            utterance_tx,
        )));

        let seg_for_bus = Arc::clone(&segmentation);
        bus.subscribe(move |frame| {
            seg_for_bus
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .on_frame(frame)
        });

        let search = Arc::new(SearchContextAggregator::new(engines.search));
        let orchestrator = TurnOrchestrator::new(
            Arc::clone(&state),
            Arc::clone(&bus),
            segmentation,
            engines.stt,
            engines.llm,
            engines.tts,
            engines.playback,
            search,
            config.policy.clone(),
            utterance_rx,
        );

        let capture = AudioCapture::new(config.audio.clone())?;

        Ok(Self {
            state,
            bus,
            capture: Some(capture),
            orchestrator: Some(orchestrator),
            stream: None,
            turn_task: None,
        })
    }

    /// Start listening. Idempotent: a second call is a no-op.
    pub async fn start(&mut self) -> VoiceResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let capture = self
            .capture
            .take()
            .ok_or_else(|| VoiceError::Config("assistant already consumed".to_string()))?;
        let orchestrator = self
            .orchestrator
            .take()
            .ok_or_else(|| VoiceError::Config("assistant already consumed".to_string()))?;

        self.state.transition(ConversationState::Listening)?;
        self.turn_task = Some(tokio::spawn(orchestrator.run()));
        self.stream = Some(capture.start(Arc::clone(&self.bus))?);
        info!("assistant listening");
        Ok(())
    }

    /// Stop capture and the turn loop, returning to Idle. Idempotent.
    pub async fn stop(&mut self) {
        if self.stream.is_none() && self.turn_task.is_none() {
            return;
        }
        self.stream = None;
        if let Some(task) = self.turn_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.state.reset();
        info!("assistant stopped");
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    /// Current conversation phase.
    pub fn conversation_state(&self) -> ConversationState {
        self.state.state()
    }

    /// The frame bus, for pre-roll access and diagnostics.
    pub fn bus(&self) -> &Arc<FrameBus> {
        &self.bus
    }
}

impl Drop for Assistant {
    fn drop(&mut self) {
        self.stream = None;
        if let Some(task) = self.turn_task.take() {
            task.abort();
        }
    }
}
