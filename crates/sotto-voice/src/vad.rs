//! Voice activity detection.
//!
//! A [`SpeechScorer`] turns one frame into a speech probability, threading
//! recurrent state through [`VadState`]. The [`VoiceActivityDetector`] wraps
//! a scorer with thresholding and start/end edge detection. Scorer failures
//! degrade to "silence" so one bad inference cannot wedge the pipeline;
//! an unsupported frame size is a caller error and does propagate.

use crate::error::{VoiceError, VoiceResult};
use tracing::{info, warn};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Configuration for VAD detection.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate (8000, 16000, 32000, or 48000 Hz for the WebRTC scorer).
    pub sample_rate: u32,

    /// WebRTC detection mode (0-3, where 3 is most aggressive).
    pub mode: u8,

    /// Probability above this counts as speech (default 0.5).
    pub threshold: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            mode: 3,
            threshold: 0.5,
        }
    }
}

/// Opaque recurrent hidden state carried between consecutive scorer calls.
///
/// The layout is scorer-defined; recurrent scorers size it lazily on first
/// use. Stale state across utterances degrades detection, so it is cleared
/// exactly at utterance arming and nowhere else.
#[derive(Debug, Clone, Default)]
pub struct VadState {
    hidden: Vec<f32>,
}

impl VadState {
    /// Scorer-side access to the recurrent buffer.
    pub fn buffer(&mut self) -> &mut Vec<f32> {
        &mut self.hidden
    }

    /// Drop all recurrent state; the scorer re-initializes on next use.
    pub fn clear(&mut self) {
        self.hidden.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.hidden.is_empty()
    }
}

/// Per-frame speech probability engine.
pub trait SpeechScorer: Send {
    /// Score one frame, returning a probability in [0,1]. Recurrent scorers
    /// read and update `state`.
    fn score(&mut self, frame: &[f32], state: &mut VadState) -> VoiceResult<f32>;

    /// Whether a frame of `len` samples is a legal input for this scorer.
    fn supports_frame(&self, len: usize) -> bool;

    /// Clear recurrent state for a fresh utterance.
    fn reset(&mut self, state: &mut VadState) {
        state.clear();
    }
}

/// WebRTC-VAD-backed scorer. Binary output: 1.0 for voiced, 0.0 otherwise.
///
/// Accepts frames that are multiples of 10ms and scores them in 30/20/10ms
/// windows, reporting voiced if any window is voiced.
pub struct WebrtcScorer {
    vad: Vad,
    config: VadConfig,
    samples_per_10ms: usize,
}

// `Vad` wraps a `*mut Fvad` that it owns exclusively; moving that ownership
// between threads is sound (it is never shared), so the scorer is `Send`.
unsafe impl Send for WebrtcScorer {}

impl WebrtcScorer {
    pub fn new(config: VadConfig) -> VoiceResult<Self> {
        if config.mode > 3 {
            return Err(VoiceError::Config(format!(
                "VAD mode must be 0-3, got {}",
                config.mode
            )));
        }
        let (vad_mode, sample_rate) = Self::map_config(&config)?;
        let mut vad = Vad::new();
        vad.set_mode(vad_mode);
        vad.set_sample_rate(sample_rate);

        let samples_per_10ms = config.sample_rate as usize / 100;
        info!(
            "WebRTC VAD ready ({}Hz, mode {})",
            config.sample_rate, config.mode
        );
        Ok(Self {
            vad,
            config,
            samples_per_10ms,
        })
    }

    fn map_config(config: &VadConfig) -> VoiceResult<(VadMode, SampleRate)> {
        let mode = match config.mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        };
        let rate = match config.sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => {
                return Err(VoiceError::Config(format!(
                    "WebRTC VAD supports 8000/16000/32000/48000 Hz, got {other}"
                )))
            }
        };
        Ok((mode, rate))
    }
}

impl SpeechScorer for WebrtcScorer {
    fn score(&mut self, frame: &[f32], _state: &mut VadState) -> VoiceResult<f32> {
        let mut rest = frame;
        let mut voiced = false;
        while !rest.is_empty() {
            let take = if rest.len() >= self.samples_per_10ms * 3 {
                self.samples_per_10ms * 3
            } else if rest.len() >= self.samples_per_10ms * 2 {
                self.samples_per_10ms * 2
            } else {
                self.samples_per_10ms
            };
            let (window, tail) = rest.split_at(take);
            let pcm: Vec<i16> = window
                .iter()
                .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                .collect();
            voiced |= self
                .vad
                .is_voice_segment(&pcm)
                .map_err(|e| VoiceError::Vad(format!("scorer rejected window: {e:?}")))?;
            rest = tail;
        }
        Ok(if voiced { 1.0 } else { 0.0 })
    }

    fn supports_frame(&self, len: usize) -> bool {
        len > 0 && len % self.samples_per_10ms == 0
    }

    fn reset(&mut self, state: &mut VadState) {
        // WebRTC VAD has no explicit reset; rebuild it.
        if let Ok((mode, rate)) = Self::map_config(&self.config) {
            self.vad = Vad::new();
            self.vad.set_mode(mode);
            self.vad.set_sample_rate(rate);
        }
        state.clear();
    }
}

/// Threshold-crossing event between two consecutive frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEvent {
    SpeechStart,
    SpeechEnd,
    None,
}

/// Result of processing one frame.
#[derive(Debug, Clone, Copy)]
pub struct VadFrame {
    pub probability: f32,
    pub is_speech: bool,
    pub event: SpeechEvent,
}

/// Stateful detector: thresholding plus edge detection over a scorer.
///
/// The remembered previous-frame boolean is a field on this instance, so
/// multiple detectors can run concurrently (one per stream under test).
pub struct VoiceActivityDetector {
    scorer: Box<dyn SpeechScorer>,
    state: VadState,
    threshold: f32,
    was_speech: bool,
}

impl VoiceActivityDetector {
    pub fn new(scorer: Box<dyn SpeechScorer>, threshold: f32) -> Self {
        Self {
            scorer,
            state: VadState::default(),
            threshold,
            was_speech: false,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Speech probability for one frame. A scorer failure is logged and
    /// treated as silence; an unsupported frame size is a caller error.
    pub fn score_frame(&mut self, frame: &[f32]) -> VoiceResult<f32> {
        if !self.scorer.supports_frame(frame.len()) {
            return Err(VoiceError::Vad(format!(
                "unsupported frame size: {} samples",
                frame.len()
            )));
        }
        Ok(match self.scorer.score(frame, &mut self.state) {
            Ok(p) => p.clamp(0.0, 1.0),
            Err(e) => {
                warn!("speech scorer failed, treating frame as silence: {e}");
                0.0
            }
        })
    }

    /// Thresholded score for one frame.
    pub fn is_speech(&mut self, frame: &[f32]) -> VoiceResult<bool> {
        Ok(self.score_frame(frame)? > self.threshold)
    }

    /// Score one frame and derive the boundary event by comparing against
    /// the previous frame's thresholded boolean (false at arming).
    pub fn process_frame(&mut self, frame: &[f32]) -> VoiceResult<VadFrame> {
        let probability = self.score_frame(frame)?;
        let is_speech = probability > self.threshold;
        let event = match (self.was_speech, is_speech) {
            (false, true) => SpeechEvent::SpeechStart,
            (true, false) => SpeechEvent::SpeechEnd,
            _ => SpeechEvent::None,
        };
        self.was_speech = is_speech;
        Ok(VadFrame {
            probability,
            is_speech,
            event,
        })
    }

    /// Clear recurrent scorer state and the remembered boolean. Must be
    /// called exactly once per utterance arming, never mid-utterance.
    pub fn reset_for_new_utterance(&mut self) {
        self.scorer.reset(&mut self.state);
        self.was_speech = false;
    }
}
