//! Utterance assembly and endpointing.
//!
//! Consumes dispatched frames while the conversation is in Listening or
//! Recording, runs VAD inline, and closes the utterance after sustained
//! silence. Silence is counted in frame time (samples at the configured
//! rate), not wall clock, so short pauses inside natural speech are absorbed
//! deterministically. After endpointing the controller goes dormant until
//! the orchestrator re-arms it.

use crate::audio::AudioFrame;
use crate::error::{VoiceError, VoiceResult};
use crate::state::{ConversationState, TurnStateMachine};
use crate::vad::{SpeechEvent, VoiceActivityDetector};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Endpointing configuration.
#[derive(Debug, Clone)]
pub struct SegmentationConfig {
    /// Sample rate of incoming frames (default 16000).
    pub sample_rate: u32,

    /// Continuous non-speech required to close an utterance (default 1.5s).
    pub silence_timeout: Duration,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            silence_timeout: Duration::from_millis(1500),
        }
    }
}

/// One complete utterance: samples from speech onset through endpointing.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// PCM samples (f32, -1.0..1.0) for the full utterance.
    pub samples: Vec<f32>,

    /// Sample rate the utterance was captured at.
    pub sample_rate: u32,

    /// Utterance length, trailing silence included.
    pub duration: Duration,

    /// When endpointing fired.
    pub finished_at: DateTime<Utc>,
}

/// Assembles utterances from the frame stream and fires endpointing.
pub struct SegmentationController {
    config: SegmentationConfig,
    vad: VoiceActivityDetector,
    state: Arc<TurnStateMachine>,
    utterance_tx: mpsc::UnboundedSender<Utterance>,
    buffer: Vec<f32>,
    silence_samples: usize,
    armed: bool,
}

impl SegmentationController {
    pub fn new(
        config: SegmentationConfig,
        vad: VoiceActivityDetector,
        state: Arc<TurnStateMachine>,
        utterance_tx: mpsc::UnboundedSender<Utterance>,
    ) -> Self {
        Self {
            config,
            vad,
            state,
            utterance_tx,
            buffer: Vec::new(),
            silence_samples: 0,
            armed: true,
        }
    }

    /// Frame handler for [`FrameBus::subscribe`](crate::bus::FrameBus).
    /// Runs VAD inline on the capture path; must stay fast.
    pub fn on_frame(&mut self, frame: &AudioFrame) -> VoiceResult<()> {
        if !self.armed {
            return Ok(());
        }
        let phase = self.state.state();
        if !matches!(
            phase,
            ConversationState::Listening | ConversationState::Recording
        ) {
            return Ok(());
        }

        let vad_frame = self.vad.process_frame(&frame.samples)?;

        if vad_frame.event == SpeechEvent::SpeechStart && phase == ConversationState::Listening {
            if self.state.transition(ConversationState::Recording).is_ok() {
                info!("speech onset, recording");
                self.buffer.clear();
                self.silence_samples = 0;
                // The triggering frame contains speech: keep it.
                self.buffer.extend_from_slice(&frame.samples);
            }
            return Ok(());
        }

        if phase == ConversationState::Recording {
            self.buffer.extend_from_slice(&frame.samples);
            if vad_frame.is_speech {
                self.silence_samples = 0;
            } else {
                self.silence_samples += frame.samples.len();
                if self.silence_duration() >= self.config.silence_timeout {
                    self.endpoint()?;
                }
            }
        }

        Ok(())
    }

    fn silence_duration(&self) -> Duration {
        Duration::from_secs_f64(self.silence_samples as f64 / self.config.sample_rate as f64)
    }

    /// Close the utterance, hand it to the orchestrator, and go dormant.
    fn endpoint(&mut self) -> VoiceResult<()> {
        let samples = std::mem::take(&mut self.buffer);
        self.silence_samples = 0;
        self.armed = false;

        let duration =
            Duration::from_secs_f64(samples.len() as f64 / self.config.sample_rate as f64);
        info!(
            "endpointing: {:.2}s utterance ({} samples)",
            duration.as_secs_f64(),
            samples.len()
        );
        let utterance = Utterance {
            samples,
            sample_rate: self.config.sample_rate,
            duration,
            finished_at: Utc::now(),
        };
        self.utterance_tx
            .send(utterance)
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    /// Re-arm for the next utterance: reset VAD recurrent state, clear the
    /// buffer and silence timer. Called by the orchestrator, never mid-turn.
    pub fn rearm(&mut self) {
        self.vad.reset_for_new_utterance();
        self.buffer.clear();
        self.silence_samples = 0;
        self.armed = true;
        debug!("segmentation re-armed");
    }

    /// Whether the controller is waiting for the orchestrator to re-arm it.
    pub fn is_dormant(&self) -> bool {
        !self.armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::test_support::ScriptedScorer;

    const FRAME: usize = 512;
    const RATE: u32 = 16000;

    fn controller(
        script: &[f32],
    ) -> (
        SegmentationController,
        Arc<TurnStateMachine>,
        mpsc::UnboundedReceiver<Utterance>,
    ) {
        let state = Arc::new(TurnStateMachine::new());
        state.transition(ConversationState::Listening).unwrap();
        let vad = VoiceActivityDetector::new(Box::new(ScriptedScorer::new(script)), 0.5);
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = SegmentationController::new(
            SegmentationConfig {
                sample_rate: RATE,
                silence_timeout: Duration::from_millis(1500),
            },
            vad,
            Arc::clone(&state),
            tx,
        );
        (controller, state, rx)
    }

    fn feed(controller: &mut SegmentationController, frames: usize) {
        let frame = AudioFrame::new(vec![0.01f32; FRAME]);
        for _ in 0..frames {
            controller.on_frame(&frame).unwrap();
        }
    }

    /// 1.5s of silence at 16kHz in 512-sample frames.
    fn silence_frames() -> usize {
        let samples = (RATE as f64 * 1.5).ceil() as usize;
        samples.div_ceil(FRAME)
    }

    #[test]
    fn speech_then_silence_fires_exactly_one_endpoint() {
        let speech = 20;
        let silence = silence_frames() + 5;
        let mut script = vec![0.9f32; speech];
        script.extend(std::iter::repeat(0.1f32).take(silence));

        let (mut controller, state, mut rx) = controller(&script);
        feed(&mut controller, speech + silence);

        let utterance = rx.try_recv().expect("endpoint should have fired");
        assert!(rx.try_recv().is_err(), "exactly one endpoint");
        assert!(controller.is_dormant());
        assert_eq!(state.state(), ConversationState::Recording);

        // At least the speech frames, at most speech + silence-to-threshold.
        let min_samples = speech * FRAME;
        assert!(utterance.samples.len() >= min_samples);
        assert_eq!(utterance.sample_rate, RATE);
    }

    #[test]
    fn short_pause_does_not_endpoint() {
        let speech = 10;
        let pause = 10; // 320ms, well under 1.5s
        let mut script = vec![0.9f32; speech];
        script.extend(std::iter::repeat(0.1f32).take(pause));
        script.extend(std::iter::repeat(0.9f32).take(speech));

        let (mut controller, state, mut rx) = controller(&script);
        feed(&mut controller, speech + pause + speech);

        assert!(rx.try_recv().is_err(), "pause must not close the utterance");
        assert_eq!(state.state(), ConversationState::Recording);
        assert!(!controller.is_dormant());
    }

    #[test]
    fn frames_are_ignored_outside_listening_and_recording() {
        let (mut controller, state, mut rx) = controller(&[0.9; 64]);
        state.transition(ConversationState::Recording).unwrap();
        state.transition(ConversationState::Processing).unwrap();

        feed(&mut controller, 10);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dormant_controller_ignores_frames_until_rearmed() {
        let speech = 4;
        let silence = silence_frames();
        let mut script = vec![0.9f32; speech];
        script.extend(std::iter::repeat(0.1f32).take(silence));
        // A second burst that must be ignored while dormant.
        script.extend(std::iter::repeat(0.9f32).take(20));

        let (mut controller, state, mut rx) = controller(&script);
        feed(&mut controller, speech + silence);
        assert!(rx.try_recv().is_ok());

        feed(&mut controller, 20);
        assert!(rx.try_recv().is_err(), "dormant controller must stay quiet");

        // Orchestrator re-arm path.
        state.transition(ConversationState::Processing).unwrap();
        state.transition(ConversationState::Listening).unwrap();
        controller.rearm();
        assert!(!controller.is_dormant());
    }
}
