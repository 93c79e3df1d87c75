//! End-to-end turn tests over a synthetic frame stream: no audio hardware,
//! scripted engines, real orchestration.

use async_trait::async_trait;
use sotto_voice::{
    AugmentPolicy, AudioFrame, ChatMessage, ConversationState, FrameBus, LlmBackend,
    PlaybackBackend, SegmentationConfig, SegmentationController, SpeechScorer, SttBackend,
    TtsBackend, TurnOrchestrator, TurnStateMachine, Utterance, VadState, VoiceActivityDetector,
    VoiceResult,
};
use sotto_web::{SearchClient, SearchContextAggregator, SearchResult, WebResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

const FRAME: usize = 512;
const RATE: u32 = 16000;

/// Replays a probability script; exhausted script reads as silence.
struct ScriptedScorer {
    script: Mutex<VecDeque<f32>>,
}

impl ScriptedScorer {
    fn new(probabilities: Vec<f32>) -> Self {
        Self {
            script: Mutex::new(probabilities.into_iter().collect()),
        }
    }
}

impl SpeechScorer for ScriptedScorer {
    fn score(&mut self, _frame: &[f32], _state: &mut VadState) -> VoiceResult<f32> {
        Ok(self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(0.0))
    }

    fn supports_frame(&self, len: usize) -> bool {
        matches!(len, 512 | 1024 | 1536)
    }
}

struct FakeStt {
    transcript: String,
    calls: AtomicUsize,
}

impl SttBackend for FakeStt {
    fn transcribe(&self, _utterance: &Utterance) -> VoiceResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.transcript.clone())
    }
}

#[derive(Default)]
struct FakeLlm {
    reply: String,
    plain_calls: Mutex<Vec<Vec<ChatMessage>>>,
    grounded_calls: Mutex<Vec<(String, String)>>,
}

impl LlmBackend for FakeLlm {
    fn generate(&self, messages: &[ChatMessage]) -> VoiceResult<String> {
        self.plain_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages.to_vec());
        Ok(self.reply.clone())
    }

    fn generate_with_context(&self, question: &str, context: &str) -> VoiceResult<String> {
        self.grounded_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((question.to_string(), context.to_string()));
        Ok(self.reply.clone())
    }
}

struct FakeTts {
    spoken: Mutex<Vec<String>>,
}

impl TtsBackend for FakeTts {
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        self.spoken
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.to_string());
        Ok(format!("AUDIO:{text}").into_bytes())
    }
}

/// Playback that injects frames into the bus mid-"speech" to prove the
/// pause gate holds, and records what it observed.
struct InjectingPlayback {
    bus: Arc<FrameBus>,
    played: Mutex<Vec<Vec<u8>>>,
    was_paused_during_playback: AtomicBool,
    paused_after_return: AtomicBool,
}

impl PlaybackBackend for InjectingPlayback {
    fn play_blocking(&self, bytes: &[u8]) -> VoiceResult<()> {
        self.was_paused_during_playback
            .store(self.bus.is_paused(), Ordering::SeqCst);
        // The assistant is "speaking": inject capture frames and make sure
        // they are retained by pre-roll but never dispatched.
        for _ in 0..10 {
            self.bus.ingest(AudioFrame::new(vec![0.2f32; FRAME]));
        }
        self.paused_after_return
            .store(self.bus.is_paused(), Ordering::SeqCst);
        self.played
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes.to_vec());
        Ok(())
    }
}

struct FakeSearch {
    queries: Mutex<Vec<String>>,
    results: Vec<SearchResult>,
    page_body: String,
}

#[async_trait]
impl SearchClient for FakeSearch {
    async fn search(&self, query: &str) -> WebResult<Vec<SearchResult>> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(query.to_string());
        Ok(self.results.clone())
    }

    async fn fetch_page(&self, _url: &str) -> WebResult<String> {
        Ok(format!("<html><body><p>{}</p></body></html>", self.page_body))
    }
}

struct Pipeline {
    bus: Arc<FrameBus>,
    state: Arc<TurnStateMachine>,
    dispatched: Arc<AtomicUsize>,
}

/// Wire a full pipeline around scripted engines and spawn the orchestrator.
fn build_pipeline(
    script: Vec<f32>,
    stt: Arc<FakeStt>,
    llm: Arc<FakeLlm>,
    tts: Arc<FakeTts>,
    search: Arc<FakeSearch>,
) -> (Pipeline, Arc<InjectingPlayback>) {
    let bus = Arc::new(FrameBus::new(8000));
    let state = Arc::new(TurnStateMachine::new());
    state.transition(ConversationState::Listening).unwrap();

    let detector = VoiceActivityDetector::new(Box::new(ScriptedScorer::new(script)), 0.5);
    let (utterance_tx, utterance_rx) = mpsc::unbounded_channel();
    let segmentation = Arc::new(Mutex::new(SegmentationController::new(
        SegmentationConfig {
            sample_rate: RATE,
            silence_timeout: Duration::from_millis(1500),
        },
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

    let dispatched = Arc::new(AtomicUsize::new(0));
    let dispatched_in_sub = Arc::clone(&dispatched);
    bus.subscribe(move |_frame| {
        dispatched_in_sub.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let playback = Arc::new(InjectingPlayback {
        bus: Arc::clone(&bus),
        played: Mutex::new(Vec::new()),
        was_paused_during_playback: AtomicBool::new(false),
        paused_after_return: AtomicBool::new(false),
    });

    let orchestrator = TurnOrchestrator::new(
        Arc::clone(&state),
        Arc::clone(&bus),
        segmentation,
        stt,
        llm,
        tts,
        Arc::clone(&playback) as Arc<dyn PlaybackBackend>,
        Arc::new(SearchContextAggregator::new(
            search as Arc<dyn SearchClient>,
        )),
        AugmentPolicy::default(),
        utterance_rx,
    );
    tokio::spawn(orchestrator.run());

    (
        Pipeline {
            bus,
            state,
            dispatched,
        },
        playback,
    )
}

/// 20 speech frames then enough silence to cross the 1.5s endpoint.
fn speech_then_silence() -> (Vec<f32>, usize) {
    let speech = 20;
    let silence = (RATE as usize * 3 / 2).div_ceil(FRAME);
    let mut script = vec![0.95f32; speech];
    script.extend(std::iter::repeat(0.05f32).take(silence));
    (script, speech + silence)
}

async fn wait_for_listening(state: &TurnStateMachine) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.state() != ConversationState::Listening {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("turn should complete and re-arm to Listening");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_turn_speaks_reply_and_rearms() {
    let stt = Arc::new(FakeStt {
        transcript: "what's the capital of France".to_string(),
        calls: AtomicUsize::new(0),
    });
    let llm = Arc::new(FakeLlm {
        reply: "Paris.".to_string(),
        ..FakeLlm::default()
    });
    let tts = Arc::new(FakeTts {
        spoken: Mutex::new(Vec::new()),
    });
    let search = Arc::new(FakeSearch {
        queries: Mutex::new(Vec::new()),
        results: Vec::new(),
        page_body: String::new(),
    });

    let (script, frames) = speech_then_silence();
    let (pipeline, playback) = build_pipeline(
        script,
        Arc::clone(&stt),
        Arc::clone(&llm),
        Arc::clone(&tts),
        Arc::clone(&search),
    );

    for _ in 0..frames {
        pipeline.bus.ingest(AudioFrame::new(vec![0.1f32; FRAME]));
    }
    wait_for_listening(&pipeline.state).await;

    // Exactly one transcription and one spoken reply.
    assert_eq!(stt.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*tts.spoken.lock().unwrap(), vec!["Paris.".to_string()]);
    let played = playback.played.lock().unwrap();
    assert_eq!(played.len(), 1);
    assert_eq!(played[0], b"AUDIO:Paris.".to_vec());

    // "what's the capital of France" must not trigger augmentation.
    assert!(search.queries.lock().unwrap().is_empty());
    assert!(llm.grounded_calls.lock().unwrap().is_empty());
    let plain = llm.plain_calls.lock().unwrap();
    assert_eq!(plain.len(), 1);
    let last = plain[0].last().unwrap();
    assert!(last.content.contains("what's the capital of France"));

    // Self-capture prevention: paused for the whole playback call, resumed
    // after, and the frames injected mid-playback were never dispatched.
    assert!(playback.was_paused_during_playback.load(Ordering::SeqCst));
    assert!(playback.paused_after_return.load(Ordering::SeqCst));
    assert!(!pipeline.bus.is_paused());
    assert_eq!(pipeline.dispatched.load(Ordering::SeqCst), frames);

    assert_eq!(pipeline.state.state(), ConversationState::Listening);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn augmented_turn_grounds_the_answer_in_fetched_context() {
    let stt = Arc::new(FakeStt {
        transcript: "who is Ada Lovelace".to_string(),
        calls: AtomicUsize::new(0),
    });
    let llm = Arc::new(FakeLlm {
        reply: "An English mathematician.".to_string(),
        ..FakeLlm::default()
    });
    let tts = Arc::new(FakeTts {
        spoken: Mutex::new(Vec::new()),
    });
    let search = Arc::new(FakeSearch {
        queries: Mutex::new(Vec::new()),
        results: vec![SearchResult {
            title: "Ada Lovelace".to_string(),
            url: "https://example.com/ada".to_string(),
            snippet: "mathematician".to_string(),
        }],
        page_body: format!("Ada Lovelace biography. {}", "detail ".repeat(60)),
    });

    let (script, frames) = speech_then_silence();
    let (pipeline, _playback) = build_pipeline(
        script,
        Arc::clone(&stt),
        Arc::clone(&llm),
        Arc::clone(&tts),
        Arc::clone(&search),
    );

    for _ in 0..frames {
        pipeline.bus.ingest(AudioFrame::new(vec![0.1f32; FRAME]));
    }
    wait_for_listening(&pipeline.state).await;

    // The lead-in phrase is stripped to form the query.
    assert_eq!(*search.queries.lock().unwrap(), vec!["ada lovelace"]);

    // The grounded path carried the original question plus fetched content.
    let grounded = llm.grounded_calls.lock().unwrap();
    assert_eq!(grounded.len(), 1);
    let (question, context) = &grounded[0];
    assert_eq!(question, "who is Ada Lovelace");
    assert!(context.contains("SOURCE 1"));
    assert!(context.contains("Ada Lovelace biography."));
    assert!(llm.plain_calls.lock().unwrap().is_empty());

    assert_eq!(
        *tts.spoken.lock().unwrap(),
        vec!["An English mathematician.".to_string()]
    );
    assert_eq!(pipeline.state.state(), ConversationState::Listening);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_transcript_rearms_without_thinking_or_speaking() {
    let stt = Arc::new(FakeStt {
        transcript: "Thank you.".to_string(), // hallucination: filters to empty
        calls: AtomicUsize::new(0),
    });
    let llm = Arc::new(FakeLlm {
        reply: "never spoken".to_string(),
        ..FakeLlm::default()
    });
    let tts = Arc::new(FakeTts {
        spoken: Mutex::new(Vec::new()),
    });
    let search = Arc::new(FakeSearch {
        queries: Mutex::new(Vec::new()),
        results: Vec::new(),
        page_body: String::new(),
    });

    let (script, frames) = speech_then_silence();
    let (pipeline, playback) = build_pipeline(
        script,
        Arc::clone(&stt),
        Arc::clone(&llm),
        Arc::clone(&tts),
        Arc::clone(&search),
    );

    for _ in 0..frames {
        pipeline.bus.ingest(AudioFrame::new(vec![0.1f32; FRAME]));
    }
    wait_for_listening(&pipeline.state).await;

    assert_eq!(stt.calls.load(Ordering::SeqCst), 1);
    assert!(llm.plain_calls.lock().unwrap().is_empty());
    assert!(llm.grounded_calls.lock().unwrap().is_empty());
    assert!(tts.spoken.lock().unwrap().is_empty());
    assert!(playback.played.lock().unwrap().is_empty());
    assert_eq!(pipeline.state.state(), ConversationState::Listening);
}

struct FailingLlm;

impl LlmBackend for FailingLlm {
    fn generate(&self, _messages: &[ChatMessage]) -> VoiceResult<String> {
        Err(sotto_voice::VoiceError::Llm("inference exploded".to_string()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generation_failure_speaks_the_apology_and_rearms() {
    let stt = Arc::new(FakeStt {
        transcript: "how do magnets work".to_string(),
        calls: AtomicUsize::new(0),
    });
    let tts = Arc::new(FakeTts {
        spoken: Mutex::new(Vec::new()),
    });
    let search = Arc::new(FakeSearch {
        queries: Mutex::new(Vec::new()),
        results: Vec::new(),
        page_body: String::new(),
    });

    let bus = Arc::new(FrameBus::new(8000));
    let state = Arc::new(TurnStateMachine::new());
    state.transition(ConversationState::Listening).unwrap();

    let (script, frames) = speech_then_silence();
    let detector = VoiceActivityDetector::new(Box::new(ScriptedScorer::new(script)), 0.5);
    let (utterance_tx, utterance_rx) = mpsc::unbounded_channel();
    let segmentation = Arc::new(Mutex::new(SegmentationController::new(
        SegmentationConfig {
            sample_rate: RATE,
            silence_timeout: Duration::from_millis(1500),
        },
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

    let playback = Arc::new(InjectingPlayback {
        bus: Arc::clone(&bus),
        played: Mutex::new(Vec::new()),
        was_paused_during_playback: AtomicBool::new(false),
        paused_after_return: AtomicBool::new(false),
    });

    let orchestrator = TurnOrchestrator::new(
        Arc::clone(&state),
        Arc::clone(&bus),
        segmentation,
        Arc::clone(&stt) as Arc<dyn SttBackend>,
        Arc::new(FailingLlm),
        Arc::clone(&tts) as Arc<dyn TtsBackend>,
        Arc::clone(&playback) as Arc<dyn PlaybackBackend>,
        Arc::new(SearchContextAggregator::new(search as Arc<dyn SearchClient>)),
        AugmentPolicy::default(),
        utterance_rx,
    );
    tokio::spawn(orchestrator.run());

    for _ in 0..frames {
        bus.ingest(AudioFrame::new(vec![0.1f32; FRAME]));
    }
    wait_for_listening(&state).await;

    assert_eq!(
        *tts.spoken.lock().unwrap(),
        vec![sotto_voice::APOLOGY.to_string()]
    );
    assert_eq!(playback.played.lock().unwrap().len(), 1);
    assert_eq!(state.state(), ConversationState::Listening);
}
