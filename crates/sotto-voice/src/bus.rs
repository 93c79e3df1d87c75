//! Frame fan-out, pre-roll retention, and the self-capture gate.
//!
//! The capture callback pushes every frame through [`FrameBus::ingest`].
//! Subscribers receive frames only while the gate is open; the orchestrator
//! closes it around playback so the pipeline never transcribes its own voice.
//! The pre-roll ring keeps updating regardless, so speech-onset context
//! survives a pause.

use crate::audio::AudioFrame;
use crate::error::VoiceResult;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

/// Fixed-capacity circular buffer over the most recent samples.
///
/// Writes wrap modulo capacity; the oldest data is silently overwritten.
#[derive(Debug)]
pub struct RingPreroll {
    buf: Vec<f32>,
    pos: usize,
}

impl RingPreroll {
    /// `capacity` is in samples and must be non-zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "pre-roll capacity must be non-zero");
        Self {
            buf: vec![0.0; capacity],
            pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Append samples, overwriting the oldest data on wrap. A chunk larger
    /// than the whole ring keeps only its tail.
    pub fn write(&mut self, samples: &[f32]) {
        let cap = self.buf.len();
        if samples.len() >= cap {
            self.buf.copy_from_slice(&samples[samples.len() - cap..]);
            self.pos = 0;
            return;
        }
        let space = cap - self.pos;
        if samples.len() <= space {
            self.buf[self.pos..self.pos + samples.len()].copy_from_slice(samples);
            self.pos += samples.len();
        } else {
            self.buf[self.pos..].copy_from_slice(&samples[..space]);
            let rest = samples.len() - space;
            self.buf[..rest].copy_from_slice(&samples[space..]);
            self.pos = rest;
        }
        if self.pos >= cap {
            self.pos = 0;
        }
    }

    /// Copy of the ring in oldest-to-newest order, always exactly
    /// `capacity()` samples (zero-padded until the ring has filled once).
    pub fn snapshot(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(&self.buf[self.pos..]);
        out.extend_from_slice(&self.buf[..self.pos]);
        out
    }
}

/// A registered frame consumer. Errors are logged per handler and never stop
/// dispatch to the remaining subscribers.
pub type FrameHandler = Box<dyn FnMut(&AudioFrame) -> VoiceResult<()> + Send>;

struct Gate {
    paused: bool,
    preroll: RingPreroll,
}

/// Owns the live frame feed: updates the pre-roll ring, applies the
/// pause/resume gate, and fans frames out to subscribers.
pub struct FrameBus {
    gate: Mutex<Gate>,
    subscribers: Mutex<Vec<FrameHandler>>,
}

impl FrameBus {
    /// `preroll_capacity` is the ring size in samples (500ms worth for the
    /// default pipeline).
    pub fn new(preroll_capacity: usize) -> Self {
        Self {
            gate: Mutex::new(Gate {
                paused: false,
                preroll: RingPreroll::new(preroll_capacity),
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a frame consumer.
    pub fn subscribe(&self, handler: impl FnMut(&AudioFrame) -> VoiceResult<()> + Send + 'static) {
        lock(&self.subscribers).push(Box::new(handler));
    }

    /// Close the gate: frames keep feeding the pre-roll ring but are not
    /// dispatched. Called before playback starts.
    pub fn pause(&self) {
        lock(&self.gate).paused = true;
        info!("frame bus paused");
    }

    /// Reopen the gate. Called after playback completes.
    pub fn resume(&self) {
        lock(&self.gate).paused = false;
        info!("frame bus resumed");
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.gate).paused
    }

    /// Copy of the pre-roll ring (never a reference; concurrent writes would
    /// tear one).
    pub fn get_preroll(&self) -> Vec<f32> {
        lock(&self.gate).preroll.snapshot()
    }

    /// Called once per frame from the capture path. The gate lock is held
    /// only for the ring update and the pause check; dispatch runs outside
    /// it so a slow subscriber cannot block capture state.
    pub fn ingest(&self, frame: AudioFrame) {
        let paused = {
            let mut gate = lock(&self.gate);
            gate.preroll.write(&frame.samples);
            gate.paused
        };
        if paused {
            return;
        }

        let mut subscribers = lock(&self.subscribers);
        for handler in subscribers.iter_mut() {
            match catch_unwind(AssertUnwindSafe(|| handler(&frame))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("frame subscriber error: {e}"),
                Err(_) => warn!("frame subscriber panicked, continuing dispatch"),
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
