//! Conversation phase tracking.
//!
//! A fixed transition table is the single source of truth for what phase the
//! conversation is in. Illegal edges are rejected without mutating state;
//! per-edge callbacks fire synchronously after a commit and cannot roll one
//! back.

use crate::error::{VoiceError, VoiceResult};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};

/// Conversation phases. Exactly one value is live at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationState {
    Idle,
    Listening,
    Recording,
    Processing,
    Thinking,
    Speaking,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConversationState::Idle => "Idle",
            ConversationState::Listening => "Listening",
            ConversationState::Recording => "Recording",
            ConversationState::Processing => "Processing",
            ConversationState::Thinking => "Thinking",
            ConversationState::Speaking => "Speaking",
        };
        f.write_str(name)
    }
}

/// The only legal edges.
fn is_valid_transition(from: ConversationState, to: ConversationState) -> bool {
    use ConversationState::*;
    matches!(
        (from, to),
        (Idle, Listening)
            | (Listening, Recording)
            | (Listening, Idle)
            | (Recording, Processing)
            | (Recording, Idle)
            | (Processing, Thinking)
            | (Processing, Listening)
            | (Processing, Idle)
            | (Thinking, Speaking)
            | (Thinking, Idle)
            | (Speaking, Idle)
            | (Speaking, Listening)
    )
}

type EdgeCallback = Arc<dyn Fn() + Send + Sync>;
type EdgeKey = (ConversationState, ConversationState);

/// Thread-safe finite-state machine over [`ConversationState`].
pub struct TurnStateMachine {
    current: Mutex<ConversationState>,
    callbacks: Mutex<HashMap<EdgeKey, Vec<EdgeCallback>>>,
}

impl Default for TurnStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnStateMachine {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(ConversationState::Idle),
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Point-in-time snapshot of the current phase (not a subscription).
    pub fn state(&self) -> ConversationState {
        *lock(&self.current)
    }

    /// Attempt an edge. An edge outside the table is rejected, logged, and
    /// leaves state untouched; the caller decides what to do next. Callbacks
    /// for a committed edge fire after the state lock is released.
    pub fn transition(&self, to: ConversationState) -> VoiceResult<()> {
        let from = {
            let mut current = lock(&self.current);
            let from = *current;
            if !is_valid_transition(from, to) {
                warn!("rejected transition: {from} -> {to}");
                return Err(VoiceError::InvalidTransition(format!("{from} -> {to}")));
            }
            *current = to;
            from
        };
        info!("state: {from} -> {to}");
        self.fire_callbacks(from, to);
        Ok(())
    }

    /// Register a callback for one `(from, to)` edge. Callbacks on the same
    /// edge fire in registration order.
    pub fn on_transition(
        &self,
        from: ConversationState,
        to: ConversationState,
        callback: impl Fn() + Send + Sync + 'static,
    ) {
        lock(&self.callbacks)
            .entry((from, to))
            .or_default()
            .push(Arc::new(callback));
    }

    /// Force state to Idle unconditionally (error recovery).
    pub fn reset(&self) {
        *lock(&self.current) = ConversationState::Idle;
        info!("state: reset -> Idle");
    }

    fn fire_callbacks(&self, from: ConversationState, to: ConversationState) {
        let to_fire: Vec<EdgeCallback> = lock(&self.callbacks)
            .get(&(from, to))
            .map(|list| list.to_vec())
            .unwrap_or_default();
        for callback in to_fire {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                error!("transition callback panicked ({from} -> {to})");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
