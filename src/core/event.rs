//! Scheduler capability consumed by the plugin chain.
//!
//! The engine never blocks: the chain yields by asking the scheduler for an
//! immediate re-entry and finishes by delivering a single completion event to
//! the continuation registered by the state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::context::Transaction;

/// Events exchanged between the plugin chain and its host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Re-entry scheduled by the chain itself.
    Immediate,
    /// The single completion event delivered to the continuation.
    RemapComplete,
}

/// Callback target for chain completion.
pub trait Continuation {
    fn handle_event(&mut self, event: Event, txn: &mut Transaction);
}

/// Cancellation handle for an in-flight plugin chain. Cloned into the chain
/// state; the state machine keeps the other clone and may cancel between
/// schedulings.
#[derive(Clone, Default)]
pub struct Action {
    cancelled: Arc<AtomicBool>,
}

impl Action {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// The one scheduling primitive the engine requires from its host.
pub trait Scheduler {
    /// Queue an immediate re-entry of the yielding chain.
    fn schedule_imm(&mut self);
}

/// Inline cooperative scheduler: re-entries are driven by the caller's loop,
/// so this only has to count them. Used by the checker binary and tests.
#[derive(Default)]
pub struct StepScheduler {
    pub scheduled: usize,
}

impl Scheduler for StepScheduler {
    fn schedule_imm(&mut self) {
        self.scheduled += 1;
    }
}
