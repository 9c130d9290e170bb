// src/session/completion.rs
//! Run completion synchronization
//!
//! Every run gets a generation number. Device completions carry the
//! generation they were started with, so a late completion from an earlier
//! run never touches the current one. The remaining count is clamped at zero
//! and the waiting caller is signalled exactly once per generation.

use crate::error::DeviceError;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every device finished its samples
    Completed,
    /// `cancel()` ended the run
    Cancelled,
    /// A device failed; the first reported error
    Failed(DeviceError),
    /// The caller stopped waiting before every device finished
    TimedOut,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled)
    }
}

#[derive(Debug, Default)]
struct State {
    generation: u64,
    remaining: usize,
    error: Option<DeviceError>,
    outcome: Option<RunOutcome>,
}

impl State {
    fn finish(&mut self, forced: Option<RunOutcome>) -> RunOutcome {
        self.remaining = 0;
        let outcome = match (self.error.clone(), forced) {
            (Some(err), _) => RunOutcome::Failed(err),
            (None, Some(forced)) => forced,
            (None, None) => RunOutcome::Completed,
        };
        self.outcome = Some(outcome.clone());
        outcome
    }
}

/// Active-device counter with a condition variable for the waiting caller
#[derive(Debug, Default)]
pub struct CompletionTracker {
    state: Mutex<State>,
    finished: Condvar,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation expecting `count` completions.
    pub fn begin(&self, count: usize) -> u64 {
        let mut state = self.state.lock();
        self.reset(&mut state, count)
    }

    /// [`begin`](Self::begin) unless a run is live, checked under the same
    /// lock. Returns `None` while the previous run still has completions due.
    pub fn try_begin(&self, count: usize) -> Option<u64> {
        let mut state = self.state.lock();
        if state.remaining > 0 {
            return None;
        }
        Some(self.reset(&mut state, count))
    }

    fn reset(&self, state: &mut State, count: usize) -> u64 {
        state.generation += 1;
        state.error = None;
        state.outcome = None;
        state.remaining = count;
        if count == 0 {
            state.finish(None);
            self.finished.notify_all();
        }
        state.generation
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().remaining > 0
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().remaining
    }

    /// Record one completion for `generation`. Returns the outcome if this
    /// call finished the run; stale or surplus calls return `None`.
    pub fn complete(&self, generation: u64) -> Option<RunOutcome> {
        let mut state = self.state.lock();
        if state.generation != generation || state.remaining == 0 {
            return None;
        }

        state.remaining -= 1;
        if state.remaining > 0 {
            return None;
        }

        let outcome = state.finish(None);
        self.finished.notify_all();
        Some(outcome)
    }

    /// [`complete`](Self::complete) against the current generation
    pub fn complete_current(&self) -> Option<RunOutcome> {
        let generation = self.generation();
        self.complete(generation)
    }

    /// Record a failure. Returns `true` for the first error of a live run.
    pub fn fail(&self, generation: u64, error: DeviceError) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || state.remaining == 0 || state.error.is_some() {
            return false;
        }
        state.error = Some(error);
        true
    }

    /// Force the counter to zero. Returns the outcome if a run was live.
    pub fn abort(&self, outcome: RunOutcome) -> Option<RunOutcome> {
        let mut state = self.state.lock();
        if state.remaining == 0 {
            return None;
        }
        let outcome = state.finish(Some(outcome));
        self.finished.notify_all();
        Some(outcome)
    }

    /// Block until the current run finishes or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> RunOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        while state.remaining > 0 {
            match deadline {
                Some(deadline) => {
                    if self.finished.wait_until(&mut state, deadline).timed_out() && state.remaining > 0 {
                        return RunOutcome::TimedOut;
                    }
                }
                None => self.finished.wait(&mut state),
            }
        }

        state.outcome.clone().unwrap_or(RunOutcome::Completed)
    }
}
