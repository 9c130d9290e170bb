// src/session/run.rs
//! Per-run state shared between the session and its devices

use crate::error::DeviceError;
use crate::hal::Device;
use crate::session::completion::CompletionTracker;
use crate::session::events::EventSender;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Marks a device slot that never started and must not hold back progress.
const SLOT_IDLE: u64 = u64::MAX;

pub(crate) struct RunShared {
    generation: u64,
    nsamples: u64,
    devices: Vec<Arc<dyn Device>>,
    cancelled: AtomicBool,
    progress: Box<[AtomicU64]>,
    reported: AtomicU64,
    tracker: Arc<CompletionTracker>,
    events: EventSender,
}

impl RunShared {
    pub(crate) fn new(
        generation: u64,
        nsamples: u64,
        devices: Vec<Arc<dyn Device>>,
        tracker: Arc<CompletionTracker>,
        events: EventSender,
    ) -> Self {
        let progress = devices.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            generation,
            nsamples,
            devices,
            cancelled: AtomicBool::new(false),
            progress,
            reported: AtomicU64::new(0),
            tracker,
            events,
        }
    }

    pub(crate) fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Minimum across started devices; reported only when it grows.
    pub(crate) fn update_progress(&self, slot: usize, samples: u64) {
        if let Some(counter) = self.progress.get(slot) {
            counter.store(samples, Ordering::Release);
        }

        let Some(min) = self
            .progress
            .iter()
            .map(|p| p.load(Ordering::Acquire))
            .filter(|&p| p != SLOT_IDLE)
            .min()
        else {
            return;
        };

        if min > self.reported.fetch_max(min, Ordering::AcqRel) {
            self.events.progress(min);
        }
    }

    /// Exclude a slot from progress, e.g. a device that failed to start.
    pub(crate) fn idle_slot(&self, slot: usize) {
        if let Some(counter) = self.progress.get(slot) {
            counter.store(SLOT_IDLE, Ordering::Release);
        }
    }

    /// Record a device failure. The first one cancels every other device.
    pub(crate) fn fail(&self, slot: usize, error: DeviceError) {
        if matches!(&error, DeviceError::Transfer(e) if e.is_cancellation()) {
            return;
        }
        if !self.tracker.fail(self.generation, error.clone()) {
            debug!(slot, %error, "additional device error ignored");
            return;
        }

        warn!(slot, %error, "device failed, cancelling run");
        self.mark_cancelled();
        for (i, device) in self.devices.iter().enumerate() {
            if i == slot {
                continue;
            }
            if let Err(e) = device.cancel() {
                warn!(serial = %device.serial(), error = %e, "cancel after device failure failed");
            }
        }
    }

    pub(crate) fn complete(&self) {
        if let Some(outcome) = self.tracker.complete(self.generation) {
            debug!(generation = self.generation, ?outcome, "run finished");
            self.events.run_finished(outcome);
        }
    }
}

/// Handle a device reports back through during one run.
///
/// Completion is counted once per context: an explicit
/// [`complete`](Self::complete) or, failing that, dropping the context.
pub struct RunContext {
    shared: Arc<RunShared>,
    slot: usize,
    completed: AtomicBool,
}

impl RunContext {
    pub(crate) fn new(shared: Arc<RunShared>, slot: usize) -> Self {
        Self { shared, slot, completed: AtomicBool::new(false) }
    }

    /// Samples requested for this run; 0 means until cancelled
    pub fn nsamples(&self) -> u64 {
        self.shared.nsamples
    }

    /// Cumulative samples this device has processed
    pub fn report_progress(&self, samples: u64) {
        self.shared.update_progress(self.slot, samples);
    }

    /// A cancelled transfer is ignored; any other error fails the run.
    pub fn report_error(&self, error: impl Into<DeviceError>) {
        self.shared.fail(self.slot, error.into());
    }

    /// The run was cancelled or another device failed
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    pub fn complete(&self) {
        if !self.completed.swap(true, Ordering::AcqRel) {
            self.shared.complete();
        }
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        self.complete();
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("generation", &self.shared.generation)
            .field("slot", &self.slot)
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .finish()
    }
}
