// src/session/events.rs
//! Notification thread for user callbacks
//!
//! The I/O thread never calls user code other than signal sinks. It posts
//! [`SessionEvent`]s to a dedicated notifier thread, which invokes the
//! progress, completion and hotplug callbacks.
//!
//! Progress travels over a bounded queue and is dropped when the queue is
//! full. Run-finished, hotplug and shutdown notices travel over a separate
//! unbounded queue, so posting them never blocks, even from a callback
//! running on the notifier thread itself.

use crate::error::SmuError;
use crate::hal::Device;
use crate::session::RunOutcome;
use crossbeam::channel::{bounded, select, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// Invoked with the cumulative sample count every device has reached
pub type ProgressCallback = Box<dyn FnMut(u64) + Send>;

/// Invoked once per run after the last device completes
pub type CompletionCallback = Box<dyn FnMut(&RunOutcome) + Send>;

/// Invoked when a supported device is attached to or detached from the bus
pub type HotplugCallback = Box<dyn FnMut(&Arc<dyn Device>) + Send>;

#[derive(Clone)]
pub enum SessionEvent {
    Progress(u64),
    RunFinished(RunOutcome),
    DeviceAttached(Arc<dyn Device>),
    DeviceDetached(Arc<dyn Device>),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Progress(samples) => f.debug_tuple("Progress").field(samples).finish(),
            SessionEvent::RunFinished(outcome) => f.debug_tuple("RunFinished").field(outcome).finish(),
            SessionEvent::DeviceAttached(device) => f.debug_tuple("DeviceAttached").field(&device.serial()).finish(),
            SessionEvent::DeviceDetached(device) => f.debug_tuple("DeviceDetached").field(&device.serial()).finish(),
        }
    }
}

enum Notice {
    Event(SessionEvent),
    Shutdown,
}

type Slot<T> = Mutex<Option<Arc<Mutex<T>>>>;

/// Registered callbacks. Each one is cloned out of its slot before it is
/// called, so user code never runs under the slot lock and may replace or
/// clear callbacks, or cancel the session, from inside a callback.
#[derive(Default)]
struct Callbacks {
    progress: Slot<ProgressCallback>,
    completion: Slot<CompletionCallback>,
    attach: Slot<HotplugCallback>,
    detach: Slot<HotplugCallback>,
}

fn current<T>(slot: &Slot<T>) -> Option<Arc<Mutex<T>>> {
    slot.lock().clone()
}

impl Callbacks {
    fn dispatch(&self, event: SessionEvent) {
        match event {
            SessionEvent::Progress(samples) => {
                if let Some(cb) = current(&self.progress) {
                    let mut callback = cb.lock();
                    (*callback)(samples);
                }
            }
            SessionEvent::RunFinished(outcome) => {
                if let Some(cb) = current(&self.completion) {
                    let mut callback = cb.lock();
                    (*callback)(&outcome);
                }
            }
            SessionEvent::DeviceAttached(device) => {
                if let Some(cb) = current(&self.attach) {
                    let mut callback = cb.lock();
                    (*callback)(&device);
                }
            }
            SessionEvent::DeviceDetached(device) => {
                if let Some(cb) = current(&self.detach) {
                    let mut callback = cb.lock();
                    (*callback)(&device);
                }
            }
        }
    }
}

/// Producer side, cloned into every run and into the hotplug handler
#[derive(Clone)]
pub struct EventSender {
    progress: Sender<u64>,
    notices: Sender<Notice>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Non-blocking; the event is dropped if the queue is full.
    pub fn progress(&self, samples: u64) {
        match self.progress.try_send(samples) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(samples, "event queue full, progress dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Non-blocking and never dropped while the notifier runs.
    pub fn run_finished(&self, outcome: RunOutcome) {
        self.notice(SessionEvent::RunFinished(outcome));
    }

    pub fn device_attached(&self, device: Arc<dyn Device>) {
        self.notice(SessionEvent::DeviceAttached(device));
    }

    pub fn device_detached(&self, device: Arc<dyn Device>) {
        self.notice(SessionEvent::DeviceDetached(device));
    }

    fn notice(&self, event: SessionEvent) {
        if self.notices.send(Notice::Event(event)).is_err() {
            debug!("notifier gone, event discarded");
        }
    }
}

/// Owns the notifier thread and the registered callbacks
pub struct EventDispatcher {
    sender: EventSender,
    callbacks: Arc<Callbacks>,
    thread: Option<JoinHandle<()>>,
}

impl EventDispatcher {
    pub fn spawn(capacity: usize) -> Result<Self, SmuError> {
        let (progress_tx, progress_rx) = bounded(capacity);
        let (notice_tx, notice_rx) = unbounded();
        let callbacks = Arc::new(Callbacks::default());

        let thread = thread::Builder::new()
            .name("smu-notify".to_string())
            .spawn({
                let callbacks = callbacks.clone();
                move || notifier_loop(progress_rx, notice_rx, &callbacks)
            })
            .map_err(|source| SmuError::Thread { name: "notifier", source })?;

        Ok(Self {
            sender: EventSender {
                progress: progress_tx,
                notices: notice_tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            callbacks,
            thread: Some(thread),
        })
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Progress events lost to a full queue since the dispatcher started
    pub fn dropped(&self) -> u64 {
        self.sender.dropped.load(Ordering::Relaxed)
    }

    pub fn set_progress_callback(&self, callback: Option<ProgressCallback>) {
        *self.callbacks.progress.lock() = callback.map(|cb| Arc::new(Mutex::new(cb)));
    }

    pub fn set_completion_callback(&self, callback: Option<CompletionCallback>) {
        *self.callbacks.completion.lock() = callback.map(|cb| Arc::new(Mutex::new(cb)));
    }

    pub fn set_attach_callback(&self, callback: Option<HotplugCallback>) {
        *self.callbacks.attach.lock() = callback.map(|cb| Arc::new(Mutex::new(cb)));
    }

    pub fn set_detach_callback(&self, callback: Option<HotplugCallback>) {
        *self.callbacks.detach.lock() = callback.map(|cb| Arc::new(Mutex::new(cb)));
    }

    /// Deliver everything already queued, then stop the notifier thread.
    /// From the notifier thread itself it only requests the stop.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        if self.sender.notices.send(Notice::Shutdown).is_err() {
            return;
        }
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("notifier thread panicked");
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn notifier_loop(progress: Receiver<u64>, notices: Receiver<Notice>, callbacks: &Callbacks) {
    debug!("notifier thread started");
    loop {
        select! {
            recv(progress) -> samples => match samples {
                Ok(samples) => callbacks.dispatch(SessionEvent::Progress(samples)),
                Err(_) => break,
            },
            recv(notices) -> notice => {
                // progress posted before this notice is delivered first
                for samples in progress.try_iter() {
                    callbacks.dispatch(SessionEvent::Progress(samples));
                }
                match notice {
                    Ok(Notice::Event(event)) => callbacks.dispatch(event),
                    Ok(Notice::Shutdown) | Err(_) => break,
                }
            },
        }
    }
    debug!("notifier thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_callbacks_run_on_notifier_thread() {
        let mut dispatcher = EventDispatcher::spawn(16).unwrap();
        let (tx, rx) = crossbeam::channel::unbounded();

        let caller = thread::current().id();
        dispatcher.set_progress_callback(Some(Box::new(move |samples| {
            let name = thread::current().name().map(str::to_string);
            tx.send((samples, name, thread::current().id() != caller)).unwrap();
        })));

        dispatcher.sender().progress(42);
        let (samples, name, other_thread) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(samples, 42);
        assert_eq!(name.as_deref(), Some("smu-notify"));
        assert!(other_thread);
        dispatcher.shutdown();
    }

    #[test]
    fn test_shutdown_flushes_queue() {
        let mut dispatcher = EventDispatcher::spawn(16).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            dispatcher.set_progress_callback(Some(Box::new(move |samples| {
                seen.lock().push(format!("progress {samples}"));
            })));
        }
        {
            let seen = seen.clone();
            dispatcher.set_completion_callback(Some(Box::new(move |outcome| {
                seen.lock().push(format!("finished {outcome:?}"));
            })));
        }

        let sender = dispatcher.sender();
        sender.progress(1);
        sender.progress(2);
        sender.run_finished(RunOutcome::Cancelled);
        dispatcher.shutdown();
        assert_eq!(*seen.lock(), vec!["progress 1", "progress 2", "finished Cancelled"]);
    }

    #[test]
    fn test_full_queue_drops_progress_but_not_run_finished() {
        let mut dispatcher = EventDispatcher::spawn(1).unwrap();
        let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(0);
        dispatcher.set_progress_callback(Some(Box::new(move |_| {
            let _ = release_rx.recv_timeout(Duration::from_secs(1));
        })));
        let (done_tx, done_rx) = crossbeam::channel::unbounded();
        dispatcher.set_completion_callback(Some(Box::new(move |outcome| {
            let _ = done_tx.send(outcome.clone());
        })));

        let sender = dispatcher.sender();
        for i in 0..10 {
            sender.progress(i);
        }
        assert!(dispatcher.dropped() > 0);
        // queue is full, yet this returns at once
        sender.run_finished(RunOutcome::Completed);

        drop(release_tx);
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap(), RunOutcome::Completed);
        dispatcher.shutdown();
    }

    #[test]
    fn test_callback_may_replace_callbacks_and_post_events() {
        let mut dispatcher = EventDispatcher::spawn(16).unwrap();
        let sender = dispatcher.sender();
        let callbacks = dispatcher.callbacks.clone();
        let (tx, rx) = crossbeam::channel::unbounded();

        {
            let sender = sender.clone();
            let callbacks = callbacks.clone();
            dispatcher.set_progress_callback(Some(Box::new(move |_| {
                // clearing itself and posting from the notifier must not block
                *callbacks.progress.lock() = None;
                sender.run_finished(RunOutcome::Cancelled);
            })));
        }
        dispatcher.set_completion_callback(Some(Box::new(move |outcome| {
            let _ = tx.send(outcome.clone());
        })));

        sender.progress(1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), RunOutcome::Cancelled);
        assert!(callbacks.progress.lock().is_none());
        dispatcher.shutdown();
    }
}
