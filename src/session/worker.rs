// src/session/worker.rs
//! Background USB I/O thread
//!
//! The only thread that calls [`UsbBackend::handle_events`], and therefore
//! the only thread on which stream handlers and signal sample callbacks run.

use crate::error::SmuError;
use crate::hal::UsbBackend;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// One spawned loop and the token that keeps it alive. A token is never
/// reused, so a stopped loop cannot be revived by a later `start()`.
struct EventLoop {
    keep_running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Threads {
    active: Option<EventLoop>,
    /// Loop stopped from its own thread; joined before the next spawn.
    detached: Option<JoinHandle<()>>,
}

pub struct UsbWorker {
    backend: Arc<dyn UsbBackend>,
    poll_interval: Duration,
    threads: Mutex<Threads>,
}

impl UsbWorker {
    pub fn new(backend: Arc<dyn UsbBackend>, poll_interval: Duration) -> Self {
        Self {
            backend,
            poll_interval,
            threads: Mutex::new(Threads::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.threads.lock().active.is_some()
    }

    /// Spawn the loop unless it is already running. A loop that stopped
    /// itself is joined first, so at most one loop polls the backend.
    pub fn start(&self) -> Result<(), SmuError> {
        let detached = {
            let mut threads = self.threads.lock();
            if threads.active.is_some() {
                return Ok(());
            }
            threads.detached.take()
        };
        if let Some(previous) = detached {
            if previous.thread().id() == thread::current().id() {
                // restarted from inside the old loop's final pass
                debug!("usb thread restarted from itself");
            } else {
                join(previous);
            }
        }

        let mut threads = self.threads.lock();
        if threads.active.is_some() {
            return Ok(());
        }

        let keep_running = Arc::new(AtomicBool::new(true));
        let backend = self.backend.clone();
        let token = keep_running.clone();
        let poll_interval = self.poll_interval;

        let handle = thread::Builder::new()
            .name("smu-usb".to_string())
            .spawn(move || event_loop(backend.as_ref(), &token, poll_interval))
            .map_err(|source| SmuError::Thread { name: "usb", source })?;

        threads.active = Some(EventLoop { keep_running, handle });
        info!(?poll_interval, "usb thread started");
        Ok(())
    }

    /// Stop the loop and wait for its final drain pass. Called from the
    /// worker thread itself, it clears the token and leaves the join to the
    /// next `start()` or to drop.
    pub fn stop(&self) {
        let mut threads = self.threads.lock();
        let Some(EventLoop { keep_running, handle }) = threads.active.take() else {
            return;
        };
        keep_running.store(false, Ordering::Release);

        if handle.thread().id() == thread::current().id() {
            debug!("usb thread stop requested from itself, detaching");
            threads.detached = Some(handle);
            return;
        }
        drop(threads);
        join(handle);
        info!("usb thread stopped");
    }
}

impl Drop for UsbWorker {
    fn drop(&mut self) {
        self.stop();
        if let Some(detached) = self.threads.get_mut().detached.take() {
            if detached.thread().id() != thread::current().id() {
                join(detached);
            }
        }
    }
}

fn join(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!("usb thread panicked");
    }
}

fn event_loop(backend: &dyn UsbBackend, keep_running: &AtomicBool, poll_interval: Duration) {
    while keep_running.load(Ordering::Acquire) {
        if let Err(e) = backend.handle_events(poll_interval) {
            error!(error = %e, "usb event handling failed");
            thread::sleep(poll_interval);
        }
    }

    // deliver completions of transfers cancelled just before the stop
    if let Err(e) = backend.handle_events(Duration::ZERO) {
        debug!(error = %e, "final usb event pass failed");
    }
}
