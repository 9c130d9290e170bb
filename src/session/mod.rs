// src/session/mod.rs
//! Device session: discovery, activation and run control
//!
//! A [`Session`] owns the USB backend context for its lifetime, the records
//! of every probed device, the background I/O thread and the notifier
//! thread. All methods take `&self`, so a session can be shared behind an
//! `Arc` and cancelled from any thread while another thread blocks in
//! [`Session::run`].

pub mod completion;
mod discovery;
pub mod events;
pub mod registry;
pub mod run;
pub mod worker;

pub use completion::{CompletionTracker, RunOutcome};
pub use events::{CompletionCallback, HotplugCallback, ProgressCallback, SessionEvent};
pub use registry::DeviceState;
pub use run::RunContext;

use crate::config::SessionConfig;
use crate::error::{SmuError, SmuResult, UsbError};
use crate::hal::{Device, DeviceDriver, HotplugHandler, SmuDriver, UsbBackend};
use discovery::Discovery;
use events::EventDispatcher;
use parking_lot::Mutex;
use run::RunShared;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use worker::UsbWorker;

pub struct Session {
    backend: Arc<dyn UsbBackend>,
    config: SessionConfig,
    discovery: Arc<Discovery>,
    tracker: Arc<CompletionTracker>,
    current_run: Mutex<Option<Arc<RunShared>>>,
    worker: UsbWorker,
    events: EventDispatcher,
}

impl Session {
    /// Create the backend context and a session with the built-in SMU driver.
    pub fn new(backend: Arc<dyn UsbBackend>, config: SessionConfig) -> SmuResult<Self> {
        let driver = SmuDriver::new(config.supported_devices.clone());
        Self::with_drivers(backend, config, vec![Arc::new(driver)])
    }

    pub fn with_drivers(
        backend: Arc<dyn UsbBackend>,
        config: SessionConfig,
        drivers: Vec<Arc<dyn DeviceDriver>>,
    ) -> SmuResult<Self> {
        config.validate()?;

        backend.init().map_err(|e| {
            error!(error = %e, "usb context creation failed");
            SmuError::Backend(e)
        })?;

        let events = match EventDispatcher::spawn(config.event_queue_capacity) {
            Ok(events) => events,
            Err(e) => {
                backend.exit();
                return Err(e);
            }
        };

        let driver_count = drivers.len();
        let discovery = Arc::new(Discovery::new(backend.clone(), drivers));

        let handler: HotplugHandler = Arc::new(discovery::hotplug_handler(&discovery, events.sender()));
        match backend.set_hotplug_handler(Some(handler)) {
            Ok(()) => debug!("hotplug notices enabled"),
            Err(UsbError::NotSupported) => {
                debug!("backend has no hotplug support, only enumerated devices are used")
            }
            Err(e) => warn!(error = %e, "hotplug registration failed"),
        }

        info!(
            drivers = driver_count,
            sample_rate_hz = config.sample_rate_hz,
            "session created"
        );

        Ok(Self {
            worker: UsbWorker::new(backend.clone(), config.poll_interval()),
            backend,
            config,
            discovery,
            tracker: Arc::new(CompletionTracker::new()),
            current_run: Mutex::new(None),
            events,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn register_driver(&self, driver: Arc<dyn DeviceDriver>) {
        debug!(driver = driver.name(), "driver registered");
        self.discovery.register_driver(driver);
    }

    /// Enumerate the bus, probe new devices and forget vanished ones.
    /// Returns the number of supported devices currently present.
    pub fn update_available_devices(&self) -> SmuResult<usize> {
        self.ensure_idle()?;
        self.discovery.rescan()
    }

    pub fn available_devices(&self) -> Vec<Arc<dyn Device>> {
        self.discovery.registry().available()
    }

    pub fn active_devices(&self) -> Vec<Arc<dyn Device>> {
        self.discovery.registry().active()
    }

    pub fn device_state(&self, device: &Arc<dyn Device>) -> Option<DeviceState> {
        self.discovery.registry().state(device.usb_device())
    }

    /// Active device with the given serial number
    pub fn get_device(&self, serial: &str) -> Option<Arc<dyn Device>> {
        self.discovery.registry().active_by_serial(serial)
    }

    pub fn add_device(&self, device: &Arc<dyn Device>) -> SmuResult<()> {
        self.ensure_idle()?;
        let usb_device = device.usb_device();
        let mut registry = self.discovery.registry();

        match registry.state(usb_device) {
            Some(DeviceState::Available) => {}
            Some(DeviceState::Active) => return Err(SmuError::DeviceAlreadyActive(device.serial().to_string())),
            None => return Err(SmuError::DeviceNotAvailable(device.serial().to_string())),
        }

        device.added().map_err(|e| SmuError::device(device.serial(), e))?;
        registry.set_state(usb_device, DeviceState::Active);
        info!(serial = %device.serial(), "device added");
        Ok(())
    }

    pub fn remove_device(&self, device: &Arc<dyn Device>) -> SmuResult<()> {
        self.ensure_idle()?;
        let usb_device = device.usb_device();
        let mut registry = self.discovery.registry();

        if registry.state(usb_device) != Some(DeviceState::Active) {
            return Err(SmuError::DeviceNotAvailable(device.serial().to_string()));
        }

        let released = device.removed();
        registry.set_state(usb_device, DeviceState::Available);
        info!(serial = %device.serial(), "device removed");
        released.map_err(|e| SmuError::device(device.serial(), e))
    }

    /// Apply a sample rate to every active device. Devices that reject it
    /// are reported and the rest keep going.
    pub fn configure(&self, sample_rate: u64) -> Vec<SmuError> {
        let mut failures = Vec::new();
        for device in self.active_devices() {
            match device.configure(sample_rate) {
                Ok(actual) => debug!(serial = %device.serial(), requested = sample_rate, actual, "configured"),
                Err(e) => {
                    warn!(serial = %device.serial(), error = %e, "configure failed");
                    failures.push(SmuError::device(device.serial(), e));
                }
            }
        }
        failures
    }

    pub fn set_progress_callback<F>(&self, callback: F)
    where
        F: FnMut(u64) + Send + 'static,
    {
        self.events.set_progress_callback(Some(Box::new(callback)));
    }

    pub fn set_completion_callback<F>(&self, callback: F)
    where
        F: FnMut(&RunOutcome) + Send + 'static,
    {
        self.events.set_completion_callback(Some(Box::new(callback)));
    }

    /// Called on the notifier thread after a hotplugged device was probed
    /// and joined the available set.
    pub fn set_hotplug_attach_callback<F>(&self, callback: F)
    where
        F: FnMut(&Arc<dyn Device>) + Send + 'static,
    {
        self.events.set_attach_callback(Some(Box::new(callback)));
    }

    /// Called on the notifier thread when a known device leaves the bus.
    /// An available device is forgotten first; an active one stays active.
    pub fn set_hotplug_detach_callback<F>(&self, callback: F)
    where
        F: FnMut(&Arc<dyn Device>) + Send + 'static,
    {
        self.events.set_detach_callback(Some(Box::new(callback)));
    }

    pub fn clear_callbacks(&self) {
        self.events.set_progress_callback(None);
        self.events.set_completion_callback(None);
        self.events.set_attach_callback(None);
        self.events.set_detach_callback(None);
    }

    /// Power on every active device and start a run of `nsamples`
    /// (0 = until cancelled) without waiting for it.
    pub fn start(&self, nsamples: u64) -> SmuResult<()> {
        self.ensure_idle()?;
        let devices = self.active_devices();
        if devices.is_empty() {
            return Err(SmuError::NoDevices);
        }

        self.worker.start()?;

        // one extra count held until every device has been launched
        let generation = self
            .tracker
            .try_begin(devices.len() + 1)
            .ok_or(SmuError::RunInProgress)?;
        let shared = Arc::new(RunShared::new(
            generation,
            nsamples,
            devices,
            self.tracker.clone(),
            self.events.sender(),
        ));
        *self.current_run.lock() = Some(shared.clone());

        info!(generation, nsamples, devices = shared.devices().len(), "run started");

        for (slot, device) in shared.devices().iter().enumerate() {
            let ctx = RunContext::new(shared.clone(), slot);
            if shared.is_cancelled() {
                shared.idle_slot(slot);
                continue;
            }
            let started = device.on().and_then(|()| device.start_run(nsamples, ctx));
            if let Err(e) = started {
                error!(serial = %device.serial(), error = %e, "device failed to start");
                shared.idle_slot(slot);
                shared.fail(slot, e);
            }
        }

        shared.complete();
        Ok(())
    }

    pub fn run_nonblocking(&self, nsamples: u64) -> SmuResult<()> {
        self.start(nsamples)
    }

    /// Wait for the run started by [`start`](Self::start), bounded by
    /// `completion_timeout_ms`, then power the devices off.
    pub fn end(&self) -> SmuResult<RunOutcome> {
        let outcome = self.tracker.wait(self.config.completion_timeout());
        if outcome == RunOutcome::TimedOut {
            warn!(timeout = ?self.config.completion_timeout(), "run did not complete in time, cancelling");
            self.abort(RunOutcome::TimedOut);
        }

        for device in self.active_devices() {
            if let Err(e) = device.off() {
                warn!(serial = %device.serial(), error = %e, "power off failed");
            }
        }
        self.current_run.lock().take();

        info!(?outcome, "run ended");
        Ok(outcome)
    }

    /// Blocking run: [`start`](Self::start) followed by [`end`](Self::end).
    pub fn run(&self, nsamples: u64) -> SmuResult<RunOutcome> {
        self.start(nsamples)?;
        self.end()
    }

    /// Wait for the current run without powering anything off.
    /// `None` waits forever.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> RunOutcome {
        self.tracker.wait(timeout)
    }

    /// Abort the current run and stop the I/O thread. Safe from any thread,
    /// including sink callbacks on the I/O thread.
    pub fn cancel(&self) {
        info!("cancel requested");
        self.abort(RunOutcome::Cancelled);
    }

    fn abort(&self, outcome: RunOutcome) {
        let run = self.current_run.lock().clone();
        if let Some(run) = &run {
            run.mark_cancelled();
            for device in run.devices() {
                if let Err(e) = device.cancel() {
                    warn!(serial = %device.serial(), error = %e, "device cancel failed");
                }
            }
        }

        if let Some(outcome) = self.tracker.abort(outcome) {
            self.events.sender().run_finished(outcome);
        }
        self.worker.stop();
    }

    /// Count one device completion for the current run. Surplus calls are
    /// ignored; the waiting caller is signalled once.
    pub fn completion(&self) {
        if let Some(outcome) = self.tracker.complete_current() {
            debug!(?outcome, "run finished by external completion");
            self.events.sender().run_finished(outcome);
        }
    }

    pub fn is_running(&self) -> bool {
        self.tracker.is_running()
    }

    /// Progress events dropped because the notification queue was full
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    fn ensure_idle(&self) -> SmuResult<()> {
        if self.tracker.is_running() {
            return Err(SmuError::RunInProgress);
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.backend.set_hotplug_handler(None) {
            if e != UsbError::NotSupported {
                debug!(error = %e, "hotplug deregistration failed");
            }
        }
        self.abort(RunOutcome::Cancelled);
        self.current_run.lock().take();

        for (device, state) in self.discovery.registry().take_all() {
            if state == DeviceState::Active {
                if let Err(e) = device.removed() {
                    debug!(serial = %device.serial(), error = %e, "removed() failed during teardown");
                }
            }
        }

        self.events.shutdown();
        self.backend.exit();
        debug!("session closed");
    }
}
