// tests/session_integration.rs
//! End-to-end session tests over the simulated loopback bus

use smu_core::config::{SessionConfig, UsbId};
use smu_core::hal::{ChannelMode, SimulatedBus, SimulatedDeviceSpec, SIGNAL_CURRENT, SIGNAL_VOLTAGE};
use smu_core::{Device, DeviceError, RunOutcome, Session, SmuError, UsbError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const M1K: UsbId = UsbId::new(0x0456, 0xcee2);
const ALT: UsbId = UsbId::new(0x064b, 0x784c);

fn session(specs: Vec<SimulatedDeviceSpec>) -> (SimulatedBus, Session) {
    let bus = SimulatedBus::with_devices(specs);
    let session = Session::new(Arc::new(bus.clone()), SessionConfig::default()).expect("Failed to create session");
    (bus, session)
}

fn activate_all(session: &Session) -> Vec<Arc<dyn Device>> {
    session.update_available_devices().expect("Failed to enumerate");
    let devices = session.available_devices();
    for device in &devices {
        session.add_device(device).expect("Failed to add device");
    }
    devices
}

#[test]
fn test_discovery_filters_unsupported_and_unopenable() {
    let (_bus, session) = session(vec![
        SimulatedDeviceSpec::new(M1K, "GOOD0001"),
        SimulatedDeviceSpec::new(ALT, "GOOD0002"),
        SimulatedDeviceSpec::new(UsbId::new(0x1234, 0x0001), "OTHER"),
        SimulatedDeviceSpec::new(M1K, "LOCKED").failing_open(),
    ]);

    assert_eq!(session.update_available_devices().unwrap(), 2);
    let mut serials: Vec<String> = session
        .available_devices()
        .iter()
        .map(|d| d.serial().to_string())
        .collect();
    serials.sort();
    assert_eq!(serials, vec!["GOOD0001", "GOOD0002"]);
}

#[test]
fn test_unplugged_available_device_is_forgotten() {
    let (bus, session) = session(vec![SimulatedDeviceSpec::new(M1K, "A")]);
    let b = bus.plug(SimulatedDeviceSpec::new(M1K, "B"));

    assert_eq!(session.update_available_devices().unwrap(), 2);
    bus.unplug(b);
    assert_eq!(session.update_available_devices().unwrap(), 1);
    assert_eq!(session.available_devices()[0].serial(), "A");
}

#[test]
fn test_active_device_survives_rediscovery() {
    let (_bus, session) = session(vec![SimulatedDeviceSpec::new(M1K, "A")]);
    let devices = activate_all(&session);

    assert_eq!(session.update_available_devices().unwrap(), 1);
    assert!(session.available_devices().is_empty());
    let active = session.get_device("A").expect("device should stay active");
    assert!(Arc::ptr_eq(&active, &devices[0]));
}

#[test]
fn test_sine_run_captures_loopback() {
    let (_bus, session) = session(vec![SimulatedDeviceSpec::new(M1K, "A")]);
    let device = activate_all(&session).remove(0);
    assert!(session.configure(100_000).is_empty());

    device.set_mode(0, ChannelMode::Svmi).unwrap();
    {
        let mut voltage = device.signal(0, SIGNAL_VOLTAGE).unwrap();
        voltage.source_sine(2.5, 1.0, 100.0, 0.0).unwrap();
        voltage.measure_buffer(1000);
    }
    device.signal(0, SIGNAL_CURRENT).unwrap().measure_buffer(1000);

    let outcome = session.run(1000).expect("Run failed");
    assert_eq!(outcome, RunOutcome::Completed);
    assert!(!session.is_running());

    let voltage = device.signal(0, SIGNAL_VOLTAGE).unwrap().take_captured().unwrap();
    assert_eq!(voltage.len(), 1000);
    for (i, v) in voltage.iter().enumerate() {
        let expected = 2.5 + (2.0 * std::f64::consts::PI * i as f64 / 100.0).cos();
        assert!((*v as f64 - expected).abs() < 1e-5, "sample {i}: {v} vs {expected}");
    }

    // current is measured, not sourced, in SVMI
    let current = device.signal(0, SIGNAL_CURRENT).unwrap().take_captured().unwrap();
    assert_eq!(current.len(), 1000);
    assert!(current.iter().all(|&c| c == 0.0));
}

#[test]
fn test_source_values_are_clamped_to_signal_range() {
    let (_bus, session) = session(vec![SimulatedDeviceSpec::new(M1K, "A")]);
    let device = activate_all(&session).remove(0);

    device.set_mode(1, ChannelMode::Simv).unwrap();
    device.signal(1, SIGNAL_CURRENT).unwrap().source_constant(0.5);

    assert_eq!(session.run(32).unwrap(), RunOutcome::Completed);
    let latest = device.signal(1, SIGNAL_CURRENT).unwrap().measure_instantaneous();
    assert_eq!(latest, 0.2);
}

#[test]
fn test_highz_channel_sources_nothing() {
    let (_bus, session) = session(vec![SimulatedDeviceSpec::new(M1K, "A")]);
    let device = activate_all(&session).remove(0);

    {
        let mut voltage = device.signal(1, SIGNAL_VOLTAGE).unwrap();
        voltage.source_constant(3.0);
        voltage.measure_buffer(16);
    }

    assert_eq!(session.run(16).unwrap(), RunOutcome::Completed);
    let captured = device.signal(1, SIGNAL_VOLTAGE).unwrap().take_captured().unwrap();
    assert_eq!(captured, vec![0.0; 16]);
}

#[test]
fn test_buffer_source_holds_last_value_across_run() {
    let (_bus, session) = session(vec![SimulatedDeviceSpec::new(M1K, "A")]);
    let device = activate_all(&session).remove(0);

    device.set_mode(0, ChannelMode::Svmi).unwrap();
    {
        let mut voltage = device.signal(0, SIGNAL_VOLTAGE).unwrap();
        voltage.source_buffer(vec![1.0f32, 2.0, 3.0], false).unwrap();
        voltage.measure_buffer(20);
    }

    assert_eq!(session.run(20).unwrap(), RunOutcome::Completed);
    let captured = device.signal(0, SIGNAL_VOLTAGE).unwrap().take_captured().unwrap();
    assert_eq!(&captured[..4], &[1.0, 2.0, 3.0, 3.0]);
    assert!(captured[3..].iter().all(|&v| v == 3.0));
}

#[test]
fn test_sample_count_not_multiple_of_packet() {
    let (_bus, session) = session(vec![SimulatedDeviceSpec::new(M1K, "A")]);
    let device = activate_all(&session).remove(0);

    let calls = Arc::new(std::sync::atomic::AtomicU64::new(0));
    device.set_mode(0, ChannelMode::Svmi).unwrap();
    {
        let calls = calls.clone();
        let mut voltage = device.signal(0, SIGNAL_VOLTAGE).unwrap();
        voltage.source_callback(move |i| {
            calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            i as f32 * 0.001
        });
        voltage.measure_buffer(100);
    }

    assert_eq!(session.run(37).unwrap(), RunOutcome::Completed);
    assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), 37);
    let captured = device.signal(0, SIGNAL_VOLTAGE).unwrap().take_captured().unwrap();
    assert_eq!(captured.len(), 37);
    assert!((captured[36] - 0.036).abs() < 1e-6);
}

#[test]
fn test_callbacks_report_progress_and_completion() {
    let (_bus, session) = session(vec![
        SimulatedDeviceSpec::new(M1K, "A"),
        SimulatedDeviceSpec::new(M1K, "B"),
    ]);
    activate_all(&session);

    let (progress_tx, progress_rx) = crossbeam::channel::unbounded();
    let (done_tx, done_rx) = crossbeam::channel::unbounded();
    session.set_progress_callback(move |samples| {
        let _ = progress_tx.send(samples);
    });
    session.set_completion_callback(move |outcome| {
        let _ = done_tx.send(outcome.clone());
    });

    assert_eq!(session.run(500).unwrap(), RunOutcome::Completed);
    let outcome = done_rx.recv_timeout(Duration::from_secs(2)).expect("completion callback not called");
    assert_eq!(outcome, RunOutcome::Completed);

    let progress: Vec<u64> = progress_rx.try_iter().collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] < w[1]), "progress must strictly increase");
    assert_eq!(*progress.last().unwrap(), 500);

    // exactly one completion per run
    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_consecutive_runs() {
    let (_bus, session) = session(vec![SimulatedDeviceSpec::new(M1K, "A")]);
    let device = activate_all(&session).remove(0);
    device.set_mode(0, ChannelMode::Svmi).unwrap();

    for level in [1.0f32, 2.0, 4.0] {
        {
            let mut voltage = device.signal(0, SIGNAL_VOLTAGE).unwrap();
            voltage.source_constant(level);
            voltage.measure_buffer(64);
        }
        assert!(session.run(64).unwrap().is_completed());
        let captured = device.signal(0, SIGNAL_VOLTAGE).unwrap().take_captured().unwrap();
        assert!(captured.iter().all(|&v| v == level));
    }
}

#[test]
fn test_transfer_failure_fails_run() {
    let (_bus, session) = session(vec![
        SimulatedDeviceSpec::new(M1K, "A"),
        SimulatedDeviceSpec::new(M1K, "BAD").failing_after(2),
    ]);
    activate_all(&session);

    let outcome = session.run(0).expect("Run failed to start");
    assert_eq!(outcome, RunOutcome::Failed(DeviceError::Transfer(UsbError::Pipe)));
    assert!(!session.is_running());
}

#[test]
fn test_indefinite_run_until_cancel() {
    let (bus, session) = session(vec![SimulatedDeviceSpec::new(M1K, "A")]);
    activate_all(&session);

    session.run_nonblocking(0).unwrap();
    assert!(session.is_running());
    assert_eq!(session.wait_for_completion(Some(Duration::from_millis(30))), RunOutcome::TimedOut);

    session.cancel();
    assert!(session.end().unwrap().is_cancelled());
    assert!(bus.packets_transferred() > 0);
    assert_eq!(bus.active_streams(), 0);
}

#[test]
fn test_configure_reports_each_rejecting_device() {
    let (_bus, session) = session(vec![
        SimulatedDeviceSpec::new(M1K, "A"),
        SimulatedDeviceSpec::new(ALT, "B"),
    ]);
    activate_all(&session);

    let failures = session.configure(10);
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|e| matches!(
        e,
        SmuError::Device { source: DeviceError::UnsupportedRate { requested: 10, .. }, .. }
    )));

    assert!(session.configure(50_000).is_empty());
}

#[test]
fn test_cancel_from_sink_callback_then_rerun() {
    let (bus, session) = session(vec![SimulatedDeviceSpec::new(M1K, "A")]);
    let session = Arc::new(session);
    let device = activate_all(&session).remove(0);
    device.set_mode(0, ChannelMode::Svmi).unwrap();

    let weak = Arc::downgrade(&session);
    let mut seen = 0u32;
    device.signal(0, SIGNAL_VOLTAGE).unwrap().measure_callback(move |_| {
        seen += 1;
        if seen == 100 {
            if let Some(session) = weak.upgrade() {
                session.cancel();
            }
        }
    });
    assert_eq!(session.run(0).unwrap(), RunOutcome::Cancelled);

    // the stopped I/O loop must not come back alongside the new one
    device.signal(0, SIGNAL_VOLTAGE).unwrap().measure_buffer(64);
    session.run_nonblocking(0).unwrap();
    let before = bus.packets_transferred();
    thread::sleep(Duration::from_millis(20));
    assert!(session.is_running());
    assert!(bus.packets_transferred() > before);

    session.cancel();
    assert_eq!(session.end().unwrap(), RunOutcome::Cancelled);
    assert_eq!(bus.active_streams(), 0);
    assert_eq!(device.signal(0, SIGNAL_VOLTAGE).unwrap().captured().map(<[f32]>::len), Some(64));
}

#[test]
fn test_cancel_from_progress_callback() {
    let bus = SimulatedBus::with_devices(vec![SimulatedDeviceSpec::new(M1K, "A")]);
    let config = SessionConfig { event_queue_capacity: 16, ..SessionConfig::default() };
    let session = Arc::new(Session::new(Arc::new(bus), config).expect("Failed to create session"));
    activate_all(&session);

    let weak = Arc::downgrade(&session);
    let mut cancelled = false;
    session.set_progress_callback(move |_| {
        if cancelled {
            return;
        }
        cancelled = true;
        // let the progress queue fill up before cancelling
        thread::sleep(Duration::from_millis(50));
        if let Some(session) = weak.upgrade() {
            session.cancel();
        }
    });
    assert_eq!(session.run(0).unwrap(), RunOutcome::Cancelled);

    let (tx, rx) = crossbeam::channel::bounded(1);
    let registrar = {
        let session = session.clone();
        thread::spawn(move || {
            session.set_completion_callback(|_| {});
            let _ = tx.send(());
        })
    };
    rx.recv_timeout(Duration::from_secs(2)).expect("callback registration blocked");
    registrar.join().unwrap();

    let (done_tx, done_rx) = crossbeam::channel::bounded(1);
    thread::spawn(move || {
        drop(session);
        let _ = done_tx.send(());
    });
    done_rx.recv_timeout(Duration::from_secs(5)).expect("session teardown hung");
}

#[test]
fn test_hotplug_callbacks_follow_the_bus() {
    let (bus, session) = session(Vec::new());
    let (attach_tx, attach_rx) = crossbeam::channel::unbounded();
    let (detach_tx, detach_rx) = crossbeam::channel::unbounded();
    session.set_hotplug_attach_callback(move |device| {
        let _ = attach_tx.send(device.serial().to_string());
    });
    session.set_hotplug_detach_callback(move |device| {
        let _ = detach_tx.send(device.serial().to_string());
    });

    let hot = bus.plug(SimulatedDeviceSpec::new(M1K, "HOT1"));
    assert_eq!(attach_rx.recv_timeout(Duration::from_secs(2)).unwrap(), "HOT1");
    assert_eq!(session.available_devices().len(), 1);

    // unsupported devices are probed and skipped silently
    let other = bus.plug(SimulatedDeviceSpec::new(UsbId::new(0x1234, 0x0001), "OTHER"));
    bus.unplug(other);

    bus.unplug(hot);
    assert_eq!(detach_rx.recv_timeout(Duration::from_secs(2)).unwrap(), "HOT1");
    assert!(session.available_devices().is_empty());
    assert!(attach_rx.try_recv().is_err());
    assert!(detach_rx.try_recv().is_err());
}

#[test]
fn test_hotplug_detach_keeps_active_device() {
    let (bus, session) = session(Vec::new());
    let (detach_tx, detach_rx) = crossbeam::channel::unbounded();
    session.set_hotplug_detach_callback(move |device| {
        let _ = detach_tx.send(device.serial().to_string());
    });

    let hot = bus.plug(SimulatedDeviceSpec::new(M1K, "HOT2"));
    let device = session.available_devices().pop().expect("attached device should be available");
    assert_eq!(device.serial(), "HOT2");
    session.add_device(&device).unwrap();

    bus.unplug(hot);
    assert_eq!(detach_rx.recv_timeout(Duration::from_secs(2)).unwrap(), "HOT2");
    assert!(session.get_device("HOT2").is_some());
    session.remove_device(&device).unwrap();
}
