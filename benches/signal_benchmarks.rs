use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use smu_core::config::{SessionConfig, UsbId};
use smu_core::hal::{ChannelMode, SignalInfo, SimulatedBus, SimulatedDeviceSpec, Unit, SIGNAL_VOLTAGE};
use smu_core::{Session, Signal};
use std::sync::Arc;

const TICKS: u64 = 10_000;

static INFO: SignalInfo = SignalInfo {
    label: "Voltage",
    input_modes: 0x7,
    output_modes: 0x2,
    unit: Unit::VOLT,
    min: 0.0,
    max: 5.0,
    resolution: 5.0 / 65536.0,
};

fn configured(kind: &str) -> Signal {
    let mut signal = Signal::new(&INFO);
    match kind {
        "constant" => signal.source_constant(2.5),
        "square" => signal.source_square(0.0, 5.0, 100.0, 50.0, 0.0).unwrap(),
        "sawtooth" => signal.source_sawtooth(0.0, 5.0, 100.0, 0.0).unwrap(),
        "stairstep" => signal.source_stairstep(0.0, 5.0, 100.0, 0.0).unwrap(),
        "sine" => signal.source_sine(2.5, 1.0, 100.0, 0.0).unwrap(),
        "triangle" => signal.source_triangle(0.0, 5.0, 100.0, 0.0).unwrap(),
        "buffer" => signal.source_buffer(vec![1.0f32; 1024], true).unwrap(),
        "callback" => signal.source_callback(|i| (i % 100) as f32 * 0.05),
        other => panic!("unknown source {other}"),
    }
    signal
}

fn benchmark_sources(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_sample");
    group.throughput(Throughput::Elements(TICKS));

    for kind in ["constant", "square", "sawtooth", "stairstep", "sine", "triangle", "buffer", "callback"] {
        group.bench_with_input(BenchmarkId::from_parameter(kind), &kind, |b, &kind| {
            let mut signal = configured(kind);
            b.iter(|| {
                for _ in 0..TICKS {
                    black_box(signal.get_sample());
                }
            });
        });
    }

    group.finish();
}

fn benchmark_sinks(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_sample");
    group.throughput(Throughput::Elements(TICKS));

    group.bench_function("none", |b| {
        let mut signal = Signal::new(&INFO);
        b.iter(|| {
            for i in 0..TICKS {
                signal.put_sample(black_box(i as f32));
            }
        });
    });

    group.bench_function("buffer", |b| {
        let mut signal = Signal::new(&INFO);
        b.iter(|| {
            signal.measure_buffer(TICKS as usize);
            for i in 0..TICKS {
                signal.put_sample(black_box(i as f32));
            }
        });
    });

    group.bench_function("callback", |b| {
        let mut signal = Signal::new(&INFO);
        let mut acc = 0.0f32;
        signal.measure_callback(move |v| {
            acc += v;
            black_box(acc);
        });
        b.iter(|| {
            for i in 0..TICKS {
                signal.put_sample(black_box(i as f32));
            }
        });
    });

    group.finish();
}

fn benchmark_loopback_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_run");
    group.sample_size(20);

    for &nsamples in &[1_000u64, 10_000] {
        group.throughput(Throughput::Elements(nsamples));
        group.bench_with_input(BenchmarkId::from_parameter(nsamples), &nsamples, |b, &nsamples| {
            let bus = SimulatedBus::with_devices([SimulatedDeviceSpec::new(UsbId::new(0x0456, 0xcee2), "BENCH")]);
            let session = Session::new(Arc::new(bus), SessionConfig::default()).unwrap();
            session.update_available_devices().unwrap();
            let device = session.available_devices().remove(0);
            session.add_device(&device).unwrap();
            device.set_mode(0, ChannelMode::Svmi).unwrap();
            device.signal(0, SIGNAL_VOLTAGE).unwrap().source_sine(2.5, 1.0, 100.0, 0.0).unwrap();

            b.iter(|| {
                device.signal(0, SIGNAL_VOLTAGE).unwrap().measure_buffer(nsamples as usize);
                black_box(session.run(nsamples).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_sources, benchmark_sinks, benchmark_loopback_run);
criterion_main!(benches);
