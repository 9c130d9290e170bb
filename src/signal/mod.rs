// src/signal/mod.rs
//! Per-signal source/sink routing
//!
//! A [`Signal`] holds exactly one source and one sink. The background I/O
//! thread calls [`Signal::get_sample`] once per tick to obtain the outgoing
//! value and [`Signal::put_sample`] once per tick with the measured value.
//! Neither call allocates, blocks or fails.
//!
//! Configuration (`source_*`, `measure_*`) happens on the caller thread
//! before a run and replaces the previous source or sink entirely.

pub mod sink;
pub mod source;

pub use sink::{Capture, Sink, SinkCallback};
pub use source::{Oscillator, Source, SourceCallback, SourceKind, Waveform};

use crate::error::SignalError;
use crate::hal::SignalInfo;
use std::sync::Arc;

/// One channel signal: source + sink configuration and the per-tick hot path.
#[derive(Debug)]
pub struct Signal {
    info: &'static SignalInfo,
    source: Source,
    sink: Sink,
    latest_measurement: f32,
}

impl Signal {
    /// New signal sourcing a constant 0 with no sink
    pub fn new(info: &'static SignalInfo) -> Self {
        Self {
            info,
            source: Source::default(),
            sink: Sink::None,
            latest_measurement: 0.0,
        }
    }

    pub fn info(&self) -> &'static SignalInfo {
        self.info
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn source_constant(&mut self, value: f32) {
        self.source = Source::Constant(value);
    }

    /// `v1` while the raw phase is below `duty` samples, `v2` for the rest of the period.
    pub fn source_square(
        &mut self,
        v1: f32,
        v2: f32,
        period: f64,
        duty: f64,
        phase: f64,
    ) -> Result<(), SignalError> {
        self.set_periodic(Waveform::Square { duty }, v1, v2, period, phase)
    }

    pub fn source_sawtooth(&mut self, v1: f32, v2: f32, period: f64, phase: f64) -> Result<(), SignalError> {
        self.set_periodic(Waveform::Sawtooth, v1, v2, period, phase)
    }

    pub fn source_stairstep(&mut self, v1: f32, v2: f32, period: f64, phase: f64) -> Result<(), SignalError> {
        self.set_periodic(Waveform::Stairstep, v1, v2, period, phase)
    }

    /// Cosine around `center` with peak deviation `amplitude`.
    pub fn source_sine(
        &mut self,
        center: f32,
        amplitude: f32,
        period: f64,
        phase: f64,
    ) -> Result<(), SignalError> {
        self.set_periodic(Waveform::Sine, center, amplitude, period, phase)
    }

    pub fn source_triangle(&mut self, v1: f32, v2: f32, period: f64, phase: f64) -> Result<(), SignalError> {
        self.set_periodic(Waveform::Triangle, v1, v2, period, phase)
    }

    /// Play samples from `data`. Past the end, a non-repeating buffer holds its
    /// last value and a repeating buffer starts over.
    pub fn source_buffer(&mut self, data: impl Into<Arc<[f32]>>, repeat: bool) -> Result<(), SignalError> {
        self.source = Source::buffer(data.into(), repeat)?;
        Ok(())
    }

    /// Ask `callback` for each sample; it receives the sample index since configuration.
    pub fn source_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u64) -> f32 + Send + 'static,
    {
        self.source = Source::callback(Box::new(callback));
    }

    /// Change period and phase of the current periodic source without
    /// touching its shape or levels.
    pub fn update_phase(&mut self, period: f64, phase: f64) -> Result<(), SignalError> {
        match &mut self.source {
            Source::Periodic(osc) => osc.retime(period, phase),
            _ => Err(SignalError::NotPeriodic),
        }
    }

    fn set_periodic(
        &mut self,
        waveform: Waveform,
        v1: f32,
        v2: f32,
        period: f64,
        phase: f64,
    ) -> Result<(), SignalError> {
        self.source = Source::Periodic(Oscillator::new(waveform, v1, v2, period, phase)?);
        Ok(())
    }

    /// Most recent measured value. Does not consume anything.
    pub fn measure_instantaneous(&self) -> f32 {
        self.latest_measurement
    }

    /// Capture the next `len` measured samples.
    pub fn measure_buffer(&mut self, len: usize) {
        self.sink = Sink::Buffer(Capture::with_len(len));
    }

    /// Deliver every measured sample to `callback` on the I/O thread.
    pub fn measure_callback<F>(&mut self, callback: F)
    where
        F: FnMut(f32) + Send + 'static,
    {
        self.sink = Sink::Callback(Box::new(callback));
    }

    /// Stop streaming measurements; `measure_instantaneous` keeps updating.
    pub fn measure_none(&mut self) {
        self.sink = Sink::None;
    }

    /// Samples captured so far by a buffer sink
    pub fn captured(&self) -> Option<&[f32]> {
        match &self.sink {
            Sink::Buffer(capture) => Some(capture.samples()),
            _ => None,
        }
    }

    /// Move the captured samples out, leaving the signal with no sink.
    pub fn take_captured(&mut self) -> Option<Vec<f32>> {
        match std::mem::take(&mut self.sink) {
            Sink::Buffer(capture) => Some(capture.into_samples()),
            other => {
                self.sink = other;
                None
            }
        }
    }

    /// Next outgoing sample. Called from the I/O thread only.
    #[inline]
    pub fn get_sample(&mut self) -> f32 {
        self.source.next_sample()
    }

    /// Deliver a measured sample. Called from the I/O thread only.
    #[inline]
    pub fn put_sample(&mut self, value: f32) {
        self.latest_measurement = value;
        self.sink.deliver(value);
    }
}
