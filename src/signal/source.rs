// src/signal/source.rs
//! Waveform engine: per-tick sample generation for every source kind
//!
//! Periodic sources are sample-indexed, not time-indexed: the phase advances
//! by exactly one unit per call and wraps modulo the period. The normalized
//! phase used by the shape functions is taken before the increment.

use crate::error::SignalError;
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

/// Callback producing the sample for a given index within the run.
pub type SourceCallback = Box<dyn FnMut(u64) -> f32 + Send>;

/// Shape of a periodic source
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Waveform {
    /// `v1` while raw phase < `duty`, else `v2`
    Square { duty: f64 },
    /// Linear ramp from `v1` to `v2` over one period
    Sawtooth,
    /// Ten equal steps descending from `v2` to `v1`
    Stairstep,
    /// `v1 + cos(2π·norm_phase)·v2`
    Sine,
    /// `v1 + |2·norm_phase − 1|·(v2 − v1)`
    Triangle,
}

/// Phase-accumulating periodic generator
#[derive(Debug, Clone, PartialEq)]
pub struct Oscillator {
    waveform: Waveform,
    v1: f64,
    v2: f64,
    period: f64,
    phase: f64,
}

impl Oscillator {
    pub fn new(waveform: Waveform, v1: f32, v2: f32, period: f64, phase: f64) -> Result<Self, SignalError> {
        check_timing(period, phase)?;
        Ok(Self {
            waveform,
            v1: v1 as f64,
            v2: v2 as f64,
            period,
            phase: phase.rem_euclid(period),
        })
    }

    /// Replace period and phase, keeping shape and levels.
    pub fn retime(&mut self, period: f64, phase: f64) -> Result<(), SignalError> {
        check_timing(period, phase)?;
        self.period = period;
        self.phase = phase.rem_euclid(period);
        Ok(())
    }

    pub fn waveform(&self) -> Waveform {
        self.waveform
    }

    pub fn period(&self) -> f64 {
        self.period
    }

    /// Current raw phase, in samples
    pub fn phase(&self) -> f64 {
        self.phase
    }

    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        let phase = self.phase;
        let norm_phase = phase / self.period;
        self.phase = (self.phase + 1.0) % self.period;

        let (v1, v2) = (self.v1, self.v2);
        let value = match self.waveform {
            Waveform::Square { duty } => {
                if phase < duty { v1 } else { v2 }
            }
            Waveform::Sawtooth => v1 + norm_phase * (v2 - v1),
            Waveform::Stairstep => v2 - (phase * 10.0 / self.period).floor() * (v2 - v1) / 9.0,
            Waveform::Sine => v1 + (norm_phase * 2.0 * PI).cos() * v2,
            Waveform::Triangle => v1 + (norm_phase * 2.0 - 1.0).abs() * (v2 - v1),
        };
        value as f32
    }
}

fn check_timing(period: f64, phase: f64) -> Result<(), SignalError> {
    if !period.is_finite() || period <= 0.0 {
        return Err(SignalError::InvalidPeriod(period));
    }
    if !phase.is_finite() {
        return Err(SignalError::InvalidPhase(phase));
    }
    Ok(())
}

/// Active source of a signal. Exactly one is configured at any time.
pub enum Source {
    Constant(f32),
    Periodic(Oscillator),
    Buffer {
        data: Arc<[f32]>,
        index: usize,
        repeat: bool,
    },
    Callback {
        callback: SourceCallback,
        index: u64,
    },
}

impl Source {
    pub fn buffer(data: Arc<[f32]>, repeat: bool) -> Result<Self, SignalError> {
        if data.is_empty() {
            return Err(SignalError::EmptyBuffer);
        }
        Ok(Source::Buffer { data, index: 0, repeat })
    }

    pub fn callback(callback: SourceCallback) -> Self {
        Source::Callback { callback, index: 0 }
    }

    /// Produce the next outgoing sample, advancing iteration state.
    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        match self {
            Source::Constant(value) => *value,
            Source::Periodic(osc) => osc.next_sample(),
            Source::Buffer { data, index, repeat } => {
                if *index >= data.len() {
                    if *repeat {
                        *index = 0;
                    } else {
                        // hold the last value past the end
                        return data[data.len() - 1];
                    }
                }
                let value = data[*index];
                *index += 1;
                value
            }
            Source::Callback { callback, index } => {
                let value = callback(*index);
                *index += 1;
                value
            }
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Source::Constant(_) => SourceKind::Constant,
            Source::Periodic(osc) => match osc.waveform() {
                Waveform::Square { .. } => SourceKind::Square,
                Waveform::Sawtooth => SourceKind::Sawtooth,
                Waveform::Stairstep => SourceKind::Stairstep,
                Waveform::Sine => SourceKind::Sine,
                Waveform::Triangle => SourceKind::Triangle,
            },
            Source::Buffer { .. } => SourceKind::Buffer,
            Source::Callback { .. } => SourceKind::Callback,
        }
    }
}

impl Default for Source {
    fn default() -> Self {
        Source::Constant(0.0)
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            Source::Periodic(osc) => f.debug_tuple("Periodic").field(osc).finish(),
            Source::Buffer { data, index, repeat } => f
                .debug_struct("Buffer")
                .field("len", &data.len())
                .field("index", index)
                .field("repeat", repeat)
                .finish(),
            Source::Callback { index, .. } => f.debug_struct("Callback").field("index", index).finish(),
        }
    }
}

/// Discriminant of the configured source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Constant,
    Square,
    Sawtooth,
    Stairstep,
    Sine,
    Triangle,
    Buffer,
    Callback,
}
