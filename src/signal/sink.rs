// src/signal/sink.rs
//! Measurement sinks

use std::fmt;

/// Callback receiving every measured sample.
pub type SinkCallback = Box<dyn FnMut(f32) + Send>;

/// Fixed-length capture. Storage is reserved up front so the hot path
/// never reallocates; writes past the requested length are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    samples: Vec<f32>,
    len: usize,
}

impl Capture {
    pub fn with_len(len: usize) -> Self {
        Self { samples: Vec::with_capacity(len), len }
    }

    #[inline]
    pub fn push(&mut self, value: f32) -> bool {
        if self.samples.len() < self.len {
            self.samples.push(value);
            true
        } else {
            false
        }
    }

    /// Samples still accepted before the capture is full
    pub fn remaining(&self) -> usize {
        self.len - self.samples.len()
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

/// Active sink of a signal
#[derive(Default)]
pub enum Sink {
    #[default]
    None,
    Buffer(Capture),
    Callback(SinkCallback),
}

impl Sink {
    #[inline]
    pub fn deliver(&mut self, value: f32) {
        match self {
            Sink::None => {}
            Sink::Buffer(capture) => {
                capture.push(value);
            }
            Sink::Callback(callback) => callback(value),
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::None => f.write_str("None"),
            Sink::Buffer(capture) => f
                .debug_struct("Buffer")
                .field("captured", &capture.samples().len())
                .field("remaining", &capture.remaining())
                .finish(),
            Sink::Callback(_) => f.write_str("Callback"),
        }
    }
}
