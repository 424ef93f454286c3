//! Stimulus boundary: anything that can feed the brain implements
//! [`StimulusProvider`] and hands the harness one input frame and one
//! expected output frame per pass.

use std::f64::consts::TAU;

/// Frame source driving the training loop.
///
/// `next_input` returns a vector of length `nInput`, `next_expected` one
/// of length `nOutput`; values are unbounded but conventionally `[0, 1]`.
/// `time` is monotone stimulus time in seconds.
pub trait StimulusProvider: Send {
    fn next_input(&mut self) -> Vec<f32>;
    fn next_expected(&mut self) -> Vec<f32>;
    fn time(&self) -> f64;
}

/// Phase-shifted waveform stimulus.
///
/// Each input frame is a spatial wave sampled across the input layer,
/// `wave(i/nInput + phase)`, with the phase advancing by `freqHz · dtSec`
/// per frame (wrapping at 1.0). The expected frame samples a second wave
/// at the same phase across the output layer. The phase advances in
/// `next_input`; call it before `next_expected` within a pass.
pub struct FunctionalStimulus {
    n_input: usize,
    n_output: usize,
    dt_sec: f64,
    freq_hz: f64,
    phase: f64,
    t_sec: f64,
    input_fn: fn(f64) -> f32,
    expected_fn: fn(f64) -> f32,
}

/// `0‒1` sine over one spatial period.
pub fn sine01(x: f64) -> f32 {
    (0.5 * ((TAU * x).sin() + 1.0)) as f32
}

/// `0‒1` cosine over one spatial period.
pub fn cosine01(x: f64) -> f32 {
    (0.5 * ((TAU * x).cos() + 1.0)) as f32
}

impl FunctionalStimulus {
    pub fn new(n_input: usize, n_output: usize, dt_sec: f64, freq_hz: f64) -> Self {
        Self::with_waves(n_input, n_output, dt_sec, freq_hz, sine01, cosine01)
    }

    pub fn with_waves(
        n_input: usize,
        n_output: usize,
        dt_sec: f64,
        freq_hz: f64,
        input_fn: fn(f64) -> f32,
        expected_fn: fn(f64) -> f32,
    ) -> Self {
        Self {
            n_input,
            n_output,
            dt_sec,
            freq_hz,
            phase: 0.0,
            t_sec: 0.0,
            input_fn,
            expected_fn,
        }
    }
}

impl StimulusProvider for FunctionalStimulus {
    fn next_input(&mut self) -> Vec<f32> {
        self.phase += self.freq_hz * self.dt_sec;
        if self.phase > 1.0 {
            self.phase -= 1.0;
        }
        self.t_sec += self.dt_sec;

        (0..self.n_input)
            .map(|i| (self.input_fn)(i as f64 / self.n_input as f64 + self.phase))
            .collect()
    }

    fn next_expected(&mut self) -> Vec<f32> {
        (0..self.n_output)
            .map(|o| (self.expected_fn)(o as f64 / self.n_output as f64 + self.phase))
            .collect()
    }

    fn time(&self) -> f64 {
        self.t_sec
    }
}

/// Fixed frames, for calibration runs and tests.
pub struct ConstantStimulus {
    input: Vec<f32>,
    expected: Vec<f32>,
    dt_sec: f64,
    t_sec: f64,
}

impl ConstantStimulus {
    pub fn new(input: Vec<f32>, expected: Vec<f32>, dt_sec: f64) -> Self {
        Self {
            input,
            expected,
            dt_sec,
            t_sec: 0.0,
        }
    }

    pub fn set_expected(&mut self, expected: Vec<f32>) {
        self.expected = expected;
    }
}

impl StimulusProvider for ConstantStimulus {
    fn next_input(&mut self) -> Vec<f32> {
        self.t_sec += self.dt_sec;
        self.input.clone()
    }

    fn next_expected(&mut self) -> Vec<f32> {
        self.expected.clone()
    }

    fn time(&self) -> f64 {
        self.t_sec
    }
}
