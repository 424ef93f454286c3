//! Continuous-time low-pass over the binary output vector, with an
//! optional trailing moving-average stage.

use std::collections::VecDeque;

/// Two-stage smoothing filter.
///
/// Stage 1 is a stateful IIR low-pass `r += α·(raw − r)` with
/// `α = dt/(τ + dt)`; the first call initialises `r := raw`. Stage 2,
/// enabled by a non-zero window, pushes each IIR result into a ring of
/// length `fir_len` and returns the element-wise mean.
///
/// The window length is fixed at construction; there is no setter.
#[derive(Debug, Clone)]
pub struct RateFilter {
    tau_sec: f64,
    fir_len: usize,
    rate: Vec<f32>,
    fir_hist: VecDeque<Vec<f32>>,
}

impl RateFilter {
    /// `fir_len == 0` disables the FIR stage.
    pub fn new(tau_sec: f64, fir_len: usize) -> Self {
        Self {
            tau_sec,
            fir_len,
            rate: Vec::new(),
            fir_hist: VecDeque::new(),
        }
    }

    pub fn process(&mut self, raw: &[f32], dt_sec: f64) -> Vec<f32> {
        if self.rate.is_empty() {
            self.rate = raw.to_vec();
        }

        let alpha = dt_sec / (self.tau_sec + dt_sec);
        for (r, &x) in self.rate.iter_mut().zip(raw) {
            *r += (alpha * f64::from(x - *r)) as f32;
        }

        if self.fir_len == 0 {
            return self.rate.clone();
        }

        self.fir_hist.push_back(self.rate.clone());
        if self.fir_hist.len() > self.fir_len {
            self.fir_hist.pop_front();
        }

        let mut avg = vec![0.0f32; raw.len()];
        for frame in &self.fir_hist {
            for (a, &v) in avg.iter_mut().zip(frame) {
                *a += v;
            }
        }
        let inv = 1.0 / self.fir_hist.len() as f32;
        for a in &mut avg {
            *a *= inv;
        }
        avg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_initialises_to_raw() {
        let mut f = RateFilter::new(0.02, 0);
        let out = f.process(&[0.7, 0.1], 0.001);
        assert_eq!(out, vec![0.7, 0.1]);
    }

    #[test]
    fn iir_converges_monotonically_to_constant_input() {
        let mut f = RateFilter::new(0.02, 0);
        f.process(&[0.0], 0.001);
        let mut prev = 0.0f32;
        for _ in 0..10_000 {
            let out = f.process(&[1.0], 0.001)[0];
            assert!(out >= prev);
            assert!(out <= 1.0);
            prev = out;
        }
        assert!((prev - 1.0).abs() < 1e-4);
    }

    #[test]
    fn convergence_from_above_is_monotone_too() {
        let mut f = RateFilter::new(0.02, 0);
        f.process(&[1.0], 0.001);
        let mut prev = 1.0f32;
        for _ in 0..10_000 {
            let out = f.process(&[0.25], 0.001)[0];
            assert!(out <= prev);
            assert!(out >= 0.25 - 1e-6);
            prev = out;
        }
        assert!((prev - 0.25).abs() < 1e-4);
    }

    #[test]
    fn fir_stage_averages_recent_frames() {
        // τ → 0 makes the IIR pass raw through, isolating the FIR mean.
        let mut f = RateFilter::new(0.0, 2);
        assert_eq!(f.process(&[1.0], 1.0), vec![1.0]);
        let out = f.process(&[0.0], 1.0);
        assert!((out[0] - 0.5).abs() < 1e-6);
    }
}
