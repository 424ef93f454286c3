//! Training harness.
//!
//! One call to [`Trainer::run_one_pass`] executes the full per-pass
//! pipeline: stimulus → input injection → teacher forcing → traversal
//! (with the harness scalars published to the kernel) → output read →
//! smoothed-rate filter → sliding-window loss → reward write-back →
//! teacher/explore annealing → periodic diagnostics and trace frames.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::brain::{Brain, BrainError, PassControl};
use crate::kernel::{PASS_REWARD, PASS_TEACHER};
use crate::prng::Prng;
use crate::rate_filter::RateFilter;
use crate::stimulus::StimulusProvider;
use crate::trace::TraceLogger;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Sliding loss window, in passes.
    pub w_loss: u32,
    /// Reward gain on loss improvement.
    pub k_gain: f32,
    /// Symmetric reward clip.
    pub r_clip: f32,
    /// Lower bound on the exploration scale.
    pub explore_floor: f32,
    /// Per-reward-pass multiplicative anneal of the exploration scale.
    pub explore_anneal: f32,
    /// Reward passes before exploration annealing starts.
    pub reward_warmup: u32,
    /// Teacher rate never anneals below this; at the floor, passes flip
    /// to reward mode.
    pub teacher_floor: f32,
    /// Multiplicative teacher-rate reduction applied by the diagnostic
    /// comparison.
    pub teacher_cut: f32,
    /// `dW_reward / dW_teacher` ratio that triggers the reduction.
    pub diag_ratio: f32,
    /// Diagnostic window, in passes.
    pub diag_every: u32,
    /// Log-frame cadence, in passes.
    pub log_every: u32,
    /// Passes per block of the target schedule.
    pub block_len: u32,
    /// Per-block target ceiling for the teacher rate.
    pub block_targets: Vec<f32>,
    /// Poisson rate for input injection.
    pub input_rate_hz: f32,
    /// Rate-filter time constant (seconds).
    pub filter_tau_sec: f64,
    /// FIR window length; 0 disables the second stage.
    pub fir_len: usize,
    /// Decay of the dynamic output-rescaling peak, per pass.
    pub peak_decay: f32,
    /// Prior for the first loss window.
    pub initial_loss: f32,
    /// EMA factor for the device reward baseline `r̄`.
    pub r_bar_beta: f32,
    pub trace_path: String,
    /// Trace-file rewrite cadence, in recorded frames.
    pub trace_rewrite_every: u32,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            w_loss: 1000,
            k_gain: 40.0,
            r_clip: 0.3,
            explore_floor: 0.30,
            explore_anneal: 0.99997,
            reward_warmup: 1000,
            teacher_floor: 0.05,
            teacher_cut: 0.9,
            diag_ratio: 1.0,
            diag_every: 1000,
            log_every: 100,
            block_len: 200,
            block_targets: vec![1.0, 0.0, 1.0, 0.0, 0.5],
            input_rate_hz: 1000.0,
            filter_tau_sec: 0.02,
            fir_len: 20,
            peak_decay: 0.99,
            initial_loss: 0.25,
            r_bar_beta: 0.9,
            trace_path: "abnn_session.m".to_string(),
            trace_rewrite_every: 100,
        }
    }
}

/// Per-run state of the harness. All of it is owned by the single worker
/// thread that drives the pass loop; no locks anywhere.
pub struct Trainer {
    cfg: TrainerConfig,
    rng: Prng,

    teacher_rate: f32,
    explore_scale: f32,
    reward: f32,
    r_bar: f32,
    reward_passes: u32,
    pass_count: u64,

    block_idx: usize,
    in_block: u32,

    spike_window: Vec<u32>,
    win_pos: u32,
    last_loss: f32,

    filter: RateFilter,
    smoothed: Vec<f32>,
    max_observed: f32,

    dw_teacher: f32,
    dw_reward: f32,
    fired_teacher: u64,
    fired_reward: u64,

    trace: TraceLogger,
}

impl Trainer {
    pub fn new(cfg: TrainerConfig, n_output: usize, seed: u64) -> Self {
        let filter = RateFilter::new(cfg.filter_tau_sec, cfg.fir_len);
        let trace = TraceLogger::new(cfg.trace_path.clone(), cfg.trace_rewrite_every);
        let last_loss = cfg.initial_loss;
        Self {
            cfg,
            rng: Prng::seeded(seed),
            teacher_rate: 1.0,
            explore_scale: 1.0,
            reward: 0.0,
            r_bar: 0.0,
            reward_passes: 0,
            pass_count: 0,
            block_idx: 0,
            in_block: 0,
            spike_window: vec![0; n_output],
            win_pos: 0,
            last_loss,
            filter,
            smoothed: vec![0.0; n_output],
            max_observed: 0.0,
            dw_teacher: 0.0,
            dw_reward: 0.0,
            fired_teacher: 0,
            fired_reward: 0,
            trace,
        }
    }

    pub fn teacher_rate(&self) -> f32 {
        self.teacher_rate
    }

    pub fn explore_scale(&self) -> f32 {
        self.explore_scale
    }

    pub fn reward(&self) -> f32 {
        self.reward
    }

    pub fn last_loss(&self) -> f32 {
        self.last_loss
    }

    pub fn pass_count(&self) -> u64 {
        self.pass_count
    }

    pub fn smoothed_rates(&self) -> &[f32] {
        &self.smoothed
    }

    pub fn ema_loss(&self) -> Option<f32> {
        self.trace.ema_loss()
    }

    /// Execute one full training pass against `brain` and `provider`.
    pub fn run_one_pass(
        &mut self,
        brain: &mut Brain,
        provider: &mut dyn StimulusProvider,
    ) -> Result<(), BrainError> {
        let input = provider.next_input();
        let expected = provider.next_expected();

        brain.inject_inputs(&input, self.cfg.input_rate_hz);

        // Block schedule: the per-block target is a ceiling the teacher
        // rate only ever descends through.
        let target = if self.cfg.block_targets.is_empty() {
            1.0
        } else {
            self.cfg.block_targets[self.block_idx % self.cfg.block_targets.len()]
        };
        self.teacher_rate = self
            .teacher_rate
            .min(target)
            .max(self.cfg.teacher_floor);
        self.in_block += 1;
        if self.in_block >= self.cfg.block_len {
            self.in_block = 0;
            self.block_idx += 1;
        }

        let pass_flag = if self.teacher_rate > self.cfg.teacher_floor {
            PASS_TEACHER
        } else {
            PASS_REWARD
        };
        if pass_flag == PASS_REWARD {
            self.reward_passes += 1;
            if self.reward_passes > self.cfg.reward_warmup {
                self.explore_scale =
                    (self.explore_scale * self.cfg.explore_anneal).max(self.cfg.explore_floor);
            }
        }

        // Teacher forcing: stamp each output with probability
        // expected[o] · teacherRate, so downstream STDP sees the target
        // pattern as network activity.
        for (o, &e) in expected.iter().enumerate() {
            if self.rng.bernoulli(e * self.teacher_rate) {
                brain.force_output(o as u32);
            }
        }

        let ctl = PassControl {
            pass_flag,
            explore_scale: self.explore_scale,
            reward: self.reward,
            r_bar: self.r_bar,
        };
        let stats = brain.run_pass(&ctl)?;

        if pass_flag == PASS_TEACHER {
            self.dw_teacher += stats.dw_abs;
            self.fired_teacher += u64::from(stats.fired);
        } else {
            self.dw_reward += stats.dw_abs;
            self.fired_reward += u64::from(stats.fired);
        }

        // Output read, smoothed rates, dynamic rescale to [0,1].
        let spikes = brain.read_outputs();
        let raw: Vec<f32> = spikes.iter().map(|&s| if s { 1.0 } else { 0.0 }).collect();
        let smoothed = self.filter.process(&raw, brain.cfg().dt_sec);
        let peak = smoothed.iter().copied().fold(0.0f32, f32::max);
        self.max_observed = (self.max_observed * self.cfg.peak_decay).max(peak);
        let scale = self.max_observed.max(1e-6);
        for (out, s) in self.smoothed.iter_mut().zip(&smoothed) {
            *out = (s / scale).clamp(0.0, 1.0);
        }

        for (w, &s) in self.spike_window.iter_mut().zip(&spikes) {
            *w += u32::from(s);
        }
        self.win_pos += 1;
        if self.win_pos >= self.cfg.w_loss {
            self.close_loss_window(&expected);
        }

        self.pass_count += 1;

        if self.cfg.diag_every > 0 && self.pass_count % u64::from(self.cfg.diag_every) == 0 {
            self.diagnostic_window();
        }
        if self.cfg.log_every > 0 && self.pass_count % u64::from(self.cfg.log_every) == 0 {
            info!(
                pass = self.pass_count,
                loss = self.last_loss,
                ema = self.trace.ema_loss().unwrap_or(self.last_loss),
                teacher = self.teacher_rate,
                explore = self.explore_scale,
                reward = self.reward,
                fired = stats.fired,
                "training frame"
            );
            self.trace.record_frame(&input, &self.smoothed, &expected);
        }

        Ok(())
    }

    /// Close the sliding window: compute the loss against the expected
    /// frame, derive the reward published to the next pass, update the
    /// baseline, and reset the window.
    fn close_loss_window(&mut self, expected: &[f32]) {
        let n = expected.len().max(1) as f32;
        let loss = self
            .smoothed
            .iter()
            .zip(expected)
            .map(|(&s, &e)| (s - e) * (s - e))
            .sum::<f32>()
            / n;

        let r = self.cfg.k_gain * (self.last_loss - loss) / (self.teacher_rate + 0.02);
        self.reward = r.clamp(-self.cfg.r_clip, self.cfg.r_clip);
        self.r_bar = self.cfg.r_bar_beta * self.r_bar + (1.0 - self.cfg.r_bar_beta) * self.reward;
        self.last_loss = loss;
        self.trace.record_loss(loss);

        for w in &mut self.spike_window {
            *w = 0;
        }
        self.win_pos = 0;
    }

    /// Compare plasticity attributed to teacher vs reward passes; when
    /// reward-driven learning carries its weight, hand over by shrinking
    /// the teacher rate.
    fn diagnostic_window(&mut self) {
        if self.dw_teacher > 0.0 && self.dw_reward / self.dw_teacher >= self.cfg.diag_ratio {
            self.teacher_rate = (self.teacher_rate * self.cfg.teacher_cut).max(self.cfg.teacher_floor);
        }
        debug!(
            dw_teacher = self.dw_teacher,
            dw_reward = self.dw_reward,
            fired_teacher = self.fired_teacher,
            fired_reward = self.fired_reward,
            teacher = self.teacher_rate,
            "diagnostic window"
        );
        self.dw_teacher = 0.0;
        self.dw_reward = 0.0;
        self.fired_teacher = 0;
        self.fired_reward = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::BrainConfig;
    use crate::graph::GraphShape;
    use crate::stimulus::ConstantStimulus;

    fn test_brain(events: u32) -> Brain {
        Brain::new(
            GraphShape {
                n_input: 1,
                n_output: 1,
                n_hidden: 0,
                n_syn: 1,
            },
            BrainConfig {
                events_per_pass: events,
                seed: Some(7),
                ..BrainConfig::default()
            },
        )
    }

    fn quiet_trainer_cfg() -> TrainerConfig {
        TrainerConfig {
            trace_path: std::env::temp_dir()
                .join("abnn_trainer_test.m")
                .to_string_lossy()
                .into_owned(),
            trace_rewrite_every: u32::MAX,
            ..TrainerConfig::default()
        }
    }

    #[test]
    fn teacher_rate_descends_monotonically_with_floor() {
        let mut brain = test_brain(8);
        let mut provider = ConstantStimulus::new(vec![0.5], vec![0.5], 0.0009);
        let cfg = TrainerConfig {
            block_len: 10,
            w_loss: 50,
            ..quiet_trainer_cfg()
        };
        let mut t = Trainer::new(cfg, 1, 3);

        let mut prev = t.teacher_rate();
        assert_eq!(prev, 1.0);
        for _ in 0..10_000 {
            t.run_one_pass(&mut brain, &mut provider).unwrap();
            let rate = t.teacher_rate();
            assert!(rate <= prev + 1e-7);
            assert!(rate >= 0.05 - 1e-7);
            prev = rate;
        }
        // The 0.0 block pulled the ceiling down to the floor.
        assert!((prev - 0.05).abs() < 1e-6);
    }

    #[test]
    fn explore_scale_anneals_only_after_warmup_and_floors() {
        let mut brain = test_brain(8);
        let mut provider = ConstantStimulus::new(vec![0.5], vec![0.5], 0.0009);
        let cfg = TrainerConfig {
            block_targets: vec![0.0], // reward mode immediately
            block_len: 1,
            reward_warmup: 100,
            explore_anneal: 0.9, // fast anneal so the floor is reachable
            w_loss: 1000,
            ..quiet_trainer_cfg()
        };
        let mut t = Trainer::new(cfg, 1, 3);

        for _ in 0..100 {
            t.run_one_pass(&mut brain, &mut provider).unwrap();
        }
        assert_eq!(t.explore_scale(), 1.0);

        for _ in 0..2000 {
            t.run_one_pass(&mut brain, &mut provider).unwrap();
        }
        assert!((t.explore_scale() - 0.30).abs() < 1e-6);
    }

    #[test]
    fn reward_is_positive_after_loss_improvement() {
        let mut brain = test_brain(16);
        let mut provider = ConstantStimulus::new(vec![1.0], vec![1.0], 0.0009);
        let cfg = TrainerConfig {
            w_loss: 2,
            block_targets: vec![1.0],
            ..quiet_trainer_cfg()
        };
        let mut t = Trainer::new(cfg, 1, 3);

        // First window: zero the only weight so nothing fires and the
        // loss against expected=1 is maximal.
        brain.graph_mut().synapses[0].w = 0.0;
        for _ in 0..2 {
            t.run_one_pass(&mut brain, &mut provider).unwrap();
        }
        let first_reward = t.reward();
        assert!(first_reward < 0.0);

        // Second window: wire input straight to the output at full
        // weight so it fires nearly every pass. The loss drops and the
        // reward flips positive, clamped at the clip.
        {
            let g = brain.graph_mut();
            g.synapses[0].src = 0;
            g.synapses[0].dst = 1;
            g.synapses[0].w = 1.0;
        }
        for _ in 0..2 {
            t.run_one_pass(&mut brain, &mut provider).unwrap();
        }
        let second_reward = t.reward();
        assert!(second_reward > 0.0);
        assert!(second_reward <= t.cfg.r_clip + 1e-7);
    }

    #[test]
    fn loss_window_resets_after_close() {
        let mut brain = test_brain(8);
        let mut provider = ConstantStimulus::new(vec![0.5], vec![0.0], 0.0009);
        let cfg = TrainerConfig {
            w_loss: 4,
            ..quiet_trainer_cfg()
        };
        let mut t = Trainer::new(cfg, 1, 3);
        brain.graph_mut().synapses[0].w = 0.0; // keep the network silent
        for _ in 0..4 {
            t.run_one_pass(&mut brain, &mut provider).unwrap();
        }
        assert_eq!(t.win_pos, 0);
        assert!(t.spike_window.iter().all(|&w| w == 0));
        // Silent network against expected=0 is a perfect match.
        assert!(t.last_loss() < 0.05);
    }
}
