//! Host bridge: owns the synapse graph, drives a traversal backend, and
//! exposes the per-pass operations the training harness composes
//! (inject → force → pass → read), plus persistence.

use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::gpu::{GpuBrain, GpuError};
use crate::graph::{GraphShape, LoadError, SynapseGraph};
use crate::kernel::{self, HashRng, PassParams, PassStats, PASS_TEACHER};
use crate::prng::Prng;

/// Compile-time tunables of the spiking core. Every field has the stock
/// default, so a JSON config may override any subset.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    /// GPU traversal threads per pass.
    pub events_per_pass: u32,
    /// Per-pass firing budget.
    pub max_spikes: u32,
    /// Nominal nanoseconds per virtual tick.
    pub tick_ns: u32,
    /// Clock value that triggers renormalisation.
    pub renorm_threshold: u32,
    /// STDP visit-recency constant (ticks).
    pub tau_visit: u32,
    /// STDP causal window (ticks).
    pub tau_pre: u32,
    pub alpha_ltp: f32,
    pub alpha_ltd: f32,
    pub w_min: f32,
    pub w_max: f32,
    /// Wall-clock seconds one pass represents; scales injection probability
    /// and the rate filter.
    pub dt_sec: f64,
    /// Makes behaviour reproducible for evaluation.
    pub seed: Option<u64>,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            events_per_pass: 100_000,
            max_spikes: 256,
            tick_ns: 1000,
            renorm_threshold: 0xE000_0000,
            tau_visit: 40_000,
            tau_pre: 20_000,
            alpha_ltp: 0.04,
            alpha_ltd: 0.02,
            w_min: 0.001,
            w_max: 1.0,
            dt_sec: 0.0009,
            seed: None,
        }
    }
}

/// Per-pass scalars the training harness publishes before each traversal.
#[derive(Clone, Copy, Debug)]
pub struct PassControl {
    /// `PASS_TEACHER` or `PASS_REWARD`.
    pub pass_flag: u32,
    pub explore_scale: f32,
    pub reward: f32,
    pub r_bar: f32,
}

impl Default for PassControl {
    fn default() -> Self {
        Self {
            pass_flag: PASS_TEACHER,
            explore_scale: 1.0,
            reward: 0.0,
            r_bar: 0.0,
        }
    }
}

#[derive(Debug)]
pub enum BrainError {
    Gpu(GpuError),
    Load(LoadError),
}

impl fmt::Display for BrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrainError::Gpu(e) => write!(f, "{e}"),
            BrainError::Load(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BrainError {}

impl From<GpuError> for BrainError {
    fn from(e: GpuError) -> Self {
        BrainError::Gpu(e)
    }
}

impl From<LoadError> for BrainError {
    fn from(e: LoadError) -> Self {
        BrainError::Load(e)
    }
}

/// The brain: graph state plus a traversal backend.
///
/// With a GPU bridge attached the device owns the runtime state between
/// passes; the host copy is refreshed on every readback, so the
/// inject/force/read operations always act on current data. Without one,
/// the sequential reference backend runs the identical event procedure
/// on the host arrays.
pub struct Brain {
    cfg: BrainConfig,
    graph: SynapseGraph,
    gpu: Option<GpuBrain>,
    rng: Prng,
}

impl Brain {
    /// Build a randomised brain on the sequential reference backend.
    pub fn new(shape: GraphShape, cfg: BrainConfig) -> Self {
        let mut rng = Prng::seeded(cfg.seed.unwrap_or(1));
        let mut graph = SynapseGraph::build(shape);
        graph.randomise_dense_io_plus_sparse_hidden(&mut rng);
        Self {
            cfg,
            graph,
            gpu: None,
            rng,
        }
    }

    /// Build a randomised brain and attach the GPU bridge.
    ///
    /// A missing adapter or failed pipeline/buffer creation is fatal for
    /// this constructor; there is no partial-init state.
    pub fn with_gpu(shape: GraphShape, cfg: BrainConfig) -> Result<Self, BrainError> {
        let mut brain = Self::new(shape, cfg);
        let gpu = GpuBrain::new(&brain.graph)?;
        info!(
            neurons = shape.n_neuron(),
            synapses = shape.n_syn,
            "GPU traversal backend attached"
        );
        brain.gpu = Some(gpu);
        Ok(brain)
    }

    pub fn cfg(&self) -> &BrainConfig {
        &self.cfg
    }

    pub fn shape(&self) -> GraphShape {
        self.graph.shape()
    }

    pub fn clock(&self) -> u32 {
        self.graph.clock
    }

    /// Read view of the host-side graph state (refreshed after each pass).
    pub fn graph(&self) -> &SynapseGraph {
        &self.graph
    }

    /// Mutable access for construction-time surgery (custom weight
    /// initialisation, scenario setup). With a GPU attached, edits made
    /// here are pushed down on the next `sync_to_device` or `load`.
    pub fn graph_mut(&mut self) -> &mut SynapseGraph {
        &mut self.graph
    }

    /// Signal that the host mutated the graph outside `load`; pushes the
    /// full state (edges + timing) to the device.
    pub fn sync_to_device(&self) {
        if let Some(gpu) = &self.gpu {
            gpu.upload_graph(&self.graph);
        }
    }

    pub fn is_gpu(&self) -> bool {
        self.gpu.is_some()
    }

    /// Poisson input injection: each input neuron spikes with probability
    /// `hz · dtSec · vec[i]`, stamping the current clock. Must run before
    /// the traversal is encoded for the pass.
    pub fn inject_inputs(&mut self, vec: &[f32], hz: f32) {
        let p_base = f64::from(hz) * self.cfg.dt_sec;
        let clock = self.graph.clock;
        for (i, &v) in vec.iter().enumerate().take(self.graph.shape().n_input as usize) {
            if self.rng.bernoulli((p_base * f64::from(v)) as f32) {
                self.graph.last_fired[i] = clock;
            }
        }
    }

    /// Teacher forcing: stamp output `o` as having just fired, so that
    /// downstream STDP observes the target as if the network produced it.
    ///
    /// Never overwrites a timestamp already at the current clock; returns
    /// whether the write happened.
    pub fn force_output(&mut self, o: u32) -> bool {
        let idx = self.graph.shape().output_index(o) as usize;
        let clock = self.graph.clock;
        if clock.wrapping_sub(self.graph.last_fired[idx]) > 1 {
            self.graph.last_fired[idx] = clock;
            true
        } else {
            false
        }
    }

    /// Run one traversal pass of `eventsPerPass` events: reset the spike
    /// budget, publish the harness scalars, dispatch, and chain a
    /// renormalisation when the clock would cross the wrap threshold.
    pub fn run_pass(&mut self, ctl: &PassControl) -> Result<PassStats, BrainError> {
        let params = PassParams {
            n_syn: self.graph.shape().n_syn,
            n_neuron: self.graph.shape().n_neuron(),
            tau_visit: self.cfg.tau_visit,
            tau_pre: self.cfg.tau_pre,
            alpha_ltp: self.cfg.alpha_ltp,
            alpha_ltd: self.cfg.alpha_ltd,
            w_min: self.cfg.w_min,
            w_max: self.cfg.w_max,
            pass_flag: ctl.pass_flag,
            explore_scale: ctl.explore_scale,
            reward: ctl.reward,
            r_bar: ctl.r_bar,
            seed: self.rng.next_u32(),
            events: self.cfg.events_per_pass,
            max_spikes: self.cfg.max_spikes,
            _pad: 0,
        };

        // The traversal advances the clock by exactly one tick per event,
        // so the end-of-pass value is known before dispatch; a renorm is
        // chained into the same submission when it crosses the threshold.
        let projected = self.graph.clock.wrapping_add(params.events);
        let renorm_offset = if projected > self.cfg.renorm_threshold {
            Some(self.cfg.renorm_threshold)
        } else {
            None
        };

        match &self.gpu {
            Some(gpu) => {
                // Host injection/teacher writes land on the host arrays;
                // push them down before the kernel runs.
                gpu.upload_timing(&self.graph);
                Ok(gpu.run_pass(&mut self.graph, &params, renorm_offset)?)
            }
            None => {
                let mut rng = HashRng::new(params.seed);
                let stats = kernel::run_pass_seq(&mut self.graph, &params, &mut rng);
                if let Some(offset) = renorm_offset {
                    kernel::renormalise(&mut self.graph, offset);
                }
                Ok(stats)
            }
        }
    }

    /// Which outputs fired during the most recent pass.
    ///
    /// Window policy: `W = eventsPerPass` ticks ending at the current
    /// clock, i.e. exactly the interval the last traversal stamped. A
    /// timestamp of 0 means "never" and is excluded, as are
    /// teacher-forced stamps (those sit at the pass-start tick, one below
    /// the window).
    pub fn read_outputs(&self) -> Vec<bool> {
        let shape = self.graph.shape();
        let clock = self.graph.clock;
        (0..shape.n_output)
            .map(|o| {
                let lf = self.graph.last_fired[shape.output_index(o) as usize];
                lf != 0 && clock.wrapping_sub(lf) < self.cfg.events_per_pass
            })
            .collect()
    }

    /// Serialise the synapse array in the `.bnn` format. With a GPU
    /// attached the device copy is authoritative and is pulled first.
    pub fn save<W: Write>(&mut self, w: &mut W) -> Result<(), BrainError> {
        if let Some(gpu) = &self.gpu {
            gpu.download_synapses(&mut self.graph)?;
        }
        self.graph.save(w).map_err(LoadError::Io)?;
        Ok(())
    }

    /// Load a `.bnn` stream. A shape mismatch leaves the session graph
    /// untouched so the caller can continue with it.
    pub fn load<R: Read>(&mut self, r: &mut R) -> Result<(), BrainError> {
        self.graph.load(r)?;
        if let Some(gpu) = &self.gpu {
            gpu.upload_graph(&self.graph);
        }
        Ok(())
    }
}
