//! Engine façade: owns the brain, the training harness and the stimulus
//! provider, handles model-file I/O with a fresh-graph fallback, and
//! drives the pass loop either synchronously or on a background worker.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use crate::brain::{Brain, BrainError};
use crate::stimulus::StimulusProvider;
use crate::trainer::Trainer;

pub struct Engine {
    brain: Brain,
    trainer: Trainer,
    provider: Box<dyn StimulusProvider>,
}

impl Engine {
    pub fn new(brain: Brain, trainer: Trainer, provider: Box<dyn StimulusProvider>) -> Self {
        Self {
            brain,
            trainer,
            provider,
        }
    }

    pub fn brain(&self) -> &Brain {
        &self.brain
    }

    pub fn brain_mut(&mut self) -> &mut Brain {
        &mut self.brain
    }

    pub fn trainer(&self) -> &Trainer {
        &self.trainer
    }

    /// Load a `.bnn` model into the session brain.
    ///
    /// Any failure (missing file, corrupt stream, shape mismatch) leaves
    /// the fresh random graph in place and is reported, not propagated:
    /// the session continues either way. Returns whether the load
    /// happened.
    pub fn load_model(&mut self, path: &Path) -> bool {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!("❌ could not open {}: {e}; continuing with fresh graph", path.display());
                return false;
            }
        };
        match self.brain.load(&mut BufReader::new(file)) {
            Ok(()) => {
                let shape = self.brain.shape();
                info!(
                    "✅ loaded model '{}' (neurons={}, synapses={})",
                    path.display(),
                    shape.n_neuron(),
                    shape.n_syn
                );
                true
            }
            Err(e) => {
                warn!("❌ rejected {}: {e}; continuing with fresh graph", path.display());
                false
            }
        }
    }

    /// Save the current model. I/O failures are reported and non-fatal.
    pub fn save_model(&mut self, path: &Path) -> bool {
        let mut file = match File::create(path) {
            Ok(f) => f,
            Err(e) => {
                error!("❌ could not open {} for writing: {e}", path.display());
                return false;
            }
        };
        match self.brain.save(&mut file) {
            Ok(()) => {
                info!("💾 saved model to {}", path.display());
                true
            }
            Err(e) => {
                error!("❌ save to {} failed: {e}", path.display());
                false
            }
        }
    }

    pub fn run_one_pass(&mut self) -> Result<(), BrainError> {
        self.trainer
            .run_one_pass(&mut self.brain, self.provider.as_mut())
    }

    /// Run `passes` training passes synchronously.
    pub fn run(&mut self, passes: u64) -> Result<(), BrainError> {
        info!("🔋 running network for {passes} passes");
        for _ in 0..passes {
            self.run_one_pass()?;
        }
        Ok(())
    }

    /// Hand the engine to a background worker that drives the pass loop
    /// until asked to stop. Exactly one thread submits kernel work; the
    /// stop flag is observed between passes, never mid-pass.
    pub fn start_async(self) -> RunningEngine {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let mut engine = self;
        let handle = std::thread::spawn(move || {
            while flag.load(Ordering::Relaxed) {
                if let Err(e) = engine.run_one_pass() {
                    error!("❌ pass failed, stopping worker: {e}");
                    break;
                }
            }
            engine
        });
        RunningEngine { running, handle }
    }
}

/// Handle to the background training worker.
pub struct RunningEngine {
    running: Arc<AtomicBool>,
    handle: JoinHandle<Engine>,
}

impl RunningEngine {
    /// Request a stop and wait for the current pass to complete; returns
    /// the engine for further use (save, inspection, restart).
    pub fn stop(self) -> Engine {
        self.running.store(false, Ordering::Relaxed);
        match self.handle.join() {
            Ok(engine) => engine,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::BrainConfig;
    use crate::graph::GraphShape;
    use crate::stimulus::ConstantStimulus;
    use crate::trainer::TrainerConfig;

    fn test_engine() -> Engine {
        let shape = GraphShape {
            n_input: 2,
            n_output: 1,
            n_hidden: 2,
            n_syn: 6,
        };
        let cfg = BrainConfig {
            events_per_pass: 16,
            seed: Some(5),
            ..BrainConfig::default()
        };
        let brain = Brain::new(shape, cfg);
        let trainer_cfg = TrainerConfig {
            trace_path: std::env::temp_dir()
                .join("abnn_engine_test.m")
                .to_string_lossy()
                .into_owned(),
            trace_rewrite_every: u32::MAX,
            ..TrainerConfig::default()
        };
        let trainer = Trainer::new(trainer_cfg, 1, 5);
        let provider = Box::new(ConstantStimulus::new(vec![0.5, 0.5], vec![0.5], 0.0009));
        Engine::new(brain, trainer, provider)
    }

    #[test]
    fn synchronous_run_advances_passes() {
        let mut engine = test_engine();
        engine.run(10).unwrap();
        assert_eq!(engine.trainer().pass_count(), 10);
        assert_eq!(engine.brain().clock(), 160);
    }

    #[test]
    fn missing_model_file_falls_back_to_fresh_graph() {
        let mut engine = test_engine();
        let before = engine.brain().graph().synapses.clone();
        assert!(!engine.load_model(Path::new("/nonexistent/model.bnn")));
        assert_eq!(engine.brain().graph().synapses.len(), before.len());
    }

    #[test]
    fn save_then_load_roundtrips_via_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bnn");

        let mut engine = test_engine();
        assert!(engine.save_model(&path));

        let mut other = test_engine();
        assert!(other.load_model(&path));
        for (a, b) in engine
            .brain()
            .graph()
            .synapses
            .iter()
            .zip(&other.brain().graph().synapses)
        {
            assert_eq!(a.w.to_bits(), b.w.to_bits());
        }
    }

    #[test]
    fn async_worker_stops_between_passes() {
        let engine = test_engine();
        let running = engine.start_async();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let engine = running.stop();
        let count = engine.trainer().pass_count();
        assert!(count > 0);
        // Clock advanced by a whole number of passes: no mid-pass stop.
        assert_eq!(engine.brain().clock() as u64, count * 16);
    }
}
