//! ABNN command-line driver.
//!
//! Builds a brain from an optional JSON config, restores a saved model
//! when one exists, trains against the functional stimulus, and persists
//! the result.

use std::path::PathBuf;
use std::process;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use abnn::brain::{Brain, BrainConfig};
use abnn::engine::Engine;
use abnn::graph::GraphShape;
use abnn::stimulus::FunctionalStimulus;
use abnn::trainer::{Trainer, TrainerConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    n_input: u32,
    n_output: u32,
    n_hidden: u32,
    n_syn: u32,
    /// Stimulus wave frequency in Hz.
    stimulus_freq_hz: f64,
    brain: BrainConfig,
    trainer: TrainerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            n_input: 64,
            n_output: 16,
            n_hidden: 4096,
            n_syn: 200_000,
            stimulus_freq_hz: 2.0,
            brain: BrainConfig::default(),
            trainer: TrainerConfig::default(),
        }
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 2 && (args[1] == "--help" || args[1] == "-h" || args[1] == "help") {
        print_help();
        return;
    }

    let mut passes: u64 = 10_000;
    let mut model_path = PathBuf::from("model.bnn");
    let mut config_path: Option<PathBuf> = None;
    let mut use_cpu = false;

    let mut it = args.iter().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "run" => {}
            "--passes" => match it.next().and_then(|v| v.parse().ok()) {
                Some(n) => passes = n,
                None => {
                    eprintln!("--passes needs a number");
                    process::exit(2);
                }
            },
            "--model" => match it.next() {
                Some(p) => model_path = PathBuf::from(p),
                None => {
                    eprintln!("--model needs a path");
                    process::exit(2);
                }
            },
            "--config" => match it.next() {
                Some(p) => config_path = Some(PathBuf::from(p)),
                None => {
                    eprintln!("--config needs a path");
                    process::exit(2);
                }
            },
            "--cpu" => use_cpu = true,
            other => {
                eprintln!("Unknown argument: {other}");
                print_help();
                process::exit(2);
            }
        }
    }

    let cfg = match &config_path {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<AppConfig>(&text) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!("❌ bad config {}: {e}", path.display());
                    process::exit(2);
                }
            },
            Err(e) => {
                error!("❌ could not read {}: {e}", path.display());
                process::exit(2);
            }
        },
        None => AppConfig::default(),
    };

    let shape = GraphShape {
        n_input: cfg.n_input,
        n_output: cfg.n_output,
        n_hidden: cfg.n_hidden,
        n_syn: cfg.n_syn,
    };

    let brain = if use_cpu {
        warn!("running on the sequential reference backend");
        Brain::new(shape, cfg.brain)
    } else {
        // GPU setup failure is fatal at startup; no partial-init state.
        match Brain::with_gpu(shape, cfg.brain) {
            Ok(b) => b,
            Err(e) => {
                error!("❌ GPU setup failed: {e}");
                process::exit(1);
            }
        }
    };

    let seed = cfg.brain.seed.unwrap_or(1);
    let trainer = Trainer::new(cfg.trainer.clone(), cfg.n_output as usize, seed);
    let provider = Box::new(FunctionalStimulus::new(
        cfg.n_input as usize,
        cfg.n_output as usize,
        cfg.brain.dt_sec,
        cfg.stimulus_freq_hz,
    ));

    let mut engine = Engine::new(brain, trainer, provider);
    engine.load_model(&model_path);

    if let Err(e) = engine.run(passes) {
        error!("❌ training aborted: {e}");
        process::exit(1);
    }

    info!(
        loss = engine.trainer().last_loss(),
        ema = engine.trainer().ema_loss().unwrap_or(f32::NAN),
        teacher = engine.trainer().teacher_rate(),
        "training finished"
    );
    engine.save_model(&model_path);
}

fn print_help() {
    println!("abnn (asynchronous biological neural network)");
    println!("usage:");
    println!("  abnn run [--passes N] [--model model.bnn] [--config cfg.json] [--cpu]");
    println!("  abnn --help");
    println!();
    println!("Loads model.bnn when present (falling back to a fresh random graph),");
    println!("trains against the functional stimulus, then saves the model back.");
}
