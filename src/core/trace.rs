//! Loss smoothing and MATLAB-style trace emission for offline plotting.
//!
//! The trace file is a plain-text script of vector assignments and
//! plotting directives, rewritten atomically on a cadence so an external
//! plotter can re-run it at any time. Readers must tolerate a missing
//! file; I/O failures here are reported and never interrupt training.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use tracing::warn;

/// EMA smoothing factor for the loss series.
pub const EMA_BETA: f32 = 0.98;

/// How many recent frames a rewrite keeps.
const FRAME_RING: usize = 64;

#[derive(Debug, Clone)]
struct TraceFrame {
    input: Vec<f32>,
    output: Vec<f32>,
    expected: Vec<f32>,
}

/// Session trace writer plus the EMA loss accumulator.
#[derive(Debug)]
pub struct TraceLogger {
    path: PathBuf,
    rewrite_every: u32,
    frames: Vec<TraceFrame>,
    frames_since_write: u32,
    ema_loss: Option<f32>,
}

impl TraceLogger {
    pub fn new(path: impl Into<PathBuf>, rewrite_every: u32) -> Self {
        Self {
            path: path.into(),
            rewrite_every: rewrite_every.max(1),
            frames: Vec::new(),
            frames_since_write: 0,
            ema_loss: None,
        }
    }

    /// Fold one loss-window result into the EMA series.
    pub fn record_loss(&mut self, loss: f32) {
        self.ema_loss = Some(match self.ema_loss {
            Some(ema) => EMA_BETA * ema + (1.0 - EMA_BETA) * loss,
            None => loss,
        });
    }

    pub fn ema_loss(&self) -> Option<f32> {
        self.ema_loss
    }

    /// Buffer one input/output/expected snapshot; rewrites the trace file
    /// when the cadence elapses.
    pub fn record_frame(&mut self, input: &[f32], output: &[f32], expected: &[f32]) {
        self.frames.push(TraceFrame {
            input: input.to_vec(),
            output: output.to_vec(),
            expected: expected.to_vec(),
        });
        if self.frames.len() > FRAME_RING {
            self.frames.remove(0);
        }

        self.frames_since_write += 1;
        if self.frames_since_write >= self.rewrite_every {
            self.frames_since_write = 0;
            self.flush();
        }
    }

    /// Truncate and rewrite the trace file from the frame ring. Writes to
    /// a sibling temp file and renames it over the target so readers never
    /// observe a half-written script.
    pub fn flush(&mut self) {
        let mut script = String::new();
        for frame in &self.frames {
            script.push_str("clf; hold on;\n");
            script.push_str("ylim([-1 1], \"Manual\");\n");
            push_vector(&mut script, "input", &frame.input);
            push_vector(&mut script, "target", &frame.expected);
            push_vector(&mut script, "output", &frame.output);
            script.push_str(&format!(
                "scatter(1:{}, target, 'filled', 'b', 'DisplayName', 'Target');\n",
                frame.expected.len()
            ));
            script.push_str(&format!(
                "scatter(1:{}, output, 'filled', 'r', 'DisplayName', 'Output');\n",
                frame.output.len()
            ));
            script.push_str("legend('show');\n");
            script.push_str("pause(0.01);\n");
        }

        if let Err(e) = self.write_atomic(&script) {
            warn!("trace write to {:?} failed: {e}", self.path);
        }
    }

    fn write_atomic(&self, content: &str) -> std::io::Result<()> {
        let tmp = self.path.with_extension("m.tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(content.as_bytes())?;
        }
        fs::rename(&tmp, &self.path)
    }
}

fn push_vector(script: &mut String, name: &str, values: &[f32]) {
    script.push_str(name);
    script.push_str(" = [");
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            script.push_str(", ");
        }
        script.push_str(&format!("{v}"));
    }
    script.push_str("];\n");
}
