//! Synapse graph and timing state.
//!
//! A brain is a flat index space of `nInput + nOutput + nHidden` neurons
//! (in that order) connected by a packed array of directed weighted edges.
//! Neurons carry no payload beyond two virtual-tick timestamps; everything
//! else lives on the edges.

use bytemuck::{Pod, Zeroable};
use std::fmt;
use std::io::{self, Read, Write};

use crate::prng::Prng;
use crate::storage;

/// Weight interval for the dense input→output prefix.
pub const W_INIT_IO: (f32, f32) = (0.2, 0.8);
/// Weight interval for the random hidden↔hidden remainder.
pub const W_INIT_HIDDEN: (f32, f32) = (0.05, 0.4);

/// One directed edge, 16 bytes, shared verbatim with the GPU kernel.
///
/// `pad` is reserved for a future per-edge eligibility trace and keeps the
/// record 16-byte aligned.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct SynapsePacked {
    pub src: u32,
    pub dst: u32,
    pub w: f32,
    pub pad: f32,
}

/// Immutable construction-time dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GraphShape {
    pub n_input: u32,
    pub n_output: u32,
    pub n_hidden: u32,
    pub n_syn: u32,
}

impl GraphShape {
    pub fn n_neuron(&self) -> u32 {
        self.n_input + self.n_output + self.n_hidden
    }

    /// Flat index of output neuron `o`.
    pub fn output_index(&self, o: u32) -> u32 {
        self.n_input + o
    }
}

#[derive(Debug)]
pub enum LoadError {
    /// Header disagrees with the brain built for this session.
    ShapeMismatch {
        expected_syn: u32,
        expected_neuron: u32,
        found_syn: u32,
        found_neuron: u32,
    },
    /// An edge endpoint is outside the neuron index space.
    CorruptEdge { index: u32 },
    Io(io::Error),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::ShapeMismatch {
                expected_syn,
                expected_neuron,
                found_syn,
                found_neuron,
            } => write!(
                f,
                "model shape mismatch: file has {found_syn} synapses / {found_neuron} neurons, \
                 session brain has {expected_syn} / {expected_neuron}"
            ),
            LoadError::CorruptEdge { index } => {
                write!(f, "synapse {index} references a neuron outside the graph")
            }
            LoadError::Io(e) => write!(f, "model i/o failed: {e}"),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<io::Error> for LoadError {
    fn from(e: io::Error) -> Self {
        LoadError::Io(e)
    }
}

/// Host-resident graph state: the packed edge array plus per-neuron timing.
///
/// `last_fired[i]` / `last_visited[i]` are virtual ticks; `0` means "never".
/// `clock` is the 32-bit virtual tick counter the traversal kernel advances.
#[derive(Debug, Clone)]
pub struct SynapseGraph {
    shape: GraphShape,
    pub synapses: Vec<SynapsePacked>,
    pub last_fired: Vec<u32>,
    pub last_visited: Vec<u32>,
    pub clock: u32,
}

impl SynapseGraph {
    /// Allocate the packed synapse array and the timing containers, all
    /// seeded to zero. Weights are NOT randomised here.
    pub fn build(shape: GraphShape) -> Self {
        let n = shape.n_neuron() as usize;
        Self {
            shape,
            synapses: vec![SynapsePacked::zeroed(); shape.n_syn as usize],
            last_fired: vec![0; n],
            last_visited: vec![0; n],
            clock: 0,
        }
    }

    pub fn shape(&self) -> GraphShape {
        self.shape
    }

    /// Fill the edge array: the `nInput × nOutput` prefix deterministically
    /// wires every input to every output, the remainder is random
    /// hidden↔hidden edges. Weights draw from two fixed intervals.
    ///
    /// Self-loops and duplicate `(src, dst)` pairs are permitted and never
    /// coalesced.
    pub fn randomise_dense_io_plus_sparse_hidden(&mut self, rng: &mut Prng) {
        let n_in = self.shape.n_input;
        let n_out = self.shape.n_output;
        let n = self.shape.n_neuron();

        let dense = (n_in as usize * n_out as usize).min(self.synapses.len());
        for (k, syn) in self.synapses[..dense].iter_mut().enumerate() {
            syn.src = k as u32 / n_out;
            syn.dst = n_in + (k as u32 % n_out);
            syn.w = rng.range_f32(W_INIT_IO.0, W_INIT_IO.1);
            syn.pad = 0.0;
        }

        // Degenerate shapes with no hidden layer fall back to the full
        // index space so every requested edge still exists.
        let (lo, span) = if self.shape.n_hidden > 0 {
            (n_in + n_out, self.shape.n_hidden)
        } else {
            (0, n)
        };
        for syn in self.synapses[dense..].iter_mut() {
            syn.src = lo + rng.index(span as usize) as u32;
            syn.dst = lo + rng.index(span as usize) as u32;
            syn.w = rng.range_f32(W_INIT_HIDDEN.0, W_INIT_HIDDEN.1);
            syn.pad = 0.0;
        }
    }

    /// Shape-level validation: every edge endpoint must be a real neuron.
    /// Called at construction/load time; the kernel never re-checks.
    pub fn validate(&self) -> Result<(), LoadError> {
        let n = self.shape.n_neuron();
        for (i, syn) in self.synapses.iter().enumerate() {
            if syn.src >= n || syn.dst >= n {
                return Err(LoadError::CorruptEdge { index: i as u32 });
            }
        }
        Ok(())
    }

    /// Serialise in the `.bnn` layout: `u32 nSyn`, `u32 nNeuron`, then the
    /// raw synapse records, all little-endian. No magic, no version tag.
    pub fn save<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_u32_le(w, self.shape.n_syn)?;
        storage::write_u32_le(w, self.shape.n_neuron())?;
        for syn in &self.synapses {
            storage::write_u32_le(w, syn.src)?;
            storage::write_u32_le(w, syn.dst)?;
            storage::write_f32_le(w, syn.w)?;
            storage::write_f32_le(w, syn.pad)?;
        }
        Ok(())
    }

    /// Load a `.bnn` stream into this graph.
    ///
    /// Rejects the stream (leaving the graph untouched) when the header
    /// disagrees with the session shape; the caller is expected to fall
    /// back to its fresh random graph. Timing arrays are not part of the
    /// format and are reset to "never".
    pub fn load<R: Read>(&mut self, r: &mut R) -> Result<(), LoadError> {
        let found_syn = storage::read_u32_le(r)?;
        let found_neuron = storage::read_u32_le(r)?;
        if found_syn != self.shape.n_syn || found_neuron != self.shape.n_neuron() {
            return Err(LoadError::ShapeMismatch {
                expected_syn: self.shape.n_syn,
                expected_neuron: self.shape.n_neuron(),
                found_syn,
                found_neuron,
            });
        }

        let mut synapses = Vec::with_capacity(found_syn as usize);
        for _ in 0..found_syn {
            synapses.push(SynapsePacked {
                src: storage::read_u32_le(r)?,
                dst: storage::read_u32_le(r)?,
                w: storage::read_f32_le(r)?,
                pad: storage::read_f32_le(r)?,
            });
        }

        let n = self.shape.n_neuron();
        for (i, syn) in synapses.iter().enumerate() {
            if syn.src >= n || syn.dst >= n {
                return Err(LoadError::CorruptEdge { index: i as u32 });
            }
        }

        self.synapses = synapses;
        for t in &mut self.last_fired {
            *t = 0;
        }
        for t in &mut self.last_visited {
            *t = 0;
        }
        self.clock = 0;
        Ok(())
    }
}
