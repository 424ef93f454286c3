//! GPU compute backend using wgpu for the Monte-Carlo traversal kernel.
//!
//! One traversal dispatch runs `eventsPerPass` independent threads, each
//! executing a single edge-traversal decision against shared atomic state
//! (clock, spike budget, per-neuron timestamps, edge weights). A second
//! kernel renormalises the clock and timestamps near 32-bit wrap; the host
//! chains it into the same submission so nothing else touches the buffers
//! while it runs.
//!
//! Device buffers are allocated once and live for the process; per pass
//! the host rewrites the scalar block, dispatches, and reads the timing
//! arrays back through a staging buffer.

use bytemuck::{Pod, Zeroable};
use std::borrow::Cow;
use wgpu::util::DeviceExt;

use crate::graph::{GraphShape, SynapseGraph};
use crate::kernel::{PassParams, PassStats, DW_FIXED_SCALE};

const WORKGROUP_SIZE: u32 = 256;
// wgpu caps workgroup counts per dimension; large event grids fold into 2D.
const MAX_GROUPS_PER_DIM: u32 = 65_535;

/// Device-resident scalar block, rewritten by the host at pass start.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct GpuGlobals {
    clock: u32,
    budget: i32,
    fired: u32,
    dw_abs_fp: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct RenormParams {
    offset: u32,
    n_neuron: u32,
    _pad0: u32,
    _pad1: u32,
}

/// Error type for GPU operations.
#[derive(Debug)]
pub enum GpuError {
    /// Adapter, device or pipeline creation failed. Fatal at startup.
    ResourceFailure(String),
    /// Failed to receive result from GPU.
    ReceiveError,
    /// GPU buffer mapping failed.
    MapError(wgpu::BufferAsyncError),
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuError::ResourceFailure(what) => write!(f, "GPU resource creation failed: {what}"),
            GpuError::ReceiveError => write!(f, "Failed to receive GPU result"),
            GpuError::MapError(e) => write!(f, "GPU buffer mapping failed: {:?}", e),
        }
    }
}

impl std::error::Error for GpuError {}

/// GPU bridge: owns the device, both pipelines and every persistent buffer.
pub struct GpuBrain {
    device: wgpu::Device,
    queue: wgpu::Queue,
    traversal_pipeline: wgpu::ComputePipeline,
    renorm_pipeline: wgpu::ComputePipeline,
    traversal_bind: wgpu::BindGroup,
    renorm_bind: wgpu::BindGroup,

    syn_buf: wgpu::Buffer,
    fired_buf: wgpu::Buffer,
    visited_buf: wgpu::Buffer,
    globals_buf: wgpu::Buffer,
    params_buf: wgpu::Buffer,
    renorm_params_buf: wgpu::Buffer,

    staging_fired: wgpu::Buffer,
    staging_visited: wgpu::Buffer,
    staging_globals: wgpu::Buffer,
    staging_syn: wgpu::Buffer,

    shape: GraphShape,
}

impl GpuBrain {
    /// Build the pipelines and allocate every device buffer, uploading the
    /// graph's current contents. Blocks until the GPU is ready.
    pub fn new(graph: &SynapseGraph) -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| GpuError::ResourceFailure("no compatible adapter".into()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("ABNN GPU"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| GpuError::ResourceFailure(format!("request_device: {e}")))?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Traversal Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(TRAVERSAL_SHADER)),
        });

        let storage_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let uniform_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let traversal_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Traversal Bind Group Layout"),
            entries: &[
                storage_entry(0), // synapses
                storage_entry(1), // lastFired
                storage_entry(2), // lastVisited
                storage_entry(3), // globals
                uniform_entry(4), // params
            ],
        });

        let renorm_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Renorm Bind Group Layout"),
            entries: &[
                storage_entry(0), // lastFired
                storage_entry(1), // lastVisited
                storage_entry(2), // globals
                uniform_entry(3), // renorm params
            ],
        });

        let traversal_pipeline =
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Traversal Pipeline"),
                layout: Some(&device.create_pipeline_layout(
                    &wgpu::PipelineLayoutDescriptor {
                        label: Some("Traversal Pipeline Layout"),
                        bind_group_layouts: &[&traversal_layout],
                        push_constant_ranges: &[],
                    },
                )),
                module: &shader,
                entry_point: Some("traverse"),
                compilation_options: Default::default(),
                cache: None,
            });

        let renorm_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Renorm Pipeline"),
            layout: Some(&device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Renorm Pipeline Layout"),
                bind_group_layouts: &[&renorm_layout],
                push_constant_ranges: &[],
            })),
            module: &shader,
            entry_point: Some("renorm"),
            compilation_options: Default::default(),
            cache: None,
        });

        let shape = graph.shape();
        let n = shape.n_neuron() as u64;
        let timing_bytes = n * 4;
        let syn_bytes = shape.n_syn as u64 * 16;

        let syn_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Synapse Buffer"),
            contents: bytemuck::cast_slice(&graph.synapses),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        });
        let fired_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("LastFired Buffer"),
            contents: bytemuck::cast_slice(&graph.last_fired),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        });
        let visited_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("LastVisited Buffer"),
            contents: bytemuck::cast_slice(&graph.last_visited),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        });
        let globals_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Globals Buffer"),
            contents: bytemuck::bytes_of(&GpuGlobals {
                clock: graph.clock,
                budget: 0,
                fired: 0,
                dw_abs_fp: 0,
            }),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        });
        let params_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Params Buffer"),
            size: std::mem::size_of::<PassParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let renorm_params_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Renorm Params Buffer"),
            size: std::mem::size_of::<RenormParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let staging = |label: &str, size: u64| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let staging_fired = staging("LastFired Staging", timing_bytes);
        let staging_visited = staging("LastVisited Staging", timing_bytes);
        let staging_globals = staging("Globals Staging", 16);
        let staging_syn = staging("Synapse Staging", syn_bytes);

        let traversal_bind = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Traversal Bind Group"),
            layout: &traversal_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: syn_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: fired_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: visited_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: globals_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });
        let renorm_bind = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Renorm Bind Group"),
            layout: &renorm_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: fired_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: visited_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: globals_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: renorm_params_buf.as_entire_binding(),
                },
            ],
        });

        Ok(Self {
            device,
            queue,
            traversal_pipeline,
            renorm_pipeline,
            traversal_bind,
            renorm_bind,
            syn_buf,
            fired_buf,
            visited_buf,
            globals_buf,
            params_buf,
            renorm_params_buf,
            staging_fired,
            staging_visited,
            staging_globals,
            staging_syn,
            shape,
        })
    }

    /// Push the host graph (edges + timing + clock) to the device. Called
    /// after construction-time randomisation and after a model load; during
    /// runtime the GPU is the sole writer of these buffers.
    pub fn upload_graph(&self, graph: &SynapseGraph) {
        self.queue
            .write_buffer(&self.syn_buf, 0, bytemuck::cast_slice(&graph.synapses));
        self.upload_timing(graph);
    }

    /// Push only the timing arrays, used between passes when the host has
    /// injected input spikes or teacher-forced outputs.
    pub fn upload_timing(&self, graph: &SynapseGraph) {
        self.queue
            .write_buffer(&self.fired_buf, 0, bytemuck::cast_slice(&graph.last_fired));
        self.queue.write_buffer(
            &self.visited_buf,
            0,
            bytemuck::cast_slice(&graph.last_visited),
        );
    }

    /// Encode and submit one pass: budget reset, traversal dispatch over
    /// `params.events` threads, an optional chained renormalisation, then
    /// a synchronous readback of timing arrays and counters into `graph`.
    pub fn run_pass(
        &self,
        graph: &mut SynapseGraph,
        params: &PassParams,
        renorm_offset: Option<u32>,
    ) -> Result<PassStats, GpuError> {
        let clock_start = graph.clock;

        self.queue.write_buffer(
            &self.globals_buf,
            0,
            bytemuck::bytes_of(&GpuGlobals {
                clock: clock_start,
                budget: params.max_spikes as i32,
                fired: 0,
                dw_abs_fp: 0,
            }),
        );
        self.queue
            .write_buffer(&self.params_buf, 0, bytemuck::bytes_of(params));
        if let Some(offset) = renorm_offset {
            self.queue.write_buffer(
                &self.renorm_params_buf,
                0,
                bytemuck::bytes_of(&RenormParams {
                    offset,
                    n_neuron: self.shape.n_neuron(),
                    _pad0: 0,
                    _pad1: 0,
                }),
            );
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Pass Encoder"),
            });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Traversal Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.traversal_pipeline);
            pass.set_bind_group(0, &self.traversal_bind, &[]);
            let (x, y) = dispatch_grid(params.events);
            pass.dispatch_workgroups(x, y, 1);
        }

        if renorm_offset.is_some() {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Renorm Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.renorm_pipeline);
            pass.set_bind_group(0, &self.renorm_bind, &[]);
            pass.dispatch_workgroups(self.shape.n_neuron().div_ceil(WORKGROUP_SIZE), 1, 1);
        }

        let n = self.shape.n_neuron() as u64;
        encoder.copy_buffer_to_buffer(&self.fired_buf, 0, &self.staging_fired, 0, n * 4);
        encoder.copy_buffer_to_buffer(&self.visited_buf, 0, &self.staging_visited, 0, n * 4);
        encoder.copy_buffer_to_buffer(&self.globals_buf, 0, &self.staging_globals, 0, 16);

        self.queue.submit(std::iter::once(encoder.finish()));

        let fired_data: Vec<u32> = self.read_staging(&self.staging_fired)?;
        let visited_data: Vec<u32> = self.read_staging(&self.staging_visited)?;
        let globals: GpuGlobals = self.read_staging::<GpuGlobals>(&self.staging_globals)?[0];

        graph.last_fired.copy_from_slice(&fired_data);
        graph.last_visited.copy_from_slice(&visited_data);
        graph.clock = globals.clock;

        Ok(PassStats {
            fired: globals.fired,
            dw_abs: globals.dw_abs_fp as f32 / DW_FIXED_SCALE,
            clock_start,
            clock_end: clock_start.wrapping_add(params.events),
        })
    }

    /// Pull the synapse array back to the host (used by `save`).
    pub fn download_synapses(&self, graph: &mut SynapseGraph) -> Result<(), GpuError> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Synapse Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(
            &self.syn_buf,
            0,
            &self.staging_syn,
            0,
            self.shape.n_syn as u64 * 16,
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let data: Vec<crate::graph::SynapsePacked> = self.read_staging(&self.staging_syn)?;
        graph.synapses.copy_from_slice(&data);
        Ok(())
    }

    fn read_staging<T: Pod>(&self, buffer: &wgpu::Buffer) -> Result<Vec<T>, GpuError> {
        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        let map_result = rx.recv().map_err(|_| GpuError::ReceiveError)?;
        map_result.map_err(GpuError::MapError)?;

        let data = bytemuck::pod_collect_to_vec(&slice.get_mapped_range());
        buffer.unmap();
        Ok(data)
    }
}

/// Fold an event count into a 2D workgroup grid: a single dimension caps
/// at 65,535 groups, far below the largest pass sizes.
fn dispatch_grid(events: u32) -> (u32, u32) {
    let groups = events.div_ceil(WORKGROUP_SIZE).max(1);
    if groups <= MAX_GROUPS_PER_DIM {
        (groups, 1)
    } else {
        (MAX_GROUPS_PER_DIM, groups.div_ceil(MAX_GROUPS_PER_DIM))
    }
}

/// WGSL source for both kernels.
///
/// The traversal entry point is the device-side twin of
/// `kernel::run_pass_seq`; `event_hash` must match `prng::hash_u32`.
const TRAVERSAL_SHADER: &str = r#"
struct Synapse {
    src: u32,
    dst: u32,
    w: atomic<u32>,
    pad: f32,
}

struct Globals {
    clock: atomic<u32>,
    budget: atomic<i32>,
    fired: atomic<u32>,
    dw_abs_fp: atomic<u32>,
}

struct Params {
    n_syn: u32,
    n_neuron: u32,
    tau_visit: u32,
    tau_pre: u32,
    alpha_ltp: f32,
    alpha_ltd: f32,
    w_min: f32,
    w_max: f32,
    pass_flag: u32,
    explore_scale: f32,
    reward: f32,
    r_bar: f32,
    seed: u32,
    events: u32,
    max_spikes: u32,
    _pad: u32,
}

struct RenormParams {
    offset: u32,
    n_neuron: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<storage, read_write> synapses: array<Synapse>;
@group(0) @binding(1) var<storage, read_write> last_fired: array<atomic<u32>>;
@group(0) @binding(2) var<storage, read_write> last_visited: array<atomic<u32>>;
@group(0) @binding(3) var<storage, read_write> globals: Globals;
@group(0) @binding(4) var<uniform> params: Params;

const PASS_REWARD: u32 = 1u;
const DW_FIXED_SCALE: f32 = 65536.0;

fn event_hash(v: u32) -> u32 {
    var x = v + 0x9E3779B9u;
    x ^= x >> 16u;
    x *= 0x85EBCA6Bu;
    x ^= x >> 13u;
    x *= 0xC2B2AE35u;
    x ^= x >> 16u;
    return x;
}

@compute @workgroup_size(256)
fn traverse(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let e = gid.y * nwg.x * 256u + gid.x;
    if e >= params.events {
        return;
    }

    let h0 = event_hash(params.seed ^ e);
    let idx = h0 % max(params.n_syn, 1u);
    let uni = f32(event_hash(h0)) / 4294967296.0;

    let src = synapses[idx].src;
    let dst = synapses[idx].dst;
    let w = bitcast<f32>(atomicLoad(&synapses[idx].w));

    // Monotone clock advance: `now` is a valid comparison basis for any
    // previously stored timestamp.
    let now = atomicAdd(&globals.clock, 1u) + 1u;
    let prev_visit = atomicExchange(&last_visited[dst], now);

    let dt_spike = now - atomicLoad(&last_fired[src]);
    let dt_visit = now - prev_visit;

    let visit_factor = exp(-f32(dt_visit) / f32(params.tau_visit));
    let p_fire = w * visit_factor * params.explore_scale;

    var fire = dt_spike < params.tau_pre && uni < p_fire;
    if fire {
        // Strict upper bound on firings per pass.
        if atomicSub(&globals.budget, 1) <= 0 {
            fire = false;
        }
    }
    if fire {
        atomicStore(&last_fired[dst], now);
        atomicAdd(&globals.fired, 1u);
    }

    var modulation = 1.0;
    if params.pass_flag == PASS_REWARD {
        modulation = params.reward - params.r_bar;
    }

    // Clamp-and-store through CAS on the weight bits; racing events on the
    // same edge retry against the freshest value.
    var old_bits = atomicLoad(&synapses[idx].w);
    var applied = 0.0;
    loop {
        let cur = bitcast<f32>(old_bits);
        var delta: f32;
        if dt_spike < params.tau_pre {
            delta = params.alpha_ltp * (params.w_max - cur) * modulation;
        } else {
            delta = -params.alpha_ltd * (cur - params.w_min) * modulation;
        }
        let next = clamp(cur + delta, params.w_min, params.w_max);
        let r = atomicCompareExchangeWeak(&synapses[idx].w, old_bits, bitcast<u32>(next));
        if r.exchanged {
            applied = delta;
            break;
        }
        old_bits = r.old_value;
    }
    atomicAdd(&globals.dw_abs_fp, u32(abs(applied) * DW_FIXED_SCALE));
}

@group(0) @binding(0) var<storage, read_write> rn_last_fired: array<u32>;
@group(0) @binding(1) var<storage, read_write> rn_last_visited: array<u32>;
@group(0) @binding(2) var<storage, read_write> rn_globals: Globals;
@group(0) @binding(3) var<uniform> rn_params: RenormParams;

@compute @workgroup_size(256)
fn renorm(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if i >= rn_params.n_neuron {
        return;
    }

    // 0 means "never" and survives; anything at or below the offset
    // collapses to "never" instead of wrapping.
    let lf = rn_last_fired[i];
    rn_last_fired[i] = select(0u, lf - rn_params.offset, lf > rn_params.offset);
    let lv = rn_last_visited[i];
    rn_last_visited[i] = select(0u, lv - rn_params.offset, lv > rn_params.offset);

    if i == 0u {
        let c = atomicLoad(&rn_globals.clock);
        atomicStore(&rn_globals.clock, c - min(rn_params.offset, c));
    }
}
"#;
