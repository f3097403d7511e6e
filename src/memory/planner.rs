//! The layer-placement solver.
//!
//! Given per-layer byte sizes and the free memory of each GPU, decides
//! which layers live where. Capacity is searched with a binary chop over a
//! fill fraction so identical fits carry the least possible slack, and a
//! second pass retries without the output layer when the full set does not
//! land.

use std::collections::BTreeMap;

use tracing::debug;

use super::{BackendMemory, GraphEstimate, PlanError};
use crate::device::{DeviceId, DeviceInfo, SystemInfo};

/// Floor reserved on every GPU before any layer is placed, covering
/// allocator slop and small runtime buffers.
const MIN_GPU_MEMORY: u64 = 457 << 20;

/// Binary-search convergence threshold on the fill fraction.
const FIT_EPSILON: f64 = 1e-6;

/// Search ceiling when a manual layer count must be honored regardless of
/// reported free memory.
const FORCE_CEILING: f64 = 1000.0;

/// Planner knobs.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Refuse layouts that leave any layer on CPU.
    pub require_full: bool,

    /// Extra fraction of each GPU withheld, raised by the load driver when
    /// allocations keep failing. In `[0, 1]`.
    pub backoff: f64,

    /// Manual GPU layer count; `None` is automatic.
    pub num_gpu: Option<usize>,

    /// Spread layers across every GPU instead of packing tightly.
    pub spread: bool,

    /// Flat per-GPU overhead from the environment.
    pub gpu_overhead: u64,
}

/// Mapping from device to the sorted layer indices it hosts. Layers not
/// present run on CPU. The output layer is index `block_count`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LayerAssignment {
    pub devices: BTreeMap<DeviceId, Vec<usize>>,
}

impl LayerAssignment {
    pub fn assigned_count(&self) -> usize {
        self.devices.values().map(Vec::len).sum()
    }

    pub fn contains(&self, layer: usize) -> bool {
        self.devices.values().any(|v| v.contains(&layer))
    }

    pub fn device_of(&self, layer: usize) -> Option<&DeviceId> {
        self.devices
            .iter()
            .find(|(_, v)| v.contains(&layer))
            .map(|(d, _)| d)
    }

    /// Per-device layer counts, ordered by device id: the wire form of
    /// `gpu_layers` in the load request.
    pub fn gpu_layers(&self) -> Vec<(DeviceId, Vec<usize>)> {
        self.devices
            .iter()
            .map(|(d, v)| (d.clone(), v.clone()))
            .collect()
    }

    fn push(&mut self, device: &DeviceId, layer: usize) {
        self.devices.entry(device.clone()).or_default().push(layer);
    }

    fn normalize(&mut self) {
        self.devices.retain(|_, v| !v.is_empty());
        for v in self.devices.values_mut() {
            v.sort_unstable();
        }
    }
}

/// A finished plan: the assignment plus its memory verdict.
#[derive(Debug, Clone)]
pub struct Plan {
    pub assignment: LayerAssignment,

    /// Layers placed on GPUs.
    pub num_gpu: usize,

    /// Host bytes: input weights, CPU graph, and every unassigned layer.
    pub cpu_size: u64,

    /// Device bytes: assigned layers plus each used GPU's graph.
    pub vram_size: u64,
}

/// Run the placement solver.
///
/// `memory` holds the most recent per-layer sizes observed from the worker
/// (all zeros on the first iteration, when everything is assumed to fit).
pub fn plan(
    system: &SystemInfo,
    gpus: &[DeviceInfo],
    memory: &BackendMemory,
    estimate: &GraphEstimate,
    opts: &PlanOptions,
) -> Result<Plan, PlanError> {
    let layers = layer_count(memory);
    let layer_sizes = memory.layer_sizes(layers);

    // Step 1: reserve headroom per GPU before anything is placed.
    let candidates: Vec<(DeviceInfo, u64)> = gpus
        .iter()
        .map(|gpu| {
            let graph = memory.gpu(&gpu.id).map(|g| g.graph).unwrap_or(0);
            let reserved = (gpu.free_memory as f64 * opts.backoff) as u64
                + MIN_GPU_MEMORY
                + opts.gpu_overhead
                + graph;
            (gpu.clone(), gpu.free_memory.saturating_sub(reserved))
        })
        .collect();

    // Steps 2-3: pack layers, library by library, best group wins.
    let mut assignment = if opts.num_gpu == Some(0) || candidates.is_empty() {
        LayerAssignment::default()
    } else {
        best_library_fit(&layer_sizes, &candidates, opts)
    };
    assignment.normalize();

    let verdict = verify(system, memory, estimate, &layer_sizes, assignment, opts)?;

    debug!(
        layers,
        on_gpu = verdict.num_gpu,
        cpu_size = verdict.cpu_size,
        vram_size = verdict.vram_size,
        "planned layout"
    );

    Ok(verdict)
}

fn layer_count(memory: &BackendMemory) -> usize {
    memory
        .gpus
        .iter()
        .map(|g| g.weights.len())
        .chain(std::iter::once(memory.cpu.weights.len()))
        .max()
        .unwrap_or(0)
}

/// Never mix libraries: fit each library's GPUs separately and keep the
/// group that places the most layers (ties broken by total free memory).
fn best_library_fit(
    layer_sizes: &[u64],
    candidates: &[(DeviceInfo, u64)],
    opts: &PlanOptions,
) -> LayerAssignment {
    let mut groups: BTreeMap<String, Vec<(DeviceInfo, u64)>> = BTreeMap::new();
    for (gpu, free) in candidates {
        groups
            .entry(gpu.library.to_string())
            .or_default()
            .push((gpu.clone(), *free));
    }

    let mut best = LayerAssignment::default();
    let mut best_key = (0usize, 0u64);
    for group in groups.values_mut() {
        group.sort_by(|a, b| b.0.performance_key().cmp(&a.0.performance_key()));
        let devices: Vec<(DeviceId, u64)> = group
            .iter()
            .map(|(gpu, free)| (gpu.id.clone(), *free))
            .collect();

        let fit = if opts.spread {
            spread_fit(layer_sizes.len(), &devices)
        } else {
            find_best_fit(layer_sizes, &devices, opts.num_gpu)
        };

        let key = (fit.assigned_count(), devices.iter().map(|d| d.1).sum());
        if key > best_key {
            best_key = key;
            best = fit;
        }
    }
    best
}

/// Binary-search the smallest fill fraction that places the same number of
/// layers as an unconstrained run, then retry without the output layer if
/// the whole model did not land.
fn find_best_fit(
    layer_sizes: &[u64],
    gpus: &[(DeviceId, u64)],
    requested: Option<usize>,
) -> LayerAssignment {
    let force = requested.is_some();
    let ceiling = if force { FORCE_CEILING } else { 1.0 };

    let first = search(layer_sizes, gpus, ceiling, requested);
    if force || first.assigned_count() == layer_sizes.len() {
        return first;
    }

    // Second pass: the output layer (last index) stays on CPU so the
    // transformer blocks can pack without it.
    let blocks = &layer_sizes[..layer_sizes.len().saturating_sub(1)];
    let second = search(blocks, gpus, ceiling, None);
    if second.assigned_count() > first.assigned_count() {
        second
    } else {
        first
    }
}

fn search(
    layer_sizes: &[u64],
    gpus: &[(DeviceId, u64)],
    ceiling: f64,
    limit: Option<usize>,
) -> LayerAssignment {
    let baseline = greedy_fit(layer_sizes, gpus, ceiling, limit);
    let target = baseline.assigned_count();

    let mut best = baseline;
    let (mut lo, mut hi) = (0.0f64, ceiling);
    while hi - lo > FIT_EPSILON {
        let mid = (lo + hi) / 2.0;
        let fit = greedy_fit(layer_sizes, gpus, mid, limit);
        if fit.assigned_count() == target {
            best = fit;
            hi = mid;
        } else {
            lo = mid;
        }
    }
    best
}

/// Scan layers from last to first, filling each GPU to `free * fraction`
/// and advancing to the next when one fills.
fn greedy_fit(
    layer_sizes: &[u64],
    gpus: &[(DeviceId, u64)],
    fraction: f64,
    limit: Option<usize>,
) -> LayerAssignment {
    let mut assignment = LayerAssignment::default();
    let mut gi = 0usize;
    let mut used = 0f64;
    let mut assigned = 0usize;

    for i in (0..layer_sizes.len()).rev() {
        if limit.is_some_and(|n| assigned >= n) {
            break;
        }
        let size = layer_sizes[i] as f64;
        while gi < gpus.len() && used + size > gpus[gi].1 as f64 * fraction {
            gi += 1;
            used = 0.0;
        }
        if gi >= gpus.len() {
            break;
        }
        assignment.push(&gpus[gi].0, i);
        used += size;
        assigned += 1;
    }
    assignment
}

/// Distribute every layer across all GPUs in near-equal contiguous runs,
/// ignoring fit.
fn spread_fit(layers: usize, gpus: &[(DeviceId, u64)]) -> LayerAssignment {
    let mut assignment = LayerAssignment::default();
    if gpus.is_empty() {
        return assignment;
    }
    let per = layers.div_ceil(gpus.len());
    for i in 0..layers {
        let gi = (i / per).min(gpus.len() - 1);
        assignment.push(&gpus[gi].0, i);
    }
    assignment
}

/// Step 4: size the halves of the split and apply the platform rules.
fn verify(
    system: &SystemInfo,
    memory: &BackendMemory,
    estimate: &GraphEstimate,
    layer_sizes: &[u64],
    assignment: LayerAssignment,
    opts: &PlanOptions,
) -> Result<Plan, PlanError> {
    let total = layer_sizes.len();
    let assigned = assignment.assigned_count();

    let cpu_layers: u64 = (0..total)
        .filter(|&i| !assignment.contains(i))
        .map(|i| layer_sizes[i])
        .sum();
    let cpu_size = memory.input_weights + memory.cpu.graph + cpu_layers;

    let gpu_layers: u64 = (0..total)
        .filter(|&i| assignment.contains(i))
        .map(|i| layer_sizes[i])
        .sum();
    let graph_each = if assigned == total {
        estimate.full_offload
    } else {
        estimate.partial_offload
    };
    let gpu_graph: u64 = assignment
        .devices
        .keys()
        .map(|id| match memory.gpu(id).map(|g| g.graph) {
            Some(g) if g > 0 => g,
            _ => graph_each,
        })
        .sum();
    let vram_size = gpu_layers + gpu_graph;

    if opts.require_full && assigned < total {
        return Err(PlanError::NeedsFullOffload { assigned, total });
    }

    if cfg!(target_os = "macos") {
        // Unified memory: a split that exceeds physical RAM thrashes, so
        // fall back to CPU-only rather than partially offload.
        if vram_size > system.total_memory {
            let cpu_size = memory.input_weights + memory.cpu.graph + layer_sizes.iter().sum::<u64>();
            return Ok(Plan {
                assignment: LayerAssignment::default(),
                num_gpu: 0,
                cpu_size,
                vram_size: 0,
            });
        }
    } else {
        let available = system.free_memory + system.free_swap;
        if cpu_size > available {
            return Err(PlanError::InsufficientSystemMemory {
                required: cpu_size,
                available,
            });
        }
    }

    Ok(Plan {
        assignment,
        num_gpu: assigned,
        cpu_size,
        vram_size,
    })
}
