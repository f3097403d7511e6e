//! Memory accounting and device placement.
//!
//! - this module: the `BackendMemory` ledger exchanged with the worker
//! - [`sizer`]: KV-cache and compute-graph working-set estimation
//! - [`planner`]: the capacity solver that assigns layers to devices

pub mod planner;
pub mod sizer;

pub use planner::{plan, LayerAssignment, Plan, PlanOptions};
pub use sizer::{configure_flash_attention, estimate_graph, GraphEstimate, KvCacheType};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceId;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("model requires full GPU offload but {assigned} of {total} layers fit")]
    NeedsFullOffload { assigned: usize, total: usize },

    #[error("insufficient system memory: need {required} bytes, {available} available")]
    InsufficientSystemMemory { required: u64, available: u64 },
}

/// Per-device memory ledger: bytes of weights and KV cache per layer plus
/// one graph bucket. Index `block_count` holds the output layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMemory {
    pub device: DeviceId,
    pub weights: Vec<u64>,
    pub cache: Vec<u64>,
    pub graph: u64,
}

impl DeviceMemory {
    pub fn new(device: DeviceId, layers: usize) -> Self {
        Self {
            device,
            weights: vec![0; layers],
            cache: vec![0; layers],
            graph: 0,
        }
    }

    /// Weights plus cache for one layer.
    pub fn layer(&self, i: usize) -> u64 {
        self.weights.get(i).copied().unwrap_or(0) + self.cache.get(i).copied().unwrap_or(0)
    }

    /// Total bytes attributed to this device.
    pub fn total(&self) -> u64 {
        self.weights.iter().sum::<u64>() + self.cache.iter().sum::<u64>() + self.graph
    }
}

/// The process-wide memory picture: CPU, every GPU, and the input-layer
/// bucket that always stays on host. Reset wholesale on each planning
/// iteration; within an iteration it only grows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendMemory {
    /// Token-embedding and other input weights, always host-resident.
    pub input_weights: u64,

    pub cpu: DeviceMemory,

    pub gpus: Vec<DeviceMemory>,
}

impl BackendMemory {
    pub fn new(gpu_ids: &[DeviceId], layers: usize) -> Self {
        Self {
            input_weights: 0,
            cpu: DeviceMemory::new(DeviceId::cpu(), layers),
            gpus: gpu_ids
                .iter()
                .map(|id| DeviceMemory::new(id.clone(), layers))
                .collect(),
        }
    }

    pub fn gpu(&self, id: &DeviceId) -> Option<&DeviceMemory> {
        self.gpus.iter().find(|g| &g.device == id)
    }

    pub fn gpu_mut(&mut self, id: &DeviceId) -> Option<&mut DeviceMemory> {
        self.gpus.iter_mut().find(|g| &g.device == id)
    }

    /// Bytes layer `i` occupies summed across every device.
    pub fn layer_size(&self, i: usize) -> u64 {
        self.cpu.layer(i) + self.gpus.iter().map(|g| g.layer(i)).sum::<u64>()
    }

    /// Per-layer sizes for the planner, one entry per layer including the
    /// output layer.
    pub fn layer_sizes(&self, layers: usize) -> Vec<u64> {
        (0..layers).map(|i| self.layer_size(i)).collect()
    }

    /// Total allocation across all devices.
    pub fn total(&self) -> u64 {
        self.input_weights
            + self.cpu.total()
            + self.gpus.iter().map(DeviceMemory::total).sum::<u64>()
    }
}
