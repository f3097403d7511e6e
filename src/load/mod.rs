//! The supervisor/worker load protocol.
//!
//! One worker subprocess serves one model. The supervisor negotiates the
//! layer layout over a single loopback endpoint, `POST /load`,
//! parameterized by an operation:
//!
//! | op | effect |
//! |---|---|
//! | fit | report what the layout would cost; allocate nothing |
//! | alloc | reserve buffers and stay open |
//! | commit | load weights into the reserved buffers, become ready |
//! | close | release everything, stay launched |
//!
//! `success = false` with populated memory means "here is what it would
//! have cost", and the supervisor feeds it back into the planner.

pub mod supervisor;
pub mod worker;

pub use supervisor::{estimate_memory, load_iterative, load_single_shot, LoadConfig, LoadTransport};
pub use worker::WorkerProcess;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceId;
use crate::memory::{BackendMemory, PlanError};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("worker process terminated: {0}")]
    WorkerTerminated(String),

    #[error("unknown model")]
    UnknownModel,

    #[error("memory layout could not be allocated (backoff exhausted at {backoff:.1})")]
    MemoryUnallocatable { backoff: f64 },

    #[error("load did not converge after {iterations} iterations")]
    DidNotConverge { iterations: usize },

    #[error("timed out waiting for worker (no progress for {stalled_secs}s)")]
    Stalled { stalled_secs: u64 },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("worker request failed: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The load operation requested of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadOperation {
    /// Report required memory without allocating. The worker closes the
    /// model afterwards.
    Fit,
    /// Reserve buffers and keep the model open.
    Alloc,
    /// Load weights from disk into the reserved buffers and become ready.
    Commit,
    /// Release everything; the process stays launched but idle.
    Close,
}

impl LoadOperation {
    /// The op that follows a successful, stable round.
    pub fn advance(self) -> Option<Self> {
        match self {
            LoadOperation::Fit => Some(LoadOperation::Alloc),
            LoadOperation::Alloc => Some(LoadOperation::Commit),
            LoadOperation::Commit | LoadOperation::Close => None,
        }
    }
}

/// Layers bound for one device, as carried in the load request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuLayers {
    pub device: DeviceId,
    pub layers: Vec<usize>,
}

/// Body of `POST /load`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRequest {
    pub operation: LoadOperation,

    #[serde(default)]
    pub lora_path: Vec<String>,

    pub parallel: usize,
    pub batch_size: usize,
    pub flash_attention: bool,

    /// Total KV capacity in tokens (context × parallel).
    pub kv_size: u64,
    pub kv_cache_type: String,

    pub num_threads: usize,
    pub gpu_layers: Vec<GpuLayers>,

    #[serde(default)]
    pub multi_user_cache: bool,

    #[serde(default)]
    pub projector_path: Option<String>,

    #[serde(default)]
    pub main_gpu: usize,

    #[serde(default = "default_true")]
    pub use_mmap: bool,
}

fn default_true() -> bool {
    true
}

/// Body of the `POST /load` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResponse {
    pub success: bool,
    pub memory: BackendMemory,
}

/// Worker lifecycle as reported by `GET /health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Launched,
    Loading,
    Ready,
    NoSlots,
    NotResponding,
    Error,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: WorkerStatus,
    /// Load progress in `[0, 1]`; advances reset the supervisor's stall
    /// timer.
    pub progress: f32,
}
