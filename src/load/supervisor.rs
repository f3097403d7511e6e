//! Load drivers: the layout negotiation between supervisor and worker.
//!
//! Two drivers share one planner:
//!
//! - [`load_single_shot`] computes a layout from local estimates and
//!   commits it directly. The worker may still fail to allocate, which is
//!   terminal.
//! - [`load_iterative`] runs the fit → alloc → commit fixpoint: each
//!   response's observed memory re-enters the planner, shrinking the
//!   layout until it stops changing, with a backoff ladder when the worker
//!   keeps refusing and memoized layouts to prevent oscillation.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{GpuLayers, LoadError, LoadOperation, LoadRequest, LoadResponse};
use crate::device::{DeviceId, DeviceInfo, SystemInfo};
use crate::gguf::Tensor;
use crate::memory::planner::{plan, LayerAssignment, Plan, PlanOptions};
use crate::memory::sizer::{GraphEstimate, KvCacheType};
use crate::memory::BackendMemory;
use crate::model::ModelMetadata;

/// Backoff raise per refused round; the ladder fails past 1.0.
const BACKOFF_STEP: f64 = 0.1;

/// How a driver reaches the worker. The production transport is the
/// subprocess handle; tests script responses.
#[async_trait]
pub trait LoadTransport: Send + Sync {
    async fn load(&self, req: &LoadRequest) -> Result<LoadResponse, LoadError>;
}

/// Everything a load needs beyond the model itself.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub parallel: usize,
    pub batch_size: usize,

    /// Per-sequence context length in tokens.
    pub context: u64,
    pub cache_type: KvCacheType,
    pub flash_attention: bool,
    pub num_threads: usize,

    pub lora_path: Vec<String>,
    pub projector_path: Option<String>,
    pub use_mmap: bool,
    pub multi_user_cache: bool,

    pub require_full: bool,
    pub num_gpu: Option<usize>,
    pub spread: bool,
    pub gpu_overhead: u64,

    pub load_timeout: Duration,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            parallel: 1,
            batch_size: 512,
            context: 4096,
            cache_type: KvCacheType::F16,
            flash_attention: false,
            num_threads: num_cpus::get_physical(),
            lora_path: Vec::new(),
            projector_path: None,
            use_mmap: true,
            multi_user_cache: false,
            require_full: false,
            num_gpu: None,
            spread: false,
            gpu_overhead: 0,
            load_timeout: Duration::from_secs(300),
        }
    }
}

impl LoadConfig {
    /// Fold in the environment knobs: scheduler spread, GPU overhead,
    /// multi-user caching, and the load stall timeout.
    /// `OLLAMA_NEW_ENGINE` picks the driver itself: [`load_iterative`]
    /// when set, [`load_single_shot`] otherwise.
    pub fn with_env(mut self, env: &crate::config::EnvConfig) -> Self {
        self.spread = env.sched_spread;
        self.gpu_overhead = env.gpu_overhead;
        self.multi_user_cache = env.multiuser_cache;
        self.load_timeout = env.load_timeout;
        self.cache_type = env.kv_cache_type;
        self
    }

    fn plan_options(&self, backoff: f64) -> PlanOptions {
        PlanOptions {
            require_full: self.require_full,
            backoff,
            num_gpu: self.num_gpu,
            spread: self.spread,
            gpu_overhead: self.gpu_overhead,
        }
    }

    fn request(&self, operation: LoadOperation, assignment: &LayerAssignment) -> LoadRequest {
        LoadRequest {
            operation,
            lora_path: self.lora_path.clone(),
            parallel: self.parallel,
            batch_size: self.batch_size,
            flash_attention: self.flash_attention,
            kv_size: self.context * self.parallel as u64,
            kv_cache_type: self.cache_type.as_str().to_string(),
            num_threads: self.num_threads,
            gpu_layers: assignment
                .gpu_layers()
                .into_iter()
                .map(|(device, layers)| GpuLayers { device, layers })
                .collect(),
            multi_user_cache: self.multi_user_cache,
            projector_path: self.projector_path.clone(),
            main_gpu: 0,
            use_mmap: self.use_mmap,
        }
    }
}

/// Build the supervisor's local memory estimate from the container: layer
/// weights from tensor sizes, cache from the sizer, input weights from the
/// embedding tables. Feeds the legacy driver, which never asks the worker
/// what things actually cost.
pub fn estimate_memory(
    meta: &ModelMetadata,
    tensors: &[Tensor],
    estimate: &GraphEstimate,
    gpu_ids: &[DeviceId],
) -> BackendMemory {
    let layers = meta.block_count + 1;
    let mut memory = BackendMemory::new(gpu_ids, layers);

    for t in tensors {
        match t.block_index() {
            Some(i) if i < meta.block_count => memory.cpu.weights[i] += t.size_bytes(),
            Some(_) => {}
            None if t.name.starts_with("token_embd.") => {
                memory.input_weights += t.size_bytes();
            }
            None => memory.cpu.weights[meta.block_count] += t.size_bytes(),
        }
    }
    for (i, &kv) in estimate.kv_per_layer.iter().enumerate() {
        if i < meta.block_count {
            memory.cpu.cache[i] = kv;
        }
    }
    memory
}

/// The legacy driver: one local plan, one commit, no second chances.
pub async fn load_single_shot(
    transport: &dyn LoadTransport,
    system: &SystemInfo,
    gpus: &[DeviceInfo],
    memory: &BackendMemory,
    estimate: &GraphEstimate,
    cfg: &LoadConfig,
) -> Result<Plan, LoadError> {
    let layout = plan(system, gpus, memory, estimate, &cfg.plan_options(0.0))?;
    info!(layers = layout.num_gpu, "single-shot load");

    let resp = transport
        .load(&cfg.request(LoadOperation::Commit, &layout.assignment))
        .await?;
    if resp.success {
        Ok(layout)
    } else {
        // The local estimate was wrong and the worker could not allocate.
        Err(LoadError::MemoryUnallocatable { backoff: 0.0 })
    }
}

/// The iterative driver: fit → alloc → commit with observed-memory
/// feedback.
pub async fn load_iterative(
    transport: &dyn LoadTransport,
    system: &SystemInfo,
    gpus: &[DeviceInfo],
    estimate: &GraphEstimate,
    cfg: &LoadConfig,
    layers: usize,
) -> Result<Plan, LoadError> {
    let gpu_ids: Vec<DeviceId> = gpus.iter().map(|g| g.id.clone()).collect();

    // Iteration zero assumes everything fits; the first fit response
    // replaces the zeros with observed sizes.
    let mut memory = BackendMemory::new(&gpu_ids, layers);
    let mut backoff = 0.0f64;
    let mut tried: HashSet<LayerAssignment> = HashSet::new();

    let mut current = plan(system, gpus, &memory, estimate, &cfg.plan_options(backoff))?;
    tried.insert(current.assignment.clone());

    let mut op = LoadOperation::Fit;
    let max_iterations = layers + 2;

    for iteration in 0..max_iterations {
        let resp = transport.load(&cfg.request(op, &current.assignment)).await?;
        memory = resp.memory.clone();

        let opts = cfg.plan_options(backoff);
        let next = plan(system, gpus, &memory, estimate, &opts)?;

        debug!(
            iteration,
            ?op,
            success = resp.success,
            current = current.num_gpu,
            replanned = next.num_gpu,
            backoff,
            "load round"
        );

        // A shrunk (or re-shuffled) untried layout restarts the round
        // under the same op.
        if next.assignment != current.assignment
            && next.num_gpu <= current.num_gpu
            && !tried.contains(&next.assignment)
        {
            tried.insert(next.assignment.clone());
            current = next;
            continue;
        }

        // Observed memory says noticeably more fits than we planned for.
        // Growth is suspicious, so probe intermediate counts and take the
        // smallest that the worker confirms.
        if next.num_gpu > current.num_gpu + 1 && cfg.num_gpu.is_none() {
            if let Some(probed) =
                probe_intermediates(transport, system, gpus, estimate, cfg, &memory, &opts, current.num_gpu, next.num_gpu)
                    .await?
            {
                tried.insert(probed.assignment.clone());
                current = probed;
                continue;
            }
        }

        if resp.success {
            match op.advance() {
                Some(next_op) => op = next_op,
                None => {
                    info!(layers = current.num_gpu, iterations = iteration + 1, "load committed");
                    return Ok(current);
                }
            }
        } else {
            backoff += BACKOFF_STEP;
            if backoff > 1.0 + f64::EPSILON {
                return Err(LoadError::MemoryUnallocatable { backoff });
            }
        }
    }

    Err(LoadError::DidNotConverge {
        iterations: max_iterations,
    })
}

#[allow(clippy::too_many_arguments)]
async fn probe_intermediates(
    transport: &dyn LoadTransport,
    system: &SystemInfo,
    gpus: &[DeviceInfo],
    estimate: &GraphEstimate,
    cfg: &LoadConfig,
    memory: &BackendMemory,
    opts: &PlanOptions,
    low: usize,
    high: usize,
) -> Result<Option<Plan>, LoadError> {
    let mut accepted = None;
    for count in (low..high).rev() {
        let probe_opts = PlanOptions {
            num_gpu: Some(count),
            ..opts.clone()
        };
        let candidate = plan(system, gpus, memory, estimate, &probe_opts)?;
        let resp = transport
            .load(&cfg.request(LoadOperation::Fit, &candidate.assignment))
            .await?;
        if !resp.success {
            break;
        }
        // Re-verify: planning against the probe's own report must not
        // shrink below the probed count.
        let reverified = plan(system, gpus, &resp.memory, estimate, &probe_opts)?;
        if reverified.num_gpu >= count {
            accepted = Some(candidate);
        }
    }
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::synthetic_gpu;
    use std::sync::Mutex;

    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;
    const LAYERS: usize = 33;

    /// A worker with real layer sizes and a graph cost it only admits to
    /// once alloc is attempted.
    struct FakeWorker {
        gpu: DeviceId,
        free_vram: u64,
        graph: u64,
        state: Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        graph_reported: bool,
        ops: Vec<(LoadOperation, usize)>,
    }

    impl FakeWorker {
        fn new(gpu: DeviceId, free_vram: u64, graph: u64) -> Self {
            Self {
                gpu,
                free_vram,
                graph,
                state: Mutex::new(FakeState::default()),
            }
        }

        fn layer_weight(i: usize) -> u64 {
            if i == LAYERS - 1 {
                500 * MIB
            } else {
                300 * MIB
            }
        }

        fn ops(&self) -> Vec<(LoadOperation, usize)> {
            self.state.lock().unwrap().ops.clone()
        }
    }

    #[async_trait]
    impl LoadTransport for FakeWorker {
        async fn load(&self, req: &LoadRequest) -> Result<LoadResponse, LoadError> {
            let mut state = self.state.lock().unwrap();

            let assigned: Vec<usize> = req
                .gpu_layers
                .iter()
                .flat_map(|g| g.layers.iter().copied())
                .collect();
            state.ops.push((req.operation, assigned.len()));

            let mut memory = BackendMemory::new(std::slice::from_ref(&self.gpu), LAYERS);
            let mut gpu_bytes = 0u64;
            for i in 0..LAYERS {
                let w = Self::layer_weight(i);
                if assigned.contains(&i) {
                    memory.gpu_mut(&self.gpu).unwrap().weights[i] = w;
                    gpu_bytes += w;
                } else {
                    memory.cpu.weights[i] = w;
                }
            }

            let success = match req.operation {
                LoadOperation::Fit => true,
                LoadOperation::Alloc => {
                    let graph_known = state.graph_reported;
                    state.graph_reported = true;
                    memory.gpu_mut(&self.gpu).unwrap().graph = self.graph;
                    // The first alloc discovers the graph cost the hard
                    // way and refuses.
                    graph_known && gpu_bytes + self.graph <= self.free_vram
                }
                LoadOperation::Commit => true,
                LoadOperation::Close => true,
            };
            if state.graph_reported {
                memory.gpu_mut(&self.gpu).unwrap().graph = self.graph;
            }

            Ok(LoadResponse { success, memory })
        }
    }

    fn system() -> SystemInfo {
        SystemInfo {
            total_memory: 64 * GIB,
            free_memory: 32 * GIB,
            free_swap: 0,
            thread_count: 8,
        }
    }

    fn estimate() -> GraphEstimate {
        GraphEstimate {
            kv_per_layer: vec![0; LAYERS - 1],
            partial_offload: 0,
            full_offload: 0,
        }
    }

    #[tokio::test]
    async fn test_iterative_refit_converges() {
        let gpu = synthetic_gpu(0, 4 * GIB);
        let worker = FakeWorker::new(gpu.id.clone(), 4 * GIB, 600 * MIB);

        let plan = load_iterative(
            &worker,
            &system(),
            std::slice::from_ref(&gpu),
            &estimate(),
            &LoadConfig::default(),
            LAYERS,
        )
        .await
        .unwrap();

        let ops = worker.ops();

        // Fit rounds settle a layout, the first alloc refuses and reports
        // the graph, the retried alloc shrinks and lands, then commit.
        assert_eq!(ops.last().unwrap().0, LoadOperation::Commit);
        let allocs: Vec<&(LoadOperation, usize)> = ops
            .iter()
            .filter(|(op, _)| *op == LoadOperation::Alloc)
            .collect();
        assert!(allocs.len() >= 2);
        assert!(allocs.last().unwrap().1 < allocs[0].1);

        // Final layout respects the worker's real budget.
        let bytes: u64 = plan
            .assignment
            .devices
            .values()
            .flatten()
            .map(|&i| FakeWorker::layer_weight(i))
            .sum();
        assert!(bytes + 600 * MIB <= 4 * GIB);

        // Convergence bound from the protocol contract.
        assert!(ops.len() <= LAYERS + 2);
    }

    #[tokio::test]
    async fn test_single_shot_commits_once() {
        let gpu = synthetic_gpu(0, 24 * GIB);
        let worker = FakeWorker::new(gpu.id.clone(), 24 * GIB, 0);
        // Pretend the graph is already known so commit succeeds.
        worker.state.lock().unwrap().graph_reported = true;

        let mut memory = BackendMemory::new(std::slice::from_ref(&gpu.id), LAYERS);
        for i in 0..LAYERS {
            memory.cpu.weights[i] = FakeWorker::layer_weight(i);
        }

        let plan = load_single_shot(
            &worker,
            &system(),
            std::slice::from_ref(&gpu),
            &memory,
            &estimate(),
            &LoadConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(plan.num_gpu, LAYERS);
        let ops = worker.ops();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].0, LoadOperation::Commit);
    }

    #[tokio::test]
    async fn test_backoff_ladder_exhausts() {
        /// Refuses every alloc no matter the layout.
        struct Refuser {
            gpu: DeviceId,
        }

        #[async_trait]
        impl LoadTransport for Refuser {
            async fn load(&self, req: &LoadRequest) -> Result<LoadResponse, LoadError> {
                let memory = BackendMemory::new(std::slice::from_ref(&self.gpu), LAYERS);
                Ok(LoadResponse {
                    success: req.operation == LoadOperation::Fit,
                    memory,
                })
            }
        }

        let gpu = synthetic_gpu(0, 4 * GIB);
        let worker = Refuser { gpu: gpu.id.clone() };
        let err = load_iterative(
            &worker,
            &system(),
            std::slice::from_ref(&gpu),
            &estimate(),
            &LoadConfig::default(),
            LAYERS,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            LoadError::MemoryUnallocatable { .. } | LoadError::DidNotConverge { .. }
        ));
    }
}
