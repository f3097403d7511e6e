//! Worker HTTP endpoints.
//!
//! The worker serves one model. `/load` drives the fit/alloc/commit/close
//! state machine, `/completion` and `/embedding` run inference against the
//! committed model, `/health` reports lifecycle, `/info` enumerates
//! devices.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::StubBackend;
use crate::cache::{CacheConfig, CausalCache, LayerType, ModelCache, WrapperCache};
use crate::config::{Config, EnvConfig, FlashAttention};
use crate::device::{self, DeviceId, DeviceInfo};
use crate::gguf::{self, KvMap, Tensor};
use crate::load::{
    estimate_memory, HealthResponse, LoadOperation, LoadRequest, LoadResponse, WorkerStatus,
};
use crate::memory::sizer::{configure_flash_attention, estimate_graph, KvCacheType, SizerOptions};
use crate::memory::BackendMemory;
use crate::model::{LayerKind, ModelMetadata, Vocabulary};
use crate::sched::sampler::SamplerConfig;
use crate::sched::{Scheduler, SchedulerConfig, Sequence, SequenceParams, SchedulerError};
use crate::server::streaming::ndjson_response;

/// A parsed model container and its derived views.
pub struct ModelFile {
    pub path: PathBuf,
    pub kv: KvMap,
    pub tensors: Vec<Tensor>,
    pub meta: ModelMetadata,
    pub vocab: Arc<Vocabulary>,
}

impl ModelFile {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)?;
        let decoded = gguf::decode(file, -1)?;
        let meta = ModelMetadata::from_container(&decoded.kv, &decoded.tensors)?;
        let vocab = Arc::new(Vocabulary::from_kv(&decoded.kv)?);
        info!(path = %path.display(), arch = meta.architecture, "opened model");
        Ok(Self {
            path: path.to_path_buf(),
            kv: decoded.kv,
            tensors: decoded.tensors,
            meta,
            vocab,
        })
    }
}

/// A committed, serving model.
struct LoadedModel {
    scheduler: Arc<Scheduler>,
    driver: tokio::task::JoinHandle<()>,
    num_ctx: usize,
}

impl Drop for LoadedModel {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Application state shared across handlers.
pub struct AppState {
    pub env: EnvConfig,
    pub config: Config,
    pub model_file: Option<ModelFile>,

    loaded: RwLock<Option<LoadedModel>>,
    status: RwLock<HealthResponse>,
    allocated: RwLock<bool>,
}

impl AppState {
    pub fn new(env: EnvConfig, config: Config, model_file: Option<ModelFile>) -> Arc<Self> {
        Arc::new(Self {
            env,
            config,
            model_file,
            loaded: RwLock::new(None),
            status: RwLock::new(HealthResponse {
                status: WorkerStatus::Launched,
                progress: 0.0,
            }),
            allocated: RwLock::new(false),
        })
    }

    async fn set_status(&self, status: WorkerStatus, progress: f32) {
        *self.status.write().await = HealthResponse { status, progress };
    }
}

/// Build the axum router with all worker routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/completion", post(completion))
        .route("/embedding", post(embedding))
        .route("/load", post(load))
        .route("/health", get(health))
        .route("/info", get(info_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,

    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub num_predict: Option<usize>,
    #[serde(default)]
    pub num_keep: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub min_p: f32,
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default = "default_true")]
    pub truncate: bool,
    #[serde(default = "default_true")]
    pub shift: bool,

    #[serde(default)]
    pub logprobs: usize,
    #[serde(default)]
    pub grammar: Option<String>,
}

fn default_temperature() -> f32 {
    0.8
}
fn default_top_k() -> usize {
    40
}
fn default_top_p() -> f32 {
    0.9
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
    pub prompt_eval_count: usize,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(*state.status.read().await)
}

async fn info_handler(State(_): State<Arc<AppState>>) -> Json<Vec<DeviceInfo>> {
    Json(device::devices().to_vec())
}

async fn load(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoadRequest>,
) -> Json<LoadResponse> {
    let Some(file) = &state.model_file else {
        warn!("load requested with no model file");
        return Json(LoadResponse {
            success: false,
            memory: BackendMemory::default(),
        });
    };

    let memory = worker_memory(file, &req);

    let success = match req.operation {
        LoadOperation::Fit => {
            // Reporting only; the model is closed again afterwards.
            true
        }
        LoadOperation::Alloc => {
            *state.allocated.write().await = true;
            true
        }
        LoadOperation::Commit => {
            state.set_status(WorkerStatus::Loading, 0.1).await;
            let num_ctx = (req.kv_size / req.parallel.max(1) as u64) as usize;
            let meta = &file.meta;

            // Quantized KV needs flash attention; downgrade rather than
            // refuse the commit.
            let requested = KvCacheType::parse(&req.kv_cache_type)
                .unwrap_or(state.env.kv_cache_type);
            let flash = if req.flash_attention {
                FlashAttention::On
            } else {
                state.env.flash_attention
            };
            let (_flash_enabled, cache_type) =
                configure_flash_attention(meta, flash, requested);

            let token_bytes = (meta.max_heads_kv().max(1) as f64
                * meta.key_length.max(1) as f64
                * cache_type.bytes_per_element()) as usize;
            let cache_config = CacheConfig {
                num_ctx,
                parallel: req.parallel.max(1),
                layers: meta.block_count,
                token_bytes_k: token_bytes.max(1),
                token_bytes_v: token_bytes.max(1),
                shiftable: meta.architecture != "mamba",
                multi_user: req.multi_user_cache,
            };
            let cache = build_cache(meta, cache_config, num_ctx, req.batch_size);

            let scheduler = Scheduler::new(
                Arc::new(StubBackend::new(file.vocab.len().max(1))),
                file.vocab.clone(),
                SchedulerConfig {
                    parallel: req.parallel.max(1),
                    batch_size: req.batch_size.max(1),
                    num_ctx,
                    pooled: meta.is_embedding(),
                },
                cache,
            );
            state.set_status(WorkerStatus::Loading, 0.6).await;

            let driver = scheduler.start();
            *state.loaded.write().await = Some(LoadedModel {
                scheduler,
                driver,
                num_ctx,
            });
            state.set_status(WorkerStatus::Ready, 1.0).await;
            info!(num_ctx, parallel = req.parallel, "model committed");
            true
        }
        LoadOperation::Close => {
            *state.loaded.write().await = None;
            *state.allocated.write().await = false;
            state.set_status(WorkerStatus::Launched, 0.0).await;
            true
        }
    };

    Json(LoadResponse { success, memory })
}

async fn completion(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompletionRequest>,
) -> Response {
    let request_id = Uuid::new_v4();
    info!(
        %request_id,
        prompt_chars = req.prompt.len(),
        num_predict = req.num_predict,
        "completion request"
    );

    let loaded = state.loaded.read().await;
    let Some(model) = loaded.as_ref() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no model loaded").into_response();
    };
    let file = state.model_file.as_ref().expect("loaded implies file");

    let params = SequenceParams {
        num_predict: req.num_predict,
        num_keep: req.num_keep,
        stop: req.stop,
        truncate: req.truncate,
        shift: req.shift,
        logprobs: req.logprobs,
        embedding_only: false,
        sampling: SamplerConfig {
            temperature: req.temperature,
            top_k: req.top_k,
            top_p: req.top_p,
            min_p: req.min_p,
            seed: req.seed,
        },
        grammar: req.grammar,
    };

    let (seq, rx, _erx) =
        match Sequence::new(&req.prompt, &[], params, &file.vocab, model.num_ctx) {
            Ok(built) => built,
            Err(e @ SchedulerError::InputTooLong { .. }) => {
                return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
            }
            Err(e) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        };

    let quit = seq.quit.clone();
    if let Err(e) = model.scheduler.admit(seq).await {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    ndjson_response(rx, quit)
}

async fn embedding(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EmbeddingRequest>,
) -> Response {
    let loaded = state.loaded.read().await;
    let Some(model) = loaded.as_ref() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no model loaded").into_response();
    };
    let file = state.model_file.as_ref().expect("loaded implies file");

    let params = SequenceParams {
        embedding_only: true,
        ..Default::default()
    };
    let (seq, _rx, erx) =
        match Sequence::new(&req.prompt, &[], params, &file.vocab, model.num_ctx) {
            Ok(built) => built,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        };
    let prompt_eval_count = seq.inputs.len();

    if let Err(e) = model.scheduler.admit(seq).await {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    match erx.await {
        Ok(embedding) => Json(EmbeddingResponse {
            embedding,
            prompt_eval_count,
        })
        .into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "sequence dropped").into_response(),
    }
}

/// Pick the cache kind for a model, mirroring the sizer's per-layer-kind
/// dispatch: sliding-window families get a wrapped cache whose narrow half
/// holds `sliding_window + batch` tokens, everything else runs plain
/// causal.
fn build_cache(
    meta: &ModelMetadata,
    config: CacheConfig,
    num_ctx: usize,
    batch_size: usize,
) -> ModelCache {
    let layer_types: Vec<LayerType> = (0..meta.block_count)
        .map(|i| match meta.layer_kind(i) {
            LayerKind::SlidingWindow => LayerType::SlidingWindow,
            _ => LayerType::Global,
        })
        .collect();

    if layer_types.contains(&LayerType::SlidingWindow) {
        let window = match meta.architecture.as_str() {
            // gptoss windows alternate layers at a fixed width.
            "gptoss" => 4096,
            _ => meta.sliding_window.unwrap_or(num_ctx as u64) as usize,
        };
        let window_ctx = (window + batch_size).min(num_ctx);
        ModelCache::Wrapped(WrapperCache::new(config, window_ctx, layer_types))
    } else {
        ModelCache::Causal(CausalCache::new(config))
    }
}

/// Build the memory report for a load request: layer weights and cache
/// distributed onto the requested devices, graph bytes attributed to every
/// device in use.
fn worker_memory(file: &ModelFile, req: &LoadRequest) -> BackendMemory {
    let parallel = req.parallel.max(1) as u64;
    let cache_type = KvCacheType::parse(&req.kv_cache_type).unwrap_or_default();
    let opts = SizerOptions {
        context: req.kv_size / parallel,
        batch: req.batch_size as u64,
        parallel,
        cache_type,
    };
    let estimate = estimate_graph(&file.meta, &opts);

    let gpu_ids: Vec<DeviceId> = req.gpu_layers.iter().map(|g| g.device.clone()).collect();
    let mut memory = estimate_memory(&file.meta, &file.tensors, &estimate, &gpu_ids);

    let total_layers = file.meta.block_count + 1;
    let mut assigned = 0usize;
    for group in &req.gpu_layers {
        for &layer in &group.layers {
            if layer >= total_layers {
                continue;
            }
            let weights = std::mem::take(&mut memory.cpu.weights[layer]);
            let cache = std::mem::take(&mut memory.cpu.cache[layer]);
            if let Some(gpu) = memory.gpu_mut(&group.device) {
                gpu.weights[layer] = weights;
                gpu.cache[layer] = cache;
                assigned += 1;
            }
        }
    }

    let graph = if assigned == total_layers {
        estimate.full_offload
    } else {
        estimate.partial_offload
    };
    for group in &req.gpu_layers {
        if group.layers.is_empty() {
            continue;
        }
        if let Some(gpu) = memory.gpu_mut(&group.device) {
            gpu.graph = graph;
        }
    }
    if assigned < total_layers {
        memory.cpu.graph = estimate.partial_offload;
    }
    memory
}
