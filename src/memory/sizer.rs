//! KV-cache and compute-graph working-set estimation.
//!
//! Produces three numbers the planner consumes: the cache bytes each layer
//! contributes, and the activation working set of a decode step
//! (`partial_offload`) versus a full prefill batch (`full_offload`). The
//! working-set polynomials are per architecture family; they bound the
//! scratch a backend needs to materialize one forward graph.

use tracing::warn;

use crate::config::FlashAttention;
use crate::model::{LayerKind, ModelMetadata};

/// Vision-token state per mllama cross-attention layer: 1601 tokens over 4
/// image tiles, stored f32.
const CROSS_ATTN_TOKENS: u64 = 1601;
const CROSS_ATTN_TILES: u64 = 4;

/// Storage format of KV-cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KvCacheType {
    #[default]
    F16,
    F32,
    Q8_0,
    Q4_0,
}

impl KvCacheType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "f16" => Some(Self::F16),
            "f32" => Some(Self::F32),
            "q8_0" => Some(Self::Q8_0),
            "q4_0" => Some(Self::Q4_0),
            _ => None,
        }
    }

    pub fn bytes_per_element(self) -> f64 {
        match self {
            Self::F16 => 2.0,
            Self::F32 => 4.0,
            Self::Q8_0 => 1.0,
            Self::Q4_0 => 0.5,
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, Self::Q8_0 | Self::Q4_0)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::F16 => "f16",
            Self::F32 => "f32",
            Self::Q8_0 => "q8_0",
            Self::Q4_0 => "q4_0",
        }
    }
}

/// Sizer inputs beyond the model itself.
#[derive(Debug, Clone)]
pub struct SizerOptions {
    /// Per-sequence context length in tokens.
    pub context: u64,

    /// Logical batch size in tokens.
    pub batch: u64,

    /// Concurrent sequence slots.
    pub parallel: u64,

    pub cache_type: KvCacheType,
}

/// The sizer's product.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEstimate {
    /// Cache bytes contributed by each layer, output layer excluded (it
    /// carries no KV state).
    pub kv_per_layer: Vec<u64>,

    /// Decode-step working set when some layers stay on CPU.
    pub partial_offload: u64,

    /// Prefill working set when the whole model is device-resident.
    pub full_offload: u64,
}

/// Estimate cache and graph sizes for a model under the given limits.
pub fn estimate_graph(meta: &ModelMetadata, opts: &SizerOptions) -> GraphEstimate {
    let kv_per_layer = (0..meta.block_count)
        .map(|i| kv_layer_bytes(meta, opts, i))
        .collect();

    let (partial_offload, full_offload) = graph_bytes(meta, opts);

    GraphEstimate {
        kv_per_layer,
        partial_offload,
        full_offload,
    }
}

fn kv_layer_bytes(meta: &ModelMetadata, opts: &SizerOptions, layer: usize) -> u64 {
    let bpe = opts.cache_type.bytes_per_element();
    let heads_kv = meta.heads_kv(layer);
    let kv_dims = meta.key_length + meta.value_length;

    match meta.layer_kind(layer) {
        LayerKind::Attention => {
            let tokens = opts.context * opts.parallel;
            (tokens as f64 * (kv_dims * heads_kv) as f64 * bpe) as u64
        }
        LayerKind::SlidingWindow => {
            // gptoss interleaves a fixed 4096-token window with global
            // attention per layer parity; other window families declare
            // the width in metadata.
            let tokens = match meta.architecture.as_str() {
                "gptoss" => opts.parallel * 4096 + opts.batch,
                _ => {
                    let window = meta.sliding_window.unwrap_or(opts.context);
                    window.min(opts.context) * opts.parallel
                }
            };
            (tokens as f64 * (kv_dims * heads_kv) as f64 * bpe) as u64
        }
        LayerKind::CrossAttention => {
            // Vision state is fixed-size f32 regardless of context.
            heads_kv * kv_dims * 4 * CROSS_ATTN_TOKENS * CROSS_ATTN_TILES
        }
        LayerKind::Recurrent => {
            let conv = meta.ssm_conv_kernel.saturating_sub(1) * meta.ssm_inner_size;
            let state = meta.ssm_state_size * meta.ssm_inner_size;
            (conv + state) * 4 * opts.parallel
        }
    }
}

/// Activation working sets per architecture family: `(partial, full)`.
fn graph_bytes(meta: &ModelMetadata, opts: &SizerOptions) -> (u64, u64) {
    let context = opts.context * opts.parallel;
    let batch = opts.batch;
    let embedding = meta.embedding_length;
    let heads = meta.max_heads();
    let heads_kv = meta.max_heads_kv().max(1);
    let head_k = meta.key_length;
    let vocab = meta.vocab_size.max(1);

    match meta.architecture.as_str() {
        "llama" | "mllama" => {
            let full = max2(
                4 * batch * (1 + 4 * embedding + context * (1 + heads)),
                4 * batch * (embedding + vocab),
            );
            let mut partial = 4 * batch * embedding;
            partial += max2(
                4 * batch * (1 + embedding + context.max(embedding))
                    + embedding * embedding * 9 / 16
                    + 4 * context * (batch * heads + head_k * heads_kv),
                4 * batch * (embedding + vocab) + embedding * vocab * 105 / 128,
            );
            if meta.architecture == "mllama" {
                // Cross-attention scratch for the vision state.
                let vision = CROSS_ATTN_TOKENS * CROSS_ATTN_TILES;
                partial += 4 * vision * (batch + embedding + head_k * heads_kv);
            }
            (partial, full)
        }
        "gemma2" | "gemma3" | "gemma3n" => {
            let full = max2(
                4 * batch * (embedding + vocab),
                4 * batch * (2 + context + context * heads + 2 * embedding + 2 * head_k * heads),
            );
            let partial = max2(
                4 * embedding * batch + embedding * vocab * 105 / 128 + 4 * vocab * batch,
                4 * batch * (2 * embedding + 1 + 2 * head_k * heads + context + context * heads)
                    + 4 * head_k * context * 8
                    + embedding * head_k * heads * 9 / 16,
            );
            (partial, full)
        }
        "command-r" => {
            let full = max2(
                4 * batch * (embedding + vocab),
                4 * batch * (2 + 4 * embedding + context * (1 + heads)),
            );
            let partial = max2(
                4 * batch * (embedding + vocab) + embedding * vocab * 105 / 128,
                4 * batch * (1 + 2 * embedding + context * (1 + heads))
                    + 4 * embedding * context
                    + embedding * embedding * 9 / 16,
            );
            (partial, full)
        }
        "qwen2" => {
            let full = max2(
                4 * batch * (embedding + vocab),
                4 * batch * (1 + 2 * embedding + context + context * heads),
            );
            let partial = max2(
                4 * batch * (embedding + vocab) + embedding * vocab * 105 / 128,
                4 * (batch * (1 + 2 * embedding + context * (1 + heads)) + embedding * (1 + context)),
            );
            (partial, full)
        }
        "phi2" => {
            let full = max2(
                4 * batch * (embedding + vocab),
                4 * batch * (1 + 4 * embedding + context + context * heads),
            );
            let partial = max2(
                4 * batch * (2 * embedding + vocab) + embedding * vocab * 105 / 128,
                4 * batch * (2 + 3 * embedding + context + context * heads),
            );
            (partial, full)
        }
        "stablelm" => {
            let full = 4 * batch * (context * (1 + heads) + 3 * embedding + 2);
            let partial = max2(4 * batch * (vocab + 2 * embedding), full);
            (partial, full)
        }
        "deepseek2" => {
            let full = max2(
                4 * batch * (3 * embedding + vocab),
                4 * batch * (3 * embedding + 2 + context * (1 + heads_kv) + 2 * head_k * heads_kv),
            );
            let partial = max2(
                4 * batch * (3 * embedding + vocab) + embedding * vocab * 105 / 128,
                4 * batch * (2 * embedding + 1 + 2 * head_k * heads_kv + context + context * heads_kv)
                    + 4 * head_k * context * heads_kv
                    + embedding * head_k * heads_kv * 9 / 16,
            );
            (partial, full)
        }
        "chatglm" => {
            let full = max2(
                4 * batch * (embedding + vocab),
                4 * batch * (2 + 2 * embedding + context + context * heads),
            );
            let partial = 4 * batch * (embedding + vocab) + embedding * vocab * 105 / 128;
            (partial, full)
        }
        "gptoss" => {
            let full = max2(
                4 * batch * (embedding + vocab),
                4 * batch * (2 + 4 * embedding + context * (1 + heads)),
            );
            let partial = max2(
                4 * batch * (embedding + vocab) + embedding * vocab * 105 / 128,
                4 * batch * (1 + 2 * embedding + context * (1 + heads)) + 4 * head_k * context * heads_kv,
            );
            (partial, full)
        }
        // Recurrent and embedding families: the working set is dominated
        // by the logit/pooling projection.
        _ => {
            let base = 4 * batch * (embedding + vocab);
            (base, base)
        }
    }
}

fn max2(a: u64, b: u64) -> u64 {
    a.max(b)
}

/// Architectures with flash-attention kernels.
const FLASH_ATTENTION_ARCHS: &[&str] = &[
    "llama",
    "gemma2",
    "gemma3",
    "gemma3n",
    "command-r",
    "qwen2",
    "phi2",
    "deepseek2",
    "gptoss",
];

/// Resolve the flash-attention tri-state and the requested cache type into
/// what the backend will actually run.
///
/// Quantized KV requires flash attention; when it is unavailable the cache
/// type falls back to f16 with a warning rather than failing the load.
pub fn configure_flash_attention(
    meta: &ModelMetadata,
    requested: FlashAttention,
    cache_type: KvCacheType,
) -> (bool, KvCacheType) {
    let supported = meta.uniform_head_dims()
        && FLASH_ATTENTION_ARCHS.contains(&meta.architecture.as_str())
        && !meta.is_embedding();

    let enabled = match requested {
        FlashAttention::Off => false,
        FlashAttention::On => {
            if !supported {
                warn!(
                    arch = meta.architecture,
                    "flash attention requested but not supported; disabling"
                );
            }
            supported
        }
        FlashAttention::Auto => supported,
    };

    let cache_type = if cache_type.is_quantized() && !enabled {
        warn!(
            requested = cache_type.as_str(),
            "quantized KV cache requires flash attention; falling back to f16"
        );
        KvCacheType::F16
    } else {
        cache_type
    };

    (enabled, cache_type)
}
