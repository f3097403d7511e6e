//! Architecture parameters extracted from container metadata.
//!
//! `ModelMetadata` is the read-only view every other subsystem works from:
//! the sizer reads head counts and window sizes, the cache reads context
//! limits, the scheduler reads vocabulary facts.

use std::collections::BTreeMap;

use tracing::info;

use super::ModelError;
use crate::gguf::{KvMap, Tensor};

/// Architectures this build can construct.
///
/// `mamba` is carried for the recurrent-layer cache sizing path even though
/// it shares no attention polynomial with the transformer families.
pub const SUPPORTED_ARCHITECTURES: &[&str] = &[
    "llama",
    "mllama",
    "gemma2",
    "gemma3",
    "gemma3n",
    "command-r",
    "qwen2",
    "phi2",
    "stablelm",
    "deepseek2",
    "chatglm",
    "gptoss",
    "mamba",
    "bert",
    "nomic-bert",
];

/// What a layer contributes to the KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Full-context causal attention.
    Attention,
    /// Attention windowed to `sliding_window` tokens.
    SlidingWindow,
    /// Cross-attention over fixed-size vision state (mllama).
    CrossAttention,
    /// State-space (recurrent) layer; cache is context-independent.
    Recurrent,
}

#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub architecture: String,
    pub block_count: usize,
    pub context_length: u64,
    pub embedding_length: u64,

    head_count: Vec<u64>,
    head_count_kv: Vec<u64>,

    pub key_length: u64,
    pub value_length: u64,
    pub vocab_size: u64,

    pub sliding_window: Option<u64>,
    cross_attention_layers: Vec<usize>,

    pub ssm_conv_kernel: u64,
    pub ssm_state_size: u64,
    pub ssm_inner_size: u64,

    /// Present on embedding (pooled) models.
    pub pooling_type: Option<u32>,

    /// `general.type`, `"model"` when unset.
    pub general_type: String,

    /// Tensor count per layer group (`blk.N`, `output`, `v`, ...).
    pub layer_groups: BTreeMap<String, usize>,
}

impl ModelMetadata {
    /// Build the metadata view, validating the architecture and the
    /// repeating-block index.
    pub fn from_container(kv: &KvMap, tensors: &[Tensor]) -> Result<Self, ModelError> {
        let architecture = kv.architecture().to_string();
        if !SUPPORTED_ARCHITECTURES.contains(&architecture.as_str()) {
            return Err(ModelError::UnsupportedArchitecture(architecture));
        }

        let block_count = kv.u64_or("block_count", 0) as usize;
        if block_count == 0 {
            return Err(ModelError::MissingKey(kv.qualify("block_count")));
        }

        let embedding_length = kv.u64_or("embedding_length", 0);
        let heads = kv.u64_or("attention.head_count", 1).max(1);

        let head_count = per_layer(kv, "attention.head_count", block_count, heads);
        let head_count_kv = per_layer(kv, "attention.head_count_kv", block_count, heads);

        let key_length = kv.u64_or("attention.key_length", embedding_length / heads);
        let value_length = kv.u64_or("attention.value_length", embedding_length / heads);

        let vocab_size = kv
            .array("tokenizer.ggml.tokens")
            .map(|a| a.len)
            .unwrap_or_else(|| kv.u64_or("vocab_size", 0));

        let sliding_window = match kv.u64_or("attention.sliding_window", 0) {
            0 => None,
            w => Some(w),
        };

        let cross_attention_layers = kv
            .u64s("attention.cross_attention_layers")
            .unwrap_or_default()
            .into_iter()
            .map(|v| v as usize)
            .collect();

        let layer_groups = group_tensors(tensors);
        for i in 0..block_count {
            if !layer_groups.contains_key(&format!("blk.{i}")) {
                return Err(ModelError::MissingLayer(i));
            }
        }

        let meta = Self {
            architecture,
            block_count,
            context_length: kv.u64_or("context_length", 2048),
            embedding_length,
            head_count,
            head_count_kv,
            key_length,
            value_length,
            vocab_size,
            sliding_window,
            cross_attention_layers,
            ssm_conv_kernel: kv.u64_or("ssm.conv_kernel", 0),
            ssm_state_size: kv.u64_or("ssm.state_size", 0),
            ssm_inner_size: kv.u64_or("ssm.inner_size", 0),
            pooling_type: kv.get("pooling_type").and_then(|v| v.as_u64()).map(|v| v as u32),
            general_type: kv.string_or("general.type", "model").to_string(),
            layer_groups,
        };

        info!(
            arch = meta.architecture,
            blocks = meta.block_count,
            embedding = meta.embedding_length,
            context = meta.context_length,
            vocab = meta.vocab_size,
            "model metadata"
        );

        Ok(meta)
    }

    pub fn heads(&self, layer: usize) -> u64 {
        self.head_count.get(layer).copied().unwrap_or(1).max(1)
    }

    pub fn heads_kv(&self, layer: usize) -> u64 {
        self.head_count_kv.get(layer).copied().unwrap_or(1)
    }

    pub fn max_heads(&self) -> u64 {
        self.head_count.iter().copied().max().unwrap_or(1)
    }

    pub fn max_heads_kv(&self) -> u64 {
        self.head_count_kv.iter().copied().max().unwrap_or(1)
    }

    /// Whether every layer's K head dim equals its V head dim; flash
    /// attention requires it.
    pub fn uniform_head_dims(&self) -> bool {
        self.key_length == self.value_length
    }

    /// Pooled-output models embed rather than generate.
    pub fn is_embedding(&self) -> bool {
        self.pooling_type.is_some()
    }

    pub fn is_adapter(&self) -> bool {
        self.general_type == "adapter"
    }

    /// Cache contribution of one layer.
    ///
    /// gptoss interleaves windowed and global attention per layer, so even
    /// layers are treated as sliding-window.
    pub fn layer_kind(&self, layer: usize) -> LayerKind {
        if self.architecture == "mamba" {
            return LayerKind::Recurrent;
        }
        if self.cross_attention_layers.contains(&layer) {
            return LayerKind::CrossAttention;
        }
        match self.architecture.as_str() {
            "gemma2" if self.sliding_window.is_some() && layer % 2 == 0 => {
                LayerKind::SlidingWindow
            }
            "gemma3" | "gemma3n" if self.sliding_window.is_some() && layer % 6 != 5 => {
                LayerKind::SlidingWindow
            }
            "gptoss" if layer % 2 == 0 => LayerKind::SlidingWindow,
            _ => LayerKind::Attention,
        }
    }
}

/// Expand a scalar-or-array key into one value per layer.
fn per_layer(kv: &KvMap, key: &str, block_count: usize, default: u64) -> Vec<u64> {
    if let Some(values) = kv.u64s(key) {
        if values.len() >= block_count {
            return values;
        }
    }
    vec![kv.u64_or(key, default); block_count]
}

fn group_tensors(tensors: &[Tensor]) -> BTreeMap<String, usize> {
    let mut groups = BTreeMap::new();
    for t in tensors {
        *groups.entry(t.layer_group().to_string()).or_insert(0) += 1;
    }
    groups
}
