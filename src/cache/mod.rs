//! The paged KV cache.
//!
//! Per-layer key/value buffers with slot allocation, prefix reuse,
//! context shift, and multi-user isolation.
//!
//! - [`causal`]: the default cache, with disjoint slots and monotone history
//! - [`wrapper`]: routes layers between two physical caches by layer type
//!   (global vs. sliding-window attention)
//!
//! [`ModelCache`] is the tagged variant the scheduler holds: plain causal
//! for full-context models, wrapped for sliding-window families.

pub mod causal;
pub mod wrapper;

pub use causal::{CacheConfig, CacheSlot, CausalCache};
pub use wrapper::{LayerType, WrapperCache};

use half::f16;
use thiserror::Error;

use crate::model::vocab::TokenId;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("no free cache slot")]
    NoFreeSlot,

    #[error("slot {slot}: {needed} tokens exceed remaining capacity {available}")]
    Full {
        slot: usize,
        needed: usize,
        available: usize,
    },

    #[error("slot {0} out of range")]
    BadSlot(usize),

    #[error("cache shift requires reprocessing {} surviving tokens", inputs.len())]
    Reprocess { inputs: Vec<TokenId> },
}

/// The cache kind a model runs with.
pub enum ModelCache {
    /// Every layer attends over the full context.
    Causal(CausalCache),

    /// Layers split between a full-context cache and a sliding window.
    Wrapped(WrapperCache),
}

impl ModelCache {
    pub fn load_slot(&mut self, inputs: &[TokenId]) -> Result<(usize, Vec<TokenId>), CacheError> {
        match self {
            ModelCache::Causal(c) => c.load_slot(inputs),
            ModelCache::Wrapped(w) => w.load_slot(inputs),
        }
    }

    pub fn free_slot(&mut self, index: usize) {
        match self {
            ModelCache::Causal(c) => c.free_slot(index),
            ModelCache::Wrapped(w) => w.free_slot(index),
        }
    }

    pub fn slot(&self, index: usize) -> Result<&CacheSlot, CacheError> {
        match self {
            ModelCache::Causal(c) => c.slot(index),
            ModelCache::Wrapped(w) => w.slot(index),
        }
    }

    pub fn can_accept(&self, index: usize, n: usize) -> bool {
        match self {
            ModelCache::Causal(c) => c.can_accept(index, n),
            ModelCache::Wrapped(w) => w.can_accept(index, n),
        }
    }

    pub fn commit(&mut self, index: usize, tokens: &[TokenId]) -> Result<(), CacheError> {
        match self {
            ModelCache::Causal(c) => c.commit(index, tokens),
            ModelCache::Wrapped(w) => w.commit(index, tokens),
        }
    }

    pub fn truncate(&mut self, index: usize, len: usize) -> Result<(), CacheError> {
        match self {
            ModelCache::Causal(c) => c.truncate(index, len),
            ModelCache::Wrapped(w) => w.truncate(index, len),
        }
    }

    pub fn shift(&mut self, index: usize, num_keep: usize) -> Result<(), CacheError> {
        match self {
            ModelCache::Causal(c) => c.shift(index, num_keep),
            ModelCache::Wrapped(w) => w.shift(index, num_keep),
        }
    }

    pub fn set_layer(&mut self, layer: usize) {
        match self {
            ModelCache::Causal(c) => c.set_layer(layer),
            ModelCache::Wrapped(w) => w.set_layer(layer),
        }
    }

    pub fn start_forward(&self, batch: &[(usize, usize)], reserve_only: bool) -> Vec<f16> {
        match self {
            ModelCache::Causal(c) => c.start_forward(batch, reserve_only),
            ModelCache::Wrapped(w) => w.start_forward(batch, reserve_only),
        }
    }
}
