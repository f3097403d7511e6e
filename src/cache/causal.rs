//! The causal KV cache.
//!
//! Capacity is `num_ctx × parallel` tokens split into `parallel` slots,
//! each a contiguous token range owned by one sequence. Every slot carries
//! a sequence id; the attention mask keeps one slot's keys from attending
//! to another's. Slot history grows monotonically until a shift or free.

use half::f16;
use tracing::debug;

use super::CacheError;
use crate::model::vocab::TokenId;

/// Cache geometry and behavior flags.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Tokens of context per slot.
    pub num_ctx: usize,

    /// Slot count.
    pub parallel: usize,

    /// Layer count (repeating blocks only; the output layer keeps no KV).
    pub layers: usize,

    /// Bytes per token per layer for keys.
    pub token_bytes_k: usize,

    /// Bytes per token per layer for values.
    pub token_bytes_v: usize,

    /// Whether the model supports in-place RoPE shift. When false, a
    /// context shift surfaces as [`CacheError::Reprocess`].
    pub shiftable: bool,

    /// Allow slots to reuse another slot's prefix (many users, one
    /// prompt).
    pub multi_user: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_ctx: 2048,
            parallel: 1,
            layers: 1,
            token_bytes_k: 2,
            token_bytes_v: 2,
            shiftable: true,
            multi_user: false,
        }
    }
}

/// One slot: a contiguous cache region reserved for a sequence.
#[derive(Debug, Clone, Default)]
pub struct CacheSlot {
    /// Sequence id used by attention masking.
    pub id: usize,

    /// Processed history: tokens whose K/V have been computed.
    pub inputs: Vec<TokenId>,

    pub in_use: bool,
}

struct LayerBuffers {
    keys: Vec<u8>,
    values: Vec<u8>,
}

/// The default cache implementation.
pub struct CausalCache {
    config: CacheConfig,
    slots: Vec<CacheSlot>,
    layers: Vec<LayerBuffers>,
    current_layer: usize,
    next_slot_id: usize,
}

impl CausalCache {
    pub fn new(config: CacheConfig) -> Self {
        let total = config.num_ctx * config.parallel;
        let layers = (0..config.layers)
            .map(|_| LayerBuffers {
                keys: vec![0; total * config.token_bytes_k],
                values: vec![0; total * config.token_bytes_v],
            })
            .collect();
        let slots = (0..config.parallel).map(|_| CacheSlot::default()).collect();
        Self {
            config,
            slots,
            layers,
            current_layer: 0,
            next_slot_id: 0,
        }
    }

    pub fn parallel(&self) -> usize {
        self.config.parallel
    }

    /// Token capacity of one slot.
    pub fn slot_capacity(&self) -> usize {
        self.config.num_ctx
    }

    /// Total token capacity across all slots.
    pub fn total_capacity(&self) -> usize {
        self.config.num_ctx * self.config.parallel
    }

    /// Bytes of buffer backing one layer.
    pub fn layer_bytes(&self) -> usize {
        self.total_capacity() * (self.config.token_bytes_k + self.config.token_bytes_v)
    }

    pub fn slot(&self, index: usize) -> Result<&CacheSlot, CacheError> {
        self.slots.get(index).ok_or(CacheError::BadSlot(index))
    }

    /// Find or create a slot for `inputs`.
    ///
    /// Prefers the free slot sharing the longest prefix with `inputs` so
    /// prefill can skip what is already computed; with `multi_user`, busy
    /// slots also donate their prefix. Returns the slot index and the
    /// suffix still to be processed.
    pub fn load_slot(&mut self, inputs: &[TokenId]) -> Result<(usize, Vec<TokenId>), CacheError> {
        let free = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.in_use)
            .map(|(i, s)| (i, prefix_len(&s.inputs, inputs)))
            .max_by_key(|&(_, p)| p);

        let (index, mut reuse) = free.ok_or(CacheError::NoFreeSlot)?;

        if self.config.multi_user {
            // A busy slot with a longer shared prefix donates its history.
            let donor = self
                .slots
                .iter()
                .filter(|s| s.in_use)
                .map(|s| {
                    let p = prefix_len(&s.inputs, inputs);
                    (p, s.inputs.clone())
                })
                .max_by_key(|(p, _)| *p);
            if let Some((p, history)) = donor {
                if p > reuse {
                    self.slots[index].inputs = history[..p].to_vec();
                    reuse = p;
                }
            }
        }

        let slot = &mut self.slots[index];
        slot.inputs.truncate(reuse);
        slot.in_use = true;
        slot.id = self.next_slot_id;
        self.next_slot_id += 1;

        debug!(slot = index, reused = reuse, total = inputs.len(), "loaded cache slot");
        Ok((index, inputs[reuse..].to_vec()))
    }

    /// Release a slot. History is retained so a follow-up request with the
    /// same prefix can reuse it.
    pub fn free_slot(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.in_use = false;
        }
    }

    /// Remaining token capacity of a slot.
    pub fn available(&self, index: usize) -> usize {
        self.config.num_ctx
            .saturating_sub(self.slots.get(index).map_or(0, |s| s.inputs.len()))
    }

    /// Whether `n` more tokens fit in the slot.
    pub fn can_accept(&self, index: usize, n: usize) -> bool {
        self.available(index) >= n
    }

    /// Append processed tokens to a slot's history.
    pub fn commit(&mut self, index: usize, tokens: &[TokenId]) -> Result<(), CacheError> {
        let available = self.available(index);
        let slot = self.slots.get_mut(index).ok_or(CacheError::BadSlot(index))?;
        if tokens.len() > available {
            return Err(CacheError::Full {
                slot: index,
                needed: tokens.len(),
                available,
            });
        }
        slot.inputs.extend_from_slice(tokens);
        Ok(())
    }

    /// Drop tokens from the end of a slot's history (stop-string
    /// truncation discards the tail that will not be kept).
    pub fn truncate(&mut self, index: usize, len: usize) -> Result<(), CacheError> {
        let slot = self.slots.get_mut(index).ok_or(CacheError::BadSlot(index))?;
        slot.inputs.truncate(len);
        Ok(())
    }

    /// Make room in a full slot by discarding the middle of its history:
    /// the first `num_keep` tokens and the most recent half survive.
    ///
    /// Models without in-place RoPE shift get the surviving history back
    /// as a [`CacheError::Reprocess`] payload to re-feed.
    pub fn shift(&mut self, index: usize, num_keep: usize) -> Result<(), CacheError> {
        let shiftable = self.config.shiftable;
        let slot = self.slots.get_mut(index).ok_or(CacheError::BadSlot(index))?;

        let len = slot.inputs.len();
        let num_keep = num_keep.min(len);
        let discard = (len - num_keep) / 2;
        if discard == 0 {
            return Ok(());
        }

        let mut survivors = Vec::with_capacity(len - discard);
        survivors.extend_from_slice(&slot.inputs[..num_keep]);
        survivors.extend_from_slice(&slot.inputs[num_keep + discard..]);

        debug!(
            slot = index,
            len,
            num_keep,
            discard,
            shiftable,
            "context shift"
        );

        if shiftable {
            slot.inputs = survivors;
            Ok(())
        } else {
            // The positional encodings are stale; hand the survivors back
            // for reprocessing from scratch.
            slot.inputs.clear();
            Err(CacheError::Reprocess { inputs: survivors })
        }
    }

    /// Select the layer subsequent K/V writes target.
    pub fn set_layer(&mut self, layer: usize) {
        debug_assert!(layer < self.layers.len());
        self.current_layer = layer;
    }

    /// Write one token's K/V into the current layer at the slot's next
    /// position.
    pub fn write_kv(
        &mut self,
        index: usize,
        position: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), CacheError> {
        let slot_base = index
            .checked_mul(self.config.num_ctx)
            .ok_or(CacheError::BadSlot(index))?;
        if index >= self.slots.len() || position >= self.config.num_ctx {
            return Err(CacheError::Full {
                slot: index,
                needed: position + 1,
                available: self.config.num_ctx,
            });
        }
        let layer = &mut self.layers[self.current_layer];
        let koff = (slot_base + position) * self.config.token_bytes_k;
        let voff = (slot_base + position) * self.config.token_bytes_v;
        layer.keys[koff..koff + key.len()].copy_from_slice(key);
        layer.values[voff..voff + value.len()].copy_from_slice(value);
        Ok(())
    }

    /// Typed variant of [`write_kv`](Self::write_kv) for f16 caches.
    pub fn write_kv_f16(
        &mut self,
        index: usize,
        position: usize,
        key: &[f16],
        value: &[f16],
    ) -> Result<(), CacheError> {
        self.write_kv(
            index,
            position,
            bytemuck::cast_slice(key),
            bytemuck::cast_slice(value),
        )
    }

    /// Build the additive attention mask for a batch.
    ///
    /// Rows are batch tokens `(slot, position)`; columns are every cache
    /// position. A query may attend to keys in its own slot at positions
    /// up to its own. Everything else is `-inf`. With `reserve_only` the
    /// mask is sized but not populated, for memory probing.
    pub fn start_forward(
        &self,
        batch: &[(usize, usize)],
        reserve_only: bool,
    ) -> Vec<f16> {
        let cols = self.total_capacity();
        let neg_inf = f16::NEG_INFINITY;
        let zero = f16::ZERO;
        let mut mask = vec![neg_inf; batch.len() * cols];
        if reserve_only {
            return mask;
        }
        for (row, &(slot, pos)) in batch.iter().enumerate() {
            let base = slot * self.config.num_ctx;
            for j in 0..=pos.min(self.config.num_ctx - 1) {
                mask[row * cols + base + j] = zero;
            }
        }
        mask
    }

    /// Invariant check: no slot exceeds its region and in-use histories
    /// are position-contiguous from zero by construction.
    pub fn used_tokens(&self) -> usize {
        self.slots.iter().map(|s| s.inputs.len()).sum()
    }
}

fn prefix_len(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
