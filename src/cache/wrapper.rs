//! Layer-type cache routing.
//!
//! Sliding-window families keep two physical caches: a full-context cache
//! for global layers and a narrow one for windowed layers, each sized for
//! only the layers it owns. Slot bookkeeping is mirrored on both; K/V
//! writes route to whichever cache the current layer's type selects.

use half::f16;

use super::causal::{CacheConfig, CacheSlot, CausalCache};
use super::CacheError;
use crate::model::vocab::TokenId;

/// Tag selecting the physical cache for a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerType {
    Global,
    SlidingWindow,
}

/// Two causal caches behind one slot table.
pub struct WrapperCache {
    global: CausalCache,
    window: CausalCache,
    layer_types: Vec<LayerType>,

    /// Position of each absolute layer within its own cache's buffers.
    local_index: Vec<usize>,

    current: LayerType,
}

impl WrapperCache {
    /// `window_ctx` is the narrow cache's per-slot capacity, typically
    /// `sliding_window + batch`.
    pub fn new(config: CacheConfig, window_ctx: usize, layer_types: Vec<LayerType>) -> Self {
        let mut local_index = Vec::with_capacity(layer_types.len());
        let (mut globals, mut windows) = (0usize, 0usize);
        for t in &layer_types {
            match t {
                LayerType::Global => {
                    local_index.push(globals);
                    globals += 1;
                }
                LayerType::SlidingWindow => {
                    local_index.push(windows);
                    windows += 1;
                }
            }
        }

        // Each cache only backs its own layers, so the reserved bytes
        // match what the sizer charges per layer kind.
        let global_config = CacheConfig {
            layers: globals.max(1),
            ..config.clone()
        };
        let window_config = CacheConfig {
            num_ctx: window_ctx,
            layers: windows.max(1),
            ..config
        };
        Self {
            global: CausalCache::new(global_config),
            window: CausalCache::new(window_config),
            layer_types,
            local_index,
            current: LayerType::Global,
        }
    }

    fn active(&mut self) -> &mut CausalCache {
        match self.current {
            LayerType::Global => &mut self.global,
            LayerType::SlidingWindow => &mut self.window,
        }
    }

    /// Route writes by layer index.
    pub fn set_layer(&mut self, layer: usize) {
        self.current = self
            .layer_types
            .get(layer)
            .copied()
            .unwrap_or(LayerType::Global);
        let local = self.local_index.get(layer).copied().unwrap_or(0);
        self.active().set_layer(local);
    }

    /// Route writes by explicit type.
    pub fn set_layer_type(&mut self, t: LayerType) {
        self.current = t;
    }

    pub fn current_type(&self) -> LayerType {
        self.current
    }

    /// Slot operations mirror on both caches; the global cache is
    /// authoritative for prefix reuse and history length.
    pub fn load_slot(&mut self, inputs: &[TokenId]) -> Result<(usize, Vec<TokenId>), CacheError> {
        let (slot, remaining) = self.global.load_slot(inputs)?;
        let (wslot, _) = self.window.load_slot(inputs)?;
        debug_assert_eq!(slot, wslot);
        Ok((slot, remaining))
    }

    pub fn free_slot(&mut self, index: usize) {
        self.global.free_slot(index);
        self.window.free_slot(index);
    }

    pub fn slot(&self, index: usize) -> Result<&CacheSlot, CacheError> {
        self.global.slot(index)
    }

    pub fn can_accept(&self, index: usize, n: usize) -> bool {
        // The window cache sheds, so only the global cache constrains.
        self.global.can_accept(index, n)
    }

    /// Append processed tokens. The window cache keeps only recent
    /// history: it sheds its oldest tokens until the new ones fit, and a
    /// run longer than the window keeps just the run's tail.
    pub fn commit(&mut self, index: usize, tokens: &[TokenId]) -> Result<(), CacheError> {
        self.global.commit(index, tokens)?;

        let capacity = self.window.slot_capacity();
        let tail = if tokens.len() > capacity {
            self.window.truncate(index, 0)?;
            &tokens[tokens.len() - capacity..]
        } else {
            tokens
        };

        while !self.window.can_accept(index, tail.len()) {
            let resident = self.window.slot(index)?.inputs.len();
            if resident <= 1 {
                self.window.truncate(index, 0)?;
                break;
            }
            self.window.shift(index, 0)?;
        }
        self.window.commit(index, tail)
    }

    pub fn truncate(&mut self, index: usize, len: usize) -> Result<(), CacheError> {
        self.global.truncate(index, len)?;
        let wlen = len.min(self.window.slot(index)?.inputs.len());
        self.window.truncate(index, wlen)
    }

    pub fn shift(&mut self, index: usize, num_keep: usize) -> Result<(), CacheError> {
        self.global.shift(index, num_keep)?;
        // The global cache shifted in place, so the shared shiftable flag
        // is set and the window shift cannot ask for reprocessing.
        self.window.shift(index, num_keep)
    }

    pub fn start_forward(&self, batch: &[(usize, usize)], reserve_only: bool) -> Vec<f16> {
        self.global.start_forward(batch, reserve_only)
    }

    pub fn write_kv(
        &mut self,
        index: usize,
        position: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), CacheError> {
        self.active().write_kv(index, position, key, value)
    }

    pub fn global_cache(&self) -> &CausalCache {
        &self.global
    }

    pub fn window_cache(&self) -> &CausalCache {
        &self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapper() -> WrapperCache {
        let config = CacheConfig {
            num_ctx: 64,
            parallel: 1,
            layers: 4,
            ..Default::default()
        };
        // Alternating global / windowed layers.
        let types = vec![
            LayerType::SlidingWindow,
            LayerType::Global,
            LayerType::SlidingWindow,
            LayerType::Global,
        ];
        WrapperCache::new(config, 8, types)
    }

    #[test]
    fn test_layer_routing() {
        let mut w = wrapper();
        w.set_layer(0);
        assert_eq!(w.current_type(), LayerType::SlidingWindow);
        w.set_layer(1);
        assert_eq!(w.current_type(), LayerType::Global);
        w.set_layer_type(LayerType::SlidingWindow);
        assert_eq!(w.current_type(), LayerType::SlidingWindow);
    }

    #[test]
    fn test_buffers_sized_per_layer_kind() {
        let w = wrapper();
        // Two windowed layers at 8 tokens, two global layers at 64.
        assert_eq!(w.window_cache().total_capacity(), 8);
        assert_eq!(w.global_cache().total_capacity(), 64);
        assert!(w.window_cache().layer_bytes() < w.global_cache().layer_bytes());
    }

    #[test]
    fn test_window_sheds_global_keeps() {
        let mut w = wrapper();
        let (s, _) = w.load_slot(&[]).unwrap();

        // 24 tokens: beyond the 8-token window, within the 64 global.
        for chunk in (0..24).collect::<Vec<i32>>().chunks(6) {
            w.commit(s, chunk).unwrap();
        }
        assert_eq!(w.global_cache().slot(s).unwrap().inputs.len(), 24);
        assert!(w.window_cache().slot(s).unwrap().inputs.len() <= 8);
        assert!(w.can_accept(s, 6));
    }

    #[test]
    fn test_window_sheds_until_commit_fits() {
        let mut w = wrapper();
        let (s, _) = w.load_slot(&[]).unwrap();

        // 6 resident, 6 incoming: one shed of len/2 frees only 3, so the
        // window must keep shedding before the commit can land.
        w.commit(s, &[0, 1, 2, 3, 4, 5]).unwrap();
        w.commit(s, &[6, 7, 8, 9, 10, 11]).unwrap();

        let window = w.window_cache().slot(s).unwrap();
        assert!(window.inputs.len() <= 8);
        assert_eq!(window.inputs[window.inputs.len() - 6..], [6, 7, 8, 9, 10, 11]);
        assert_eq!(w.global_cache().slot(s).unwrap().inputs.len(), 12);
    }

    #[test]
    fn test_run_longer_than_window_keeps_tail() {
        let mut w = wrapper();
        let (s, _) = w.load_slot(&[]).unwrap();

        let run: Vec<i32> = (0..12).collect();
        w.commit(s, &run).unwrap();

        assert_eq!(w.global_cache().slot(s).unwrap().inputs.len(), 12);
        assert_eq!(w.window_cache().slot(s).unwrap().inputs, (4..12).collect::<Vec<i32>>());
    }

    #[test]
    fn test_slots_stay_in_step() {
        let mut w = wrapper();
        let (s, remaining) = w.load_slot(&[1, 2, 3]).unwrap();
        assert_eq!(remaining, vec![1, 2, 3]);
        w.commit(s, &remaining).unwrap();
        w.free_slot(s);

        let (s2, remaining) = w.load_slot(&[1, 2, 3, 4]).unwrap();
        assert_eq!(s2, s);
        assert_eq!(remaining, vec![4]);
    }
}
