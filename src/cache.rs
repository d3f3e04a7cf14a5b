//! Activation cache for storing named intermediate transformer states

use anyhow::Result;
use candle_core::Tensor;
use std::collections::BTreeMap;

use crate::hooked::HookPoint;

/// Activations recorded during one forward pass, keyed by hook point.
///
/// Tensors keep the shape the backend produced: `[batch, pos, d_model]`
/// for residual-stream hooks, `[batch, pos, head, d_model]` for
/// `hook_result` and `[batch, head, query, key]` for `hook_pattern`.
#[derive(Debug, Default, Clone)]
pub struct ActivationCache {
    activations: BTreeMap<HookPoint, Tensor>,
}

impl ActivationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an activation, replacing any earlier one at the same point
    pub fn insert(&mut self, point: HookPoint, tensor: Tensor) {
        self.activations.insert(point, tensor);
    }

    pub fn get(&self, point: HookPoint) -> Option<&Tensor> {
        self.activations.get(&point)
    }

    /// Like [`get`](Self::get) but errors when the point was not recorded
    pub fn require(&self, point: HookPoint) -> Result<&Tensor> {
        self.activations
            .get(&point)
            .ok_or_else(|| anyhow::anyhow!("{point} not in cache"))
    }

    /// Recorded hook points in forward order
    pub fn points(&self) -> impl Iterator<Item = HookPoint> + '_ {
        self.activations.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Bytes held by all cached tensors
    pub fn memory_usage(&self) -> usize {
        self.activations
            .values()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }
}
