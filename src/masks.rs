//! Causal attention masks shared by every backend.
//!
//! The validation, test and patched runs of an experiment all share one
//! sequence length, so each `(seq_len, device, dtype)` mask is built once
//! and handed out as a shallow clone afterwards.

use anyhow::Result;
use candle_core::{DType, Device, DeviceLocation, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

type MaskKey = (usize, DeviceLocation, DType);

static CAUSAL_MASKS: LazyLock<Mutex<HashMap<MaskKey, Tensor>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Additive causal mask `[1, 1, seq_len, seq_len]`: `0` where key `<=`
/// query, `-inf` above the diagonal.
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let key = (seq_len, device.location(), dtype);
    if let Some(mask) = CAUSAL_MASKS.lock().unwrap().get(&key) {
        return Ok(mask.clone());
    }

    let positions = Tensor::arange(0u32, seq_len as u32, device)?;
    let visible = positions
        .reshape((1, seq_len))?
        .broadcast_le(&positions.reshape((seq_len, 1))?)?;
    let open = Tensor::zeros((seq_len, seq_len), DType::F32, device)?;
    let blocked = Tensor::full(f32::NEG_INFINITY, (seq_len, seq_len), device)?;
    let mask = visible
        .where_cond(&open, &blocked)?
        .reshape((1, 1, seq_len, seq_len))?
        .to_dtype(dtype)?;

    CAUSAL_MASKS.lock().unwrap().insert(key, mask.clone());
    Ok(mask)
}

pub fn clear_mask_caches() {
    CAUSAL_MASKS.lock().unwrap().clear();
}

pub fn mask_cache_size() -> usize {
    CAUSAL_MASKS.lock().unwrap().len()
}
