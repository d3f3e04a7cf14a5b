//! One batch row per evaluation target.
//!
//! A sequence may carry several eligible positions. Expanding gives each
//! eligible `(row, position)` pair its own batch row so that losses can be
//! computed per target instead of per sequence.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::metrics::KlDivergence;

/// Result of [`one_item_per_batch`]
#[derive(Debug, Clone)]
pub struct ExpandedBatch {
    /// `[K, seq]` copies of the source token rows
    pub toks: Tensor,
    /// `[K, seq]` copies of the matching patch rows
    pub patch_toks: Tensor,
    /// `[K]` evaluated position of each row
    pub end_positions: Tensor,
    /// `[K, vocab]` baseline log-probs at each row's position
    pub base_model_logprobs: Tensor,
    /// Source row of each emitted row
    pub source_rows: Vec<usize>,
    /// Per-row KL divergence at `end_positions`, unmasked and unreduced
    pub metric: KlDivergence,
}

impl ExpandedBatch {
    pub fn len(&self) -> usize {
        self.source_rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source_rows.is_empty()
    }
}

/// Emit one row for every non-zero `mask[i, j]` with `j < seq - 1`; the
/// last position has no next token to score.
///
/// Rows are gathered on the host and copied back to the device of `toks`,
/// so the result never aliases the inputs.
pub fn one_item_per_batch(
    toks: &Tensor,
    patch_toks: &Tensor,
    mask: &Tensor,
    base_model_logprobs: &Tensor,
) -> Result<ExpandedBatch> {
    let device = toks.device();
    let (batch, seq_len) = toks.dims2()?;
    anyhow::ensure!(
        patch_toks.dims() == toks.dims() && mask.dims() == toks.dims(),
        "Tokens {:?}, patch tokens {:?} and mask {:?} must share a shape",
        toks.dims(),
        patch_toks.dims(),
        mask.dims()
    );
    let (base_batch, base_seq, vocab) = base_model_logprobs.dims3()?;
    anyhow::ensure!(
        (base_batch, base_seq) == (batch, seq_len),
        "Baseline log-probs {:?} do not cover tokens {:?}",
        base_model_logprobs.dims(),
        toks.dims()
    );

    let tok_rows: Vec<Vec<u32>> = toks.to_dtype(DType::U32)?.to_vec2()?;
    let patch_rows: Vec<Vec<u32>> = patch_toks.to_dtype(DType::U32)?.to_vec2()?;
    let mask_rows: Vec<Vec<u8>> = mask.to_dtype(DType::U8)?.to_vec2()?;

    let mut source_rows = Vec::new();
    let mut end_positions = Vec::new();
    let mut flat_toks = Vec::new();
    let mut flat_patch = Vec::new();
    for (i, mask_row) in mask_rows.iter().enumerate() {
        for (j, &eligible) in mask_row.iter().enumerate().take(seq_len.saturating_sub(1)) {
            if eligible == 0 {
                continue;
            }
            source_rows.push(i);
            end_positions.push(j as u32);
            flat_toks.extend_from_slice(&tok_rows[i]);
            flat_patch.extend_from_slice(&patch_rows[i]);
        }
    }
    let k = source_rows.len();
    anyhow::ensure!(k > 0, "Mask selects no position before the last one");

    let flat_index: Vec<u32> = source_rows
        .iter()
        .zip(&end_positions)
        .map(|(&row, &pos)| (row * seq_len) as u32 + pos)
        .collect();
    let base = base_model_logprobs
        .to_device(&Device::Cpu)?
        .reshape((batch * seq_len, vocab))?
        .index_select(&Tensor::new(flat_index, &Device::Cpu)?, 0)?
        .to_device(device)?;

    let toks = Tensor::from_vec(flat_toks, (k, seq_len), device)?;
    let patch_toks = Tensor::from_vec(flat_patch, (k, seq_len), device)?;
    let end_positions = Tensor::new(end_positions, device)?;
    debug!("Expanded {batch} sequences into {k} rows");

    let metric = KlDivergence::new(base.clone())
        .with_end_positions(end_positions.clone())
        .with_mask(None)
        .last_seq_element_only(false)
        .return_one_element(false);

    Ok(ExpandedBatch {
        toks,
        patch_toks,
        end_positions,
        base_model_logprobs: base,
        source_rows,
        metric,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metric;
    use candle_core::IndexOp;

    fn inputs() -> (Tensor, Tensor, Tensor) {
        let device = Device::Cpu;
        let toks = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12]], &device).unwrap();
        let patch = Tensor::new(&[[4u32, 3, 2, 1], [8, 7, 6, 5], [12, 11, 10, 9]], &device).unwrap();
        let base = candle_nn::ops::log_softmax(
            &Tensor::randn(0f32, 1.0, (3, 4, 6), &device).unwrap(),
            candle_core::D::Minus1,
        )
        .unwrap();
        (toks, patch, base)
    }

    #[test]
    fn test_expansion_cardinality_and_rows() {
        let (toks, patch, base) = inputs();
        // Last-column entries are never emitted
        let mask = Tensor::new(&[[1u8, 0, 1, 1], [0, 0, 0, 1], [0, 1, 0, 0]], &Device::Cpu).unwrap();

        let expanded = one_item_per_batch(&toks, &patch, &mask, &base).unwrap();
        assert_eq!(expanded.len(), 3);
        assert_eq!(expanded.source_rows, vec![0, 0, 2]);
        assert_eq!(expanded.end_positions.to_vec1::<u32>().unwrap(), vec![0, 2, 1]);

        let rows: Vec<Vec<u32>> = expanded.toks.to_vec2().unwrap();
        let source: Vec<Vec<u32>> = toks.to_vec2().unwrap();
        for (row, &src) in rows.iter().zip(&expanded.source_rows) {
            assert_eq!(row, &source[src]);
        }
        let patch_rows: Vec<Vec<u32>> = expanded.patch_toks.to_vec2().unwrap();
        assert_eq!(patch_rows[2], vec![12, 11, 10, 9]);
    }

    #[test]
    fn test_baseline_lookup() {
        let (toks, patch, base) = inputs();
        let mask = Tensor::new(&[[0u8, 1, 0, 0], [1, 0, 1, 0], [0, 0, 0, 0]], &Device::Cpu).unwrap();
        let expanded = one_item_per_batch(&toks, &patch, &mask, &base).unwrap();
        assert_eq!(expanded.base_model_logprobs.dims(), &[3, 6]);

        let positions: Vec<u32> = expanded.end_positions.to_vec1().unwrap();
        for (k, (&src, &pos)) in expanded.source_rows.iter().zip(&positions).enumerate() {
            let got: Vec<f32> = expanded.base_model_logprobs.i(k).unwrap().to_vec1().unwrap();
            let want: Vec<f32> = base.i((src, pos as usize)).unwrap().to_vec1().unwrap();
            assert_eq!(got, want);
        }
    }

    #[test]
    fn test_metric_scores_each_row() {
        let (toks, patch, base) = inputs();
        let mask = Tensor::new(&[[1u8, 1, 0, 0], [0, 0, 1, 0], [0, 0, 0, 0]], &Device::Cpu).unwrap();
        let expanded = one_item_per_batch(&toks, &patch, &mask, &base).unwrap();

        // Logits equal to the source baseline rows give zero divergence
        let logits = base.index_select(
            &Tensor::new(vec![0u32, 0, 1], &Device::Cpu).unwrap(),
            0,
        )
        .unwrap();
        let kl: Vec<f32> = expanded.metric.evaluate(&logits).unwrap().to_vec1().unwrap();
        assert_eq!(kl.len(), 3);
        assert!(kl.iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn test_empty_mask_is_error() {
        let (toks, patch, base) = inputs();
        let mask = Tensor::new(&[[0u8, 0, 0, 1], [0, 0, 0, 1], [0, 0, 0, 0]], &Device::Cpu).unwrap();
        assert!(one_item_per_batch(&toks, &patch, &mask, &base).is_err());
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let (toks, patch, base) = inputs();
        let mask = Tensor::zeros((3, 3), DType::U8, &Device::Cpu).unwrap();
        assert!(one_item_per_batch(&toks, &patch, &mask, &base).is_err());
    }
}
