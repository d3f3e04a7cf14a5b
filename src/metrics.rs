//! Loss functions scoring a (possibly patched) model against the unpatched
//! baseline.
//!
//! All metrics take logits `[batch, pos, vocab]`. Per-position losses are
//! reduced in three steps: an optional mask picks eligible `(row, pos)`
//! pairs, the rest is flattened, and with `return_one_element` the result
//! is averaged to a scalar.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::ops::log_softmax;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A loss over model logits
pub trait Metric: Send + Sync {
    /// Scalar when the metric reduces, otherwise one value per selected
    /// position
    fn evaluate(&self, logits: &Tensor) -> Result<Tensor>;
}

/// Keep the entries of `values` where `mask` is non-zero, flattened
fn select_masked(values: &Tensor, mask: &Tensor) -> Result<Tensor> {
    anyhow::ensure!(
        values.dims() == mask.dims(),
        "Loss shape {:?} does not match mask shape {:?}",
        values.dims(),
        mask.dims()
    );
    let flags: Vec<u8> = mask.flatten_all()?.to_dtype(DType::U8)?.to_vec1()?;
    let idx: Vec<u32> = flags
        .iter()
        .enumerate()
        .filter(|(_, &m)| m != 0)
        .map(|(i, _)| i as u32)
        .collect();
    let idx = Tensor::new(idx, values.device())?;
    Ok(values.flatten_all()?.index_select(&idx, 0)?)
}

fn reduce(values: Tensor, mask: Option<&Tensor>, return_one_element: bool) -> Result<Tensor> {
    let selected = match mask {
        Some(mask) => select_masked(&values, mask)?,
        None => values.flatten_all()?,
    };
    if !return_one_element {
        return Ok(selected);
    }
    anyhow::ensure!(selected.elem_count() > 0, "No positions selected to average over");
    Ok(selected.mean_all()?)
}

/// Logits at the last position, `[batch, vocab]`
fn last_position(logits: &Tensor) -> Result<Tensor> {
    let seq_len = logits.dim(1)?;
    Ok(logits.i((.., seq_len - 1))?.contiguous()?)
}

/// Row `k` of the result is `logits[k, end_positions[k]]`
fn at_end_positions(logits: &Tensor, end_positions: &Tensor) -> Result<Tensor> {
    let (k, seq_len, vocab) = logits.dims3()?;
    anyhow::ensure!(
        end_positions.dims() == [k],
        "Expected {k} end positions, got shape {:?}",
        end_positions.dims()
    );
    let positions: Vec<u32> = end_positions.to_dtype(DType::U32)?.to_vec1()?;
    let flat: Vec<u32> = positions
        .iter()
        .enumerate()
        .map(|(row, &pos)| (row * seq_len) as u32 + pos)
        .collect();
    let flat = Tensor::new(flat, logits.device())?;
    Ok(logits.reshape((k * seq_len, vocab))?.index_select(&flat, 0)?)
}

/// `KL(base || model)` per position, summed over the vocabulary
#[derive(Debug, Clone)]
pub struct KlDivergence {
    base_model_logprobs: Tensor,
    mask: Option<Tensor>,
    last_seq_element_only: bool,
    return_one_element: bool,
    end_positions: Option<Tensor>,
}

impl KlDivergence {
    /// Against `base_model_logprobs`; scores the last position only and
    /// reduces to a scalar until configured otherwise
    pub fn new(base_model_logprobs: Tensor) -> Self {
        Self {
            base_model_logprobs,
            mask: None,
            last_seq_element_only: true,
            return_one_element: true,
            end_positions: None,
        }
    }

    pub fn with_mask(mut self, mask: Option<Tensor>) -> Self {
        self.mask = mask;
        self
    }

    pub fn last_seq_element_only(mut self, enabled: bool) -> Self {
        self.last_seq_element_only = enabled;
        self
    }

    pub fn return_one_element(mut self, enabled: bool) -> Self {
        self.return_one_element = enabled;
        self
    }

    /// Score row `k` only at position `end_positions[k]`
    pub fn with_end_positions(mut self, end_positions: Tensor) -> Self {
        self.end_positions = Some(end_positions);
        self
    }

    pub fn base_model_logprobs(&self) -> &Tensor {
        &self.base_model_logprobs
    }
}

impl Metric for KlDivergence {
    fn evaluate(&self, logits: &Tensor) -> Result<Tensor> {
        let mut logits = logits.to_dtype(DType::F32)?;
        if self.last_seq_element_only {
            logits = last_position(&logits)?;
        }
        if let Some(end_positions) = &self.end_positions {
            logits = at_end_positions(&logits, end_positions)?;
        }
        let logprobs = log_softmax(&logits, D::Minus1)?;

        let base = self
            .base_model_logprobs
            .to_device(logprobs.device())?
            .to_dtype(DType::F32)?;
        anyhow::ensure!(
            base.dims() == logprobs.dims(),
            "Baseline shape {:?} does not match logits {:?}",
            base.dims(),
            logprobs.dims()
        );
        let kl = (base.exp()? * (&base - &logprobs)?)?.sum(D::Minus1)?;
        reduce(kl, self.mask.as_ref(), self.return_one_element)
    }
}

/// Negative log-probability of the labelled next token
#[derive(Debug, Clone)]
pub struct NegativeLogProbs {
    labels: Tensor,
    mask: Option<Tensor>,
    baseline: f64,
    last_seq_element_only: bool,
    return_one_element: bool,
}

impl NegativeLogProbs {
    /// `labels` holds one token id per scored position
    pub fn new(labels: Tensor) -> Self {
        Self {
            labels,
            mask: None,
            baseline: 0.0,
            last_seq_element_only: true,
            return_one_element: true,
        }
    }

    pub fn with_mask(mut self, mask: Option<Tensor>) -> Self {
        self.mask = mask;
        self
    }

    /// Subtracted from every per-position loss
    pub fn with_baseline(mut self, baseline: f64) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn last_seq_element_only(mut self, enabled: bool) -> Self {
        self.last_seq_element_only = enabled;
        self
    }

    pub fn return_one_element(mut self, enabled: bool) -> Self {
        self.return_one_element = enabled;
        self
    }
}

impl Metric for NegativeLogProbs {
    fn evaluate(&self, logits: &Tensor) -> Result<Tensor> {
        let mut logprobs = log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
        if self.last_seq_element_only {
            logprobs = last_position(&logprobs)?;
        }

        let labels = self
            .labels
            .to_device(logprobs.device())?
            .to_dtype(DType::U32)?;
        anyhow::ensure!(
            labels.rank() + 1 == logprobs.rank() && labels.dims() == &logprobs.dims()[..labels.rank()],
            "Labels shape {:?} does not match log-probs {:?}",
            labels.dims(),
            logprobs.dims()
        );
        let picked = logprobs
            .contiguous()?
            .gather(&labels.unsqueeze(D::Minus1)?.contiguous()?, D::Minus1)?
            .squeeze(D::Minus1)?;
        let nll = (picked.neg()? - self.baseline)?;
        reduce(nll, self.mask.as_ref(), self.return_one_element)
    }
}

/// Mean absolute difference between the model's and the baseline's
/// per-position NLL
#[derive(Debug, Clone)]
pub struct MatchNllMetric {
    nll: NegativeLogProbs,
    base_nll: Tensor,
}

impl MatchNllMetric {
    pub fn new(
        labels: Tensor,
        base_model_logprobs: &Tensor,
        mask: Option<Tensor>,
        last_seq_element_only: bool,
    ) -> Result<Self> {
        let expected_rank = if last_seq_element_only { 2 } else { 3 };
        anyhow::ensure!(
            base_model_logprobs.rank() == expected_rank,
            "Baseline log-probs must have rank {expected_rank}, got {:?}",
            base_model_logprobs.dims()
        );

        // Baseline positions are already selected when scoring the last one
        let base_nll = NegativeLogProbs::new(labels.clone())
            .with_mask(mask.clone())
            .last_seq_element_only(false)
            .return_one_element(false)
            .evaluate(base_model_logprobs)?;

        let nll = NegativeLogProbs::new(labels)
            .with_mask(mask)
            .last_seq_element_only(last_seq_element_only)
            .return_one_element(false);
        Ok(Self { nll, base_nll })
    }

    /// Unreduced baseline NLL over the selected positions
    pub fn base_nll(&self) -> &Tensor {
        &self.base_nll
    }
}

impl Metric for MatchNllMetric {
    fn evaluate(&self, logits: &Tensor) -> Result<Tensor> {
        let nll = self.nll.evaluate(logits)?;
        let base = self.base_nll.to_device(nll.device())?;
        Ok((nll - base)?.abs()?.mean_all()?)
    }
}

/// Metrics selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    KlDiv,
    Nll,
    MatchNll,
}

/// Tensors a metric is bound to. `return_one_element` applies to the KL
/// divergence only; the NLL metrics always reduce.
#[derive(Debug, Clone, Copy)]
pub struct MetricInputs<'a> {
    pub base_model_logprobs: &'a Tensor,
    pub labels: &'a Tensor,
    pub mask: Option<&'a Tensor>,
    pub return_one_element: bool,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [MetricKind::KlDiv, MetricKind::Nll, MetricKind::MatchNll];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::KlDiv => "kl_div",
            MetricKind::Nll => "nll",
            MetricKind::MatchNll => "match_nll",
        }
    }

    /// Construct the metric over every position of the bound data
    pub fn build(self, inputs: &MetricInputs<'_>) -> Result<Box<dyn Metric>> {
        let mask = inputs.mask.cloned();
        Ok(match self {
            MetricKind::KlDiv => Box::new(
                KlDivergence::new(inputs.base_model_logprobs.clone())
                    .with_mask(mask)
                    .last_seq_element_only(false)
                    .return_one_element(inputs.return_one_element),
            ),
            MetricKind::Nll => Box::new(
                NegativeLogProbs::new(inputs.labels.clone())
                    .with_mask(mask)
                    .last_seq_element_only(false),
            ),
            MetricKind::MatchNll => Box::new(MatchNllMetric::new(
                inputs.labels.clone(),
                inputs.base_model_logprobs,
                mask,
                false,
            )?),
        })
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown metric {s}"))
    }
}

/// Scalar value of a reduced metric
pub fn scalar(value: &Tensor) -> Result<f32> {
    Ok(value.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.to_scalar()?)
}
