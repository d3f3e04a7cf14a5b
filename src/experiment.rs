//! Experiment assembly for circuit discovery on knowledge prompts
//!
//! Loads the instrumented model and a knowledge dataset, splits tokens,
//! labels, patch data and masks into validation and test halves, records
//! the unpatched model's log-probs on each half and binds the metrics.

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::log_softmax;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::data::{get_mask_repeat_candidates, slice_limits, DataConfig};
use crate::dataset::{KnowledgeDataset, KnowledgeDatasetConfig, KnowledgeType};
use crate::hooked::{get_model, HookedTransformer};
use crate::metrics::{Metric, MetricInputs, MetricKind};

/// Which positions the metrics score
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskSource {
    /// The repeat-candidate mask from the data files
    #[default]
    RepeatCandidates,
    /// The position before each answer in the knowledge dataset
    AnswerPositions,
}

/// Configuration for one experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Examples per split; the dataset holds twice as many
    pub num_examples: usize,
    pub seq_len: usize,
    pub model: String,
    /// Seed for shuffling the patch data
    pub data_seed: u64,
    pub metric: String,
    pub return_one_element: bool,
    pub knowledge_type: KnowledgeType,
    pub nb_templates: usize,
    /// Seed for sampling the dataset
    pub dataset_seed: u64,
    pub mask_source: MaskSource,
    pub data: DataConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            num_examples: 10,
            seq_len: 300,
            model: "gpt2".to_string(),
            data_seed: 42,
            metric: "kl_div".to_string(),
            return_one_element: true,
            knowledge_type: KnowledgeType::Factual,
            nb_templates: 1,
            dataset_seed: 0,
            mask_source: MaskSource::default(),
            data: DataConfig::default(),
        }
    }
}

/// Everything the discovery algorithm consumes
pub struct AllDataThings {
    pub model: HookedTransformer,
    pub validation_metric: Box<dyn Metric>,
    pub validation_data: Tensor,
    pub validation_labels: Tensor,
    pub validation_mask: Tensor,
    pub validation_patch_data: Tensor,
    /// Unpatched log-probs over the validation block
    pub validation_logprobs: Tensor,
    /// Every metric kind, bound to the test split
    pub test_metrics: BTreeMap<MetricKind, Box<dyn Metric>>,
    pub test_data: Tensor,
    pub test_labels: Tensor,
    pub test_mask: Tensor,
    pub test_patch_data: Tensor,
    pub test_logprobs: Tensor,
}

/// First `n` rows and the remaining rows
pub fn split_validation_test(tensor: &Tensor, n: usize) -> Result<(Tensor, Tensor)> {
    let rows = tensor.dim(0)?;
    anyhow::ensure!(n <= rows, "Cannot take {n} validation rows from {rows}");
    Ok((tensor.narrow(0, 0, n)?, tensor.narrow(0, n, rows - n)?))
}

/// `labels[:, p] = toks[:, p + 1]`; the last column holds `pad_id`
pub fn next_token_labels(toks: &Tensor, pad_id: u32) -> Result<Tensor> {
    let (rows, cols) = toks.dims2()?;
    anyhow::ensure!(cols > 0, "Cannot label empty sequences");
    let pad = Tensor::full(pad_id, (rows, 1), toks.device())?;
    let shifted = toks.to_dtype(DType::U32)?.narrow(1, 1, cols - 1)?;
    Ok(Tensor::cat(&[&shifted, &pad], 1)?)
}

/// Rows of `tensor` in a seeded random order
pub fn shuffle_rows(tensor: &Tensor, seed: u64) -> Result<Tensor> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut order: Vec<u32> = (0..tensor.dim(0)? as u32).collect();
    order.shuffle(&mut rng);
    let order = Tensor::new(order, tensor.device())?;
    Ok(tensor.index_select(&order, 0)?)
}

/// Patch rows for the first `2 * n` rows of `tokens`: each half is
/// shuffled on its own, so validation rows are only ever patched with
/// validation rows and test rows with test rows
pub fn shuffle_within_splits(tokens: &Tensor, n: usize, seed: u64) -> Result<Tensor> {
    let rows = tokens.dim(0)?;
    anyhow::ensure!(2 * n <= rows, "Need {} rows to build patch data, got {rows}", 2 * n);
    let validation = shuffle_rows(&tokens.narrow(0, 0, n)?, seed)?;
    let test = shuffle_rows(&tokens.narrow(0, n, n)?, seed)?;
    Ok(Tensor::cat(&[&validation, &test], 0)?)
}

/// Log-softmax of the unpatched model's logits; nothing is tracked for
/// gradients
pub fn baseline_logprobs(model: &HookedTransformer, toks: &Tensor) -> Result<Tensor> {
    let logits = model.forward(toks)?.to_dtype(DType::F32)?;
    Ok(log_softmax(&logits, D::Minus1)?)
}

/// Assemble an experiment from its configuration.
///
/// The metric name is checked before anything is loaded.
pub fn get_all_knowledge_things(config: &ExperimentConfig, device: &Device) -> Result<AllDataThings> {
    let metric: MetricKind = config.metric.parse()?;

    let model = get_model(&config.model, device)?;
    let dataset = KnowledgeDataset::new(
        KnowledgeDatasetConfig {
            knowledge_type: config.knowledge_type,
            n: config.num_examples * 2,
            nb_templates: config.nb_templates,
            seed: config.dataset_seed,
        },
        model.tokenizer(),
        device,
    )?;

    let tokens = slice_limits(dataset.toks(), None, Some(config.seq_len))?;
    let tokens = slice_limits(&tokens, Some(2 * config.num_examples), None)?;
    let patch_tokens = shuffle_within_splits(&tokens, config.num_examples, config.data_seed)?;
    let mask = match config.mask_source {
        MaskSource::RepeatCandidates => {
            get_mask_repeat_candidates(&config.data, None, None, device)?
        }
        MaskSource::AnswerPositions => dataset.answer_mask().clone(),
    };

    assemble_data_things(
        model,
        &tokens,
        &patch_tokens,
        &mask,
        config.num_examples,
        metric,
        config.return_one_element,
    )
}

/// Split prepared tensors, compute baselines and bind metrics.
///
/// `tokens` and `patch_tokens` need at least `2 * num_examples` rows; only
/// those rows are used. `mask` must cover them and is cut to the same
/// shape, with its last column cleared since that position has no label.
pub fn assemble_data_things(
    model: HookedTransformer,
    tokens: &Tensor,
    patch_tokens: &Tensor,
    mask: &Tensor,
    num_examples: usize,
    metric: MetricKind,
    return_one_element: bool,
) -> Result<AllDataThings> {
    let device = model.device().clone();
    let n_total = 2 * num_examples;
    let (rows, seq_len) = tokens.dims2()?;
    anyhow::ensure!(num_examples > 0, "num_examples must be positive");
    anyhow::ensure!(
        rows >= n_total,
        "Need {n_total} token rows for {num_examples} examples per split, got {rows}"
    );
    anyhow::ensure!(
        patch_tokens.dims2()? == (rows, seq_len),
        "Patch tokens {:?} do not match tokens {:?}",
        patch_tokens.dims(),
        tokens.dims()
    );
    let (mask_rows, mask_cols) = mask.dims2()?;
    anyhow::ensure!(
        mask_rows >= n_total && mask_cols >= seq_len,
        "Mask {:?} does not cover {n_total} x {seq_len} tokens",
        mask.dims()
    );

    let default_data = slice_limits(tokens, Some(n_total), None)?
        .to_dtype(DType::U32)?
        .to_device(&device)?;
    let patch_data = slice_limits(patch_tokens, Some(n_total), None)?
        .to_dtype(DType::U32)?
        .to_device(&device)?;
    let labels = next_token_labels(&default_data, model.tokenizer().pad_token_id())?;

    let mask_orig = slice_limits(mask, Some(n_total), Some(seq_len))?
        .to_dtype(DType::U8)?
        .to_device(&device)?;
    let keep = Tensor::cat(
        &[
            Tensor::ones((n_total, seq_len - 1), DType::U8, &device)?,
            Tensor::zeros((n_total, 1), DType::U8, &device)?,
        ],
        1,
    )?;
    let mask_orig = (mask_orig * keep)?;

    let (validation_data, test_data) = split_validation_test(&default_data, num_examples)?;
    let (validation_patch_data, test_patch_data) = split_validation_test(&patch_data, num_examples)?;
    let (validation_labels, test_labels) = split_validation_test(&labels, num_examples)?;
    let (validation_mask, test_mask) = split_validation_test(&mask_orig, num_examples)?;
    info!(
        "Split {} rows x {} positions: {} validation, {} test",
        n_total,
        seq_len,
        validation_data.dim(0)?,
        test_data.dim(0)?
    );

    let validation_logprobs = baseline_logprobs(&model, &validation_data)?;
    let test_logprobs = baseline_logprobs(&model, &test_data)?;
    info!("Baseline log-probs computed");

    let validation_metric = metric.build(&MetricInputs {
        base_model_logprobs: &validation_logprobs,
        labels: &validation_labels,
        mask: Some(&validation_mask),
        return_one_element,
    })?;

    let test_inputs = MetricInputs {
        base_model_logprobs: &test_logprobs,
        labels: &test_labels,
        mask: Some(&test_mask),
        return_one_element: true,
    };
    let test_metrics = MetricKind::ALL
        .into_iter()
        .map(|kind| Ok((kind, kind.build(&test_inputs)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;

    Ok(AllDataThings {
        model,
        validation_metric,
        validation_data,
        validation_labels,
        validation_mask,
        validation_patch_data,
        validation_logprobs,
        test_metrics,
        test_data,
        test_labels,
        test_mask,
        test_patch_data,
        test_logprobs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::scalar;
    use crate::test_support::{tiny_model, TINY_VOCAB_SIZE};

    fn tokens_4x8() -> Tensor {
        let ids: Vec<u32> = (0..32).map(|i| (i * 7 % TINY_VOCAB_SIZE) as u32).collect();
        Tensor::from_vec(ids, (4, 8), &Device::Cpu).unwrap()
    }

    fn full_mask(rows: usize, cols: usize) -> Tensor {
        Tensor::ones((rows, cols), DType::U8, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = ExperimentConfig::default();
        assert_eq!(config.model, "gpt2");
        assert_eq!(config.data_seed, 42);
        assert_eq!(config.metric, "kl_div");
        assert!(config.return_one_element);
        assert_eq!(config.nb_templates, 1);
        assert_eq!(config.dataset_seed, 0);
        assert_eq!(config.mask_source, MaskSource::RepeatCandidates);
    }

    #[test]
    fn test_split_partitions_rows() {
        let data = tokens_4x8();
        let (val, test) = split_validation_test(&data, 1).unwrap();
        assert_eq!(val.dims(), &[1, 8]);
        assert_eq!(test.dims(), &[3, 8]);

        let joined = Tensor::cat(&[&val, &test], 0).unwrap();
        assert_eq!(
            joined.to_vec2::<u32>().unwrap(),
            data.to_vec2::<u32>().unwrap()
        );
        assert!(split_validation_test(&data, 5).is_err());
    }

    #[test]
    fn test_next_token_labels() {
        let toks = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu).unwrap();
        let labels = next_token_labels(&toks, 0).unwrap();
        assert_eq!(
            labels.to_vec2::<u32>().unwrap(),
            vec![vec![2, 3, 0], vec![5, 6, 0]]
        );
    }

    #[test]
    fn test_shuffle_rows_is_seeded_permutation() {
        let data = tokens_4x8();
        let a: Vec<Vec<u32>> = shuffle_rows(&data, 42).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<u32>> = shuffle_rows(&data, 42).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);

        let mut sorted = a.clone();
        sorted.sort();
        let mut original: Vec<Vec<u32>> = data.to_vec2().unwrap();
        original.sort();
        assert_eq!(sorted, original);
    }

    fn sorted_rows(tensor: &Tensor) -> Vec<Vec<u32>> {
        let mut rows: Vec<Vec<u32>> = tensor.to_vec2().unwrap();
        rows.sort();
        rows
    }

    #[test]
    fn test_patch_rows_stay_within_their_split() {
        let tokens = tokens_4x8();
        let patch = shuffle_within_splits(&tokens, 2, 42).unwrap();
        assert_eq!(patch.dims(), tokens.dims());

        let (validation, test) = split_validation_test(&tokens, 2).unwrap();
        let (validation_patch, test_patch) = split_validation_test(&patch, 2).unwrap();
        assert_eq!(sorted_rows(&validation_patch), sorted_rows(&validation));
        assert_eq!(sorted_rows(&test_patch), sorted_rows(&test));

        // Other seeds never pull rows across the split either
        for seed in 0..16 {
            let patch = shuffle_within_splits(&tokens, 2, seed).unwrap();
            let (validation_patch, _) = split_validation_test(&patch, 2).unwrap();
            assert_eq!(sorted_rows(&validation_patch), sorted_rows(&validation));
        }
        assert!(shuffle_within_splits(&tokens, 3, 42).is_err());
    }

    #[test]
    fn test_assemble_end_to_end() {
        let tokens = tokens_4x8();
        let patch = shuffle_within_splits(&tokens, 2, 42).unwrap();
        let mut model = tiny_model(2);
        crate::hooked::configure_for_discovery(&mut model).unwrap();

        // Reference baseline over rows 0-1 only, before the model moves
        let reference: Vec<Vec<Vec<f32>>> =
            baseline_logprobs(&model, &tokens.narrow(0, 0, 2).unwrap())
                .unwrap()
                .to_vec3()
                .unwrap();

        let things = assemble_data_things(
            model,
            &tokens,
            &patch,
            &full_mask(4, 8),
            2,
            MetricKind::KlDiv,
            true,
        )
        .unwrap();

        let source: Vec<Vec<u32>> = tokens.to_vec2().unwrap();
        let val: Vec<Vec<u32>> = things.validation_data.to_vec2().unwrap();
        let test: Vec<Vec<u32>> = things.test_data.to_vec2().unwrap();
        assert_eq!(val, source[..2].to_vec());
        assert_eq!(test, source[2..].to_vec());
        assert_eq!(things.validation_patch_data.dims(), &[2, 8]);
        assert_eq!(things.test_labels.dims(), &[2, 8]);

        assert_eq!(things.validation_logprobs.dims(), &[2, 8, TINY_VOCAB_SIZE]);
        let got: Vec<Vec<Vec<f32>>> = things.validation_logprobs.to_vec3().unwrap();
        assert_eq!(got, reference);

        // Final column is never scored
        let mask: Vec<Vec<u8>> = things.test_mask.to_vec2().unwrap();
        assert!(mask.iter().all(|row| row[7] == 0 && row[..7].iter().all(|&m| m == 1)));

        // Unpatched model scores zero divergence against its own baseline
        let logits = things.model.forward(&things.validation_data).unwrap();
        let kl = scalar(&things.validation_metric.evaluate(&logits).unwrap()).unwrap();
        assert!(kl.abs() < 1e-5);

        assert_eq!(things.test_metrics.len(), 3);
        let test_logits = things.model.forward(&things.test_data).unwrap();
        for (kind, metric) in &things.test_metrics {
            let value = metric.evaluate(&test_logits).unwrap();
            assert_eq!(value.rank(), 0, "{kind} should reduce");
        }
        let match_nll = scalar(
            &things.test_metrics[&MetricKind::MatchNll]
                .evaluate(&test_logits)
                .unwrap(),
        )
        .unwrap();
        assert!(match_nll.abs() < 1e-5);
    }

    #[test]
    fn test_validation_metric_unreduced() {
        let tokens = tokens_4x8();
        let things = assemble_data_things(
            tiny_model(1),
            &tokens,
            &tokens,
            &full_mask(4, 8),
            2,
            MetricKind::KlDiv,
            false,
        )
        .unwrap();
        let logits = things.model.forward(&things.validation_data).unwrap();
        let per_pos = things.validation_metric.evaluate(&logits).unwrap();
        // 2 rows x 7 scored positions
        assert_eq!(per_pos.dims(), &[14]);
    }

    #[test]
    fn test_too_few_rows() {
        let tokens = tokens_4x8();
        let result = assemble_data_things(
            tiny_model(1),
            &tokens,
            &tokens,
            &full_mask(4, 8),
            3,
            MetricKind::Nll,
            true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_mask_must_cover_tokens() {
        let tokens = tokens_4x8();
        let result = assemble_data_things(
            tiny_model(1),
            &tokens,
            &tokens,
            &full_mask(4, 6),
            2,
            MetricKind::KlDiv,
            true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_metric_fails_before_loading() {
        let config = ExperimentConfig {
            metric: "bogus".to_string(),
            // Would require a download if the metric were accepted
            model: "definitely-not-a-model".to_string(),
            ..Default::default()
        };
        let err = get_all_knowledge_things(&config, &Device::Cpu).err().unwrap();
        assert_eq!(err.to_string(), "Unknown metric bogus");
    }
}
