//! Integration tests for knowledge-circuits
//!
//! Everything runs offline against tiny models written to temporary
//! directories. Tests marked with #[ignore] require a model download.
//! Run them explicitly with: cargo test --ignored

use candle_core::{DType, Device, Tensor};
use knowledge_circuits::metrics::scalar;
use knowledge_circuits::{
    clear_mask_caches, get_all_knowledge_things, get_data, get_mask_repeat_candidates, get_model,
    load_model, one_item_per_batch, DataConfig, ExperimentConfig, Gpt2Config, HookPoint,
    KnowledgeType, MaskSource, Metric, MetricKind,
};
use serial_test::serial;
use std::collections::HashMap;
use std::path::Path;
use tempfile::TempDir;

const VOCAB: [&str; 16] = [
    "<|endoftext|>", "[UNK]", "The", "capital", "of", "is", "France", "Paris", "Germany",
    "Berlin", "Italy", "Rome", "city", "has", "its", "in",
];

fn tiny_config() -> Gpt2Config {
    Gpt2Config {
        n_embd: 16,
        n_head: 2,
        n_layer: 2,
        n_positions: 64,
        vocab_size: 24,
        layer_norm_epsilon: 1e-5,
    }
}

/// config.json, model.safetensors and tokenizer.json for a random GPT-2
fn write_tiny_model(dir: &Path) {
    let config = tiny_config();
    std::fs::write(
        dir.join("config.json"),
        format!(
            r#"{{"model_type": "gpt2", "n_embd": {}, "n_head": {}, "n_layer": {},
                "n_positions": {}, "vocab_size": {}}}"#,
            config.n_embd, config.n_head, config.n_layer, config.n_positions, config.vocab_size
        ),
    )
    .unwrap();

    let weights = config.random_weights(7).unwrap();
    candle_core::safetensors::save(&weights, dir.join("model.safetensors")).unwrap();

    let vocab: Vec<String> = VOCAB
        .iter()
        .enumerate()
        .map(|(id, word)| format!("{word:?}: {id}"))
        .collect();
    let tokenizer = format!(
        r#"{{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {{"type": "Whitespace"}},
            "post_processor": null,
            "decoder": null,
            "model": {{"type": "WordLevel", "vocab": {{{}}}, "unk_token": "[UNK]"}}
        }}"#,
        vocab.join(", ")
    );
    std::fs::write(dir.join("tokenizer.json"), tokenizer).unwrap();
}

/// validation_data.safetensors and mask.safetensors of shape `[rows, cols]`
fn write_data_files(dir: &Path, rows: usize, cols: usize) -> DataConfig {
    let tokens: Vec<i64> = (0..rows * cols).map(|i| (i % VOCAB.len()) as i64).collect();
    let tokens = Tensor::from_vec(tokens, (rows, cols), &Device::Cpu).unwrap();
    candle_core::safetensors::save(
        &HashMap::from([("data", tokens)]),
        dir.join("validation_data.safetensors"),
    )
    .unwrap();

    let mask: Vec<u8> = (0..rows * cols).map(|i| u8::from(i % 2 == 0)).collect();
    let mask = Tensor::from_vec(mask, (rows, cols), &Device::Cpu).unwrap();
    candle_core::safetensors::save(&HashMap::from([("mask", mask)]), dir.join("mask.safetensors"))
        .unwrap();

    DataConfig {
        validation_file: "validation_data.safetensors".to_string(),
        mask_file: "mask.safetensors".to_string(),
        ..DataConfig::local(dir)
    }
}

fn sorted_rows(tensor: &Tensor) -> Vec<Vec<u32>> {
    let mut rows: Vec<Vec<u32>> = tensor.to_vec2().unwrap();
    rows.sort();
    rows
}

fn model_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_tiny_model(dir.path());
    dir
}

#[test]
fn test_load_local_model() {
    let dir = model_dir();
    let name = dir.path().to_str().unwrap();
    let (model, tokenizer) = load_model(name, None).unwrap();
    assert_eq!(model.dtype(), DType::F32);
    assert_eq!(model.config().n_layers(), 2);
    assert_eq!(tokenizer.pad_token(), "<|endoftext|>");
    assert_eq!(tokenizer.pad_token_id(), tokenizer.eos_token_id());
}

#[test]
fn test_get_model_is_instrumented() {
    let dir = model_dir();
    let model = get_model(dir.path().to_str().unwrap(), &Device::Cpu).unwrap();
    assert!(model.config().use_attn_result);
    assert!(!model.config().use_split_qkv_input);
    assert_eq!(model.config().use_hook_mlp_in, Some(true));

    let ids = Tensor::new(&[[2u32, 3, 4, 6, 5]], &Device::Cpu).unwrap();
    let (logits, cache) = model.run_with_cache(&ids).unwrap();
    assert_eq!(logits.dims(), &[1, 5, 24]);
    assert_eq!(
        cache.require(HookPoint::AttnResult(1)).unwrap().dims(),
        &[1, 5, 2, 16]
    );
}

#[test]
fn test_data_accessors() {
    let dir = TempDir::new().unwrap();
    let config = write_data_files(dir.path(), 6, 10);

    let full = get_data(&config, None, None, &Device::Cpu).unwrap();
    assert_eq!(full.dims(), &[6, 10]);
    let sliced = get_data(&config, Some(4), Some(5), &Device::Cpu).unwrap();
    assert_eq!(sliced.dims(), &[4, 5]);

    let mask = get_mask_repeat_candidates(&config, Some(2), Some(4), &Device::Cpu).unwrap();
    assert_eq!(
        mask.to_vec2::<u8>().unwrap(),
        vec![vec![1, 0, 1, 0], vec![1, 0, 1, 0]]
    );
}

#[test]
fn test_experiment_with_repeat_mask() {
    let model = model_dir();
    let data = TempDir::new().unwrap();
    let config = ExperimentConfig {
        num_examples: 2,
        seq_len: 300,
        model: model.path().to_str().unwrap().to_string(),
        metric: "nll".to_string(),
        data: write_data_files(data.path(), 8, 32),
        ..Default::default()
    };

    let things = get_all_knowledge_things(&config, &Device::Cpu).unwrap();
    let (val_rows, seq_len) = things.validation_data.dims2().unwrap();
    assert_eq!(val_rows, 2);
    assert_eq!(things.test_data.dims(), &[2, seq_len]);
    assert_eq!(things.validation_mask.dims(), &[2, seq_len]);
    assert_eq!(things.test_patch_data.dims(), &[2, seq_len]);
    assert_eq!(
        sorted_rows(&things.validation_patch_data),
        sorted_rows(&things.validation_data)
    );
    assert_eq!(sorted_rows(&things.test_patch_data), sorted_rows(&things.test_data));

    let logits = things.model.forward(&things.validation_data).unwrap();
    let nll = scalar(&things.validation_metric.evaluate(&logits).unwrap()).unwrap();
    assert!(nll.is_finite() && nll > 0.0);
    assert_eq!(
        things.test_metrics.keys().copied().collect::<Vec<_>>(),
        MetricKind::ALL.to_vec()
    );
}

#[test]
fn test_experiment_with_answer_positions() {
    let model = model_dir();
    let config = ExperimentConfig {
        num_examples: 3,
        model: model.path().to_str().unwrap().to_string(),
        knowledge_type: KnowledgeType::Factual,
        mask_source: MaskSource::AnswerPositions,
        ..Default::default()
    };

    let things = get_all_knowledge_things(&config, &Device::Cpu).unwrap();
    let mask: Vec<Vec<u8>> = things.validation_mask.to_vec2().unwrap();
    assert!(mask.iter().all(|row| row.iter().filter(|&&m| m == 1).count() == 1));

    // The unpatched model matches its own baseline
    let logits = things.model.forward(&things.validation_data).unwrap();
    let kl = scalar(&things.validation_metric.evaluate(&logits).unwrap()).unwrap();
    assert!(kl.abs() < 1e-5);

    // One expanded row per answer
    let expanded = one_item_per_batch(
        &things.validation_data,
        &things.validation_patch_data,
        &things.validation_mask,
        &things.validation_logprobs,
    )
    .unwrap();
    assert_eq!(expanded.len(), 3);
    let per_row = expanded
        .metric
        .evaluate(&things.model.forward(&expanded.toks).unwrap())
        .unwrap();
    assert_eq!(per_row.dims(), &[3]);
}

#[test]
fn test_bogus_metric_is_rejected() {
    let config = ExperimentConfig {
        metric: "bogus".to_string(),
        ..Default::default()
    };
    let err = get_all_knowledge_things(&config, &Device::Cpu).err().unwrap();
    assert!(err.to_string().contains("bogus"));
}

#[test]
#[serial]
fn test_forward_after_clearing_mask_cache() {
    let dir = model_dir();
    let model = get_model(dir.path().to_str().unwrap(), &Device::Cpu).unwrap();
    let ids = Tensor::new(&[[2u32, 3, 4]], &Device::Cpu).unwrap();
    let before = model.forward(&ids).unwrap();
    clear_mask_caches();
    let after = model.forward(&ids).unwrap();
    assert_eq!(
        before.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
        after.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    );
}

#[test]
#[ignore = "requires model download"]
fn test_gpt2_knowledge_experiment() {
    let config = ExperimentConfig {
        num_examples: 4,
        mask_source: MaskSource::AnswerPositions,
        ..Default::default()
    };
    let things = get_all_knowledge_things(&config, &Device::Cpu).unwrap();
    assert_eq!(things.model.n_layers(), 12);
    let logits = things.model.forward(&things.test_data).unwrap();
    for metric in things.test_metrics.values() {
        assert!(scalar(&metric.evaluate(&logits).unwrap()).unwrap().is_finite());
    }
}
