//! Offline fixtures shared by unit tests

use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

use crate::forward_gpt2::Gpt2Config;
use crate::hooked::HookedTransformer;
use crate::model::{KnowledgeTokenizer, LoadedModel, TokenizerKind};

pub const TINY_VOCAB_SIZE: usize = 32;

const TINY_VOCAB: [&str; 24] = [
    "<|endoftext|>", "[UNK]", "The", "capital", "of", "is", "France", "Paris", "Germany",
    "Berlin", "Italy", "Rome", "Spain", "Madrid", "Japan", "Tokyo", "city", "has", "its",
    "in", "the", "called", "government", "seated",
];

/// Word-level tokenizer over a small vocabulary, pad = eos = `<|endoftext|>`
pub fn tiny_tokenizer() -> KnowledgeTokenizer {
    let vocab: Vec<String> = TINY_VOCAB
        .iter()
        .enumerate()
        .map(|(id, word)| format!("{:?}: {id}", word))
        .collect();
    let json = format!(
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
    let inner = Tokenizer::from_bytes(json.as_bytes()).unwrap();
    KnowledgeTokenizer::new(inner, TokenizerKind::Auto).unwrap()
}

pub fn tiny_config(n_layers: usize) -> Gpt2Config {
    Gpt2Config {
        n_embd: 16,
        n_head: 4,
        n_layer: n_layers,
        n_positions: 32,
        vocab_size: TINY_VOCAB_SIZE,
        layer_norm_epsilon: 1e-5,
    }
}

/// Seeded random GPT-2 on CPU, instrumentation off
pub fn tiny_model(n_layers: usize) -> HookedTransformer {
    let model = LoadedModel::random_gpt2("gpt2-tiny", tiny_config(n_layers), 0).unwrap();
    HookedTransformer::new(model, tiny_tokenizer(), &Device::Cpu).unwrap()
}

/// `[2, 6]` token ids within the tiny vocabulary
pub fn tiny_tokens() -> Tensor {
    Tensor::new(&[[2u32, 3, 4, 6, 5, 7], [2, 3, 4, 8, 5, 9]], &Device::Cpu).unwrap()
}
