// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // MetricKind in metrics.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! knowledge-circuits: data and metric plumbing for circuit discovery
//!
//! Loads pretrained causal LMs into an instrumented (hooked) form, builds
//! knowledge-prompt datasets and assembles the metrics a circuit-discovery
//! algorithm optimises and reports.
//!
//! ## Architecture
//!
//! - `model`: model families, load profiles, weight and tokenizer loading
//! - `hooked`: HookedTransformer, hook points and activation patching
//! - `forward_gpt2`: GPT-2 forward pass with hook points
//! - `forward_gptj`: GPT-J forward pass with hook points
//! - `forward_neox`: GPT-NeoX forward pass with hook points
//! - `forward_llama`: LLaMA forward pass with hook points
//! - `attention`: Shared attention, rotary embeddings and per-head results
//! - `cache`: ActivationCache for recorded hook activations
//! - `masks`: Cached causal attention masks
//! - `data`: Validation tokens and repeat-candidate masks from disk or hub
//! - `dataset`: Knowledge prompt datasets
//! - `metrics`: KL divergence, NLL and matched-NLL metrics
//! - `experiment`: Experiment assembly (splits, baselines, metric binding)
//! - `batch`: One-row-per-target batch expansion

pub mod attention;
pub mod batch;
pub mod cache;
pub mod data;
pub mod dataset;
pub mod experiment;
pub mod forward_gpt2;
pub mod forward_gptj;
pub mod forward_llama;
pub mod forward_neox;
pub mod hooked;
pub mod masks;
pub mod metrics;
pub mod model;

#[cfg(test)]
mod test_support;

pub use batch::{one_item_per_batch, ExpandedBatch};
pub use cache::ActivationCache;
pub use data::{get_data, get_mask_repeat_candidates, DataConfig, DataSource};
pub use dataset::{KnowledgeDataset, KnowledgeDatasetConfig, KnowledgeType};
pub use experiment::{
    assemble_data_things, get_all_knowledge_things, AllDataThings, ExperimentConfig, MaskSource,
};
pub use forward_gpt2::{Gpt2Config, HookedGpt2};
pub use forward_gptj::{GptJConfig, HookedGptJ};
pub use forward_llama::{HookedLlama, LlamaConfig};
pub use forward_neox::{HookedNeoX, NeoXConfig};
pub use hooked::{configure_for_discovery, get_model, HookConfig, HookPoint, HookedTransformer, Hooks};
pub use masks::{clear_mask_caches, create_causal_mask};
pub use metrics::{
    KlDivergence, MatchNllMetric, Metric, MetricInputs, MetricKind, NegativeLogProbs,
};
pub use model::{
    device_from_str, load_model, resolve_model_name, ArchConfig, HookedBackend,
    KnowledgeTokenizer, LoadOptions, LoadProfile, LoadedModel, ModelFamily, TokenizerKind,
};
