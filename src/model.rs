//! Model loading: alias resolution, load profiles, weights and tokenizers.
//!
//! Model names are either canonical hub identifiers, short aliases
//! (`gptj`, `neox`, `llama`) or local directories. Every name maps to a
//! [`ModelFamily`], and the family's [`LoadProfile`] decides precision,
//! memory strategy, weight revision and tokenizer handling.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use hf_hub::{
    api::sync::{Api, ApiRepo},
    Repo, RepoType,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokenizers::{PaddingParams, Tokenizer};
use tracing::{debug, info};

use crate::forward_gpt2::{Gpt2Config, HookedGpt2};
use crate::forward_gptj::{GptJConfig, HookedGptJ};
use crate::forward_llama::{HookedLlama, LlamaConfig};
use crate::forward_neox::{HookedNeoX, NeoXConfig};
use crate::hooked::{HookConfig, Hooks};

pub const GPT_J_NAME_SHORT: &str = "gptj";
pub const GPT_J_NAME: &str = "EleutherAI/gpt-j-6B";

pub const GPT_NEO_X_NAME_SHORT: &str = "neox";
pub const GPT_NEO_X_NAME: &str = "EleutherAI/gpt-neox-20b";

pub const LLAMA_13B_NAME: &str = "llama-13b";
pub const LLAMA_30B_NAME: &str = "llama-30b";
pub const LLAMA_NAME_SHORT: &str = "llama";

/// Pad and end-of-sequence token forced onto LLaMA tokenizers.
pub const LLAMA_EOS_TOKEN: &str = "</s>";
pub const LLAMA_EOS_TOKEN_ID: u32 = 2;

/// End-of-sequence spellings probed on auto-selected tokenizers, in order.
const EOS_CANDIDATES: [&str; 4] = ["<|endoftext|>", "</s>", "<eos>", "<|end_of_text|>"];

/// Model families with their own loading behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    /// GPT-J 6B and variants saved under a `gptj*` name
    GptJ,
    /// GPT-NeoX 20B and variants saved under a `neox*` name
    NeoX,
    /// LLaMA 13B/30B and variants saved under a `llama*` name
    Llama,
    /// Everything else (GPT-2, Pythia, ...)
    Generic,
}

impl ModelFamily {
    /// Families that carry an alias, in detection order
    pub const NAMED: [ModelFamily; 3] = [ModelFamily::GptJ, ModelFamily::NeoX, ModelFamily::Llama];

    /// Short alias accepted on the command line
    pub fn short_name(self) -> Option<&'static str> {
        match self {
            ModelFamily::GptJ => Some(GPT_J_NAME_SHORT),
            ModelFamily::NeoX => Some(GPT_NEO_X_NAME_SHORT),
            ModelFamily::Llama => Some(LLAMA_NAME_SHORT),
            ModelFamily::Generic => None,
        }
    }

    /// Hub identifier the short alias expands to
    pub fn alias_target(self) -> Option<&'static str> {
        match self {
            ModelFamily::GptJ => Some(GPT_J_NAME),
            ModelFamily::NeoX => Some(GPT_NEO_X_NAME),
            ModelFamily::Llama => Some(LLAMA_13B_NAME),
            ModelFamily::Generic => None,
        }
    }

    /// Canonical identifiers belonging to the family
    pub fn canonical_names(self) -> &'static [&'static str] {
        match self {
            ModelFamily::GptJ => &[GPT_J_NAME],
            ModelFamily::NeoX => &[GPT_NEO_X_NAME],
            ModelFamily::Llama => &[LLAMA_13B_NAME, LLAMA_30B_NAME],
            ModelFamily::Generic => &[],
        }
    }

    /// Detect the family of an (already resolved) model name.
    ///
    /// A name belongs to a family when it is one of the family's canonical
    /// identifiers or contains its short alias. The second rule catches
    /// locally saved variants such as `gptj_random` or `neox_random`.
    pub fn detect(name: &str) -> Self {
        Self::NAMED
            .into_iter()
            .find(|family| {
                family.canonical_names().iter().any(|canonical| *canonical == name)
                    || family.short_name().is_some_and(|short| name.contains(short))
            })
            .unwrap_or(ModelFamily::Generic)
    }

    /// Loading behaviour for this family
    pub fn profile(self) -> LoadProfile {
        match self {
            ModelFamily::GptJ => LoadProfile {
                fp16_by_default: true,
                low_cpu_mem_usage: true,
                fp16_revision: Some("float16"),
                tokenizer: TokenizerKind::Auto,
            },
            ModelFamily::NeoX => LoadProfile {
                fp16_by_default: true,
                low_cpu_mem_usage: false,
                fp16_revision: None,
                tokenizer: TokenizerKind::Auto,
            },
            ModelFamily::Llama => LoadProfile {
                fp16_by_default: true,
                low_cpu_mem_usage: false,
                fp16_revision: None,
                tokenizer: TokenizerKind::Llama,
            },
            ModelFamily::Generic => LoadProfile {
                fp16_by_default: false,
                low_cpu_mem_usage: false,
                fp16_revision: None,
                tokenizer: TokenizerKind::Auto,
            },
        }
    }
}

/// Which tokenizer setup a family needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerKind {
    /// Whatever `tokenizer.json` describes; pad is set to its EOS token
    Auto,
    /// LLaMA tokenizer with pad = eos = `</s>` (id 2)
    Llama,
}

/// Per-family loading options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProfile {
    /// Use half precision when the caller does not choose
    pub fp16_by_default: bool,
    /// Memory-map weights instead of reading them into host memory
    pub low_cpu_mem_usage: bool,
    /// Weight revision to fetch when loading in half precision
    pub fp16_revision: Option<&'static str>,
    pub tokenizer: TokenizerKind,
}

/// Expand a short alias to its hub identifier. Other names pass through.
pub fn resolve_model_name(name: &str) -> String {
    ModelFamily::NAMED
        .into_iter()
        .find(|family| family.short_name() == Some(name))
        .and_then(ModelFamily::alias_target)
        .unwrap_or(name)
        .to_string()
}

/// Fully resolved loading options for one model name
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    pub name: String,
    pub family: ModelFamily,
    pub fp16: bool,
    pub dtype: DType,
    pub low_cpu_mem_usage: bool,
    pub revision: Option<String>,
    pub tokenizer: TokenizerKind,
}

impl LoadOptions {
    /// Resolve the alias, detect the family and apply its profile.
    ///
    /// `fp16 = None` defers to the family default (half precision for the
    /// large families, full precision otherwise).
    pub fn resolve(name: &str, fp16: Option<bool>) -> Self {
        let name = resolve_model_name(name);
        let family = ModelFamily::detect(&name);
        let profile = family.profile();
        let fp16 = fp16.unwrap_or(profile.fp16_by_default);
        let revision = if fp16 {
            profile.fp16_revision.map(str::to_string)
        } else {
            None
        };

        Self {
            name,
            family,
            fp16,
            dtype: if fp16 { DType::F16 } else { DType::F32 },
            low_cpu_mem_usage: profile.low_cpu_mem_usage,
            revision,
            tokenizer: profile.tokenizer,
        }
    }
}

/// Architecture configuration, tagged by the `model_type` of `config.json`
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "model_type")]
pub enum ArchConfig {
    #[serde(rename = "gpt2")]
    Gpt2(Gpt2Config),
    #[serde(rename = "gptj")]
    GptJ(GptJConfig),
    #[serde(rename = "gpt_neox")]
    NeoX(NeoXConfig),
    #[serde(rename = "llama")]
    Llama(LlamaConfig),
}

impl ArchConfig {
    /// Parse a hub `config.json`
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Unsupported or malformed model config")
    }

    pub fn model_type(&self) -> &'static str {
        match self {
            ArchConfig::Gpt2(_) => "gpt2",
            ArchConfig::GptJ(_) => "gptj",
            ArchConfig::NeoX(_) => "gpt_neox",
            ArchConfig::Llama(_) => "llama",
        }
    }

    pub fn n_layers(&self) -> usize {
        match self {
            ArchConfig::Gpt2(c) => c.n_layer,
            ArchConfig::GptJ(c) => c.n_layer,
            ArchConfig::NeoX(c) => c.num_hidden_layers,
            ArchConfig::Llama(c) => c.num_hidden_layers,
        }
    }

    /// Whether the architecture exposes a separate MLP-input hook.
    ///
    /// Parallel-residual blocks feed attention and MLP from the same
    /// residual read, so there is no distinct MLP input stream to hook.
    pub fn supports_hook_mlp_in(&self) -> bool {
        match self {
            ArchConfig::Gpt2(_) | ArchConfig::Llama(_) => true,
            ArchConfig::GptJ(_) => false,
            ArchConfig::NeoX(c) => !c.use_parallel_residual,
        }
    }
}

/// Where a model's weights live
#[derive(Debug, Clone)]
pub enum WeightSource {
    /// Safetensors files, memory-mapped on every build
    Mmaped(Vec<PathBuf>),
    /// Tensors already resident in host memory
    Tensors(HashMap<String, Tensor>),
}

/// Unified backend trait for all hooked architectures.
///
/// A backend runs one forward pass from token ids to logits, routing every
/// intermediate activation through [`Hooks`].
pub trait HookedBackend {
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn n_heads(&self) -> usize;
    fn vocab_size(&self) -> usize;

    /// Logits `[batch, pos, vocab]` for `input_ids` `[batch, pos]`
    fn forward(&self, input_ids: &Tensor, config: &HookConfig, hooks: &mut Hooks) -> Result<Tensor>;
}

/// A pretrained (or randomly initialised) causal LM, ready to be placed on
/// a device.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    name: String,
    family: ModelFamily,
    config: ArchConfig,
    weights: WeightSource,
    dtype: DType,
    n_params: usize,
}

impl LoadedModel {
    /// Assemble a model from weights already in memory
    pub fn from_tensors(
        name: &str,
        config: ArchConfig,
        weights: HashMap<String, Tensor>,
        dtype: DType,
    ) -> Self {
        let n_params = weights.values().map(Tensor::elem_count).sum();
        Self {
            name: name.to_string(),
            family: ModelFamily::detect(name),
            config,
            weights: WeightSource::Tensors(weights),
            dtype,
            n_params,
        }
    }

    /// Seeded randomly initialised GPT-2 in full precision
    pub fn random_gpt2(name: &str, config: Gpt2Config, seed: u64) -> Result<Self> {
        let weights = config.random_weights(seed)?;
        Ok(Self::from_tensors(name, ArchConfig::Gpt2(config), weights, DType::F32))
    }

    /// Instantiate the architecture on `device`
    pub fn build_backend(&self, device: &Device) -> Result<Box<dyn HookedBackend>> {
        let vb = match &self.weights {
            WeightSource::Mmaped(paths) => unsafe {
                VarBuilder::from_mmaped_safetensors(paths, self.dtype, device)?
            },
            WeightSource::Tensors(tensors) => {
                VarBuilder::from_tensors(tensors.clone(), self.dtype, device)
            }
        };

        let backend: Box<dyn HookedBackend> = match &self.config {
            ArchConfig::Gpt2(c) => Box::new(HookedGpt2::load(c, vb)?),
            ArchConfig::GptJ(c) => Box::new(HookedGptJ::load(c, vb)?),
            ArchConfig::NeoX(c) => Box::new(HookedNeoX::load(c, vb)?),
            ArchConfig::Llama(c) => Box::new(HookedLlama::load(c, vb)?),
        };
        Ok(backend)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn config(&self) -> &ArchConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Total number of weight elements
    pub fn n_params(&self) -> usize {
        self.n_params
    }

    /// Bytes the weights occupy once cast to the model dtype
    pub fn memory_footprint(&self) -> usize {
        self.n_params * self.dtype.size_in_bytes()
    }

}

/// Tokenizer with explicit pad / end-of-sequence tokens
#[derive(Debug, Clone)]
pub struct KnowledgeTokenizer {
    inner: Tokenizer,
    eos_token: String,
    eos_token_id: u32,
    pad_token: String,
    pad_token_id: u32,
}

impl KnowledgeTokenizer {
    /// Wrap a tokenizer, setting pad = eos according to `kind`
    pub fn new(mut inner: Tokenizer, kind: TokenizerKind) -> Result<Self> {
        let (eos_token, eos_token_id) = match kind {
            TokenizerKind::Llama => (LLAMA_EOS_TOKEN.to_string(), LLAMA_EOS_TOKEN_ID),
            TokenizerKind::Auto => {
                let vocab = inner.get_vocab(true);
                EOS_CANDIDATES
                    .iter()
                    .find_map(|tok| vocab.get(*tok).map(|&id| ((*tok).to_string(), id)))
                    .ok_or_else(|| anyhow::anyhow!("Tokenizer has no end-of-sequence token"))?
            }
        };

        inner.with_padding(Some(PaddingParams {
            pad_id: eos_token_id,
            pad_token: eos_token.clone(),
            ..Default::default()
        }));

        Ok(Self {
            inner,
            pad_token: eos_token.clone(),
            pad_token_id: eos_token_id,
            eos_token,
            eos_token_id,
        })
    }

    /// Load `tokenizer.json` from disk
    pub fn from_file(path: &Path, kind: TokenizerKind) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        Self::new(inner, kind)
    }

    /// Token ids for `text`, no special tokens added
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode a batch, right-padded to the longest entry with the pad id
    pub fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<u32>>> {
        let encodings = self
            .inner
            .encode_batch(texts.to_vec(), false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encodings.iter().map(|e| e.get_ids().to_vec()).collect())
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
    }

    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    pub fn pad_token(&self) -> &str {
        &self.pad_token
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    pub fn inner(&self) -> &Tokenizer {
        &self.inner
    }
}

/// Files come from a local directory or a hub repository
enum ModelFiles {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl ModelFiles {
    fn open(options: &LoadOptions) -> Result<Self> {
        let path = Path::new(&options.name);
        if path.is_dir() {
            debug!("Loading {} from local directory", options.name);
            return Ok(ModelFiles::Local(path.to_path_buf()));
        }

        let api = Api::new()?;
        let repo = match &options.revision {
            Some(revision) => {
                Repo::with_revision(options.name.clone(), RepoType::Model, revision.clone())
            }
            None => Repo::new(options.name.clone(), RepoType::Model),
        };
        Ok(ModelFiles::Hub(api.repo(repo)))
    }

    fn get(&self, filename: &str) -> Result<PathBuf> {
        match self {
            ModelFiles::Local(dir) => {
                let path = dir.join(filename);
                anyhow::ensure!(path.exists(), "{} not found", path.display());
                Ok(path)
            }
            ModelFiles::Hub(repo) => repo
                .get(filename)
                .with_context(|| format!("Failed to download {filename}")),
        }
    }
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

fn weight_paths(files: &ModelFiles) -> Result<Vec<PathBuf>> {
    if let Ok(index_path) = files.get("model.safetensors.index.json") {
        info!("Model is sharded, loading index...");
        let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

        let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
        shard_names.sort();
        shard_names.dedup();

        info!("Fetching {} shard files...", shard_names.len());
        shard_names.iter().map(|shard| files.get(shard)).collect()
    } else {
        Ok(vec![files.get("model.safetensors")?])
    }
}

/// Load a pretrained causal LM and its tokenizer.
///
/// `name` may be an alias, a hub identifier or a local directory holding
/// `config.json`, `tokenizer.json` and safetensors weights. Hub and file
/// errors propagate unchanged.
pub fn load_model(name: &str, fp16: Option<bool>) -> Result<(LoadedModel, KnowledgeTokenizer)> {
    let options = LoadOptions::resolve(name, fp16);
    info!("loading {} (fp16={})", options.name, options.fp16);

    let files = ModelFiles::open(&options)?;

    let config_path = files.get("config.json")?;
    let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
    let config = ArchConfig::from_json(&config_str)
        .with_context(|| format!("Cannot load {}", options.name))?;
    info!(
        "Model config: {} ({} layers)",
        config.model_type(),
        config.n_layers()
    );

    let paths = weight_paths(&files)?;
    let n_files = paths.len();
    let (weights, n_params) = if options.low_cpu_mem_usage {
        let st = unsafe { candle_core::safetensors::MmapedSafetensors::multi(&paths)? };
        let n_params = st
            .tensors()
            .iter()
            .map(|(_, view)| view.shape().iter().product::<usize>())
            .sum();
        (WeightSource::Mmaped(paths), n_params)
    } else {
        let mut tensors = HashMap::new();
        for path in &paths {
            tensors.extend(candle_core::safetensors::load(path, &Device::Cpu)?);
        }
        let n_params = tensors.values().map(Tensor::elem_count).sum();
        (WeightSource::Tensors(tensors), n_params)
    };
    info!("Weights: {} file(s), {} parameters", n_files, n_params);

    let tokenizer_path = files.get("tokenizer.json")?;
    let tokenizer = KnowledgeTokenizer::from_file(&tokenizer_path, options.tokenizer)?;

    let model = LoadedModel {
        name: options.name,
        family: options.family,
        config,
        weights,
        dtype: options.dtype,
        n_params,
    };

    Ok((model, tokenizer))
}

/// Parse a device string (`cpu`, `cuda`, `cuda:N`, `metal`)
pub fn device_from_str(device: &str) -> Result<Device> {
    match device {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(0)?),
        "metal" => Ok(Device::new_metal(0)?),
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => {
                let ordinal: usize = ordinal
                    .parse()
                    .with_context(|| format!("Invalid CUDA ordinal in '{other}'"))?;
                Ok(Device::new_cuda(ordinal)?)
            }
            None => anyhow::bail!("Unknown device '{other}'"),
        },
    }
}
