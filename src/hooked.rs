//! Instrumented transformer for activation-patching experiments.
//!
//! [`HookedTransformer`] wraps a [`LoadedModel`] placed on a device. Every
//! backend routes its intermediate activations through named [`HookPoint`]s;
//! a [`Hooks`] value decides, per forward pass, which activations are
//! recorded into an [`ActivationCache`] and which are replaced by patches.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::cache::ActivationCache;
use crate::model::{
    load_model, resolve_model_name, HookedBackend, KnowledgeTokenizer, LoadedModel,
};

/// Named intervention point inside the forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Token (+ learned position) embedding, `hook_embed`
    Embed,
    /// Residual stream entering block `l`
    ResidPre(usize),
    /// Post-softmax attention pattern `[batch, head, query, key]`
    Pattern(usize),
    /// Per-head attention output `[batch, pos, head, d_model]`
    AttnResult(usize),
    /// Summed attention output of block `l`
    AttnOut(usize),
    /// Residual stream between attention and MLP (sequential blocks only)
    ResidMid(usize),
    /// Input to the MLP of block `l`
    MlpIn(usize),
    MlpOut(usize),
    /// Residual stream leaving block `l`
    ResidPost(usize),
    /// Output of the final normalization
    FinalNormalized,
}

impl HookPoint {
    /// `(block, stage)` so that ordering follows the forward pass
    fn forward_order(&self) -> (usize, usize) {
        match *self {
            HookPoint::Embed => (0, 0),
            HookPoint::ResidPre(l) => (l + 1, 0),
            HookPoint::Pattern(l) => (l + 1, 1),
            HookPoint::AttnResult(l) => (l + 1, 2),
            HookPoint::AttnOut(l) => (l + 1, 3),
            HookPoint::ResidMid(l) => (l + 1, 4),
            HookPoint::MlpIn(l) => (l + 1, 5),
            HookPoint::MlpOut(l) => (l + 1, 6),
            HookPoint::ResidPost(l) => (l + 1, 7),
            HookPoint::FinalNormalized => (usize::MAX, 0),
        }
    }

    /// Axis holding attention heads, for points that have one
    pub fn head_axis(&self) -> Option<usize> {
        match self {
            HookPoint::Pattern(_) => Some(1),
            HookPoint::AttnResult(_) => Some(2),
            _ => None,
        }
    }
}

impl PartialOrd for HookPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HookPoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.forward_order().cmp(&other.forward_order())
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPoint::Embed => write!(f, "hook_embed"),
            HookPoint::ResidPre(l) => write!(f, "blocks.{l}.hook_resid_pre"),
            HookPoint::Pattern(l) => write!(f, "blocks.{l}.attn.hook_pattern"),
            HookPoint::AttnResult(l) => write!(f, "blocks.{l}.attn.hook_result"),
            HookPoint::AttnOut(l) => write!(f, "blocks.{l}.hook_attn_out"),
            HookPoint::ResidMid(l) => write!(f, "blocks.{l}.hook_resid_mid"),
            HookPoint::MlpIn(l) => write!(f, "blocks.{l}.hook_mlp_in"),
            HookPoint::MlpOut(l) => write!(f, "blocks.{l}.hook_mlp_out"),
            HookPoint::ResidPost(l) => write!(f, "blocks.{l}.hook_resid_post"),
            HookPoint::FinalNormalized => write!(f, "ln_final.hook_normalized"),
        }
    }
}

impl FromStr for HookPoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hook_embed" => return Ok(HookPoint::Embed),
            "ln_final.hook_normalized" => return Ok(HookPoint::FinalNormalized),
            _ => {}
        }

        let rest = s
            .strip_prefix("blocks.")
            .ok_or_else(|| anyhow::anyhow!("Unknown hook point '{s}'"))?;
        let (layer, suffix) = rest
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("Unknown hook point '{s}'"))?;
        let layer: usize = layer
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid layer in hook point '{s}'"))?;

        match suffix {
            "hook_resid_pre" => Ok(HookPoint::ResidPre(layer)),
            "attn.hook_pattern" => Ok(HookPoint::Pattern(layer)),
            "attn.hook_result" => Ok(HookPoint::AttnResult(layer)),
            "hook_attn_out" => Ok(HookPoint::AttnOut(layer)),
            "hook_resid_mid" => Ok(HookPoint::ResidMid(layer)),
            "hook_mlp_in" => Ok(HookPoint::MlpIn(layer)),
            "hook_mlp_out" => Ok(HookPoint::MlpOut(layer)),
            "hook_resid_post" => Ok(HookPoint::ResidPost(layer)),
            _ => anyhow::bail!("Unknown hook point '{s}'"),
        }
    }
}

/// Instrumentation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookConfig {
    /// Compute per-head attention outputs (`hook_result`)
    pub use_attn_result: bool,
    /// Give every head its own copy of the q/k/v input
    pub use_split_qkv_input: bool,
    /// Expose `hook_mlp_in`; `None` when the architecture has no such option
    pub use_hook_mlp_in: Option<bool>,
}

impl HookConfig {
    /// Defaults for an architecture, all instrumentation off
    pub fn for_architecture(supports_hook_mlp_in: bool) -> Self {
        Self {
            use_attn_result: false,
            use_split_qkv_input: false,
            use_hook_mlp_in: supports_hook_mlp_in.then_some(false),
        }
    }

    pub fn hook_mlp_in_enabled(&self) -> bool {
        self.use_hook_mlp_in == Some(true)
    }
}

/// Replacement for one hook point
#[derive(Debug, Clone)]
struct Patch {
    value: Tensor,
    /// Only these heads are replaced; `None` replaces the whole activation
    heads: Option<Vec<usize>>,
}

impl Patch {
    fn apply(&self, point: HookPoint, x: &Tensor) -> Result<Tensor> {
        anyhow::ensure!(
            self.value.dims() == x.dims(),
            "Patch for {point} has shape {:?}, activation has {:?}",
            self.value.dims(),
            x.dims()
        );
        let value = self.value.to_device(x.device())?.to_dtype(x.dtype())?;

        let Some(heads) = &self.heads else {
            return Ok(value);
        };
        let axis = point
            .head_axis()
            .ok_or_else(|| anyhow::anyhow!("{point} has no head axis"))?;
        let n_heads = x.dim(axis)?;
        if let Some(&bad) = heads.iter().find(|&&h| h >= n_heads) {
            anyhow::bail!("Head {bad} out of range for {point} ({n_heads} heads)");
        }

        let selected: Vec<u8> = (0..n_heads).map(|h| u8::from(heads.contains(&h))).collect();
        let mut shape = vec![1; x.rank()];
        shape[axis] = n_heads;
        let selected = Tensor::from_vec(selected, shape, x.device())?
            .broadcast_as(x.shape())?
            .contiguous()?;
        Ok(selected.where_cond(&value, x)?)
    }
}

/// Per-forward-pass hook state: patches to apply and activations to record
#[derive(Debug, Default)]
pub struct Hooks {
    patches: HashMap<HookPoint, Patch>,
    cache: Option<ActivationCache>,
    cache_filter: Option<HashSet<HookPoint>>,
}

impl Hooks {
    /// No patches, no caching
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every activation
    pub fn with_cache(mut self) -> Self {
        self.cache = Some(ActivationCache::new());
        self.cache_filter = None;
        self
    }

    /// Record only the listed activations
    pub fn cache_only(mut self, points: impl IntoIterator<Item = HookPoint>) -> Self {
        self.cache = Some(ActivationCache::new());
        self.cache_filter = Some(points.into_iter().collect());
        self
    }

    /// Replace the activation at `point` with `value`
    pub fn patch(mut self, point: HookPoint, value: Tensor) -> Self {
        self.patches.insert(point, Patch { value, heads: None });
        self
    }

    /// Replace only the given heads of the activation at `point`
    pub fn patch_heads(mut self, point: HookPoint, value: Tensor, heads: &[usize]) -> Self {
        self.patches.insert(
            point,
            Patch {
                value,
                heads: Some(heads.to_vec()),
            },
        );
        self
    }

    /// Take the recorded activations, leaving caching disabled
    pub fn take_cache(&mut self) -> Option<ActivationCache> {
        self.cache_filter = None;
        self.cache.take()
    }

    /// Route one activation through its hook point.
    ///
    /// A registered patch replaces the activation first; the (possibly
    /// patched) value is then recorded when caching is on.
    pub fn apply(&mut self, point: HookPoint, x: Tensor) -> Result<Tensor> {
        let x = match self.patches.get(&point) {
            Some(patch) => patch.apply(point, &x)?,
            None => x,
        };

        if let Some(cache) = self.cache.as_mut() {
            let wanted = self
                .cache_filter
                .as_ref()
                .map_or(true, |filter| filter.contains(&point));
            if wanted {
                cache.insert(point, x.clone());
            }
        }
        Ok(x)
    }
}

/// A hooked causal LM placed on a device
pub struct HookedTransformer {
    backend: Box<dyn HookedBackend>,
    model: LoadedModel,
    tokenizer: KnowledgeTokenizer,
    device: Device,
    config: HookConfig,
}

impl HookedTransformer {
    /// Instantiate `model` on `device` with all instrumentation off
    pub fn new(model: LoadedModel, tokenizer: KnowledgeTokenizer, device: &Device) -> Result<Self> {
        let backend = model.build_backend(device)?;
        let config = HookConfig::for_architecture(model.config().supports_hook_mlp_in());
        Ok(Self {
            backend,
            model,
            tokenizer,
            device: device.clone(),
            config,
        })
    }

    /// Wrap an already-loaded pretrained model.
    ///
    /// The architecture config comes from the weights that were loaded for
    /// `name`; a mismatch between the two is an error.
    pub fn from_pretrained(
        name: &str,
        model: LoadedModel,
        tokenizer: KnowledgeTokenizer,
        device: &Device,
    ) -> Result<Self> {
        anyhow::ensure!(
            model.name() == resolve_model_name(name),
            "Model '{}' was loaded for a different name than '{name}'",
            model.name()
        );
        Self::new(model, tokenizer, device)
    }

    /// Move the model to `device`, rebuilding its weights there
    pub fn to_device(self, device: &Device) -> Result<Self> {
        if self.device.same_device(device) {
            return Ok(self);
        }
        let backend = self.model.build_backend(device)?;
        Ok(Self {
            backend,
            device: device.clone(),
            ..self
        })
    }

    pub fn set_use_attn_result(&mut self, enabled: bool) {
        self.config.use_attn_result = enabled;
    }

    pub fn set_use_split_qkv_input(&mut self, enabled: bool) {
        self.config.use_split_qkv_input = enabled;
    }

    /// Errors when the architecture has no MLP-input hook option
    pub fn set_use_hook_mlp_in(&mut self, enabled: bool) -> Result<()> {
        anyhow::ensure!(
            self.config.use_hook_mlp_in.is_some(),
            "{} does not expose hook_mlp_in",
            self.model.config().model_type()
        );
        self.config.use_hook_mlp_in = Some(enabled);
        Ok(())
    }

    /// Logits `[batch, pos, vocab]`
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.run_with_hooks(input_ids, &mut Hooks::new())
    }

    /// Logits plus every recorded activation
    pub fn run_with_cache(&self, input_ids: &Tensor) -> Result<(Tensor, ActivationCache)> {
        let mut hooks = Hooks::new().with_cache();
        let logits = self.run_with_hooks(input_ids, &mut hooks)?;
        let cache = hooks.take_cache().unwrap_or_default();
        Ok((logits, cache))
    }

    /// Forward pass with caller-supplied hooks
    pub fn run_with_hooks(&self, input_ids: &Tensor, hooks: &mut Hooks) -> Result<Tensor> {
        anyhow::ensure!(
            !self.config.use_split_qkv_input,
            "Split q/k/v input hooks are not supported by the {} backend",
            self.model.config().model_type()
        );
        anyhow::ensure!(
            input_ids.rank() == 2,
            "Expected [batch, pos] token ids, got shape {:?}",
            input_ids.dims()
        );
        let input_ids = input_ids.to_device(&self.device)?;
        self.backend.forward(&input_ids, &self.config, hooks)
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    pub fn model(&self) -> &LoadedModel {
        &self.model
    }

    pub fn tokenizer(&self) -> &KnowledgeTokenizer {
        &self.tokenizer
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.model.dtype()
    }

    /// Bytes held by the weights
    pub fn memory_footprint(&self) -> usize {
        self.model.memory_footprint()
    }

    pub fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    pub fn n_heads(&self) -> usize {
        self.backend.n_heads()
    }

    pub fn d_model(&self) -> usize {
        self.backend.d_model()
    }

    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }
}

/// Apply the instrumentation used by circuit discovery: per-head results
/// on, split q/k/v inputs off, MLP-input hooks on where available.
pub fn configure_for_discovery(model: &mut HookedTransformer) -> Result<()> {
    model.set_use_attn_result(true);
    model.set_use_split_qkv_input(false);
    if model.config().use_hook_mlp_in.is_some() {
        model.set_use_hook_mlp_in(true)?;
    }
    info!(
        "{:?} model, dtype: {:?}, device: {:?}, memory: {}",
        model.model().family(),
        model.dtype(),
        model.device(),
        model.memory_footprint()
    );
    Ok(())
}

/// Load `name` in full precision and return it instrumented on `device`
pub fn get_model(name: &str, device: &Device) -> Result<HookedTransformer> {
    let (model, tokenizer) = load_model(name, Some(false))?;
    let mut model = HookedTransformer::from_pretrained(name, model, tokenizer, device)?;
    configure_for_discovery(&mut model)?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{tiny_model, tiny_tokens};

    #[test]
    fn test_hook_point_names_roundtrip() {
        let points = [
            HookPoint::Embed,
            HookPoint::ResidPre(3),
            HookPoint::Pattern(0),
            HookPoint::AttnResult(11),
            HookPoint::AttnOut(2),
            HookPoint::ResidMid(2),
            HookPoint::MlpIn(5),
            HookPoint::MlpOut(5),
            HookPoint::ResidPost(7),
            HookPoint::FinalNormalized,
        ];
        for point in points {
            assert_eq!(point.to_string().parse::<HookPoint>().unwrap(), point);
        }
        assert_eq!(HookPoint::AttnResult(4).to_string(), "blocks.4.attn.hook_result");
        assert!("blocks.x.hook_resid_pre".parse::<HookPoint>().is_err());
        assert!("blocks.1.hook_nothing".parse::<HookPoint>().is_err());
    }

    #[test]
    fn test_hook_point_forward_order() {
        assert!(HookPoint::Embed < HookPoint::ResidPre(0));
        assert!(HookPoint::ResidPost(0) < HookPoint::ResidPre(1));
        assert!(HookPoint::MlpIn(3) < HookPoint::MlpOut(3));
        assert!(HookPoint::ResidPost(40) < HookPoint::FinalNormalized);
    }

    #[test]
    fn test_discovery_configuration() {
        let mut model = tiny_model(2);
        assert!(!model.config().use_attn_result);
        assert_eq!(model.config().use_hook_mlp_in, Some(false));

        configure_for_discovery(&mut model).unwrap();
        assert!(model.config().use_attn_result);
        assert!(!model.config().use_split_qkv_input);
        assert_eq!(model.config().use_hook_mlp_in, Some(true));
    }

    #[test]
    fn test_to_device_same_device_is_noop() {
        let model = tiny_model(1);
        let tokens = tiny_tokens();
        let before = model.forward(&tokens).unwrap();
        let model = model.to_device(&Device::Cpu).unwrap();
        let after = model.forward(&tokens).unwrap();
        assert_eq!(
            before.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            after.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_split_qkv_input_rejected() {
        let mut model = tiny_model(2);
        model.set_use_split_qkv_input(true);
        let err = model.forward(&tiny_tokens()).unwrap_err();
        assert!(err.to_string().contains("Split q/k/v"));
    }

    #[test]
    fn test_run_with_cache_records_hooks() {
        let mut model = tiny_model(2);
        configure_for_discovery(&mut model).unwrap();
        let tokens = tiny_tokens();
        let (b, s) = tokens.dims2().unwrap();

        let (logits, cache) = model.run_with_cache(&tokens).unwrap();
        assert_eq!(logits.dims(), &[b, s, model.vocab_size()]);

        let result = cache.require(HookPoint::AttnResult(1)).unwrap();
        assert_eq!(result.dims(), &[b, s, model.n_heads(), model.d_model()]);
        let pattern = cache.require(HookPoint::Pattern(0)).unwrap();
        assert_eq!(pattern.dims(), &[b, model.n_heads(), s, s]);
        assert!(cache.get(HookPoint::MlpIn(0)).is_some());
        assert!(cache.get(HookPoint::FinalNormalized).is_some());
    }

    #[test]
    fn test_attn_result_matches_plain_attention() {
        let mut model = tiny_model(2);
        let tokens = tiny_tokens();
        let plain = model.forward(&tokens).unwrap();

        model.set_use_attn_result(true);
        let per_head = model.forward(&tokens).unwrap();

        let diff: f32 = (plain - per_head)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "per-head path diverged by {diff}");
    }

    #[test]
    fn test_patching_with_own_activation_is_identity() {
        let mut model = tiny_model(2);
        configure_for_discovery(&mut model).unwrap();
        let tokens = tiny_tokens();
        let (clean, cache) = model.run_with_cache(&tokens).unwrap();

        let resid = cache.require(HookPoint::ResidPre(1)).unwrap().clone();
        let mut hooks = Hooks::new().patch(HookPoint::ResidPre(1), resid);
        let patched = model.run_with_hooks(&tokens, &mut hooks).unwrap();

        let diff: f32 = (clean - patched)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_patch_heads_only_touches_selected_heads() {
        let device = Device::Cpu;
        let x = Tensor::zeros((1, 2, 3, 4), DType::F32, &device).unwrap();
        let value = Tensor::ones((1, 2, 3, 4), DType::F32, &device).unwrap();
        let mut hooks = Hooks::new().patch_heads(HookPoint::AttnResult(0), value, &[1]);

        let out = hooks.apply(HookPoint::AttnResult(0), x).unwrap();
        let out: Vec<Vec<Vec<f32>>> = out.squeeze(0).unwrap().to_vec3().unwrap();
        for pos in &out {
            assert_eq!(pos[0], vec![0.0; 4]);
            assert_eq!(pos[1], vec![1.0; 4]);
            assert_eq!(pos[2], vec![0.0; 4]);
        }
    }

    #[test]
    fn test_patch_shape_mismatch_is_error() {
        let device = Device::Cpu;
        let x = Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap();
        let value = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let mut hooks = Hooks::new().patch(HookPoint::ResidPre(0), value);
        assert!(hooks.apply(HookPoint::ResidPre(0), x).is_err());
    }

    #[test]
    fn test_cache_only_filter() {
        let device = Device::Cpu;
        let mut hooks = Hooks::new().cache_only([HookPoint::MlpOut(0)]);
        let x = Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap();
        hooks.apply(HookPoint::ResidPre(0), x.clone()).unwrap();
        hooks.apply(HookPoint::MlpOut(0), x).unwrap();

        let cache = hooks.take_cache().unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(HookPoint::MlpOut(0)).is_some());
    }
}
