//! GPT-NeoX forward pass with hook points
//!
//! Fused `query_key_value` projection laid out per head as `[q | k | v]`,
//! rotary embeddings over `rotary_pct` of each head (rotate-half layout)
//! and exact GELU. Blocks are parallel unless `use_parallel_residual` is
//! off, in which case they run sequentially and expose `hook_resid_mid`
//! and `hook_mlp_in`.

use anyhow::Result;
use candle_core::{Module, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, linear_no_bias, Embedding, LayerNorm, Linear, VarBuilder};
use tracing::info;

use crate::attention::{attention_output, causal_attention, RotaryEmbedding};
use crate::hooked::{HookConfig, HookPoint, Hooks};
use crate::model::HookedBackend;

/// Model configuration (matches HuggingFace config.json for GPT-NeoX)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NeoXConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rotary_pct")]
    pub rotary_pct: f64,
    #[serde(default = "default_rotary_emb_base")]
    pub rotary_emb_base: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_use_parallel_residual")]
    pub use_parallel_residual: bool,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
}

fn default_rotary_pct() -> f64 {
    0.25
}

fn default_rotary_emb_base() -> f64 {
    10_000.0
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_use_parallel_residual() -> bool {
    true
}

fn default_max_position_embeddings() -> usize {
    2048
}

impl NeoXConfig {
    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    fn rotary_ndims(&self) -> usize {
        (self.head_dim() as f64 * self.rotary_pct) as usize
    }
}

struct Attention {
    query_key_value: Linear,
    dense: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &NeoXConfig) -> Result<Self> {
        let h = config.hidden_size;
        Ok(Self {
            query_key_value: linear(h, 3 * h, vb.pp("query_key_value"))?,
            dense: linear(h, h, vb.pp("dense"))?,
            n_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        layer: usize,
        config: &HookConfig,
        hooks: &mut Hooks,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;
        let hd = self.head_dim;

        // [b, s, heads, 3 * head_dim], split per head
        let qkv = self
            .query_key_value
            .forward(x)?
            .reshape((b, seq_len, self.n_heads, 3 * hd))?;
        let q = qkv.narrow(D::Minus1, 0, hd)?.transpose(1, 2)?;
        let k = qkv.narrow(D::Minus1, hd, hd)?.transpose(1, 2)?;
        let v = qkv.narrow(D::Minus1, 2 * hd, hd)?.transpose(1, 2)?;

        let q = rotary.apply(&q)?;
        let k = rotary.apply(&k)?;

        let z = causal_attention(&q, &k, &v, layer, hooks)?;
        attention_output(&z, &self.dense, layer, config, hooks)
    }
}

struct Mlp {
    dense_h_to_4h: Linear,
    dense_4h_to_h: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &NeoXConfig) -> Result<Self> {
        let (h, i) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            dense_h_to_4h: linear(h, i, vb.pp("dense_h_to_4h"))?,
            dense_4h_to_h: linear(i, h, vb.pp("dense_4h_to_h"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.dense_h_to_4h.forward(x)?.gelu_erf()?;
        Ok(self.dense_4h_to_h.forward(&hidden)?)
    }
}

struct Layer {
    input_layernorm: LayerNorm,
    post_attention_layernorm: LayerNorm,
    attention: Attention,
    mlp: Mlp,
    use_parallel_residual: bool,
}

impl Layer {
    fn load(vb: VarBuilder, config: &NeoXConfig) -> Result<Self> {
        let (h, eps) = (config.hidden_size, config.layer_norm_eps);
        Ok(Self {
            input_layernorm: layer_norm(h, eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: layer_norm(h, eps, vb.pp("post_attention_layernorm"))?,
            attention: Attention::load(vb.pp("attention"), config)?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
            use_parallel_residual: config.use_parallel_residual,
        })
    }

    fn forward(
        &self,
        x: Tensor,
        rotary: &RotaryEmbedding,
        layer: usize,
        config: &HookConfig,
        hooks: &mut Hooks,
    ) -> Result<Tensor> {
        let resid_pre = hooks.apply(HookPoint::ResidPre(layer), x)?;

        let attn_in = self.input_layernorm.forward(&resid_pre)?;
        let attn_out = self.attention.forward(&attn_in, rotary, layer, config, hooks)?;
        let attn_out = hooks.apply(HookPoint::AttnOut(layer), attn_out)?;

        if self.use_parallel_residual {
            let mlp_in = self.post_attention_layernorm.forward(&resid_pre)?;
            let mlp_out = hooks.apply(HookPoint::MlpOut(layer), self.mlp.forward(&mlp_in)?)?;
            let resid_post = ((&resid_pre + &attn_out)? + &mlp_out)?;
            return hooks.apply(HookPoint::ResidPost(layer), resid_post);
        }

        let resid_mid = hooks.apply(HookPoint::ResidMid(layer), (&resid_pre + &attn_out)?)?;
        let mlp_in = if config.hook_mlp_in_enabled() {
            hooks.apply(HookPoint::MlpIn(layer), resid_mid.clone())?
        } else {
            resid_mid.clone()
        };
        let mlp_out = self
            .mlp
            .forward(&self.post_attention_layernorm.forward(&mlp_in)?)?;
        let mlp_out = hooks.apply(HookPoint::MlpOut(layer), mlp_out)?;
        hooks.apply(HookPoint::ResidPost(layer), (&resid_mid + &mlp_out)?)
    }
}

/// GPT-NeoX with hook points
pub struct HookedNeoX {
    embed_in: Embedding,
    layers: Vec<Layer>,
    final_layer_norm: LayerNorm,
    embed_out: Linear,
    rotary: RotaryEmbedding,
    n_heads: usize,
    hidden_size: usize,
    vocab_size: usize,
}

impl HookedNeoX {
    pub fn load(config: &NeoXConfig, vb: VarBuilder) -> Result<Self> {
        let vb_m = vb.pp("gpt_neox");
        let embed_in = embedding(config.vocab_size, config.hidden_size, vb_m.pp("embed_in"))?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(Layer::load(vb_m.pp(format!("layers.{i}")), config)?);
        }
        let final_layer_norm = layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb_m.pp("final_layer_norm"),
        )?;
        let embed_out = linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("embed_out"))?;

        let rotary = RotaryEmbedding::new(
            config.rotary_ndims(),
            config.max_position_embeddings,
            config.rotary_emb_base,
            false,
            vb.device(),
            vb.dtype(),
        )?;

        info!(
            "GPT-NeoX loaded: {} layers, {} hidden, parallel residual: {}",
            config.num_hidden_layers, config.hidden_size, config.use_parallel_residual
        );

        Ok(Self {
            embed_in,
            layers,
            final_layer_norm,
            embed_out,
            rotary,
            n_heads: config.num_attention_heads,
            hidden_size: config.hidden_size,
            vocab_size: config.vocab_size,
        })
    }
}

impl HookedBackend for HookedNeoX {
    fn n_layers(&self) -> usize {
        self.layers.len()
    }

    fn d_model(&self) -> usize {
        self.hidden_size
    }

    fn n_heads(&self) -> usize {
        self.n_heads
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn forward(&self, input_ids: &Tensor, config: &HookConfig, hooks: &mut Hooks) -> Result<Tensor> {
        let embed = self.embed_in.forward(input_ids)?;
        let mut hidden = hooks.apply(HookPoint::Embed, embed)?;

        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(hidden, &self.rotary, i, config, hooks)?;
        }

        let normalized = hooks.apply(
            HookPoint::FinalNormalized,
            self.final_layer_norm.forward(&hidden)?,
        )?;
        Ok(self.embed_out.forward(&normalized)?)
    }
}
