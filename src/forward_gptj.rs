//! GPT-J forward pass with hook points
//!
//! Parallel blocks: attention and MLP both read the output of a single
//! `ln_1`, and their outputs are added to the residual stream together.
//! Rotary embeddings cover the first `rotary_dim` channels of each head in
//! the interleaved (adjacent pair) layout. Attention projections carry no
//! bias; the unembedding does.

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{embedding, layer_norm, linear, linear_no_bias, Embedding, LayerNorm, Linear, VarBuilder};
use tracing::info;

use crate::attention::{attention_output, causal_attention, split_heads, RotaryEmbedding};
use crate::hooked::{HookConfig, HookPoint, Hooks};
use crate::model::HookedBackend;

/// Model configuration (matches HuggingFace config.json for GPT-J)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct GptJConfig {
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub n_positions: usize,
    pub vocab_size: usize,
    /// Rotated channels per head; the whole head when absent
    #[serde(default)]
    pub rotary_dim: Option<usize>,
    /// MLP width; `4 * n_embd` when absent
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl GptJConfig {
    fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    n_head: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &GptJConfig) -> Result<Self> {
        let d = config.n_embd;
        Ok(Self {
            q_proj: linear_no_bias(d, d, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(d, d, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(d, d, vb.pp("v_proj"))?,
            out_proj: linear_no_bias(d, d, vb.pp("out_proj"))?,
            n_head: config.n_head,
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
        let q = split_heads(&self.q_proj.forward(x)?, self.n_head, self.head_dim)?;
        let k = split_heads(&self.k_proj.forward(x)?, self.n_head, self.head_dim)?;
        let v = split_heads(&self.v_proj.forward(x)?, self.n_head, self.head_dim)?;

        let q = rotary.apply(&q)?;
        let k = rotary.apply(&k)?;

        let z = causal_attention(&q, &k, &v, layer, hooks)?;
        attention_output(&z, &self.out_proj, layer, config, hooks)
    }
}

struct Mlp {
    fc_in: Linear,
    fc_out: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &GptJConfig) -> Result<Self> {
        let (d, inner) = (config.n_embd, config.inner_dim());
        Ok(Self {
            fc_in: linear(d, inner, vb.pp("fc_in"))?,
            fc_out: linear(inner, d, vb.pp("fc_out"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.fc_in.forward(x)?.gelu()?;
        Ok(self.fc_out.forward(&hidden)?)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    mlp: Mlp,
}

impl Block {
    fn load(vb: VarBuilder, config: &GptJConfig) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_1"))?,
            attn: Attention::load(vb.pp("attn"), config)?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
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
        let normed = self.ln_1.forward(&resid_pre)?;

        let attn_out = self.attn.forward(&normed, rotary, layer, config, hooks)?;
        let attn_out = hooks.apply(HookPoint::AttnOut(layer), attn_out)?;

        let mlp_out = self.mlp.forward(&normed)?;
        let mlp_out = hooks.apply(HookPoint::MlpOut(layer), mlp_out)?;

        let resid_post = ((&resid_pre + &attn_out)? + &mlp_out)?;
        hooks.apply(HookPoint::ResidPost(layer), resid_post)
    }
}

/// GPT-J with hook points
pub struct HookedGptJ {
    wte: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    n_head: usize,
    n_embd: usize,
    vocab_size: usize,
}

impl HookedGptJ {
    pub fn load(config: &GptJConfig, vb: VarBuilder) -> Result<Self> {
        let vb_t = vb.pp("transformer");
        let wte = embedding(config.vocab_size, config.n_embd, vb_t.pp("wte"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Block::load(vb_t.pp(format!("h.{i}")), config)?);
        }
        let ln_f = layer_norm(config.n_embd, config.layer_norm_epsilon, vb_t.pp("ln_f"))?;
        let lm_head = linear(config.n_embd, config.vocab_size, vb.pp("lm_head"))?;

        let rotary_dim = config.rotary_dim.unwrap_or(config.head_dim());
        let rotary = RotaryEmbedding::new(
            rotary_dim,
            config.n_positions,
            10_000.0,
            true,
            vb.device(),
            vb.dtype(),
        )?;

        info!(
            "GPT-J loaded: {} layers, {} hidden, rotary_dim {}",
            config.n_layer, config.n_embd, rotary_dim
        );

        Ok(Self {
            wte,
            blocks,
            ln_f,
            lm_head,
            rotary,
            n_head: config.n_head,
            n_embd: config.n_embd,
            vocab_size: config.vocab_size,
        })
    }
}

impl HookedBackend for HookedGptJ {
    fn n_layers(&self) -> usize {
        self.blocks.len()
    }

    fn d_model(&self) -> usize {
        self.n_embd
    }

    fn n_heads(&self) -> usize {
        self.n_head
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn forward(&self, input_ids: &Tensor, config: &HookConfig, hooks: &mut Hooks) -> Result<Tensor> {
        let embed = self.wte.forward(input_ids)?;
        let mut hidden = hooks.apply(HookPoint::Embed, embed)?;

        for (i, block) in self.blocks.iter().enumerate() {
            hidden = block.forward(hidden, &self.rotary, i, config, hooks)?;
        }

        let normalized = hooks.apply(HookPoint::FinalNormalized, self.ln_f.forward(&hidden)?)?;
        Ok(self.lm_head.forward(&normalized)?)
    }
}
