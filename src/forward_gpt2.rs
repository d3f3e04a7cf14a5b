//! GPT-2 forward pass with hook points
//!
//! Sequential pre-norm blocks, learned position embeddings, fused `c_attn`
//! projection stored as `Conv1D` (`[in, out]` weights), unembedding tied to
//! the token embedding.

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, Linear, VarBuilder};
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tracing::info;

use crate::attention::{attention_output, causal_attention, split_heads};
use crate::hooked::{HookConfig, HookPoint, Hooks};
use crate::model::HookedBackend;

/// Model configuration (matches HuggingFace config.json for GPT-2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gpt2Config {
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub n_positions: usize,
    pub vocab_size: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Gpt2Config {
    /// Seeded random weights under the HuggingFace parameter names.
    ///
    /// Matrices are uniform in `[-0.2, 0.2)`, layer norms start at identity.
    pub fn random_weights(&self, seed: u64) -> Result<HashMap<String, Tensor>> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let device = Device::Cpu;
        let d = self.n_embd;
        let mut weights = HashMap::new();

        let mut uniform = |shape: &[usize]| -> Result<Tensor> {
            let n: usize = shape.iter().product();
            let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-0.2f32..0.2)).collect();
            Ok(Tensor::from_vec(data, shape, &device)?)
        };
        let ones = |n: usize| Tensor::ones(n, DType::F32, &Device::Cpu);
        let zeros = |n: usize| Tensor::zeros(n, DType::F32, &Device::Cpu);

        weights.insert("wte.weight".to_string(), uniform(&[self.vocab_size, d])?);
        weights.insert("wpe.weight".to_string(), uniform(&[self.n_positions, d])?);

        for i in 0..self.n_layer {
            let p = format!("h.{i}");
            for ln in ["ln_1", "ln_2"] {
                weights.insert(format!("{p}.{ln}.weight"), ones(d)?);
                weights.insert(format!("{p}.{ln}.bias"), zeros(d)?);
            }
            let linears = [
                ("attn.c_attn", d, 3 * d),
                ("attn.c_proj", d, d),
                ("mlp.c_fc", d, 4 * d),
                ("mlp.c_proj", 4 * d, d),
            ];
            for (name, in_dim, out_dim) in linears {
                weights.insert(format!("{p}.{name}.weight"), uniform(&[in_dim, out_dim])?);
                weights.insert(format!("{p}.{name}.bias"), uniform(&[out_dim])?);
            }
        }

        weights.insert("ln_f.weight".to_string(), ones(d)?);
        weights.insert("ln_f.bias".to_string(), zeros(d)?);
        Ok(weights)
    }
}

/// `Conv1D` stores its weight transposed relative to `nn.Linear`
fn conv1d(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get((in_dim, out_dim), "weight")?.t()?.contiguous()?;
    let bias = vb.get(out_dim, "bias")?;
    Ok(Linear::new(weight, Some(bias)))
}

struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let d = config.n_embd;
        Ok(Self {
            c_attn: conv1d(d, 3 * d, vb.pp("c_attn"))?,
            c_proj: conv1d(d, d, vb.pp("c_proj"))?,
            n_head: config.n_head,
            head_dim: d / config.n_head,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        layer: usize,
        config: &HookConfig,
        hooks: &mut Hooks,
    ) -> Result<Tensor> {
        let d = self.n_head * self.head_dim;
        let qkv = self.c_attn.forward(x)?;
        let q = split_heads(&qkv.narrow(D::Minus1, 0, d)?, self.n_head, self.head_dim)?;
        let k = split_heads(&qkv.narrow(D::Minus1, d, d)?, self.n_head, self.head_dim)?;
        let v = split_heads(&qkv.narrow(D::Minus1, 2 * d, d)?, self.n_head, self.head_dim)?;

        let z = causal_attention(&q, &k, &v, layer, hooks)?;
        attention_output(&z, &self.c_proj, layer, config, hooks)
    }
}

struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let d = config.n_embd;
        Ok(Self {
            c_fc: conv1d(d, 4 * d, vb.pp("c_fc"))?,
            c_proj: conv1d(4 * d, d, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // gelu_new is the tanh approximation
        let hidden = self.c_fc.forward(x)?.gelu()?;
        Ok(self.c_proj.forward(&hidden)?)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let eps = config.layer_norm_epsilon;
        Ok(Self {
            ln_1: layer_norm(config.n_embd, eps, vb.pp("ln_1"))?,
            attn: Attention::load(vb.pp("attn"), config)?,
            ln_2: layer_norm(config.n_embd, eps, vb.pp("ln_2"))?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
        })
    }

    fn forward(
        &self,
        x: Tensor,
        layer: usize,
        config: &HookConfig,
        hooks: &mut Hooks,
    ) -> Result<Tensor> {
        let resid_pre = hooks.apply(HookPoint::ResidPre(layer), x)?;

        let attn_out = self
            .attn
            .forward(&self.ln_1.forward(&resid_pre)?, layer, config, hooks)?;
        let attn_out = hooks.apply(HookPoint::AttnOut(layer), attn_out)?;
        let resid_mid = hooks.apply(HookPoint::ResidMid(layer), (&resid_pre + &attn_out)?)?;

        let mlp_in = if config.hook_mlp_in_enabled() {
            hooks.apply(HookPoint::MlpIn(layer), resid_mid.clone())?
        } else {
            resid_mid.clone()
        };
        let mlp_out = self.mlp.forward(&self.ln_2.forward(&mlp_in)?)?;
        let mlp_out = hooks.apply(HookPoint::MlpOut(layer), mlp_out)?;

        hooks.apply(HookPoint::ResidPost(layer), (&resid_mid + &mlp_out)?)
    }
}

/// GPT-2 with hook points
pub struct HookedGpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    n_head: usize,
    n_embd: usize,
    n_positions: usize,
    vocab_size: usize,
}

impl HookedGpt2 {
    pub fn load(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        // Some checkpoints nest everything under `transformer.`
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Block::load(vb.pp(format!("h.{i}")), config)?);
        }
        let ln_f = layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;
        let lm_head = Linear::new(wte.embeddings().clone(), None);

        info!(
            "GPT-2 loaded: {} layers, {} hidden, {} vocab",
            config.n_layer, config.n_embd, config.vocab_size
        );

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            n_head: config.n_head,
            n_embd: config.n_embd,
            n_positions: config.n_positions,
            vocab_size: config.vocab_size,
        })
    }
}

impl HookedBackend for HookedGpt2 {
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
        let (_b, seq_len) = input_ids.dims2()?;
        anyhow::ensure!(
            seq_len <= self.n_positions,
            "Sequence length {seq_len} exceeds n_positions {}",
            self.n_positions
        );

        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let embed = self
            .wte
            .forward(input_ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;
        let mut hidden = hooks.apply(HookPoint::Embed, embed)?;

        for (i, block) in self.blocks.iter().enumerate() {
            hidden = block.forward(hidden, i, config, hooks)?;
        }

        let normalized = hooks.apply(HookPoint::FinalNormalized, self.ln_f.forward(&hidden)?)?;
        Ok(self.lm_head.forward(&normalized)?)
    }
}
