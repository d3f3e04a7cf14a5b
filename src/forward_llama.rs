//! LLaMA forward pass with hook points
//!
//! Pre-norm decoder layers with RMSNorm, rotary embeddings over the full
//! head dimension (rotate-half layout), SwiGLU MLP and grouped-query
//! attention. No bias on any projection.

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use tracing::info;

use crate::attention::{
    attention_output, causal_attention, repeat_kv, split_heads, RotaryEmbedding,
};
use crate::hooked::{HookConfig, HookPoint, Hooks};
use crate::model::HookedBackend;

/// Model configuration (matches HuggingFace config.json for LLaMA)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    /// Absent in LLaMA-1 configs, which use full multi-head attention
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_max_position_embeddings() -> usize {
    2048
}

impl LlamaConfig {
    fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let head_dim = config.hidden_size / config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();
        Ok(Self {
            q_proj: linear_no_bias(
                config.hidden_size,
                config.num_attention_heads * head_dim,
                vb.pp("q_proj"),
            )?,
            k_proj: linear_no_bias(config.hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(config.hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(
                config.num_attention_heads * head_dim,
                config.hidden_size,
                vb.pp("o_proj"),
            )?,
            num_heads: config.num_attention_heads,
            num_kv_heads,
            head_dim,
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
        let q = split_heads(&self.q_proj.forward(x)?, self.num_heads, self.head_dim)?;
        let k = split_heads(&self.k_proj.forward(x)?, self.num_kv_heads, self.head_dim)?;
        let v = split_heads(&self.v_proj.forward(x)?, self.num_kv_heads, self.head_dim)?;

        let q = rotary.apply(&q)?;
        let k = rotary.apply(&k)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?;

        let z = causal_attention(&q, &k, &v, layer, hooks)?;
        attention_output(&z, &self.o_proj, layer, config, hooks)
    }
}

/// SwiGLU, no bias
struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let (h, i) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(h, i, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(h, i, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(i, h, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // down(silu(gate(x)) * up(x))
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config)?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
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
        let attn_out = self.self_attn.forward(&attn_in, rotary, layer, config, hooks)?;
        let attn_out = hooks.apply(HookPoint::AttnOut(layer), attn_out)?;
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

/// LLaMA with hook points
pub struct HookedLlama {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    n_heads: usize,
    hidden_size: usize,
    vocab_size: usize,
}

impl HookedLlama {
    pub fn load(config: &LlamaConfig, vb: VarBuilder) -> Result<Self> {
        let vb_model = vb.pp("model");
        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(DecoderLayer::load(vb_model.pp(format!("layers.{i}")), config)?);
        }
        let norm = candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        let head_dim = config.hidden_size / config.num_attention_heads;
        let rotary = RotaryEmbedding::new(
            head_dim,
            config.max_position_embeddings,
            config.rope_theta,
            false,
            vb.device(),
            vb.dtype(),
        )?;

        info!(
            "LLaMA loaded: {} layers, {} hidden, {} vocab",
            config.num_hidden_layers, config.hidden_size, config.vocab_size
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            n_heads: config.num_attention_heads,
            hidden_size: config.hidden_size,
            vocab_size: config.vocab_size,
        })
    }
}

impl HookedBackend for HookedLlama {
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
        let embed = self.embed_tokens.forward(input_ids)?;
        let mut hidden = hooks.apply(HookPoint::Embed, embed)?;

        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(hidden, &self.rotary, i, config, hooks)?;
        }

        let normalized = hooks.apply(HookPoint::FinalNormalized, self.norm.forward(&hidden)?)?;
        Ok(self.lm_head.forward(&normalized)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ArchConfig, LoadedModel};
    use candle_core::{DType, Device};
    use std::collections::HashMap;

    fn tiny_config() -> LlamaConfig {
        serde_json::from_str(
            r#"{"hidden_size": 8, "intermediate_size": 16, "num_attention_heads": 2,
                "num_key_value_heads": 1, "num_hidden_layers": 2, "vocab_size": 12,
                "max_position_embeddings": 16}"#,
        )
        .unwrap()
    }

    fn tiny_weights(config: &LlamaConfig) -> HashMap<String, Tensor> {
        let device = Device::Cpu;
        let (h, i, v) = (config.hidden_size, config.intermediate_size, config.vocab_size);
        let kv = config.num_kv_heads() * (h / config.num_attention_heads);
        let randn = |shape: (usize, usize)| Tensor::randn(0f32, 0.2, shape, &device).unwrap();

        let mut w = HashMap::new();
        w.insert("model.embed_tokens.weight".to_string(), randn((v, h)));
        w.insert("lm_head.weight".to_string(), randn((v, h)));
        w.insert("model.norm.weight".to_string(), Tensor::ones(h, DType::F32, &device).unwrap());
        for l in 0..config.num_hidden_layers {
            let p = format!("model.layers.{l}");
            w.insert(format!("{p}.self_attn.q_proj.weight"), randn((h, h)));
            w.insert(format!("{p}.self_attn.k_proj.weight"), randn((kv, h)));
            w.insert(format!("{p}.self_attn.v_proj.weight"), randn((kv, h)));
            w.insert(format!("{p}.self_attn.o_proj.weight"), randn((h, h)));
            w.insert(format!("{p}.mlp.gate_proj.weight"), randn((i, h)));
            w.insert(format!("{p}.mlp.up_proj.weight"), randn((i, h)));
            w.insert(format!("{p}.mlp.down_proj.weight"), randn((h, i)));
            for norm in ["input_layernorm", "post_attention_layernorm"] {
                w.insert(
                    format!("{p}.{norm}.weight"),
                    Tensor::ones(h, DType::F32, &device).unwrap(),
                );
            }
        }
        w
    }

    #[test]
    fn test_config_defaults() {
        let config = tiny_config();
        assert_eq!(config.num_kv_heads(), 1);
        assert_eq!(config.rope_theta, 10_000.0);
        assert!(!config.tie_word_embeddings);
    }

    #[test]
    fn test_grouped_query_forward() {
        let config = tiny_config();
        let weights = tiny_weights(&config);
        let model = LoadedModel::from_tensors("llama-tiny", ArchConfig::Llama(config), weights, DType::F32);
        let backend = model.build_backend(&Device::Cpu).unwrap();

        let ids = Tensor::new(&[[1u32, 4, 7], [2, 3, 11]], &Device::Cpu).unwrap();
        let mut hook_config = HookConfig::for_architecture(true);
        hook_config.use_attn_result = true;
        hook_config.use_hook_mlp_in = Some(true);
        let mut hooks = Hooks::new().with_cache();

        let logits = backend.forward(&ids, &hook_config, &mut hooks).unwrap();
        assert_eq!(logits.dims(), &[2, 3, 12]);

        let cache = hooks.take_cache().unwrap();
        assert_eq!(cache.require(HookPoint::AttnResult(1)).unwrap().dims(), &[2, 3, 2, 8]);
        assert!(cache.get(HookPoint::MlpIn(1)).is_some());
    }
}
