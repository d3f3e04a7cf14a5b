//! Attention building blocks shared by all backends.
//!
//! Every backend projects q/k/v its own way, then hands the per-head
//! tensors to [`causal_attention`] and the mixed values to
//! [`attention_output`]. Those two functions own the `hook_pattern` and
//! `hook_result` hook points, so instrumentation behaves identically across
//! architectures.

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::Linear;

use crate::hooked::{HookConfig, HookPoint, Hooks};
use crate::masks::create_causal_mask;

/// Rotary position embeddings over the first `rotary_dim` channels of
/// each head
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
    rotary_dim: usize,
    /// GPT-J rotates adjacent channel pairs; NeoX and LLaMA rotate halves
    interleaved: bool,
}

impl RotaryEmbedding {
    pub fn new(
        rotary_dim: usize,
        max_seq_len: usize,
        theta: f64,
        interleaved: bool,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        anyhow::ensure!(
            rotary_dim % 2 == 0,
            "Rotary dimension must be even, got {rotary_dim}"
        );
        let inv_freq: Vec<f32> = (0..rotary_dim)
            .step_by(2)
            .map(|i| 1.0 / theta.powf(i as f64 / rotary_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq, device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::new(positions, device)?;

        // [seq_len, rotary_dim / 2]
        let freqs = positions.unsqueeze(1)?.matmul(&inv_freq.unsqueeze(0)?)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
            rotary_dim,
            interleaved,
        })
    }

    /// Rotate `x` of shape `[batch, heads, seq, head_dim]`
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, _h, seq_len, head_dim) = x.dims4()?;
        anyhow::ensure!(
            seq_len <= self.cos.dim(0)?,
            "Sequence length {seq_len} exceeds rotary table ({})",
            self.cos.dim(0)?
        );
        let cos = self.cos.narrow(0, 0, seq_len)?.contiguous()?;
        let sin = self.sin.narrow(0, 0, seq_len)?.contiguous()?;

        let rotate = |t: &Tensor| -> Result<Tensor> {
            let t = t.contiguous()?;
            Ok(if self.interleaved {
                candle_nn::rotary_emb::rope_i(&t, &cos, &sin)?
            } else {
                candle_nn::rotary_emb::rope(&t, &cos, &sin)?
            })
        };

        if self.rotary_dim == head_dim {
            return rotate(x);
        }
        let rot = rotate(&x.narrow(D::Minus1, 0, self.rotary_dim)?)?;
        let pass = x.narrow(D::Minus1, self.rotary_dim, head_dim - self.rotary_dim)?;
        Ok(Tensor::cat(&[&rot, &pass], D::Minus1)?)
    }
}

/// `[batch, seq, heads * head_dim]` to `[batch, heads, seq, head_dim]`
pub fn split_heads(x: &Tensor, n_heads: usize, head_dim: usize) -> Result<Tensor> {
    let (b, seq_len, _) = x.dims3()?;
    Ok(x.reshape((b, seq_len, n_heads, head_dim))?.transpose(1, 2)?)
}

/// Expand grouped key/value heads to the full head count
pub fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x.unsqueeze(2)?;
    let x = x.expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// Scaled dot-product attention with a causal mask.
///
/// Takes `[batch, heads, seq, head_dim]` q/k/v, routes the pattern through
/// `hook_pattern` and returns the mixed values in the same layout.
pub fn causal_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    layer: usize,
    hooks: &mut Hooks,
) -> Result<Tensor> {
    let (_b, _h, seq_len, head_dim) = q.dims4()?;
    let q = q.contiguous()?;
    let k = k.contiguous()?;
    let v = v.contiguous()?;

    let scale = 1.0 / (head_dim as f64).sqrt();
    let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
    let mask = create_causal_mask(seq_len, q.device(), scores.dtype())?;
    let scores = scores.broadcast_add(&mask)?;

    // Softmax in f32; half-precision exp overflows on long rows
    let pattern = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?
        .to_dtype(v.dtype())?;
    let pattern = hooks.apply(HookPoint::Pattern(layer), pattern)?;

    Ok(pattern.matmul(&v)?)
}

/// Project mixed values `[batch, heads, seq, head_dim]` to the residual
/// stream.
///
/// With `use_attn_result` the output is first computed per head as
/// `[batch, seq, heads, d_model]` and routed through `hook_result`, then
/// summed over heads. Both paths give the same output when no patch is set.
pub fn attention_output(
    z: &Tensor,
    o_proj: &Linear,
    layer: usize,
    config: &HookConfig,
    hooks: &mut Hooks,
) -> Result<Tensor> {
    let (b, n_heads, seq_len, head_dim) = z.dims4()?;

    if !config.use_attn_result {
        let z = z.transpose(1, 2)?.reshape((b, seq_len, n_heads * head_dim))?;
        return Ok(o_proj.forward(&z)?);
    }

    // W_O: [d_model, heads * head_dim] -> [1, heads, head_dim, d_model]
    let d_model = o_proj.weight().dim(0)?;
    let w_o = o_proj
        .weight()
        .reshape((d_model, n_heads, head_dim))?
        .permute((1, 2, 0))?
        .contiguous()?
        .unsqueeze(0)?;
    let result = z
        .contiguous()?
        .broadcast_matmul(&w_o)?
        .transpose(1, 2)?
        .contiguous()?;
    let result = hooks.apply(HookPoint::AttnResult(layer), result)?;

    let out = result.sum(2)?;
    match o_proj.bias() {
        Some(bias) => Ok(out.broadcast_add(bias)?),
        None => Ok(out),
    }
}
