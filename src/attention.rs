// Multi-head attention over a key padding mask, with an optional
// zero-attention slot.
//
// Masks are u8 tensors, 1 = ignore this key. Masked logits are filled with
// MASKED_LOGIT rather than -inf: exp() underflows to exactly zero, and a row
// with every key masked stays finite.

use anyhow::{bail, Result};
use candle_core::{DType, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::init::{xavier_init, xavier_linear};

pub const MASKED_LOGIT: f32 = -1e9;

// ---------------------------------------------------------------------------
// Tensor helpers
// ---------------------------------------------------------------------------

/// Replace entries of `on_false` where `mask` is nonzero with `on_true`.
/// `mask` is broadcast to the shape of `on_false`.
pub fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let shape = on_false.dims();
    let mask = mask.broadcast_as(shape)?;
    let on_true = Tensor::new(on_true, on_false.device())?
        .to_dtype(on_false.dtype())?
        .broadcast_as(shape)?;
    mask.where_cond(&on_true, on_false).map_err(Into::into)
}

/// Softmax over the last dim from basic ops, so autograd stays intact.
pub fn softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let shifted = x.broadcast_sub(&max)?;
    let exp = shifted.exp()?;
    let sum = exp.sum_keepdim(D::Minus1)?;
    exp.broadcast_div(&sum).map_err(Into::into)
}

pub fn dropout(x: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        candle_nn::ops::dropout(x, p).map_err(Into::into)
    } else {
        Ok(x.clone())
    }
}

/// (B, S) key padding mask -> (B, 1, 1, S), ready to broadcast over heads and queries.
pub fn key_padding_for_scores(mask: &Tensor) -> Result<Tensor> {
    mask.unsqueeze(1)?.unsqueeze(1).map_err(Into::into)
}

/// (L, S) or (B, L, S) query/key mask -> (1 or B, 1, L, S).
pub fn attn_mask_for_scores(mask: &Tensor) -> Result<Tensor> {
    match mask.rank() {
        2 => mask.unsqueeze(0)?.unsqueeze(0).map_err(Into::into),
        3 => mask.unsqueeze(1).map_err(Into::into),
        r => bail!("attn_mask must be (L, S) or (B, L, S), got rank {r}"),
    }
}

/// Append one unmasked key column to a u8 mask.
fn append_open_column(mask: &Tensor) -> Result<Tensor> {
    let mut dims = mask.dims().to_vec();
    if let Some(last) = dims.last_mut() {
        *last = 1;
    }
    let open = Tensor::zeros(dims, DType::U8, mask.device())?;
    Tensor::cat(&[mask, &open], D::Minus1).map_err(Into::into)
}

/// (B, S, H*hd) -> (B, H, S, hd)
pub(crate) fn split_heads(x: &Tensor, n_heads: usize, head_dim: usize) -> Result<Tensor> {
    let (b, s, _) = x.dims3()?;
    x.reshape((b, s, n_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()
        .map_err(Into::into)
}

/// (B, H, S, hd) -> (B, S, H*hd)
pub(crate) fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (b, h, s, hd) = x.dims4()?;
    x.transpose(1, 2)?.reshape((b, s, h * hd)).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// MultiheadAttention
// ---------------------------------------------------------------------------

pub struct MultiheadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    n_heads: usize,
    head_dim: usize,
    dropout: f32,
    add_zero_attn: bool,
}

impl MultiheadAttention {
    /// The q/k/v projections share one packed (3d, d) weight, Xavier-initialized
    /// as a whole; biases start at zero.
    pub fn new(
        d_model: usize,
        n_heads: usize,
        dropout: f64,
        add_zero_attn: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let in_w = vb.get_with_hints(
            (3 * d_model, d_model),
            "in_proj_weight",
            xavier_init(d_model, 3 * d_model),
        )?;
        let in_b = vb.get_with_hints(3 * d_model, "in_proj_bias", candle_nn::Init::Const(0.0))?;
        let slice = |i: usize| -> Result<Linear> {
            Ok(Linear::new(
                in_w.narrow(0, i * d_model, d_model)?,
                Some(in_b.narrow(0, i * d_model, d_model)?),
            ))
        };
        Ok(Self {
            q_proj: slice(0)?,
            k_proj: slice(1)?,
            v_proj: slice(2)?,
            out_proj: xavier_linear(d_model, d_model, vb.pp("out_proj"))?,
            n_heads,
            head_dim: d_model / n_heads,
            dropout: dropout as f32,
            add_zero_attn,
        })
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    /// query (B, L, D), key/value (B, S, D), key_padding (B, S) with 1 = ignore.
    ///
    /// Returns the attended output (B, L, D) and the per-head weights
    /// (B, H, L, S), or (B, H, L, S + 1) with the zero-attention slot.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_padding: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        self.forward_masked(query, key, value, None, key_padding, train)
    }

    /// Like `forward`, plus a u8 `attn_mask` of shape (L, S) or (B, L, S),
    /// 1 = query may not attend to that key. Both masks apply.
    pub fn forward_masked(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
        key_padding: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let q = split_heads(&self.q_proj.forward(query)?, self.n_heads, self.head_dim)?;
        let mut k = split_heads(&self.k_proj.forward(key)?, self.n_heads, self.head_dim)?;
        let mut v = split_heads(&self.v_proj.forward(value)?, self.n_heads, self.head_dim)?;
        let mut padding = key_padding.cloned();
        let mut pair_mask = attn_mask.map(attn_mask_for_scores).transpose()?;

        if self.add_zero_attn {
            let (b, h, _, hd) = k.dims4()?;
            let zeros = Tensor::zeros((b, h, 1, hd), k.dtype(), k.device())?;
            k = Tensor::cat(&[&k, &zeros], 2)?;
            v = Tensor::cat(&[&v, &zeros], 2)?;
            // the zero slot is never masked
            padding = padding.map(|m| append_open_column(&m)).transpose()?;
            pair_mask = pair_mask.map(|m| append_open_column(&m)).transpose()?;
        }

        let scale = (self.head_dim as f64).sqrt();
        let mut scores = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? / scale)?;
        if let Some(m) = &padding {
            scores = masked_fill(&scores, &key_padding_for_scores(m)?, MASKED_LOGIT)?;
        }
        if let Some(m) = &pair_mask {
            scores = masked_fill(&scores, m, MASKED_LOGIT)?;
        }
        let weights = softmax_last_dim(&scores)?;
        let attn = dropout(&weights, self.dropout, train)?;

        let out = merge_heads(&attn.matmul(&v)?)?;
        Ok((self.out_proj.forward(&out)?, weights))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn build(add_zero_attn: bool) -> Result<MultiheadAttention> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        MultiheadAttention::new(32, 4, 0.0, add_zero_attn, vb.pp("attn"))
    }

    #[test]
    fn test_masked_fill() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0]], &device)?;
        let m = Tensor::new(&[[0u8, 1, 0]], &device)?;
        let y = masked_fill(&x, &m, -5.0)?.to_vec2::<f32>()?;
        assert_eq!(y, vec![vec![1.0, -5.0, 3.0]]);
        Ok(())
    }

    #[test]
    fn test_softmax_rows_sum_to_one() -> Result<()> {
        let x = Tensor::randn(0f32, 2.0, (3, 7), &Device::Cpu)?;
        let sums = softmax_last_dim(&x)?.sum(1)?.to_vec1::<f32>()?;
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_shapes_with_zero_slot() -> Result<()> {
        let device = Device::Cpu;
        let mha = build(true)?;
        let q = Tensor::randn(0f32, 1.0, (2, 5, 32), &device)?;
        let kv = Tensor::randn(0f32, 1.0, (2, 7, 32), &device)?;
        let (out, w) = mha.forward(&q, &kv, &kv, None, false)?;
        assert_eq!(out.dims3()?, (2, 5, 32));
        assert_eq!(w.dims4()?, (2, 4, 5, 8));
        Ok(())
    }

    #[test]
    fn test_masked_keys_get_zero_weight() -> Result<()> {
        let device = Device::Cpu;
        let mha = build(false)?;
        let q = Tensor::randn(0f32, 1.0, (1, 2, 32), &device)?;
        let kv = Tensor::randn(0f32, 1.0, (1, 4, 32), &device)?;
        let mask = Tensor::new(&[[0u8, 1, 0, 1]], &device)?;
        let (_, w) = mha.forward(&q, &kv, &kv, Some(&mask), false)?;
        let w = w.flatten_to(2)?.to_vec2::<f32>()?;
        for row in w {
            assert_eq!(row[1], 0.0);
            assert_eq!(row[3], 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_fully_masked_memory_is_finite() -> Result<()> {
        let device = Device::Cpu;
        let mha = build(true)?;
        let q = Tensor::randn(0f32, 1.0, (1, 3, 32), &device)?;
        let kv = Tensor::randn(0f32, 1.0, (1, 4, 32), &device)?;
        let mask = Tensor::ones((1, 4), DType::U8, &device)?;
        let (out, w) = mha.forward(&q, &kv, &kv, Some(&mask), false)?;
        let out = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(out.iter().all(|v| v.is_finite()));
        // all weight lands on the zero slot
        let w = w.flatten_to(2)?.to_vec2::<f32>()?;
        for row in w {
            assert!((row[4] - 1.0).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_attn_mask_matches_key_padding() -> Result<()> {
        let device = Device::Cpu;
        let mha = build(true)?;
        let q = Tensor::randn(0f32, 1.0, (2, 3, 32), &device)?;
        let kv = Tensor::randn(0f32, 1.0, (2, 4, 32), &device)?;
        let padding = Tensor::new(&[[0u8, 1, 0, 1], [0, 1, 0, 1]], &device)?;
        // every query blocks keys 1 and 3
        let pair = Tensor::new(&[[0u8, 1, 0, 1], [0, 1, 0, 1], [0, 1, 0, 1]], &device)?;

        let (by_padding, _) = mha.forward(&q, &kv, &kv, Some(&padding), false)?;
        let (by_pair, w) = mha.forward_masked(&q, &kv, &kv, Some(&pair), None, false)?;
        assert_eq!(w.dims4()?, (2, 4, 3, 5));
        let diff = (by_padding - by_pair)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6, "{diff}");
        Ok(())
    }

    #[test]
    fn test_attn_mask_per_query() -> Result<()> {
        let device = Device::Cpu;
        let mha = build(false)?;
        let q = Tensor::randn(0f32, 1.0, (1, 2, 32), &device)?;
        let kv = Tensor::randn(0f32, 1.0, (1, 3, 32), &device)?;
        let pair = Tensor::new(&[[[1u8, 0, 0], [0, 0, 1]]], &device)?;
        let (_, w) = mha.forward_masked(&q, &kv, &kv, Some(&pair), None, false)?;
        let w = w.get(0)?;
        for h in 0..4 {
            let rows = w.get(h)?.to_vec2::<f32>()?;
            assert_eq!(rows[0][0], 0.0);
            assert_eq!(rows[1][2], 0.0);
            assert!(rows[0][2] > 0.0 && rows[1][0] > 0.0);
        }
        assert!(mha
            .forward_masked(&q, &kv, &kv, Some(&pair.get(0)?.get(0)?), None, false)
            .is_err());
        Ok(())
    }
}
