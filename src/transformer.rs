// Self-attention encoder layers for the fusion loop.
//
// Both layers are pre-norm. The spatial variant mixes a learned projection of
// pairwise box geometry into its attention logits.

use anyhow::{anyhow, Result};
use candle_core::{Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use crate::activation::Activation;
use crate::attention::{
    dropout, key_padding_for_scores, masked_fill, merge_heads, softmax_last_dim, split_heads,
    MultiheadAttention, MASKED_LOGIT,
};
use crate::config::{SpatialAttnFusion, SpatialEncoderConfig};
use crate::init::{bert_linear, layer_norm};

const LOC_ATTN_FLOOR: f32 = 1e-6;

// ---------------------------------------------------------------------------
// Spatial Attention
// ---------------------------------------------------------------------------

/// Self-attention whose logits are fused with a learned projection of the
/// pairwise location features.
struct SpatialAttention {
    w_qs: Linear,
    w_ks: Linear,
    w_vs: Linear,
    fc: Linear,
    pairwise_loc_fc: Linear,
    layer_norm: LayerNorm,
    n_heads: usize,
    head_dim: usize,
    fusion: SpatialAttnFusion,
    dropout: f32,
}

impl SpatialAttention {
    fn new(d_model: usize, cfg: &SpatialEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let n_heads = cfg.num_attention_heads;
        let spatial_heads = if cfg.spatial_multihead { n_heads } else { 1 };
        Ok(Self {
            w_qs: bert_linear(d_model, d_model, vb.pp("w_qs"))?,
            w_ks: bert_linear(d_model, d_model, vb.pp("w_ks"))?,
            w_vs: bert_linear(d_model, d_model, vb.pp("w_vs"))?,
            fc: bert_linear(d_model, d_model, vb.pp("fc"))?,
            pairwise_loc_fc: bert_linear(cfg.spatial_dim, spatial_heads, vb.pp("pairwise_loc_fc"))?,
            layer_norm: layer_norm(d_model, vb.pp("layer_norm"))?,
            n_heads,
            head_dim: d_model / n_heads,
            fusion: cfg.spatial_attn_fusion,
            dropout: cfg.dropout as f32,
        })
    }

    /// x (B, L, D), pairwise (B, L, L, spatial_dim), padding (B, L) with 1 = masked.
    fn forward(
        &self,
        x: &Tensor,
        pairwise: &Tensor,
        padding: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let q = split_heads(&self.w_qs.forward(x)?, self.n_heads, self.head_dim)?;
        let k = split_heads(&self.w_ks.forward(x)?, self.n_heads, self.head_dim)?;
        let v = split_heads(&self.w_vs.forward(x)?, self.n_heads, self.head_dim)?;

        let scale = (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.t()?.contiguous()?)? / scale)?;

        // (B, L, L, heads) -> (B, heads, L, L), shared logits repeat over heads
        let loc = self
            .pairwise_loc_fc
            .forward(pairwise)?
            .permute((0, 3, 1, 2))?;
        let loc = match self.fusion {
            SpatialAttnFusion::Mul => loc.relu()?,
            _ => loc,
        };
        let loc = loc.broadcast_as(attn.dims())?.contiguous()?;

        let (attn, loc) = match padding {
            Some(m) => {
                let m = key_padding_for_scores(m)?;
                let loc_fill = match self.fusion {
                    SpatialAttnFusion::Mul => 0.0,
                    _ => MASKED_LOGIT,
                };
                (
                    masked_fill(&attn, &m, MASKED_LOGIT)?,
                    masked_fill(&loc, &m, loc_fill)?,
                )
            }
            None => (attn, loc),
        };

        let fused = match self.fusion {
            SpatialAttnFusion::Add => {
                ((softmax_last_dim(&attn)? + softmax_last_dim(&loc)?)? / 2.0)?
            }
            SpatialAttnFusion::Mul => {
                softmax_last_dim(&(loc.maximum(LOC_ATTN_FLOOR)?.log()? + attn)?)?
            }
            SpatialAttnFusion::Bias => softmax_last_dim(&(loc + attn)?)?,
        };

        let out = merge_heads(&fused.matmul(&v)?)?;
        let out = dropout(&self.fc.forward(&out)?, self.dropout, train)?;
        let out = self.layer_norm.forward(&(out + x)?)?;
        Ok((out, fused))
    }
}

// ---------------------------------------------------------------------------
// Feed-forward
// ---------------------------------------------------------------------------

struct FeedForward {
    linear1: Linear,
    linear2: Linear,
    activation: Activation,
    dropout: f32,
}

impl FeedForward {
    fn new(d_model: usize, cfg: &SpatialEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let d_ff = cfg.dim_feedforward;
        Ok(Self {
            linear1: bert_linear(d_model, d_ff, vb.pp("linear1"))?,
            linear2: bert_linear(cfg.activation.output_dim(d_ff), d_model, vb.pp("linear2"))?,
            activation: cfg.activation,
            dropout: cfg.dropout as f32,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.activation.apply(&self.linear1.forward(x)?)?;
        let h = dropout(&h, self.dropout, train)?;
        self.linear2.forward(&h).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Encoder layers
// ---------------------------------------------------------------------------

/// Pre-norm encoder layer with location-aware self-attention.
pub struct TransformerSpatialEncoderLayer {
    norm1: LayerNorm,
    self_attn: SpatialAttention,
    norm2: LayerNorm,
    ffn: FeedForward,
    dropout: f32,
}

impl TransformerSpatialEncoderLayer {
    pub fn new(d_model: usize, cfg: &SpatialEncoderConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: layer_norm(d_model, vb.pp("norm1"))?,
            self_attn: SpatialAttention::new(d_model, cfg, vb.pp("self_attn"))?,
            norm2: layer_norm(d_model, vb.pp("norm2"))?,
            ffn: FeedForward::new(d_model, cfg, vb.pp("ffn"))?,
            dropout: cfg.dropout as f32,
        })
    }

    /// Returns the updated sequence and the fused attention weights (B, H, L, L).
    pub fn forward(
        &self,
        src: &Tensor,
        pairwise: &Tensor,
        padding: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (h, weights) =
            self.self_attn
                .forward(&self.norm1.forward(src)?, pairwise, padding, train)?;
        let src = (src + dropout(&h, self.dropout, train)?)?;
        let h = self.ffn.forward(&self.norm2.forward(&src)?, train)?;
        let src = (&src + dropout(&h, self.dropout, train)?)?;
        Ok((src, weights))
    }
}

/// Pre-norm encoder layer with plain multi-head self-attention.
pub struct TransformerEncoderLayer {
    norm1: LayerNorm,
    self_attn: MultiheadAttention,
    norm2: LayerNorm,
    ffn: FeedForward,
    dropout: f32,
}

impl TransformerEncoderLayer {
    pub fn new(d_model: usize, cfg: &SpatialEncoderConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: layer_norm(d_model, vb.pp("norm1"))?,
            self_attn: MultiheadAttention::new(
                d_model,
                cfg.num_attention_heads,
                cfg.dropout,
                false,
                vb.pp("self_attn"),
            )?,
            norm2: layer_norm(d_model, vb.pp("norm2"))?,
            ffn: FeedForward::new(d_model, cfg, vb.pp("ffn"))?,
            dropout: cfg.dropout as f32,
        })
    }

    pub fn forward(
        &self,
        src: &Tensor,
        padding: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let normed = self.norm1.forward(src)?;
        let (h, weights) = self
            .self_attn
            .forward(&normed, &normed, &normed, padding, train)?;
        let src = (src + dropout(&h, self.dropout, train)?)?;
        let h = self.ffn.forward(&self.norm2.forward(&src)?, train)?;
        let src = (&src + dropout(&h, self.dropout, train)?)?;
        Ok((src, weights))
    }
}

// ---------------------------------------------------------------------------
// SpatialLayer
// ---------------------------------------------------------------------------

/// One self-attention step of the fusion loop. Which variant is built is
/// decided once by `use_spatial_attn`.
pub enum SpatialLayer {
    Spatial(TransformerSpatialEncoderLayer),
    Plain(TransformerEncoderLayer),
}

impl SpatialLayer {
    pub fn new(
        use_spatial_attn: bool,
        d_model: usize,
        cfg: &SpatialEncoderConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if use_spatial_attn {
            Ok(Self::Spatial(TransformerSpatialEncoderLayer::new(d_model, cfg, vb)?))
        } else {
            Ok(Self::Plain(TransformerEncoderLayer::new(d_model, cfg, vb)?))
        }
    }

    pub fn is_spatial(&self) -> bool {
        matches!(self, Self::Spatial(_))
    }

    /// `pairwise` is required by the spatial variant and ignored by the plain one.
    pub fn forward(
        &self,
        src: &Tensor,
        pairwise: Option<&Tensor>,
        padding: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        match self {
            Self::Spatial(layer) => {
                let pairwise = pairwise
                    .ok_or_else(|| anyhow!("spatial encoder layer needs pairwise locations"))?;
                layer.forward(src, pairwise, padding, train)
            }
            Self::Plain(layer) => layer.forward(src, padding, train),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
