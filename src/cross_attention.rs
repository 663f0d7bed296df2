// Cross-attention block: a query sequence attends over a masked memory.
//
// Position biases are added to query and key inputs (never to values) before
// attention. The zero-attention slot keeps fully padded memories finite.

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{LayerNorm, VarBuilder};

use crate::activation::Activation;
use crate::attention::{dropout, MultiheadAttention};
use crate::init::layer_norm;

#[derive(Debug, Clone)]
pub struct CrossAttentionConfig {
    pub d_model: usize,
    pub n_heads: usize,
    pub dropout: f64,
    /// Name of the layer nonlinearity; validated when the layer is built.
    pub activation: String,
    /// Pre-norm when true, post-norm otherwise.
    pub normalize_before: bool,
}

impl CrossAttentionConfig {
    pub fn new(d_model: usize, n_heads: usize, dropout: f64) -> Self {
        Self {
            d_model,
            n_heads,
            dropout,
            activation: "relu".to_string(),
            normalize_before: false,
        }
    }
}

fn with_pos_embed(x: &Tensor, pos: Option<&Tensor>) -> Result<Tensor> {
    match pos {
        Some(p) => (x + p).map_err(Into::into),
        None => Ok(x.clone()),
    }
}

pub struct CrossAttentionLayer {
    attn: MultiheadAttention,
    norm: LayerNorm,
    dropout: f32,
    activation: Activation,
    normalize_before: bool,
}

impl CrossAttentionLayer {
    pub fn new(cfg: &CrossAttentionConfig, vb: VarBuilder) -> Result<Self> {
        // Reject a bad activation before any parameter is allocated.
        let activation: Activation = cfg.activation.parse()?;
        Ok(Self {
            attn: MultiheadAttention::new(
                cfg.d_model,
                cfg.n_heads,
                cfg.dropout,
                true,
                vb.pp("multihead_attn"),
            )?,
            norm: layer_norm(cfg.d_model, vb.pp("norm"))?,
            dropout: cfg.dropout as f32,
            activation,
            normalize_before: cfg.normalize_before,
        })
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn normalize_before(&self) -> bool {
        self.normalize_before
    }

    /// tgt (B, L, D) attends over memory (B, S, D).
    ///
    /// `attn_mask` is (L, S) or (B, L, S) and `memory_padding` is (B, S), both
    /// u8 with 1 = blocked. `pos` biases the keys, `query_pos` the queries.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        attn_mask: Option<&Tensor>,
        memory_padding: Option<&Tensor>,
        pos: Option<&Tensor>,
        query_pos: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        if self.normalize_before {
            self.forward_pre(tgt, memory, attn_mask, memory_padding, pos, query_pos, train)
        } else {
            self.forward_post(tgt, memory, attn_mask, memory_padding, pos, query_pos, train)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn forward_post(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        attn_mask: Option<&Tensor>,
        memory_padding: Option<&Tensor>,
        pos: Option<&Tensor>,
        query_pos: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (tgt2, _) = self.attn.forward_masked(
            &with_pos_embed(tgt, query_pos)?,
            &with_pos_embed(memory, pos)?,
            memory,
            attn_mask,
            memory_padding,
            train,
        )?;
        let tgt = (tgt + dropout(&tgt2, self.dropout, train)?)?;
        self.norm.forward(&tgt).map_err(Into::into)
    }

    #[allow(clippy::too_many_arguments)]
    fn forward_pre(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        attn_mask: Option<&Tensor>,
        memory_padding: Option<&Tensor>,
        pos: Option<&Tensor>,
        query_pos: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let tgt2 = self.norm.forward(tgt)?;
        let (tgt2, _) = self.attn.forward_masked(
            &with_pos_embed(&tgt2, query_pos)?,
            &with_pos_embed(memory, pos)?,
            memory,
            attn_mask,
            memory_padding,
            train,
        )?;
        (tgt + dropout(&tgt2, self.dropout, train)?).map_err(Into::into)
    }
}
