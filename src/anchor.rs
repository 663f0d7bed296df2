// Embodied anchor token: the agent's own pose as an extra scene token.
//
// The anchor's feature is a learned base vector plus its encoded orientation;
// its box is the given position with a learned size. It always sits at index 0.

use anyhow::Result;
use candle_core::{Module, Tensor, D};
use candle_nn::{Init, Linear, VarBuilder};

use crate::config::FourierConfig;
use crate::fourier::generate_fourier_features;
use crate::init::{normal_param, BERT_INIT_STD};
use crate::mask::PaddingMask;

pub const OBJECT_TYPE_ID: u32 = 0;
pub const ANCHOR_TYPE_ID: u32 = 1;

// ---------------------------------------------------------------------------
// SceneTokens
// ---------------------------------------------------------------------------

/// Parallel per-token sequences for one batch, before type embeddings are added.
pub struct SceneTokens {
    /// (B, M, H)
    pub feats: Tensor,
    pub padding: PaddingMask,
    /// (B, M, 6) center + size
    pub locs: Tensor,
    /// (B, M) u32
    pub type_ids: Tensor,
}

impl SceneTokens {
    /// Plain objects: every token gets type id 0.
    pub fn objects(feats: Tensor, padding: PaddingMask, locs: Tensor) -> Result<Self> {
        let (b, n, _) = feats.dims3()?;
        let type_ids = Tensor::full(OBJECT_TYPE_ID, (b, n), feats.device())?;
        Ok(Self {
            feats,
            padding,
            locs,
            type_ids,
        })
    }

    pub fn num_tokens(&self) -> Result<usize> {
        Ok(self.feats.dim(1)?)
    }

    /// Put `anchor` at index 0 of every sequence.
    pub fn with_anchor(self, anchor: AnchorToken) -> Result<Self> {
        Ok(Self {
            feats: Tensor::cat(&[&anchor.feat, &self.feats], 1)?,
            padding: self.padding.with_leading_valid(1)?,
            locs: Tensor::cat(&[&anchor.loc, &self.locs], 1)?,
            type_ids: Tensor::cat(&[&anchor.type_ids, &self.type_ids], 1)?,
        })
    }
}

// ---------------------------------------------------------------------------
// AnchorFusion
// ---------------------------------------------------------------------------

/// One anchor per batch element.
pub struct AnchorToken {
    /// (B, 1, H)
    pub feat: Tensor,
    /// (B, 1, 6)
    pub loc: Tensor,
    /// (B, 1) u32, all ANCHOR_TYPE_ID
    pub type_ids: Tensor,
}

pub struct AnchorFusion {
    anchor_feat: Tensor,
    anchor_size: Tensor,
    orient_encoder: Linear,
    fourier: FourierConfig,
}

impl AnchorFusion {
    pub fn new(
        hidden_dim: usize,
        fourier_size: usize,
        fourier: FourierConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            anchor_feat: normal_param((1, 1, hidden_dim), "anchor_feat", BERT_INIT_STD, &vb)?,
            anchor_size: vb.get_with_hints((1, 1, 3), "anchor_size", Init::Const(1.0))?,
            orient_encoder: candle_nn::linear(fourier_size, hidden_dim, vb.pp("orient_encoder"))?,
            fourier,
        })
    }

    /// anchor_locs (B, 3), orientation (B, C) -> the anchor token.
    pub fn anchor_token(&self, anchor_locs: &Tensor, orientation: &Tensor) -> Result<AnchorToken> {
        let b = anchor_locs.dim(0)?;
        let orient = generate_fourier_features(&orientation.unsqueeze(1)?, &self.fourier)?;
        let feat = self
            .orient_encoder
            .forward(&orient)?
            .broadcast_add(&self.anchor_feat)?;

        let size = self.anchor_size.broadcast_as((b, 1, 3))?.contiguous()?;
        let loc = Tensor::cat(&[&anchor_locs.unsqueeze(1)?, &size], D::Minus1)?;

        let type_ids = Tensor::full(ANCHOR_TYPE_ID, (b, 1), anchor_locs.device())?;
        Ok(AnchorToken {
            feat,
            loc,
            type_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::ValidMask;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    fn fusion(varmap: &VarMap) -> Result<AnchorFusion> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        AnchorFusion::new(16, 63, FourierConfig::default(), vb.pp("anchor"))
    }

    #[test]
    fn test_anchor_token_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let f = fusion(&varmap)?;
        let locs = Tensor::randn(0f32, 1.0, (2, 3), &device)?;
        let orient = Tensor::randn(0f32, 1.0, (2, 3), &device)?;
        let a = f.anchor_token(&locs, &orient)?;
        assert_eq!(a.feat.dims3()?, (2, 1, 16));
        assert_eq!(a.loc.dims3()?, (2, 1, 6));
        assert_eq!(a.type_ids.to_vec2::<u32>()?, vec![vec![1], vec![1]]);
        Ok(())
    }

    #[test]
    fn test_anchor_loc_uses_learned_size() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let f = fusion(&varmap)?;
        let locs = Tensor::new(&[[1.0f32, 2.0, 3.0]], &device)?;
        let orient = Tensor::zeros((1, 3), DType::F32, &device)?;
        let a = f.anchor_token(&locs, &orient)?;
        let loc = a.loc.i((0, 0))?.to_vec1::<f32>()?;
        assert_eq!(loc, vec![1.0, 2.0, 3.0, 1.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_prepend_anchor() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let f = fusion(&varmap)?;
        let feats = Tensor::randn(0f32, 1.0, (2, 4, 16), &device)?;
        let locs = Tensor::randn(0f32, 1.0, (2, 4, 6), &device)?;
        let padding = ValidMask::new(&Tensor::zeros((2, 4), DType::U8, &device)?)?.to_padding()?;
        let scene = SceneTokens::objects(feats, padding, locs)?;
        let anchor = f.anchor_token(
            &Tensor::randn(0f32, 1.0, (2, 3), &device)?,
            &Tensor::randn(0f32, 1.0, (2, 3), &device)?,
        )?;
        let anchor_feat = anchor.feat.clone();
        let scene = scene.with_anchor(anchor)?;

        assert_eq!(scene.num_tokens()?, 5);
        assert_eq!(scene.locs.dims3()?, (2, 5, 6));
        assert_eq!(
            scene.type_ids.to_vec2::<u32>()?,
            vec![vec![1, 0, 0, 0, 0], vec![1, 0, 0, 0, 0]]
        );
        // anchor stays valid even when every object is padding
        let valid = scene.padding.to_valid()?.into_tensor().to_vec2::<u8>()?;
        assert_eq!(valid[0], vec![1, 0, 0, 0, 0]);
        let head = scene.feats.narrow(1, 0, 1)?;
        let diff = (head - anchor_feat)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
