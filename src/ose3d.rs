// OSE3D: object-centric scene encoder with an optional embodied anchor token.
//
// Pipeline: point backbone -> projection -> type embeddings (+ anchor at index 0)
// -> L x [location bias -> cross-attention -> spatial self-attention].
// The refined query stream is internal; callers get the fused features back as
// obj_tokens together with the augmented validity mask.

use anyhow::Result;
use candle_core::{Device, Module, Tensor, D};
use candle_nn::{Embedding, Linear, VarBuilder};
use tracing::{debug, info};

use crate::anchor::{AnchorFusion, SceneTokens};
use crate::backbone::PointBackbone;
use crate::config::Ose3dConfig;
use crate::cross_attention::{CrossAttentionConfig, CrossAttentionLayer};
use crate::error::FusionError;
use crate::location::LocationEmbeddings;
use crate::mask::{PaddingMask, ValidMask};
use crate::pairwise::calc_pairwise_locs;
use crate::registry::build_backbone;
use crate::transformer::SpatialLayer;

// ---------------------------------------------------------------------------
// Call contract
// ---------------------------------------------------------------------------

/// Inputs of one forward call. `forward` hands the same struct back with
/// `obj_tokens` filled and `obj_masks` replaced by the augmented mask.
#[derive(Debug, Clone)]
pub struct SceneBatch {
    /// (B, N, P, 6) xyz + rgb
    pub obj_fts: Tensor,
    /// (B, N), nonzero = valid
    pub obj_masks: Tensor,
    /// (B, N, 6) center + size
    pub obj_locs: Tensor,
    /// (B, 3), required with the embodied token
    pub anchor_locs: Option<Tensor>,
    /// (B, C), required with the embodied token
    pub anchor_orientation: Option<Tensor>,
    /// (B, M, H), set by the encoder
    pub obj_tokens: Option<Tensor>,
}

impl SceneBatch {
    pub fn new(obj_fts: Tensor, obj_masks: Tensor, obj_locs: Tensor) -> Self {
        Self {
            obj_fts,
            obj_masks,
            obj_locs,
            anchor_locs: None,
            anchor_orientation: None,
            obj_tokens: None,
        }
    }

    pub fn with_anchor(mut self, anchor_locs: Tensor, anchor_orientation: Tensor) -> Self {
        self.anchor_locs = Some(anchor_locs);
        self.anchor_orientation = Some(anchor_orientation);
        self
    }
}

/// Type-embedded token sequence, anchor included when enabled.
pub struct FusedScene {
    /// (B, M, H)
    pub feats: Tensor,
    pub padding: PaddingMask,
    /// (B, M, 6)
    pub locs: Tensor,
}

/// A named 3D scene encoder that can be built from the registry.
pub trait SceneEncoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn forward(&self, batch: SceneBatch, train: bool) -> Result<SceneBatch>;
}

// ---------------------------------------------------------------------------
// Ose3d
// ---------------------------------------------------------------------------

pub struct Ose3d {
    backbone: Box<dyn PointBackbone>,
    obj_proj: Linear,
    anchor: Option<AnchorFusion>,
    obj_type_embed: Embedding,
    cross: Vec<CrossAttentionLayer>,
    spatial: Vec<SpatialLayer>,
    loc_layers: LocationEmbeddings,
    cfg: Ose3dConfig,
}

impl Ose3d {
    pub const NAME: &'static str = "OSE3D";

    /// Build with the backbone named in `cfg.backbone`.
    pub fn new(cfg: &Ose3dConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let backbone = build_backbone(&cfg.backbone, vb.pp("obj_encoder"))?;
        Self::with_backbone(cfg, backbone, vb)
    }

    pub fn with_backbone(
        cfg: &Ose3dConfig,
        backbone: Box<dyn PointBackbone>,
        vb: VarBuilder,
    ) -> Result<Self> {
        cfg.validate()?;
        let hidden = cfg.hidden_dim;
        let se = &cfg.spatial_encoder;

        let obj_proj = candle_nn::linear(backbone.out_dim(), hidden, vb.pp("obj_proj"))?;
        let anchor = if cfg.use_embodied_token {
            Some(AnchorFusion::new(
                hidden,
                cfg.fourier_size,
                cfg.fourier.clone(),
                vb.clone(),
            )?)
        } else {
            None
        };
        let obj_type_embed = candle_nn::embedding(2, hidden, vb.pp("obj_type_embed"))?;

        let cross_cfg = CrossAttentionConfig::new(hidden, se.num_attention_heads, se.dropout);
        let cross = (0..se.num_layers)
            .map(|i| CrossAttentionLayer::new(&cross_cfg, vb.pp(format!("query_cross_encoder.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let spatial = (0..se.num_layers)
            .map(|i| {
                SpatialLayer::new(
                    cfg.use_spatial_attn,
                    hidden,
                    se,
                    vb.pp(format!("spatial_encoder.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let loc_layers = LocationEmbeddings::new(
            se.obj_loc_encoding,
            se.num_layers,
            se.dim_loc,
            hidden,
            vb.pp("loc_layers"),
        )?;

        info!(
            module = Self::NAME,
            hidden_dim = hidden,
            num_layers = se.num_layers,
            obj_loc_encoding = %se.obj_loc_encoding,
            spatial_attn = cfg.use_spatial_attn,
            embodied_token = cfg.use_embodied_token,
            "built 3D module"
        );

        Ok(Self {
            backbone,
            obj_proj,
            anchor,
            obj_type_embed,
            cross,
            spatial,
            loc_layers,
            cfg: cfg.clone(),
        })
    }

    pub fn config(&self) -> &Ose3dConfig {
        &self.cfg
    }

    pub fn device(&self) -> &Device {
        self.obj_type_embed.embeddings().device()
    }

    pub fn num_loc_layers(&self) -> usize {
        self.loc_layers.len()
    }

    /// Object features plus the optional anchor token, with type embeddings added.
    pub fn fuse_scene(&self, batch: &SceneBatch, train: bool) -> Result<FusedScene> {
        let feats = self.backbone.forward(&batch.obj_fts, train)?;
        let feats = self.obj_proj.forward(&feats)?;
        let padding = ValidMask::new(&batch.obj_masks)?.to_padding()?;

        let mut tokens = SceneTokens::objects(feats, padding, batch.obj_locs.clone())?;
        if let Some(anchor) = &self.anchor {
            let locs = batch
                .anchor_locs
                .as_ref()
                .ok_or(FusionError::MissingInput("anchor_locs"))?;
            let orientation = batch
                .anchor_orientation
                .as_ref()
                .ok_or(FusionError::MissingInput("anchor_orientation"))?;
            tokens = tokens.with_anchor(anchor.anchor_token(locs, orientation)?)?;
        }

        let type_embeds = self.obj_type_embed.forward(&tokens.type_ids)?;
        Ok(FusedScene {
            feats: (tokens.feats + type_embeds)?,
            padding: tokens.padding,
            locs: tokens.locs,
        })
    }

    /// Run the interleaved cross/self-attention stack; returns the query (B, M, H).
    pub fn refine_queries(&self, scene: &FusedScene, train: bool) -> Result<Tensor> {
        let se = &self.cfg.spatial_encoder;
        let pairwise = if self.cfg.use_spatial_attn {
            Some(calc_pairwise_locs(
                &scene.locs.narrow(D::Minus1, 0, 3)?,
                &scene.locs.narrow(D::Minus1, 3, 3)?,
                se.pairwise_rel_type,
                se.spatial_dist_norm,
                se.spatial_dim,
            )?)
        } else {
            None
        };
        let padding = scene.padding.as_tensor();

        let mut query = scene.feats.zeros_like()?;
        for (i, (cross, spatial)) in self.cross.iter().zip(&self.spatial).enumerate() {
            let loc = self.loc_layers.for_layer(i)?.forward(&scene.locs)?;
            query = (cross.forward(
                &query,
                &scene.feats,
                None,
                Some(padding),
                Some(&loc),
                Some(&loc),
                train,
            )? + &loc)?;
            let (refined, _) = spatial.forward(&query, pairwise.as_ref(), Some(padding), train)?;
            query = refined;
        }
        Ok(query)
    }

    pub fn forward(&self, batch: SceneBatch, train: bool) -> Result<SceneBatch> {
        let scene = self.fuse_scene(&batch, train)?;
        let (b, m, _) = scene.feats.dims3()?;
        debug!(batch = b, tokens = m, train, "OSE3D forward");

        self.refine_queries(&scene, train)?;

        Ok(SceneBatch {
            obj_masks: scene.padding.to_valid()?.into_tensor(),
            obj_tokens: Some(scene.feats),
            ..batch
        })
    }
}

impl SceneEncoder for Ose3d {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn forward(&self, batch: SceneBatch, train: bool) -> Result<SceneBatch> {
        Ose3d::forward(self, batch, train)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
