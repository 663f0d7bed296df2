// Model configuration: serde structs, TOML loading, validation.
//
// Every struct carries #[serde(default)] so a TOML file only has to name the
// fields it changes. Enum-valued options are parsed from their string names and
// unknown names are rejected with a ConfigError.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Location encoding policy
// ---------------------------------------------------------------------------

/// How per-object locations become a hidden-dim bias at each layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum LocEncoding {
    #[serde(rename = "same_0")]
    Same0,
    #[serde(rename = "same_all")]
    SameAll,
    #[serde(rename = "diff_all")]
    DiffAll,
}

impl LocEncoding {
    /// Number of location embedding instances this policy owns.
    pub fn num_instances(&self, num_layers: usize) -> usize {
        match self {
            Self::Same0 | Self::SameAll => 1,
            Self::DiffAll => num_layers,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Same0 => "same_0",
            Self::SameAll => "same_all",
            Self::DiffAll => "diff_all",
        }
    }
}

impl FromStr for LocEncoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "same_0" => Ok(Self::Same0),
            "same_all" => Ok(Self::SameAll),
            "diff_all" => Ok(Self::DiffAll),
            other => Err(ConfigError::UnsupportedLocEncoding(other.to_string())),
        }
    }
}

impl TryFrom<String> for LocEncoding {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for LocEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Pairwise relation type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum PairwiseRelType {
    /// Distance and direction angles between box centers.
    Center,
    /// Like `Center`, but elevation terms use box bottoms.
    VerticalBottom,
    /// Raw concatenation of both boxes, left to a learned projection.
    Mlp,
}

impl PairwiseRelType {
    /// Spatial feature widths this relation type can produce.
    pub fn supports_spatial_dim(&self, spatial_dim: usize) -> bool {
        match self {
            Self::Center | Self::VerticalBottom => matches!(spatial_dim, 1 | 4 | 5),
            Self::Mlp => spatial_dim == 12,
        }
    }
}

impl FromStr for PairwiseRelType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "center" => Ok(Self::Center),
            "vertical_bottom" => Ok(Self::VerticalBottom),
            "mlp" => Ok(Self::Mlp),
            other => Err(ConfigError::UnsupportedRelType(other.to_string())),
        }
    }
}

impl TryFrom<String> for PairwiseRelType {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ---------------------------------------------------------------------------
// Spatial attention fusion
// ---------------------------------------------------------------------------

/// How pairwise-location logits combine with content attention scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum SpatialAttnFusion {
    Mul,
    Bias,
    Add,
}

impl FromStr for SpatialAttnFusion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mul" => Ok(Self::Mul),
            "bias" => Ok(Self::Bias),
            "add" => Ok(Self::Add),
            other => Err(ConfigError::UnsupportedFusion(other.to_string())),
        }
    }
}

impl TryFrom<String> for SpatialAttnFusion {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FourierConfig {
    pub num_bands: usize,
    pub max_freq: f64,
    pub concat_pos: bool,
    pub sine_only: bool,
}

impl Default for FourierConfig {
    fn default() -> Self {
        Self {
            num_bands: 10,
            max_freq: 15.0,
            concat_pos: true,
            sine_only: false,
        }
    }
}

impl FourierConfig {
    /// Encoded width for an input of `in_dim` components.
    pub fn output_dim(&self, in_dim: usize) -> usize {
        let per_band = if self.sine_only { 1 } else { 2 };
        let raw = if self.concat_pos { in_dim } else { 0 };
        in_dim * self.num_bands * per_band + raw
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    pub name: String,
    /// Widths of the shared per-point MLP before the output layer.
    pub hidden_dims: Vec<usize>,
    pub out_dim: usize,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            name: "pointnet".to_string(),
            hidden_dims: vec![64, 128, 256],
            out_dim: 768,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialEncoderConfig {
    pub num_attention_heads: usize,
    pub dim_feedforward: usize,
    pub dropout: f64,
    pub activation: Activation,
    pub num_layers: usize,
    pub spatial_dim: usize,
    pub spatial_multihead: bool,
    pub spatial_attn_fusion: SpatialAttnFusion,
    pub pairwise_rel_type: PairwiseRelType,
    pub spatial_dist_norm: bool,
    pub obj_loc_encoding: LocEncoding,
    pub dim_loc: usize,
}

impl Default for SpatialEncoderConfig {
    fn default() -> Self {
        Self {
            num_attention_heads: 8,
            dim_feedforward: 2048,
            dropout: 0.1,
            activation: Activation::Gelu,
            num_layers: 3,
            spatial_dim: 5,
            spatial_multihead: true,
            spatial_attn_fusion: SpatialAttnFusion::Mul,
            pairwise_rel_type: PairwiseRelType::Center,
            spatial_dist_norm: true,
            obj_loc_encoding: LocEncoding::SameAll,
            dim_loc: 6,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ose3dConfig {
    pub use_spatial_attn: bool,
    pub use_embodied_token: bool,
    pub hidden_dim: usize,
    /// Width of the Fourier-encoded anchor orientation.
    pub fourier_size: usize,
    pub fourier: FourierConfig,
    pub backbone: BackboneConfig,
    pub spatial_encoder: SpatialEncoderConfig,
}

impl Default for Ose3dConfig {
    /// Quaternion orientation (4 components): 4 * 2 * 10 + 4 = 84 Fourier features.
    fn default() -> Self {
        Self {
            use_spatial_attn: true,
            use_embodied_token: true,
            hidden_dim: 256,
            fourier_size: 84,
            fourier: FourierConfig::default(),
            backbone: BackboneConfig::default(),
            spatial_encoder: SpatialEncoderConfig::default(),
        }
    }
}

impl Ose3dConfig {
    /// Small config for tests: d=64, 2 layers, 4 heads, 3-component orientation.
    pub fn tiny() -> Self {
        Self {
            use_spatial_attn: true,
            use_embodied_token: true,
            hidden_dim: 64,
            fourier_size: 63,
            fourier: FourierConfig::default(),
            backbone: BackboneConfig {
                name: "pointnet".to_string(),
                hidden_dims: vec![32],
                out_dim: 48,
            },
            spatial_encoder: SpatialEncoderConfig {
                num_attention_heads: 4,
                dim_feedforward: 128,
                dropout: 0.1,
                activation: Activation::Gelu,
                num_layers: 2,
                spatial_dim: 5,
                spatial_multihead: true,
                spatial_attn_fusion: SpatialAttnFusion::Mul,
                pairwise_rel_type: PairwiseRelType::Center,
                spatial_dist_norm: true,
                obj_loc_encoding: LocEncoding::Same0,
                dim_loc: 6,
            },
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s).map_err(ConfigError::from)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(Into::into)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.spatial_encoder.num_attention_heads
    }

    /// Checks every cross-field constraint the model builder relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let se = &self.spatial_encoder;
        if self.hidden_dim == 0 {
            return Err(invalid("hidden_dim", "must be positive".to_string()));
        }
        if se.num_attention_heads == 0 || self.hidden_dim % se.num_attention_heads != 0 {
            return Err(invalid(
                "num_attention_heads",
                format!(
                    "hidden_dim {} is not divisible by {} heads",
                    self.hidden_dim, se.num_attention_heads
                ),
            ));
        }
        if se.num_layers == 0 {
            return Err(invalid("num_layers", "need at least one layer".to_string()));
        }
        if se.dim_loc != 6 {
            return Err(invalid(
                "dim_loc",
                format!("locations are center + size (6), got {}", se.dim_loc),
            ));
        }
        if !se.pairwise_rel_type.supports_spatial_dim(se.spatial_dim) {
            return Err(invalid(
                "spatial_dim",
                format!(
                    "{} is not produced by pairwise_rel_type {:?}",
                    se.spatial_dim, se.pairwise_rel_type
                ),
            ));
        }
        if se.activation == Activation::Glu && se.dim_feedforward % 2 != 0 {
            return Err(invalid(
                "dim_feedforward",
                format!("glu needs an even width, got {}", se.dim_feedforward),
            ));
        }
        if !(0.0..1.0).contains(&se.dropout) {
            return Err(invalid("dropout", format!("{} is outside [0, 1)", se.dropout)));
        }
        if self.fourier.num_bands == 0 {
            return Err(invalid("fourier.num_bands", "must be positive".to_string()));
        }
        if self.backbone.out_dim == 0 {
            return Err(invalid("backbone.out_dim", "must be positive".to_string()));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
