// Location embeddings: raw (center, size) boxes -> hidden-dim position bias,
// shared across layers or one per layer depending on the policy.

use anyhow::{anyhow, Result};
use candle_core::{Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use crate::config::LocEncoding;
use crate::error::ConfigError;
use crate::init::{bert_linear, layer_norm};

/// Linear + LayerNorm projection of a (B, M, dim_loc) location tensor.
pub struct LocationEmbedding {
    proj: Linear,
    norm: LayerNorm,
}

impl LocationEmbedding {
    pub fn new(dim_loc: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj: bert_linear(dim_loc, hidden_dim, vb.pp("0"))?,
            norm: layer_norm(hidden_dim, vb.pp("1"))?,
        })
    }

    pub fn forward(&self, locs: &Tensor) -> Result<Tensor> {
        self.norm
            .forward(&self.proj.forward(locs)?)
            .map_err(Into::into)
    }
}

/// The set of location embeddings a policy owns.
pub enum LocationEmbeddings {
    /// `same_0` / `same_all`: one instance reused at every layer.
    Shared(LocationEmbedding),
    /// `diff_all`: instance i serves layer i.
    PerLayer(Vec<LocationEmbedding>),
}

impl LocationEmbeddings {
    /// Build the instances `policy` needs for `num_layers` layers.
    pub fn new(
        policy: LocEncoding,
        num_layers: usize,
        dim_loc: usize,
        hidden_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let layers = (0..policy.num_instances(num_layers))
            .map(|i| LocationEmbedding::new(dim_loc, hidden_dim, vb.pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Self::from_layers(policy, layers, num_layers)
    }

    /// Wrap already-built instances, rejecting a count the policy does not allow.
    pub fn from_layers(
        policy: LocEncoding,
        mut layers: Vec<LocationEmbedding>,
        num_layers: usize,
    ) -> Result<Self> {
        let expected = policy.num_instances(num_layers);
        if layers.len() != expected {
            return Err(ConfigError::LocLayerCount {
                policy: policy.to_string(),
                expected,
                actual: layers.len(),
            }
            .into());
        }
        match policy {
            LocEncoding::Same0 | LocEncoding::SameAll => layers
                .pop()
                .map(Self::Shared)
                .ok_or_else(|| anyhow!("shared location embedding missing")),
            LocEncoding::DiffAll => Ok(Self::PerLayer(layers)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Shared(_) => 1,
            Self::PerLayer(layers) => layers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The embedding serving layer `i`. Shared instances serve any index.
    pub fn for_layer(&self, i: usize) -> Result<&LocationEmbedding> {
        match self {
            Self::Shared(layer) => Ok(layer),
            Self::PerLayer(layers) => layers.get(i).ok_or_else(|| {
                anyhow!("no location embedding for layer {i} ({} per-layer instances)", layers.len())
            }),
        }
    }
}
