// Typed failures for model construction and forward inputs.
//
// Public functions return anyhow::Result; these enums are the causes callers
// can downcast to when they need to tell a bad config from a bad batch.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("activation function currently supports relu/gelu/glu, not {0}")]
    UnsupportedActivation(String),

    #[error("unknown obj_loc_encoding '{0}' (expected same_0, same_all or diff_all)")]
    UnsupportedLocEncoding(String),

    #[error("unknown pairwise_rel_type '{0}' (expected center, vertical_bottom or mlp)")]
    UnsupportedRelType(String),

    #[error("unknown spatial_attn_fusion '{0}' (expected mul, bias or add)")]
    UnsupportedFusion(String),

    #[error("obj_loc_encoding {policy} needs {expected} location layers, got {actual}")]
    LocLayerCount {
        policy: String,
        expected: usize,
        actual: usize,
    },

    #[error("no {kind} registered under '{name}'")]
    UnknownModule { kind: &'static str, name: String },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum FusionError {
    #[error("embodied token is enabled but the batch has no {0}")]
    MissingInput(&'static str),
}
