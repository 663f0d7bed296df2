#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod error;
pub mod config;
pub mod activation;
pub mod init;
pub mod mask;
pub mod fourier;
pub mod attention;
pub mod cross_attention;
pub mod pairwise;
pub mod transformer;
pub mod location;
pub mod anchor;
pub mod backbone;
pub mod ose3d;
pub mod registry;
