//! # dsat-types
//!
//! Shared vocabulary for DeepSpeed autotuning search: configuration, the driver
//! protocol, DeepSpeed hyperparameter helpers and the error taxonomy.

pub mod config;
pub mod errors;
pub mod hparams;
pub mod searcher;

pub use config::*;
pub use errors::*;
pub use hparams::HParams;
pub use searcher::*;
