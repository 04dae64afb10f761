//! # dsat-search
//!
//! Adaptive search over DeepSpeed ZeRO stages and micro batch sizes.
//!
//! A single profiling trial measures the model's memory footprint; every later trial
//! is a DeepSpeed configuration whose batch size is searched within bounds derived from
//! that profile. The random, binary and ASHA strategies decide which configurations to
//! try next, and [`DsatSearchMethod`] adapts them to the event-driven searcher protocol.

mod checkpoint;
mod memory;
mod method;
mod strategy;
mod submit;
mod tracker;
mod trial;

#[cfg(test)]
mod test_support;

pub use checkpoint::{
    load_method_state, save_method_state, write_best_artifacts, BEST_DS_CONFIG_FILE,
    BEST_DS_METRICS_FILE, RNG_CHECKPOINT_FILE, TRACKER_CHECKPOINT_FILE,
};
pub use memory::{MemoryModel, ModelProfileInfo};
pub use method::{DsatSearchMethod, SearchContext, SearchStrategy};
pub use strategy::{from_config, AshaStrategy, BinaryStrategy, RandomStrategy};
pub use submit::{best_experiment_config, ExperimentSubmitter, JsonFileSubmitter};
pub use tracker::TrialTracker;
pub use trial::{SearchData, Trial, TrialId, TrialKind};
