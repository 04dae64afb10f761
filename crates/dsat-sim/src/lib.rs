//! # dsat-sim
//!
//! A reference driver for the autotuning search. [`SimulatedCluster`] stands in for real
//! accelerators with a closed-form memory and step time model, and [`SimulationDriver`]
//! plays the orchestration runtime: it executes the operations a search method emits,
//! completes trials in a seeded interleaved order and checks the concurrency limits after
//! every operation.

mod cluster;
mod config;
mod driver;

pub use cluster::{ClusterConfig, SimulatedCluster, TrialOutcome};
pub use config::SimulationConfig;
pub use driver::{DriverLimits, SimEvent, SimulationDriver, SimulationReport};
