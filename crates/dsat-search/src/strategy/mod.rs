//! Batch size search strategies and the helpers they share.

mod asha;
mod binary;
mod random;

pub use asha::AshaStrategy;
pub use binary::BinaryStrategy;
pub use random::RandomStrategy;

use dsat_types::hparams::{
    apply_overrides, random_zero_optim_config, set_micro_batch_size, ZERO_OPTIMIZATION_KEY,
};
use dsat_types::{DsatError, DsatResult, HParams, SearchMethodConfig};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;
use std::collections::BTreeSet;

use crate::method::{SearchContext, SearchStrategy};
use crate::trial::{SearchData, Trial, TrialId};

/// Build the strategy described by `config`.
pub fn from_config(config: &SearchMethodConfig) -> Box<dyn SearchStrategy> {
    match config {
        SearchMethodConfig::Random {
            trials_per_random_config,
            early_stopping,
        } => Box::new(RandomStrategy::new(*trials_per_random_config, *early_stopping)),
        SearchMethodConfig::Binary {
            search_range_factor,
        } => Box::new(BinaryStrategy::new(*search_range_factor)),
        SearchMethodConfig::Asha {
            max_resource,
            min_resource,
            early_stopping_rate,
            divisor,
            search_range_factor,
        } => Box::new(AshaStrategy::new(
            *max_resource,
            *min_resource,
            *early_stopping_rate,
            *divisor,
            *search_range_factor,
        )),
    }
}

/// How many lineages to start once profiling is done.
pub(crate) fn initial_trial_count(ctx: &SearchContext) -> usize {
    let tracker = &ctx.tracker;
    tracker
        .config()
        .concurrent_trial_capacity(tracker.slots_per_trial())
}

pub(crate) fn choose_stage<R: Rng + ?Sized>(stages: &BTreeSet<u8>, rng: &mut R) -> DsatResult<u8> {
    let stages: Vec<u8> = stages.iter().copied().collect();
    stages
        .choose(rng)
        .copied()
        .ok_or_else(|| DsatError::config("no zero stages to choose from"))
}

/// Base hyperparameters with a freshly sampled `zero_optimization` section for `stage`.
pub(crate) fn random_zero_hparams(ctx: &mut SearchContext, stage: u8) -> DsatResult<HParams> {
    let zero_config = random_zero_optim_config(stage, &mut ctx.rng);
    let mut hparams = ctx.tracker.base_hparams().clone();
    apply_overrides(&mut hparams, &json!({ ZERO_OPTIMIZATION_KEY: zero_config }))?;
    Ok(hparams)
}

/// Ceiling for a fresh lineage: the memory estimate scaled by `factor`, at least 1.
pub(crate) fn scaled_ceiling(ctx: &SearchContext, stage: u8, factor: f64) -> DsatResult<u64> {
    let approx = ctx.tracker.approx_max_mbs(stage)?;
    Ok(((approx as f64 * factor) as u64).max(1))
}

/// A new lineage root probing `mbs` within `data`.
pub(crate) fn root_trial(
    ctx: &SearchContext,
    mut hparams: HParams,
    data: SearchData,
    mbs: u64,
) -> DsatResult<Trial> {
    set_micro_batch_size(&mut hparams, mbs)?;
    ctx.tracker.create_trial(hparams, Some(data), None)
}

/// A child of `parent` probing `mbs` within `data`, otherwise identical to its parent.
pub(crate) fn child_trial(
    ctx: &SearchContext,
    parent: TrialId,
    data: SearchData,
    mbs: u64,
) -> DsatResult<Trial> {
    let mut hparams = ctx.tracker.get(parent)?.hparams.clone();
    set_micro_batch_size(&mut hparams, mbs)?;
    ctx.tracker.create_trial(hparams, Some(data), Some(parent))
}

/// Bounds for the next trial in the lineage of `id`. Any completed validation counts as
/// a success, whatever metrics it reported.
pub(crate) fn next_search_data(
    ctx: &SearchContext,
    id: TrialId,
    succeeded: bool,
) -> DsatResult<Option<SearchData>> {
    let trial = ctx.tracker.get(id)?;
    Ok(trial
        .search_data
        .map(|data| data.narrowed(trial.mbs, succeeded)))
}
