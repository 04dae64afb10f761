use dsat_types::{DsatResult, ExitedReason};
use std::cmp::Ordering;
use tracing::debug;

use super::{
    child_trial, choose_stage, initial_trial_count, next_search_data, random_zero_hparams,
    root_trial, scaled_ceiling,
};
use crate::method::{SearchContext, SearchStrategy};
use crate::trial::{SearchData, Trial, TrialId};

/// Asynchronous successive halving where the resource spent on a configuration is the
/// number of bisection trials run for it.
///
/// Every lineage starts in rung 0. A lineage that finished its rung and ranks in the top
/// `1 / divisor` of that rung is promoted and keeps bisecting with a larger trial budget.
#[derive(Debug, Clone)]
pub struct AshaStrategy {
    max_resource: usize,
    min_resource: usize,
    early_stopping_rate: u32,
    divisor: usize,
    search_range_factor: f64,
}

impl AshaStrategy {
    pub fn new(
        max_resource: usize,
        min_resource: usize,
        early_stopping_rate: u32,
        divisor: usize,
        search_range_factor: f64,
    ) -> Self {
        Self {
            max_resource,
            min_resource,
            early_stopping_rate,
            divisor,
            search_range_factor,
        }
    }

    /// Number of rungs: the largest `k` with `r * eta^k <= R`, at least one.
    pub fn max_rungs(&self) -> usize {
        let mut rungs = 0;
        let mut budget = self.min_resource;
        while let Some(next) = budget.checked_mul(self.divisor) {
            if next > self.max_resource {
                break;
            }
            budget = next;
            rungs += 1;
        }
        rungs.max(1)
    }

    /// Completed trials a lineage needs before rung `rung` counts as done.
    pub fn max_trials_for_rung(&self, rung: usize) -> usize {
        let exponent = self.early_stopping_rate.saturating_add(rung as u32);
        self.divisor
            .checked_pow(exponent)
            .and_then(|scale| scale.checked_mul(self.min_resource))
            .unwrap_or(usize::MAX)
    }

    fn curr_rung(ctx: &SearchContext, id: TrialId) -> DsatResult<usize> {
        Ok(ctx
            .tracker
            .get(id)?
            .search_data
            .and_then(|data| data.curr_rung())
            .unwrap_or(0))
    }

    /// Bounds after the completed trial `latest`, which succeeded unless it errored.
    fn continuation(ctx: &SearchContext, latest: TrialId) -> DsatResult<Option<SearchData>> {
        let succeeded = !ctx.tracker.get(latest)?.error;
        next_search_data(ctx, latest, succeeded)
    }

    /// Whether the lineage can still continue from its latest trial.
    fn exhausted(ctx: &SearchContext, latest: TrialId) -> DsatResult<bool> {
        if !ctx.tracker.get(latest)?.completed() {
            return Ok(false);
        }
        Ok(Self::continuation(ctx, latest)?.map_or(true, |data| data.is_empty()))
    }

    /// A lineage has completed `rung` once it was promoted past it, once it spent the
    /// rung's trial budget, or once its search in that rung ran out of batch sizes.
    pub fn lineage_completed_rung(
        &self,
        ctx: &SearchContext,
        id: TrialId,
        rung: usize,
    ) -> DsatResult<bool> {
        let latest = ctx.tracker.latest_trial_in_lineage(id)?;
        let curr_rung = Self::curr_rung(ctx, latest)?;
        if curr_rung > rung {
            return Ok(true);
        }
        if ctx.tracker.num_completed_trials_in_lineage(id)? >= self.max_trials_for_rung(rung) {
            return Ok(true);
        }
        Ok(curr_rung == rung && Self::exhausted(ctx, latest)?)
    }

    /// Latest trial of every lineage, in registration order.
    fn latest_trials(ctx: &SearchContext) -> Vec<TrialId> {
        ctx.tracker
            .iter()
            .filter(|trial| {
                !trial.is_model_profile_info()
                    && trial.children.is_empty()
                    && trial.search_data.and_then(|data| data.curr_rung()).is_some()
            })
            .map(|trial| trial.request_id)
            .collect()
    }

    /// For each rung, the latest trials of the lineages that completed it.
    pub fn rungs(&self, ctx: &SearchContext) -> DsatResult<Vec<Vec<TrialId>>> {
        let max_rungs = self.max_rungs();
        let mut rungs = vec![Vec::new(); max_rungs];
        for latest in Self::latest_trials(ctx) {
            let mut rung = 0;
            while rung < max_rungs && self.lineage_completed_rung(ctx, latest, rung)? {
                rungs[rung].push(latest);
                rung += 1;
            }
        }
        Ok(rungs)
    }

    fn best_metric_in_lineage(ctx: &SearchContext, id: TrialId) -> DsatResult<Option<f64>> {
        let direction = ctx.tracker.config().direction;
        let mut best: Option<f64> = None;
        for member in ctx.tracker.lineage_set(id)? {
            if let Some(value) = ctx.tracker.metric_value(member)? {
                if best.map_or(true, |incumbent| direction.improves(value, incumbent)) {
                    best = Some(value);
                }
            }
        }
        Ok(best)
    }

    /// The top `1 / divisor` of `completed` ranked by each lineage's best metric.
    pub fn top_lineages(
        &self,
        ctx: &SearchContext,
        completed: &[TrialId],
    ) -> DsatResult<Vec<TrialId>> {
        let keep = completed.len() / self.divisor;
        if keep == 0 {
            return Ok(Vec::new());
        }
        let direction = ctx.tracker.config().direction;
        let mut ranked = Vec::with_capacity(completed.len());
        for id in completed {
            ranked.push((*id, Self::best_metric_in_lineage(ctx, *id)?));
        }
        ranked.sort_by(|(_, a), (_, b)| match (a, b) {
            (Some(a), Some(b)) => {
                if direction.improves(*a, *b) {
                    Ordering::Less
                } else if direction.improves(*b, *a) {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        Ok(ranked.into_iter().take(keep).map(|(id, _)| id).collect())
    }

    /// Latest trial of the best lineage that may be promoted, searching from the highest
    /// promotable rung down. Lineages that cannot continue are skipped.
    pub fn next_promotable_lineage(&self, ctx: &SearchContext) -> DsatResult<Option<TrialId>> {
        let rungs = self.rungs(ctx)?;
        for rung in (0..self.max_rungs().saturating_sub(1)).rev() {
            for id in self.top_lineages(ctx, &rungs[rung])? {
                let latest = ctx.tracker.latest_trial_in_lineage(id)?;
                if Self::curr_rung(ctx, latest)? > rung {
                    continue;
                }
                if !Self::exhausted(ctx, latest)? && ctx.tracker.get(latest)?.completed() {
                    return Ok(Some(latest));
                }
            }
        }
        Ok(None)
    }

    /// Bisection step continuing the lineage of `id`, if its interval allows one.
    fn next_trial_in_lineage(&self, ctx: &SearchContext, id: TrialId) -> DsatResult<Option<Trial>> {
        let latest = ctx.tracker.latest_trial_in_lineage(id)?;
        if !ctx.tracker.get(latest)?.completed() {
            return Ok(None);
        }
        match Self::continuation(ctx, latest)? {
            Some(data) if !data.is_empty() => {
                child_trial(ctx, latest, data, data.midpoint()).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Continue the current rung, else promote, else start a new lineage.
    pub fn next_trial(&self, ctx: &mut SearchContext, last: TrialId) -> DsatResult<Trial> {
        let rung = Self::curr_rung(ctx, last)?;
        if !self.lineage_completed_rung(ctx, last, rung)? {
            if let Some(trial) = self.next_trial_in_lineage(ctx, last)? {
                return Ok(trial);
            }
        }

        if let Some(lineage) = self.next_promotable_lineage(ctx)? {
            ctx.tracker.promote_lineage(lineage)?;
            if let Some(trial) = self.next_trial_in_lineage(ctx, lineage)? {
                let rung = Self::curr_rung(ctx, lineage)?;
                debug!(trial_id = %lineage, rung = rung, "promoted lineage");
                return Ok(trial);
            }
        }

        self.random_trial(ctx)
    }

    pub fn random_trial(&self, ctx: &mut SearchContext) -> DsatResult<Trial> {
        let stages = ctx.tracker.config().zero_stages.clone();
        let stage = choose_stage(&stages, &mut ctx.rng)?;
        let hparams = random_zero_hparams(ctx, stage)?;
        let hi = scaled_ceiling(ctx, stage, self.search_range_factor)?;
        let data = SearchData::rung(1, hi, 0);
        root_trial(ctx, hparams, data, data.midpoint())
    }
}

impl SearchStrategy for AshaStrategy {
    fn name(&self) -> &str {
        "asha"
    }

    fn trials_after_validation_completed(
        &self,
        ctx: &mut SearchContext,
        last: TrialId,
    ) -> DsatResult<Vec<Trial>> {
        if ctx.tracker.get(last)?.is_model_profile_info() {
            let count = initial_trial_count(ctx).min(ctx.tracker.config().max_trials);
            return (0..count).map(|_| self.random_trial(ctx)).collect();
        }
        Ok(vec![self.next_trial(ctx, last)?])
    }

    fn trials_after_early_exit(
        &self,
        ctx: &mut SearchContext,
        last: TrialId,
        _reason: ExitedReason,
    ) -> DsatResult<Vec<Trial>> {
        Ok(vec![self.next_trial(ctx, last)?])
    }

    /// Highest rung first, then the lineage with the most completed trials.
    fn choose_next_trial_from_queue(&self, ctx: &mut SearchContext) -> DsatResult<Option<TrialId>> {
        let mut best: Option<(TrialId, (usize, usize))> = None;
        for trial in ctx.tracker.queued() {
            let rung = trial.search_data.and_then(|data| data.curr_rung()).unwrap_or(0);
            let completed = ctx
                .tracker
                .num_completed_trials_in_lineage(trial.request_id)?;
            let key = (rung, completed);
            if best.map_or(true, |(_, best_key)| key > best_key) {
                best = Some((trial.request_id, key));
            }
        }
        Ok(best.map(|(id, _)| {
            ctx.tracker.remove_from_queue(id);
            id
        }))
    }
}
