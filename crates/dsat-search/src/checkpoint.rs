//! Persisting and restoring search state between searcher restarts.

use dsat_types::hparams::AUTOTUNING_KEY;
use dsat_types::DsatResult;
use rand_chacha::ChaCha8Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::method::SearchContext;
use crate::tracker::TrialTracker;

pub const TRACKER_CHECKPOINT_FILE: &str = "trial_tracker.json";
pub const RNG_CHECKPOINT_FILE: &str = "rng_state.json";
pub const BEST_DS_CONFIG_FILE: &str = "best_ds_config.json";
pub const BEST_DS_METRICS_FILE: &str = "best_ds_metrics.json";

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> DsatResult<()> {
    fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> DsatResult<T> {
    let raw = fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Write the tracker and RNG state into `dir`, plus the best configuration found so far.
pub fn save_method_state(ctx: &SearchContext, dir: &Path) -> DsatResult<()> {
    fs::create_dir_all(dir)?;
    write_json(&dir.join(TRACKER_CHECKPOINT_FILE), &ctx.tracker)?;
    write_json(&dir.join(RNG_CHECKPOINT_FILE), &ctx.rng)?;
    write_best_artifacts(&ctx.tracker, dir)?;
    debug!(dir = %dir.display(), trials = ctx.tracker.len(), "saved searcher state");
    Ok(())
}

pub fn load_method_state(dir: &Path) -> DsatResult<SearchContext> {
    let tracker: TrialTracker = read_json(&dir.join(TRACKER_CHECKPOINT_FILE))?;
    let rng: ChaCha8Rng = read_json(&dir.join(RNG_CHECKPOINT_FILE))?;
    Ok(SearchContext { tracker, rng })
}

/// The best trial's effective DeepSpeed config and metrics, if there is a best trial.
pub fn write_best_artifacts(tracker: &TrialTracker, dir: &Path) -> DsatResult<()> {
    let Some(best_id) = tracker.best_trial() else {
        return Ok(());
    };
    let best = tracker.get(best_id)?;

    let mut ds_config = best.ds_config.clone();
    if let Value::Object(map) = &mut ds_config {
        map.remove(AUTOTUNING_KEY);
    }
    write_json(&dir.join(BEST_DS_CONFIG_FILE), &ds_config)?;
    write_json(&dir.join(BEST_DS_METRICS_FILE), &best.metric)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::RandomStrategy;
    use crate::test_support::{metric, resolved_context, search_config};
    use dsat_types::Metrics;
    use rand::RngCore;

    #[test]
    fn round_trip_preserves_tracker_and_rng() {
        let mut ctx = resolved_context(search_config());
        let strategy = RandomStrategy::new(5, None);
        for _ in 0..3 {
            let trial = strategy.random_trial(&mut ctx).unwrap();
            ctx.tracker.queue_and_register_trial(trial).unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        save_method_state(&ctx, dir.path()).unwrap();
        let mut restored = load_method_state(dir.path()).unwrap();

        assert_eq!(restored.tracker.len(), ctx.tracker.len());
        let queued = |c: &SearchContext| {
            c.tracker
                .queued()
                .map(|trial| trial.hparams.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(queued(&restored), queued(&ctx));
        assert_eq!(restored.rng.next_u64(), ctx.rng.next_u64());
        assert!(!dir.path().join(BEST_DS_CONFIG_FILE).exists());
    }

    #[test]
    fn best_artifacts_strip_autotuning() {
        let mut ctx = resolved_context(search_config());
        let strategy = RandomStrategy::new(5, None);
        let trial = strategy.random_trial(&mut ctx).unwrap();
        let id = trial.request_id;
        ctx.tracker.queue_and_register_trial(trial).unwrap();
        ctx.tracker
            .update_trial_metric(id, metric("throughput", 12.5))
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        save_method_state(&ctx, dir.path()).unwrap();

        let ds_config: Value = read_json(&dir.path().join(BEST_DS_CONFIG_FILE)).unwrap();
        assert!(ds_config.get(AUTOTUNING_KEY).is_none());
        assert!(ds_config.get("train_micro_batch_size_per_gpu").is_some());

        let metrics: Metrics = read_json(&dir.path().join(BEST_DS_METRICS_FILE)).unwrap();
        assert_eq!(metrics["throughput"], 12.5);
    }

    #[test]
    fn missing_checkpoint_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_method_state(dir.path()),
            Err(dsat_types::DsatError::Io(_))
        ));
    }
}
