//! Fixtures shared by the unit tests.

use dsat_types::{Metrics, SearchConfig, SearchMethodConfig};
use serde_json::{json, Value};

use crate::method::SearchContext;
use crate::tracker::TrialTracker;

/// Two-slot experiment with an inline fp32 DeepSpeed config.
pub fn exp_config() -> Value {
    json!({
        "resources": {"slots_per_trial": 2},
        "hyperparameters": {
            "deepspeed_config": {
                "train_micro_batch_size_per_gpu": 1,
                "optimizer": {"type": "Adam", "params": {"lr": 1e-4}},
            },
            "model_name": "gpt2",
        },
    })
}

pub fn search_config() -> SearchConfig {
    SearchConfig::new(SearchMethodConfig::random())
        .with_max_trials(32)
        .with_max_concurrent_trials(4)
}

/// Profiling results giving approximate max batch sizes 239/279/299/319 for stages 0..3
/// on two slots.
pub fn profile_metrics() -> Metrics {
    [
        ("num_params", 1_000_000.0),
        ("trainable_num_params", 1_000_000.0),
        ("activation_mem_per_gpu", 100_000.0),
        ("gpu_mem", 40_000_000.0),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect()
}

pub fn metric(name: &str, value: f64) -> Metrics {
    Metrics::from([(name.to_string(), value)])
}

/// A search context whose profiling trial has already reported [`profile_metrics`].
pub fn resolved_context(config: SearchConfig) -> SearchContext {
    let tracker = TrialTracker::new(config, &exp_config()).unwrap();
    let mut ctx = SearchContext::new(tracker, 7);
    let profile = ctx.tracker.create_model_profile_info_trial().unwrap();
    let id = profile.request_id;
    ctx.tracker.queue_and_register_trial(profile).unwrap();
    ctx.tracker.pop_queue_front();
    ctx.tracker.update_trial_metric(id, profile_metrics()).unwrap();
    ctx
}
