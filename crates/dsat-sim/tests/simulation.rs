use dsat_search::{AshaStrategy, DsatSearchMethod, TrialTracker};
use dsat_sim::{ClusterConfig, SimEvent, SimulatedCluster, SimulationDriver, SimulationReport};
use dsat_types::hparams::{effective_ds_config, resolve_base_ds_config, zero_stage};
use dsat_types::{HParams, RequestId, SearchConfig, SearchMethod, SearchMethodConfig};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

const SLOTS: usize = 2;

fn experiment() -> Value {
    json!({
        "resources": {"slots_per_trial": SLOTS},
        "hyperparameters": {
            "deepspeed_config": {
                "train_micro_batch_size_per_gpu": 1,
                "fp16": {"enabled": true},
                "optimizer": {"type": "AdamW", "params": {"lr": 1e-4}},
            },
        },
    })
}

fn quiet_cluster() -> ClusterConfig {
    ClusterConfig {
        noise: 0.0,
        ..ClusterConfig::default()
    }
}

fn simulate(
    config: SearchConfig,
    cluster: ClusterConfig,
) -> (DsatSearchMethod, SimulationDriver, SimulationReport) {
    let mut method = DsatSearchMethod::new(config.clone(), experiment()).unwrap();
    let cluster = SimulatedCluster::new(cluster, SLOTS);
    let mut driver = SimulationDriver::new(cluster, &config, SLOTS, 11);
    let report = driver.run(&mut method, 1_000).unwrap();
    (method, driver, report)
}

/// Every child narrows its parent's interval: a success raises the floor and a failure
/// lowers the ceiling.
fn assert_lineages_narrow(tracker: &TrialTracker) {
    for child in tracker.iter().filter(|trial| trial.parent.is_some()) {
        let parent = tracker.get(child.parent.unwrap()).unwrap();
        assert!(parent.completed());
        let (before, after) = (parent.search_data.unwrap(), child.search_data.unwrap());
        assert!(before.lo() <= parent.mbs && parent.mbs <= before.hi());
        if parent.error {
            assert!(after.hi() < before.hi(), "{before:?} -> {after:?}");
            assert_eq!(after.lo(), before.lo());
        } else {
            assert!(after.lo() > before.lo(), "{before:?} -> {after:?}");
        }
    }
}

fn stage_of(hparams: &HParams) -> u8 {
    let base = resolve_base_ds_config(hparams, None).unwrap();
    zero_stage(&effective_ds_config(hparams, &base))
}

#[test]
fn every_strategy_stays_within_limits() {
    for method in [
        SearchMethodConfig::random(),
        SearchMethodConfig::binary(),
        SearchMethodConfig::asha(),
    ] {
        let config = SearchConfig::new(method)
            .with_max_trials(30)
            .with_max_concurrent_trials(4)
            .with_max_slots(6);
        // limits are checked by the driver after every operation
        let (method, driver, report) = simulate(config, ClusterConfig::default());

        assert_eq!(report.failure, Some(false), "{}", method.strategy_name());
        assert!(report.trials_created <= 30);
        assert!(method.tracker().len() <= 30);
        assert!(method.tracker().best_trial().is_some());
        assert_lineages_narrow(method.tracker());
        assert_eq!(
            method.progress(driver.state()),
            driver.state().trials_closed.len() as f64 / 30.0
        );
    }
}

#[test]
fn resuming_from_a_checkpoint_continues_identically() {
    let config = SearchConfig::new(SearchMethodConfig::random())
        .with_max_trials(24)
        .with_max_concurrent_trials(2);
    let mut method = DsatSearchMethod::new(config.clone(), experiment()).unwrap();
    let cluster = SimulatedCluster::new(ClusterConfig::default(), SLOTS);
    let mut driver = SimulationDriver::new(cluster, &config, SLOTS, 3);
    driver.start(&mut method).unwrap();
    for _ in 0..8 {
        assert!(driver.step(&mut method).unwrap());
    }

    let dir = tempfile::tempdir().unwrap();
    method.save_method_state(dir.path()).unwrap();
    let mut restored = DsatSearchMethod::new(config, experiment()).unwrap();
    restored.load_method_state(dir.path()).unwrap();
    let mut restored_driver = driver.clone();

    let uninterrupted_report = driver.run(&mut method, 1_000).unwrap();
    let restored_report = restored_driver.run(&mut restored, 1_000).unwrap();

    assert_eq!(uninterrupted_report, restored_report);
    assert_eq!(driver.dispatched_hparams(), restored_driver.dispatched_hparams());
}

#[test]
fn binary_search_finds_the_largest_fitting_batch() {
    let config = SearchConfig::new(SearchMethodConfig::binary())
        .with_zero_stages([2])
        .with_max_trials(30)
        .with_max_concurrent_trials(2);
    let (method, driver, report) = simulate(config, quiet_cluster());
    assert_eq!(report.failure, Some(false));

    let max_fit = driver.cluster().max_fitting_mbs(2, true);
    let tracker = method.tracker();
    let best = tracker.get(tracker.best_trial().unwrap()).unwrap();
    assert_eq!(best.stage, 2);
    assert_eq!(best.mbs, max_fit);

    for trial in tracker.iter().filter(|trial| !trial.is_model_profile_info()) {
        if trial.completed() {
            assert_eq!(trial.error, trial.mbs > max_fit, "mbs {}", trial.mbs);
        }
    }
}

#[test]
fn asha_lineages_stay_within_rung_budgets() {
    let config = SearchConfig::new(SearchMethodConfig::Asha {
        max_resource: 8,
        min_resource: 1,
        early_stopping_rate: 0,
        divisor: 2,
        search_range_factor: 1.0,
    })
    .with_max_trials(40)
    .with_max_concurrent_trials(4);
    let (method, _, report) = simulate(config, ClusterConfig::default());
    assert_eq!(report.failure, Some(false));

    let asha = AshaStrategy::new(8, 1, 0, 2, 1.0);
    assert_eq!(asha.max_rungs(), 3);
    let tracker = method.tracker();
    let mut promoted = 0;
    for latest in tracker
        .iter()
        .filter(|trial| !trial.is_model_profile_info() && trial.children.is_empty())
    {
        let rung = latest
            .search_data
            .and_then(|data| data.curr_rung())
            .unwrap();
        assert!(rung < asha.max_rungs());
        let completed = tracker
            .num_completed_trials_in_lineage(latest.request_id)
            .unwrap();
        assert!(completed <= asha.max_trials_for_rung(rung));
        if rung > 0 {
            promoted += 1;
        }
    }
    assert!(promoted > 0);
}

#[test]
fn asha_promotes_only_finished_top_lineages() {
    let config = SearchConfig::new(SearchMethodConfig::Asha {
        max_resource: 8,
        min_resource: 1,
        early_stopping_rate: 0,
        divisor: 2,
        search_range_factor: 1.0,
    })
    .with_max_trials(40)
    .with_max_concurrent_trials(4);
    let asha = AshaStrategy::new(8, 1, 0, 2, 1.0);
    let mut method = DsatSearchMethod::new(config.clone(), experiment()).unwrap();
    let cluster = SimulatedCluster::new(ClusterConfig::default(), SLOTS);
    let mut driver = SimulationDriver::new(cluster, &config, SLOTS, 5);
    driver.start(&mut method).unwrap();

    let mut rungs: HashMap<RequestId, usize> = HashMap::new();
    let mut promotions = 0;
    loop {
        let running = driver.step(&mut method).unwrap();
        let tracker = method.tracker();
        let roots = tracker
            .iter()
            .filter(|trial| !trial.is_model_profile_info() && trial.parent.is_none());
        for root in roots {
            let rung = root.search_data.and_then(|data| data.curr_rung()).unwrap();
            let previous = rungs.insert(root.request_id, rung).unwrap_or(0);
            if rung == previous {
                continue;
            }
            assert_eq!(rung, previous + 1);
            promotions += 1;

            let completed = tracker
                .num_completed_trials_in_lineage(root.request_id)
                .unwrap();
            assert!(completed >= asha.max_trials_for_rung(previous));

            let finished = asha.rungs(method.context()).unwrap().swap_remove(previous);
            let top: Vec<RequestId> = asha
                .top_lineages(method.context(), &finished)
                .unwrap()
                .into_iter()
                .map(|id| tracker.get(id).unwrap().lineage_root)
                .collect();
            assert!(
                top.contains(&root.request_id),
                "promoted outside the top half of {} lineages",
                finished.len()
            );
        }
        if !running {
            break;
        }
    }
    assert!(promotions > 0);
    assert_lineages_narrow(method.tracker());
}

#[test]
fn random_early_stopping_ends_the_search_and_submits_the_best() {
    let submitted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&submitted);
    let config = SearchConfig::new(SearchMethodConfig::Random {
        trials_per_random_config: 5,
        early_stopping: Some(3),
    })
    .with_max_trials(200)
    .with_max_concurrent_trials(2)
    .with_run_full_experiment(true);
    let mut method = DsatSearchMethod::new(config.clone(), experiment())
        .unwrap()
        .with_submitter(move |config: &Value, _: Option<&Path>| {
            sink.lock().unwrap().push(config.clone());
            Ok(())
        });
    let cluster = SimulatedCluster::new(ClusterConfig::default(), SLOTS);
    let mut driver = SimulationDriver::new(cluster, &config, SLOTS, 17);
    let report = driver.run(&mut method, 1_000).unwrap();

    assert_eq!(report.failure, Some(false));
    assert!(matches!(
        driver.events().last(),
        Some(SimEvent::Shutdown { failure: false })
    ));
    let tracker = method.tracker();
    assert!(tracker.num_completed_trials() < 200);
    assert!(tracker.num_trials_since_best_result() >= 3);

    let submitted = submitted.lock().unwrap();
    assert_eq!(submitted.len(), 1);
    let best = tracker.get(tracker.best_trial().unwrap()).unwrap();
    let hparams = &submitted[0]["hyperparameters"];
    assert_eq!(
        hparams["overwrite_deepspeed_args"]["train_micro_batch_size_per_gpu"],
        best.mbs
    );
    assert!(hparams.get("_use_dsat_mode").is_none());
}

#[test]
fn random_abandons_stage_three_once_a_lower_stage_succeeds() {
    let config = SearchConfig::new(SearchMethodConfig::random())
        .with_max_trials(40)
        .with_max_concurrent_trials(4);
    let (_, driver, report) = simulate(config, ClusterConfig::default());
    assert_eq!(report.failure, Some(false));

    let mut stages: HashMap<RequestId, u8> = HashMap::new();
    let mut low_stage_succeeded = false;
    for event in driver.events() {
        match event {
            SimEvent::Created {
                request_id,
                hparams,
            } => {
                let stage = stage_of(hparams);
                if low_stage_succeeded {
                    assert_ne!(stage, 3);
                }
                stages.insert(*request_id, stage);
            }
            SimEvent::Validated {
                request_id,
                metrics,
            } if metrics.contains_key("throughput") => {
                if matches!(stages[request_id], 1 | 2) {
                    low_stage_succeeded = true;
                }
            }
            _ => {}
        }
    }
    assert!(low_stage_succeeded);
}

#[test]
fn profiling_out_of_memory_fails_the_search() {
    let cluster = ClusterConfig {
        gpu_mem: 1_000_000_000,
        ..ClusterConfig::default()
    };
    let (method, _, report) = simulate(SearchConfig::default(), cluster);

    assert_eq!(report.failure, Some(true));
    assert_eq!(report.trials_created, 1);
    assert!(method.should_shutdown());
    assert!(method.tracker().best_trial().is_none());
}
