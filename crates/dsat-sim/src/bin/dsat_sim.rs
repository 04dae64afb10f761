use anyhow::Context;
use dsat_sim::{SimulatedCluster, SimulationConfig, SimulationDriver};
use dsat_types::SearchMethod;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::var_os("DSAT_SIM_CONFIG") {
        Some(path) => {
            let path = PathBuf::from(path);
            SimulationConfig::from_path(&path)
                .with_context(|| format!("failed to load {}", path.display()))?
        }
        None => SimulationConfig::default(),
    };

    let mut method = config.search_method()?;
    let slots = method.tracker().slots_per_trial();
    let cluster = SimulatedCluster::new(config.cluster.clone(), slots);
    let mut driver = SimulationDriver::new(cluster, &config.search, slots, config.driver_seed);
    let report = driver.run(&mut method, config.max_steps)?;

    if let Some(dir) = &config.checkpoint_dir {
        method
            .save_method_state(dir)
            .with_context(|| format!("failed to write searcher state to {}", dir.display()))?;
    }

    let tracker = method.tracker();
    println!("strategy:        {}", method.strategy_name());
    println!("trials created:  {}", report.trials_created);
    println!("trials failed:   {}", report.trials_failed);
    println!("search failed:   {}", report.failure.unwrap_or(true));
    match tracker.best_trial().map(|id| tracker.get(id)).transpose()? {
        Some(best) => {
            let value = best
                .searcher_metric_val(&tracker.config().metric)
                .unwrap_or_default();
            println!(
                "best trial:      zero stage {}, micro batch size {}, {} = {:.2}",
                best.stage,
                best.mbs,
                tracker.config().metric,
                value
            );
        }
        None => println!("best trial:      none"),
    }
    if let Some(path) = &config.submit_to {
        println!("best experiment: {}", path.display());
    }
    Ok(())
}
