use btree_index::config::IndexConfig;
use btree_index::simulation::{Simulator, SimulatorConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "btree_index=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match IndexConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: node_min={}, bin_capacity={}, aggression={:?}, seed={}",
        config.node_min,
        config.bin_capacity,
        config.aggression,
        config.sim_seed
    );

    let operations = config.sim_operations;
    let sim_config = SimulatorConfig::from_index_config(&config);
    // The simulator drives its own runtime for scheduled inflates.
    let result =
        match tokio::task::spawn_blocking(move || Simulator::new(sim_config).run(operations)).await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Simulation task failed: {e}");
                std::process::exit(1);
            }
        };

    if let Some(error) = &result.error {
        tracing::error!("Simulation could not run: {error}");
        std::process::exit(1);
    }
    for violation in &result.invariant_violations {
        tracing::warn!(
            index = violation.operation_index,
            context = %violation.context,
            "{}",
            violation.description
        );
    }
    tracing::info!(
        seed = result.seed,
        operations = result.operations_processed,
        failed = result.failed_operations,
        retries = result.retries,
        size = result.final_size,
        passed = result.passed(),
        "simulation finished"
    );
    if !result.passed() {
        std::process::exit(1);
    }
}
