//! `strata-sim [config.json]`: run the workload and print a JSON report.

use std::path::Path;

use strata_sim::config::SimConfig;

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let path = std::env::args().nth(1);
    let config = SimConfig::load(path.as_deref().map(Path::new))?;
    let report = strata_sim::run(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
