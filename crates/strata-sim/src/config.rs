//! Driver configuration, loaded from JSON.

use std::path::Path;

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use strata_ecs::config::StoreConfig;

/// Parameters of one simulation run.
///
/// Every field has a default, so a partial (or empty) JSON object is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Seed of the run's `Pcg64`. Same seed, same run.
    pub seed: u64,
    /// Entities spawned before the first tick.
    pub entity_count: usize,
    pub ticks: u64,
    /// Number of distinct [`Team`](crate::components::Team) values.
    pub teams: u8,
    /// Fraction of entities whose `Frozen` tag is toggled each tick.
    pub structural_churn: f64,
    pub store: StoreConfig,
    /// Run the movement system with `par_for_each_chunk`.
    pub parallel: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0x5EED,
            entity_count: 10_000,
            ticks: 100,
            teams: 4,
            structural_churn: 0.01,
            store: StoreConfig::default(),
            parallel: true,
        }
    }
}

impl SimConfig {
    /// Load from a JSON file, or use defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.teams > 0, "teams must be at least 1");
        ensure!(
            (0.0..=1.0).contains(&self.structural_churn),
            "structural_churn must be within [0, 1], got {}",
            self.structural_churn
        );
        self.store.validate()?;
        Ok(())
    }
}
