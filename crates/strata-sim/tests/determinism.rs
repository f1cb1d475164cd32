//! Reproducibility of simulation runs.

use proptest::prelude::*;
use strata_ecs::config::StoreConfig;
use strata_sim::config::SimConfig;

fn small_config(seed: u64) -> SimConfig {
    SimConfig {
        seed,
        entity_count: 300,
        ticks: 20,
        teams: 3,
        structural_churn: 0.05,
        store: StoreConfig { chunk_bytes: 1024 },
        parallel: false,
    }
}

#[test]
fn same_seed_same_report() {
    let a = strata_sim::run(&small_config(7)).unwrap();
    let b = strata_sim::run(&small_config(7)).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.ticks, 20);
    assert_eq!(a.entity_count, 300);
}

#[test]
fn different_seeds_diverge() {
    let a = strata_sim::run(&small_config(1)).unwrap();
    let b = strata_sim::run(&small_config(2)).unwrap();
    assert_ne!(a.state_hash, b.state_hash);
}

#[test]
fn parallel_movement_matches_serial() {
    let serial = strata_sim::run(&small_config(11)).unwrap();
    let parallel = strata_sim::run(&SimConfig {
        parallel: true,
        ..small_config(11)
    })
    .unwrap();
    assert_eq!(serial, parallel);
}

#[test]
fn chunk_budget_changes_layout_not_contents() {
    let small = strata_sim::run(&small_config(5)).unwrap();
    let large = strata_sim::run(&SimConfig {
        store: StoreConfig::default(),
        ..small_config(5)
    })
    .unwrap();
    assert!(small.chunk_count > large.chunk_count);
    assert_eq!(small.total_health, large.total_health);
    assert_eq!(small.entity_count, large.entity_count);
}

#[test]
fn churn_moves_entities_between_archetypes() {
    let report = strata_sim::run(&SimConfig {
        structural_churn: 0.2,
        ..small_config(3)
    })
    .unwrap();
    // {Position, Velocity, Health, Team} and the same plus Frozen.
    assert_eq!(report.archetype_count, 2);
    assert!(report.structural_moves > 0);
    assert!(report.changed_chunks > 0);
}

#[test]
fn invalid_config_is_an_error() {
    let err = strata_sim::run(&SimConfig {
        teams: 0,
        ..small_config(1)
    })
    .unwrap_err();
    assert!(err.to_string().contains("teams"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn any_seed_is_reproducible(seed in any::<u64>()) {
        let config = SimConfig { ticks: 5, entity_count: 64, ..small_config(seed) };
        let a = strata_sim::run(&config).unwrap();
        let b = strata_sim::run(&config).unwrap();
        prop_assert_eq!(a.state_hash, b.state_hash);
    }
}
