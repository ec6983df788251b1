use reefup_core::{SoftwareRepository, UpgradeCheckpoint};
use semver::Version;

use super::*;

fn repository(raw_version: &str, require_from_binary: bool) -> SoftwareRepository {
    SoftwareRepository {
        name: "reefserver".to_string(),
        version: Version::parse(raw_version).expect("version must parse"),
        hash: format!("hash-{raw_version}"),
        root: format!("/repo/reefserver/{raw_version}").into(),
        require_from_binary,
        direct_upgrade: false,
    }
}

#[test]
fn plans_one_node_per_chain_entry() {
    let chain = vec![
        repository("2.2.70", false),
        repository("2.2.76", false),
        repository("3.1.0", true),
    ];
    let route = plan_route(&chain).expect("must plan");

    assert_eq!(route.len(), 3);
    assert!(!route[0].require_from_binary, "running version needs nothing");
    assert!(!route[1].require_from_binary);
    assert!(route[2].require_from_binary);
}

#[test]
fn first_node_never_requires_binary_even_if_flagged() {
    let chain = vec![repository("3.1.0", true), repository("3.2.0", true)];
    let route = plan_route(&chain).expect("must plan");
    assert!(!route[0].require_from_binary);
    assert!(route[1].require_from_binary);
}

#[test]
fn rejects_chain_with_single_entry() {
    let err = plan_route(&[repository("2.2.70", false)]).expect_err("must reject");
    assert!(err.to_string().contains("at least"));
}

#[test]
fn rejects_unordered_chain() {
    let chain = vec![repository("3.1.0", false), repository("2.2.70", false)];
    let err = plan_route(&chain).expect_err("must reject");
    assert!(err.to_string().contains("not ordered"));
}

#[test]
fn allows_equal_adjacent_versions() {
    let chain = vec![
        repository("2.2.70", false),
        repository("2.2.70", false),
        repository("3.1.0", true),
    ];
    let route = plan_route(&chain).expect("must plan");
    assert_eq!(route.len(), 3);
}

#[test]
fn folds_minor_versions_into_next_binary_stage() {
    let chain = vec![
        repository("2.2.70", false),
        repository("2.2.76", false),
        repository("2.2.77", false),
        repository("3.1.0", true),
    ];
    let route = plan_route(&chain).expect("must plan");
    assert_eq!(next_stage_index(&route, 1), 3);
}

#[test]
fn stage_falls_back_to_last_node_without_binary_swap() {
    let chain = vec![
        repository("2.2.70", false),
        repository("2.2.76", false),
        repository("2.2.77", false),
    ];
    let route = plan_route(&chain).expect("must plan");
    assert_eq!(next_stage_index(&route, 1), 2);
}

#[test]
fn stage_lookup_scans_from_route_index() {
    let chain = vec![
        repository("2.2.70", false),
        repository("3.1.0", true),
        repository("3.1.5", false),
        repository("4.0.0", true),
    ];
    let route = plan_route(&chain).expect("must plan");
    assert_eq!(next_stage_index(&route, 1), 1);
    assert_eq!(next_stage_index(&route, 2), 3);
}

#[test]
fn replanning_is_idempotent() {
    let chain = vec![
        repository("2.2.70", false),
        repository("2.2.76", false),
        repository("3.1.0", true),
    ];
    let first = plan_route(&chain).expect("must plan");
    let second = plan_route(&chain).expect("must plan");
    assert_eq!(first, second);
}

#[test]
fn verifies_route_against_resume_checkpoint() {
    let chain = vec![repository("2.2.70", false), repository("3.1.0", true)];
    let route = plan_route(&chain).expect("must plan");
    let checkpoint = UpgradeCheckpoint::new("reefserver", route.clone());

    verify_resumed_route(&route, &checkpoint).expect("identical route must verify");

    let changed = plan_route(&[repository("2.2.70", false), repository("3.2.0", true)])
        .expect("must plan");
    let err = verify_resumed_route(&changed, &checkpoint).expect_err("must reject divergence");
    assert!(err.to_string().contains("diverges"));
}
