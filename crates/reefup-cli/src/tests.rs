use reefup_core::{RouteNode, SoftwareRepository, UpgradeCheckpoint};
use reefup_upgrade::SqlValue;
use semver::Version;

use crate::client::{bind_sql, parse_batch_rows};
use crate::flows::{format_route_lines, format_status_lines, remaining_stages};

fn node(raw_version: &str, require_from_binary: bool) -> RouteNode {
    RouteNode {
        repository: SoftwareRepository {
            name: "reefserver".to_string(),
            version: Version::parse(raw_version).expect("version must parse"),
            hash: format!("hash-{raw_version}"),
            root: format!("/repo/reefserver/{raw_version}").into(),
            require_from_binary,
            direct_upgrade: false,
        },
        require_from_binary,
        direct_upgrade: false,
    }
}

#[test]
fn binds_placeholders_in_order() {
    let bound = bind_sql(
        "SELECT * FROM sys.zones WHERE zone = ? AND id = ?",
        &[SqlValue::from("z1"), SqlValue::Int(7)],
    )
    .expect("must bind");
    assert_eq!(bound, "SELECT * FROM sys.zones WHERE zone = 'z1' AND id = 7");
}

#[test]
fn binding_escapes_quotes_and_renders_null() {
    let bound = bind_sql(
        "SELECT ?, ?",
        &[SqlValue::from("it's"), SqlValue::Null],
    )
    .expect("must bind");
    assert_eq!(bound, "SELECT 'it''s', NULL");
}

#[test]
fn binding_rejects_argument_count_mismatch() {
    let err = bind_sql("SELECT ?", &[]).expect_err("must reject missing argument");
    assert!(err.to_string().contains("more placeholders"));

    let err = bind_sql("SELECT 1", &[SqlValue::Int(1)]).expect_err("must reject extra argument");
    assert!(err.to_string().contains("more arguments"));
}

#[test]
fn parses_batch_output_with_types() {
    let rows = parse_batch_rows("cnt\tstatus\tnote\n3\tACTIVE\tNULL\n0\tINACTIVE\tok\n");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["cnt"], SqlValue::Int(3));
    assert_eq!(rows[0]["status"], SqlValue::Text("ACTIVE".to_string()));
    assert_eq!(rows[0]["note"], SqlValue::Null);
    assert_eq!(rows[1]["cnt"], SqlValue::Int(0));
}

#[test]
fn empty_batch_output_means_no_rows() {
    assert!(parse_batch_rows("").is_empty());
    assert!(parse_batch_rows("cnt\n").is_empty());
}

#[test]
fn counts_remaining_stages_with_folding() {
    let route = vec![
        node("2.2.70", false),
        node("2.2.76", false),
        node("3.1.0", true),
        node("3.1.5", false),
        node("4.0.0", true),
    ];
    assert_eq!(remaining_stages(&route, 1), 2);
    assert_eq!(remaining_stages(&route, 3), 1);
    assert_eq!(remaining_stages(&route, 5), 0);
}

#[test]
fn trailing_script_only_versions_form_their_own_stage() {
    let route = vec![
        node("2.2.70", false),
        node("2.2.76", false),
        node("2.2.77", false),
    ];
    assert_eq!(remaining_stages(&route, 1), 1);
}

#[test]
fn route_lines_mark_each_transition() {
    let route = vec![
        node("2.2.70", false),
        node("2.2.76", false),
        node("3.1.0", true),
    ];
    let lines = format_route_lines("reefserver", &route);
    assert_eq!(
        lines,
        vec![
            "Upgrade route for reefserver: 2 transition(s), 1 stage(s)".to_string(),
            "- 2.2.70 (running)".to_string(),
            "- 2.2.76 (scripts only)".to_string(),
            "- 3.1.0 (binary swap)".to_string(),
        ]
    );
}

#[test]
fn status_lines_name_the_current_step() {
    let mut checkpoint = UpgradeCheckpoint::new(
        "reefserver",
        vec![node("2.2.70", false), node("3.1.0", true)],
    );
    checkpoint.process_index = 2;

    let lines = format_status_lines(&checkpoint);
    assert_eq!(lines[0], "Component: reefserver");
    assert_eq!(lines[1], "Running:   2.2.70");
    assert_eq!(lines[2], "Target:    3.1.0");
    assert!(lines[3].contains("enable_upgrade_mode"));

    checkpoint.route_index = 2;
    checkpoint.process_index = 0;
    let lines = format_status_lines(&checkpoint);
    assert_eq!(lines[3], "Progress:  complete");
}
