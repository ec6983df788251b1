use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use semver::Version;

use super::*;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_dir(tag: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "reefup-core-tests-{tag}-{}-{}",
        std::process::id(),
        sequence
    ));
    fs::create_dir_all(&path).expect("must create test dir");
    path
}

fn version(raw: &str) -> Version {
    Version::parse(raw).expect("version must parse")
}

fn install_repository(
    root: &PathBuf,
    component: &str,
    raw_version: &str,
    require_from_binary: bool,
) {
    let dir = root.join(component).join(raw_version);
    fs::create_dir_all(&dir).expect("must create repository dir");
    let manifest = format!(
        "name = \"{component}\"\nversion = \"{raw_version}\"\nhash = \"hash-{raw_version}\"\nrequire_from_binary = {require_from_binary}\n"
    );
    fs::write(dir.join("repository.toml"), manifest).expect("must write manifest");
}

#[test]
fn parses_repository_manifest() {
    let manifest = RepositoryManifest::from_toml_str(
        r#"
name = "reefserver"
version = "3.1.0"
hash = "abc123"
require_from_binary = true
direct_upgrade = true
"#,
    )
    .expect("must parse");

    assert_eq!(manifest.name, "reefserver");
    assert_eq!(manifest.version, version("3.1.0"));
    assert!(manifest.require_from_binary);
    assert!(manifest.direct_upgrade);
}

#[test]
fn manifest_flags_default_to_false() {
    let manifest = RepositoryManifest::from_toml_str(
        "name = \"reefserver\"\nversion = \"2.2.70\"\nhash = \"abc\"\n",
    )
    .expect("must parse");
    assert!(!manifest.require_from_binary);
    assert!(!manifest.direct_upgrade);
}

#[test]
fn rejects_manifest_with_empty_hash() {
    let err = RepositoryManifest::from_toml_str(
        "name = \"reefserver\"\nversion = \"2.2.70\"\nhash = \"  \"\n",
    )
    .expect_err("must reject");
    assert!(err.to_string().contains("empty content hash"));
}

#[test]
fn repository_selects_script_set_by_direct_flag() {
    let manifest = RepositoryManifest::from_toml_str(
        "name = \"reefserver\"\nversion = \"3.1.0\"\nhash = \"abc\"\n",
    )
    .expect("must parse");
    let repository = SoftwareRepository::from_manifest(manifest, "/repo/reefserver/3.1.0");

    assert_eq!(
        repository.script_dir(false),
        PathBuf::from("/repo/reefserver/3.1.0/scripts")
    );
    assert_eq!(
        repository.script_dir(true),
        PathBuf::from("/repo/reefserver/3.1.0/scripts-direct")
    );
}

#[test]
fn store_lists_installed_versions_sorted() {
    let root = test_dir("store-sorted");
    install_repository(&root, "reefserver", "3.1.0", true);
    install_repository(&root, "reefserver", "2.2.70", false);
    install_repository(&root, "reefserver", "2.2.76", false);

    let store = RepositoryStore::open(&root);
    let versions = store
        .installed_versions("reefserver")
        .expect("must list")
        .into_iter()
        .map(|repository| repository.version.to_string())
        .collect::<Vec<_>>();

    assert_eq!(versions, vec!["2.2.70", "2.2.76", "3.1.0"]);
}

#[test]
fn store_returns_empty_for_unknown_component() {
    let root = test_dir("store-unknown");
    let store = RepositoryStore::open(&root);
    assert!(store
        .installed_versions("reefproxy")
        .expect("must succeed")
        .is_empty());
}

#[test]
fn upgrade_chain_spans_current_to_target_inclusive() {
    let root = test_dir("chain");
    install_repository(&root, "reefserver", "2.2.70", false);
    install_repository(&root, "reefserver", "2.2.76", false);
    install_repository(&root, "reefserver", "3.1.0", true);
    install_repository(&root, "reefserver", "3.2.0", true);

    let store = RepositoryStore::open(&root);
    let chain = store
        .upgrade_chain("reefserver", &version("2.2.70"), &version("3.1.0"))
        .expect("must build chain");

    let versions = chain
        .iter()
        .map(|repository| repository.version.to_string())
        .collect::<Vec<_>>();
    assert_eq!(versions, vec!["2.2.70", "2.2.76", "3.1.0"]);
}

#[test]
fn upgrade_chain_requires_installed_endpoints() {
    let root = test_dir("chain-endpoints");
    install_repository(&root, "reefserver", "2.2.76", false);
    install_repository(&root, "reefserver", "3.1.0", true);

    let store = RepositoryStore::open(&root);
    let err = store
        .upgrade_chain("reefserver", &version("2.2.70"), &version("3.1.0"))
        .expect_err("must reject missing current");
    assert!(err.to_string().contains("not installed"));
}

#[test]
fn upgrade_chain_rejects_non_upgrade() {
    let root = test_dir("chain-downgrade");
    let store = RepositoryStore::open(&root);
    let err = store
        .upgrade_chain("reefserver", &version("3.1.0"), &version("2.2.70"))
        .expect_err("must reject downgrade");
    assert!(err.to_string().contains("not newer"));
}

const CLUSTER_TOML: &str = r#"
name = "prod"
user = "admin"
password = "secret"

[[servers]]
host = "10.0.0.1"
zone = "z1"
sql_port = 2881
rpc_port = 2882
home_dir = "/data/reef"

[servers.parameters]
memory_limit = "64G"

[[servers]]
host = "10.0.0.2"
zone = "z2"
sql_port = 2881
rpc_port = 2882
home_dir = "/data/reef"
"#;

#[test]
fn parses_cluster_config() {
    let config = ClusterConfig::from_toml_str(CLUSTER_TOML).expect("must parse");
    assert_eq!(config.name, "prod");
    assert_eq!(config.servers.len(), 2);
    assert_eq!(config.primary().host, "10.0.0.1");
    assert_eq!(
        config.servers[0].parameters.get("memory_limit").map(String::as_str),
        Some("64G")
    );
    assert_eq!(
        config.zone_names().into_iter().collect::<Vec<_>>(),
        vec!["z1".to_string(), "z2".to_string()]
    );
}

#[test]
fn rejects_duplicate_server_address() {
    let raw = CLUSTER_TOML.replace("10.0.0.2", "10.0.0.1");
    let err = ClusterConfig::from_toml_str(&raw).expect_err("must reject duplicate");
    assert!(err.to_string().contains("duplicate server address"));
}

#[test]
fn rejects_empty_zone() {
    let raw = CLUSTER_TOML.replace("zone = \"z2\"", "zone = \"\"");
    let err = ClusterConfig::from_toml_str(&raw).expect_err("must reject empty zone");
    assert!(err.to_string().contains("empty zone"));
}

#[test]
fn rejects_config_without_servers() {
    let err = ClusterConfig::from_toml_str("name = \"prod\"\nuser = \"admin\"\nservers = []\n")
        .expect_err("must reject");
    assert!(err.to_string().contains("no servers"));
}

fn route_node(raw_version: &str, require_from_binary: bool) -> RouteNode {
    let manifest = RepositoryManifest::from_toml_str(&format!(
        "name = \"reefserver\"\nversion = \"{raw_version}\"\nhash = \"hash-{raw_version}\"\n"
    ))
    .expect("must parse");
    RouteNode {
        repository: SoftwareRepository::from_manifest(
            manifest,
            format!("/repo/reefserver/{raw_version}"),
        ),
        require_from_binary,
        direct_upgrade: false,
    }
}

#[test]
fn new_checkpoint_starts_at_first_transition() {
    let checkpoint = UpgradeCheckpoint::new(
        "reefserver",
        vec![route_node("2.2.70", false), route_node("3.1.0", true)],
    );
    assert_eq!(checkpoint.route_index, 1);
    assert_eq!(checkpoint.process_index, 0);
    assert_eq!(checkpoint.process_route_index, 0);
    assert!(!checkpoint.is_complete());
}

#[test]
fn checkpoint_round_trips_through_json() {
    let mut checkpoint = UpgradeCheckpoint::new(
        "reefserver",
        vec![route_node("2.2.70", false), route_node("3.1.0", true)],
    );
    checkpoint.process_index = 3;
    checkpoint.backup_params = Some(ParameterBackup::default());

    let raw = checkpoint.to_json().expect("must serialize");
    let restored = UpgradeCheckpoint::from_json(&raw).expect("must parse");
    assert_eq!(restored, checkpoint);
}

#[test]
fn checkpoint_rejects_schema_mismatch() {
    let checkpoint = UpgradeCheckpoint::new(
        "reefserver",
        vec![route_node("2.2.70", false), route_node("3.1.0", true)],
    );
    let raw = checkpoint
        .to_json()
        .expect("must serialize")
        .replace("\"schema_version\": 1", "\"schema_version\": 99");
    let err = UpgradeCheckpoint::from_json(&raw).expect_err("must reject");
    assert!(err.to_string().contains("schema version mismatch"));
}

#[test]
fn checkpoint_rejects_out_of_range_route_index() {
    let mut checkpoint = UpgradeCheckpoint::new(
        "reefserver",
        vec![route_node("2.2.70", false), route_node("3.1.0", true)],
    );
    checkpoint.route_index = 5;
    let raw = checkpoint.to_json().expect("must serialize");
    let err = UpgradeCheckpoint::from_json(&raw).expect_err("must reject");
    assert!(err.to_string().contains("out of range"));
}

#[test]
fn file_store_round_trips_and_clears() {
    let dir = test_dir("checkpoint-store");
    let store = FileCheckpointStore::new(dir.join("upgrade.checkpoint.json"));

    assert!(store.load().expect("must load").is_none());

    let checkpoint = UpgradeCheckpoint::new(
        "reefserver",
        vec![route_node("2.2.70", false), route_node("3.1.0", true)],
    );
    store.save(&checkpoint).expect("must save");
    let loaded = store.load().expect("must load").expect("must exist");
    assert_eq!(loaded, checkpoint);

    store.clear().expect("must clear");
    assert!(store.load().expect("must load").is_none());
}
