use std::io::Write;

use lattice_core::config::{CoordinatorConfig, LauncherConfig, MpiFlavor};
use lattice_core::error::LatticeError;
use lattice_core::types::EngineKind;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[coordinator]
event_capacity = 64
clear_on_teardown = false
job_history_limit = 20

[dispatch]
analytical_timeout_secs = 120

[engines.analytical]
mode = "local"
engine_binary = "/opt/graphscope/bin/grape_engine"
num_workers = 4
hosts = ["node-a", "node-b"]
mpi = "openmpi"
log_level = "debug"
port_min = 40000
port_max = 40100

[engines.interactive]
mode = "hosted"
endpoint = "10.0.0.7:8182"

[health_check]
interval_secs = 15

[[jobs]]
name = "nightly-load"
dag_file = "dags/load.json"
cron = "0 0 2 * * *"

[[jobs]]
name = "refresh"
dag_file = "dags/refresh.json"
every_secs = 600
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = CoordinatorConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.coordinator.event_capacity, 64);
    assert!(!config.coordinator.clear_on_teardown);
    assert_eq!(config.coordinator.job_history_limit, 20);
    assert_eq!(config.dispatch.timeout_secs(EngineKind::Analytical), 120);

    match config.engines.get(EngineKind::Analytical) {
        Some(LauncherConfig::Local(local)) => {
            assert_eq!(local.num_workers, 4);
            assert_eq!(local.hosts, vec!["node-a", "node-b"]);
            assert_eq!(local.mpi, MpiFlavor::OpenMpi);
            assert_eq!(local.primary_host(), "node-a");
            assert_eq!(local.port_min, 40000);
        }
        other => panic!("expected local analytical launcher, got {:?}", other),
    }
    match config.engines.get(EngineKind::Interactive) {
        Some(LauncherConfig::Hosted { endpoint }) => assert_eq!(endpoint, "10.0.0.7:8182"),
        other => panic!("expected hosted interactive launcher, got {:?}", other),
    }
    assert!(config.engines.get(EngineKind::Learning).is_none());

    let hc = config.health_check.expect("health check present");
    assert!(hc.enabled);
    assert_eq!(hc.interval_secs, 15);

    assert_eq!(config.jobs.len(), 2);
    assert_eq!(config.jobs[0].cron.as_deref(), Some("0 0 2 * * *"));
    assert_eq!(config.jobs[1].every_secs, Some(600));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("LATTICE_TEST_ENGINE_HOST", "10.1.2.3");

    let toml_content = r#"
[engines.learning]
mode = "hosted"
endpoint = "${LATTICE_TEST_ENGINE_HOST}:${LATTICE_TEST_UNSET_PORT:-8500}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = CoordinatorConfig::load(tmp.path()).expect("load config");
    match config.engines.get(EngineKind::Learning) {
        Some(LauncherConfig::Hosted { endpoint }) => assert_eq!(endpoint, "10.1.2.3:8500"),
        other => panic!("expected hosted learning launcher, got {:?}", other),
    }
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[engines.analytical]
mode = "local"
engine_binary = "grape_engine"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = CoordinatorConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.coordinator.event_capacity, 256);
    assert!(config.coordinator.clear_on_teardown);
    assert_eq!(config.coordinator.job_history_limit, 100);
    assert!(config.health_check.is_none());
    assert!(config.jobs.is_empty());

    let Some(LauncherConfig::Local(local)) = config.engines.get(EngineKind::Analytical) else {
        panic!("expected local analytical launcher");
    };
    assert_eq!(local.num_workers, 1);
    assert_eq!(local.hosts, vec!["localhost"]);
    assert_eq!(local.mpi, MpiFlavor::Auto);
    assert_eq!(local.mpirun, "mpirun");
    assert_eq!(local.port_min, 20000);
    assert_eq!(local.port_max, 30000);
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = CoordinatorConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, LatticeError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_launcher_rejected() {
    let zero_workers = r#"
[engines.analytical]
mode = "local"
engine_binary = "grape_engine"
num_workers = 0
"#;
    assert!(matches!(
        CoordinatorConfig::parse(zero_workers),
        Err(LatticeError::Config(_))
    ));

    let both_schedules = r#"
[[jobs]]
name = "confused"
dag_file = "x.json"
every_secs = 10
cron = "0 * * * * *"
"#;
    let err = CoordinatorConfig::parse(both_schedules).unwrap_err();
    assert!(err.to_string().contains("jobs.confused"));

    let no_history = r#"
[coordinator]
job_history_limit = 0
"#;
    assert!(matches!(
        CoordinatorConfig::parse(no_history),
        Err(LatticeError::Config(_))
    ));

    let unknown_mode = r#"
[engines.interactive]
mode = "kubernetes"
"#;
    assert!(CoordinatorConfig::parse(unknown_mode).is_err());
}
