use std::path::{Path, PathBuf};

use lattice_core::config::{CoordinatorConfig, LauncherConfig, MpiFlavor};
use lattice_core::types::{DagDef, EngineKind};
use lattice_dag::DagPartitioner;
use lattice_engine::mpi::effective_flavor;
use lattice_jobs::Schedule;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

pub fn run_doctor(config: &CoordinatorConfig, config_dir: &Path) {
    let mut checks = Vec::new();

    // 1. Which engines are reachable how
    checks.push(check_engines(config));

    // 2. Local engine binaries and MPI launchers on disk
    for kind in EngineKind::ALL {
        if let Some(LauncherConfig::Local(local)) = config.engines.get(kind) {
            checks.push(check_binary(kind, &local.engine_binary));
            if effective_flavor(local) != MpiFlavor::None {
                checks.push(check_mpirun(kind, &local.mpirun));
            }
        }
    }

    // 3. Hosted endpoints are host:port
    checks.push(check_hosted(config));

    // 4. Scheduled DAG jobs load and partition
    checks.push(check_jobs(config, config_dir));

    // Print results
    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

fn check_engines(config: &CoordinatorConfig) -> CheckResult {
    let configured: Vec<String> = EngineKind::ALL
        .into_iter()
        .filter_map(|kind| {
            config.engines.get(kind).map(|c| match c {
                LauncherConfig::Local(local) => {
                    format!("{} (local, {} workers)", kind, local.num_workers)
                }
                LauncherConfig::Hosted { .. } => format!("{} (hosted)", kind),
            })
        })
        .collect();

    if configured.is_empty() {
        CheckResult {
            label: "Engines".into(),
            ok: false,
            detail: "None configured (coordinator-local operations only)".into(),
        }
    } else {
        CheckResult {
            label: "Engines".into(),
            ok: true,
            detail: configured.join(", "),
        }
    }
}

fn check_binary(kind: EngineKind, binary: &str) -> CheckResult {
    let label = format!("{} binary", kind);
    match find_executable(binary) {
        Some(path) => CheckResult {
            label,
            ok: true,
            detail: path.display().to_string(),
        },
        None => CheckResult {
            label,
            ok: false,
            detail: format!("'{}' not found", binary),
        },
    }
}

fn check_mpirun(kind: EngineKind, mpirun: &str) -> CheckResult {
    let label = format!("{} launcher", kind);
    match find_executable(mpirun) {
        Some(path) => CheckResult {
            label,
            ok: true,
            detail: path.display().to_string(),
        },
        None => CheckResult {
            label,
            ok: false,
            detail: format!("'{}' not found but multi-process launch is required", mpirun),
        },
    }
}

fn check_hosted(config: &CoordinatorConfig) -> CheckResult {
    let mut bad = Vec::new();
    let mut count = 0;
    for kind in EngineKind::ALL {
        if let Some(LauncherConfig::Hosted { endpoint }) = config.engines.get(kind) {
            count += 1;
            let valid = endpoint
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid {
                bad.push(format!("{} '{}'", kind, endpoint));
            }
        }
    }

    if !bad.is_empty() {
        CheckResult {
            label: "Hosted endpoints".into(),
            ok: false,
            detail: format!("Expected host:port: {}", bad.join(", ")),
        }
    } else {
        CheckResult {
            label: "Hosted endpoints".into(),
            ok: true,
            detail: format!("{} configured", count),
        }
    }
}

fn check_jobs(config: &CoordinatorConfig, config_dir: &Path) -> CheckResult {
    if config.jobs.is_empty() {
        return CheckResult {
            label: "Jobs".into(),
            ok: true,
            detail: "None scheduled".into(),
        };
    }

    let partitioner = DagPartitioner::default();
    let mut bad = Vec::new();
    for job in &config.jobs {
        if let Some(ref expr) = job.cron {
            if Schedule::cron(expr).is_err() {
                bad.push(format!("'{}' (cron {})", job.name, expr));
                continue;
            }
        }
        let path = config_dir.join(&job.dag_file);
        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|content| DagDef::from_json(&content).map_err(|e| e.to_string()))
            .and_then(|dag| partitioner.partition(&dag).map_err(|e| e.to_string()));
        if let Err(e) = parsed {
            bad.push(format!("'{}' ({}: {})", job.name, path.display(), e));
        }
    }

    if bad.is_empty() {
        CheckResult {
            label: "Jobs".into(),
            ok: true,
            detail: format!("{} scheduled", config.jobs.len()),
        }
    } else {
        CheckResult {
            label: "Jobs".into(),
            ok: false,
            detail: format!("Invalid: {}", bad.join(", ")),
        }
    }
}

/// Resolve `name` like a shell would: paths are taken as-is, bare names are
/// looked up on `PATH`.
fn find_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}
