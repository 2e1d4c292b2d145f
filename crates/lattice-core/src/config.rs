use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LatticeError, Result};
use crate::types::EngineKind;

/// Top-level coordinator configuration (`lattice.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub engines: EnginesConfig,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub jobs: Vec<ScheduledDagConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSection {
    /// Capacity of the coordinator event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Clear the object registry when a session is closed (default: true).
    #[serde(default = "default_clear_on_teardown")]
    pub clear_on_teardown: bool,
    /// Status records kept per recurring job; older finished ones are dropped.
    #[serde(default = "default_job_history_limit")]
    pub job_history_limit: usize,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            clear_on_teardown: default_clear_on_teardown(),
            job_history_limit: default_job_history_limit(),
        }
    }
}

fn default_event_capacity() -> usize { 256 }
fn default_clear_on_teardown() -> bool { true }
fn default_job_history_limit() -> usize { 100 }

/// Per-engine timeouts for a single segment round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_analytical_timeout")]
    pub analytical_timeout_secs: u64,
    #[serde(default = "default_interactive_timeout")]
    pub interactive_timeout_secs: u64,
    #[serde(default = "default_learning_timeout")]
    pub learning_timeout_secs: u64,
    #[serde(default = "default_local_timeout")]
    pub local_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            analytical_timeout_secs: default_analytical_timeout(),
            interactive_timeout_secs: default_interactive_timeout(),
            learning_timeout_secs: default_learning_timeout(),
            local_timeout_secs: default_local_timeout(),
        }
    }
}

impl DispatchConfig {
    pub fn timeout_secs(&self, kind: EngineKind) -> u64 {
        match kind {
            EngineKind::Analytical => self.analytical_timeout_secs,
            EngineKind::Interactive => self.interactive_timeout_secs,
            EngineKind::Learning => self.learning_timeout_secs,
            EngineKind::CoordinatorLocal => self.local_timeout_secs,
        }
    }

    pub fn timeout(&self, kind: EngineKind) -> Duration {
        Duration::from_secs(self.timeout_secs(kind))
    }
}

fn default_analytical_timeout() -> u64 { 600 }
fn default_interactive_timeout() -> u64 { 120 }
fn default_learning_timeout() -> u64 { 600 }
fn default_local_timeout() -> u64 { 60 }

/// How each remote engine is reached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnginesConfig {
    #[serde(default)]
    pub analytical: Option<LauncherConfig>,
    #[serde(default)]
    pub interactive: Option<LauncherConfig>,
    #[serde(default)]
    pub learning: Option<LauncherConfig>,
}

impl EnginesConfig {
    pub fn get(&self, kind: EngineKind) -> Option<&LauncherConfig> {
        match kind {
            EngineKind::Analytical => self.analytical.as_ref(),
            EngineKind::Interactive => self.interactive.as_ref(),
            EngineKind::Learning => self.learning.as_ref(),
            EngineKind::CoordinatorLocal => None,
        }
    }
}

/// Launcher selection for one engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum LauncherConfig {
    /// Supervise a local (possibly multi-process) engine binary.
    Local(LocalLauncherConfig),
    /// Attach to an engine that is already running elsewhere.
    Hosted { endpoint: String },
}

/// Multi-process launcher used to fan workers out over hosts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MpiFlavor {
    /// Exec directly for a single local worker, OpenMPI otherwise.
    #[default]
    Auto,
    OpenMpi,
    Mpich,
    /// Always exec the binary directly.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalLauncherConfig {
    pub engine_binary: String,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub mpi: MpiFlavor,
    #[serde(default = "default_mpirun")]
    pub mpirun: String,
    /// Socket of the shared object store, passed through to the engine.
    #[serde(default)]
    pub shared_store_socket: Option<String>,
    /// Symbolic log level: error, warn, info, debug, trace.
    #[serde(default = "default_engine_log_level")]
    pub log_level: String,
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    #[serde(default = "default_max_port_probes")]
    pub max_port_probes: usize,
    /// How long a freshly spawned engine must survive to count as started.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Grace period between SIGTERM and SIGKILL on a normal stop.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Lines of engine output retained for diagnostics. 0 disables buffering.
    #[serde(default = "default_output_buffer_lines")]
    pub output_buffer_lines: usize,
    /// Mirror engine output to the coordinator's stdout.
    #[serde(default = "default_mirror_output")]
    pub mirror_output: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl LocalLauncherConfig {
    pub fn new(engine_binary: impl Into<String>) -> Self {
        Self {
            engine_binary: engine_binary.into(),
            num_workers: default_num_workers(),
            hosts: default_hosts(),
            mpi: MpiFlavor::default(),
            mpirun: default_mpirun(),
            shared_store_socket: None,
            log_level: default_engine_log_level(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            max_port_probes: default_max_port_probes(),
            startup_grace_ms: default_startup_grace_ms(),
            stop_timeout_secs: default_stop_timeout_secs(),
            output_buffer_lines: default_output_buffer_lines(),
            mirror_output: default_mirror_output(),
            env: HashMap::new(),
        }
    }

    /// Host the engine's RPC port is opened on.
    pub fn primary_host(&self) -> &str {
        self.hosts.first().map(|h| h.as_str()).unwrap_or("localhost")
    }
}

fn default_num_workers() -> usize { 1 }
fn default_hosts() -> Vec<String> { vec!["localhost".to_string()] }
fn default_mpirun() -> String { "mpirun".to_string() }
fn default_engine_log_level() -> String { "info".to_string() }
fn default_port_min() -> u16 { 20000 }
fn default_port_max() -> u16 { 30000 }
fn default_max_port_probes() -> usize { 64 }
fn default_startup_grace_ms() -> u64 { 500 }
fn default_stop_timeout_secs() -> u64 { 10 }
fn default_output_buffer_lines() -> usize { 200 }
fn default_mirror_output() -> bool { true }

/// Periodic engine liveness checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Enable health checks (default: true when section is present).
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            interval_secs: default_health_interval(),
        }
    }
}

fn default_health_enabled() -> bool { true }
fn default_health_interval() -> u64 { 30 }

/// A DAG (typically a bulk data load) run on a schedule.
///
/// Exactly one of `every_secs` and `cron` may be set; neither means run once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledDagConfig {
    pub name: String,
    pub dag_file: String,
    #[serde(default)]
    pub every_secs: Option<u64>,
    #[serde(default)]
    pub cron: Option<String>,
}

impl CoordinatorConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| LatticeError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| LatticeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for kind in EngineKind::ALL {
            if let Some(LauncherConfig::Local(local)) = self.engines.get(kind) {
                if local.num_workers == 0 {
                    return Err(LatticeError::Config(format!(
                        "engines.{}: num_workers must be at least 1",
                        kind
                    )));
                }
                if local.hosts.is_empty() {
                    return Err(LatticeError::Config(format!(
                        "engines.{}: hosts must not be empty",
                        kind
                    )));
                }
                if local.port_min > local.port_max {
                    return Err(LatticeError::Config(format!(
                        "engines.{}: port_min {} exceeds port_max {}",
                        kind, local.port_min, local.port_max
                    )));
                }
            }
        }
        if self.coordinator.job_history_limit == 0 {
            return Err(LatticeError::Config(
                "coordinator.job_history_limit must be at least 1".to_string(),
            ));
        }
        for job in &self.jobs {
            if job.every_secs.is_some() && job.cron.is_some() {
                return Err(LatticeError::Config(format!(
                    "jobs.{}: set either every_secs or cron, not both",
                    job.name
                )));
            }
            if job.every_secs == Some(0) {
                return Err(LatticeError::Config(format!(
                    "jobs.{}: every_secs must be positive",
                    job.name
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` and `${ENV_VAR:-fallback}` patterns in a string.
///
/// Unset variables without a fallback are left verbatim.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let expr = &after[..end];
        let (name, fallback) = match expr.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (expr, None),
        };
        match (std::env::var(name), fallback) {
            (Ok(val), _) => out.push_str(&val),
            (Err(_), Some(fallback)) => out.push_str(fallback),
            (Err(_), None) => out.push_str(&rest[start..start + end + 3]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
