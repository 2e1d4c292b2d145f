use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{info, warn};

use lattice_core::error::{LatticeError, Result};
use lattice_core::traits::EngineLauncher;
use lattice_core::types::ProcessState;

use crate::job::{JobContext, JobDetail, JobTask};

/// Periodic liveness check over the coordinator's engine launchers.
///
/// Reports `{engine, state, endpoint}` for every launcher and fails the run
/// if any supervised engine has exited, quoting its last output line.
pub struct HealthCheckTask {
    launchers: Vec<Arc<dyn EngineLauncher>>,
}

impl HealthCheckTask {
    pub fn new(launchers: Vec<Arc<dyn EngineLauncher>>) -> Self {
        Self { launchers }
    }

    fn check(&self) -> Result<JobDetail> {
        let mut engines = Vec::with_capacity(self.launchers.len());
        let mut dead = Vec::new();

        for launcher in &self.launchers {
            let state = launcher.poll();
            let state_str = match state {
                ProcessState::NotStarted => "not_started".to_string(),
                ProcessState::Running => "running".to_string(),
                ProcessState::Exited(code) => {
                    let last = launcher.recent_output().pop().unwrap_or_default();
                    warn!(engine = %launcher.kind(), code, last_output = %last, "Engine exited");
                    dead.push(format!("{} (exit {})", launcher.kind(), code));
                    format!("exited({})", code)
                }
            };
            engines.push(json!({
                "engine": launcher.kind().as_str(),
                "state": state_str,
                "endpoint": launcher.endpoint(),
            }));
        }

        if !dead.is_empty() {
            return Err(LatticeError::JobExecution(format!(
                "engines down: {}",
                dead.join(", ")
            )));
        }

        info!(engines = engines.len(), "Health check OK");
        let mut detail = JobDetail::new();
        detail.insert("engines".into(), engines.into());
        Ok(detail)
    }
}

impl JobTask for HealthCheckTask {
    fn kind(&self) -> &str {
        "health_check"
    }

    fn execute(&self, _ctx: JobContext) -> BoxFuture<'_, Result<JobDetail>> {
        Box::pin(async move { self.check() })
    }
}
