use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use lattice_core::error::{LatticeError, Result};
use lattice_core::types::{DagDef, SessionId};
use lattice_jobs::{JobContext, JobDetail, JobTask};

use crate::servicer::{Session, SessionContext};

/// Runs a stored DAG (typically a bulk data load) as a background job.
///
/// Every occurrence executes in its own session named
/// `job:<name>#<occurrence>`, so its handles land in the shared registry like
/// those of any client request.
pub struct DagLoadTask {
    name: String,
    dag: DagDef,
    ctx: Arc<SessionContext>,
}

impl DagLoadTask {
    pub fn new(name: impl Into<String>, dag: DagDef, ctx: Arc<SessionContext>) -> Self {
        Self {
            name: name.into(),
            dag,
            ctx,
        }
    }

    /// Read the DAG from a JSON file in wire format.
    pub fn from_file(name: impl Into<String>, path: &Path, ctx: Arc<SessionContext>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LatticeError::Config(format!("cannot read DAG file {}: {}", path.display(), e))
        })?;
        Ok(Self::new(name, DagDef::from_json(&content)?, ctx))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl JobTask for DagLoadTask {
    fn kind(&self) -> &str {
        "dag_load"
    }

    fn execute(&self, ctx: JobContext) -> BoxFuture<'_, Result<JobDetail>> {
        Box::pin(async move {
            let session_id =
                SessionId::from_string(&format!("job:{}#{}", self.name, ctx.occurrence));
            let session = Session::new(session_id, self.ctx.clone());
            let report = session.run_dag(&self.dag).await?;

            let mut detail = JobDetail::new();
            detail.insert("name".into(), json!(self.name));
            detail.insert("session_id".into(), json!(report.session_id.to_string()));
            detail.insert("segments".into(), json!(report.segments.len()));
            detail.insert("registered".into(), json!(report.registered));
            detail.insert("released".into(), json!(report.released));
            Ok(detail)
        })
    }
}
