use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use lattice_core::error::{LatticeError, Result};

pub type JobDetail = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one job occurrence. A recurring job gets a fresh record per
/// firing; terminal records never change again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique per occurrence: `<job_id>#<occurrence>`.
    pub id: String,
    pub job_id: String,
    pub occurrence: u64,
    pub kind: String,
    /// Human readable schedule, e.g. `every 30s`.
    pub schedule: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub detail: JobDetail,
    #[serde(default)]
    pub message: String,
}

impl JobRecord {
    pub fn waiting(
        job_id: impl Into<String>,
        occurrence: u64,
        kind: impl Into<String>,
        schedule: impl Into<String>,
    ) -> Self {
        let job_id = job_id.into();
        Self {
            id: format!("{}#{}", job_id, occurrence),
            job_id,
            occurrence,
            kind: kind.into(),
            schedule: schedule.into(),
            status: JobStatus::Waiting,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            detail: JobDetail::new(),
            message: String::new(),
        }
    }
}

/// Process-wide table of job records behind one lock.
#[derive(Debug, Default)]
pub struct JobStatusTable {
    records: Mutex<HashMap<String, JobRecord>>,
}

impl JobStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: JobRecord) {
        self.records.lock().insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        self.records.lock().get(id).cloned()
    }

    /// All records, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
                .then_with(|| a.occurrence.cmp(&b.occurrence))
        });
        records
    }

    /// Records of every occurrence of `job_id`, in firing order.
    pub fn history(&self, job_id: &str) -> Vec<JobRecord> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.occurrence);
        records
    }

    pub fn remove(&self, id: &str) -> Option<JobRecord> {
        self.records.lock().remove(id)
    }

    /// Drop the oldest terminal records of `job_id` until at most `keep`
    /// remain. Waiting and running records are never dropped. Returns the
    /// number removed.
    pub fn prune(&self, job_id: &str, keep: usize) -> usize {
        let mut records = self.records.lock();
        let mut finished: Vec<(u64, String)> = records
            .values()
            .filter(|r| r.job_id == job_id && r.status.is_terminal())
            .map(|r| (r.occurrence, r.id.clone()))
            .collect();
        let total = records.values().filter(|r| r.job_id == job_id).count();
        let excess = total.saturating_sub(keep).min(finished.len());
        finished.sort();
        for (_, id) in finished.iter().take(excess) {
            records.remove(id);
        }
        excess
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn set_running(&self, id: &str) -> Result<()> {
        self.transition(id, JobStatus::Running, |record| {
            record.start_time = Some(Utc::now());
        })
    }

    pub fn set_success(&self, id: &str, detail: JobDetail) -> Result<()> {
        self.transition(id, JobStatus::Success, |record| {
            record.detail.extend(detail);
        })
    }

    pub fn set_failed(&self, id: &str, message: impl Into<String>) -> Result<()> {
        let mut message = message.into();
        if message.is_empty() {
            message = "job failed without a message".to_string();
        }
        self.transition(id, JobStatus::Failed, |record| {
            record.message = message;
        })
    }

    pub fn set_cancelled(&self, id: &str) -> Result<()> {
        self.transition(id, JobStatus::Cancelled, |record| {
            record.message = "cancelled".to_string();
        })
    }

    fn transition<F>(&self, id: &str, to: JobStatus, apply: F) -> Result<()>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut records = self.records.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| LatticeError::JobNotFound(id.to_string()))?;

        let allowed = match to {
            JobStatus::Running => record.status == JobStatus::Waiting,
            JobStatus::Success => record.status == JobStatus::Running,
            JobStatus::Failed | JobStatus::Cancelled => !record.status.is_terminal(),
            JobStatus::Waiting => false,
        };
        if !allowed {
            return Err(LatticeError::InvalidJobTransition {
                id: id.to_string(),
                from: record.status.to_string(),
                to: to.to_string(),
            });
        }

        record.status = to;
        if to.is_terminal() {
            record.end_time = Some(Utc::now());
        }
        apply(record);
        debug!(job = %id, status = %to, "Job status changed");
        Ok(())
    }
}

/// What a running job knows about itself.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub record_id: String,
    pub occurrence: u64,
}

/// A unit of background work.
pub trait JobTask: Send + Sync + 'static {
    fn kind(&self) -> &str;

    /// Perform the job's side effect and return kind-specific detail.
    fn execute(&self, ctx: JobContext) -> BoxFuture<'_, Result<JobDetail>>;
}

/// Run one occurrence of `task` against the record `ctx.record_id`.
///
/// Errors and panics inside the task are recorded as `Failed`; nothing
/// escapes to the caller, so a recurring schedule survives a bad run.
pub async fn run_job(table: &JobStatusTable, task: Arc<dyn JobTask>, ctx: JobContext) -> JobStatus {
    let record_id = ctx.record_id.clone();
    if let Err(e) = table.set_running(&record_id) {
        warn!(job = %record_id, error = %e, "Job not runnable");
        return table
            .get(&record_id)
            .map(|r| r.status)
            .unwrap_or(JobStatus::Failed);
    }

    let kind = task.kind().to_string();
    info!(job = %record_id, kind = %kind, "Job started");
    let outcome = tokio::spawn(async move { task.execute(ctx).await }).await;

    let (status, recorded) = match outcome {
        Ok(Ok(detail)) => {
            info!(job = %record_id, kind = %kind, "Job succeeded");
            (JobStatus::Success, table.set_success(&record_id, detail))
        }
        Ok(Err(e)) => {
            error!(job = %record_id, kind = %kind, error = %e, "Job failed");
            (JobStatus::Failed, table.set_failed(&record_id, e.to_string()))
        }
        Err(join) => {
            let message = join_failure(join);
            error!(job = %record_id, kind = %kind, error = %message, "Job aborted");
            (JobStatus::Failed, table.set_failed(&record_id, message))
        }
    };
    if let Err(e) = recorded {
        warn!(job = %record_id, error = %e, "Could not record job outcome");
    }
    status
}

fn join_failure(err: JoinError) -> String {
    if err.is_cancelled() {
        return "job task was cancelled".to_string();
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("job panicked: {}", detail)
}
