use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use lattice_core::error::{LatticeError, Result};
use lattice_core::event::EventBus;
use lattice_core::types::CoordinatorEvent;

use crate::job::{run_job, JobContext, JobRecord, JobStatus, JobStatusTable, JobTask};
use crate::schedule::Schedule;
use crate::scheduler::{JobCallback, JobToken, Scheduler};

/// Records kept per job unless configured otherwise.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

struct ScheduledJob {
    token: JobToken,
    kind: String,
    schedule: String,
    recurring: bool,
    /// Occurrence number of the record currently `Waiting`.
    pending: u64,
}

struct Shared {
    table: Arc<JobStatusTable>,
    jobs: Mutex<HashMap<String, ScheduledJob>>,
    event_bus: Option<Arc<EventBus>>,
    history_limit: AtomicUsize,
}

impl Shared {
    async fn fire(&self, job_id: &str, task: Arc<dyn JobTask>) {
        let occurrence = match self.jobs.lock().get(job_id) {
            Some(job) => job.pending,
            None => {
                debug!(job = %job_id, "Job withdrawn before firing");
                return;
            }
        };
        let ctx = JobContext {
            job_id: job_id.to_string(),
            record_id: format!("{}#{}", job_id, occurrence),
            occurrence,
        };
        let record_id = ctx.record_id.clone();
        let kind = task.kind().to_string();

        let status = run_job(&self.table, task, ctx).await;

        if let Some(ref bus) = self.event_bus {
            bus.publish(CoordinatorEvent::JobFinished {
                job_id: record_id,
                kind,
                status: status.to_string(),
                finished_at: Utc::now(),
            });
        }

        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(job_id) else {
            return;
        };
        if job.recurring {
            job.pending = occurrence + 1;
            self.table.insert(JobRecord::waiting(
                job_id,
                job.pending,
                job.kind.clone(),
                job.schedule.clone(),
            ));
            let pruned = self
                .table
                .prune(job_id, self.history_limit.load(Ordering::Relaxed));
            if pruned > 0 {
                debug!(job = %job_id, pruned, "Old occurrences dropped");
            }
        } else {
            jobs.remove(job_id);
        }
    }
}

/// Submits tasks to the shared [`Scheduler`] and tracks every occurrence in a
/// [`JobStatusTable`].
pub struct JobManager {
    scheduler: Arc<Scheduler>,
    shared: Arc<Shared>,
}

impl JobManager {
    pub fn new(
        scheduler: Arc<Scheduler>,
        table: Arc<JobStatusTable>,
        event_bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            scheduler,
            shared: Arc::new(Shared {
                table,
                jobs: Mutex::new(HashMap::new()),
                event_bus,
                history_limit: AtomicUsize::new(DEFAULT_HISTORY_LIMIT),
            }),
        }
    }

    /// Keep at most `limit` records per recurring job (at least one).
    pub fn with_history_limit(self, limit: usize) -> Self {
        self.shared
            .history_limit
            .store(limit.max(1), Ordering::Relaxed);
        self
    }

    pub fn table(&self) -> &Arc<JobStatusTable> {
        &self.shared.table
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Schedule `task`. Returns the job id; each occurrence is recorded as
    /// `<job_id>#<n>`, starting with a `Waiting` record for the first one.
    pub fn submit(&self, task: Arc<dyn JobTask>, schedule: Schedule) -> String {
        let kind = task.kind().to_string();
        let job_id = format!("{}-{}", kind, &Uuid::new_v4().simple().to_string()[..8]);
        let description = schedule.describe();
        let recurring = schedule.is_recurring();

        // Register before scheduling so the first firing finds the job.
        let mut jobs = self.shared.jobs.lock();
        self.shared
            .table
            .insert(JobRecord::waiting(&job_id, 1, kind.clone(), description.clone()));

        let shared = self.shared.clone();
        let id = job_id.clone();
        let callback: JobCallback = Arc::new(move || {
            let shared = shared.clone();
            let id = id.clone();
            let task = task.clone();
            Box::pin(async move { shared.fire(&id, task).await })
        });
        let token = self.scheduler.schedule(schedule, callback);

        jobs.insert(
            job_id.clone(),
            ScheduledJob {
                token,
                kind: kind.clone(),
                schedule: description.clone(),
                recurring,
                pending: 1,
            },
        );
        drop(jobs);

        info!(job = %job_id, kind = %kind, schedule = %description, "Job submitted");
        job_id
    }

    /// Withdraw a job. Its waiting occurrence becomes `Cancelled`; a running
    /// occurrence completes normally. Returns false if the job had already
    /// finished or been cancelled.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let removed = self.shared.jobs.lock().remove(job_id);
        let Some(job) = removed else {
            if self.shared.table.history(job_id).is_empty() {
                return Err(LatticeError::JobNotFound(job_id.to_string()));
            }
            return Ok(false);
        };

        self.scheduler.cancel(job.token);
        let pending = format!("{}#{}", job_id, job.pending);
        if let Some(record) = self.shared.table.get(&pending) {
            if record.status == JobStatus::Waiting {
                if let Err(e) = self.shared.table.set_cancelled(&pending) {
                    debug!(job = %pending, error = %e, "Occurrence started before cancel");
                }
            }
        }
        info!(job = %job_id, "Job cancelled");
        Ok(true)
    }

    /// Latest occurrence of `job_id`.
    pub fn status(&self, job_id: &str) -> Result<JobRecord> {
        self.shared
            .table
            .history(job_id)
            .pop()
            .ok_or_else(|| LatticeError::JobNotFound(job_id.to_string()))
    }

    pub fn history(&self, job_id: &str) -> Vec<JobRecord> {
        self.shared.table.history(job_id)
    }

    pub fn list(&self) -> Vec<JobRecord> {
        self.shared.table.list()
    }

    /// Ids of jobs still scheduled.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.shared.jobs.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
