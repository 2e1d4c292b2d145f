//! Background jobs: per-occurrence status records, one shared scheduler
//! driver, and the tasks the coordinator runs on a schedule.

pub mod health;
pub mod job;
pub mod manager;
pub mod schedule;
pub mod scheduler;

pub use health::HealthCheckTask;
pub use job::{run_job, JobContext, JobDetail, JobRecord, JobStatus, JobStatusTable, JobTask};
pub use manager::JobManager;
pub use schedule::Schedule;
pub use scheduler::{JobCallback, JobToken, Scheduler};
