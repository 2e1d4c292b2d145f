use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::schedule::Schedule;

pub type JobCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle returned by [`Scheduler::schedule`], used to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobToken(u64);

impl std::fmt::Display for JobToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-token-{}", self.0)
    }
}

struct Entry {
    schedule: Schedule,
    due: Instant,
    callback: JobCallback,
}

/// One shared driver loop firing callbacks at their due times.
///
/// Due callbacks run sequentially on the driver task, so a slow callback
/// delays the ones behind it. An entry is checked under the entries lock right
/// before its callback starts: once [`Scheduler::cancel`] returns, the
/// callback is not started again. An invocation already running is not
/// interrupted.
pub struct Scheduler {
    entries: Mutex<HashMap<JobToken, Entry>>,
    next_token: AtomicU64,
    wake: Notify,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            wake: Notify::new(),
            cancel,
        }
    }

    pub fn schedule(&self, schedule: Schedule, callback: JobCallback) -> JobToken {
        let token = JobToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let Some(due) = schedule.first_due(Instant::now()) else {
            debug!(token = %token, "Schedule has no due time, not registered");
            return token;
        };
        debug!(token = %token, schedule = %schedule.describe(), "Callback scheduled");
        self.entries.lock().insert(
            token,
            Entry {
                schedule,
                due,
                callback,
            },
        );
        self.wake.notify_one();
        token
    }

    /// Remove a scheduled callback. Returns false if it was already gone.
    pub fn cancel(&self, token: JobToken) -> bool {
        let removed = self.entries.lock().remove(&token).is_some();
        if removed {
            debug!(token = %token, "Callback cancelled");
            self.wake.notify_one();
        }
        removed
    }

    pub fn is_scheduled(&self, token: JobToken) -> bool {
        self.entries.lock().contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Run the driver loop. Blocks until the cancellation token fires.
    pub async fn run(&self) {
        info!("Job scheduler started");

        loop {
            let next_due = self.entries.lock().values().map(|e| e.due).min();
            let sleep = async {
                match next_due {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Job scheduler shutting down");
                    break;
                }
                _ = self.wake.notified() => continue,
                _ = sleep => self.fire_due().await,
            }
        }
    }

    async fn fire_due(&self) {
        let now = Instant::now();
        let mut due: Vec<(Instant, JobToken)> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.due <= now)
            .map(|(token, entry)| (entry.due, *token))
            .collect();
        due.sort();

        for (_, token) in due {
            if self.cancel.is_cancelled() {
                return;
            }
            let callback = {
                let mut entries = self.entries.lock();
                let Some(entry) = entries.get_mut(&token) else {
                    debug!(token = %token, "Callback cancelled before firing");
                    continue;
                };
                let callback = entry.callback.clone();
                match entry.schedule.next_due(Instant::now()) {
                    Some(next) => entry.due = next,
                    None => {
                        entries.remove(&token);
                    }
                }
                callback
            };
            debug!(token = %token, "Firing callback");
            callback().await;
        }
    }
}
