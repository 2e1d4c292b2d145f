use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use lattice_core::config::CoordinatorConfig;
use lattice_core::error::{LatticeError, Result};
use lattice_core::event::EventBus;
use lattice_core::types::{CoordinatorEvent, DagDef, EngineKind, SessionId};
use lattice_dag::DagPartitioner;
use lattice_jobs::{JobManager, Schedule};

use crate::dataload::DagLoadTask;
use crate::local::CoordinatorLocalEngine;
use crate::registry::ObjectRegistry;
use crate::router::EngineRouter;
use crate::servicer::{DagReport, Session, SessionContext};

/// Owns the coordinator's shared state: the object registry, the job manager
/// and the set of open sessions.
pub struct SessionManager {
    ctx: Arc<SessionContext>,
    jobs: Arc<JobManager>,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    clear_on_teardown: bool,
}

impl SessionManager {
    /// Build a manager dispatching through `router`. A coordinator-local engine
    /// over the shared registry is added when the router has none.
    pub fn new(
        config: &CoordinatorConfig,
        mut router: EngineRouter,
        jobs: Arc<JobManager>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let registry = Arc::new(ObjectRegistry::new());
        if router.get(EngineKind::CoordinatorLocal).is_err() {
            router.register(Arc::new(CoordinatorLocalEngine::new(registry.clone())));
        }
        let ctx = Arc::new(SessionContext {
            partitioner: DagPartitioner::default(),
            router,
            registry,
            dispatch: config.dispatch.clone(),
            event_bus,
        });
        Self {
            ctx,
            jobs,
            sessions: Mutex::new(HashMap::new()),
            clear_on_teardown: config.coordinator.clear_on_teardown,
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.ctx.registry
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn open_session(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(SessionId::new(), self.ctx.clone()));
        self.sessions
            .lock()
            .insert(session.id().clone(), session.clone());
        info!(session = %session.id(), "Session opened");
        session
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Close a session. When the last session closes, the registry is
    /// cleared (unless disabled) since its handles are no longer addressable.
    pub fn close_session(&self, id: &SessionId) -> bool {
        let (removed, remaining) = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(id).is_some();
            (removed, sessions.len())
        };
        if !removed {
            return false;
        }
        info!(session = %id, remaining, "Session closed");

        if remaining == 0 && self.clear_on_teardown {
            for (key, handle) in self.ctx.registry.clear() {
                self.ctx.event_bus.publish(CoordinatorEvent::HandleReleased {
                    key,
                    kind: handle.kind(),
                });
            }
        }
        true
    }

    /// Run `dag` on a session opened by this manager.
    pub async fn run_dag(&self, id: &SessionId, dag: &DagDef) -> Result<DagReport> {
        let session = self
            .session(id)
            .ok_or_else(|| LatticeError::SessionNotFound(id.to_string()))?;
        session.run_dag(dag).await
    }

    /// Schedule `dag` as a background load job.
    pub fn submit_load(&self, name: &str, dag: DagDef, schedule: Schedule) -> String {
        let task = Arc::new(DagLoadTask::new(name, dag, self.ctx.clone()));
        self.jobs.submit(task, schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::future::BoxFuture;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use lattice_core::traits::EngineClient;
    use lattice_core::types::{
        ObjectHandle, ObjectId, OpResult, OpType, Operation, Segment, SegmentResponse,
    };
    use lattice_jobs::{JobStatus, JobStatusTable, Scheduler};

    /// Mints a graph handle for every `CREATE_GRAPH` operation.
    struct GraphEngine;

    impl EngineClient for GraphEngine {
        fn kind(&self) -> EngineKind {
            EngineKind::Analytical
        }

        fn run_segment<'a>(&'a self, segment: &'a Segment) -> BoxFuture<'a, Result<SegmentResponse>> {
            Box::pin(async move {
                let results = segment
                    .ops()
                    .iter()
                    .enumerate()
                    .map(|(i, op)| match op.op_type {
                        OpType::CreateGraph => OpResult::with_handle(
                            &op.key,
                            ObjectHandle::Graph {
                                object_id: ObjectId(100 + i as u64),
                                graph_name: op.key.clone(),
                                schema: None,
                                directed: true,
                            },
                        ),
                        _ => OpResult::ok(&op.key),
                    })
                    .collect();
                Ok(SegmentResponse::new(results))
            })
        }
    }

    fn manager() -> SessionManager {
        let scheduler = Arc::new(Scheduler::new(CancellationToken::new()));
        let driver = scheduler.clone();
        tokio::spawn(async move { driver.run().await });
        let bus = Arc::new(EventBus::default());
        let jobs = Arc::new(JobManager::new(
            scheduler,
            Arc::new(JobStatusTable::new()),
            Some(bus.clone()),
        ));
        SessionManager::new(
            &CoordinatorConfig::default(),
            EngineRouter::new().with_client(Arc::new(GraphEngine)),
            jobs,
            bus,
        )
    }

    #[tokio::test]
    async fn registry_cleared_when_last_session_closes() {
        let manager = manager();
        let a = manager.open_session();
        let b = manager.open_session();
        assert_eq!(manager.session_count(), 2);

        manager
            .run_dag(a.id(), &DagDef::new(vec![Operation::new(OpType::CreateGraph, "g")]))
            .await
            .unwrap();
        assert!(manager.registry().contains("g"));

        assert!(manager.close_session(a.id()));
        assert!(!manager.close_session(a.id()));
        assert!(manager.registry().contains("g"));

        assert!(manager.close_session(b.id()));
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let manager = manager();
        let err = manager
            .run_dag(&SessionId::from_string("nope"), &DagDef::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LatticeError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn data_source_runs_on_the_coordinator() {
        let manager = manager();
        let session = manager.open_session();
        let dag = DagDef::new(vec![
            Operation::new(OpType::DataSource, "src")
                .with_attr("location", json!("s3://bucket/edges.csv")),
            Operation::new(OpType::CreateGraph, "g").with_parent("src"),
        ]);
        let report = session.run_dag(&dag).await.unwrap();
        assert_eq!(report.segments[0].engine, EngineKind::CoordinatorLocal);
        assert_eq!(report.segments[1].engine, EngineKind::Analytical);
        assert_eq!(report.registered, vec!["g"]);
    }

    #[tokio::test(start_paused = true)]
    async fn load_job_runs_in_its_own_session() {
        let manager = manager();
        let dag = DagDef::new(vec![Operation::new(OpType::CreateGraph, "nightly")]);
        let id = manager.submit_load("nightly", dag, Schedule::Once(Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let record = manager.jobs().status(&id).unwrap();
        assert_eq!(record.status, JobStatus::Success);
        assert_eq!(record.detail["session_id"], "job:nightly#1");
        assert_eq!(record.detail["registered"], json!(["nightly"]));
        assert!(manager.registry().contains("nightly"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_load_job_is_recorded() {
        let manager = manager();
        let dag = DagDef::new(vec![Operation::new(OpType::CreateLearningInstance, "gl")]);
        let id = manager.submit_load("learning", dag, Schedule::Once(Duration::ZERO));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let record = manager.jobs().status(&id).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.message.contains("learning"));
        assert!(record.end_time.is_some());
    }
}
