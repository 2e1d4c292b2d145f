use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use lattice_core::config::DispatchConfig;
use lattice_core::error::{LatticeError, Result};
use lattice_core::event::EventBus;
use lattice_core::types::{
    CoordinatorEvent, DagDef, EngineKind, ObjectHandle, Segment, SegmentResponse, SessionId,
};
use lattice_dag::DagPartitioner;

use crate::registry::ObjectRegistry;
use crate::router::EngineRouter;

/// Everything a session needs to execute requests. Shared by all sessions.
pub struct SessionContext {
    pub partitioner: DagPartitioner,
    pub router: EngineRouter,
    pub registry: Arc<ObjectRegistry>,
    pub dispatch: DispatchConfig,
    pub event_bus: Arc<EventBus>,
}

/// Per-segment line of a [`DagReport`].
#[derive(Debug, Clone, Serialize)]
pub struct SegmentReport {
    pub index: usize,
    pub engine: EngineKind,
    pub ops: usize,
    pub elapsed_ms: u64,
}

/// Outcome of a fully executed request.
#[derive(Debug, Clone, Serialize)]
pub struct DagReport {
    pub session_id: SessionId,
    pub segments: Vec<SegmentReport>,
    /// Keys whose handles were registered, in order.
    pub registered: Vec<String>,
    /// Keys whose handles were released, in order.
    pub released: Vec<String>,
}

/// One client session. Requests of a session run strictly one segment at a
/// time; independent sessions run concurrently.
pub struct Session {
    id: SessionId,
    ctx: Arc<SessionContext>,
    // Serializes requests within the session.
    running: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(id: SessionId, ctx: Arc<SessionContext>) -> Self {
        Self {
            id,
            ctx,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Partition `dag` and dispatch its segments in order.
    ///
    /// Each segment waits for the previous one and for its handles to be
    /// registered. The first failing segment aborts the rest; effects already
    /// applied by engines are kept.
    pub async fn run_dag(&self, dag: &DagDef) -> Result<DagReport> {
        let _guard = self.running.lock().await;
        let mut queue = self.ctx.partitioner.partition(dag)?;
        info!(session = %self.id, ops = dag.len(), segments = queue.len(), "Running DAG");

        let mut report = DagReport {
            session_id: self.id.clone(),
            segments: Vec::with_capacity(queue.len()),
            registered: Vec::new(),
            released: Vec::new(),
        };

        let mut index = 0;
        while let Some((engine, segment)) = queue.next() {
            let started = Instant::now();
            self.ctx.event_bus.publish(CoordinatorEvent::SegmentDispatched {
                session_id: self.id.clone(),
                engine,
                index,
                ops: segment.len(),
            });

            if let Err(e) = self.dispatch(engine, index, &segment, &mut report).await {
                error!(session = %self.id, engine = %engine, segment = index, error = %e, "Segment failed");
                self.ctx.event_bus.publish(CoordinatorEvent::SegmentFailed {
                    session_id: self.id.clone(),
                    engine,
                    index,
                    error: e.to_string(),
                });
                if !queue.is_empty() {
                    warn!(session = %self.id, skipped = queue.len(), "Abandoning remaining segments");
                }
                return Err(e);
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            self.ctx.event_bus.publish(CoordinatorEvent::SegmentCompleted {
                session_id: self.id.clone(),
                engine,
                index,
                elapsed_ms,
            });
            report.segments.push(SegmentReport {
                index,
                engine,
                ops: segment.len(),
                elapsed_ms,
            });
            index += 1;
        }

        info!(
            session = %self.id,
            segments = report.segments.len(),
            registered = report.registered.len(),
            released = report.released.len(),
            "DAG complete"
        );
        Ok(report)
    }

    async fn dispatch(
        &self,
        engine: EngineKind,
        index: usize,
        segment: &Segment,
        report: &mut DagReport,
    ) -> Result<()> {
        let client = self.ctx.router.get(engine)?;
        let timeout_secs = self.ctx.dispatch.timeout_secs(engine);
        debug!(session = %self.id, engine = %engine, segment = index, ops = ?segment.op_types(), "Dispatching segment");

        let response = match tokio::time::timeout(
            self.ctx.dispatch.timeout(engine),
            client.run_segment(segment),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(at_segment(e, engine, index)),
            Err(_) => {
                return Err(LatticeError::DispatchTimeout {
                    engine,
                    segment: index,
                    timeout_secs,
                })
            }
        };

        self.apply(segment, &response, report);

        if let Some(failure) = response.first_failure() {
            return Err(LatticeError::EngineDispatch {
                engine,
                segment: index,
                message: format!(
                    "{}: {}",
                    failure.key,
                    failure.message.as_deref().unwrap_or("operation failed")
                ),
            });
        }
        if response.results.len() < segment.len() {
            return Err(LatticeError::EngineDispatch {
                engine,
                segment: index,
                message: format!(
                    "engine answered {} of {} operations",
                    response.results.len(),
                    segment.len()
                ),
            });
        }
        Ok(())
    }

    /// Thread results into the registry up to the first failed operation.
    fn apply(&self, segment: &Segment, response: &SegmentResponse, report: &mut DagReport) {
        for result in response.results.iter().take_while(|r| r.success) {
            let Some(op) = segment.ops().iter().find(|op| op.key == result.key) else {
                warn!(session = %self.id, key = %result.key, "Result for an operation not in the segment");
                continue;
            };

            if op.op_type.releases_handle() {
                self.release(op.parent_keys.first(), report);
            }
            if let Some(handle) = result.handle.clone() {
                let kind = handle.kind();
                if self.ctx.registry.put(&result.key, handle).is_some() {
                    debug!(session = %self.id, key = %result.key, "Handle replaced");
                }
                self.ctx.event_bus.publish(CoordinatorEvent::HandleRegistered {
                    key: result.key.clone(),
                    kind,
                });
                report.registered.push(result.key.clone());
            }
        }
    }

    fn release(&self, key: Option<&String>, report: &mut DagReport) {
        let Some(key) = key else {
            return;
        };
        let Some(handle) = self.ctx.registry.pop(key) else {
            debug!(session = %self.id, key = %key, "Released key was not registered");
            return;
        };
        if let ObjectHandle::QueryManager { ref connection, .. } = handle {
            connection.close();
        }
        self.ctx.event_bus.publish(CoordinatorEvent::HandleReleased {
            key: key.clone(),
            kind: handle.kind(),
        });
        report.released.push(key.clone());
    }
}

/// Attribute a client error to segment `index`. Engine errors keep their
/// message and engine; anything else becomes a dispatch failure of `engine`.
fn at_segment(err: LatticeError, engine: EngineKind, index: usize) -> LatticeError {
    match err {
        LatticeError::EngineDispatch { engine, message, .. } => LatticeError::EngineDispatch {
            engine,
            segment: index,
            message,
        },
        LatticeError::DispatchTimeout {
            engine,
            timeout_secs,
            ..
        } => LatticeError::DispatchTimeout {
            engine,
            segment: index,
            timeout_secs,
        },
        LatticeError::EngineUnavailable(kind) => LatticeError::EngineUnavailable(kind),
        other => LatticeError::EngineDispatch {
            engine,
            segment: index,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use futures::future::BoxFuture;
    use parking_lot::Mutex;

    use lattice_core::traits::EngineClient;
    use lattice_core::types::{ObjectId, OpResult, OpType, Operation, QueryConnection};

    /// Answers every operation successfully, minting handles for the keys in
    /// `handles`; fails operations named in `fail`.
    struct ScriptedEngine {
        kind: EngineKind,
        handles: HashMap<String, ObjectHandle>,
        fail: Vec<String>,
        delay: Option<Duration>,
        seen: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedEngine {
        fn new(kind: EngineKind) -> Self {
            Self {
                kind,
                handles: HashMap::new(),
                fail: Vec::new(),
                delay: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn minting(mut self, key: &str, handle: ObjectHandle) -> Self {
            self.handles.insert(key.to_string(), handle);
            self
        }

        fn failing(mut self, key: &str) -> Self {
            self.fail.push(key.to_string());
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn seen(&self) -> Vec<Vec<String>> {
            self.seen.lock().clone()
        }
    }

    impl EngineClient for ScriptedEngine {
        fn kind(&self) -> EngineKind {
            self.kind
        }

        fn run_segment<'a>(&'a self, segment: &'a Segment) -> BoxFuture<'a, Result<SegmentResponse>> {
            Box::pin(async move {
                self.seen
                    .lock()
                    .push(segment.ops().iter().map(|op| op.key.clone()).collect());
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                let results = segment
                    .ops()
                    .iter()
                    .map(|op| {
                        if self.fail.contains(&op.key) {
                            OpResult::failed(&op.key, "engine rejected op")
                        } else if let Some(handle) = self.handles.get(&op.key) {
                            OpResult::with_handle(&op.key, handle.clone())
                        } else {
                            OpResult::ok(&op.key)
                        }
                    })
                    .collect();
                Ok(SegmentResponse::new(results))
            })
        }
    }

    fn graph(id: u64) -> ObjectHandle {
        ObjectHandle::Graph {
            object_id: ObjectId(id),
            graph_name: "social".into(),
            schema: None,
            directed: false,
        }
    }

    fn session(router: EngineRouter) -> (Session, Arc<ObjectRegistry>, Arc<EventBus>) {
        let registry = Arc::new(ObjectRegistry::new());
        let bus = Arc::new(EventBus::default());
        let ctx = Arc::new(SessionContext {
            partitioner: DagPartitioner::default(),
            router,
            registry: registry.clone(),
            dispatch: DispatchConfig::default(),
            event_bus: bus.clone(),
        });
        (Session::new(SessionId::from_string("test"), ctx), registry, bus)
    }

    #[tokio::test]
    async fn segments_run_in_order_and_register_handles() {
        let analytical = Arc::new(
            ScriptedEngine::new(EngineKind::Analytical)
                .minting("g1", graph(1))
                .minting(
                    "app",
                    ObjectHandle::App {
                        object_id: ObjectId(2),
                        app_name: "sssp".into(),
                        graph_key: "g1".into(),
                    },
                ),
        );
        let router = EngineRouter::new().with_client(analytical.clone());
        let (session, registry, bus) = session(router);
        let mut events = bus.subscribe();

        let dag = DagDef::new(vec![
            Operation::new(OpType::CreateGraph, "g1"),
            Operation::new(OpType::CreateApp, "app").with_parent("g1"),
            Operation::new(OpType::RunApp, "ctx").with_parent("app"),
        ]);
        let report = session.run_dag(&dag).await.unwrap();

        assert_eq!(report.segments.len(), 2);
        assert_eq!(report.registered, vec!["g1", "app"]);
        assert_eq!(analytical.seen(), vec![vec!["g1", "app"], vec!["ctx"]]);
        assert_eq!(registry.keys(), vec!["app", "g1"]);
        assert!(matches!(
            events.recv().await.unwrap(),
            CoordinatorEvent::SegmentDispatched { index: 0, ops: 2, .. }
        ));
    }

    #[tokio::test]
    async fn unload_pops_parent_handle() {
        let analytical =
            Arc::new(ScriptedEngine::new(EngineKind::Analytical).minting("g1", graph(1)));
        let (session, registry, _bus) = session(EngineRouter::new().with_client(analytical));

        session
            .run_dag(&DagDef::new(vec![Operation::new(OpType::CreateGraph, "g1")]))
            .await
            .unwrap();
        assert!(registry.contains("g1"));

        let report = session
            .run_dag(&DagDef::new(vec![
                Operation::new(OpType::UnloadGraph, "unload").with_parent("g1")
            ]))
            .await
            .unwrap();
        assert_eq!(report.released, vec!["g1"]);
        assert!(!registry.contains("g1"));

        // Unloading again is harmless.
        let report = session
            .run_dag(&DagDef::new(vec![
                Operation::new(OpType::UnloadGraph, "unload").with_parent("g1")
            ]))
            .await
            .unwrap();
        assert!(report.released.is_empty());
    }

    #[tokio::test]
    async fn closing_query_closes_connection() {
        let connection = QueryConnection::open();
        let interactive = Arc::new(ScriptedEngine::new(EngineKind::Interactive).minting(
            "q",
            ObjectHandle::QueryManager {
                object_id: ObjectId(5),
                endpoint: "localhost:8182".into(),
                connection: connection.clone(),
            },
        ));
        let (session, registry, _bus) = session(EngineRouter::new().with_client(interactive));

        let dag = DagDef::new(vec![
            Operation::new(OpType::CreateInteractiveQuery, "q"),
            Operation::new(OpType::CloseInteractiveQuery, "close").with_parent("q"),
        ]);
        let report = session.run_dag(&dag).await.unwrap();
        assert_eq!(report.registered, vec!["q"]);
        assert_eq!(report.released, vec!["q"]);
        assert!(registry.is_empty());
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn failure_aborts_remaining_segments() {
        let analytical = Arc::new(
            ScriptedEngine::new(EngineKind::Analytical)
                .minting("g1", graph(1))
                .failing("run"),
        );
        let interactive = Arc::new(ScriptedEngine::new(EngineKind::Interactive));
        let router = EngineRouter::new()
            .with_client(analytical.clone())
            .with_client(interactive.clone());
        let (session, registry, _bus) = session(router);

        let dag = DagDef::new(vec![
            Operation::new(OpType::CreateGraph, "g1"),
            Operation::new(OpType::RunApp, "run").with_parent("g1"),
            Operation::new(OpType::CreateInteractiveQuery, "q").with_parent("g1"),
        ]);
        let err = session.run_dag(&dag).await.unwrap_err();
        match err {
            LatticeError::EngineDispatch {
                engine,
                segment,
                message,
            } => {
                assert_eq!(engine, EngineKind::Analytical);
                assert_eq!(segment, 1);
                assert!(message.contains("run"));
            }
            other => panic!("unexpected error: {}", other),
        }
        // The graph created before the failure stays registered.
        assert!(registry.contains("g1"));
        assert!(interactive.seen().is_empty());
    }

    #[tokio::test]
    async fn missing_engine_is_unavailable() {
        let (session, _registry, _bus) = session(EngineRouter::new());
        let err = session
            .run_dag(&DagDef::new(vec![Operation::new(
                OpType::CreateLearningInstance,
                "gl",
            )]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LatticeError::EngineUnavailable(EngineKind::Learning)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_engine_times_out() {
        let interactive = Arc::new(
            ScriptedEngine::new(EngineKind::Interactive).slow(Duration::from_secs(3600)),
        );
        let (session, _registry, _bus) = session(EngineRouter::new().with_client(interactive));

        let err = session
            .run_dag(&DagDef::new(vec![Operation::new(OpType::GremlinQuery, "q1")]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LatticeError::DispatchTimeout {
                engine: EngineKind::Interactive,
                segment: 0,
                timeout_secs: 120
            }
        ));
    }

    #[tokio::test]
    async fn invalid_dag_dispatches_nothing() {
        let analytical = Arc::new(ScriptedEngine::new(EngineKind::Analytical));
        let (session, _registry, _bus) =
            session(EngineRouter::new().with_client(analytical.clone()));
        let dag = DagDef::new(vec![
            Operation::new(OpType::CreateGraph, "dup"),
            Operation::new(OpType::RunApp, "dup"),
        ]);
        assert!(matches!(
            session.run_dag(&dag).await,
            Err(LatticeError::PartitionInput(_))
        ));
        assert!(analytical.seen().is_empty());
    }

    /// Fails every dispatch with the error built by `error`.
    struct BrokenEngine {
        kind: EngineKind,
        error: fn() -> LatticeError,
    }

    impl EngineClient for BrokenEngine {
        fn kind(&self) -> EngineKind {
            self.kind
        }

        fn run_segment<'a>(&'a self, _segment: &'a Segment) -> BoxFuture<'a, Result<SegmentResponse>> {
            Box::pin(async move { Err((self.error)()) })
        }
    }

    fn refused_connection() -> LatticeError {
        LatticeError::EngineDispatch {
            engine: EngineKind::Analytical,
            segment: 0,
            message: "connect 127.0.0.1:1: refused".into(),
        }
    }

    fn detached_engine() -> LatticeError {
        LatticeError::EngineUnavailable(EngineKind::Analytical)
    }

    fn query_then_graph() -> DagDef {
        DagDef::new(vec![
            Operation::new(OpType::GremlinQuery, "q1"),
            Operation::new(OpType::CreateGraph, "g1"),
        ])
    }

    #[tokio::test]
    async fn client_error_reports_the_failing_segment_once() {
        let router = EngineRouter::new()
            .with_client(Arc::new(ScriptedEngine::new(EngineKind::Interactive)))
            .with_client(Arc::new(BrokenEngine {
                kind: EngineKind::Analytical,
                error: refused_connection,
            }));
        let (session, _registry, _bus) = session(router);

        let err = session.run_dag(&query_then_graph()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Segment 1 failed on analytical engine: connect 127.0.0.1:1: refused"
        );
        assert_eq!(err.engine(), Some(EngineKind::Analytical));
    }

    #[tokio::test]
    async fn detached_engine_stays_unavailable() {
        let router = EngineRouter::new()
            .with_client(Arc::new(ScriptedEngine::new(EngineKind::Interactive)))
            .with_client(Arc::new(BrokenEngine {
                kind: EngineKind::Analytical,
                error: detached_engine,
            }));
        let (session, _registry, _bus) = session(router);

        let err = session.run_dag(&query_then_graph()).await.unwrap_err();
        assert!(matches!(
            err,
            LatticeError::EngineUnavailable(EngineKind::Analytical)
        ));
    }

    #[tokio::test]
    async fn results_after_a_failure_are_not_applied() {
        let analytical = Arc::new(
            ScriptedEngine::new(EngineKind::Analytical)
                .failing("run")
                .minting("after", graph(9)),
        );
        let (session, registry, bus) =
            session(EngineRouter::new().with_client(analytical.clone()));
        let mut events = bus.subscribe();

        // CREATE_APP is not a boundary, so it rides in the RUN_APP segment.
        let dag = DagDef::new(vec![
            Operation::new(OpType::RunApp, "run"),
            Operation::new(OpType::CreateApp, "after"),
        ]);
        let err = session.run_dag(&dag).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Segment 0 failed on analytical engine: run: engine rejected op"
        );
        assert_eq!(analytical.seen(), vec![vec!["run", "after"]]);
        assert!(registry.is_empty());
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, CoordinatorEvent::HandleRegistered { .. }),
                "unexpected {:?}",
                event
            );
        }
    }
}
