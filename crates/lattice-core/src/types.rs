use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which runtime executes an operation.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Analytical,
    Interactive,
    Learning,
    CoordinatorLocal,
}

impl EngineKind {
    pub const ALL: [EngineKind; 4] = [
        EngineKind::Analytical,
        EngineKind::Interactive,
        EngineKind::Learning,
        EngineKind::CoordinatorLocal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analytical => "analytical",
            Self::Interactive => "interactive",
            Self::Learning => "learning",
            Self::CoordinatorLocal => "coordinator_local",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of operation types a client may submit.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    // analytical engine
    CreateGraph,
    BindApp,
    AddLabels,
    RunApp,
    ContextToNumpy,
    ContextToDataframe,
    ToVineyardTensor,
    ToVineyardDataframe,
    ProjectGraph,
    ProjectToSimple,
    AddColumn,
    UnloadGraph,
    UnloadApp,
    ArchiveGraph,
    Output,
    // interactive engine
    CreateInteractiveQuery,
    Subgraph,
    GremlinQuery,
    FetchGremlinResult,
    CloseInteractiveQuery,
    // learning engine
    CreateLearningInstance,
    CloseLearningInstance,
    // coordinator
    DataSource,
    DataSink,
    // follow whichever engine opened the segment
    CreateApp,
    CopyGraph,
    TransformGraph,
    InduceSubgraph,
    ModifyVertices,
    ModifyEdges,
    GraphToNumpy,
    GraphToDataframe,
    ConsolidateColumns,
    ReportGraph,
    ClearGraph,
}

impl OpType {
    /// Operations whose execution releases the handle named by their first parent key.
    pub fn releases_handle(&self) -> bool {
        matches!(
            self,
            Self::UnloadGraph
                | Self::UnloadApp
                | Self::CloseInteractiveQuery
                | Self::CloseLearningInstance
        )
    }
}

/// One unit of requested work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op_type: OpType,
    pub key: String,
    #[serde(default)]
    pub parent_keys: Vec<String>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Operation {
    pub fn new(op_type: OpType, key: impl Into<String>) -> Self {
        Self {
            op_type,
            key: key.into(),
            parent_keys: Vec::new(),
            attributes: serde_json::Map::new(),
        }
    }

    pub fn with_parent(mut self, key: impl Into<String>) -> Self {
        self.parent_keys.push(key.into());
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Look up a string attribute.
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|v| v.as_str())
    }
}

/// An ordered list of operations making up one client request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DagDef {
    #[serde(default)]
    pub op: Vec<Operation>,
}

impl DagDef {
    pub fn new(op: Vec<Operation>) -> Self {
        Self { op }
    }

    pub fn from_json(s: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn len(&self) -> usize {
        self.op.len()
    }

    pub fn is_empty(&self) -> bool {
        self.op.is_empty()
    }
}

/// A non-empty run of operations dispatched to one engine in a single call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    ops: Vec<Operation>,
}

impl Segment {
    /// Returns `None` for an empty run; a segment always holds at least one operation.
    pub fn new(ops: Vec<Operation>) -> Option<Self> {
        if ops.is_empty() {
            None
        } else {
            Some(Self { ops })
        }
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<Operation> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn op_types(&self) -> Vec<OpType> {
        self.ops.iter().map(|op| op.op_type).collect()
    }
}

/// Identifier of an object in the shared object store.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "o{:016x}", self.0)
    }
}

/// Live connection held by a query manager handle.
///
/// Clones share state; closing one closes all of them.
#[derive(Debug, Clone)]
pub struct QueryConnection {
    open: Arc<AtomicBool>,
}

impl QueryConnection {
    pub fn open() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl Default for QueryConnection {
    fn default() -> Self {
        Self::open()
    }
}

/// Reference to a resource some engine produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectHandle {
    Graph {
        object_id: ObjectId,
        graph_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        schema: Option<serde_json::Value>,
        directed: bool,
    },
    App {
        object_id: ObjectId,
        app_name: String,
        graph_key: String,
    },
    QueryManager {
        object_id: ObjectId,
        endpoint: String,
        #[serde(skip)]
        connection: QueryConnection,
    },
    LearningInstance {
        object_id: ObjectId,
        endpoints: Vec<String>,
    },
    ResultSet {
        object_id: ObjectId,
        source_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows: Option<u64>,
    },
}

impl ObjectHandle {
    pub fn object_id(&self) -> ObjectId {
        match self {
            Self::Graph { object_id, .. }
            | Self::App { object_id, .. }
            | Self::QueryManager { object_id, .. }
            | Self::LearningInstance { object_id, .. }
            | Self::ResultSet { object_id, .. } => *object_id,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Graph { .. } => ObjectKind::Graph,
            Self::App { .. } => ObjectKind::App,
            Self::QueryManager { .. } => ObjectKind::QueryManager,
            Self::LearningInstance { .. } => ObjectKind::LearningInstance,
            Self::ResultSet { .. } => ObjectKind::ResultSet,
        }
    }
}

/// Variant tag of an [`ObjectHandle`].
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Graph,
    App,
    QueryManager,
    LearningInstance,
    ResultSet,
}

/// Liveness of a supervised engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "code", rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    Exited(i32),
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Outcome of one operation within a dispatched segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResult {
    pub key: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<ObjectHandle>,
}

impl OpResult {
    pub fn ok(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            success: true,
            message: None,
            handle: None,
        }
    }

    pub fn with_handle(key: impl Into<String>, handle: ObjectHandle) -> Self {
        Self {
            key: key.into(),
            success: true,
            message: None,
            handle: Some(handle),
        }
    }

    pub fn failed(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            success: false,
            message: Some(message.into()),
            handle: None,
        }
    }
}

/// Engine reply to a segment dispatch, one entry per operation in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentResponse {
    pub results: Vec<OpResult>,
}

impl SegmentResponse {
    pub fn new(results: Vec<OpResult>) -> Self {
        Self { results }
    }

    /// First failed operation, if any.
    pub fn first_failure(&self) -> Option<&OpResult> {
        self.results.iter().find(|r| !r.success)
    }
}

/// Event broadcast to all coordinator subscribers.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// A segment was sent to an engine.
    SegmentDispatched {
        session_id: SessionId,
        engine: EngineKind,
        index: usize,
        ops: usize,
    },
    /// The engine acknowledged every operation of a segment.
    SegmentCompleted {
        session_id: SessionId,
        engine: EngineKind,
        index: usize,
        elapsed_ms: u64,
    },
    /// A segment failed; remaining segments of the request are abandoned.
    SegmentFailed {
        session_id: SessionId,
        engine: EngineKind,
        index: usize,
        error: String,
    },
    HandleRegistered { key: String, kind: ObjectKind },
    HandleReleased { key: String, kind: ObjectKind },
    EngineStarted { engine: EngineKind, endpoint: String },
    EngineStopped { engine: EngineKind },
    /// A job reached a terminal status.
    JobFinished {
        job_id: String,
        kind: String,
        status: String,
        finished_at: DateTime<Utc>,
    },
}
