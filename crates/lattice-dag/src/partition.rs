use std::collections::{HashSet, VecDeque};

use tracing::debug;

use lattice_core::error::{LatticeError, Result};
use lattice_core::types::{DagDef, EngineKind, Operation, Segment};

use crate::boundary::BoundaryTable;

/// Engine assumed for operations preceding the first boundary operation.
pub const DEFAULT_ENGINE: EngineKind = EngineKind::Analytical;

/// FIFO of dispatch segments produced from one request.
///
/// Segments must be dispatched in the order they come out of `next`; a later
/// segment may address handles minted by an earlier one.
#[derive(Debug, Default)]
pub struct SegmentQueue {
    segments: VecDeque<(EngineKind, Segment)>,
}

impl SegmentQueue {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Pop the next segment to dispatch.
    pub fn next(&mut self) -> Option<(EngineKind, Segment)> {
        self.segments.pop_front()
    }

    /// Look at the remaining segments without consuming them.
    pub fn iter(&self) -> impl Iterator<Item = &(EngineKind, Segment)> {
        self.segments.iter()
    }

    fn push(&mut self, engine: EngineKind, ops: Vec<Operation>) {
        if let Some(segment) = Segment::new(ops) {
            self.segments.push_back((engine, segment));
        }
    }
}

impl IntoIterator for SegmentQueue {
    type Item = (EngineKind, Segment);
    type IntoIter = std::collections::vec_deque::IntoIter<(EngineKind, Segment)>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.into_iter()
    }
}

/// Splits requests into engine-homogeneous dispatch segments.
#[derive(Debug, Clone, Default)]
pub struct DagPartitioner {
    table: BoundaryTable,
}

impl DagPartitioner {
    pub fn new(table: BoundaryTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &BoundaryTable {
        &self.table
    }

    /// Partition `dag` into an ordered queue of segments.
    ///
    /// Every boundary operation opens a new segment for its engine, even when
    /// the open segment already targets that engine. Non-boundary operations
    /// join whatever segment is open.
    pub fn partition(&self, dag: &DagDef) -> Result<SegmentQueue> {
        validate(dag)?;

        let mut queue = SegmentQueue::default();
        let mut current: Vec<Operation> = Vec::new();
        let mut engine = DEFAULT_ENGINE;

        for op in &dag.op {
            if let Some(target) = self.table.classify(op.op_type) {
                if !current.is_empty() {
                    queue.push(engine, std::mem::take(&mut current));
                }
                engine = target;
            }
            current.push(op.clone());
        }
        queue.push(engine, current);

        debug!(ops = dag.len(), segments = queue.len(), "DAG partitioned");
        Ok(queue)
    }
}

/// Partition with the default boundary table.
pub fn partition(dag: &DagDef) -> Result<SegmentQueue> {
    DagPartitioner::default().partition(dag)
}

fn validate(dag: &DagDef) -> Result<()> {
    let mut seen = HashSet::with_capacity(dag.len());
    for (idx, op) in dag.op.iter().enumerate() {
        if op.key.is_empty() {
            return Err(LatticeError::PartitionInput(format!(
                "operation #{} ({:?}) has an empty key",
                idx, op.op_type
            )));
        }
        if !seen.insert(op.key.as_str()) {
            return Err(LatticeError::PartitionInput(format!(
                "duplicate operation key '{}'",
                op.key
            )));
        }
    }
    Ok(())
}
