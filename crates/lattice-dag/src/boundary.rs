use std::collections::HashMap;

use lattice_core::error::{LatticeError, Result};
use lattice_core::types::{EngineKind, OpType};

/// Operations that need a loaded graph/app or its schema resolved first, or
/// that hand back a handle later operations address.
const ANALYTICAL_BOUNDARY: &[OpType] = &[
    OpType::CreateGraph,
    OpType::BindApp,
    OpType::AddLabels,
    OpType::RunApp,
    OpType::ContextToNumpy,
    OpType::ContextToDataframe,
    OpType::ToVineyardTensor,
    OpType::ToVineyardDataframe,
    OpType::ProjectGraph,
    OpType::ProjectToSimple,
    OpType::AddColumn,
    OpType::UnloadGraph,
    OpType::UnloadApp,
    OpType::ArchiveGraph,
    OpType::Output,
];

const INTERACTIVE_BOUNDARY: &[OpType] = &[
    OpType::CreateInteractiveQuery,
    OpType::Subgraph,
    OpType::GremlinQuery,
    OpType::FetchGremlinResult,
    OpType::CloseInteractiveQuery,
];

const LEARNING_BOUNDARY: &[OpType] = &[
    OpType::CreateLearningInstance,
    OpType::CloseLearningInstance,
];

const COORDINATOR_BOUNDARY: &[OpType] = &[OpType::DataSource, OpType::DataSink];

/// Maps boundary operation types to the engine that must execute them.
///
/// Sets are checked in a fixed order (analytical, interactive, learning,
/// coordinator-local) and must be disjoint. Types outside every set are
/// non-boundary and follow the segment that is currently open.
#[derive(Debug, Clone)]
pub struct BoundaryTable {
    sets: Vec<(EngineKind, Vec<OpType>)>,
    lookup: HashMap<OpType, EngineKind>,
}

impl BoundaryTable {
    /// Build a table from explicit sets, rejecting any op type listed twice.
    pub fn new(sets: Vec<(EngineKind, Vec<OpType>)>) -> Result<Self> {
        let mut lookup = HashMap::new();
        for (engine, ops) in &sets {
            for op in ops {
                if let Some(existing) = lookup.insert(*op, *engine) {
                    return Err(LatticeError::PartitionInput(format!(
                        "{:?} is a boundary for both {} and {}",
                        op, existing, engine
                    )));
                }
            }
        }
        Ok(Self { sets, lookup })
    }

    /// Engine that `op` forces a new segment for, or `None` for non-boundary ops.
    pub fn classify(&self, op: OpType) -> Option<EngineKind> {
        self.lookup.get(&op).copied()
    }

    pub fn is_boundary(&self, op: OpType) -> bool {
        self.lookup.contains_key(&op)
    }

    /// Boundary op types for `engine`, in declaration order.
    pub fn boundary_ops(&self, engine: EngineKind) -> &[OpType] {
        self.sets
            .iter()
            .find(|(e, _)| *e == engine)
            .map(|(_, ops)| ops.as_slice())
            .unwrap_or(&[])
    }
}

impl Default for BoundaryTable {
    fn default() -> Self {
        let sets = vec![
            (EngineKind::Analytical, ANALYTICAL_BOUNDARY.to_vec()),
            (EngineKind::Interactive, INTERACTIVE_BOUNDARY.to_vec()),
            (EngineKind::Learning, LEARNING_BOUNDARY.to_vec()),
            (EngineKind::CoordinatorLocal, COORDINATOR_BOUNDARY.to_vec()),
        ];
        let lookup = sets
            .iter()
            .flat_map(|(engine, ops)| ops.iter().map(move |op| (*op, *engine)))
            .collect();
        Self { sets, lookup }
    }
}
