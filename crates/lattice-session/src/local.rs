use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use lattice_core::error::Result;
use lattice_core::traits::EngineClient;
use lattice_core::types::{EngineKind, OpResult, OpType, Operation, Segment, SegmentResponse};

use crate::registry::ObjectRegistry;

const LOCATION_ATTR: &str = "location";

/// Runs the operations the coordinator handles itself: resolving where data
/// comes from and where results go.
///
/// `DATA_SOURCE` checks its `location`; local paths (plain or `file://`) must
/// exist, remote schemes are passed through for the engines to read.
/// `DATA_SINK` needs a `location` and a registered parent handle to write.
/// Processing stops at the first failed operation.
pub struct CoordinatorLocalEngine {
    registry: Arc<ObjectRegistry>,
}

impl CoordinatorLocalEngine {
    pub fn new(registry: Arc<ObjectRegistry>) -> Self {
        Self { registry }
    }

    async fn run(&self, segment: &Segment) -> Result<SegmentResponse> {
        let mut results = Vec::with_capacity(segment.len());
        for op in segment.ops() {
            let result = match op.op_type {
                OpType::DataSource => self.data_source(op).await,
                OpType::DataSink => self.data_sink(op),
                other => OpResult::failed(
                    &op.key,
                    format!("{:?} cannot run on the coordinator", other),
                ),
            };
            let failed = !result.success;
            results.push(result);
            if failed {
                break;
            }
        }
        Ok(SegmentResponse::new(results))
    }

    async fn data_source(&self, op: &Operation) -> OpResult {
        let Some(location) = op.attr_str(LOCATION_ATTR) else {
            return OpResult::failed(&op.key, "data source has no location");
        };
        match local_path(location) {
            Some(path) => match tokio::fs::metadata(path).await {
                Ok(_) => {
                    debug!(key = %op.key, location = %location, "Local data source resolved");
                    OpResult::ok(&op.key)
                }
                Err(e) => OpResult::failed(
                    &op.key,
                    format!("data source {} is not readable: {}", location, e),
                ),
            },
            None => {
                debug!(key = %op.key, location = %location, "Remote data source passed through");
                OpResult::ok(&op.key)
            }
        }
    }

    fn data_sink(&self, op: &Operation) -> OpResult {
        let Some(location) = op.attr_str(LOCATION_ATTR) else {
            return OpResult::failed(&op.key, "data sink has no location");
        };
        let Some(source) = op.parent_keys.first() else {
            return OpResult::failed(&op.key, "data sink has no input");
        };
        match self.registry.resolve(source) {
            Ok(handle) => {
                info!(
                    key = %op.key,
                    source = %source,
                    object_id = %handle.object_id(),
                    location = %location,
                    "Data sink bound"
                );
                OpResult::ok(&op.key)
            }
            Err(e) => OpResult::failed(&op.key, e.to_string()),
        }
    }
}

/// Filesystem path of a local location, `None` for remote URIs.
fn local_path(location: &str) -> Option<&Path> {
    if let Some(path) = location.strip_prefix("file://") {
        return Some(Path::new(path));
    }
    if location.contains("://") {
        return None;
    }
    Some(Path::new(location))
}

impl EngineClient for CoordinatorLocalEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::CoordinatorLocal
    }

    fn run_segment<'a>(&'a self, segment: &'a Segment) -> BoxFuture<'a, Result<SegmentResponse>> {
        Box::pin(self.run(segment))
    }
}
