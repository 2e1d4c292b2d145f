use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Supervises the lifecycle of one engine deployment.
///
/// A launcher owns at most one live engine process at a time. `start` on an
/// already started launcher is rejected rather than leaking a second process.
pub trait EngineLauncher: Send + Sync + 'static {
    /// Engine this launcher brings up.
    fn kind(&self) -> EngineKind;

    /// Bring the engine up. Not retried by the caller on failure.
    fn start(&self) -> BoxFuture<'_, Result<()>>;

    /// Tear the engine down. Idempotent: a second call is a no-op.
    ///
    /// `is_dangling` marks a coordinator whose client went away; the engine is
    /// killed without a graceful shutdown window.
    fn stop(&self, is_dangling: bool) -> BoxFuture<'_, Result<()>>;

    /// Non-blocking liveness check.
    fn poll(&self) -> ProcessState;

    /// Reachable `host:port` of the running engine.
    fn endpoint(&self) -> Option<String>;

    /// Most recent output lines captured from the engine, oldest first.
    fn recent_output(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Dispatches segments to one engine.
pub trait EngineClient: Send + Sync + 'static {
    fn kind(&self) -> EngineKind;

    /// Execute every operation of `segment` in order and report per-operation
    /// results, including any newly minted handles.
    fn run_segment<'a>(&'a self, segment: &'a Segment) -> BoxFuture<'a, Result<SegmentResponse>>;
}
