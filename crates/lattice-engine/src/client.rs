use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;

use lattice_core::error::{LatticeError, Result};
use lattice_core::traits::{EngineClient, EngineLauncher};
use lattice_core::types::{EngineKind, Operation, Segment, SegmentResponse};

/// Largest reply line accepted from an engine.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Serialize)]
struct SegmentRequest<'a> {
    engine: EngineKind,
    ops: &'a [Operation],
}

/// Dispatches segments as newline-delimited JSON over TCP.
///
/// The endpoint is looked up on the launcher for every dispatch, so a
/// restarted engine is picked up without rebuilding the client. One request
/// line is answered by one [`SegmentResponse`] line.
pub struct TcpEngineClient {
    launcher: Arc<dyn EngineLauncher>,
}

impl TcpEngineClient {
    pub fn new(launcher: Arc<dyn EngineLauncher>) -> Self {
        Self { launcher }
    }

    fn dispatch_error(&self, message: impl Into<String>) -> LatticeError {
        // The session re-stamps the index of the segment being dispatched.
        LatticeError::EngineDispatch {
            engine: self.launcher.kind(),
            segment: 0,
            message: message.into(),
        }
    }

    async fn round_trip(&self, segment: &Segment) -> Result<SegmentResponse> {
        let kind = self.launcher.kind();
        let endpoint = self
            .launcher
            .endpoint()
            .ok_or(LatticeError::EngineUnavailable(kind))?;

        let stream = TcpStream::connect(&endpoint)
            .await
            .map_err(|e| self.dispatch_error(format!("connect {}: {}", endpoint, e)))?;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

        let request = serde_json::to_string(&SegmentRequest {
            engine: kind,
            ops: segment.ops(),
        })?;
        debug!(engine = %kind, endpoint = %endpoint, ops = segment.len(), "Sending segment");
        framed
            .send(request)
            .await
            .map_err(|e| self.dispatch_error(format!("send to {}: {}", endpoint, e)))?;

        let line = match framed.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                return Err(self.dispatch_error(format!("read from {}: {}", endpoint, e)))
            }
            None => {
                return Err(self.dispatch_error(format!(
                    "{} closed the connection without a reply",
                    endpoint
                )))
            }
        };
        let response: SegmentResponse = serde_json::from_str(&line)?;
        Ok(response)
    }
}

impl EngineClient for TcpEngineClient {
    fn kind(&self) -> EngineKind {
        self.launcher.kind()
    }

    fn run_segment<'a>(&'a self, segment: &'a Segment) -> BoxFuture<'a, Result<SegmentResponse>> {
        Box::pin(self.round_trip(segment))
    }
}
