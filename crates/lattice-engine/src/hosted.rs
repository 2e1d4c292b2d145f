use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, info};

use lattice_core::error::{LatticeError, Result};
use lattice_core::event::EventBus;
use lattice_core::traits::EngineLauncher;
use lattice_core::types::{CoordinatorEvent, EngineKind, ProcessState};

const ATTACH_TIMEOUT: Duration = Duration::from_secs(3);

/// Attaches to an engine deployed outside the coordinator's control.
///
/// Nothing is spawned or killed; `start` checks the endpoint is reachable and
/// `stop` only forgets it.
pub struct HostedLauncher {
    kind: EngineKind,
    target: String,
    event_bus: Option<Arc<EventBus>>,
    attached: Mutex<Option<String>>,
}

impl HostedLauncher {
    pub fn new(kind: EngineKind, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            target: endpoint.into(),
            event_bus: None,
            attached: Mutex::new(None),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    fn launch_error(&self, message: impl Into<String>) -> LatticeError {
        LatticeError::EngineLaunch {
            engine: self.kind,
            message: message.into(),
        }
    }

    async fn attach(&self) -> Result<()> {
        if self.attached.lock().is_some() {
            return Err(self.launch_error("engine already attached"));
        }
        let valid = self
            .target
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !valid {
            return Err(self.launch_error(format!(
                "invalid endpoint '{}', expected host:port",
                self.target
            )));
        }

        match tokio::time::timeout(ATTACH_TIMEOUT, TcpStream::connect(&self.target)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(self.launch_error(format!("cannot reach {}: {}", self.target, e)))
            }
            Err(_) => {
                return Err(self.launch_error(format!(
                    "timed out connecting to {} after {}s",
                    self.target,
                    ATTACH_TIMEOUT.as_secs()
                )))
            }
        }

        {
            let mut attached = self.attached.lock();
            if attached.is_some() {
                return Err(self.launch_error("engine already attached"));
            }
            *attached = Some(self.target.clone());
        }
        info!(engine = %self.kind, endpoint = %self.target, "Attached to hosted engine");
        if let Some(ref bus) = self.event_bus {
            bus.publish(CoordinatorEvent::EngineStarted {
                engine: self.kind,
                endpoint: self.target.clone(),
            });
        }
        Ok(())
    }

    fn detach(&self) {
        if self.attached.lock().take().is_none() {
            debug!(engine = %self.kind, "Hosted engine not attached, stop is a no-op");
            return;
        }
        info!(engine = %self.kind, endpoint = %self.target, "Detached from hosted engine");
        if let Some(ref bus) = self.event_bus {
            bus.publish(CoordinatorEvent::EngineStopped { engine: self.kind });
        }
    }
}

impl EngineLauncher for HostedLauncher {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.attach())
    }

    fn stop(&self, _is_dangling: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.detach();
            Ok(())
        })
    }

    fn poll(&self) -> ProcessState {
        if self.attached.lock().is_some() {
            ProcessState::Running
        } else {
            ProcessState::NotStarted
        }
    }

    fn endpoint(&self) -> Option<String> {
        self.attached.lock().clone()
    }
}
