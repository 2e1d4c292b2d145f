//! Engine launchers: bring analytical, interactive and learning engines up and
//! down, either by supervising a local process tree or by attaching to an
//! externally hosted deployment.

pub mod client;
pub mod hosted;
pub mod local;
pub mod mpi;
pub mod port;
pub mod pump;

use std::sync::Arc;

use lattice_core::config::LauncherConfig;
use lattice_core::event::EventBus;
use lattice_core::traits::EngineLauncher;
use lattice_core::types::EngineKind;

pub use client::TcpEngineClient;
pub use hosted::HostedLauncher;
pub use local::LocalLauncher;

/// Build the launcher described by `config` for `kind`.
pub fn build_launcher(
    kind: EngineKind,
    config: &LauncherConfig,
    event_bus: Option<Arc<EventBus>>,
) -> Arc<dyn EngineLauncher> {
    match config {
        LauncherConfig::Local(local) => {
            let mut launcher = LocalLauncher::new(kind, local.clone());
            if let Some(bus) = event_bus {
                launcher = launcher.with_event_bus(bus);
            }
            Arc::new(launcher)
        }
        LauncherConfig::Hosted { endpoint } => {
            let mut launcher = HostedLauncher::new(kind, endpoint.clone());
            if let Some(bus) = event_bus {
                launcher = launcher.with_event_bus(bus);
            }
            Arc::new(launcher)
        }
    }
}
