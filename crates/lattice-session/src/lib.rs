//! Session layer: executes partitioned requests segment by segment, threading
//! engine-produced handles through the shared object registry.

pub mod dataload;
pub mod local;
pub mod manager;
pub mod registry;
pub mod router;
pub mod servicer;

pub use dataload::DagLoadTask;
pub use local::CoordinatorLocalEngine;
pub use manager::SessionManager;
pub use registry::ObjectRegistry;
pub use router::EngineRouter;
pub use servicer::{DagReport, SegmentReport, Session, SessionContext};
