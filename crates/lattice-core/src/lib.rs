pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::CoordinatorConfig;
pub use error::{LatticeError, Result};
pub use event::EventBus;
pub use types::*;
