use std::collections::HashMap;
use std::sync::Arc;

use lattice_core::error::{LatticeError, Result};
use lattice_core::traits::EngineClient;
use lattice_core::types::EngineKind;

/// Maps each engine kind to the client segments are dispatched through.
#[derive(Default, Clone)]
pub struct EngineRouter {
    clients: HashMap<EngineKind, Arc<dyn EngineClient>>,
}

impl EngineRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` under its own kind, replacing any previous one.
    pub fn with_client(mut self, client: Arc<dyn EngineClient>) -> Self {
        self.register(client);
        self
    }

    pub fn register(&mut self, client: Arc<dyn EngineClient>) {
        self.clients.insert(client.kind(), client);
    }

    pub fn get(&self, kind: EngineKind) -> Result<Arc<dyn EngineClient>> {
        self.clients
            .get(&kind)
            .cloned()
            .ok_or(LatticeError::EngineUnavailable(kind))
    }

    pub fn kinds(&self) -> Vec<EngineKind> {
        EngineKind::ALL
            .into_iter()
            .filter(|k| self.clients.contains_key(k))
            .collect()
    }
}

impl std::fmt::Debug for EngineRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRouter")
            .field("engines", &self.kinds())
            .finish()
    }
}
