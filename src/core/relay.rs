//! Named cortex endpoints that relay tasks deliver payloads to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use super::error::TaskError;

/// A peripheral module that accepts relayed data.
#[async_trait]
pub trait CortexEndpoint: Send + Sync {
    /// Handle `data` sent by `source` and return a reply.
    async fn receive(&self, source: &str, data: Value) -> Result<Value, TaskError>;
}

/// Endpoints by name.
#[derive(Default)]
pub struct CortexRegistry {
    endpoints: RwLock<HashMap<String, Arc<dyn CortexEndpoint>>>,
}

impl CortexRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` under `name`, returning the one it replaced.
    pub fn register(
        &self,
        name: impl Into<String>,
        endpoint: Arc<dyn CortexEndpoint>,
    ) -> Option<Arc<dyn CortexEndpoint>> {
        let name = name.into();
        info!(cortex = %name, "Cortex registered");
        self.endpoints.write().insert(name, endpoint)
    }

    /// Remove `name`.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn CortexEndpoint>> {
        self.endpoints.write().remove(name)
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.endpoints.read().contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Deliver `data` from `source` to `target`.
    ///
    /// # Errors
    ///
    /// `UnknownCortex` if `target` is not registered, otherwise whatever the
    /// endpoint returns.
    pub async fn relay(&self, source: &str, target: &str, data: Value) -> Result<Value, TaskError> {
        let endpoint = self
            .endpoints
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| TaskError::UnknownCortex(target.to_string()))?;
        debug!(source, target, "Relaying between cortices");
        endpoint.receive(source, data).await
    }
}
