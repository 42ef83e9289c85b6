//! Build a [`SynapticPathways`] from configuration.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::debug;

use crate::config::{PathwaysConfig, SharedConfig};
use crate::core::cache::DeviceCache;
use crate::core::communication::CommunicationTask;
use crate::core::error::AppResult;
use crate::core::relay::CortexRegistry;
use crate::core::task::TaskContext;
use crate::core::tasks::{DisplaySink, TracingDisplay};
use crate::runtime::{SynapticPathways, TokioSpawner};
use crate::transport::{DeviceTransportFactory, TransportFactory};

/// Assembles the façade. Transports default to [`DeviceTransportFactory`]
/// and display frames to [`TracingDisplay`].
pub struct PathwaysBuilder {
    config: PathwaysConfig,
    shared: Option<SharedConfig>,
    factory: Option<Arc<dyn TransportFactory>>,
    display: Option<Arc<dyn DisplaySink>>,
}

impl PathwaysBuilder {
    /// Start from an explicit configuration.
    #[must_use]
    pub fn new(config: PathwaysConfig) -> Self {
        Self {
            config,
            shared: None,
            factory: None,
            display: None,
        }
    }

    /// Load configuration from the environment and the optional JSON file.
    ///
    /// # Errors
    ///
    /// The config file cannot be read or an override does not parse.
    pub fn from_env() -> AppResult<Self> {
        let (config, path) = PathwaysConfig::from_env().context("loading configuration")?;
        let mut shared = SharedConfig::new(config.device.clone());
        if let Some(path) = path {
            shared = shared.with_path(path);
        }
        Ok(Self::new(config).with_shared_config(shared))
    }

    /// Use `shared` as the live device configuration.
    #[must_use]
    pub fn with_shared_config(mut self, shared: SharedConfig) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Replace the transport factory.
    #[must_use]
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Replace the display sink.
    #[must_use]
    pub fn with_display_sink(mut self, display: Arc<dyn DisplaySink>) -> Self {
        self.display = Some(display);
        self
    }

    /// Validate the configuration and build the façade. Must be called
    /// inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Invalid configuration or no runtime.
    pub fn build(self) -> AppResult<Arc<SynapticPathways>> {
        self.config
            .validate()
            .map_err(|e| anyhow!("config invalid: {e}"))?;
        let spawner = TokioSpawner::try_current()
            .ok_or_else(|| anyhow!("SynapticPathways must be built inside a tokio runtime"))?;

        let shared = self
            .shared
            .unwrap_or_else(|| SharedConfig::new(self.config.device.clone()));
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(DeviceTransportFactory::new(shared.clone())));
        let display = self.display.unwrap_or_else(|| Arc::new(TracingDisplay));

        let ctx = TaskContext {
            comm: Arc::new(CommunicationTask::new(
                factory,
                self.config.scheduler.monitor.clone(),
            )),
            cache: Arc::new(DeviceCache::new()),
            cortices: Arc::new(CortexRegistry::new()),
            display,
            spawner,
        };
        debug!(
            default = %self.config.device.connection.default_type,
            "Building pathways"
        );
        Ok(Arc::new(SynapticPathways::new(self.config, shared, ctx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_outside_runtime_fails() {
        let err = PathwaysBuilder::new(PathwaysConfig::default())
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("tokio runtime"));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = PathwaysConfig::default();
        config.scheduler.max_tasks = 0;
        let err = PathwaysBuilder::new(config).build().err().unwrap();
        assert!(err.to_string().contains("config invalid"));
    }

    #[tokio::test]
    async fn built_pathways_start_uninitialized() {
        let pathways = PathwaysBuilder::new(PathwaysConfig::default())
            .build()
            .unwrap();
        let health = pathways.status();
        assert!(!health.ok);
        assert!(!health.initialized);
        assert!(health.scheduler.is_none());
    }
}
