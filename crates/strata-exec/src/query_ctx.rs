//! Per-query shared state: configuration, executor, memory arbitrator,
//! operator registry and spill storage.

use std::sync::Arc;

use strata_core::ExecConfig;
use strata_io::build_storage_from_config;
use strata_mem::Storage;
use strata_operators::OperatorRegistry;
use tracing::debug;

use crate::arbitrator::MemoryArbitrator;
use crate::error::Result;
use crate::executor::DriverExecutor;

pub struct QueryCtx {
    query_id: String,
    config: ExecConfig,
    executor: Arc<DriverExecutor>,
    arbitrator: Arc<MemoryArbitrator>,
    registry: Arc<OperatorRegistry>,
    spill_storage: Option<Arc<dyn Storage>>,
}

impl QueryCtx {
    /// A context with its own executor, arbitrator and empty registry.
    pub fn new(config: ExecConfig) -> Result<Arc<Self>> {
        Self::builder(config).build()
    }

    pub fn builder(config: ExecConfig) -> QueryCtxBuilder {
        QueryCtxBuilder {
            config,
            query_id: None,
            executor: None,
            arbitrator: None,
            registry: None,
            spill_storage: None,
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<DriverExecutor> {
        &self.executor
    }

    pub fn arbitrator(&self) -> &Arc<MemoryArbitrator> {
        &self.arbitrator
    }

    pub fn registry(&self) -> &Arc<OperatorRegistry> {
        &self.registry
    }

    /// Present when spilling is enabled.
    pub fn spill_storage(&self) -> Option<&Arc<dyn Storage>> {
        self.spill_storage.as_ref()
    }
}

impl std::fmt::Debug for QueryCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCtx")
            .field("query_id", &self.query_id)
            .field("config", &self.config)
            .field("executor", &self.executor)
            .field("registry", &self.registry)
            .field("spill_storage", &self.spill_storage.is_some())
            .finish()
    }
}

/// Builder for [`QueryCtx`]. Anything not supplied is created from the
/// config; share an executor or arbitrator between contexts to run queries
/// on one pool or one memory budget.
pub struct QueryCtxBuilder {
    config: ExecConfig,
    query_id: Option<String>,
    executor: Option<Arc<DriverExecutor>>,
    arbitrator: Option<Arc<MemoryArbitrator>>,
    registry: Option<Arc<OperatorRegistry>>,
    spill_storage: Option<Arc<dyn Storage>>,
}

impl QueryCtxBuilder {
    pub fn query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    pub fn executor(mut self, executor: Arc<DriverExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn arbitrator(mut self, arbitrator: Arc<MemoryArbitrator>) -> Self {
        self.arbitrator = Some(arbitrator);
        self
    }

    pub fn registry(mut self, registry: Arc<OperatorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Spill storage to use instead of the one derived from the config.
    pub fn spill_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.spill_storage = Some(storage);
        self
    }

    pub fn build(self) -> Result<Arc<QueryCtx>> {
        self.config.validate()?;
        let executor = match self.executor {
            Some(executor) => executor,
            None => Arc::new(DriverExecutor::new(self.config.executor_threads)?),
        };
        let arbitrator = self
            .arbitrator
            .unwrap_or_else(|| Arc::new(MemoryArbitrator::new(self.config.mem_cap_bytes)));
        let spill_storage = match self.spill_storage {
            Some(storage) => Some(storage),
            None if self.config.spill_enabled => {
                Some(build_storage_from_config(&self.config.storage_config())?)
            }
            None => None,
        };
        let query_id = self
            .query_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        debug!(
            query_id = %query_id,
            executor_threads = executor.num_threads(),
            spill = spill_storage.is_some(),
            "query context created"
        );
        Ok(Arc::new(QueryCtx {
            query_id,
            config: self.config,
            executor,
            arbitrator,
            registry: self.registry.unwrap_or_default(),
            spill_storage,
        }))
    }
}
