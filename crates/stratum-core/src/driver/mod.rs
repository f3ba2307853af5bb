//! # Driver Module
//!
//! Executes a [`Plan`] incrementally against durable per-row state.
//!
//! ## Components
//!
//! - [`Driver`]: the shared, immutable half: plan, catalog, storage, one
//!   [`Builder`] per node.
//! - [`DriverContext`]: one unit of work with its own [`StateCache`],
//!   [`LinkageManager`] and [`InvalidationManager`].
//! - [`BuildOp`]s: the explicit requests builders exchange instead of
//!   calling each other.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let driver = Driver::new(plan, catalog, storage, DriverConfig::default())?;
//! let mut ctx = driver.create_context();
//! let rows = ctx.build_by_name("persist", &Key::of([("id", 1)]))?;
//! ctx.commit()?;
//! ```

mod build;
mod cache;
mod config;
mod context;
mod error;
mod invalidation;
mod journal;
mod lineage;
mod linkage;
mod ops;
mod row;

use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;

use crate::codec::{SerdeManager, TaggedValueSerde, ValueSerde};
use crate::connector::Catalog;
use crate::plan::{NodeId, Plan};
use crate::storage::StateStorage;

pub use build::{
    create_builders, Builder, CrossJoinBuilder, EquijoinBuilder, FilterBuilder, ListAggregateBuilder,
    LookupJoinBuilder, PersistBuilder, ProjectBuilder, ScanBuilder, UnionBuilder, UnnestBuilder, ValuesBuilder,
};
pub use cache::{FlushStats, GetFlags, StateCache, StateCacheStats};
pub use config::{DriverConfig, DEFAULT_FLUSH_BATCH_SIZE};
pub use context::{ContextState, DriverContext};
pub use error::DriverError;
pub use invalidation::{InvalidationManager, InvalidationStats};
pub use journal::{Journal, JournalEntry};
pub use lineage::{Lineage, LineageEntry, LineageGranularity, LineagePolicy, LineageRetention};
pub use linkage::LinkageManager;
pub use ops::{
    BuildOp, GetStateBuildOp, GetStateCallback, OpResult, Ops, RequestBuildOp, RequestCallback, ResponseBuildOp,
    ScanBuildOp, ScanCallback,
};
pub use row::DriverRow;

/// Shared execution state of one plan.
pub struct Driver {
    plan: Arc<Plan>,
    catalog: Arc<Catalog>,
    storage: Arc<dyn StateStorage>,
    serde: Arc<SerdeManager>,
    config: DriverConfig,
    lineage: Arc<LineagePolicy>,
    builders: FxHashMap<NodeId, Box<dyn Builder>>,
}

impl Driver {
    /// Creates a driver encoding attributes with [`TaggedValueSerde`].
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Config`] for an unusable configuration and
    /// [`DriverError::TableNotFound`] for a scan over an unbound table.
    pub fn new(
        plan: Arc<Plan>,
        catalog: Arc<Catalog>,
        storage: Arc<dyn StateStorage>,
        config: DriverConfig,
    ) -> Result<Self, DriverError> {
        Self::with_value_serde(plan, catalog, storage, config, Arc::new(TaggedValueSerde))
    }

    /// Creates a driver with a custom attribute codec.
    ///
    /// # Errors
    ///
    /// See [`Driver::new`].
    pub fn with_value_serde(
        plan: Arc<Plan>,
        catalog: Arc<Catalog>,
        storage: Arc<dyn StateStorage>,
        config: DriverConfig,
        value_serde: Arc<dyn ValueSerde>,
    ) -> Result<Self, DriverError> {
        config.validate().map_err(DriverError::Config)?;
        let lineage = Arc::new(LineagePolicy::new(
            &plan,
            config.lineage_granularity,
            config.lineage_retention,
        ));
        let builders = create_builders(&plan, &catalog, &lineage)?;
        let serde = Arc::new(SerdeManager::new(&plan, value_serde));
        tracing::debug!(
            root = %plan.root().name(),
            nodes = plan.len(),
            stateful = plan.stateful_nodes().count(),
            "driver created"
        );
        Ok(Self {
            plan,
            catalog,
            storage,
            serde,
            config,
            lineage,
            builders,
        })
    }

    /// Starts a unit of work.
    #[must_use]
    pub fn create_context(&self) -> DriverContext<'_> {
        DriverContext::new(self)
    }

    /// The executed plan.
    #[must_use]
    pub fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    /// Table bindings.
    #[must_use]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Durable state backing.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StateStorage> {
        &self.storage
    }

    /// State codec.
    #[must_use]
    pub fn serde(&self) -> &Arc<SerdeManager> {
        &self.serde
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Lineage policy shared by the builders.
    #[must_use]
    pub fn lineage(&self) -> &LineagePolicy {
        &self.lineage
    }

    /// Builder of `node`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NodeNotFound`] if `node` is not in the plan.
    pub fn builder(&self, node: NodeId) -> Result<&dyn Builder, DriverError> {
        self.builders
            .get(&node)
            .map(AsRef::as_ref)
            .ok_or_else(|| DriverError::NodeNotFound(node.to_string()))
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("root", &self.plan.root().name())
            .field("nodes", &self.plan.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
