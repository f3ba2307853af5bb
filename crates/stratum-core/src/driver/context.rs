//! The unit of work: builds, invalidation and commit within one context.
//!
//! # Build flow
//!
//! ```text
//! build(node, key)
//!      │
//!      ▼
//! ┌──────────┐  push ops   ┌──────────┐  Request   ┌────────────────┐
//! │ Builder  │────────────▶│ op queue │───────────▶│ build(source)  │
//! └──────────┘             └──────────┘            └────────────────┘
//!      ▲                     │   │   │  Scan      ┌────────────────┐
//!      │      callback       │   │   └───────────▶│ Connection     │
//!      └─────────────────────┘   │     GetState   ┌────────────────┐
//!                                └───────────────▶│ StateCache     │
//!                                                 └────────────────┘
//! Response ─▶ apply rows to states ─▶ record lineage ─▶ invalidate sinks
//! ```
//!
//! Invalidation happens during builds. `commit` is the durability boundary.

use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::codec::CodecError;
use crate::connector::{Connection, Connector};
use crate::plan::NodeId;
use crate::state::{State, StateKey};
use crate::storage::Span;
use crate::types::{Id, Key};

use super::cache::{FlushStats, GetFlags, StateCache, StateCacheStats};
use super::error::{node_name, DriverError};
use super::invalidation::{InvalidationManager, InvalidationStats};
use super::journal::{Journal, JournalEntry};
use super::linkage::LinkageManager;
use super::ops::{BuildOp, Ops};
use super::row::DriverRow;
use super::Driver;

/// Lifecycle of a [`DriverContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Accepting operations.
    Active,
    /// Committed; no further operations.
    Committed,
    /// Aborted; the working set was dropped.
    Aborted,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Committed => write!(f, "committed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// One build-then-commit cycle over a [`Driver`].
///
/// A context is single-writer. Connections are opened on first use, cached
/// per connector name and closed when the context ends.
pub struct DriverContext<'d> {
    driver: &'d Driver,
    cache: StateCache,
    linkage: LinkageManager,
    invalidation: InvalidationManager,
    connections: FxHashMap<String, Box<dyn Connection>>,
    journal: Option<Journal>,
    state: ContextState,
}

impl<'d> DriverContext<'d> {
    pub(crate) fn new(driver: &'d Driver) -> Self {
        let plan = Arc::clone(driver.plan());
        Self {
            cache: StateCache::new(
                Arc::clone(&plan),
                Arc::clone(driver.storage()),
                Arc::clone(driver.serde()),
                driver.config().flush_batch_size,
            ),
            linkage: LinkageManager::new(),
            invalidation: InvalidationManager::new(plan, driver.config().lineage_retention),
            connections: FxHashMap::default(),
            journal: driver.config().journaling.then(Journal::default),
            state: ContextState::Active,
            driver,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// The working set.
    #[must_use]
    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    /// Edges recorded in this context.
    #[must_use]
    pub fn linkage(&self) -> &LinkageManager {
        &self.linkage
    }

    /// State cache counters.
    #[must_use]
    pub fn stats(&self) -> StateCacheStats {
        self.cache.stats()
    }

    /// Propagation counters.
    #[must_use]
    pub fn invalidation_stats(&self) -> InvalidationStats {
        self.invalidation.stats()
    }

    /// Build journal, if journaling is enabled.
    #[must_use]
    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    fn ensure_active(&self) -> Result<(), DriverError> {
        match self.state {
            ContextState::Active => Ok(()),
            other => Err(DriverError::ContextClosed(other)),
        }
    }

    fn record(&mut self, entry: impl FnOnce() -> JournalEntry) {
        if let Some(journal) = &mut self.journal {
            journal.record(entry());
        }
    }

    /// Builds the rows of `node` matching `key`.
    ///
    /// Stateful rows with ids update their states: a state that needs a build
    /// takes the fresh attributes and propagates invalidation; a usable state
    /// is left as it is.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::EmptyBuild`] if the builder produced no rows,
    /// or the first error raised while building.
    pub fn build(&mut self, node: NodeId, key: &Key) -> Result<Vec<DriverRow>, DriverError> {
        self.ensure_active()?;
        let driver = self.driver;
        let pnode = driver.plan().get(node)?;
        debug!(node = %pnode.name(), key = %key, "build");
        self.record(|| JournalEntry::BuildInput {
            node,
            key: key.clone(),
        });

        let rows = self.run_builder(node, key)?;
        if rows.is_empty() {
            return Err(DriverError::EmptyBuild {
                node: pnode.name().to_string(),
                key: key.clone(),
            });
        }
        if pnode.is_stateful() {
            for row in &rows {
                self.apply_row(row)?;
            }
        }

        self.record(|| JournalEntry::BuildOutput {
            node,
            key: key.clone(),
            rows: rows.len(),
        });
        Ok(rows)
    }

    /// [`DriverContext::build`] by node name.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NodeNotFound`] for an unknown name.
    pub fn build_by_name(&mut self, name: &str, key: &Key) -> Result<Vec<DriverRow>, DriverError> {
        let node = self
            .driver
            .plan()
            .node_by_name(name)
            .ok_or_else(|| DriverError::NodeNotFound(name.to_string()))?
            .id();
        self.build(node, key)
    }

    fn run_builder(&mut self, node: NodeId, key: &Key) -> Result<Vec<DriverRow>, DriverError> {
        let driver = self.driver;
        let builder = driver.builder(node)?;
        let mut ops = Ops::new();
        builder.build(key, &mut ops)?;

        let mut response = None;
        while let Some(op) = ops.pop() {
            trace!(node = %node_name(driver.plan(), op.origin()), op = op.kind_name(), "dispatch");
            self.record(|| JournalEntry::BuildOp {
                origin: op.origin(),
                kind: op.kind_name(),
            });
            match op {
                BuildOp::Request(op) => {
                    let mut results = Vec::with_capacity(op.requests.len());
                    for (source, source_key) in &op.requests {
                        results.push(self.build(*source, source_key)?);
                    }
                    (op.callback)(results, &mut ops)?;
                }
                BuildOp::Scan(op) => {
                    let connection = self.connection(&op.connector)?;
                    let rows = op.scanner.scan(&mut **connection, &op.key)?;
                    (op.callback)(rows, &mut ops)?;
                }
                BuildOp::GetState(op) => {
                    let states = self.cache.get_many(op.node, &op.ids, op.flags)?;
                    (op.callback)(states, &mut ops)?;
                }
                BuildOp::Response(op) => {
                    if op.origin != node || op.key != *key || response.is_some() {
                        return Err(DriverError::UnexpectedResponse {
                            node: node_name(driver.plan(), node),
                            key: key.clone(),
                        });
                    }
                    response = Some(op.rows);
                }
            }
        }
        response.ok_or_else(|| DriverError::MissingResponse {
            node: node_name(driver.plan(), node),
            key: key.clone(),
        })
    }

    fn apply_row(&mut self, row: &DriverRow) -> Result<(), DriverError> {
        let Some(id) = row.id() else {
            return Ok(());
        };
        let key = StateKey::new(row.node(), id.clone());
        let needs_build = self
            .cache
            .get(key.node, id, GetFlags::CREATE)?
            .is_some_and(State::needs_build);
        if needs_build {
            self.cache.set_attributes(&key, row.shared_attributes())?;
        }
        self.linkage
            .add_state_lineage(&mut self.cache, &key, row.lineage())?;
        if needs_build {
            self.invalidation
                .invalidate(&mut self.cache, &self.linkage, &key)?;
        }
        Ok(())
    }

    fn connection(&mut self, connector: &Arc<dyn Connector>) -> Result<&mut Box<dyn Connection>, DriverError> {
        let name = connector.name();
        let stale = self.connections.get(name).map_or(true, |c| !c.is_open());
        if stale {
            debug!(connector = name, "opening connection");
            let connection = connector.connect()?;
            self.connections.insert(name.to_string(), connection);
        }
        self.connections
            .get_mut(name)
            .ok_or_else(|| crate::connector::ConnectorError::UnknownConnector(name.to_string()).into())
    }

    /// Looks up a state directly.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] if `node` is not stateful or storage fails.
    pub fn get_state(&mut self, node: NodeId, id: &Id, flags: GetFlags) -> Result<Option<&State>, DriverError> {
        self.ensure_active()?;
        self.cache.get(node, id, flags)
    }

    /// Marks the given states of `node` stale after an external change.
    /// Ids with no stored state are ignored. Returns the number of states
    /// newly invalidated.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] if `node` is not stateful or storage fails.
    pub fn invalidate(&mut self, node: NodeId, ids: &[Id]) -> Result<usize, DriverError> {
        self.ensure_active()?;
        let mut count = 0;
        for id in ids {
            if self.cache.get(node, id, GetFlags::NONE)?.is_none() {
                continue;
            }
            if self.cache.invalidate(&StateKey::new(node, id.clone()))? {
                count += 1;
            }
        }
        debug!(node = %node_name(self.driver.plan(), node), count, "invalidated");
        Ok(count)
    }

    /// Invalidates up to `limit` stored states of `node` in `span`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] if `node` is not stateful or storage fails.
    pub fn invalidate_span(&mut self, node: NodeId, span: &Span, limit: usize) -> Result<usize, DriverError> {
        self.ensure_active()?;
        let ids = self.driver.storage().get_span_ids(node, span, limit)?;
        self.invalidate(node, &ids)
    }

    /// Rebuilds invalid states, upstream nodes first, until none remain.
    /// A state whose row no longer exists becomes a null-attribute state.
    /// Returns the number of states rebuilt.
    ///
    /// # Errors
    ///
    /// Returns the first build error.
    pub fn refresh(&mut self) -> Result<usize, DriverError> {
        self.ensure_active()?;
        let mut rebuilt = 0;
        while let Some(key) = self.cache.next_invalid() {
            let build_key = self.key_for_id(key.node, &key.id)?;
            self.build(key.node, &build_key)?;
            if self.cache.state(&key)?.needs_build() {
                self.cache.set_attributes(&key, None)?;
                self.invalidation
                    .invalidate(&mut self.cache, &self.linkage, &key)?;
            }
            rebuilt += 1;
        }
        if rebuilt > 0 {
            debug!(rebuilt, "refreshed invalid states");
        }
        Ok(rebuilt)
    }

    /// Invalidates each group of ids, then refreshes.
    ///
    /// # Errors
    ///
    /// Returns the first invalidation or build error.
    pub fn sync(&mut self, ids_by_node: &[(NodeId, Vec<Id>)]) -> Result<usize, DriverError> {
        for (node, ids) in ids_by_node {
            self.invalidate(*node, ids)?;
        }
        self.refresh()
    }

    /// Build key selecting exactly the row of `id` in stateful `node`.
    fn key_for_id(&self, node: NodeId, id: &Id) -> Result<Key, DriverError> {
        let pnode = self.driver.plan().get(node)?;
        let id_fields = pnode
            .kind()
            .id_fields()
            .ok_or_else(|| DriverError::NotStateful(pnode.name().to_string()))?;
        let values = id.to_values()?;
        if values.len() != id_fields.len() {
            return Err(CodecError::Arity {
                expected: id_fields.len(),
                actual: values.len(),
            }
            .into());
        }
        Ok(Key::of(id_fields.iter().map(String::as_str).zip(values)))
    }

    /// Records linkage and flushes every dirty state. On failure the context
    /// stays active and the commit may be retried.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Storage`] if a flush batch fails.
    pub fn commit(&mut self) -> Result<FlushStats, DriverError> {
        self.ensure_active()?;
        let linked = self.linkage.update(&mut self.cache)?;
        let flushed = self.cache.flush()?;
        self.state = ContextState::Committed;
        self.close();
        debug!(linked, states = flushed.states, batches = flushed.batches, "committed");
        Ok(flushed)
    }

    /// Drops the working set without writing anything.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::ContextClosed`] if the context already ended.
    pub fn abort(&mut self) -> Result<(), DriverError> {
        self.ensure_active()?;
        self.cache.clear();
        self.linkage.clear();
        self.state = ContextState::Aborted;
        self.close();
        debug!("aborted");
        Ok(())
    }

    /// Closes every cached connection. Close failures are logged.
    pub fn close(&mut self) {
        for (name, mut connection) in self.connections.drain() {
            if let Err(err) = connection.close() {
                warn!(connector = %name, error = %err, "failed to close connection");
            }
        }
    }
}

impl Drop for DriverContext<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DriverContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverContext")
            .field("state", &self.state)
            .field("cache", &self.cache)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
