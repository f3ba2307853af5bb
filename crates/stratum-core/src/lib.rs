//! # Stratum Core
//!
//! Incremental materialized-view execution over durable per-row state.
//!
//! A [`Plan`](plan::Plan) is a directed acyclic graph of relational nodes.
//! Stateful nodes (scans and persists) keep one [`State`](state::State) per
//! output row, keyed by the row id. The [`Driver`](driver::Driver) rebuilds
//! only the states a request touches, records which upstream rows produced
//! each state, and invalidates downstream states when an upstream one
//! changes.
//!
//! This crate provides:
//! - **Plan**: node definitions, validation and topological ordering
//! - **State**: the per-row state machine and its lineage links
//! - **Storage**: the durable state backend trait and an in-memory heap
//! - **Connector**: table scanners and an in-memory connector
//! - **Driver**: builders, the state cache, linkage and invalidation
//!
//! ## Example
//!
//! ```rust,ignore
//! use stratum_core::driver::{Driver, DriverConfig};
//! use stratum_core::types::Key;
//!
//! let driver = Driver::new(plan, catalog, storage, DriverConfig::default())?;
//! let mut ctx = driver.create_context();
//! let rows = ctx.build_by_name("users_by_id", &Key::of([("id", 7)]))?;
//! ctx.commit()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod connector;
pub mod driver;
pub mod plan;
pub mod state;
pub mod storage;
pub mod types;

// Re-export key types
pub use driver::{Driver, DriverConfig, DriverContext};
pub use plan::{Plan, PlanBuilder};
pub use types::{Id, Key, Value};

/// Result type for stratum-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for stratum-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Plan construction errors
    #[error("Plan error: {0}")]
    Plan(#[from] plan::PlanError),

    /// State machine errors
    #[error("State error: {0}")]
    State(#[from] state::StateError),

    /// Storage backend errors
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Connector errors
    #[error("Connector error: {0}")]
    Connector(#[from] connector::ConnectorError),

    /// Encoding errors
    #[error("Codec error: {0}")]
    Codec(#[from] codec::CodecError),

    /// Execution errors
    #[error("Driver error: {0}")]
    Driver(#[from] driver::DriverError),
}
