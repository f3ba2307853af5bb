//! External read path for scan nodes.
//!
//! A [`Connector`] opens [`Connection`]s; a [`Scanner`] reads rows of one
//! table through a connection. The [`Catalog`] binds table names used by
//! scan nodes to a scanner and the connector it reads through.

mod memory;

use fxhash::FxHashMap;
use std::sync::Arc;

use crate::types::{Key, Value};

pub use memory::{MemoryConnection, MemoryConnector, MemoryScanner, MemoryTable};

/// Untyped row returned by a scanner, keyed by field name.
pub type ScanRow = FxHashMap<String, Value>;

/// Errors raised by connectors, connections and scanners.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Failed to open a connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection was used after being closed.
    #[error("connection closed")]
    Closed,

    /// The scan itself failed.
    #[error("read error: {0}")]
    ReadError(String),

    /// A connector with this name is already registered.
    #[error("duplicate connector: {0}")]
    DuplicateConnector(String),

    /// No connector with this name is registered.
    #[error("unknown connector: {0}")]
    UnknownConnector(String),
}

/// Transport resource owned by one driver context.
pub trait Connection: Send {
    /// Name of the connector that opened this connection.
    fn connector_name(&self) -> &str;

    /// Whether the connection can still be used.
    fn is_open(&self) -> bool;

    /// Releases the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] if the transport fails to close cleanly.
    fn close(&mut self) -> Result<(), ConnectorError>;
}

/// Factory for connections; connections are cached per connector name.
pub trait Connector: Send + Sync {
    /// Connector identity.
    fn name(&self) -> &str;

    /// Opens a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::ConnectionFailed`] if the transport is unavailable.
    fn connect(&self) -> Result<Box<dyn Connection>, ConnectorError>;
}

/// Reads rows of one table.
pub trait Scanner: Send + Sync {
    /// Returns the rows matching `key`: all rows for [`Key::All`], otherwise
    /// exact matches on every key field.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] if the read fails.
    fn scan(&self, connection: &mut dyn Connection, key: &Key) -> Result<Vec<ScanRow>, ConnectorError>;
}

/// A table bound to its scanner and connector.
#[derive(Clone)]
pub struct TableBinding {
    /// Reads the table.
    pub scanner: Arc<dyn Scanner>,
    /// Connector the scanner reads through.
    pub connector: Arc<dyn Connector>,
}

/// Read-only registry of connectors and tables.
#[derive(Default)]
pub struct Catalog {
    connectors: FxHashMap<String, Arc<dyn Connector>>,
    tables: FxHashMap<String, TableBinding>,
}

impl Catalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connector under its own name.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::DuplicateConnector`] if the name is taken.
    pub fn register_connector(&mut self, connector: Arc<dyn Connector>) -> Result<(), ConnectorError> {
        let name = connector.name().to_string();
        if self.connectors.contains_key(&name) {
            return Err(ConnectorError::DuplicateConnector(name));
        }
        self.connectors.insert(name, connector);
        Ok(())
    }

    /// Binds `table` to `scanner`, reading through the named connector.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::UnknownConnector`] if the connector is not registered.
    pub fn register_table(
        &mut self,
        table: impl Into<String>,
        connector: &str,
        scanner: Arc<dyn Scanner>,
    ) -> Result<(), ConnectorError> {
        let connector = self
            .connectors
            .get(connector)
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownConnector(connector.to_string()))?;
        self.tables.insert(table.into(), TableBinding { scanner, connector });
        Ok(())
    }

    /// Binding of `table`.
    #[must_use]
    pub fn table(&self, table: &str) -> Option<&TableBinding> {
        self.tables.get(table)
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tables: Vec<&String> = self.tables.keys().collect();
        tables.sort_unstable();
        f.debug_struct("Catalog")
            .field("connectors", &self.connectors.len())
            .field("tables", &tables)
            .finish()
    }
}
