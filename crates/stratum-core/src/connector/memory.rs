//! In-memory tables, used for embedding and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{Key, Value};

use super::{Connection, Connector, ConnectorError, ScanRow, Scanner};

/// A mutable in-memory table.
#[derive(Debug, Default)]
pub struct MemoryTable {
    rows: RwLock<Vec<ScanRow>>,
    scans: AtomicU64,
}

impl MemoryTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row.
    pub fn insert<K: Into<String>, V: Into<Value>>(&self, row: impl IntoIterator<Item = (K, V)>) {
        self.rows.write().push(to_row(row));
    }

    /// Replaces every row whose `field` equals `value`, or appends if none does.
    pub fn upsert<K: Into<String>, V: Into<Value>>(
        &self,
        field: &str,
        value: impl Into<Value>,
        row: impl IntoIterator<Item = (K, V)>,
    ) {
        let value = value.into();
        let row = to_row(row);
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|r| r.get(field) != Some(&value));
        if rows.len() == before {
            rows.push(row);
        } else {
            rows.insert(0, row);
        }
    }

    /// Removes every row whose `field` equals `value`.
    pub fn delete(&self, field: &str, value: impl Into<Value>) {
        let value = value.into();
        self.rows.write().retain(|r| r.get(field) != Some(&value));
    }

    /// Number of scans served.
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }
}

fn to_row<K: Into<String>, V: Into<Value>>(row: impl IntoIterator<Item = (K, V)>) -> ScanRow {
    row.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

/// Scanner over a [`MemoryTable`].
#[derive(Debug, Clone)]
pub struct MemoryScanner {
    table: Arc<MemoryTable>,
}

impl MemoryScanner {
    /// Scans `table`.
    #[must_use]
    pub fn new(table: Arc<MemoryTable>) -> Self {
        Self { table }
    }
}

impl Scanner for MemoryScanner {
    fn scan(&self, connection: &mut dyn Connection, key: &Key) -> Result<Vec<ScanRow>, ConnectorError> {
        if !connection.is_open() {
            return Err(ConnectorError::Closed);
        }
        self.table.scans.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .table
            .rows
            .read()
            .iter()
            .filter(|row| key.matches(|field| row.get(field)))
            .cloned()
            .collect())
    }
}

/// Connector handing out [`MemoryConnection`]s.
#[derive(Debug)]
pub struct MemoryConnector {
    name: String,
    connects: AtomicU64,
    open: Arc<AtomicU64>,
    available: AtomicBool,
}

impl MemoryConnector {
    /// Creates a connector called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connects: AtomicU64::new(0),
            open: Arc::new(AtomicU64::new(0)),
            available: AtomicBool::new(true),
        }
    }

    /// Number of connections opened so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Number of connections currently open.
    pub fn open_count(&self) -> u64 {
        self.open.load(Ordering::Relaxed)
    }

    /// Makes subsequent `connect` calls fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }
}

impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<Box<dyn Connection>, ConnectorError> {
        if !self.available.load(Ordering::Relaxed) {
            return Err(ConnectorError::ConnectionFailed(format!("{} is unavailable", self.name)));
        }
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.open.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryConnection {
            connector: self.name.clone(),
            open: Some(Arc::clone(&self.open)),
        }))
    }
}

/// Connection opened by a [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryConnection {
    connector: String,
    open: Option<Arc<AtomicU64>>,
}

impl Connection for MemoryConnection {
    fn connector_name(&self) -> &str {
        &self.connector
    }

    fn is_open(&self) -> bool {
        self.open.is_some()
    }

    fn close(&mut self) -> Result<(), ConnectorError> {
        match self.open.take() {
            Some(open) => {
                open.fetch_sub(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(ConnectorError::Closed),
        }
    }
}
