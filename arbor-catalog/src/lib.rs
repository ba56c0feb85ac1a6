//! Relational catalog store.
//!
//! Every persistent concern of the worker lives behind this crate:
//! desired-state task queries, the arbitrage transaction state machine,
//! worker liveness rows, and the trade history batch logger. The store
//! wraps one embedded SQL connection behind a mutex; state transitions
//! run as single guarded UPDATEs so concurrent workers cannot claim the
//! same row twice.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use thiserror::Error;

mod arbitrage;
mod history;
mod schema;
mod tasks;
mod worker;

pub use arbitrage::ArbitrageRepo;
pub use history::{HistoryLogger, HistoryLoggerConfig};
pub use tasks::{MonitoringSpec, PairSpec, TradeSpec};
pub use worker::WorkerRepo;

/// Convenience alias for catalog results.
pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("illegal status transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },
}

/// Handle to the catalog database. Cheap to share via `Arc`.
pub struct CatalogStore {
    conn: Mutex<Connection>,
}

impl CatalogStore {
    /// Open (creating if absent) the catalog at `path` and ensure the
    /// schema exists.
    pub fn open(path: &Path) -> CatalogResult<Self> {
        let conn = Connection::open(path)?;
        schema::bootstrap(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and local tooling.
    pub fn open_in_memory() -> CatalogResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::bootstrap(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        op: impl FnOnce(&Connection) -> CatalogResult<T>,
    ) -> CatalogResult<T> {
        let conn = self.conn.lock().expect("catalog mutex poisoned");
        op(&conn)
    }

    pub(crate) fn with_conn_mut<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> CatalogResult<T>,
    ) -> CatalogResult<T> {
        let mut conn = self.conn.lock().expect("catalog mutex poisoned");
        op(&mut conn)
    }

    /// Liveness probe used at startup and by retry loops.
    pub fn ping(&self) -> CatalogResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }

    /// Upper bound on how long a query waits for a locked database.
    pub fn set_busy_timeout(&self, timeout: std::time::Duration) -> CatalogResult<()> {
        self.with_conn(|conn| {
            conn.busy_timeout(timeout)?;
            Ok(())
        })
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(crate) fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
