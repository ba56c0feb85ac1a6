//! Worker presence rows and the heartbeat loop.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arbor_core::{WorkerRole, WorkerState, WorkerStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{now_micros, now_rfc3339, CatalogError, CatalogResult, CatalogStore};

/// Default cadence of heartbeat writes.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Publishes this worker's presence; peers read it to detect death.
/// The tracker never elects anyone.
#[derive(Clone)]
pub struct WorkerRepo {
    store: Arc<CatalogStore>,
    name: String,
}

impl WorkerRepo {
    pub fn new(store: Arc<CatalogStore>, name: String) -> Self {
        Self { store, name }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Upsert this worker's row: reuse the id on restart, reset status
    /// to Starting either way. Returns the row id.
    pub fn register(&self, role: WorkerRole) -> CatalogResult<i64> {
        self.store.with_conn(|conn| {
            let now = now_rfc3339();
            let micros = now_micros();
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT ID FROM DAEMON_STATE WHERE DAEMON_NAME = ?1",
                    params![self.name],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(id) => {
                    conn.execute(
                        "UPDATE DAEMON_STATE
                         SET STATUS = ?1, ROLE = ?2, LAST_HEARTBEAT = ?3,
                             ERROR_MESSAGE = NULL, DATE_MODIFY = ?4
                         WHERE ID = ?5",
                        params![
                            WorkerStatus::Starting.catalog_code(),
                            role.as_str(),
                            micros,
                            now,
                            id,
                        ],
                    )?;
                    Ok(id)
                }
                None => {
                    conn.execute(
                        "INSERT INTO DAEMON_STATE
                         (DAEMON_NAME, STATUS, ROLE, LAST_HEARTBEAT, DATE_CREATE, DATE_MODIFY)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                        params![
                            self.name,
                            WorkerStatus::Starting.catalog_code(),
                            role.as_str(),
                            micros,
                            now,
                        ],
                    )?;
                    Ok(conn.last_insert_rowid())
                }
            }
        })
    }

    pub fn set_status(&self, status: WorkerStatus) -> CatalogResult<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE DAEMON_STATE
                 SET STATUS = ?1, LAST_HEARTBEAT = ?2, DATE_MODIFY = ?3
                 WHERE DAEMON_NAME = ?4",
                params![status.catalog_code(), now_micros(), now_rfc3339(), self.name],
            )?;
            Ok(())
        })
    }

    pub fn set_error(&self, message: &str) -> CatalogResult<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE DAEMON_STATE
                 SET STATUS = ?1, ERROR_MESSAGE = ?2, LAST_HEARTBEAT = ?3, DATE_MODIFY = ?4
                 WHERE DAEMON_NAME = ?5",
                params![
                    WorkerStatus::Error.catalog_code(),
                    message,
                    now_micros(),
                    now_rfc3339(),
                    self.name,
                ],
            )?;
            Ok(())
        })
    }

    /// Stopped workers clear their error message.
    pub fn mark_stopped(&self) -> CatalogResult<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE DAEMON_STATE
                 SET STATUS = ?1, ERROR_MESSAGE = NULL, DATE_MODIFY = ?2
                 WHERE DAEMON_NAME = ?3",
                params![WorkerStatus::Stopped.catalog_code(), now_rfc3339(), self.name],
            )?;
            Ok(())
        })
    }

    /// Record which monitor/trade configs this worker currently owns.
    pub fn set_active_configs(
        &self,
        monitor_id: Option<i64>,
        trade_id: Option<i64>,
    ) -> CatalogResult<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE DAEMON_STATE
                 SET ACTIVE_MONITORING_ID = ?1, ACTIVE_TRADE_ID = ?2, DATE_MODIFY = ?3
                 WHERE DAEMON_NAME = ?4",
                params![monitor_id, trade_id, now_rfc3339(), self.name],
            )?;
            Ok(())
        })
    }

    pub fn write_heartbeat(&self) -> CatalogResult<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE DAEMON_STATE
                 SET LAST_HEARTBEAT = ?1, DATE_MODIFY = ?2
                 WHERE DAEMON_NAME = ?3",
                params![now_micros(), now_rfc3339(), self.name],
            )?;
            Ok(())
        })
    }

    /// Background loop writing the heartbeat every
    /// [`HEARTBEAT_INTERVAL`] until the token cancels.
    pub async fn heartbeat_loop(self, cancel: CancellationToken) {
        let mut ticker = interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(worker = self.name, "heartbeat loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.write_heartbeat() {
                        warn!(worker = self.name, error = %err, "heartbeat write failed");
                    }
                }
            }
        }
    }

    /// A worker is dead when it has no row, or its row claims Running
    /// but the heartbeat is older than `timeout_sec`.
    pub fn is_dead(store: &CatalogStore, name: &str, timeout_sec: i64) -> CatalogResult<bool> {
        store.with_conn(|conn| {
            let heartbeat: Option<i64> = conn
                .query_row(
                    "SELECT LAST_HEARTBEAT FROM DAEMON_STATE
                     WHERE DAEMON_NAME = ?1 AND STATUS = 'RUNNING'",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            match heartbeat {
                None => Ok(true),
                Some(micros) => Ok(now_micros() - micros > timeout_sec * 1_000_000),
            }
        })
    }

    pub fn get(store: &CatalogStore, name: &str) -> CatalogResult<Option<WorkerState>> {
        store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ID, DAEMON_NAME, STATUS, ROLE, LAST_HEARTBEAT,
                        ACTIVE_MONITORING_ID, ACTIVE_TRADE_ID, ERROR_MESSAGE,
                        DATE_CREATE, DATE_MODIFY
                 FROM DAEMON_STATE WHERE DAEMON_NAME = ?1",
            )?;
            let mut rows = stmt.query_map(params![name], worker_from_row)?;
            match rows.next() {
                Some(row) => Ok(Some(row??)),
                None => Ok(None),
            }
        })
    }

    pub fn all(store: &CatalogStore) -> CatalogResult<Vec<WorkerState>> {
        store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ID, DAEMON_NAME, STATUS, ROLE, LAST_HEARTBEAT,
                        ACTIVE_MONITORING_ID, ACTIVE_TRADE_ID, ERROR_MESSAGE,
                        DATE_CREATE, DATE_MODIFY
                 FROM DAEMON_STATE ORDER BY DATE_CREATE DESC",
            )?;
            let rows = stmt
                .query_map([], worker_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().collect()
        })
    }
}

type RowResult<T> = Result<CatalogResult<T>, rusqlite::Error>;

fn worker_from_row(row: &Row<'_>) -> RowResult<WorkerState> {
    let status_text: String = row.get(2)?;
    let role_text: String = row.get(3)?;
    let created_text: String = row.get(8)?;
    let modified_text: String = row.get(9)?;
    Ok((|| {
        Ok(WorkerState {
            id: row.get(0)?,
            name: row.get(1)?,
            status: WorkerStatus::from_str(&status_text).map_err(CatalogError::InvalidRow)?,
            role: WorkerRole::from_str(&role_text).map_err(CatalogError::InvalidRow)?,
            last_heartbeat_micros: row.get(4)?,
            active_monitor_id: row.get(5)?,
            active_trade_id: row.get(6)?,
            error_message: row.get(7)?,
            created: parse_time(&created_text)?,
            modified: parse_time(&modified_text)?,
        })
    })())
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, CatalogError> {
    DateTime::parse_from_rfc3339(text)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|_| CatalogError::InvalidRow(format!("bad timestamp '{text}'")))
}
