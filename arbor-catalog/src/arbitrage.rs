//! Arbitrage transaction repository: guarded state transitions with
//! crash recovery.

use arbor_core::{Amount, ArbitrageStatus, ArbitrageTransaction};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use rust_decimal::Decimal;
use tracing::info;

use crate::{now_micros, now_rfc3339, CatalogError, CatalogResult, CatalogStore};

/// Repository over ARBITRAGE_TRANS. Wraps the shared store; cheap to
/// clone per task.
#[derive(Clone)]
pub struct ArbitrageRepo {
    store: std::sync::Arc<CatalogStore>,
}

impl ArbitrageRepo {
    pub fn new(store: std::sync::Arc<CatalogStore>) -> Self {
        Self { store }
    }

    /// Insert a fresh `New` record, returning its id.
    pub fn create(&self, trade_id: i64) -> CatalogResult<i64> {
        self.store.with_conn(|conn| {
            let now = now_rfc3339();
            conn.execute(
                "INSERT INTO ARBITRAGE_TRANS (TRADE_ID, STATUS, DATE_CREATE, DATE_MODIFY)
                 VALUES (?1, ?2, ?3, ?3)",
                params![trade_id, ArbitrageStatus::New.code(), now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get(&self, id: i64) -> CatalogResult<Option<ArbitrageTransaction>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ID, TRADE_ID, STATUS, AMOUNT, CALC_PROFIT, DATE_CREATE, DATE_MODIFY
                 FROM ARBITRAGE_TRANS WHERE ID = ?1",
            )?;
            let mut rows = stmt.query_map(params![id], transaction_from_row)?;
            match rows.next() {
                Some(row) => Ok(Some(row??)),
                None => Ok(None),
            }
        })
    }

    /// `New` records above the poll cursor, id ascending.
    pub fn fetch_new_above(&self, cursor: i64, limit: usize) -> CatalogResult<Vec<ArbitrageTransaction>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ID, TRADE_ID, STATUS, AMOUNT, CALC_PROFIT, DATE_CREATE, DATE_MODIFY
                 FROM ARBITRAGE_TRANS
                 WHERE STATUS = ?1 AND ID > ?2
                 ORDER BY ID ASC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(
                    params![ArbitrageStatus::New.code(), cursor, limit as i64],
                    transaction_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().collect()
        })
    }

    /// Atomically claim one `New` record. Returns false when another
    /// worker won the race (zero rows affected).
    pub fn claim(&self, id: i64) -> CatalogResult<bool> {
        self.store.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE ARBITRAGE_TRANS SET STATUS = ?1, DATE_MODIFY = ?2
                 WHERE ID = ?3 AND STATUS = ?4",
                params![
                    ArbitrageStatus::InProgress.code(),
                    now_rfc3339(),
                    id,
                    ArbitrageStatus::New.code(),
                ],
            )?;
            Ok(affected == 1)
        })
    }

    /// Guarded transition. Terminal transitions carry the filled amount
    /// and realized profit; the status lanes in
    /// [`ArbitrageStatus::can_transition`] are enforced here.
    pub fn transition(
        &self,
        id: i64,
        from: ArbitrageStatus,
        to: ArbitrageStatus,
        amount: Option<Amount>,
        calc_profit: Option<Decimal>,
    ) -> CatalogResult<bool> {
        if !from.can_transition(to) {
            return Err(CatalogError::IllegalTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.store.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let affected = tx.execute(
                "UPDATE ARBITRAGE_TRANS
                 SET STATUS = ?1,
                     AMOUNT = COALESCE(?2, AMOUNT),
                     CALC_PROFIT = COALESCE(?3, CALC_PROFIT),
                     DATE_MODIFY = ?4
                 WHERE ID = ?5 AND STATUS = ?6",
                params![
                    to.code(),
                    amount.map(|value| value.to_string()),
                    calc_profit.map(|value| value.to_string()),
                    now_rfc3339(),
                    id,
                    from.code(),
                ],
            )?;
            tx.commit()?;
            Ok(affected == 1)
        })
    }

    /// Startup recovery: any `InProgress` record whose owning worker is
    /// not a live `RUNNING` row moves to `Suspend`. Ownership is the
    /// worker whose `ACTIVE_TRADE_ID` matches the record's trade.
    pub fn suspend_orphans(&self, heartbeat_timeout_sec: i64) -> CatalogResult<usize> {
        let stale_before = now_micros() - heartbeat_timeout_sec * 1_000_000;
        let suspended = self.store.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE ARBITRAGE_TRANS
                 SET STATUS = ?1, DATE_MODIFY = ?2
                 WHERE STATUS = ?3
                   AND NOT EXISTS (
                       SELECT 1 FROM DAEMON_STATE ds
                       WHERE ds.ACTIVE_TRADE_ID = ARBITRAGE_TRANS.TRADE_ID
                         AND ds.STATUS = 'RUNNING'
                         AND ds.LAST_HEARTBEAT > ?4
                   )",
                params![
                    ArbitrageStatus::Suspend.code(),
                    now_rfc3339(),
                    ArbitrageStatus::InProgress.code(),
                    stale_before,
                ],
            )?;
            Ok(affected)
        })?;
        if suspended > 0 {
            info!(suspended, "suspended orphaned in-progress transactions");
        }
        Ok(suspended)
    }

    /// Suspended records eligible for replay.
    pub fn fetch_suspended(&self) -> CatalogResult<Vec<ArbitrageTransaction>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ID, TRADE_ID, STATUS, AMOUNT, CALC_PROFIT, DATE_CREATE, DATE_MODIFY
                 FROM ARBITRAGE_TRANS WHERE STATUS = ?1 ORDER BY ID ASC",
            )?;
            let rows = stmt
                .query_map(params![ArbitrageStatus::Suspend.code()], transaction_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().collect()
        })
    }

    /// Whether any fills were recorded for the trade; decides Suspend
    /// recovery toward `New` (clean replay) or `Error` (partial state).
    pub fn has_partial_fills(&self, trade_id: i64) -> CatalogResult<bool> {
        self.store.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM TRADE_HISTORY WHERE TRADE_ID = ?1",
                params![trade_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }
}

type RowResult<T> = Result<CatalogResult<T>, rusqlite::Error>;

fn transaction_from_row(row: &Row<'_>) -> RowResult<ArbitrageTransaction> {
    let status_code: i64 = row.get(2)?;
    let amount_text: Option<String> = row.get(3)?;
    let profit_text: Option<String> = row.get(4)?;
    let created_text: String = row.get(5)?;
    let modified_text: String = row.get(6)?;
    Ok((|| {
        let status = ArbitrageStatus::from_code(status_code)
            .ok_or_else(|| CatalogError::InvalidRow(format!("bad status {status_code}")))?;
        let amount = amount_text
            .map(|text| text.parse())
            .transpose()
            .map_err(|_| CatalogError::InvalidRow("bad AMOUNT".into()))?;
        let calc_profit = profit_text
            .map(|text| text.parse())
            .transpose()
            .map_err(|_| CatalogError::InvalidRow("bad CALC_PROFIT".into()))?;
        Ok(ArbitrageTransaction {
            id: row.get(0)?,
            trade_id: row.get(1)?,
            status,
            amount,
            calc_profit,
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn repo() -> (Arc<CatalogStore>, ArbitrageRepo) {
        let store = Arc::new(CatalogStore::open_in_memory().unwrap());
        (store.clone(), ArbitrageRepo::new(store))
    }

    #[test]
    fn claim_wins_exactly_once() {
        let (_store, repo) = repo();
        let id = repo.create(10).unwrap();
        assert!(repo.claim(id).unwrap());
        // The losing worker sees zero rows affected.
        assert!(!repo.claim(id).unwrap());
        let record = repo.get(id).unwrap().unwrap();
        assert_eq!(record.status, ArbitrageStatus::InProgress);
    }

    #[test]
    fn terminal_transition_writes_amount_and_profit() {
        let (_store, repo) = repo();
        let id = repo.create(10).unwrap();
        assert!(repo.claim(id).unwrap());
        assert!(repo
            .transition(
                id,
                ArbitrageStatus::InProgress,
                ArbitrageStatus::Complete,
                Some("0.5".parse().unwrap()),
                Some("12.25".parse().unwrap()),
            )
            .unwrap());
        let record = repo.get(id).unwrap().unwrap();
        assert_eq!(record.status, ArbitrageStatus::Complete);
        assert_eq!(record.amount, Some("0.5".parse().unwrap()));
        assert_eq!(record.calc_profit, Some("12.25".parse().unwrap()));
    }

    #[test]
    fn illegal_transition_is_rejected_client_side() {
        let (_store, repo) = repo();
        let id = repo.create(10).unwrap();
        let err = repo
            .transition(id, ArbitrageStatus::New, ArbitrageStatus::Complete, None, None)
            .unwrap_err();
        assert!(matches!(err, CatalogError::IllegalTransition { .. }));
    }

    #[test]
    fn orphaned_in_progress_rows_suspend() {
        let (store, repo) = repo();
        let id = repo.create(10).unwrap();
        assert!(repo.claim(id).unwrap());
        // No DAEMON_STATE row owns trade 10, so the record is orphaned.
        let suspended = repo.suspend_orphans(30).unwrap();
        assert_eq!(suspended, 1);
        assert_eq!(
            repo.get(id).unwrap().unwrap().status,
            ArbitrageStatus::Suspend
        );

        // A live worker owning the trade protects its record.
        let worker = crate::WorkerRepo::new(store, "host-1".into());
        worker.register(arbor_core::WorkerRole::Trader).unwrap();
        worker.set_status(arbor_core::WorkerStatus::Running).unwrap();
        worker.set_active_configs(None, Some(11)).unwrap();
        let id2 = repo.create(11).unwrap();
        assert!(repo.claim(id2).unwrap());
        assert_eq!(repo.suspend_orphans(30).unwrap(), 0);
        assert_eq!(
            repo.get(id2).unwrap().unwrap().status,
            ArbitrageStatus::InProgress
        );
    }

    #[test]
    fn new_records_poll_above_cursor_in_order() {
        let (_store, repo) = repo();
        let first = repo.create(1).unwrap();
        let second = repo.create(1).unwrap();
        let third = repo.create(1).unwrap();
        let fetched = repo.fetch_new_above(first, 10).unwrap();
        assert_eq!(
            fetched.iter().map(|record| record.id).collect::<Vec<_>>(),
            vec![second, third]
        );
    }
}
