//! Trade history batch logger.
//!
//! Executed orders buffer in memory and land as one multi-row insert
//! when the buffer fills or the flush interval lapses. A failed insert
//! keeps the buffer and retries with growing backoff; duplicate
//! suppression is the catalog's job via the ORDER_ID unique index.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use arbor_core::OrderExecution;
use rusqlite::params;
use rust_decimal::Decimal;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{now_rfc3339, CatalogResult, CatalogStore};

#[derive(Clone, Debug)]
pub struct HistoryLoggerConfig {
    /// Rows buffered before an immediate flush.
    pub max_buffer: usize,
    /// Longest a row waits before a timed flush.
    pub flush_interval: Duration,
    pub base_retry: Duration,
    pub max_retry: Duration,
}

impl Default for HistoryLoggerConfig {
    fn default() -> Self {
        Self {
            max_buffer: 500,
            flush_interval: Duration::from_secs(2),
            base_retry: Duration::from_secs(1),
            max_retry: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct HistoryLogger {
    store: Arc<CatalogStore>,
    buffer: Arc<Mutex<Vec<OrderExecution>>>,
    config: HistoryLoggerConfig,
}

impl HistoryLogger {
    pub fn new(store: Arc<CatalogStore>, config: HistoryLoggerConfig) -> Self {
        Self {
            store,
            buffer: Arc::new(Mutex::new(Vec::with_capacity(config.max_buffer))),
            config,
        }
    }

    /// Queue one executed order; flushes inline when the buffer is full.
    pub fn log(&self, execution: OrderExecution) -> CatalogResult<()> {
        let should_flush = {
            let mut buffer = self.buffer.lock().expect("history buffer poisoned");
            buffer.push(execution);
            buffer.len() >= self.config.max_buffer
        };
        if should_flush {
            self.flush()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.lock().expect("history buffer poisoned").len()
    }

    /// Write the buffer as one multi-row insert. On failure the rows
    /// stay buffered for the next attempt.
    pub fn flush(&self) -> CatalogResult<()> {
        let batch: Vec<OrderExecution> = {
            let buffer = self.buffer.lock().expect("history buffer poisoned");
            if buffer.is_empty() {
                return Ok(());
            }
            buffer.clone()
        };

        let (inserted, suppressed) = self.insert_batch(&batch)?;
        if inserted + suppressed != batch.len() {
            // Partial landing: keep everything for the next attempt
            // rather than guessing which rows made it.
            warn!(
                inserted,
                suppressed,
                batch = batch.len(),
                "trade history batch landed partially; retaining buffer"
            );
            return Ok(());
        }
        let mut buffer = self.buffer.lock().expect("history buffer poisoned");
        // Only drop what we wrote; rows queued mid-flush stay.
        let drain_len = batch.len().min(buffer.len());
        buffer.drain(..drain_len);
        debug!(rows = inserted, suppressed, "flushed trade history batch");
        Ok(())
    }

    /// Returns (rows inserted, duplicates the ORDER_ID index absorbed).
    /// A suppressed duplicate is persisted state, not a failure.
    fn insert_batch(&self, batch: &[OrderExecution]) -> CatalogResult<(usize, usize)> {
        self.store.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = now_rfc3339();
            let mut inserted = 0usize;
            let mut suppressed = 0usize;
            for execution in batch {
                let affected = tx.execute(
                    "INSERT OR IGNORE INTO TRADE_HISTORY
                     (TRADE_ID, ORDER_ID, PAIR_ID, EAID, SIDE, PRICE, AMOUNT,
                      COMMISSION, COMMISSION_ASSET, STATUS, EXECUTED_AT, PROFIT_LOSS, DATE_CREATE)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        execution.trade_id,
                        execution.venue_order_id,
                        execution.pair_id,
                        execution.account_id,
                        execution.side.catalog_code(),
                        execution.price.to_string(),
                        execution.qty.to_string(),
                        execution.commission.to_string(),
                        execution.commission_asset,
                        execution.status.catalog_code(),
                        execution.executed_micros,
                        execution.realized_pnl.map(|pnl| pnl.to_string()),
                        now,
                    ],
                )?;
                if affected == 1 {
                    inserted += 1;
                } else {
                    suppressed += 1;
                }
            }
            tx.commit()?;
            Ok((inserted, suppressed))
        })
    }

    /// Sum of realized P&L over all non-null rows for a trade.
    pub fn total_pnl(&self, trade_id: i64) -> CatalogResult<Decimal> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT PROFIT_LOSS FROM TRADE_HISTORY
                 WHERE TRADE_ID = ?1 AND PROFIT_LOSS IS NOT NULL",
            )?;
            let mut total = Decimal::ZERO;
            let rows = stmt.query_map(params![trade_id], |row| row.get::<_, String>(0))?;
            for row in rows {
                if let Ok(value) = row?.parse::<Decimal>() {
                    total += value;
                }
            }
            Ok(total)
        })
    }

    /// Periodic flusher with retry backoff; runs until cancelled, then
    /// makes one final drain attempt.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry = self.config.base_retry;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = self.flush() {
                        warn!(error = %err, pending = self.pending(), "final history flush failed");
                    }
                    return;
                }
                _ = ticker.tick() => {
                    match self.flush() {
                        Ok(()) => retry = self.config.base_retry,
                        Err(err) => {
                            warn!(
                                error = %err,
                                pending = self.pending(),
                                retry_in = ?retry,
                                "history flush failed; retaining buffer"
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = tokio::time::sleep(retry) => {}
                            }
                            retry = (retry * 2).min(self.config.max_retry);
                        }
                    }
                }
            }
        }
    }
}
