//! Arbitrage transaction coordinator.
//!
//! Drives persisted transactions through their state machine: recover
//! orphans at startup, claim `New` records in id order, execute the two
//! legs, and land a terminal status with the filled amount and realized
//! profit. Venue failures are never swallowed; the venue's own error
//! text goes to the transaction side log.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use arbor_catalog::{ArbitrageRepo, CatalogResult, HistoryLogger};
use arbor_core::{ArbitrageStatus, ArbitrageTransaction, OrderExecution, TradeTask};
use arbor_tasks::TaskFetcher;

use crate::gateway::{place_with_retry, OrderGateway, PlaceOrder, Placement};
use crate::planner::ArbitragePlanner;

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    /// Heartbeat staleness that marks an owning worker dead.
    pub heartbeat_timeout_sec: i64,
    pub max_order_attempts: u32,
    pub order_retry_backoff: Duration,
    /// Records pulled per poll.
    pub batch_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_timeout_sec: 30,
            max_order_attempts: 3,
            order_retry_backoff: Duration::from_millis(500),
            batch_limit: 50,
        }
    }
}

/// What recovery did, for logs and tests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    /// InProgress records whose worker was dead, moved to Suspend.
    pub suspended: usize,
    /// Suspended records replayed to New.
    pub replayed: usize,
    /// Suspended records with partial fills, moved to Error.
    pub errored: usize,
}

pub struct ArbitrageCoordinator {
    repo: ArbitrageRepo,
    history: HistoryLogger,
    gateway: Arc<dyn OrderGateway>,
    planner: Arc<dyn ArbitragePlanner>,
    fetcher: Arc<TaskFetcher>,
    config: CoordinatorConfig,
    cursor: AtomicI64,
}

impl ArbitrageCoordinator {
    pub fn new(
        repo: ArbitrageRepo,
        history: HistoryLogger,
        gateway: Arc<dyn OrderGateway>,
        planner: Arc<dyn ArbitragePlanner>,
        fetcher: Arc<TaskFetcher>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            repo,
            history,
            gateway,
            planner,
            fetcher,
            config,
            cursor: AtomicI64::new(0),
        }
    }

    /// Startup recovery: orphaned `InProgress` records (owning worker
    /// dead or absent) move to `Suspend`. No error message is assumed
    /// to be present on the dead worker's row. Suspended records stay
    /// put until [`Self::replay_suspended`] is invoked explicitly.
    pub fn recover(&self) -> CatalogResult<RecoveryReport> {
        let report = RecoveryReport {
            suspended: self
                .repo
                .suspend_orphans(self.config.heartbeat_timeout_sec)?,
            ..RecoveryReport::default()
        };
        info!(suspended = report.suspended, "arbitrage startup recovery complete");
        Ok(report)
    }

    /// Operator-driven replay of suspended records: clean ones return
    /// to `New`, records with fills already on the books are
    /// irrecoverable and land in `Error` for approval.
    pub fn replay_suspended(&self) -> CatalogResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for record in self.repo.fetch_suspended()? {
            if self.repo.has_partial_fills(record.trade_id)? {
                if self.repo.transition(
                    record.id,
                    ArbitrageStatus::Suspend,
                    ArbitrageStatus::Error,
                    Some(Decimal::ZERO),
                    Some(Decimal::ZERO),
                )? {
                    report.errored += 1;
                }
            } else if self.repo.transition(
                record.id,
                ArbitrageStatus::Suspend,
                ArbitrageStatus::New,
                None,
                None,
            )? {
                report.replayed += 1;
            }
        }
        if report.replayed > 0 {
            // Replayed ids sit below the poll cursor; rewind so the
            // next poll picks them up.
            self.cursor.store(0, Ordering::Release);
        }
        info!(
            replayed = report.replayed,
            errored = report.errored,
            "suspended transaction replay complete"
        );
        Ok(report)
    }

    /// Poll loop; runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        warn!(error = %err, "arbitrage poll failed");
                    }
                }
            }
        }
    }

    /// One poll: claim and execute every `New` record above the cursor.
    pub async fn poll_once(&self) -> CatalogResult<usize> {
        let cursor = self.cursor.load(Ordering::Acquire);
        let records = self
            .repo
            .fetch_new_above(cursor, self.config.batch_limit)?;
        let mut executed = 0usize;
        for record in records {
            self.cursor.store(record.id, Ordering::Release);
            // Zero rows affected means another worker won this record.
            if !self.repo.claim(record.id)? {
                continue;
            }
            self.execute(&record).await?;
            executed += 1;
        }
        Ok(executed)
    }

    async fn execute(&self, record: &ArbitrageTransaction) -> CatalogResult<()> {
        let snapshot = self.fetcher.last();
        let legs: Vec<TradeTask> = snapshot
            .trade_tasks
            .iter()
            .filter(|task| task.id == record.trade_id && task.strategy.is_schedulable())
            .cloned()
            .collect();
        if legs.len() < 2 {
            return self.fail(record, "trade config missing or incomplete");
        }
        let Some(plan) = self.planner.plan(&legs) else {
            return self.fail(record, "no executable plan for current books");
        };

        let buy = match self.place(&plan.buy).await {
            Ok(placement) => placement,
            Err(message) => return self.fail(record, &message),
        };
        self.log_execution(record, &plan.buy, &buy, None);

        let sell = match self.place(&plan.sell).await {
            Ok(placement) => placement,
            Err(message) => {
                // The buy leg already filled; its execution is on
                // record, so recovery routes this to Error, not replay.
                return self.fail(record, &message);
            }
        };

        let amount = buy.filled_qty.min(sell.filled_qty);
        let profit = sell.avg_price * sell.filled_qty
            - buy.avg_price * buy.filled_qty
            - buy.commission
            - sell.commission;
        self.log_execution(record, &plan.sell, &sell, Some(profit));

        let status = if profit < Decimal::ZERO {
            ArbitrageStatus::CompleteLoss
        } else {
            ArbitrageStatus::Complete
        };
        self.repo.transition(
            record.id,
            ArbitrageStatus::InProgress,
            status,
            Some(amount),
            Some(profit),
        )?;
        info!(
            transaction = record.id,
            trade = record.trade_id,
            %status,
            %amount,
            %profit,
            "arbitrage round trip finished"
        );
        Ok(())
    }

    async fn place(&self, request: &PlaceOrder) -> Result<Placement, String> {
        place_with_retry(
            self.gateway.as_ref(),
            request,
            self.config.max_order_attempts,
            self.config.order_retry_backoff,
        )
        .await
        .map_err(|err| {
            // Side log preserving the venue's own words.
            error!(
                venue = %request.venue,
                pair = %request.pair,
                side = ?request.side,
                venue_error = err.venue_message(),
                "order placement failed"
            );
            err.venue_message().to_string()
        })
    }

    fn fail(&self, record: &ArbitrageTransaction, message: &str) -> CatalogResult<()> {
        warn!(
            transaction = record.id,
            trade = record.trade_id,
            message,
            "arbitrage transaction errored"
        );
        self.repo.transition(
            record.id,
            ArbitrageStatus::InProgress,
            ArbitrageStatus::Error,
            Some(Decimal::ZERO),
            Some(Decimal::ZERO),
        )?;
        Ok(())
    }

    fn log_execution(
        &self,
        record: &ArbitrageTransaction,
        request: &PlaceOrder,
        placement: &Placement,
        realized_pnl: Option<Decimal>,
    ) {
        let (pair_id, account_id) = self
            .fetcher
            .last()
            .trade_tasks
            .iter()
            .find(|task| task.id == record.trade_id && task.venue == request.venue)
            .map(|task| (task.pair_id, task.account_id))
            .unwrap_or((0, request.account_id));
        let execution = OrderExecution {
            trade_id: record.trade_id,
            venue_order_id: placement.venue_order_id.clone(),
            pair_id,
            account_id,
            side: request.side,
            price: placement.avg_price,
            qty: placement.filled_qty,
            commission: placement.commission,
            commission_asset: placement.commission_asset.clone(),
            executed_micros: Utc::now().timestamp_micros(),
            status: placement.status,
            realized_pnl,
        };
        if let Err(err) = self.history.log(execution) {
            warn!(error = %err, "failed to queue execution for history");
        }
    }
}
