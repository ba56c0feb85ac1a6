//! Coordinator behavior against an in-memory catalog and a scripted
//! gateway: crash recovery, claim races, terminal transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use arbor_catalog::{
    ArbitrageRepo, CatalogStore, HistoryLogger, HistoryLoggerConfig, PairSpec, TradeSpec,
    WorkerRepo,
};
use arbor_core::{
    ArbitrageStatus, ExecutionStatus, MarketKind, Pair, Side, VenueId, WorkerRole, WorkerStatus,
};
use arbor_tasks::TaskFetcher;
use arbor_trader::{
    ArbitrageCoordinator, ArbitragePlan, ArbitragePlanner, CoordinatorConfig, GatewayError,
    OrderGateway, PlaceOrder, Placement,
};

/// Scripted gateway: per-venue canned results, call log for assertions.
#[derive(Default)]
struct ScriptedGateway {
    failures: Mutex<HashMap<VenueId, GatewayError>>,
    calls: Mutex<Vec<(VenueId, Side)>>,
    fills: Mutex<HashMap<VenueId, (Decimal, Decimal)>>,
}

impl ScriptedGateway {
    fn fail_on(&self, venue: VenueId, error: GatewayError) {
        self.failures.lock().insert(venue, error);
    }

    fn fill_at(&self, venue: VenueId, price: Decimal, qty: Decimal) {
        self.fills.lock().insert(venue, (price, qty));
    }

    fn calls(&self) -> Vec<(VenueId, Side)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl OrderGateway for ScriptedGateway {
    async fn place_order(&self, request: &PlaceOrder) -> Result<Placement, GatewayError> {
        self.calls.lock().push((request.venue, request.side));
        if let Some(error) = self.failures.lock().get(&request.venue) {
            return Err(error.clone());
        }
        let (price, qty) = self
            .fills
            .lock()
            .get(&request.venue)
            .copied()
            .unwrap_or((dec!(100), request.qty));
        Ok(Placement {
            venue_order_id: format!("{}-{}", request.venue, request.client_order_id),
            filled_qty: qty.min(request.qty),
            avg_price: price,
            commission: dec!(0.01),
            commission_asset: "USDT".into(),
            status: ExecutionStatus::Filled,
        })
    }

    async fn cancel_order(
        &self,
        _venue: VenueId,
        _pair: &Pair,
        _venue_order_id: &str,
    ) -> Result<(), GatewayError> {
        Ok(())
    }
}

/// Planner that always crosses Binance (buy) against Bybit (sell).
struct FixedPlanner;

impl ArbitragePlanner for FixedPlanner {
    fn plan(&self, legs: &[arbor_core::TradeTask]) -> Option<ArbitragePlan> {
        let buy_leg = legs.iter().find(|leg| leg.venue == VenueId::Binance)?;
        let sell_leg = legs.iter().find(|leg| leg.venue == VenueId::Bybit)?;
        Some(ArbitragePlan {
            buy: PlaceOrder::market_order(
                buy_leg.venue,
                buy_leg.market,
                buy_leg.pair.clone(),
                buy_leg.account_id,
                Side::Buy,
                dec!(1),
            ),
            sell: PlaceOrder::market_order(
                sell_leg.venue,
                sell_leg.market,
                sell_leg.pair.clone(),
                sell_leg.account_id,
                Side::Sell,
                dec!(1),
            ),
        })
    }
}

struct Fixture {
    store: Arc<CatalogStore>,
    repo: ArbitrageRepo,
    history: HistoryLogger,
    gateway: Arc<ScriptedGateway>,
    coordinator: Arc<ArbitrageCoordinator>,
    trade_id: i64,
}

fn fixture() -> Fixture {
    let store = Arc::new(CatalogStore::open_in_memory().unwrap());
    let binance_pair = store
        .upsert_pair(&PairSpec {
            market: MarketKind::Spot,
            base: "BTC".into(),
            quote: "USDT".into(),
            venue: VenueId::Binance,
        })
        .unwrap();
    let bybit_pair = store
        .upsert_pair(&PairSpec {
            market: MarketKind::Spot,
            base: "BTC".into(),
            quote: "USDT".into(),
            venue: VenueId::Bybit,
        })
        .unwrap();
    let binance_account = store.upsert_account(VenueId::Binance, 1).unwrap();
    let bybit_account = store.upsert_account(VenueId::Bybit, 1).unwrap();
    let trade_id = store
        .insert_trade(&TradeSpec {
            owner_id: 1,
            type_code: 6,
            max_amount: dec!(1),
            max_open_orders: 4,
            max_position: dec!(5),
            update_interval_sec: 10,
            slippage_pct: 0.5,
            fin_protection: false,
            bbo_only: true,
            links: vec![(binance_pair, binance_account), (bybit_pair, bybit_account)],
        })
        .unwrap();

    let repo = ArbitrageRepo::new(store.clone());
    let history = HistoryLogger::new(store.clone(), HistoryLoggerConfig::default());
    let gateway = Arc::new(ScriptedGateway::default());
    let fetcher = Arc::new(TaskFetcher::new(store.clone()));
    fetcher.fetch().unwrap();
    let coordinator = Arc::new(ArbitrageCoordinator::new(
        repo.clone(),
        history.clone(),
        gateway.clone(),
        Arc::new(FixedPlanner),
        fetcher,
        CoordinatorConfig {
            order_retry_backoff: Duration::from_millis(5),
            ..CoordinatorConfig::default()
        },
    ));
    Fixture {
        store,
        repo,
        history,
        gateway,
        coordinator,
        trade_id,
    }
}

#[tokio::test]
async fn crash_recovery_suspends_orphans_and_claims_new() {
    let fixture = fixture();
    // id1: InProgress owned by a worker absent from DAEMON_STATE.
    let orphan = fixture.repo.create(fixture.trade_id).unwrap();
    assert!(fixture.repo.claim(orphan).unwrap());
    // id2: a fresh New record.
    let fresh = fixture.repo.create(fixture.trade_id).unwrap();

    fixture.gateway.fill_at(VenueId::Binance, dec!(64000), dec!(1));
    fixture.gateway.fill_at(VenueId::Bybit, dec!(64100), dec!(1));

    let report = fixture.coordinator.recover().unwrap();
    assert_eq!(report.suspended, 1);
    assert_eq!(
        fixture.repo.get(orphan).unwrap().unwrap().status,
        ArbitrageStatus::Suspend
    );

    // A second worker racing on the same rows loses the claim.
    let executed = fixture.coordinator.poll_once().await.unwrap();
    assert_eq!(executed, 1);
    assert!(!fixture.repo.claim(fresh).unwrap());
    assert_eq!(
        fixture.repo.get(fresh).unwrap().unwrap().status,
        ArbitrageStatus::Complete
    );
}

#[tokio::test]
async fn live_owner_protects_in_progress_rows() {
    let fixture = fixture();
    let worker = WorkerRepo::new(fixture.store.clone(), "live-host".into());
    worker.register(WorkerRole::Trader).unwrap();
    worker.set_status(WorkerStatus::Running).unwrap();
    worker
        .set_active_configs(None, Some(fixture.trade_id))
        .unwrap();

    let record = fixture.repo.create(fixture.trade_id).unwrap();
    assert!(fixture.repo.claim(record).unwrap());
    let report = fixture.coordinator.recover().unwrap();
    assert_eq!(report.suspended, 0);
}

#[tokio::test]
async fn profitable_round_trip_completes_with_amounts() {
    let fixture = fixture();
    let record = fixture.repo.create(fixture.trade_id).unwrap();
    fixture.gateway.fill_at(VenueId::Binance, dec!(64000), dec!(1));
    fixture.gateway.fill_at(VenueId::Bybit, dec!(64100), dec!(1));

    assert_eq!(fixture.coordinator.poll_once().await.unwrap(), 1);

    let finished = fixture.repo.get(record).unwrap().unwrap();
    assert_eq!(finished.status, ArbitrageStatus::Complete);
    assert_eq!(finished.amount, Some(dec!(1)));
    // 64100 - 64000 minus two 0.01 commissions.
    assert_eq!(finished.calc_profit, Some(dec!(99.98)));

    // Both legs placed, buy before sell.
    assert_eq!(
        fixture.gateway.calls(),
        vec![(VenueId::Binance, Side::Buy), (VenueId::Bybit, Side::Sell)]
    );

    // Executions landed in history; realized pnl on the closing leg.
    fixture.history.flush().unwrap();
    assert_eq!(
        fixture.history.total_pnl(fixture.trade_id).unwrap(),
        dec!(99.98)
    );
}

#[tokio::test]
async fn adverse_fill_lands_in_complete_loss() {
    let fixture = fixture();
    let record = fixture.repo.create(fixture.trade_id).unwrap();
    // Sell venue fills below the buy venue: realized loss.
    fixture.gateway.fill_at(VenueId::Binance, dec!(64000), dec!(1));
    fixture.gateway.fill_at(VenueId::Bybit, dec!(63950), dec!(1));

    fixture.coordinator.poll_once().await.unwrap();
    let finished = fixture.repo.get(record).unwrap().unwrap();
    assert_eq!(finished.status, ArbitrageStatus::CompleteLoss);
    assert!(finished.calc_profit.unwrap() < Decimal::ZERO);
}

#[tokio::test]
async fn terminal_venue_error_moves_to_error() {
    let fixture = fixture();
    let record = fixture.repo.create(fixture.trade_id).unwrap();
    fixture.gateway.fail_on(
        VenueId::Binance,
        GatewayError::Rejected("Account has insufficient balance".into()),
    );

    fixture.coordinator.poll_once().await.unwrap();
    let finished = fixture.repo.get(record).unwrap().unwrap();
    assert_eq!(finished.status, ArbitrageStatus::Error);
    // Terminal rows still carry amounts for invariant checks.
    assert!(finished.amount.is_some());
    assert!(finished.calc_profit.is_some());
    // The sell leg was never attempted.
    assert_eq!(fixture.gateway.calls().len(), 1);
}

#[tokio::test]
async fn suspended_replay_routes_by_partial_fills() {
    let fixture = fixture();
    // A clean suspended record replays to New.
    let clean = fixture.repo.create(fixture.trade_id).unwrap();
    assert!(fixture.repo.claim(clean).unwrap());
    fixture.repo.suspend_orphans(30).unwrap();

    let report = fixture.coordinator.replay_suspended().unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.errored, 0);
    assert_eq!(
        fixture.repo.get(clean).unwrap().unwrap().status,
        ArbitrageStatus::New
    );

    // With fills on the books, the replay routes to Error instead.
    fixture.gateway.fill_at(VenueId::Binance, dec!(64000), dec!(1));
    fixture.gateway.fail_on(
        VenueId::Bybit,
        GatewayError::Rejected("symbol suspended".into()),
    );
    fixture.coordinator.poll_once().await.unwrap();
    fixture.history.flush().unwrap();

    let second = fixture.repo.create(fixture.trade_id).unwrap();
    assert!(fixture.repo.claim(second).unwrap());
    fixture.repo.suspend_orphans(30).unwrap();
    let report = fixture.coordinator.replay_suspended().unwrap();
    assert_eq!(report.errored, 1);
    assert_eq!(
        fixture.repo.get(second).unwrap().unwrap().status,
        ArbitrageStatus::Error
    );
}
