//! End-to-end reconciliation: catalog rows in, pool state out.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use arbor_catalog::{CatalogStore, MonitoringSpec, PairSpec};
use arbor_core::{BookDepth, MarketKind, Pair, VenueId};
use arbor_stream::{PoolConfig, SessionPool};
use arbor_tasks::{SubscriptionController, TaskFetcher};
use arbor_venues::VenueAdapter;

fn test_pool(cap: usize) -> Arc<SessionPool> {
    let mut config = PoolConfig {
        max_pairs_per_session: cap,
        close_grace: Duration::from_millis(50),
        ..PoolConfig::default()
    };
    for venue in VenueId::ALL {
        for market in [MarketKind::Spot, MarketKind::Futures] {
            // Dead endpoint: drivers retry in the background while the
            // routing state stays observable.
            config
                .endpoint_overrides
                .insert((venue, market), "ws://127.0.0.1:9".to_string());
        }
    }
    let (pool, _out_rx, _events_rx) = SessionPool::new(config, CancellationToken::new());
    pool
}

fn seed_pair(store: &CatalogStore, base: &str, venue: VenueId) -> i64 {
    store
        .upsert_pair(&PairSpec {
            market: MarketKind::Spot,
            base: base.to_string(),
            quote: "USDT".to_string(),
            venue,
        })
        .unwrap()
}

fn seed_monitoring(store: &CatalogStore, depth: i64, pair_ids: Vec<i64>) -> i64 {
    store
        .insert_monitoring(&MonitoringSpec {
            owner_id: 1,
            depth_levels: depth,
            batch_size: 500,
            batch_interval_sec: 5,
            ring_buffer_size: 10_000,
            save_interval_sec: 5,
            pair_ids,
        })
        .unwrap()
}

#[tokio::test]
async fn monitor_task_propagates_to_a_session() {
    let store = Arc::new(CatalogStore::open_in_memory().unwrap());
    let btc = seed_pair(&store, "BTC", VenueId::Binance);
    seed_monitoring(&store, 20, vec![btc]);

    let pool = test_pool(40);
    let fetcher = TaskFetcher::new(store);
    let controller = SubscriptionController::new(pool.clone());

    let snapshot = fetcher.fetch().unwrap();
    let diff = controller.merge(&snapshot);
    controller.apply(&diff);

    assert_eq!(
        pool.session_sizes(VenueId::Binance, MarketKind::Spot),
        vec![1]
    );
    assert_eq!(
        pool.holders(VenueId::Binance, MarketKind::Spot, &Pair::from("BTC/USDT")),
        1
    );
    // The subscribe frame that session sends carries the venue's
    // canonical pair token.
    let frame = VenueAdapter::Binance.frame_subscribe(
        &[Pair::from("BTC/USDT")],
        MarketKind::Spot,
        BookDepth::Twenty,
    );
    assert!(String::from_utf8(frame).unwrap().contains("btcusdt@depth20"));
}

#[tokio::test]
async fn depth_upgrade_reissues_the_subscription() {
    let store = Arc::new(CatalogStore::open_in_memory().unwrap());
    let btc = seed_pair(&store, "BTC", VenueId::Binance);
    let monitoring = seed_monitoring(&store, 20, vec![btc]);

    let pool = test_pool(40);
    let fetcher = TaskFetcher::new(store.clone());
    let controller = SubscriptionController::new(pool.clone());

    let diff = controller.merge(&fetcher.fetch().unwrap());
    controller.apply(&diff);

    // Catalog bumps the requested depth to 50.
    store.set_monitoring_depth(monitoring, 50).unwrap();
    let diff = controller.merge(&fetcher.fetch().unwrap());
    assert_eq!(diff.unsubscribe.len(), 1);
    assert_eq!(diff.subscribe.len(), 1);
    assert_eq!(diff.subscribe[0].depth, BookDepth::Fifty);
    controller.apply(&diff);

    // No leak: still exactly one holder of the pair.
    assert_eq!(
        pool.holders(VenueId::Binance, MarketKind::Spot, &Pair::from("BTC/USDT")),
        1
    );
    assert_eq!(pool.total_pairs(), 1);

    // An unchanged catalog produces an empty diff.
    let diff = controller.merge(&fetcher.fetch().unwrap());
    assert!(diff.is_empty());
}

#[tokio::test]
async fn five_pairs_overflow_into_three_sessions() {
    let store = Arc::new(CatalogStore::open_in_memory().unwrap());
    let pairs: Vec<i64> = ["BTC", "ETH", "SOL", "XRP", "ADA"]
        .iter()
        .map(|base| seed_pair(&store, base, VenueId::Bybit))
        .collect();
    seed_monitoring(&store, 20, pairs);

    let pool = test_pool(2);
    let fetcher = TaskFetcher::new(store);
    let controller = SubscriptionController::new(pool.clone());
    let diff = controller.merge(&fetcher.fetch().unwrap());
    controller.apply(&diff);

    assert_eq!(
        pool.session_sizes(VenueId::Bybit, MarketKind::Spot),
        vec![2, 2, 1]
    );
    for base in ["BTC", "ETH", "SOL", "XRP", "ADA"] {
        let pair = Pair::new(base, "USDT");
        assert_eq!(pool.holders(VenueId::Bybit, MarketKind::Spot, &pair), 1);
    }
}

#[tokio::test]
async fn deactivated_config_unsubscribes_everything() {
    let store = Arc::new(CatalogStore::open_in_memory().unwrap());
    let btc = seed_pair(&store, "BTC", VenueId::Okx);
    let monitoring = seed_monitoring(&store, 0, vec![btc]);

    let pool = test_pool(40);
    let fetcher = TaskFetcher::new(store.clone());
    let controller = SubscriptionController::new(pool.clone());
    controller.apply(&controller.merge(&fetcher.fetch().unwrap()));
    assert_eq!(pool.total_pairs(), 1);

    store.set_monitoring_active(monitoring, false).unwrap();
    controller.apply(&controller.merge(&fetcher.fetch().unwrap()));
    assert_eq!(pool.total_pairs(), 0);
    assert_eq!(controller.desired_pairs(), 0);
}
