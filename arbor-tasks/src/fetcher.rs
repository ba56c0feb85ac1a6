//! Periodic catalog reads producing desired-state snapshots.

use std::sync::Arc;
use std::time::Duration;

use arbor_catalog::{CatalogResult, CatalogStore};
use arbor_core::{MonitorTask, TradeTask};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Default cadence of catalog polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One consistent read of the desired Monitor and Trade state.
#[derive(Clone, Debug, Default)]
pub struct TaskSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub monitor_tasks: Vec<MonitorTask>,
    pub trade_tasks: Vec<TradeTask>,
}

/// Reads the catalog and hands out cloned snapshots; callers never see
/// references into the cache.
pub struct TaskFetcher {
    store: Arc<CatalogStore>,
    last: RwLock<Arc<TaskSnapshot>>,
}

impl TaskFetcher {
    pub fn new(store: Arc<CatalogStore>) -> Self {
        Self {
            store,
            last: RwLock::new(Arc::new(TaskSnapshot::default())),
        }
    }

    /// Query both task families; on success the snapshot becomes the
    /// new "last known good".
    pub fn fetch(&self) -> CatalogResult<Arc<TaskSnapshot>> {
        let monitor_tasks = self.store.fetch_monitor_tasks()?;
        let trade_tasks = self.store.fetch_trade_tasks()?;
        let snapshot = Arc::new(TaskSnapshot {
            taken_at: Some(Utc::now()),
            monitor_tasks,
            trade_tasks,
        });
        *self.last.write() = snapshot.clone();
        Ok(snapshot)
    }

    /// Most recent successful snapshot (empty before the first fetch).
    #[must_use]
    pub fn last(&self) -> Arc<TaskSnapshot> {
        self.last.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_catalog::{MonitoringSpec, PairSpec};
    use arbor_core::{MarketKind, VenueId};

    #[test]
    fn failed_fetch_keeps_last_snapshot() {
        let store = Arc::new(CatalogStore::open_in_memory().unwrap());
        let pair = store
            .upsert_pair(&PairSpec {
                market: MarketKind::Spot,
                base: "BTC".into(),
                quote: "USDT".into(),
                venue: VenueId::Binance,
            })
            .unwrap();
        store
            .insert_monitoring(&MonitoringSpec {
                owner_id: 1,
                depth_levels: 20,
                batch_size: 500,
                batch_interval_sec: 5,
                ring_buffer_size: 10_000,
                save_interval_sec: 5,
                pair_ids: vec![pair],
            })
            .unwrap();

        let fetcher = TaskFetcher::new(store);
        assert!(fetcher.last().monitor_tasks.is_empty());
        fetcher.fetch().unwrap();
        assert_eq!(fetcher.last().monitor_tasks.len(), 1);
    }
}
