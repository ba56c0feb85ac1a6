//! Desired-state task queries and the upserts that feed them.
//!
//! Monitor tasks are the (monitoring config x pairs) join; trade tasks
//! join through the trade-pair-account junction. Both return cloned
//! rows ordered by config id so consecutive polls compare stably.

use std::str::FromStr;

use arbor_core::{
    BookDepth, MarketKind, MonitorTask, Pair, RiskLimits, StrategyKind, TradeTask, VenueId,
};
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;

use crate::{CatalogError, CatalogResult, CatalogStore};

/// Reference-dimension insert for one tradable pair.
#[derive(Clone, Debug)]
pub struct PairSpec {
    pub market: MarketKind,
    pub base: String,
    pub quote: String,
    pub venue: VenueId,
}

/// Row spec for a monitoring config and its watched pairs.
#[derive(Clone, Debug)]
pub struct MonitoringSpec {
    pub owner_id: i64,
    pub depth_levels: i64,
    pub batch_size: i64,
    pub batch_interval_sec: i64,
    pub ring_buffer_size: i64,
    pub save_interval_sec: i64,
    pub pair_ids: Vec<i64>,
}

/// Row spec for a trade config and its pair/account links.
#[derive(Clone, Debug)]
pub struct TradeSpec {
    pub owner_id: i64,
    pub type_code: i64,
    pub max_amount: Decimal,
    pub max_open_orders: i64,
    pub max_position: Decimal,
    pub update_interval_sec: i64,
    pub slippage_pct: f64,
    pub fin_protection: bool,
    pub bbo_only: bool,
    /// (pair id, exchange account id)
    pub links: Vec<(i64, i64)>,
}

impl CatalogStore {
    pub fn upsert_exchange(&self, venue: VenueId, name: &str) -> CatalogResult<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO EXCHANGE (EXCHANGE_ID, NAME) VALUES (?1, ?2)
                 ON CONFLICT(EXCHANGE_ID) DO UPDATE SET NAME = excluded.NAME",
                params![venue.as_str(), name],
            )?;
            let id = conn.query_row(
                "SELECT ID FROM EXCHANGE WHERE EXCHANGE_ID = ?1",
                params![venue.as_str()],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn upsert_coin(&self, symbol: &str) -> CatalogResult<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO COIN (SYMBOL) VALUES (?1)",
                params![symbol.to_uppercase()],
            )?;
            let id = conn.query_row(
                "SELECT ID FROM COIN WHERE SYMBOL = ?1",
                params![symbol.to_uppercase()],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn upsert_account(&self, venue: VenueId, owner_id: i64) -> CatalogResult<i64> {
        let exchange_row = self.upsert_exchange(venue, venue.as_str())?;
        self.with_conn(|conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT ID FROM EXCHANGE_ACCOUNTS WHERE EXCHANGE_ID = ?1 AND UID = ?2",
                    params![exchange_row, owner_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(id);
            }
            conn.execute(
                "INSERT INTO EXCHANGE_ACCOUNTS (EXCHANGE_ID, UID) VALUES (?1, ?2)",
                params![exchange_row, owner_id],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn upsert_pair(&self, spec: &PairSpec) -> CatalogResult<i64> {
        let base_id = self.upsert_coin(&spec.base)?;
        let quote_id = self.upsert_coin(&spec.quote)?;
        let exchange_row = self.upsert_exchange(spec.venue, spec.venue.as_str())?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO TRADE_PAIR
                 (MARKET_TYPE, BASE_CURRENCY_ID, QUOTE_CURRENCY_ID, EXCHANGE_ID)
                 VALUES (?1, ?2, ?3, ?4)",
                params![spec.market.catalog_code(), base_id, quote_id, exchange_row],
            )?;
            let id = conn.query_row(
                "SELECT ID FROM TRADE_PAIR
                 WHERE MARKET_TYPE = ?1 AND BASE_CURRENCY_ID = ?2
                   AND QUOTE_CURRENCY_ID = ?3 AND EXCHANGE_ID = ?4",
                params![spec.market.catalog_code(), base_id, quote_id, exchange_row],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn insert_monitoring(&self, spec: &MonitoringSpec) -> CatalogResult<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO MONITORING
                 (UID, ORDERBOOK_DEPTH, BATCH_SIZE, BATCH_INTERVAL_SEC,
                  RING_BUFFER_SIZE, SAVE_INTERVAL_SEC, ACTIVE)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
                params![
                    spec.owner_id,
                    spec.depth_levels,
                    spec.batch_size,
                    spec.batch_interval_sec,
                    spec.ring_buffer_size,
                    spec.save_interval_sec,
                ],
            )?;
            let id = conn.last_insert_rowid();
            for pair_id in &spec.pair_ids {
                conn.execute(
                    "INSERT OR IGNORE INTO MONITORING_TRADE_PAIRS (MONITORING_ID, PAIR_ID)
                     VALUES (?1, ?2)",
                    params![id, pair_id],
                )?;
            }
            Ok(id)
        })
    }

    pub fn set_monitoring_depth(&self, monitoring_id: i64, depth_levels: i64) -> CatalogResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE MONITORING SET ORDERBOOK_DEPTH = ?1 WHERE ID = ?2",
                params![depth_levels, monitoring_id],
            )?;
            Ok(())
        })
    }

    pub fn set_monitoring_active(&self, monitoring_id: i64, active: bool) -> CatalogResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE MONITORING SET ACTIVE = ?1 WHERE ID = ?2",
                params![active as i64, monitoring_id],
            )?;
            Ok(())
        })
    }

    pub fn insert_trade(&self, spec: &TradeSpec) -> CatalogResult<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO TRADE
                 (UID, TYPE, ACTIVE, MAX_AMOUNT_TRADE, MAX_OPEN_ORDERS, MAX_POSITION_SIZE,
                  STRATEGY_UPDATE_INTERVAL_SEC, SLIPPAGE_PERCENT, FIN_PROTECTION, BBO_ONLY)
                 VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    spec.owner_id,
                    spec.type_code,
                    spec.max_amount.to_string(),
                    spec.max_open_orders,
                    spec.max_position.to_string(),
                    spec.update_interval_sec,
                    spec.slippage_pct,
                    spec.fin_protection as i64,
                    spec.bbo_only as i64,
                ],
            )?;
            let id = conn.last_insert_rowid();
            for (pair_id, account_id) in &spec.links {
                conn.execute(
                    "INSERT OR IGNORE INTO TRADE_PAIRS (TRADE_ID, PAIR_ID, EAID)
                     VALUES (?1, ?2, ?3)",
                    params![id, pair_id, account_id],
                )?;
            }
            Ok(id)
        })
    }

    /// Active monitoring configs joined out to their pairs.
    pub fn fetch_monitor_tasks(&self) -> CatalogResult<Vec<MonitorTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.ID, m.UID, e.EXCHANGE_ID, e.NAME, tp.MARKET_TYPE,
                        mtp.PAIR_ID, c1.SYMBOL, c2.SYMBOL,
                        m.ORDERBOOK_DEPTH, m.BATCH_SIZE, m.BATCH_INTERVAL_SEC,
                        m.RING_BUFFER_SIZE, m.SAVE_INTERVAL_SEC
                 FROM MONITORING m
                 JOIN MONITORING_TRADE_PAIRS mtp ON m.ID = mtp.MONITORING_ID
                 JOIN TRADE_PAIR tp ON mtp.PAIR_ID = tp.ID
                 JOIN EXCHANGE e ON tp.EXCHANGE_ID = e.ID
                 JOIN COIN c1 ON tp.BASE_CURRENCY_ID = c1.ID
                 JOIN COIN c2 ON tp.QUOTE_CURRENCY_ID = c2.ID
                 WHERE m.ACTIVE = 1
                 ORDER BY m.ID, mtp.PAIR_ID",
            )?;
            let tasks = stmt
                .query_map([], monitor_task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            tasks.into_iter().collect()
        })
    }

    /// Active trade configs joined through the pair/account junction.
    pub fn fetch_trade_tasks(&self) -> CatalogResult<Vec<TradeTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.ID, t.UID, t.TYPE, e.EXCHANGE_ID, tp.MARKET_TYPE,
                        tps.PAIR_ID, c1.SYMBOL, c2.SYMBOL, tps.EAID,
                        t.MAX_AMOUNT_TRADE, t.MAX_OPEN_ORDERS, t.MAX_POSITION_SIZE,
                        t.STRATEGY_UPDATE_INTERVAL_SEC, t.SLIPPAGE_PERCENT,
                        t.FIN_PROTECTION, t.BBO_ONLY
                 FROM TRADE t
                 JOIN TRADE_PAIRS tps ON t.ID = tps.TRADE_ID
                 JOIN TRADE_PAIR tp ON tps.PAIR_ID = tp.ID
                 JOIN EXCHANGE e ON tp.EXCHANGE_ID = e.ID
                 JOIN COIN c1 ON tp.BASE_CURRENCY_ID = c1.ID
                 JOIN COIN c2 ON tp.QUOTE_CURRENCY_ID = c2.ID
                 WHERE t.ACTIVE = 1
                 ORDER BY t.ID, tps.PAIR_ID",
            )?;
            let tasks = stmt
                .query_map([], trade_task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            tasks.into_iter().collect()
        })
    }
}

type RowResult<T> = Result<CatalogResult<T>, rusqlite::Error>;

fn monitor_task_from_row(row: &Row<'_>) -> RowResult<MonitorTask> {
    let venue_text: String = row.get(2)?;
    let market_text: String = row.get(4)?;
    let base: String = row.get(6)?;
    let quote: String = row.get(7)?;
    let depth_levels: i64 = row.get(8)?;
    Ok((|| {
        let venue = VenueId::from_str(&venue_text).map_err(CatalogError::InvalidRow)?;
        let market = MarketKind::from_str(&market_text).map_err(CatalogError::InvalidRow)?;
        Ok(MonitorTask {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            venue,
            venue_name: row.get(3)?,
            market,
            pair_id: row.get(5)?,
            pair: Pair::new(&base, &quote),
            depth: BookDepth::from_levels(depth_levels),
            batch_size: row.get::<_, i64>(9)? as usize,
            batch_interval_sec: row.get::<_, i64>(10)? as u64,
            ring_capacity: row.get::<_, i64>(11)? as usize,
            save_interval_sec: row.get::<_, i64>(12)? as u64,
        })
    })())
}

fn trade_task_from_row(row: &Row<'_>) -> RowResult<TradeTask> {
    let venue_text: String = row.get(3)?;
    let market_text: String = row.get(4)?;
    let base: String = row.get(6)?;
    let quote: String = row.get(7)?;
    let max_amount_text: String = row.get(9)?;
    let max_position_text: String = row.get(11)?;
    Ok((|| {
        let venue = VenueId::from_str(&venue_text).map_err(CatalogError::InvalidRow)?;
        let market = MarketKind::from_str(&market_text).map_err(CatalogError::InvalidRow)?;
        let max_amount = max_amount_text
            .parse()
            .map_err(|_| CatalogError::InvalidRow("bad MAX_AMOUNT_TRADE".into()))?;
        let max_position = max_position_text
            .parse()
            .map_err(|_| CatalogError::InvalidRow("bad MAX_POSITION_SIZE".into()))?;
        let slippage: f64 = row.get(13)?;
        let risk = RiskLimits {
            max_amount,
            max_open_orders: row.get::<_, i64>(10)? as u32,
            max_position,
            slippage_pct: Decimal::try_from(slippage)
                .map_err(|_| CatalogError::InvalidRow("bad SLIPPAGE_PERCENT".into()))?,
            fin_protection: row.get::<_, i64>(14)? != 0,
            bbo_only: row.get::<_, i64>(15)? != 0,
            update_interval_sec: row.get::<_, i64>(12)? as u64,
        };
        let strategy = StrategyKind::from_code(row.get(2)?);
        let strategy_params = serde_json::json!({
            "max_amount_trade": risk.max_amount.to_string(),
            "max_open_orders": risk.max_open_orders,
            "max_position_size": risk.max_position.to_string(),
            "strategy_update_interval_sec": risk.update_interval_sec,
            "slippage_percent": slippage,
            "fin_protection": risk.fin_protection,
            "bbo_only": risk.bbo_only,
        });
        Ok(TradeTask {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            strategy,
            venue,
            market,
            pair_id: row.get(5)?,
            pair: Pair::new(&base, &quote),
            account_id: row.get(8)?,
            strategy_params,
            risk,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pair_spec(base: &str, venue: VenueId) -> PairSpec {
        PairSpec {
            market: MarketKind::Spot,
            base: base.to_string(),
            quote: "USDT".to_string(),
            venue,
        }
    }

    #[test]
    fn monitor_join_yields_one_task_per_pair() {
        let store = CatalogStore::open_in_memory().unwrap();
        let btc = store.upsert_pair(&pair_spec("BTC", VenueId::Binance)).unwrap();
        let eth = store.upsert_pair(&pair_spec("ETH", VenueId::Binance)).unwrap();
        store
            .insert_monitoring(&MonitoringSpec {
                owner_id: 1,
                depth_levels: 20,
                batch_size: 500,
                batch_interval_sec: 5,
                ring_buffer_size: 10_000,
                save_interval_sec: 5,
                pair_ids: vec![btc, eth],
            })
            .unwrap();

        let tasks = store.fetch_monitor_tasks().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].venue, VenueId::Binance);
        assert_eq!(tasks[0].pair.as_str(), "BTC/USDT");
        assert_eq!(tasks[0].depth, BookDepth::Twenty);
        assert_eq!(tasks[1].pair.as_str(), "ETH/USDT");
    }

    #[test]
    fn inactive_monitoring_is_invisible() {
        let store = CatalogStore::open_in_memory().unwrap();
        let btc = store.upsert_pair(&pair_spec("BTC", VenueId::Bybit)).unwrap();
        let id = store
            .insert_monitoring(&MonitoringSpec {
                owner_id: 1,
                depth_levels: 0,
                batch_size: 100,
                batch_interval_sec: 5,
                ring_buffer_size: 1000,
                save_interval_sec: 5,
                pair_ids: vec![btc],
            })
            .unwrap();
        assert_eq!(store.fetch_monitor_tasks().unwrap().len(), 1);
        store.set_monitoring_active(id, false).unwrap();
        assert!(store.fetch_monitor_tasks().unwrap().is_empty());
    }

    #[test]
    fn trade_join_carries_risk_and_strategy() {
        let store = CatalogStore::open_in_memory().unwrap();
        let pair = store.upsert_pair(&pair_spec("BTC", VenueId::Okx)).unwrap();
        let account = store.upsert_account(VenueId::Okx, 1).unwrap();
        store
            .insert_trade(&TradeSpec {
                owner_id: 1,
                type_code: 6,
                max_amount: dec!(0.5),
                max_open_orders: 4,
                max_position: dec!(2),
                update_interval_sec: 10,
                slippage_pct: 0.25,
                fin_protection: true,
                bbo_only: false,
                links: vec![(pair, account)],
            })
            .unwrap();

        let tasks = store.fetch_trade_tasks().unwrap();
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.strategy, StrategyKind::Arbitrage);
        assert_eq!(task.account_id, account);
        assert_eq!(task.risk.max_amount, dec!(0.5));
        assert!(task.risk.fin_protection);
        assert_eq!(task.strategy_params["max_open_orders"], 4);
    }

    #[test]
    fn unknown_strategy_code_is_preserved() {
        let store = CatalogStore::open_in_memory().unwrap();
        let pair = store.upsert_pair(&pair_spec("DOGE", VenueId::Mexc)).unwrap();
        let account = store.upsert_account(VenueId::Mexc, 2).unwrap();
        store
            .insert_trade(&TradeSpec {
                owner_id: 2,
                type_code: 42,
                max_amount: dec!(1),
                max_open_orders: 1,
                max_position: dec!(1),
                update_interval_sec: 5,
                slippage_pct: 0.1,
                fin_protection: false,
                bbo_only: true,
                links: vec![(pair, account)],
            })
            .unwrap();
        let tasks = store.fetch_trade_tasks().unwrap();
        assert_eq!(tasks[0].strategy, StrategyKind::Unknown(42));
        assert!(!tasks[0].strategy.is_schedulable());
    }
}
