//! Catalog schema bootstrap. Idempotent; mirrors the production
//! relations the worker consumes.

use rusqlite::Connection;

use crate::CatalogResult;

pub(crate) fn bootstrap(conn: &Connection) -> CatalogResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS USER (
            ID INTEGER PRIMARY KEY,
            NAME TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS COIN (
            ID INTEGER PRIMARY KEY,
            SYMBOL TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS CHAIN (
            ID INTEGER PRIMARY KEY,
            NAME TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS EXCHANGE (
            ID INTEGER PRIMARY KEY,
            EXCHANGE_ID TEXT NOT NULL UNIQUE,
            NAME TEXT NOT NULL,
            ACTIVE INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS EXCHANGE_ACCOUNTS (
            ID INTEGER PRIMARY KEY,
            EXCHANGE_ID INTEGER NOT NULL REFERENCES EXCHANGE(ID),
            UID INTEGER NOT NULL,
            LABEL TEXT
        );

        CREATE TABLE IF NOT EXISTS TRADE_PAIR (
            ID INTEGER PRIMARY KEY,
            MARKET_TYPE TEXT NOT NULL CHECK (MARKET_TYPE IN ('SPOT','FUTURES')),
            BASE_CURRENCY_ID INTEGER NOT NULL REFERENCES COIN(ID),
            QUOTE_CURRENCY_ID INTEGER NOT NULL REFERENCES COIN(ID),
            EXCHANGE_ID INTEGER NOT NULL REFERENCES EXCHANGE(ID),
            ACTIVE INTEGER NOT NULL DEFAULT 1,
            LEVERAGE REAL,
            FUNDING_RATE REAL,
            CONTRACT_TYPE TEXT,
            UNIQUE (MARKET_TYPE, BASE_CURRENCY_ID, QUOTE_CURRENCY_ID, EXCHANGE_ID)
        );

        CREATE TABLE IF NOT EXISTS TRADE (
            ID INTEGER PRIMARY KEY,
            UID INTEGER NOT NULL,
            TYPE INTEGER NOT NULL,
            ACTIVE INTEGER NOT NULL DEFAULT 0,
            MAX_AMOUNT_TRADE TEXT NOT NULL DEFAULT '0',
            MAX_OPEN_ORDERS INTEGER NOT NULL DEFAULT 10,
            MAX_POSITION_SIZE TEXT NOT NULL DEFAULT '0',
            STRATEGY_UPDATE_INTERVAL_SEC INTEGER NOT NULL DEFAULT 10,
            SLIPPAGE_PERCENT REAL NOT NULL DEFAULT 0.5,
            ENABLE_BACKTEST INTEGER NOT NULL DEFAULT 0,
            FIN_PROTECTION INTEGER NOT NULL DEFAULT 0,
            BBO_ONLY INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS TRADE_PAIRS (
            TRADE_ID INTEGER NOT NULL REFERENCES TRADE(ID),
            PAIR_ID INTEGER NOT NULL REFERENCES TRADE_PAIR(ID),
            EAID INTEGER NOT NULL REFERENCES EXCHANGE_ACCOUNTS(ID),
            PRIMARY KEY (TRADE_ID, PAIR_ID, EAID)
        );

        CREATE TABLE IF NOT EXISTS MONITORING (
            ID INTEGER PRIMARY KEY,
            UID INTEGER NOT NULL,
            ORDERBOOK_DEPTH INTEGER NOT NULL DEFAULT 20,
            BATCH_SIZE INTEGER NOT NULL DEFAULT 500,
            BATCH_INTERVAL_SEC INTEGER NOT NULL DEFAULT 5,
            RING_BUFFER_SIZE INTEGER NOT NULL DEFAULT 10000,
            SAVE_INTERVAL_SEC INTEGER NOT NULL DEFAULT 5,
            ACTIVE INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS MONITORING_TRADE_PAIRS (
            MONITORING_ID INTEGER NOT NULL REFERENCES MONITORING(ID),
            PAIR_ID INTEGER NOT NULL REFERENCES TRADE_PAIR(ID),
            PRIMARY KEY (MONITORING_ID, PAIR_ID)
        );

        CREATE TABLE IF NOT EXISTS ARBITRAGE_TRANS (
            ID INTEGER PRIMARY KEY,
            TRADE_ID INTEGER NOT NULL REFERENCES TRADE(ID),
            STATUS INTEGER NOT NULL DEFAULT 1,
            AMOUNT TEXT,
            CALC_PROFIT TEXT,
            DATE_CREATE TEXT NOT NULL,
            DATE_MODIFY TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS IDX_ARBITRAGE_TRANS_STATUS ON ARBITRAGE_TRANS(STATUS, ID);

        CREATE TABLE IF NOT EXISTS TRADE_HISTORY (
            ID INTEGER PRIMARY KEY AUTOINCREMENT,
            TRADE_ID INTEGER NOT NULL,
            ORDER_ID TEXT NOT NULL UNIQUE,
            PAIR_ID INTEGER NOT NULL,
            EAID INTEGER NOT NULL,
            SIDE TEXT NOT NULL CHECK (SIDE IN ('BUY','SELL')),
            PRICE TEXT NOT NULL,
            AMOUNT TEXT NOT NULL,
            COMMISSION TEXT NOT NULL DEFAULT '0',
            COMMISSION_ASSET TEXT NOT NULL DEFAULT '',
            STATUS TEXT NOT NULL CHECK (STATUS IN ('PENDING','FILLED','PARTIAL','CANCELLED')),
            EXECUTED_AT INTEGER NOT NULL,
            PROFIT_LOSS TEXT,
            DATE_CREATE TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS IDX_TRADE_HISTORY_TRADE ON TRADE_HISTORY(TRADE_ID);

        CREATE TABLE IF NOT EXISTS DAEMON_STATE (
            ID INTEGER PRIMARY KEY,
            DAEMON_NAME TEXT NOT NULL UNIQUE,
            STATUS TEXT NOT NULL,
            ROLE TEXT NOT NULL,
            LAST_HEARTBEAT INTEGER NOT NULL,
            ACTIVE_MONITORING_ID INTEGER,
            ACTIVE_TRADE_ID INTEGER,
            ERROR_MESSAGE TEXT,
            DATE_CREATE TEXT NOT NULL,
            DATE_MODIFY TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}
