//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

mod book;
mod message;
mod records;

pub use book::{BookUpdateError, OrderBook, PriceLevel};
pub use message::{MessageHeader, MessagePayload, NormalizedMessage, OrderState, PositionUpdate};
pub use records::{
    ArbitrageStatus, ArbitrageTransaction, ExecutionStatus, MonitorTask, OrderExecution,
    RiskLimits, StrategyKind, Subscription, TradeTask, WorkerRole, WorkerState, WorkerStatus,
};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Amount = Decimal;

/// The set of venues this workspace can speak to. Each variant owns a
/// distinct wire dialect; adding a venue means adding a variant here and
/// an adapter module in `arbor-venues`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum VenueId {
    Binance,
    Bybit,
    Okx,
    Kucoin,
    Coinex,
    Htx,
    Mexc,
    Dex,
}

impl VenueId {
    pub const ALL: [VenueId; 8] = [
        Self::Binance,
        Self::Bybit,
        Self::Okx,
        Self::Kucoin,
        Self::Coinex,
        Self::Htx,
        Self::Mexc,
        Self::Dex,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Bybit => "bybit",
            Self::Okx => "okx",
            Self::Kucoin => "kucoin",
            Self::Coinex => "coinex",
            Self::Htx => "htx",
            Self::Mexc => "mexc",
            Self::Dex => "dex",
        }
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VenueId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "bybit" => Ok(Self::Bybit),
            "okx" => Ok(Self::Okx),
            "kucoin" => Ok(Self::Kucoin),
            "coinex" => Ok(Self::Coinex),
            "htx" | "huobi" => Ok(Self::Htx),
            "mexc" => Ok(Self::Mexc),
            "dex" => Ok(Self::Dex),
            other => Err(format!("unknown venue '{other}'")),
        }
    }
}

/// Spot and futures wire surfaces are distinct per venue.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Spot,
    Futures,
}

impl MarketKind {
    /// Uppercase form stored in the catalog's `MARKET_TYPE` columns.
    #[must_use]
    pub fn catalog_code(self) -> &'static str {
        match self {
            Self::Spot => "SPOT",
            Self::Futures => "FUTURES",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::Futures => "futures",
        }
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "SPOT" => Ok(Self::Spot),
            "FUTURES" | "FUTURE" | "PERP" => Ok(Self::Futures),
            other => Err(format!("unknown market kind '{other}'")),
        }
    }
}

/// Canonical trading pair in `BASE/QUOTE` form (e.g. `BTC/USDT`).
/// Venue-specific symbol forms are derived from this by the adapters.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Pair(String);

impl Pair {
    pub fn new(base: &str, quote: &str) -> Self {
        Self(format!(
            "{}/{}",
            base.to_uppercase(),
            quote.to_uppercase()
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn base(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    #[must_use]
    pub fn quote(&self) -> &str {
        self.0.split('/').nth(1).unwrap_or("")
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Pair {
    fn from(value: &str) -> Self {
        Self(value.to_uppercase())
    }
}

impl From<String> for Pair {
    fn from(value: String) -> Self {
        Self(value.to_uppercase())
    }
}

/// Number of order-book levels requested per side.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BookDepth {
    Twenty,
    #[default]
    Fifty,
    /// The venue's full-book channel.
    Full,
}

impl BookDepth {
    /// Clamp an arbitrary level count from the catalog onto a supported
    /// venue channel. Zero means full depth.
    #[must_use]
    pub fn from_levels(levels: i64) -> Self {
        match levels {
            0 => Self::Full,
            l if l <= 20 => Self::Twenty,
            _ => Self::Fifty,
        }
    }

    /// Level count, with zero denoting full depth.
    #[must_use]
    pub fn levels(self) -> u32 {
        match self {
            Self::Twenty => 20,
            Self::Fifty => 50,
            Self::Full => 0,
        }
    }
}

impl PartialOrd for BookDepth {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BookDepth {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(depth: BookDepth) -> u8 {
            match depth {
                BookDepth::Twenty => 0,
                BookDepth::Fifty => 1,
                BookDepth::Full => 2,
            }
        }
        rank(*self).cmp(&rank(*other))
    }
}

/// The side of an order or trade.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Uppercase form stored in TRADE_HISTORY.
    #[must_use]
    pub fn catalog_code(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "BUY" | "BID" => Ok(Self::Buy),
            "SELL" | "ASK" => Ok(Self::Sell),
            other => Err(format!("unknown side '{other}'")),
        }
    }
}

/// Identifies one live order book: a pair on one market surface of one venue.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, PartialOrd, Ord)]
pub struct BookKey {
    pub venue: VenueId,
    pub market: MarketKind,
    pub pair: Pair,
}

impl BookKey {
    pub fn new(venue: VenueId, market: MarketKind, pair: impl Into<Pair>) -> Self {
        Self {
            venue,
            market,
            pair: pair.into(),
        }
    }
}

impl fmt::Display for BookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.venue, self.market, self.pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_round_trips_through_str() {
        for venue in VenueId::ALL {
            assert_eq!(venue.as_str().parse::<VenueId>().unwrap(), venue);
        }
    }

    #[test]
    fn pair_splits_base_and_quote() {
        let pair = Pair::new("btc", "usdt");
        assert_eq!(pair.as_str(), "BTC/USDT");
        assert_eq!(pair.base(), "BTC");
        assert_eq!(pair.quote(), "USDT");
    }

    #[test]
    fn depth_clamps_catalog_levels() {
        assert_eq!(BookDepth::from_levels(0), BookDepth::Full);
        assert_eq!(BookDepth::from_levels(5), BookDepth::Twenty);
        assert_eq!(BookDepth::from_levels(20), BookDepth::Twenty);
        assert_eq!(BookDepth::from_levels(50), BookDepth::Fifty);
        assert_eq!(BookDepth::from_levels(400), BookDepth::Fifty);
    }

    #[test]
    fn depth_orders_full_above_numeric() {
        assert!(BookDepth::Full > BookDepth::Fifty);
        assert!(BookDepth::Fifty > BookDepth::Twenty);
        assert_eq!(BookDepth::Twenty.max(BookDepth::Fifty), BookDepth::Fifty);
    }

    #[test]
    fn market_kind_parses_catalog_codes() {
        assert_eq!("SPOT".parse::<MarketKind>().unwrap(), MarketKind::Spot);
        assert_eq!("futures".parse::<MarketKind>().unwrap(), MarketKind::Futures);
        assert!("options".parse::<MarketKind>().is_err());
    }
}
