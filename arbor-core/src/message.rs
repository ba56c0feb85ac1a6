//! The single message format every venue dialect is normalized into.

use serde::{Deserialize, Serialize};

use crate::{Amount, BookKey, MarketKind, Pair, Price, PriceLevel, Side, VenueId};

/// Common header carried by every normalized message.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MessageHeader {
    pub venue: VenueId,
    pub market: MarketKind,
    pub pair: Pair,
    /// Venue-assigned sequence number, zero when the venue has none.
    pub venue_seq: u64,
    /// Venue event time in milliseconds since the epoch.
    pub timestamp_ms: i64,
}

impl MessageHeader {
    #[must_use]
    pub fn book_key(&self) -> BookKey {
        BookKey {
            venue: self.venue,
            market: self.market,
            pair: self.pair.clone(),
        }
    }
}

/// Private order lifecycle states reported by venues.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderState {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// Private position change reported by futures venues.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PositionUpdate {
    pub side: Side,
    pub quantity: Amount,
    pub entry_price: Option<Price>,
}

/// Payload of a normalized message. Being a sum type, the tag and the
/// populated payload cannot disagree.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum MessagePayload {
    /// Incremental book update. `prev_seq` carries the venue's explicit
    /// predecessor link when the dialect provides one; sequence-gap
    /// detection falls back to contiguity otherwise.
    BookDelta {
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        prev_seq: Option<u64>,
    },
    /// Full book replacement.
    BookSnapshot {
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    },
    /// Public trade print.
    Trade {
        price: Price,
        amount: Amount,
        side: Side,
    },
    /// Private order update for an authenticated session.
    OrderUpdate {
        order_id: String,
        state: OrderState,
        filled: Amount,
        avg_price: Option<Price>,
    },
    /// Private position update for an authenticated session.
    Position(PositionUpdate),
}

/// A venue frame translated into the workspace's own vocabulary.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NormalizedMessage {
    pub header: MessageHeader,
    pub payload: MessagePayload,
}

impl NormalizedMessage {
    #[must_use]
    pub fn is_book_update(&self) -> bool {
        matches!(
            self.payload,
            MessagePayload::BookDelta { .. } | MessagePayload::BookSnapshot { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn header_builds_book_key() {
        let header = MessageHeader {
            venue: VenueId::Bybit,
            market: MarketKind::Futures,
            pair: Pair::from("ETH/USDT"),
            venue_seq: 7,
            timestamp_ms: 1_700_000_000_000,
        };
        let key = header.book_key();
        assert_eq!(key.venue, VenueId::Bybit);
        assert_eq!(key.pair.as_str(), "ETH/USDT");
    }

    #[test]
    fn book_variants_are_book_updates() {
        let header = MessageHeader {
            venue: VenueId::Binance,
            market: MarketKind::Spot,
            pair: Pair::from("BTC/USDT"),
            venue_seq: 1,
            timestamp_ms: 0,
        };
        let delta = NormalizedMessage {
            header: header.clone(),
            payload: MessagePayload::BookDelta {
                bids: vec![],
                asks: vec![],
                prev_seq: None,
            },
        };
        let trade = NormalizedMessage {
            header,
            payload: MessagePayload::Trade {
                price: Decimal::ONE,
                amount: Decimal::ONE,
                side: Side::Buy,
            },
        };
        assert!(delta.is_book_update());
        assert!(!trade.is_book_update());
    }
}
