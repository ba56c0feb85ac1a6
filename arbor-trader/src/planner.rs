//! Turning a claimed transaction into a pair of venue orders.

use std::sync::Arc;

use rust_decimal::Decimal;

use arbor_book::BookStore;
use arbor_core::{BookKey, Side, TradeTask};

use crate::gateway::PlaceOrder;

/// The two legs of one cross-venue round trip.
#[derive(Clone, Debug)]
pub struct ArbitragePlan {
    pub buy: PlaceOrder,
    pub sell: PlaceOrder,
}

/// Strategy seam: how a claimed transaction becomes orders. The closed
/// strategy set dispatches here; tests plug in stubs.
pub trait ArbitragePlanner: Send + Sync {
    /// `legs` are the trade task rows for the transaction's trade
    /// config, one per venue/account. `None` means no executable plan.
    fn plan(&self, legs: &[TradeTask]) -> Option<ArbitragePlan>;
}

/// Plans off the best bid/ask of the two legs' books: buy where the ask
/// is lower, sell where the bid is higher, quantity clamped by the
/// risk limit and by top-of-book size.
pub struct BboPlanner {
    books: Arc<BookStore>,
}

impl BboPlanner {
    pub fn new(books: Arc<BookStore>) -> Self {
        Self { books }
    }
}

impl ArbitragePlanner for BboPlanner {
    fn plan(&self, legs: &[TradeTask]) -> Option<ArbitragePlan> {
        let [first, second] = legs else {
            return None;
        };
        let first_book = self
            .books
            .snapshot(&BookKey::new(first.venue, first.market, first.pair.clone()))?;
        let second_book = self
            .books
            .snapshot(&BookKey::new(second.venue, second.market, second.pair.clone()))?;

        let first_ask = first_book.best_ask()?;
        let first_bid = first_book.best_bid()?;
        let second_ask = second_book.best_ask()?;
        let second_bid = second_book.best_bid()?;

        // Pick the direction where the sell venue's bid exceeds the buy
        // venue's ask.
        let (buy_leg, buy_level, sell_leg, sell_level) =
            if second_bid.price > first_ask.price {
                (first, first_ask, second, second_bid)
            } else if first_bid.price > second_ask.price {
                (second, second_ask, first, first_bid)
            } else {
                return None;
            };

        let qty = buy_leg
            .risk
            .max_amount
            .min(buy_level.amount)
            .min(sell_level.amount);
        if qty <= Decimal::ZERO {
            return None;
        }

        Some(ArbitragePlan {
            buy: PlaceOrder::market_order(
                buy_leg.venue,
                buy_leg.market,
                buy_leg.pair.clone(),
                buy_leg.account_id,
                Side::Buy,
                qty,
            ),
            sell: PlaceOrder::market_order(
                sell_leg.venue,
                sell_leg.market,
                sell_leg.pair.clone(),
                sell_leg.account_id,
                Side::Sell,
                qty,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{
        MarketKind, MessageHeader, MessagePayload, NormalizedMessage, Pair, PriceLevel,
        RiskLimits, StrategyKind, VenueId,
    };
    use rust_decimal_macros::dec;

    fn leg(venue: VenueId, max_amount: Decimal) -> TradeTask {
        TradeTask {
            id: 1,
            owner_id: 1,
            strategy: StrategyKind::Arbitrage,
            venue,
            market: MarketKind::Spot,
            pair_id: 1,
            pair: Pair::from("BTC/USDT"),
            account_id: 5,
            strategy_params: serde_json::Value::Null,
            risk: RiskLimits {
                max_amount,
                max_open_orders: 5,
                max_position: dec!(10),
                slippage_pct: dec!(0.5),
                fin_protection: false,
                bbo_only: true,
                update_interval_sec: 10,
            },
        }
    }

    fn seed_book(
        store: &BookStore,
        venue: VenueId,
        bid: (Decimal, Decimal),
        ask: (Decimal, Decimal),
    ) {
        store.apply(NormalizedMessage {
            header: MessageHeader {
                venue,
                market: MarketKind::Spot,
                pair: Pair::from("BTC/USDT"),
                venue_seq: 1,
                timestamp_ms: 1,
            },
            payload: MessagePayload::BookSnapshot {
                bids: vec![PriceLevel::new(bid.0, bid.1)],
                asks: vec![PriceLevel::new(ask.0, ask.1)],
            },
        });
    }

    #[tokio::test]
    async fn plans_buy_cheap_sell_rich() {
        let (store, _rx) = BookStore::new();
        // Binance asks 64000, Bybit bids 64100: buy binance, sell bybit.
        seed_book(&store, VenueId::Binance, (dec!(63990), dec!(2)), (dec!(64000), dec!(3)));
        seed_book(&store, VenueId::Bybit, (dec!(64100), dec!(1)), (dec!(64110), dec!(2)));

        let planner = BboPlanner::new(store);
        let plan = planner
            .plan(&[leg(VenueId::Binance, dec!(5)), leg(VenueId::Bybit, dec!(5))])
            .expect("profitable spread");
        assert_eq!(plan.buy.venue, VenueId::Binance);
        assert_eq!(plan.sell.venue, VenueId::Bybit);
        // Clamped by the sell side's top-of-book size.
        assert_eq!(plan.buy.qty, dec!(1));
        assert_eq!(plan.sell.qty, dec!(1));
    }

    #[tokio::test]
    async fn no_spread_means_no_plan() {
        let (store, _rx) = BookStore::new();
        seed_book(&store, VenueId::Binance, (dec!(64000), dec!(1)), (dec!(64001), dec!(1)));
        seed_book(&store, VenueId::Bybit, (dec!(64000), dec!(1)), (dec!(64001), dec!(1)));
        let planner = BboPlanner::new(store);
        assert!(planner
            .plan(&[leg(VenueId::Binance, dec!(5)), leg(VenueId::Bybit, dec!(5))])
            .is_none());
    }

    #[tokio::test]
    async fn risk_limit_clamps_quantity() {
        let (store, _rx) = BookStore::new();
        seed_book(&store, VenueId::Binance, (dec!(63990), dec!(9)), (dec!(64000), dec!(9)));
        seed_book(&store, VenueId::Bybit, (dec!(64100), dec!(9)), (dec!(64110), dec!(9)));
        let planner = BboPlanner::new(store);
        let plan = planner
            .plan(&[leg(VenueId::Binance, dec!(0.25)), leg(VenueId::Bybit, dec!(5))])
            .unwrap();
        assert_eq!(plan.buy.qty, dec!(0.25));
    }
}
