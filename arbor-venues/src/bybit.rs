//! Bybit v5 public/linear dialect.

use arbor_core::{
    BookDepth, MarketKind, MessageHeader, MessagePayload, NormalizedMessage, OrderState, Pair,
    PositionUpdate, Side, VenueId,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::wire::{concat_symbol, parse_levels, split_concat_symbol};
use crate::{ParseOutcome, ProtocolError};

pub(crate) const SPOT_WS: &str = "wss://stream.bybit.com/v5/public/spot";
pub(crate) const FUTURES_WS: &str = "wss://stream.bybit.com/v5/public/linear";

pub(crate) fn symbol(pair: &Pair) -> String {
    concat_symbol(pair)
}

pub(crate) fn rest_snapshot_url(market: MarketKind, pair: &Pair) -> String {
    let category = match market {
        MarketKind::Spot => "spot",
        MarketKind::Futures => "linear",
    };
    format!(
        "https://api.bybit.com/v5/market/orderbook?category={category}&symbol={}&limit=200",
        symbol(pair)
    )
}

fn book_topic(pair: &Pair, depth: BookDepth) -> String {
    // Bybit publishes 1/50/200-level channels; 20 rides the 50 channel,
    // full depth rides the deepest one.
    let channel_depth = match depth {
        BookDepth::Twenty | BookDepth::Fifty => 50,
        BookDepth::Full => 200,
    };
    format!("orderbook.{channel_depth}.{}", symbol(pair))
}

pub(crate) fn frame_subscribe(pairs: &[Pair], depth: BookDepth) -> Vec<u8> {
    let mut args = Vec::with_capacity(pairs.len() * 2);
    for pair in pairs {
        args.push(book_topic(pair, depth));
        args.push(format!("publicTrade.{}", symbol(pair)));
    }
    json!({"op": "subscribe", "args": args}).to_string().into_bytes()
}

pub(crate) fn frame_unsubscribe(pairs: &[Pair]) -> Vec<u8> {
    let mut args = Vec::with_capacity(pairs.len() * 3);
    for pair in pairs {
        let sym = symbol(pair);
        args.push(format!("orderbook.50.{sym}"));
        args.push(format!("orderbook.200.{sym}"));
        args.push(format!("publicTrade.{sym}"));
    }
    json!({"op": "unsubscribe", "args": args})
        .to_string()
        .into_bytes()
}

pub(crate) fn ping_frame() -> Vec<u8> {
    json!({"op": "ping"}).to_string().into_bytes()
}

#[derive(Deserialize)]
struct BookData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bids: Vec<Vec<String>>,
    #[serde(rename = "a")]
    asks: Vec<Vec<String>>,
    #[serde(rename = "u")]
    update_id: u64,
}

#[derive(Deserialize)]
struct TradeEntry {
    #[serde(rename = "T")]
    timestamp: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "v")]
    size: String,
    #[serde(rename = "p")]
    price: String,
}

#[derive(Deserialize)]
struct OrderEntry {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "symbol")]
    symbol: String,
    #[serde(rename = "orderStatus")]
    status: String,
    #[serde(rename = "cumExecQty")]
    cum_exec_qty: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: Option<String>,
}

#[derive(Deserialize)]
struct PositionEntry {
    #[serde(rename = "symbol")]
    symbol: String,
    #[serde(rename = "side")]
    side: String,
    #[serde(rename = "size")]
    size: String,
    #[serde(rename = "entryPrice", default)]
    entry_price: Option<String>,
}

pub(crate) fn parse(market: MarketKind, frame: &[u8]) -> ParseOutcome {
    let value: Value = match serde_json::from_slice(frame) {
        Ok(value) => value,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };

    let Some(topic) = value.get("topic").and_then(Value::as_str) else {
        // Command responses: subscribe acks, pong echoes.
        return ParseOutcome::Ignore;
    };
    let timestamp_ms = value.get("ts").and_then(Value::as_i64).unwrap_or(0);

    if topic.starts_with("orderbook.") {
        parse_book(market, &value, timestamp_ms)
    } else if topic.starts_with("publicTrade.") {
        parse_trades(market, &value, timestamp_ms)
    } else if topic == "order" {
        parse_orders(market, &value, timestamp_ms)
    } else if topic == "position" {
        parse_positions(market, &value, timestamp_ms)
    } else {
        ParseOutcome::Ignore
    }
}

fn header(market: MarketKind, pair: Pair, seq: u64, timestamp_ms: i64) -> MessageHeader {
    MessageHeader {
        venue: VenueId::Bybit,
        market,
        pair,
        venue_seq: seq,
        timestamp_ms,
    }
}

fn parse_book(market: MarketKind, value: &Value, timestamp_ms: i64) -> ParseOutcome {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("delta");
    let data: BookData = match value
        .get("data")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(data)) => data,
        Ok(None) => return ParseOutcome::Error(ProtocolError::Malformed("book without data".into())),
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };
    let Some(pair) = split_concat_symbol(&data.symbol) else {
        return ParseOutcome::Ignore;
    };
    let bids = match parse_levels(&data.bids) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    let asks = match parse_levels(&data.asks) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    let payload = match kind {
        "snapshot" => MessagePayload::BookSnapshot { bids, asks },
        _ => MessagePayload::BookDelta {
            bids,
            asks,
            prev_seq: None,
        },
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, data.update_id, timestamp_ms),
        payload,
    })
}

fn parse_trades(market: MarketKind, value: &Value, timestamp_ms: i64) -> ParseOutcome {
    let entries: Vec<TradeEntry> = match value
        .get("data")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(entries)) => entries,
        Ok(None) | Err(_) => {
            return ParseOutcome::Error(ProtocolError::Malformed("bad trade payload".into()))
        }
    };
    // Batch frames surface only the newest print.
    let Some(entry) = entries.last() else {
        return ParseOutcome::Ignore;
    };
    let Some(pair) = split_concat_symbol(&entry.symbol) else {
        return ParseOutcome::Ignore;
    };
    let (Ok(price), Ok(amount)) = (entry.price.parse(), entry.size.parse()) else {
        return ParseOutcome::Error(ProtocolError::Malformed("bad trade numerics".into()));
    };
    let side = match entry.side.as_str() {
        "Buy" => Side::Buy,
        "Sell" => Side::Sell,
        other => {
            return ParseOutcome::Error(ProtocolError::Malformed(format!(
                "unknown trade side '{other}'"
            )))
        }
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, 0, entry.timestamp.max(timestamp_ms)),
        payload: MessagePayload::Trade {
            price,
            amount,
            side,
        },
    })
}

fn parse_orders(market: MarketKind, value: &Value, timestamp_ms: i64) -> ParseOutcome {
    let entries: Vec<OrderEntry> = match value
        .get("data")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(entries)) => entries,
        Ok(None) | Err(_) => {
            return ParseOutcome::Error(ProtocolError::Malformed("bad order payload".into()))
        }
    };
    let Some(entry) = entries.last() else {
        return ParseOutcome::Ignore;
    };
    let Some(pair) = split_concat_symbol(&entry.symbol) else {
        return ParseOutcome::Ignore;
    };
    let state = match entry.status.as_str() {
        "New" | "Created" => OrderState::New,
        "PartiallyFilled" => OrderState::PartiallyFilled,
        "Filled" => OrderState::Filled,
        "Cancelled" | "Deactivated" => OrderState::Canceled,
        "Rejected" => OrderState::Rejected,
        other => {
            return ParseOutcome::Error(ProtocolError::Malformed(format!(
                "unknown order status '{other}'"
            )))
        }
    };
    let Ok(filled) = entry.cum_exec_qty.parse() else {
        return ParseOutcome::Error(ProtocolError::Malformed("bad fill quantity".into()));
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, 0, timestamp_ms),
        payload: MessagePayload::OrderUpdate {
            order_id: entry.order_id.clone(),
            state,
            filled,
            avg_price: entry.avg_price.as_deref().and_then(|p| p.parse().ok()),
        },
    })
}

fn parse_positions(market: MarketKind, value: &Value, timestamp_ms: i64) -> ParseOutcome {
    let entries: Vec<PositionEntry> = match value
        .get("data")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(entries)) => entries,
        Ok(None) | Err(_) => {
            return ParseOutcome::Error(ProtocolError::Malformed("bad position payload".into()))
        }
    };
    let Some(entry) = entries.last() else {
        return ParseOutcome::Ignore;
    };
    let Some(pair) = split_concat_symbol(&entry.symbol) else {
        return ParseOutcome::Ignore;
    };
    let side = match entry.side.as_str() {
        "Buy" => Side::Buy,
        "Sell" => Side::Sell,
        _ => return ParseOutcome::Ignore,
    };
    let Ok(quantity) = entry.size.parse() else {
        return ParseOutcome::Error(ProtocolError::Malformed("bad position size".into()));
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, 0, timestamp_ms),
        payload: MessagePayload::Position(PositionUpdate {
            side,
            quantity,
            entry_price: entry.entry_price.as_deref().and_then(|p| p.parse().ok()),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn subscribe_frame_uses_op_and_topics() {
        let pairs = vec![Pair::new("BTC", "USDT")];
        let frame = frame_subscribe(&pairs, BookDepth::Fifty);
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["op"], "subscribe");
        let args: Vec<&str> = value["args"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(args, vec!["orderbook.50.BTCUSDT", "publicTrade.BTCUSDT"]);
    }

    #[test]
    fn full_depth_rides_the_deepest_channel() {
        let pairs = vec![Pair::new("ETH", "USDT")];
        let text = String::from_utf8(frame_subscribe(&pairs, BookDepth::Full)).unwrap();
        assert!(text.contains("orderbook.200.ETHUSDT"));
    }

    #[test]
    fn snapshot_and_delta_types_map_to_payloads() {
        let snapshot = serde_json::json!({
            "topic": "orderbook.50.BTCUSDT", "type": "snapshot", "ts": 1_700_000_000_000i64,
            "data": {"s": "BTCUSDT", "b": [["64000", "1"]], "a": [["64001", "2"]], "u": 10, "seq": 99}
        })
        .to_string();
        let ParseOutcome::Message(msg) = parse(MarketKind::Spot, snapshot.as_bytes()) else {
            panic!("expected message");
        };
        assert!(matches!(msg.payload, MessagePayload::BookSnapshot { .. }));
        assert_eq!(msg.header.venue_seq, 10);

        let delta = serde_json::json!({
            "topic": "orderbook.50.BTCUSDT", "type": "delta", "ts": 1_700_000_000_050i64,
            "data": {"s": "BTCUSDT", "b": [["64000", "0"]], "a": [], "u": 11, "seq": 100}
        })
        .to_string();
        let ParseOutcome::Message(msg) = parse(MarketKind::Spot, delta.as_bytes()) else {
            panic!("expected message");
        };
        let MessagePayload::BookDelta { bids, .. } = msg.payload else {
            panic!("expected delta");
        };
        assert_eq!(bids[0].amount, dec!(0));
    }

    #[test]
    fn trade_batch_surfaces_newest_print() {
        let raw = serde_json::json!({
            "topic": "publicTrade.BTCUSDT", "ts": 5i64,
            "data": [
                {"T": 1i64, "s": "BTCUSDT", "S": "Buy", "v": "1", "p": "64000"},
                {"T": 2i64, "s": "BTCUSDT", "S": "Sell", "v": "2", "p": "64001"}
            ]
        })
        .to_string();
        let ParseOutcome::Message(msg) = parse(MarketKind::Spot, raw.as_bytes()) else {
            panic!("expected message");
        };
        let MessagePayload::Trade { side, price, .. } = msg.payload else {
            panic!("expected trade");
        };
        assert_eq!(side, Side::Sell);
        assert_eq!(price, dec!(64001));
    }

    #[test]
    fn command_responses_are_ignored() {
        let ack = br#"{"op":"subscribe","success":true,"conn_id":"abc"}"#;
        assert_eq!(parse(MarketKind::Spot, ack), ParseOutcome::Ignore);
        let pong = br#"{"op":"pong"}"#;
        assert_eq!(parse(MarketKind::Spot, pong), ParseOutcome::Ignore);
    }
}
