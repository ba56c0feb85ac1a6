//! Binance spot and USD-margined futures dialect.

use arbor_core::{
    BookDepth, MarketKind, MessageHeader, MessagePayload, NormalizedMessage, OrderState, Pair,
    Side, VenueId,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::wire::{concat_symbol, parse_levels, split_concat_symbol};
use crate::{ParseOutcome, ProtocolError};

// Combined-stream endpoints: every frame arrives wrapped with its
// stream name, so one socket can carry many pairs.
pub(crate) const SPOT_WS: &str = "wss://stream.binance.com:9443/stream";
pub(crate) const FUTURES_WS: &str = "wss://fstream.binance.com/stream";

const SPOT_REST: &str = "https://api.binance.com/api/v3/depth";
const FUTURES_REST: &str = "https://fapi.binance.com/fapi/v1/depth";

pub(crate) fn symbol(pair: &Pair) -> String {
    concat_symbol(pair)
}

pub(crate) fn rest_snapshot_url(market: MarketKind, pair: &Pair) -> String {
    let base = match market {
        MarketKind::Spot => SPOT_REST,
        MarketKind::Futures => FUTURES_REST,
    };
    format!("{base}?symbol={}&limit=1000", symbol(pair))
}

fn depth_stream(pair: &Pair, depth: BookDepth) -> String {
    let sym = symbol(pair).to_lowercase();
    match depth {
        BookDepth::Full => format!("{sym}@depth@100ms"),
        other => format!("{sym}@depth{}@100ms", other.levels()),
    }
}

fn trade_stream(pair: &Pair) -> String {
    format!("{}@trade", symbol(pair).to_lowercase())
}

pub(crate) fn frame_subscribe(pairs: &[Pair], _market: MarketKind, depth: BookDepth) -> Vec<u8> {
    let mut params = Vec::with_capacity(pairs.len() * 2);
    for pair in pairs {
        params.push(depth_stream(pair, depth));
        params.push(trade_stream(pair));
    }
    json!({"method": "SUBSCRIBE", "params": params, "id": 1})
        .to_string()
        .into_bytes()
}

pub(crate) fn frame_unsubscribe(pairs: &[Pair], _market: MarketKind) -> Vec<u8> {
    // Depth is not known at unsubscribe time; name every depth variant.
    let mut params = Vec::with_capacity(pairs.len() * 4);
    for pair in pairs {
        let sym = symbol(pair).to_lowercase();
        params.push(format!("{sym}@depth@100ms"));
        params.push(format!("{sym}@depth20@100ms"));
        params.push(format!("{sym}@depth50@100ms"));
        params.push(trade_stream(pair));
    }
    json!({"method": "UNSUBSCRIBE", "params": params, "id": 1})
        .to_string()
        .into_bytes()
}

#[derive(Deserialize)]
struct DepthUpdate {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<Vec<String>>,
    #[serde(rename = "a")]
    asks: Vec<Vec<String>>,
}

#[derive(Deserialize)]
struct TradeEvent {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    /// Trade id; aggregate-trade frames use `a` instead of `t`.
    #[serde(rename = "t", default)]
    trade_id: Option<u64>,
    #[serde(rename = "a", default)]
    agg_trade_id: Option<u64>,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    /// True when the buyer is the maker, i.e. an aggressive sell.
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Deserialize)]
struct ExecutionReport {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "z")]
    cumulative_filled: String,
    #[serde(rename = "L")]
    last_price: String,
}

#[derive(Deserialize)]
struct PartialDepth {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<Vec<String>>,
    asks: Vec<Vec<String>>,
}

pub(crate) fn parse(market: MarketKind, frame: &[u8]) -> ParseOutcome {
    let mut value: Value = match serde_json::from_slice(frame) {
        Ok(value) => value,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };

    // Combined-stream wrapper: {"stream":"btcusdt@depth20@100ms","data":{...}}.
    let mut stream_pair = None;
    if let Some(stream) = value.get("stream").and_then(Value::as_str) {
        stream_pair = stream
            .split('@')
            .next()
            .and_then(split_concat_symbol);
        match value.get_mut("data").map(Value::take) {
            Some(data) => value = data,
            None => return ParseOutcome::Error(ProtocolError::Malformed("wrapper without data".into())),
        }
    }

    match value.get("e").and_then(Value::as_str) {
        Some("depthUpdate") => parse_depth_update(market, value),
        Some("trade") | Some("aggTrade") => parse_trade(market, value),
        Some("executionReport") => parse_execution_report(market, value),
        Some(_) => ParseOutcome::Ignore,
        None => {
            // Partial depth frames carry no event tag and no symbol;
            // the wrapper's stream name supplies the pair.
            match (value.get("lastUpdateId").is_some(), stream_pair) {
                (true, Some(pair)) => parse_partial_depth(market, pair, value),
                _ => ParseOutcome::Ignore,
            }
        }
    }
}

fn header(market: MarketKind, pair: Pair, seq: u64, timestamp_ms: i64) -> MessageHeader {
    MessageHeader {
        venue: VenueId::Binance,
        market,
        pair,
        venue_seq: seq,
        timestamp_ms,
    }
}

fn parse_depth_update(market: MarketKind, value: Value) -> ParseOutcome {
    let event: DepthUpdate = match serde_json::from_value(value) {
        Ok(event) => event,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };
    let Some(pair) = split_concat_symbol(&event.symbol) else {
        return ParseOutcome::Ignore;
    };
    let bids = match parse_levels(&event.bids) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    let asks = match parse_levels(&event.asks) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    // Diff events cover [U, u]; in steady state U is exactly the
    // predecessor's u + 1.
    let prev_seq = event.first_update_id.checked_sub(1);
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, event.final_update_id, event.event_time),
        payload: MessagePayload::BookDelta {
            bids,
            asks,
            prev_seq,
        },
    })
}

fn parse_partial_depth(market: MarketKind, pair: Pair, value: Value) -> ParseOutcome {
    let event: PartialDepth = match serde_json::from_value(value) {
        Ok(event) => event,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };
    let bids = match parse_levels(&event.bids) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    let asks = match parse_levels(&event.asks) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, event.last_update_id, 0),
        payload: MessagePayload::BookSnapshot { bids, asks },
    })
}

fn parse_trade(market: MarketKind, value: Value) -> ParseOutcome {
    let event: TradeEvent = match serde_json::from_value(value) {
        Ok(event) => event,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };
    let Some(pair) = split_concat_symbol(&event.symbol) else {
        return ParseOutcome::Ignore;
    };
    let (Ok(price), Ok(amount)) = (event.price.parse(), event.quantity.parse()) else {
        return ParseOutcome::Error(ProtocolError::Malformed("bad trade numerics".into()));
    };
    let side = if event.buyer_is_maker {
        Side::Sell
    } else {
        Side::Buy
    };
    let seq = event.trade_id.or(event.agg_trade_id).unwrap_or(0);
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, seq, event.event_time),
        payload: MessagePayload::Trade {
            price,
            amount,
            side,
        },
    })
}

fn parse_execution_report(market: MarketKind, value: Value) -> ParseOutcome {
    let event: ExecutionReport = match serde_json::from_value(value) {
        Ok(event) => event,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };
    let Some(pair) = split_concat_symbol(&event.symbol) else {
        return ParseOutcome::Ignore;
    };
    let state = match event.status.as_str() {
        "NEW" => OrderState::New,
        "PARTIALLY_FILLED" => OrderState::PartiallyFilled,
        "FILLED" => OrderState::Filled,
        "CANCELED" | "EXPIRED" => OrderState::Canceled,
        "REJECTED" => OrderState::Rejected,
        other => {
            return ParseOutcome::Error(ProtocolError::Malformed(format!(
                "unknown order status '{other}'"
            )))
        }
    };
    let Ok(filled) = event.cumulative_filled.parse() else {
        return ParseOutcome::Error(ProtocolError::Malformed("bad fill quantity".into()));
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, 0, event.event_time),
        payload: MessagePayload::OrderUpdate {
            order_id: event.order_id.to_string(),
            state,
            filled,
            avg_price: event.last_price.parse().ok(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pairs() -> Vec<Pair> {
        vec![Pair::new("BTC", "USDT")]
    }

    #[test]
    fn subscribe_frame_names_depth_and_trade_channels() {
        let frame = frame_subscribe(&pairs(), MarketKind::Spot, BookDepth::Twenty);
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["method"], "SUBSCRIBE");
        let params: Vec<&str> = value["params"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(params.contains(&"btcusdt@depth20@100ms"));
        assert!(params.contains(&"btcusdt@trade"));
    }

    #[test]
    fn full_depth_uses_diff_channel() {
        let frame = frame_subscribe(&pairs(), MarketKind::Spot, BookDepth::Full);
        let text = String::from_utf8(frame).unwrap();
        assert!(text.contains("btcusdt@depth@100ms"));
        assert!(!text.contains("depth20"));
    }

    #[test]
    fn depth_update_normalizes_to_delta() {
        let raw = serde_json::json!({
            "e": "depthUpdate", "E": 1_700_000_000_123i64, "s": "BTCUSDT",
            "U": 157, "u": 160,
            "b": [["64000.10", "0.5"], ["63999.00", "0"]],
            "a": [["64001.00", "1.25"]]
        })
        .to_string();
        let ParseOutcome::Message(msg) = parse(MarketKind::Spot, raw.as_bytes()) else {
            panic!("expected message");
        };
        assert_eq!(msg.header.pair.as_str(), "BTC/USDT");
        assert_eq!(msg.header.venue_seq, 160);
        let MessagePayload::BookDelta {
            bids,
            asks,
            prev_seq,
        } = msg.payload
        else {
            panic!("expected delta");
        };
        assert_eq!(prev_seq, Some(156));
        assert_eq!(bids[0].price, dec!(64000.10));
        assert_eq!(bids[1].amount, dec!(0));
        assert_eq!(asks.len(), 1);
    }

    #[test]
    fn trade_side_derives_from_maker_flag() {
        let raw = serde_json::json!({
            "e": "trade", "E": 1i64, "s": "ETHUSDT", "t": 42,
            "p": "3000.5", "q": "2", "m": true
        })
        .to_string();
        let ParseOutcome::Message(msg) = parse(MarketKind::Spot, raw.as_bytes()) else {
            panic!("expected message");
        };
        let MessagePayload::Trade { side, .. } = msg.payload else {
            panic!("expected trade");
        };
        assert_eq!(side, Side::Sell);
    }

    #[test]
    fn wrapped_partial_depth_gets_pair_from_stream() {
        let raw = serde_json::json!({
            "stream": "btcusdt@depth20@100ms",
            "data": {
                "lastUpdateId": 900,
                "bids": [["64000.0", "1"]],
                "asks": [["64001.0", "2"]]
            }
        })
        .to_string();
        let ParseOutcome::Message(msg) = parse(MarketKind::Spot, raw.as_bytes()) else {
            panic!("expected message");
        };
        assert_eq!(msg.header.pair.as_str(), "BTC/USDT");
        assert_eq!(msg.header.venue_seq, 900);
        assert!(matches!(msg.payload, MessagePayload::BookSnapshot { .. }));
    }

    #[test]
    fn command_ack_is_ignored() {
        assert_eq!(
            parse(MarketKind::Spot, br#"{"result":null,"id":1}"#),
            ParseOutcome::Ignore
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse(MarketKind::Spot, b"not json"),
            ParseOutcome::Error(ProtocolError::Malformed(_))
        ));
    }
}
