//! Coinex v2 dialect: JSON-RPC framing, one method per frame.

use arbor_core::{
    BookDepth, MarketKind, MessageHeader, MessagePayload, NormalizedMessage, Pair, Side, VenueId,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::wire::{concat_symbol, parse_levels, split_concat_symbol};
use crate::{ParseOutcome, ProtocolError};

pub(crate) const SPOT_WS: &str = "wss://socket.coinex.com/v2/spot";
pub(crate) const FUTURES_WS: &str = "wss://socket.coinex.com/v2/futures";

pub(crate) fn symbol(pair: &Pair) -> String {
    concat_symbol(pair)
}

pub(crate) fn rest_snapshot_url(market: MarketKind, pair: &Pair) -> String {
    let surface = match market {
        MarketKind::Spot => "spot",
        MarketKind::Futures => "futures",
    };
    format!(
        "https://api.coinex.com/v2/{surface}/depth?market={}&limit=50&interval=0",
        symbol(pair)
    )
}

fn channel_depth(depth: BookDepth) -> u32 {
    // Coinex caps subscriptions at 50 levels; full depth rides the cap.
    match depth {
        BookDepth::Twenty => 20,
        BookDepth::Fifty | BookDepth::Full => 50,
    }
}

pub(crate) fn frame_subscribe(pairs: &[Pair], depth: BookDepth) -> Vec<u8> {
    let market_list: Vec<Value> = pairs
        .iter()
        .map(|pair| json!([symbol(pair), channel_depth(depth), "0", true]))
        .collect();
    json!({
        "method": "depth.subscribe",
        "params": {"market_list": market_list},
        "id": 1,
    })
    .to_string()
    .into_bytes()
}

pub(crate) fn frame_unsubscribe(pairs: &[Pair]) -> Vec<u8> {
    let market_list: Vec<String> = pairs.iter().map(symbol).collect();
    json!({
        "method": "depth.unsubscribe",
        "params": {"market_list": market_list},
        "id": 1,
    })
    .to_string()
    .into_bytes()
}

pub(crate) fn ping_frame() -> Vec<u8> {
    json!({"method": "server.ping", "params": {}, "id": 1})
        .to_string()
        .into_bytes()
}

#[derive(Deserialize)]
struct DepthPayload {
    #[serde(default)]
    bids: Vec<Vec<String>>,
    #[serde(default)]
    asks: Vec<Vec<String>>,
    updated_at: i64,
}

#[derive(Deserialize)]
struct DepthUpdate {
    market: String,
    is_full: bool,
    depth: DepthPayload,
}

#[derive(Deserialize)]
struct DealEntry {
    deal_id: u64,
    created_at: i64,
    side: String,
    price: String,
    amount: String,
}

#[derive(Deserialize)]
struct DealsUpdate {
    market: String,
    deal_list: Vec<DealEntry>,
}

pub(crate) fn parse(market: MarketKind, frame: &[u8]) -> ParseOutcome {
    let value: Value = match serde_json::from_slice(frame) {
        Ok(value) => value,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };

    match value.get("method").and_then(Value::as_str) {
        Some("depth.update") => parse_depth(market, &value),
        Some("deals.update") => parse_deals(market, &value),
        // RPC replies (subscribe acks, pong) carry no method or an
        // unknown one.
        _ => ParseOutcome::Ignore,
    }
}

fn header(market: MarketKind, pair: Pair, seq: u64, timestamp_ms: i64) -> MessageHeader {
    MessageHeader {
        venue: VenueId::Coinex,
        market,
        pair,
        venue_seq: seq,
        timestamp_ms,
    }
}

fn parse_depth(market: MarketKind, value: &Value) -> ParseOutcome {
    let update: DepthUpdate = match value
        .get("data")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(update)) => update,
        Ok(None) | Err(_) => {
            return ParseOutcome::Error(ProtocolError::Malformed("bad depth payload".into()))
        }
    };
    let Some(pair) = split_concat_symbol(&update.market) else {
        return ParseOutcome::Ignore;
    };
    let bids = match parse_levels(&update.depth.bids) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    let asks = match parse_levels(&update.depth.asks) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    // No venue sequence on this dialect; the millisecond update time is
    // monotonic per market.
    let seq = u64::try_from(update.depth.updated_at).unwrap_or(0);
    let payload = if update.is_full {
        MessagePayload::BookSnapshot { bids, asks }
    } else {
        MessagePayload::BookDelta {
            bids,
            asks,
            prev_seq: None,
        }
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, seq, update.depth.updated_at),
        payload,
    })
}

fn parse_deals(market: MarketKind, value: &Value) -> ParseOutcome {
    let update: DealsUpdate = match value
        .get("data")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(update)) => update,
        Ok(None) | Err(_) => {
            return ParseOutcome::Error(ProtocolError::Malformed("bad deals payload".into()))
        }
    };
    let Some(pair) = split_concat_symbol(&update.market) else {
        return ParseOutcome::Ignore;
    };
    let Some(deal) = update.deal_list.last() else {
        return ParseOutcome::Ignore;
    };
    let (Ok(price), Ok(amount)) = (deal.price.parse(), deal.amount.parse()) else {
        return ParseOutcome::Error(ProtocolError::Malformed("bad deal numerics".into()));
    };
    let side = match deal.side.as_str() {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        other => {
            return ParseOutcome::Error(ProtocolError::Malformed(format!(
                "unknown deal side '{other}'"
            )))
        }
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, deal.deal_id, deal.created_at),
        payload: MessagePayload::Trade {
            price,
            amount,
            side,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_lists_markets_with_depth() {
        let pairs = vec![Pair::new("BTC", "USDT")];
        let frame = frame_subscribe(&pairs, BookDepth::Twenty);
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["method"], "depth.subscribe");
        assert_eq!(value["params"]["market_list"][0][0], "BTCUSDT");
        assert_eq!(value["params"]["market_list"][0][1], 20);
    }

    #[test]
    fn full_and_partial_updates_map_to_payloads() {
        let full = serde_json::json!({
            "method": "depth.update",
            "data": {
                "market": "BTCUSDT", "is_full": true,
                "depth": {"bids": [["64000", "1"]], "asks": [["64001", "2"]], "updated_at": 1_700_000_000_000i64}
            },
            "id": null
        })
        .to_string();
        let ParseOutcome::Message(msg) = parse(MarketKind::Spot, full.as_bytes()) else {
            panic!("expected message");
        };
        assert!(matches!(msg.payload, MessagePayload::BookSnapshot { .. }));

        let partial = serde_json::json!({
            "method": "depth.update",
            "data": {
                "market": "BTCUSDT", "is_full": false,
                "depth": {"bids": [["64000", "0"]], "asks": [], "updated_at": 1_700_000_000_100i64}
            },
            "id": null
        })
        .to_string();
        let ParseOutcome::Message(msg) = parse(MarketKind::Spot, partial.as_bytes()) else {
            panic!("expected message");
        };
        assert!(matches!(msg.payload, MessagePayload::BookDelta { .. }));
    }

    #[test]
    fn rpc_replies_are_ignored() {
        let pong = br#"{"id":1,"result":"pong","error":null}"#;
        assert_eq!(parse(MarketKind::Spot, pong), ParseOutcome::Ignore);
    }
}
