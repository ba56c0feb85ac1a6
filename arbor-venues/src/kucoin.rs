//! Kucoin dialect. Topics are comma-batched; the client owns the
//! heartbeat.

use arbor_core::{
    BookDepth, MarketKind, MessageHeader, MessagePayload, NormalizedMessage, Pair, Side, VenueId,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::wire::{dashed_symbol, parse_levels, split_delim_symbol};
use crate::{ParseOutcome, ProtocolError};

pub(crate) const SPOT_WS: &str = "wss://ws-api-spot.kucoin.com/";
pub(crate) const FUTURES_WS: &str = "wss://ws-api-futures.kucoin.com/";

pub(crate) fn symbol(pair: &Pair) -> String {
    dashed_symbol(pair)
}

pub(crate) fn rest_snapshot_url(market: MarketKind, pair: &Pair) -> String {
    let host = match market {
        MarketKind::Spot => "https://api.kucoin.com",
        MarketKind::Futures => "https://api-futures.kucoin.com",
    };
    format!(
        "{host}/api/v3/market/orderbook/level2?symbol={}",
        symbol(pair)
    )
}

// A subscribe frame addresses exactly one topic, so every depth rides
// the incremental level2 channel and views are trimmed locally. The
// fixed-depth snapshot channels remain parseable for sessions migrated
// from older deployments.
fn book_topic(pairs: &[Pair]) -> String {
    let symbols = pairs.iter().map(symbol).collect::<Vec<_>>().join(",");
    format!("/market/level2:{symbols}")
}

pub(crate) fn frame_subscribe(pairs: &[Pair], _market: MarketKind, _depth: BookDepth) -> Vec<u8> {
    json!({
        "id": 1,
        "type": "subscribe",
        "topic": book_topic(pairs),
        "privateChannel": false,
        "response": true,
    })
    .to_string()
    .into_bytes()
}

pub(crate) fn frame_unsubscribe(pairs: &[Pair], _market: MarketKind) -> Vec<u8> {
    json!({
        "id": 1,
        "type": "unsubscribe",
        "topic": book_topic(pairs),
        "privateChannel": false,
        "response": true,
    })
    .to_string()
    .into_bytes()
}

pub(crate) fn ping_frame() -> Vec<u8> {
    json!({"id": 1, "type": "ping"}).to_string().into_bytes()
}

#[derive(Deserialize)]
struct Level2Changes {
    #[serde(default)]
    bids: Vec<Vec<String>>,
    #[serde(default)]
    asks: Vec<Vec<String>>,
}

#[derive(Deserialize)]
struct Level2Update {
    #[serde(rename = "sequenceStart")]
    sequence_start: u64,
    #[serde(rename = "sequenceEnd")]
    sequence_end: u64,
    symbol: String,
    changes: Level2Changes,
}

#[derive(Deserialize)]
struct DepthSnapshot {
    #[serde(default)]
    bids: Vec<Vec<String>>,
    #[serde(default)]
    asks: Vec<Vec<String>>,
    timestamp: i64,
}

#[derive(Deserialize)]
struct MatchData {
    symbol: String,
    side: String,
    price: String,
    size: String,
    sequence: String,
    /// Nanosecond wall time.
    time: String,
}

pub(crate) fn parse(market: MarketKind, frame: &[u8]) -> ParseOutcome {
    let value: Value = match serde_json::from_slice(frame) {
        Ok(value) => value,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };

    match value.get("type").and_then(Value::as_str) {
        Some("message") => {}
        // welcome, ack, pong
        Some(_) => return ParseOutcome::Ignore,
        None => return ParseOutcome::Ignore,
    }
    let topic = value.get("topic").and_then(Value::as_str).unwrap_or("");
    let data = value.get("data").cloned().unwrap_or(Value::Null);

    if topic.starts_with("/market/level2:") {
        parse_level2(market, data)
    } else if topic.starts_with("/spotMarket/level2Depth") {
        parse_depth_snapshot(market, topic, data)
    } else if topic.starts_with("/market/match:") {
        parse_match(market, data)
    } else {
        ParseOutcome::Ignore
    }
}

fn header(market: MarketKind, pair: Pair, seq: u64, timestamp_ms: i64) -> MessageHeader {
    MessageHeader {
        venue: VenueId::Kucoin,
        market,
        pair,
        venue_seq: seq,
        timestamp_ms,
    }
}

/// Level entries arrive as `[price, size, sequence]`; the trailing
/// sequence column is dropped before numeric parsing.
fn trim_levels(raw: &[Vec<String>]) -> Vec<Vec<String>> {
    raw.iter()
        .map(|entry| entry.iter().take(2).cloned().collect())
        .collect()
}

fn parse_level2(market: MarketKind, data: Value) -> ParseOutcome {
    let update: Level2Update = match serde_json::from_value(data) {
        Ok(update) => update,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };
    let Some(pair) = split_delim_symbol(&update.symbol, '-') else {
        return ParseOutcome::Ignore;
    };
    let bids = match parse_levels(&trim_levels(&update.changes.bids)) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    let asks = match parse_levels(&trim_levels(&update.changes.asks)) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, update.sequence_end, 0),
        payload: MessagePayload::BookDelta {
            bids,
            asks,
            prev_seq: update.sequence_start.checked_sub(1),
        },
    })
}

fn parse_depth_snapshot(market: MarketKind, topic: &str, data: Value) -> ParseOutcome {
    let Some(sym) = topic.split(':').nth(1) else {
        return ParseOutcome::Ignore;
    };
    let Some(pair) = split_delim_symbol(sym, '-') else {
        return ParseOutcome::Ignore;
    };
    let snapshot: DepthSnapshot = match serde_json::from_value(data) {
        Ok(snapshot) => snapshot,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };
    let bids = match parse_levels(&snapshot.bids) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    let asks = match parse_levels(&snapshot.asks) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    // The depth channels publish full refreshes with no sequence; the
    // millisecond timestamp is monotonic enough to stand in.
    let seq = u64::try_from(snapshot.timestamp).unwrap_or(0);
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, seq, snapshot.timestamp),
        payload: MessagePayload::BookSnapshot { bids, asks },
    })
}

fn parse_match(market: MarketKind, data: Value) -> ParseOutcome {
    let matched: MatchData = match serde_json::from_value(data) {
        Ok(matched) => matched,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };
    let Some(pair) = split_delim_symbol(&matched.symbol, '-') else {
        return ParseOutcome::Ignore;
    };
    let (Ok(price), Ok(amount)) = (matched.price.parse(), matched.size.parse()) else {
        return ParseOutcome::Error(ProtocolError::Malformed("bad trade numerics".into()));
    };
    let side = match matched.side.as_str() {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        other => {
            return ParseOutcome::Error(ProtocolError::Malformed(format!(
                "unknown trade side '{other}'"
            )))
        }
    };
    let timestamp_ms = matched
        .time
        .parse::<i64>()
        .map(|nanos| nanos / 1_000_000)
        .unwrap_or(0);
    ParseOutcome::Message(NormalizedMessage {
        header: header(
            market,
            pair,
            matched.sequence.parse().unwrap_or(0),
            timestamp_ms,
        ),
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
    use rust_decimal_macros::dec;

    #[test]
    fn subscribe_batches_symbols_into_one_topic() {
        let pairs = vec![Pair::new("BTC", "USDT"), Pair::new("ETH", "USDT")];
        let frame = frame_subscribe(&pairs, MarketKind::Spot, BookDepth::Fifty);
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["topic"], "/market/level2:BTC-USDT,ETH-USDT");
        assert_eq!(value["type"], "subscribe");

        let unsub = frame_unsubscribe(&pairs, MarketKind::Spot);
        let value: Value = serde_json::from_slice(&unsub).unwrap();
        assert_eq!(value["topic"], "/market/level2:BTC-USDT,ETH-USDT");
        assert_eq!(value["type"], "unsubscribe");
    }

    #[test]
    fn level2_update_keeps_sequence_window() {
        let raw = serde_json::json!({
            "type": "message",
            "topic": "/market/level2:BTC-USDT",
            "subject": "trade.l2update",
            "data": {
                "sequenceStart": 101, "sequenceEnd": 103, "symbol": "BTC-USDT",
                "changes": {
                    "bids": [["64000", "1.5", "101"]],
                    "asks": [["64001", "0", "102"]]
                }
            }
        })
        .to_string();
        let ParseOutcome::Message(msg) = parse(MarketKind::Spot, raw.as_bytes()) else {
            panic!("expected message");
        };
        assert_eq!(msg.header.venue_seq, 103);
        let MessagePayload::BookDelta {
            bids,
            asks,
            prev_seq,
        } = msg.payload
        else {
            panic!("expected delta");
        };
        assert_eq!(prev_seq, Some(100));
        assert_eq!(bids[0].amount, dec!(1.5));
        assert_eq!(asks[0].amount, dec!(0));
    }

    #[test]
    fn depth_channel_is_a_snapshot() {
        let raw = serde_json::json!({
            "type": "message",
            "topic": "/spotMarket/level2Depth20:ETH-USDT",
            "data": {
                "bids": [["3000", "2"]],
                "asks": [["3001", "1"]],
                "timestamp": 1_700_000_000_000i64
            }
        })
        .to_string();
        let ParseOutcome::Message(msg) = parse(MarketKind::Spot, raw.as_bytes()) else {
            panic!("expected message");
        };
        assert_eq!(msg.header.pair.as_str(), "ETH/USDT");
        assert!(matches!(msg.payload, MessagePayload::BookSnapshot { .. }));
    }

    #[test]
    fn welcome_and_pong_are_ignored() {
        let welcome = br#"{"id":"x","type":"welcome"}"#;
        assert_eq!(parse(MarketKind::Spot, welcome), ParseOutcome::Ignore);
        let pong = br#"{"id":"1","type":"pong"}"#;
        assert_eq!(parse(MarketKind::Spot, pong), ParseOutcome::Ignore);
    }
}
