//! In-house DEX gateway dialect. The gateway aggregates on-chain venues
//! behind one relay that already speaks canonical pairs, so this is the
//! thinnest adapter in the set.

use arbor_core::{
    BookDepth, MarketKind, MessageHeader, MessagePayload, NormalizedMessage, Pair, Side, VenueId,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::wire::parse_levels;
use crate::{ParseOutcome, ProtocolError};

pub(crate) const GATEWAY_WS: &str = "wss://dexgw.arbor.internal/ws";

pub(crate) fn symbol(pair: &Pair) -> String {
    pair.as_str().to_string()
}

pub(crate) fn rest_snapshot_url(pair: &Pair) -> String {
    format!(
        "https://dexgw.arbor.internal/api/v1/book?pair={}",
        symbol(pair).replace('/', "%2F")
    )
}

pub(crate) fn frame_subscribe(pairs: &[Pair], market: MarketKind, depth: BookDepth) -> Vec<u8> {
    let channels: Vec<Value> = pairs
        .iter()
        .map(|pair| {
            json!({
                "market": market.as_str(),
                "pair": symbol(pair),
                "depth": depth.levels(),
            })
        })
        .collect();
    json!({"action": "subscribe", "channels": channels})
        .to_string()
        .into_bytes()
}

pub(crate) fn frame_unsubscribe(pairs: &[Pair], market: MarketKind) -> Vec<u8> {
    let channels: Vec<Value> = pairs
        .iter()
        .map(|pair| json!({"market": market.as_str(), "pair": symbol(pair)}))
        .collect();
    json!({"action": "unsubscribe", "channels": channels})
        .to_string()
        .into_bytes()
}

pub(crate) fn is_ping(frame: &[u8]) -> bool {
    serde_json::from_slice::<Value>(frame)
        .map(|value| value.get("type").and_then(Value::as_str) == Some("ping"))
        .unwrap_or(false)
}

pub(crate) fn build_pong(ping: &[u8]) -> Option<Vec<u8>> {
    let value: Value = serde_json::from_slice(ping).ok()?;
    let ts = value.get("ts").and_then(Value::as_i64)?;
    Some(json!({"type": "pong", "ts": ts}).to_string().into_bytes())
}

#[derive(Deserialize)]
struct GatewayEvent {
    #[serde(rename = "type")]
    kind: String,
    market: String,
    pair: String,
    #[serde(default)]
    seq: u64,
    #[serde(default)]
    prev_seq: Option<u64>,
    #[serde(default)]
    ts: i64,
    #[serde(default)]
    bids: Vec<Vec<String>>,
    #[serde(default)]
    asks: Vec<Vec<String>>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    side: Option<String>,
}

pub(crate) fn parse(market: MarketKind, frame: &[u8]) -> ParseOutcome {
    let event: GatewayEvent = match serde_json::from_slice(frame) {
        Ok(event) => event,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };
    if event.market.parse::<MarketKind>() != Ok(market) {
        return ParseOutcome::Ignore;
    }
    let pair = Pair::from(event.pair.as_str());
    let header = MessageHeader {
        venue: VenueId::Dex,
        market,
        pair,
        venue_seq: event.seq,
        timestamp_ms: event.ts,
    };

    match event.kind.as_str() {
        "book_delta" | "book_snapshot" => {
            let bids = match parse_levels(&event.bids) {
                Ok(levels) => levels,
                Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
            };
            let asks = match parse_levels(&event.asks) {
                Ok(levels) => levels,
                Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
            };
            let payload = if event.kind == "book_snapshot" {
                MessagePayload::BookSnapshot { bids, asks }
            } else {
                MessagePayload::BookDelta {
                    bids,
                    asks,
                    prev_seq: event.prev_seq,
                }
            };
            ParseOutcome::Message(NormalizedMessage { header, payload })
        }
        "trade" => {
            let (Some(price), Some(amount), Some(side)) =
                (event.price, event.amount, event.side)
            else {
                return ParseOutcome::Error(ProtocolError::Malformed("incomplete trade".into()));
            };
            let (Ok(price), Ok(amount)) = (price.parse(), amount.parse()) else {
                return ParseOutcome::Error(ProtocolError::Malformed("bad trade numerics".into()));
            };
            let side = match side.parse::<Side>() {
                Ok(side) => side,
                Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
            };
            ParseOutcome::Message(NormalizedMessage {
                header,
                payload: MessagePayload::Trade {
                    price,
                    amount,
                    side,
                },
            })
        }
        // acks, info frames
        _ => ParseOutcome::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_carries_market_pair_depth() {
        let pairs = vec![Pair::new("WETH", "USDC")];
        let frame = frame_subscribe(&pairs, MarketKind::Spot, BookDepth::Fifty);
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["action"], "subscribe");
        assert_eq!(value["channels"][0]["pair"], "WETH/USDC");
        assert_eq!(value["channels"][0]["depth"], 50);
    }

    #[test]
    fn ping_pong_echoes_timestamp() {
        let ping = br#"{"type":"ping","ts":1700000000000}"#;
        assert!(is_ping(ping));
        let pong = build_pong(ping).unwrap();
        let value: Value = serde_json::from_slice(&pong).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(value["ts"], 1_700_000_000_000i64);
    }

    #[test]
    fn delta_passes_through_with_predecessor() {
        let raw = serde_json::json!({
            "type": "book_delta", "market": "spot", "pair": "WETH/USDC",
            "seq": 42, "prev_seq": 41, "ts": 1_700_000_000_000i64,
            "bids": [["3000.5", "2"]], "asks": []
        })
        .to_string();
        let ParseOutcome::Message(msg) = parse(MarketKind::Spot, raw.as_bytes()) else {
            panic!("expected message");
        };
        assert_eq!(msg.header.venue, VenueId::Dex);
        let MessagePayload::BookDelta { prev_seq, .. } = msg.payload else {
            panic!("expected delta");
        };
        assert_eq!(prev_seq, Some(41));
    }

    #[test]
    fn wrong_market_is_ignored() {
        let raw = serde_json::json!({
            "type": "book_delta", "market": "futures", "pair": "WETH/USDC",
            "seq": 1, "ts": 0, "bids": [], "asks": []
        })
        .to_string();
        assert_eq!(parse(MarketKind::Spot, raw.as_bytes()), ParseOutcome::Ignore);
    }
}
