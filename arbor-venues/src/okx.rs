//! OKX v5 public dialect. Spot and swap instruments share one public
//! endpoint; the instrument id encodes the market surface.

use arbor_core::{
    BookDepth, MarketKind, MessageHeader, MessagePayload, NormalizedMessage, Pair, Side, VenueId,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::wire::{dashed_symbol, parse_levels, split_delim_symbol};
use crate::{ParseOutcome, ProtocolError};

pub(crate) const PUBLIC_WS: &str = "wss://ws.okx.com:8443/ws/v5/public";

pub(crate) fn symbol(pair: &Pair) -> String {
    dashed_symbol(pair)
}

fn inst_id(pair: &Pair, market: MarketKind) -> String {
    match market {
        MarketKind::Spot => symbol(pair),
        MarketKind::Futures => format!("{}-SWAP", symbol(pair)),
    }
}

pub(crate) fn rest_snapshot_url(market: MarketKind, pair: &Pair) -> String {
    format!(
        "https://www.okx.com/api/v5/market/books?instId={}&sz=400",
        inst_id(pair, market)
    )
}

fn book_channel(depth: BookDepth) -> &'static str {
    // OKX publishes one incremental level-2 channel; the requested
    // depth is applied locally when trimming views.
    match depth {
        BookDepth::Twenty | BookDepth::Fifty | BookDepth::Full => "books",
    }
}

pub(crate) fn frame_subscribe(pairs: &[Pair], market: MarketKind, depth: BookDepth) -> Vec<u8> {
    let mut args = Vec::with_capacity(pairs.len() * 2);
    for pair in pairs {
        args.push(json!({"channel": book_channel(depth), "instId": inst_id(pair, market)}));
        args.push(json!({"channel": "trades", "instId": inst_id(pair, market)}));
    }
    json!({"op": "subscribe", "args": args}).to_string().into_bytes()
}

pub(crate) fn frame_unsubscribe(pairs: &[Pair], market: MarketKind) -> Vec<u8> {
    let mut args = Vec::with_capacity(pairs.len() * 2);
    for pair in pairs {
        args.push(json!({"channel": "books", "instId": inst_id(pair, market)}));
        args.push(json!({"channel": "trades", "instId": inst_id(pair, market)}));
    }
    json!({"op": "unsubscribe", "args": args})
        .to_string()
        .into_bytes()
}

pub(crate) fn ping_frame() -> Vec<u8> {
    b"ping".to_vec()
}

#[derive(Deserialize)]
struct BookEntry {
    bids: Vec<Vec<String>>,
    asks: Vec<Vec<String>>,
    #[serde(rename = "ts")]
    timestamp: String,
    #[serde(rename = "seqId")]
    seq_id: u64,
    #[serde(rename = "prevSeqId", default)]
    prev_seq_id: Option<i64>,
}

#[derive(Deserialize)]
struct TradeEntry {
    #[serde(rename = "px")]
    price: String,
    #[serde(rename = "sz")]
    size: String,
    side: String,
    #[serde(rename = "ts")]
    timestamp: String,
    #[serde(rename = "tradeId")]
    trade_id: String,
}

fn pair_from_inst(inst: &str) -> Option<(Pair, MarketKind)> {
    match inst.strip_suffix("-SWAP") {
        Some(spot_part) => split_delim_symbol(spot_part, '-').map(|p| (p, MarketKind::Futures)),
        None => split_delim_symbol(inst, '-').map(|p| (p, MarketKind::Spot)),
    }
}

pub(crate) fn parse(market: MarketKind, frame: &[u8]) -> ParseOutcome {
    if frame == b"pong" {
        return ParseOutcome::Ignore;
    }
    let value: Value = match serde_json::from_slice(frame) {
        Ok(value) => value,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };

    // Subscribe acks and error events carry an "event" tag.
    if value.get("event").is_some() {
        return ParseOutcome::Ignore;
    }
    let Some(arg) = value.get("arg") else {
        return ParseOutcome::Ignore;
    };
    let channel = arg.get("channel").and_then(Value::as_str).unwrap_or("");
    let inst = arg.get("instId").and_then(Value::as_str).unwrap_or("");
    let Some((pair, inst_market)) = pair_from_inst(inst) else {
        return ParseOutcome::Ignore;
    };
    if inst_market != market {
        return ParseOutcome::Ignore;
    }

    match channel {
        "books" | "books5" => parse_book(market, pair, &value),
        "trades" => parse_trade(market, pair, &value),
        _ => ParseOutcome::Ignore,
    }
}

fn header(market: MarketKind, pair: Pair, seq: u64, timestamp_ms: i64) -> MessageHeader {
    MessageHeader {
        venue: VenueId::Okx,
        market,
        pair,
        venue_seq: seq,
        timestamp_ms,
    }
}

fn parse_book(market: MarketKind, pair: Pair, value: &Value) -> ParseOutcome {
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("snapshot");
    let entries: Vec<BookEntry> = match value
        .get("data")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(entries)) => entries,
        Ok(None) | Err(_) => {
            return ParseOutcome::Error(ProtocolError::Malformed("bad book payload".into()))
        }
    };
    let Some(entry) = entries.into_iter().next() else {
        return ParseOutcome::Ignore;
    };
    let bids = match parse_levels(&entry.bids) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    let asks = match parse_levels(&entry.asks) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    let timestamp_ms = entry.timestamp.parse().unwrap_or(0);
    let payload = match action {
        "snapshot" => MessagePayload::BookSnapshot { bids, asks },
        _ => MessagePayload::BookDelta {
            bids,
            asks,
            // -1 marks the first message after a snapshot.
            prev_seq: entry.prev_seq_id.and_then(|prev| u64::try_from(prev).ok()),
        },
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, entry.seq_id, timestamp_ms),
        payload,
    })
}

fn parse_trade(market: MarketKind, pair: Pair, value: &Value) -> ParseOutcome {
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
    let Some(entry) = entries.last() else {
        return ParseOutcome::Ignore;
    };
    let (Ok(price), Ok(amount)) = (entry.price.parse(), entry.size.parse()) else {
        return ParseOutcome::Error(ProtocolError::Malformed("bad trade numerics".into()));
    };
    let side = match entry.side.as_str() {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        other => {
            return ParseOutcome::Error(ProtocolError::Malformed(format!(
                "unknown trade side '{other}'"
            )))
        }
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(
            market,
            pair,
            entry.trade_id.parse().unwrap_or(0),
            entry.timestamp.parse().unwrap_or(0),
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

    #[test]
    fn subscribe_frame_uses_inst_ids() {
        let pairs = vec![Pair::new("BTC", "USDT")];
        let frame = frame_subscribe(&pairs, MarketKind::Spot, BookDepth::Fifty);
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["args"][0]["channel"], "books");
        assert_eq!(value["args"][0]["instId"], "BTC-USDT");
        assert_eq!(value["args"][1]["channel"], "trades");
    }

    #[test]
    fn update_carries_predecessor_link() {
        let raw = serde_json::json!({
            "arg": {"channel": "books", "instId": "BTC-USDT"},
            "action": "update",
            "data": [{
                "bids": [["64000", "1"]], "asks": [["64001", "2"]],
                "ts": "1700000000123", "seqId": 990, "prevSeqId": 985
            }]
        })
        .to_string();
        let ParseOutcome::Message(msg) = parse(MarketKind::Spot, raw.as_bytes()) else {
            panic!("expected message");
        };
        assert_eq!(msg.header.venue_seq, 990);
        let MessagePayload::BookDelta { prev_seq, .. } = msg.payload else {
            panic!("expected delta");
        };
        assert_eq!(prev_seq, Some(985));
    }

    #[test]
    fn swap_inst_maps_to_futures_market() {
        let raw = serde_json::json!({
            "arg": {"channel": "books", "instId": "ETH-USDT-SWAP"},
            "action": "snapshot",
            "data": [{
                "bids": [["3000", "5"]], "asks": [["3001", "4"]],
                "ts": "1700000000000", "seqId": 1
            }]
        })
        .to_string();
        let ParseOutcome::Message(msg) = parse(MarketKind::Futures, raw.as_bytes()) else {
            panic!("expected message");
        };
        assert_eq!(msg.header.market, MarketKind::Futures);
        assert_eq!(msg.header.pair.as_str(), "ETH/USDT");
        // The same frame on a spot session is not ours to consume.
        assert_eq!(parse(MarketKind::Spot, raw.as_bytes()), ParseOutcome::Ignore);
    }

    #[test]
    fn pong_and_events_are_ignored() {
        assert_eq!(parse(MarketKind::Spot, b"pong"), ParseOutcome::Ignore);
        let ack = br#"{"event":"subscribe","arg":{"channel":"books","instId":"BTC-USDT"}}"#;
        assert_eq!(parse(MarketKind::Spot, ack), ParseOutcome::Ignore);
    }
}
