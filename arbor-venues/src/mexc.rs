//! MEXC v3 dialect: channel strings with object-shaped levels.

use arbor_core::{
    BookDepth, MarketKind, MessageHeader, MessagePayload, NormalizedMessage, Pair, PriceLevel,
    Side, VenueId,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::wire::{concat_symbol, split_concat_symbol};
use crate::{ParseOutcome, ProtocolError};

pub(crate) const SPOT_WS: &str = "wss://wbs.mexc.com/ws";
pub(crate) const FUTURES_WS: &str = "wss://contract.mexc.com/edge";

pub(crate) fn symbol(pair: &Pair) -> String {
    concat_symbol(pair)
}

pub(crate) fn rest_snapshot_url(market: MarketKind, pair: &Pair) -> String {
    match market {
        MarketKind::Spot => format!(
            "https://api.mexc.com/api/v3/depth?symbol={}&limit=1000",
            symbol(pair)
        ),
        MarketKind::Futures => format!(
            "https://contract.mexc.com/api/v1/contract/depth/{}",
            crate::wire::underscore_symbol(pair)
        ),
    }
}

fn book_channel(pair: &Pair, depth: BookDepth) -> String {
    match depth {
        BookDepth::Full => format!("spot@public.increase.depth.v3.api@{}", symbol(pair)),
        other => format!(
            "spot@public.limit.depth.v3.api@{}@{}",
            symbol(pair),
            other.levels()
        ),
    }
}

pub(crate) fn frame_subscribe(pairs: &[Pair], _market: MarketKind, depth: BookDepth) -> Vec<u8> {
    let mut params = Vec::with_capacity(pairs.len() * 2);
    for pair in pairs {
        params.push(book_channel(pair, depth));
        params.push(format!("spot@public.deals.v3.api@{}", symbol(pair)));
    }
    json!({"method": "SUBSCRIPTION", "params": params})
        .to_string()
        .into_bytes()
}

pub(crate) fn frame_unsubscribe(pairs: &[Pair], _market: MarketKind) -> Vec<u8> {
    let mut params = Vec::with_capacity(pairs.len() * 4);
    for pair in pairs {
        let sym = symbol(pair);
        params.push(format!("spot@public.increase.depth.v3.api@{sym}"));
        params.push(format!("spot@public.limit.depth.v3.api@{sym}@20"));
        params.push(format!("spot@public.limit.depth.v3.api@{sym}@50"));
        params.push(format!("spot@public.deals.v3.api@{sym}"));
    }
    json!({"method": "UNSUBSCRIPTION", "params": params})
        .to_string()
        .into_bytes()
}

pub(crate) fn ping_frame() -> Vec<u8> {
    json!({"method": "PING"}).to_string().into_bytes()
}

#[derive(Deserialize)]
struct ObjectLevel {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "v")]
    volume: String,
}

#[derive(Deserialize)]
struct DepthData {
    #[serde(default)]
    bids: Vec<ObjectLevel>,
    #[serde(default)]
    asks: Vec<ObjectLevel>,
    /// Book version; consecutive on the increase channel.
    #[serde(rename = "r", default)]
    version: Option<String>,
}

#[derive(Deserialize)]
struct DealEntry {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "v")]
    volume: String,
    /// 1 = buy, 2 = sell.
    #[serde(rename = "S")]
    side: u8,
    #[serde(rename = "t")]
    timestamp: i64,
}

fn object_levels(raw: &[ObjectLevel]) -> Result<Vec<PriceLevel>, String> {
    let mut levels = Vec::with_capacity(raw.len());
    for entry in raw {
        let price = entry.price.parse().map_err(|_| "bad price".to_string())?;
        let amount = entry.volume.parse().map_err(|_| "bad volume".to_string())?;
        levels.push(PriceLevel::new(price, amount));
    }
    Ok(levels)
}

pub(crate) fn parse(market: MarketKind, frame: &[u8]) -> ParseOutcome {
    let value: Value = match serde_json::from_slice(frame) {
        Ok(value) => value,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err.to_string())),
    };

    // PONG replies and subscription acks carry "msg" without a channel.
    let Some(channel) = value.get("c").and_then(Value::as_str) else {
        return ParseOutcome::Ignore;
    };
    let Some(sym) = value.get("s").and_then(Value::as_str) else {
        return ParseOutcome::Ignore;
    };
    let Some(pair) = split_concat_symbol(sym) else {
        return ParseOutcome::Ignore;
    };
    let timestamp_ms = value.get("t").and_then(Value::as_i64).unwrap_or(0);

    if channel.contains("public.increase.depth") {
        parse_depth(market, pair, &value, timestamp_ms, false)
    } else if channel.contains("public.limit.depth") {
        parse_depth(market, pair, &value, timestamp_ms, true)
    } else if channel.contains("public.deals") {
        parse_deals(market, pair, &value, timestamp_ms)
    } else {
        ParseOutcome::Ignore
    }
}

fn header(market: MarketKind, pair: Pair, seq: u64, timestamp_ms: i64) -> MessageHeader {
    MessageHeader {
        venue: VenueId::Mexc,
        market,
        pair,
        venue_seq: seq,
        timestamp_ms,
    }
}

fn parse_depth(
    market: MarketKind,
    pair: Pair,
    value: &Value,
    timestamp_ms: i64,
    limit_channel: bool,
) -> ParseOutcome {
    let data: DepthData = match value
        .get("d")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(data)) => data,
        Ok(None) | Err(_) => {
            return ParseOutcome::Error(ProtocolError::Malformed("bad depth payload".into()))
        }
    };
    let bids = match object_levels(&data.bids) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    let asks = match object_levels(&data.asks) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    let seq = data
        .version
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let payload = if limit_channel {
        MessagePayload::BookSnapshot { bids, asks }
    } else {
        MessagePayload::BookDelta {
            bids,
            asks,
            prev_seq: None,
        }
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, seq, timestamp_ms),
        payload,
    })
}

fn parse_deals(market: MarketKind, pair: Pair, value: &Value, timestamp_ms: i64) -> ParseOutcome {
    let deals: Vec<DealEntry> = match value
        .get("d")
        .and_then(|d| d.get("deals"))
        .cloned()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(deals)) => deals,
        Ok(None) | Err(_) => {
            return ParseOutcome::Error(ProtocolError::Malformed("bad deals payload".into()))
        }
    };
    let Some(deal) = deals.last() else {
        return ParseOutcome::Ignore;
    };
    let (Ok(price), Ok(amount)) = (deal.price.parse(), deal.volume.parse()) else {
        return ParseOutcome::Error(ProtocolError::Malformed("bad deal numerics".into()));
    };
    let side = match deal.side {
        1 => Side::Buy,
        2 => Side::Sell,
        other => {
            return ParseOutcome::Error(ProtocolError::Malformed(format!(
                "unknown deal side {other}"
            )))
        }
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, 0, deal.timestamp.max(timestamp_ms)),
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
    fn subscribe_picks_channel_by_depth() {
        let pairs = vec![Pair::new("BTC", "USDT")];
        let limited = String::from_utf8(frame_subscribe(&pairs, MarketKind::Spot, BookDepth::Twenty)).unwrap();
        assert!(limited.contains("spot@public.limit.depth.v3.api@BTCUSDT@20"));
        let full = String::from_utf8(frame_subscribe(&pairs, MarketKind::Spot, BookDepth::Full)).unwrap();
        assert!(full.contains("spot@public.increase.depth.v3.api@BTCUSDT"));
    }

    #[test]
    fn increase_depth_parses_object_levels() {
        let raw = serde_json::json!({
            "c": "spot@public.increase.depth.v3.api@BTCUSDT",
            "s": "BTCUSDT",
            "t": 1_700_000_000_000i64,
            "d": {
                "bids": [{"p": "64000.1", "v": "0.5"}],
                "asks": [{"p": "64001.2", "v": "0"}],
                "e": "spot@public.increase.depth.v3.api",
                "r": "3407459756"
            }
        })
        .to_string();
        let ParseOutcome::Message(msg) = parse(MarketKind::Spot, raw.as_bytes()) else {
            panic!("expected message");
        };
        assert_eq!(msg.header.venue_seq, 3_407_459_756);
        let MessagePayload::BookDelta { bids, asks, .. } = msg.payload else {
            panic!("expected delta");
        };
        assert_eq!(bids[0].price, dec!(64000.1));
        assert_eq!(asks[0].amount, dec!(0));
    }

    #[test]
    fn deal_side_codes_map() {
        let raw = serde_json::json!({
            "c": "spot@public.deals.v3.api@BTCUSDT",
            "s": "BTCUSDT",
            "t": 10i64,
            "d": {"deals": [{"p": "64000", "v": "1", "S": 2, "t": 9i64}]}
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
    fn pong_is_ignored() {
        assert_eq!(
            parse(MarketKind::Spot, br#"{"id":0,"code":0,"msg":"PONG"}"#),
            ParseOutcome::Ignore
        );
    }
}
