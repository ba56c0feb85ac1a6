//! HTX (Huobi) dialect: gzip-compressed frames, numeric level arrays,
//! server-driven heartbeat.

use std::io::Read;

use arbor_core::{
    BookDepth, MarketKind, MessageHeader, MessagePayload, NormalizedMessage, Pair, PriceLevel,
    Side, VenueId,
};
use flate2::read::GzDecoder;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::wire::split_concat_symbol;
use crate::{ParseOutcome, ProtocolError};

pub(crate) const SPOT_WS: &str = "wss://api.huobi.pro/ws";
pub(crate) const FUTURES_WS: &str = "wss://api.hbdm.com/linear-swap-ws";

pub(crate) fn symbol(pair: &Pair) -> String {
    format!("{}{}", pair.base(), pair.quote()).to_lowercase()
}

pub(crate) fn rest_snapshot_url(market: MarketKind, pair: &Pair) -> String {
    match market {
        MarketKind::Spot => format!(
            "https://api.huobi.pro/market/depth?symbol={}&type=step0",
            symbol(pair)
        ),
        MarketKind::Futures => format!(
            "https://api.hbdm.com/linear-swap-ex/market/depth?contract_code={}-{}&type=step0",
            pair.base(),
            pair.quote()
        ),
    }
}

fn mbp_levels(depth: BookDepth) -> u32 {
    // Incremental market-by-price channels exist at 20 and 150 levels.
    match depth {
        BookDepth::Twenty => 20,
        BookDepth::Fifty | BookDepth::Full => 150,
    }
}

pub(crate) fn frame_subscribe(pairs: &[Pair], depth: BookDepth) -> Vec<u8> {
    // One sub per frame; batches are joined by the session sending the
    // frame once per pair topic. The first pair anchors the frame, the
    // rest ride the same channel family.
    let subs: Vec<Value> = pairs
        .iter()
        .map(|pair| json!({"sub": format!("market.{}.mbp.{}", symbol(pair), mbp_levels(depth)), "id": "1"}))
        .collect();
    join_frames(subs)
}

pub(crate) fn frame_unsubscribe(pairs: &[Pair]) -> Vec<u8> {
    let subs: Vec<Value> = pairs
        .iter()
        .flat_map(|pair| {
            let sym = symbol(pair);
            [
                json!({"unsub": format!("market.{sym}.mbp.20"), "id": "1"}),
                json!({"unsub": format!("market.{sym}.mbp.150"), "id": "1"}),
            ]
        })
        .collect();
    join_frames(subs)
}

// HTX accepts one command object per frame; newline-joined commands are
// split again by the session before sending.
fn join_frames(commands: Vec<Value>) -> Vec<u8> {
    commands
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n")
        .into_bytes()
}

fn inflate(frame: &[u8]) -> Option<Vec<u8>> {
    if frame.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(frame);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).ok()?;
        Some(out)
    } else {
        None
    }
}

fn decode(frame: &[u8]) -> Result<Value, String> {
    let inflated;
    let bytes = match inflate(frame) {
        Some(out) => {
            inflated = out;
            &inflated[..]
        }
        None => frame,
    };
    serde_json::from_slice(bytes).map_err(|err| err.to_string())
}

pub(crate) fn is_ping(frame: &[u8]) -> bool {
    decode(frame)
        .map(|value| value.get("ping").is_some())
        .unwrap_or(false)
}

pub(crate) fn build_pong(ping: &[u8]) -> Option<Vec<u8>> {
    let value = decode(ping).ok()?;
    let nonce = value.get("ping")?.as_i64()?;
    Some(json!({"pong": nonce}).to_string().into_bytes())
}

#[derive(Deserialize)]
struct MbpTick {
    #[serde(rename = "seqNum")]
    seq_num: u64,
    #[serde(rename = "prevSeqNum", default)]
    prev_seq_num: Option<u64>,
    #[serde(default)]
    bids: Vec<Vec<Value>>,
    #[serde(default)]
    asks: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct TradeItem {
    #[serde(rename = "tradeId", alias = "id")]
    trade_id: u64,
    ts: i64,
    amount: Value,
    price: Value,
    direction: String,
}

/// HTX publishes levels as JSON numbers; go through the literal text to
/// keep full precision.
fn numeric_levels(raw: &[Vec<Value>]) -> Result<Vec<PriceLevel>, String> {
    let mut levels = Vec::with_capacity(raw.len());
    for entry in raw {
        let price = decimal_from_value(entry.first().ok_or("missing price")?)?;
        let amount = decimal_from_value(entry.get(1).ok_or("missing amount")?)?;
        levels.push(PriceLevel::new(price, amount));
    }
    Ok(levels)
}

fn decimal_from_value(value: &Value) -> Result<Decimal, String> {
    match value {
        Value::Number(num) => num.to_string().parse().map_err(|_| "bad number".to_string()),
        Value::String(text) => text.parse().map_err(|_| "bad number".to_string()),
        _ => Err("expected numeric".to_string()),
    }
}

pub(crate) fn parse(market: MarketKind, frame: &[u8]) -> ParseOutcome {
    let value = match decode(frame) {
        Ok(value) => value,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };

    if value.get("ping").is_some() || value.get("pong").is_some() {
        return ParseOutcome::Ignore;
    }
    if value.get("subbed").is_some() || value.get("unsubbed").is_some() {
        return ParseOutcome::Ignore;
    }
    let Some(channel) = value.get("ch").and_then(Value::as_str) else {
        return ParseOutcome::Ignore;
    };
    let timestamp_ms = value.get("ts").and_then(Value::as_i64).unwrap_or(0);
    let mut parts = channel.split('.');
    let (Some("market"), Some(sym)) = (parts.next(), parts.next()) else {
        return ParseOutcome::Ignore;
    };
    let Some(pair) = split_concat_symbol(sym) else {
        return ParseOutcome::Ignore;
    };

    if channel.contains(".mbp.refresh.") {
        parse_mbp(market, pair, &value, timestamp_ms, true)
    } else if channel.contains(".mbp.") {
        parse_mbp(market, pair, &value, timestamp_ms, false)
    } else if channel.ends_with(".trade.detail") {
        parse_trade(market, pair, &value, timestamp_ms)
    } else {
        ParseOutcome::Ignore
    }
}

fn header(market: MarketKind, pair: Pair, seq: u64, timestamp_ms: i64) -> MessageHeader {
    MessageHeader {
        venue: VenueId::Htx,
        market,
        pair,
        venue_seq: seq,
        timestamp_ms,
    }
}

fn parse_mbp(
    market: MarketKind,
    pair: Pair,
    value: &Value,
    timestamp_ms: i64,
    refresh: bool,
) -> ParseOutcome {
    let tick: MbpTick = match value
        .get("tick")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(tick)) => tick,
        Ok(None) | Err(_) => {
            return ParseOutcome::Error(ProtocolError::Malformed("bad mbp tick".into()))
        }
    };
    let bids = match numeric_levels(&tick.bids) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    let asks = match numeric_levels(&tick.asks) {
        Ok(levels) => levels,
        Err(err) => return ParseOutcome::Error(ProtocolError::Malformed(err)),
    };
    let payload = if refresh || tick.prev_seq_num.is_none() {
        MessagePayload::BookSnapshot { bids, asks }
    } else {
        MessagePayload::BookDelta {
            bids,
            asks,
            prev_seq: tick.prev_seq_num,
        }
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, tick.seq_num, timestamp_ms),
        payload,
    })
}

fn parse_trade(market: MarketKind, pair: Pair, value: &Value, timestamp_ms: i64) -> ParseOutcome {
    let items: Vec<TradeItem> = match value
        .get("tick")
        .and_then(|tick| tick.get("data"))
        .cloned()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(items)) => items,
        Ok(None) | Err(_) => {
            return ParseOutcome::Error(ProtocolError::Malformed("bad trade tick".into()))
        }
    };
    let Some(item) = items.last() else {
        return ParseOutcome::Ignore;
    };
    let (Ok(price), Ok(amount)) = (
        decimal_from_value(&item.price),
        decimal_from_value(&item.amount),
    ) else {
        return ParseOutcome::Error(ProtocolError::Malformed("bad trade numerics".into()));
    };
    let side = match item.direction.as_str() {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        other => {
            return ParseOutcome::Error(ProtocolError::Malformed(format!(
                "unknown trade direction '{other}'"
            )))
        }
    };
    ParseOutcome::Message(NormalizedMessage {
        header: header(market, pair, item.trade_id, item.ts.max(timestamp_ms)),
        payload: MessagePayload::Trade {
            price,
            amount,
            side,
        },
    })
}
