//! REST order-book snapshot decoding, one shape per venue.
//!
//! Sessions hit [`VenueAdapter::orderbook_rest_endpoint`] when a pair
//! needs a reload; the JSON bodies differ per venue the same way the
//! stream frames do, so the decoding lives here with the rest of the
//! dialect knowledge.

use arbor_core::{MarketKind, MessageHeader, MessagePayload, NormalizedMessage, Pair, PriceLevel};
use serde_json::Value;

use crate::wire::parse_levels;
use crate::{ProtocolError, VenueAdapter};

impl VenueAdapter {
    /// Decode the body returned by the venue's snapshot endpoint into a
    /// `BookSnapshot` message.
    pub fn parse_rest_snapshot(
        self,
        market: MarketKind,
        pair: &Pair,
        body: &[u8],
    ) -> Result<NormalizedMessage, ProtocolError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|err| ProtocolError::Malformed(err.to_string()))?;
        let (bids, asks, seq, timestamp_ms) = match self {
            // {"lastUpdateId":N,"bids":[["p","q"]],"asks":[...]}
            Self::Binance | Self::Mexc => {
                let seq = value
                    .get("lastUpdateId")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                (
                    string_levels(value.get("bids"))?,
                    string_levels(value.get("asks"))?,
                    seq,
                    0,
                )
            }
            // {"result":{"b":[...],"a":[...],"u":N,"ts":ms}}
            Self::Bybit => {
                let result = value
                    .get("result")
                    .ok_or_else(|| ProtocolError::Malformed("missing result".into()))?;
                (
                    string_levels(result.get("b"))?,
                    string_levels(result.get("a"))?,
                    result.get("u").and_then(Value::as_u64).unwrap_or(0),
                    result.get("ts").and_then(Value::as_i64).unwrap_or(0),
                )
            }
            // {"data":[{"bids":[["p","q","..",".."]],"asks":[...],"seqId":N,"ts":"ms"}]}
            Self::Okx => {
                let entry = value
                    .get("data")
                    .and_then(Value::as_array)
                    .and_then(|entries| entries.first())
                    .ok_or_else(|| ProtocolError::Malformed("missing data".into()))?;
                let seq = entry.get("seqId").and_then(Value::as_u64).unwrap_or(0);
                let ts = entry
                    .get("ts")
                    .and_then(Value::as_str)
                    .and_then(|ts| ts.parse().ok())
                    .unwrap_or(0);
                (
                    string_levels(entry.get("bids"))?,
                    string_levels(entry.get("asks"))?,
                    seq,
                    ts,
                )
            }
            // {"data":{"sequence":"N","bids":[["p","q"]],"asks":[...],"time":ms}}
            Self::Kucoin => {
                let data = value
                    .get("data")
                    .ok_or_else(|| ProtocolError::Malformed("missing data".into()))?;
                let seq = data
                    .get("sequence")
                    .and_then(Value::as_str)
                    .and_then(|seq| seq.parse().ok())
                    .unwrap_or(0);
                (
                    string_levels(data.get("bids"))?,
                    string_levels(data.get("asks"))?,
                    seq,
                    data.get("time").and_then(Value::as_i64).unwrap_or(0),
                )
            }
            // {"data":{"depth":{"bids":[["p","a"]],"asks":[...],"updated_at":ms}}}
            Self::Coinex => {
                let depth = value
                    .get("data")
                    .and_then(|data| data.get("depth"))
                    .ok_or_else(|| ProtocolError::Malformed("missing depth".into()))?;
                let ts = depth
                    .get("updated_at")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                (
                    string_levels(depth.get("bids"))?,
                    string_levels(depth.get("asks"))?,
                    u64::try_from(ts).unwrap_or(0),
                    ts,
                )
            }
            // {"tick":{"bids":[[p,a]],"asks":[...],"version":N,"ts":ms}}
            Self::Htx => {
                let tick = value
                    .get("tick")
                    .ok_or_else(|| ProtocolError::Malformed("missing tick".into()))?;
                (
                    numeric_levels(tick.get("bids"))?,
                    numeric_levels(tick.get("asks"))?,
                    tick.get("version").and_then(Value::as_u64).unwrap_or(0),
                    tick.get("ts").and_then(Value::as_i64).unwrap_or(0),
                )
            }
            // {"pair":"X/Y","seq":N,"ts":ms,"bids":[["p","a"]],"asks":[...]}
            Self::Dex => (
                string_levels(value.get("bids"))?,
                string_levels(value.get("asks"))?,
                value.get("seq").and_then(Value::as_u64).unwrap_or(0),
                value.get("ts").and_then(Value::as_i64).unwrap_or(0),
            ),
        };

        Ok(NormalizedMessage {
            header: MessageHeader {
                venue: self.venue(),
                market,
                pair: pair.clone(),
                venue_seq: seq,
                timestamp_ms,
            },
            payload: MessagePayload::BookSnapshot { bids, asks },
        })
    }
}

fn string_levels(raw: Option<&Value>) -> Result<Vec<PriceLevel>, ProtocolError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let entries: Vec<Vec<String>> = raw
        .as_array()
        .ok_or_else(|| ProtocolError::Malformed("levels not an array".into()))?
        .iter()
        .map(|entry| {
            entry
                .as_array()
                .map(|cols| {
                    cols.iter()
                        .take(2)
                        .map(|col| match col {
                            Value::String(text) => text.clone(),
                            other => other.to_string(),
                        })
                        .collect()
                })
                .ok_or_else(|| ProtocolError::Malformed("level not an array".into()))
        })
        .collect::<Result<_, _>>()?;
    parse_levels(&entries).map_err(ProtocolError::Malformed)
}

fn numeric_levels(raw: Option<&Value>) -> Result<Vec<PriceLevel>, ProtocolError> {
    // HTX publishes bare numbers; going through the literal keeps
    // precision, which `string_levels` already does via `to_string`.
    string_levels(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn binance_snapshot_decodes() {
        let body = serde_json::json!({
            "lastUpdateId": 12345,
            "bids": [["64000.5", "1.5"]],
            "asks": [["64001.0", "2.0"]]
        })
        .to_string();
        let msg = VenueAdapter::Binance
            .parse_rest_snapshot(MarketKind::Spot, &Pair::new("BTC", "USDT"), body.as_bytes())
            .unwrap();
        assert_eq!(msg.header.venue_seq, 12345);
        let MessagePayload::BookSnapshot { bids, .. } = msg.payload else {
            panic!("expected snapshot");
        };
        assert_eq!(bids[0].price, dec!(64000.5));
    }

    #[test]
    fn bybit_snapshot_decodes() {
        let body = serde_json::json!({
            "retCode": 0,
            "result": {
                "s": "BTCUSDT",
                "b": [["64000", "1"]],
                "a": [["64001", "2"]],
                "u": 99, "ts": 1_700_000_000_000i64
            }
        })
        .to_string();
        let msg = VenueAdapter::Bybit
            .parse_rest_snapshot(MarketKind::Spot, &Pair::new("BTC", "USDT"), body.as_bytes())
            .unwrap();
        assert_eq!(msg.header.venue_seq, 99);
        assert_eq!(msg.header.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn htx_numeric_snapshot_decodes() {
        let body = serde_json::json!({
            "status": "ok",
            "tick": {
                "bids": [[64000.5, 1.5]],
                "asks": [[64001.0, 2.0]],
                "version": 7, "ts": 5i64
            }
        })
        .to_string();
        let msg = VenueAdapter::Htx
            .parse_rest_snapshot(MarketKind::Spot, &Pair::new("BTC", "USDT"), body.as_bytes())
            .unwrap();
        let MessagePayload::BookSnapshot { bids, asks } = msg.payload else {
            panic!("expected snapshot");
        };
        assert_eq!(bids[0].amount, dec!(1.5));
        assert_eq!(asks[0].price, dec!(64001.0));
    }

    #[test]
    fn malformed_body_is_reported() {
        let err = VenueAdapter::Okx
            .parse_rest_snapshot(MarketKind::Spot, &Pair::new("BTC", "USDT"), b"{}")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
