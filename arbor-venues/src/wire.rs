//! Helpers shared by the venue dialect modules.

use std::str::FromStr;

use arbor_core::{Pair, PriceLevel};
use rust_decimal::Decimal;

/// Quote assets recognized when splitting concatenated symbols like
/// `BTCUSDT`. Ordered longest-first so `USDT` wins over `USD`.
const QUOTE_ASSETS: [&str; 8] = ["USDT", "USDC", "TUSD", "BUSD", "USD", "BTC", "ETH", "EUR"];

/// `BTC/USDT` → `BTCUSDT`.
pub(crate) fn concat_symbol(pair: &Pair) -> String {
    format!("{}{}", pair.base(), pair.quote())
}

/// `BTC/USDT` → `BTC-USDT`.
pub(crate) fn dashed_symbol(pair: &Pair) -> String {
    format!("{}-{}", pair.base(), pair.quote())
}

/// `BTC/USDT` → `BTC_USDT`.
pub(crate) fn underscore_symbol(pair: &Pair) -> String {
    format!("{}_{}", pair.base(), pair.quote())
}

/// Recover a canonical pair from a concatenated venue symbol by peeling
/// a known quote asset off the end. Returns `None` when no known quote
/// matches.
#[must_use]
pub fn split_concat_symbol(symbol: &str) -> Option<Pair> {
    let upper = symbol.to_uppercase();
    for quote in QUOTE_ASSETS {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return Some(Pair::new(base, quote));
            }
        }
    }
    None
}

/// Recover a canonical pair from a delimited venue symbol (`BTC-USDT`,
/// `BTC_USDT`).
pub(crate) fn split_delim_symbol(symbol: &str, delim: char) -> Option<Pair> {
    let mut parts = symbol.split(delim);
    let base = parts.next()?;
    let quote = parts.next()?;
    if base.is_empty() || quote.is_empty() || parts.next().is_some() {
        return None;
    }
    Some(Pair::new(base, quote))
}

/// Parse `[["price","amount"], …]` level arrays, the form most venues
/// publish.
pub(crate) fn parse_levels(raw: &[Vec<String>]) -> Result<Vec<PriceLevel>, String> {
    let mut levels = Vec::with_capacity(raw.len());
    for entry in raw {
        let price = entry
            .first()
            .ok_or_else(|| "missing price".to_string())
            .and_then(|v| Decimal::from_str(v).map_err(|err| err.to_string()))?;
        let amount = entry
            .get(1)
            .ok_or_else(|| "missing amount".to_string())
            .and_then(|v| Decimal::from_str(v).map_err(|err| err.to_string()))?;
        levels.push(PriceLevel::new(price, amount));
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_split_round_trips_known_quotes() {
        let pair = Pair::new("BTC", "USDT");
        assert_eq!(split_concat_symbol(&concat_symbol(&pair)), Some(pair));
        assert_eq!(
            split_concat_symbol("ETHBTC"),
            Some(Pair::new("ETH", "BTC"))
        );
        assert_eq!(split_concat_symbol("XYZABC"), None);
        assert_eq!(split_concat_symbol("USDT"), None);
    }

    #[test]
    fn delimited_split_rejects_garbage() {
        assert_eq!(
            split_delim_symbol("BTC-USDT", '-'),
            Some(Pair::new("BTC", "USDT"))
        );
        assert_eq!(split_delim_symbol("BTC-USDT-PERP", '-'), None);
        assert_eq!(split_delim_symbol("BTCUSDT", '-'), None);
    }

    #[test]
    fn levels_parse_and_reject() {
        let raw = vec![
            vec!["100.5".to_string(), "0.25".to_string()],
            vec!["100.0".to_string(), "0".to_string()],
        ];
        let levels = parse_levels(&raw).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[1].amount, Decimal::ZERO);

        let bad = vec![vec!["not-a-number".to_string(), "1".to_string()]];
        assert!(parse_levels(&bad).is_err());
    }
}
