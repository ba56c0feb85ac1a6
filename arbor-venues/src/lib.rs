//! Per-venue wire contracts.
//!
//! Everything venue-specific lives behind [`VenueAdapter`]: endpoint
//! URLs, subscribe/unsubscribe framing, the ping/pong contract, and the
//! translation of raw frames into [`NormalizedMessage`]s. Adapters are
//! pure — no I/O, no mutable state — so the connection layer can treat
//! every venue identically. Adding a venue is adding one module and one
//! variant here.

use std::time::Duration;

use arbor_core::{BookDepth, MarketKind, NormalizedMessage, Pair, VenueId};
use thiserror::Error;

mod binance;
mod bybit;
mod coinex;
mod dex;
mod htx;
mod kucoin;
mod mexc;
mod okx;
mod rest;
mod wire;

pub use wire::split_concat_symbol;

/// Result of feeding one raw frame through an adapter.
#[derive(Clone, Debug, PartialEq)]
pub enum ParseOutcome {
    /// A frame the rest of the system cares about.
    Message(NormalizedMessage),
    /// Venue chatter with no normalized equivalent (acks, heartbeat
    /// echoes, unknown channels). Dropped silently.
    Ignore,
    /// The frame could not be honored; see [`ProtocolError`].
    Error(ProtocolError),
}

/// Frame-level protocol failures. Malformed frames are fatal for that
/// frame only; an out-of-sequence report tells the session to resync
/// the affected pair.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("out of sequence for {pair}: expected {expected}, got {got}")]
    OutOfSequence { pair: Pair, expected: u64, got: u64 },
}

/// Closed set of venue dialects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VenueAdapter {
    Binance,
    Bybit,
    Okx,
    Kucoin,
    Coinex,
    Htx,
    Mexc,
    Dex,
}

impl VenueAdapter {
    #[must_use]
    pub fn new(venue: VenueId) -> Self {
        match venue {
            VenueId::Binance => Self::Binance,
            VenueId::Bybit => Self::Bybit,
            VenueId::Okx => Self::Okx,
            VenueId::Kucoin => Self::Kucoin,
            VenueId::Coinex => Self::Coinex,
            VenueId::Htx => Self::Htx,
            VenueId::Mexc => Self::Mexc,
            VenueId::Dex => Self::Dex,
        }
    }

    #[must_use]
    pub fn venue(self) -> VenueId {
        match self {
            Self::Binance => VenueId::Binance,
            Self::Bybit => VenueId::Bybit,
            Self::Okx => VenueId::Okx,
            Self::Kucoin => VenueId::Kucoin,
            Self::Coinex => VenueId::Coinex,
            Self::Htx => VenueId::Htx,
            Self::Mexc => VenueId::Mexc,
            Self::Dex => VenueId::Dex,
        }
    }

    /// WebSocket endpoint for the spot surface.
    #[must_use]
    pub fn spot_endpoint(self) -> &'static str {
        match self {
            Self::Binance => binance::SPOT_WS,
            Self::Bybit => bybit::SPOT_WS,
            Self::Okx => okx::PUBLIC_WS,
            Self::Kucoin => kucoin::SPOT_WS,
            Self::Coinex => coinex::SPOT_WS,
            Self::Htx => htx::SPOT_WS,
            Self::Mexc => mexc::SPOT_WS,
            Self::Dex => dex::GATEWAY_WS,
        }
    }

    /// WebSocket endpoint for the futures surface.
    #[must_use]
    pub fn futures_endpoint(self) -> &'static str {
        match self {
            Self::Binance => binance::FUTURES_WS,
            Self::Bybit => bybit::FUTURES_WS,
            Self::Okx => okx::PUBLIC_WS,
            Self::Kucoin => kucoin::FUTURES_WS,
            Self::Coinex => coinex::FUTURES_WS,
            Self::Htx => htx::FUTURES_WS,
            Self::Mexc => mexc::FUTURES_WS,
            Self::Dex => dex::GATEWAY_WS,
        }
    }

    #[must_use]
    pub fn endpoint(self, market: MarketKind) -> &'static str {
        match market {
            MarketKind::Spot => self.spot_endpoint(),
            MarketKind::Futures => self.futures_endpoint(),
        }
    }

    /// REST endpoint serving full order-book snapshots, used by the
    /// session when a sequence gap forces a reload.
    #[must_use]
    pub fn orderbook_rest_endpoint(self, market: MarketKind, pair: &Pair) -> String {
        match self {
            Self::Binance => binance::rest_snapshot_url(market, pair),
            Self::Bybit => bybit::rest_snapshot_url(market, pair),
            Self::Okx => okx::rest_snapshot_url(market, pair),
            Self::Kucoin => kucoin::rest_snapshot_url(market, pair),
            Self::Coinex => coinex::rest_snapshot_url(market, pair),
            Self::Htx => htx::rest_snapshot_url(market, pair),
            Self::Mexc => mexc::rest_snapshot_url(market, pair),
            Self::Dex => dex::rest_snapshot_url(pair),
        }
    }

    /// Venue-native symbol for a canonical `BASE/QUOTE` pair.
    #[must_use]
    pub fn canonical_symbol(self, pair: &Pair) -> String {
        match self {
            Self::Binance => binance::symbol(pair),
            Self::Bybit => bybit::symbol(pair),
            Self::Okx => okx::symbol(pair),
            Self::Kucoin => kucoin::symbol(pair),
            Self::Coinex => coinex::symbol(pair),
            Self::Htx => htx::symbol(pair),
            Self::Mexc => mexc::symbol(pair),
            Self::Dex => dex::symbol(pair),
        }
    }

    /// Build the venue's subscribe message for a batch of pairs.
    #[must_use]
    pub fn frame_subscribe(self, pairs: &[Pair], market: MarketKind, depth: BookDepth) -> Vec<u8> {
        match self {
            Self::Binance => binance::frame_subscribe(pairs, market, depth),
            Self::Bybit => bybit::frame_subscribe(pairs, depth),
            Self::Okx => okx::frame_subscribe(pairs, market, depth),
            Self::Kucoin => kucoin::frame_subscribe(pairs, market, depth),
            Self::Coinex => coinex::frame_subscribe(pairs, depth),
            Self::Htx => htx::frame_subscribe(pairs, depth),
            Self::Mexc => mexc::frame_subscribe(pairs, market, depth),
            Self::Dex => dex::frame_subscribe(pairs, market, depth),
        }
    }

    /// Build the venue's unsubscribe message for a batch of pairs.
    #[must_use]
    pub fn frame_unsubscribe(self, pairs: &[Pair], market: MarketKind) -> Vec<u8> {
        match self {
            Self::Binance => binance::frame_unsubscribe(pairs, market),
            Self::Bybit => bybit::frame_unsubscribe(pairs),
            Self::Okx => okx::frame_unsubscribe(pairs, market),
            Self::Kucoin => kucoin::frame_unsubscribe(pairs, market),
            Self::Coinex => coinex::frame_unsubscribe(pairs),
            Self::Htx => htx::frame_unsubscribe(pairs),
            Self::Mexc => mexc::frame_unsubscribe(pairs, market),
            Self::Dex => dex::frame_unsubscribe(pairs, market),
        }
    }

    /// Whether the frame is an application-level ping from the server.
    /// Transport-level ping frames are handled by the socket itself.
    #[must_use]
    pub fn is_ping(self, frame: &[u8]) -> bool {
        match self {
            Self::Htx => htx::is_ping(frame),
            Self::Dex => dex::is_ping(frame),
            _ => false,
        }
    }

    /// Reply for a server-originated application ping.
    #[must_use]
    pub fn build_pong(self, ping: &[u8]) -> Option<Vec<u8>> {
        match self {
            Self::Htx => htx::build_pong(ping),
            Self::Dex => dex::build_pong(ping),
            _ => None,
        }
    }

    /// For venues where the client must originate pings: the cadence
    /// and frame to send. `None` means the server drives the heartbeat.
    #[must_use]
    pub fn client_ping(self) -> Option<(Duration, Vec<u8>)> {
        match self {
            Self::Bybit => Some((Duration::from_secs(10), bybit::ping_frame())),
            Self::Okx => Some((Duration::from_secs(10), okx::ping_frame())),
            Self::Kucoin => Some((Duration::from_secs(10), kucoin::ping_frame())),
            Self::Mexc => Some((Duration::from_secs(10), mexc::ping_frame())),
            Self::Coinex => Some((Duration::from_secs(5), coinex::ping_frame())),
            Self::Binance | Self::Htx | Self::Dex => None,
        }
    }

    /// Translate one raw frame into the normalized vocabulary.
    #[must_use]
    pub fn parse(self, market: MarketKind, frame: &[u8]) -> ParseOutcome {
        match self {
            Self::Binance => binance::parse(market, frame),
            Self::Bybit => bybit::parse(market, frame),
            Self::Okx => okx::parse(market, frame),
            Self::Kucoin => kucoin::parse(market, frame),
            Self::Coinex => coinex::parse(market, frame),
            Self::Htx => htx::parse(market, frame),
            Self::Mexc => mexc::parse(market, frame),
            Self::Dex => dex::parse(market, frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_round_trips_venue_ids() {
        for venue in VenueId::ALL {
            assert_eq!(VenueAdapter::new(venue).venue(), venue);
        }
    }

    #[test]
    fn endpoints_are_tls_websockets() {
        for venue in VenueId::ALL {
            let adapter = VenueAdapter::new(venue);
            assert!(adapter.spot_endpoint().starts_with("wss://"), "{venue}");
            assert!(adapter.futures_endpoint().starts_with("wss://"), "{venue}");
        }
    }

    #[test]
    fn heartbeat_direction_is_exclusive() {
        for venue in VenueId::ALL {
            let adapter = VenueAdapter::new(venue);
            let server_pings = adapter.build_pong(b"{\"ping\":1}").is_some()
                || matches!(adapter, VenueAdapter::Htx | VenueAdapter::Dex);
            let client_pings = adapter.client_ping().is_some();
            assert!(
                !(server_pings && client_pings),
                "{venue} declares both heartbeat directions"
            );
        }
    }
}
