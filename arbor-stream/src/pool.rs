//! Routes (venue, market, pair set) onto a bounded set of sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use arbor_core::{BookDepth, BookKey, MarketKind, NormalizedMessage, Pair, VenueId};

use crate::session::{SessionConfig, SessionEvent, VenueSession};

/// Default ceiling on pairs multiplexed over one socket.
pub const DEFAULT_MAX_PAIRS_PER_SESSION: usize = 40;
/// How long an empty session lingers before its socket closes, to
/// absorb flapping desired state.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_pairs_per_session: usize,
    pub close_grace: Duration,
    /// Capacity of the merged downstream message channel.
    pub channel_capacity: usize,
    /// Test hooks replacing adapter endpoints per surface.
    pub endpoint_overrides: HashMap<(VenueId, MarketKind), String>,
    pub rest_overrides: HashMap<(VenueId, MarketKind), String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pairs_per_session: DEFAULT_MAX_PAIRS_PER_SESSION,
            close_grace: DEFAULT_CLOSE_GRACE,
            channel_capacity: 4096,
            endpoint_overrides: HashMap::new(),
            rest_overrides: HashMap::new(),
        }
    }
}

type SurfaceKey = (VenueId, MarketKind);

/// The connection pool. Messages from every session funnel into one
/// channel handed out at construction; per-session FIFO survives the
/// merge, cross-session order does not.
pub struct SessionPool {
    config: PoolConfig,
    sessions: Mutex<HashMap<SurfaceKey, Vec<VenueSession>>>,
    out_tx: mpsc::Sender<NormalizedMessage>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    next_session_id: AtomicU64,
}

impl SessionPool {
    pub fn new(
        config: PoolConfig,
        cancel: CancellationToken,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<NormalizedMessage>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (out_tx, out_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            out_tx,
            events_tx,
            cancel,
            next_session_id: AtomicU64::new(1),
        });
        (pool, out_rx, events_rx)
    }

    /// Distribute `pairs` across the surface's sessions, opening new
    /// ones past the per-session cap. A pair already held somewhere is
    /// left in place (same depth) or moved through unsubscribe/subscribe
    /// (depth change); a pair never lands on two sessions.
    pub fn subscribe(
        self: &Arc<Self>,
        venue: VenueId,
        market: MarketKind,
        pairs: &[Pair],
        depth: BookDepth,
    ) {
        let mut table = self.sessions.lock();
        let sessions = table.entry((venue, market)).or_default();

        let mut fresh: Vec<Pair> = Vec::new();
        for pair in pairs {
            match sessions.iter().find(|session| session.has_pair(pair)) {
                Some(session) => {
                    // Re-subscribing in place handles both the
                    // idempotent case and a depth change.
                    session.subscribe(std::slice::from_ref(pair), depth);
                }
                None => fresh.push(pair.clone()),
            }
        }

        // First fit in insertion order, then overflow into new sessions.
        let cap = self.config.max_pairs_per_session.max(1);
        let mut remaining = fresh.as_slice();
        for session in sessions.iter() {
            if remaining.is_empty() {
                break;
            }
            let room = cap.saturating_sub(session.pair_count());
            if room == 0 {
                continue;
            }
            let (chunk, rest) = remaining.split_at(room.min(remaining.len()));
            session.subscribe(chunk, depth);
            remaining = rest;
        }
        while !remaining.is_empty() {
            let (chunk, rest) = remaining.split_at(cap.min(remaining.len()));
            let session = self.open_session(venue, market);
            session.subscribe(chunk, depth);
            sessions.push(session);
            remaining = rest;
        }
        debug!(
            %venue, %market,
            pairs = pairs.len(),
            sessions = sessions.len(),
            "subscribe distributed"
        );
    }

    pub fn unsubscribe(self: &Arc<Self>, venue: VenueId, market: MarketKind, pairs: &[Pair]) {
        let table = self.sessions.lock();
        let Some(sessions) = table.get(&(venue, market)) else {
            return;
        };
        for session in sessions {
            let held: Vec<Pair> = pairs
                .iter()
                .filter(|pair| session.has_pair(pair))
                .cloned()
                .collect();
            if held.is_empty() {
                continue;
            }
            session.unsubscribe(&held);
            if session.is_empty() {
                self.schedule_close(venue, market, session.id());
            }
        }
    }

    /// Route a book-store resync request to whichever session owns the
    /// pair.
    pub fn resync(&self, key: &BookKey) {
        let table = self.sessions.lock();
        let Some(sessions) = table.get(&(key.venue, key.market)) else {
            warn!(%key, "resync requested for unknown surface");
            return;
        };
        match sessions.iter().find(|session| session.has_pair(&key.pair)) {
            Some(session) => session.resync(key.pair.clone()),
            None => warn!(%key, "resync requested for unowned pair"),
        }
    }

    /// Pair counts per session for one surface, in insertion order.
    #[must_use]
    pub fn session_sizes(&self, venue: VenueId, market: MarketKind) -> Vec<usize> {
        self.sessions
            .lock()
            .get(&(venue, market))
            .map(|sessions| sessions.iter().map(VenueSession::pair_count).collect())
            .unwrap_or_default()
    }

    /// Sessions a pair is currently held by (invariant: at most one).
    #[must_use]
    pub fn holders(&self, venue: VenueId, market: MarketKind, pair: &Pair) -> usize {
        self.sessions
            .lock()
            .get(&(venue, market))
            .map(|sessions| {
                sessions
                    .iter()
                    .filter(|session| session.has_pair(pair))
                    .count()
            })
            .unwrap_or(0)
    }

    #[must_use]
    pub fn total_pairs(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .flat_map(|sessions| sessions.iter())
            .map(VenueSession::pair_count)
            .sum()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().values().map(Vec::len).sum()
    }

    /// Close every session; used at shutdown after the root token is
    /// cancelled.
    pub fn close_all(&self) {
        let mut table = self.sessions.lock();
        for sessions in table.values() {
            for session in sessions {
                session.close();
            }
        }
        table.clear();
        info!("connection pool closed");
    }

    fn open_session(self: &Arc<Self>, venue: VenueId, market: MarketKind) -> VenueSession {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let mut config = SessionConfig::new(venue, market);
        if let Some(endpoint) = self.config.endpoint_overrides.get(&(venue, market)) {
            config.endpoint = endpoint.clone();
        }
        if let Some(rest) = self.config.rest_overrides.get(&(venue, market)) {
            config.rest_override = Some(rest.clone());
        }
        info!(%venue, %market, session = id, "opening session");
        VenueSession::spawn(
            id,
            config,
            self.out_tx.clone(),
            self.events_tx.clone(),
            self.cancel.child_token(),
        )
    }

    fn schedule_close(self: &Arc<Self>, venue: VenueId, market: MarketKind, session_id: u64) {
        let pool = Arc::downgrade(self);
        let grace = self.config.close_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(pool) = pool.upgrade() else {
                return;
            };
            let mut table = pool.sessions.lock();
            let Some(sessions) = table.get_mut(&(venue, market)) else {
                return;
            };
            // A pair may have landed back on the session during the
            // grace window; only still-empty sessions retire.
            if let Some(position) = sessions
                .iter()
                .position(|session| session.id() == session_id && session.is_empty())
            {
                let session = sessions.remove(position);
                session.close();
                debug!(%venue, %market, session = session_id, "closed idle session");
            }
        });
    }
}
