//! One live WebSocket to one (venue, market) surface.
//!
//! The session owns a driver task running a read/heartbeat/command
//! select loop. Transport failures never escape: the driver reconnects
//! forever with capped exponential backoff and replays its full
//! subscription set before announcing itself connected again.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use arbor_core::{BookDepth, MarketKind, MessagePayload, NormalizedMessage, Pair, VenueId};
use arbor_venues::{ParseOutcome, ProtocolError, VenueAdapter};

/// Consecutive malformed frames tolerated before the socket restarts.
pub const DEFAULT_MAX_PARSE_ERRORS: u32 = 10;
/// Deltas buffered per pair while a snapshot reload is in flight.
const RESYNC_BUFFER_CAP: usize = 1024;

/// Lifecycle notifications surfaced to the pool and telemetry.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Connected {
        venue: VenueId,
        market: MarketKind,
        session_id: u64,
    },
    Disconnected {
        venue: VenueId,
        market: MarketKind,
        session_id: u64,
        reason: String,
    },
    Resynced {
        venue: VenueId,
        market: MarketKind,
        pair: Pair,
    },
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub venue: VenueId,
    pub market: MarketKind,
    /// Dial target; defaults to the adapter's endpoint for the market.
    pub endpoint: String,
    /// Test hook replacing the venue REST snapshot URL.
    pub rest_override: Option<String>,
    pub dial_timeout: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub ping_interval: Duration,
    pub max_parse_errors: u32,
}

impl SessionConfig {
    pub fn new(venue: VenueId, market: MarketKind) -> Self {
        let adapter = VenueAdapter::new(venue);
        let ping_interval = adapter
            .client_ping()
            .map(|(cadence, _)| cadence)
            .unwrap_or(Duration::from_secs(10));
        Self {
            venue,
            market,
            endpoint: adapter.endpoint(market).to_string(),
            rest_override: None,
            dial_timeout: Duration::from_secs(15),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            ping_interval,
            max_parse_errors: DEFAULT_MAX_PARSE_ERRORS,
        }
    }
}

enum SessionCommand {
    Subscribe { pairs: Vec<Pair>, depth: BookDepth },
    Unsubscribe { pairs: Vec<Pair> },
    Resync { pair: Pair },
    Close,
}

struct SharedState {
    /// Current pair set with the depth each was subscribed at.
    pairs: Mutex<BTreeMap<Pair, BookDepth>>,
    connected: AtomicBool,
}

/// Handle to one session; cloning is cheap and all clones drive the
/// same socket.
#[derive(Clone)]
pub struct VenueSession {
    id: u64,
    venue: VenueId,
    market: MarketKind,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    shared: Arc<SharedState>,
}

impl VenueSession {
    /// Spawn the driver task and return its handle. The socket dials
    /// lazily inside the driver, so this never blocks.
    pub fn spawn(
        id: u64,
        config: SessionConfig,
        out_tx: mpsc::Sender<NormalizedMessage>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedState {
            pairs: Mutex::new(BTreeMap::new()),
            connected: AtomicBool::new(false),
        });
        let session = Self {
            id,
            venue: config.venue,
            market: config.market,
            command_tx,
            shared: shared.clone(),
        };
        let driver = SessionDriver {
            id,
            adapter: VenueAdapter::new(config.venue),
            config,
            shared,
            out_tx,
            events_tx,
            cancel,
            parse_errors: 0,
            resyncing: HashMap::new(),
        };
        tokio::spawn(driver.run(command_rx));
        session
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn venue(&self) -> VenueId {
        self.venue
    }

    #[must_use]
    pub fn market(&self) -> MarketKind {
        self.market
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pair_count(&self) -> usize {
        self.shared.pairs.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.pairs.lock().is_empty()
    }

    #[must_use]
    pub fn has_pair(&self, pair: &Pair) -> bool {
        self.shared.pairs.lock().contains_key(pair)
    }

    #[must_use]
    pub fn pairs(&self) -> Vec<Pair> {
        self.shared.pairs.lock().keys().cloned().collect()
    }

    /// Subscribe a batch of pairs at one depth. Pairs already present
    /// at the same depth are skipped; a depth change is executed as
    /// unsubscribe + subscribe.
    pub fn subscribe(&self, pairs: &[Pair], depth: BookDepth) {
        let mut fresh = Vec::new();
        let mut depth_changed = Vec::new();
        {
            let mut held = self.shared.pairs.lock();
            for pair in pairs {
                match held.get(pair) {
                    Some(existing) if *existing == depth => continue,
                    Some(_) => {
                        depth_changed.push(pair.clone());
                        held.insert(pair.clone(), depth);
                    }
                    None => {
                        fresh.push(pair.clone());
                        held.insert(pair.clone(), depth);
                    }
                }
            }
        }
        if !depth_changed.is_empty() {
            let _ = self.command_tx.send(SessionCommand::Unsubscribe {
                pairs: depth_changed.clone(),
            });
            fresh.extend(depth_changed);
        }
        if !fresh.is_empty() {
            let _ = self
                .command_tx
                .send(SessionCommand::Subscribe { pairs: fresh, depth });
        }
    }

    pub fn unsubscribe(&self, pairs: &[Pair]) {
        let mut removed = Vec::new();
        {
            let mut held = self.shared.pairs.lock();
            for pair in pairs {
                if held.remove(pair).is_some() {
                    removed.push(pair.clone());
                }
            }
        }
        if !removed.is_empty() {
            let _ = self
                .command_tx
                .send(SessionCommand::Unsubscribe { pairs: removed });
        }
    }

    /// Ask the session to reload one pair's book from the REST snapshot
    /// endpoint, buffering deltas in the meantime.
    pub fn resync(&self, pair: Pair) {
        let _ = self.command_tx.send(SessionCommand::Resync { pair });
    }

    pub fn close(&self) {
        let _ = self.command_tx.send(SessionCommand::Close);
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum LoopExit {
    Closed,
    Disconnected(String),
}

struct SessionDriver {
    id: u64,
    adapter: VenueAdapter,
    config: SessionConfig,
    shared: Arc<SharedState>,
    out_tx: mpsc::Sender<NormalizedMessage>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    parse_errors: u32,
    /// Pairs awaiting a snapshot, with the deltas buffered since.
    resyncing: HashMap<Pair, Vec<NormalizedMessage>>,
}

impl SessionDriver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let mut backoff = self.config.base_backoff;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let dial = timeout(self.config.dial_timeout, connect_async(&self.config.endpoint));
            let socket = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = dial => match result {
                    Ok(Ok((socket, _))) => socket,
                    Ok(Err(err)) => {
                        self.emit_disconnect(format!("dial failed: {err}"));
                        backoff = self.sleep_backoff(backoff).await;
                        continue;
                    }
                    Err(_) => {
                        self.emit_disconnect("dial timed out".to_string());
                        backoff = self.sleep_backoff(backoff).await;
                        continue;
                    }
                },
            };

            backoff = self.config.base_backoff;
            self.parse_errors = 0;
            let mut socket = socket;
            // Replay the full pair set before surfacing Connected so
            // downstream never observes a connected-but-bare session.
            if let Err(err) = self.resubscribe_all(&mut socket).await {
                self.emit_disconnect(format!("resubscribe failed: {err}"));
                backoff = self.sleep_backoff(backoff).await;
                continue;
            }
            self.shared.connected.store(true, Ordering::Release);
            let _ = self.events_tx.send(SessionEvent::Connected {
                venue: self.config.venue,
                market: self.config.market,
                session_id: self.id,
            });
            info!(
                venue = %self.config.venue,
                market = %self.config.market,
                session = self.id,
                "session connected"
            );

            match self.drive(&mut socket, &mut commands).await {
                LoopExit::Closed => {
                    let _ = socket.send(Message::Close(None)).await;
                    self.shared.connected.store(false, Ordering::Release);
                    return;
                }
                LoopExit::Disconnected(reason) => {
                    self.shared.connected.store(false, Ordering::Release);
                    self.emit_disconnect(reason);
                    backoff = self.sleep_backoff(backoff).await;
                }
            }
        }
    }

    async fn sleep_backoff(&self, current: Duration) -> Duration {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(current) => {}
        }
        (current * 2).min(self.config.max_backoff)
    }

    fn emit_disconnect(&self, reason: String) {
        debug!(
            venue = %self.config.venue,
            market = %self.config.market,
            session = self.id,
            reason,
            "session disconnected"
        );
        let _ = self.events_tx.send(SessionEvent::Disconnected {
            venue: self.config.venue,
            market: self.config.market,
            session_id: self.id,
            reason,
        });
    }

    async fn resubscribe_all(&mut self, socket: &mut WsStream) -> Result<(), String> {
        let grouped: Vec<(BookDepth, Vec<Pair>)> = {
            let held = self.shared.pairs.lock();
            let mut by_depth: BTreeMap<BookDepth, Vec<Pair>> = BTreeMap::new();
            for (pair, depth) in held.iter() {
                by_depth.entry(*depth).or_default().push(pair.clone());
            }
            by_depth.into_iter().collect()
        };
        for (depth, pairs) in grouped {
            let frame = self
                .adapter
                .frame_subscribe(&pairs, self.config.market, depth);
            self.send_frames(socket, frame).await?;
        }
        Ok(())
    }

    /// Some dialects pack one command per line; split before sending.
    async fn send_frames(&self, socket: &mut WsStream, frame: Vec<u8>) -> Result<(), String> {
        let text = String::from_utf8(frame).map_err(|err| err.to_string())?;
        for line in text.split('\n').filter(|line| !line.is_empty()) {
            socket
                .send(Message::Text(line.to_string()))
                .await
                .map_err(|err| err.to_string())?;
        }
        Ok(())
    }

    async fn drive(
        &mut self,
        socket: &mut WsStream,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> LoopExit {
        let mut heartbeat = interval(self.config.ping_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let read_deadline = self.config.ping_interval * 3;
        let mut last_rx = Instant::now();
        let cancel = self.cancel.clone();
        let (snapshot_tx, mut snapshot_rx) =
            mpsc::unbounded_channel::<(Pair, Result<NormalizedMessage, String>)>();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return LoopExit::Closed,
                command = commands.recv() => {
                    let Some(command) = command else {
                        return LoopExit::Closed;
                    };
                    match self.handle_command(socket, command, &snapshot_tx).await {
                        Ok(true) => return LoopExit::Closed,
                        Ok(false) => {}
                        Err(err) => return LoopExit::Disconnected(err),
                    }
                }
                message = socket.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            last_rx = Instant::now();
                            if let Some(exit) =
                                self.handle_bytes(socket, text.as_bytes(), &snapshot_tx).await
                            {
                                return exit;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            last_rx = Instant::now();
                            if let Some(exit) =
                                self.handle_bytes(socket, &bytes, &snapshot_tx).await
                            {
                                return exit;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            last_rx = Instant::now();
                            if socket.send(Message::Pong(payload)).await.is_err() {
                                return LoopExit::Disconnected("pong send failed".into());
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_rx = Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return LoopExit::Disconnected(format!("server closed: {frame:?}"));
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(err)) => {
                            return LoopExit::Disconnected(format!("read error: {err}"));
                        }
                        None => return LoopExit::Disconnected("stream ended".into()),
                    }
                }
                result = snapshot_rx.recv() => {
                    if let Some((pair, result)) = result {
                        self.finish_resync(pair, result).await;
                    }
                }
                _ = heartbeat.tick() => {
                    if last_rx.elapsed() > read_deadline {
                        return LoopExit::Disconnected(format!(
                            "read deadline exceeded ({}s silent)",
                            last_rx.elapsed().as_secs()
                        ));
                    }
                    if let Some((_, ping)) = self.adapter.client_ping() {
                        if self.send_frames(socket, ping).await.is_err() {
                            return LoopExit::Disconnected("ping send failed".into());
                        }
                    }
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        socket: &mut WsStream,
        command: SessionCommand,
        snapshot_tx: &mpsc::UnboundedSender<(Pair, Result<NormalizedMessage, String>)>,
    ) -> Result<bool, String> {
        match command {
            SessionCommand::Subscribe { pairs, depth } => {
                let frame = self.adapter.frame_subscribe(&pairs, self.config.market, depth);
                self.send_frames(socket, frame).await?;
                Ok(false)
            }
            SessionCommand::Unsubscribe { pairs } => {
                let frame = self.adapter.frame_unsubscribe(&pairs, self.config.market);
                self.send_frames(socket, frame).await?;
                Ok(false)
            }
            SessionCommand::Resync { pair } => {
                self.start_resync(pair, snapshot_tx);
                Ok(false)
            }
            SessionCommand::Close => Ok(true),
        }
    }

    async fn handle_bytes(
        &mut self,
        socket: &mut WsStream,
        bytes: &[u8],
        snapshot_tx: &mpsc::UnboundedSender<(Pair, Result<NormalizedMessage, String>)>,
    ) -> Option<LoopExit> {
        if self.adapter.is_ping(bytes) {
            if let Some(pong) = self.adapter.build_pong(bytes) {
                if self.send_frames(socket, pong).await.is_err() {
                    return Some(LoopExit::Disconnected("pong send failed".into()));
                }
            }
            return None;
        }
        match self.adapter.parse(self.config.market, bytes) {
            ParseOutcome::Message(message) => {
                self.parse_errors = 0;
                self.forward(message).await;
                None
            }
            ParseOutcome::Ignore => {
                self.parse_errors = 0;
                None
            }
            ParseOutcome::Error(ProtocolError::Malformed(reason)) => {
                self.parse_errors += 1;
                warn!(
                    venue = %self.config.venue,
                    market = %self.config.market,
                    session = self.id,
                    consecutive = self.parse_errors,
                    reason,
                    "malformed frame"
                );
                if self.parse_errors >= self.config.max_parse_errors {
                    Some(LoopExit::Disconnected(format!(
                        "{} consecutive parse errors",
                        self.parse_errors
                    )))
                } else {
                    None
                }
            }
            ParseOutcome::Error(ProtocolError::OutOfSequence { pair, .. }) => {
                self.parse_errors = 0;
                self.start_resync(pair, snapshot_tx);
                None
            }
        }
    }

    async fn forward(&mut self, message: NormalizedMessage) {
        if let MessagePayload::BookDelta { .. } = &message.payload {
            if let Some(buffer) = self.resyncing.get_mut(&message.header.pair) {
                if buffer.len() < RESYNC_BUFFER_CAP {
                    buffer.push(message);
                } else {
                    debug!(pair = %message.header.pair, "resync buffer full; dropping delta");
                }
                return;
            }
        }
        // Bounded handoff: a saturated downstream back-pressures this
        // session, never the other way around.
        let _ = self.out_tx.send(message).await;
    }

    fn start_resync(
        &mut self,
        pair: Pair,
        snapshot_tx: &mpsc::UnboundedSender<(Pair, Result<NormalizedMessage, String>)>,
    ) {
        if self.resyncing.contains_key(&pair) {
            return;
        }
        self.resyncing.insert(pair.clone(), Vec::new());
        let adapter = self.adapter;
        let market = self.config.market;
        let url = self
            .config
            .rest_override
            .clone()
            .unwrap_or_else(|| adapter.orderbook_rest_endpoint(market, &pair));
        let tx = snapshot_tx.clone();
        tokio::spawn(async move {
            let result = fetch_snapshot(adapter, market, &pair, &url).await;
            let _ = tx.send((pair, result));
        });
    }

    async fn finish_resync(&mut self, pair: Pair, result: Result<NormalizedMessage, String>) {
        let buffered = self.resyncing.remove(&pair).unwrap_or_default();
        match result {
            Ok(snapshot) => {
                let snapshot_seq = snapshot.header.venue_seq;
                self.forward_direct(snapshot).await;
                let mut replayed = 0usize;
                for mut message in buffered {
                    if message.header.venue_seq <= snapshot_seq {
                        continue;
                    }
                    // The snapshot already covers the predecessor link.
                    if let MessagePayload::BookDelta { prev_seq, .. } = &mut message.payload {
                        *prev_seq = None;
                    }
                    self.forward_direct(message).await;
                    replayed += 1;
                }
                debug!(%pair, replayed, "resync complete");
                let _ = self.events_tx.send(SessionEvent::Resynced {
                    venue: self.config.venue,
                    market: self.config.market,
                    pair,
                });
            }
            Err(err) => {
                warn!(%pair, error = err, "snapshot reload failed; will retry on next gap");
            }
        }
    }

    async fn forward_direct(&self, message: NormalizedMessage) {
        let _ = self.out_tx.send(message).await;
    }
}

async fn fetch_snapshot(
    adapter: VenueAdapter,
    market: MarketKind,
    pair: &Pair,
    url: &str,
) -> Result<NormalizedMessage, String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|err| err.to_string())?;
    let body = client
        .get(url)
        .send()
        .await
        .map_err(|err| err.to_string())?
        .error_for_status()
        .map_err(|err| err.to_string())?
        .bytes()
        .await
        .map_err(|err| err.to_string())?;
    adapter
        .parse_rest_snapshot(market, pair, &body)
        .map_err(|err| err.to_string())
}
