//! Order-book store and local pub/sub.
//!
//! One applier task feeds [`BookStore::apply`] with normalized messages;
//! per-key FIFO comes from that single-writer arrangement. Subscribers
//! hang off bounded queues so a stalled consumer can never back-pressure
//! the applier: the queue drops its oldest entry and counts the loss.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use arbor_core::{
    BookDepth, BookKey, BookUpdateError, MessagePayload, NormalizedMessage, OrderBook,
};

/// Default bound for each subscriber's queue.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 1024;

/// Why the store wants a fresh snapshot for a pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResyncReason {
    /// A delta arrived with a sequence the book cannot follow.
    SequenceGap { seq: u64, current: u64 },
    /// The merged book violated `best_bid < best_ask`.
    CrossedBook,
}

/// Request sent to the connection layer to reload one pair's book.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResyncRequest {
    pub key: BookKey,
    pub reason: ResyncReason,
}

/// Local consumers implement this; dispatch happens on a queue-drain
/// task, never inside the applier.
pub trait Subscriber: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn on_message(&self, message: NormalizedMessage);
    /// Invoked when the store flags an inconsistency on a key the
    /// subscriber watches.
    fn on_error(&self, key: &BookKey, reason: &ResyncReason) {
        let _ = (key, reason);
    }
}

/// Counters surfaced to telemetry.
#[derive(Clone, Debug, Default)]
pub struct BookStoreStats {
    pub applied: u64,
    pub duplicates: u64,
    pub gaps: u64,
    pub crossed: u64,
    pub dropped_messages: u64,
}

struct SubscriberQueue {
    subscriber: Arc<dyn Subscriber>,
    queue: Mutex<VecDeque<NormalizedMessage>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    capacity: usize,
}

impl SubscriberQueue {
    fn push(&self, message: NormalizedMessage) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 1000 == 0 {
                warn!(
                    subscriber = self.subscriber.id(),
                    dropped, "subscriber queue saturated; dropping oldest"
                );
            }
        }
        queue.push_back(message);
        drop(queue);
        self.notify.notify_one();
    }

    async fn drain_loop(self: Arc<Self>) {
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(message) => self.subscriber.on_message(message),
                None => {
                    if self.closed.load(Ordering::Acquire) {
                        return;
                    }
                    self.notify.notified().await;
                }
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct Registration {
    key: BookKey,
    queue: Arc<SubscriberQueue>,
}

/// The live book map plus its subscriber registry.
pub struct BookStore {
    books: RwLock<HashMap<BookKey, OrderBook>>,
    /// Registration order is dispatch order.
    subscribers: RwLock<Vec<Registration>>,
    resync_tx: mpsc::UnboundedSender<ResyncRequest>,
    queue_capacity: usize,
    applied: AtomicU64,
    duplicates: AtomicU64,
    gaps: AtomicU64,
    crossed: AtomicU64,
}

impl BookStore {
    /// Build a store; the receiver surfaces resync requests to the
    /// connection layer.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ResyncRequest>) {
        Self::with_queue_capacity(DEFAULT_SUBSCRIBER_QUEUE)
    }

    pub fn with_queue_capacity(
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ResyncRequest>) {
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        let store = Arc::new(Self {
            books: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            resync_tx,
            queue_capacity: queue_capacity.max(1),
            applied: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            gaps: AtomicU64::new(0),
            crossed: AtomicU64::new(0),
        });
        (store, resync_rx)
    }

    /// Apply one normalized message: book variants mutate the map, all
    /// variants fan out to matching subscribers.
    pub fn apply(&self, message: NormalizedMessage) {
        let key = message.header.book_key();
        match &message.payload {
            MessagePayload::BookSnapshot { bids, asks } => {
                let mut books = self.books.write();
                let book = books
                    .entry(key.clone())
                    .or_insert_with(|| OrderBook::new(key.clone(), BookDepth::Fifty));
                book.load_snapshot(
                    message.header.venue_seq,
                    message.header.timestamp_ms,
                    bids,
                    asks,
                );
                self.applied.fetch_add(1, Ordering::Relaxed);
            }
            MessagePayload::BookDelta {
                bids,
                asks,
                prev_seq,
            } => {
                let mut books = self.books.write();
                let book = books
                    .entry(key.clone())
                    .or_insert_with(|| OrderBook::new(key.clone(), BookDepth::Fifty));
                match book.apply_delta(
                    message.header.venue_seq,
                    *prev_seq,
                    message.header.timestamp_ms,
                    bids,
                    asks,
                ) {
                    Ok(()) => {
                        self.applied.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(BookUpdateError::StaleSequence { seq, current }) => {
                        // Harmless duplicate; swallow without dispatch.
                        self.duplicates.fetch_add(1, Ordering::Relaxed);
                        debug!(%key, seq, current, "dropped duplicate book delta");
                        return;
                    }
                    Err(BookUpdateError::SequenceGap { seq, current }) => {
                        self.gaps.fetch_add(1, Ordering::Relaxed);
                        drop(books);
                        self.raise(&key, ResyncReason::SequenceGap { seq, current });
                        return;
                    }
                    Err(BookUpdateError::Crossed { bid, ask }) => {
                        self.crossed.fetch_add(1, Ordering::Relaxed);
                        warn!(%key, %bid, %ask, "book inconsistency: crossed after merge");
                        drop(books);
                        self.raise(&key, ResyncReason::CrossedBook);
                        // The merge was applied; still dispatch so
                        // consumers see the same view we hold.
                    }
                }
            }
            _ => {}
        }
        self.dispatch(&key, message);
    }

    fn raise(&self, key: &BookKey, reason: ResyncReason) {
        for registration in self.subscribers.read().iter() {
            if registration.key == *key {
                registration.queue.subscriber.on_error(key, &reason);
            }
        }
        let _ = self.resync_tx.send(ResyncRequest {
            key: key.clone(),
            reason,
        });
    }

    fn dispatch(&self, key: &BookKey, message: NormalizedMessage) {
        let subscribers = self.subscribers.read();
        for registration in subscribers.iter() {
            if registration.key == *key {
                registration.queue.push(message.clone());
            }
        }
    }

    /// Register a subscriber for one key. Messages are delivered in
    /// registration order across subscribers and FIFO per subscriber.
    pub fn subscribe(&self, key: BookKey, subscriber: Arc<dyn Subscriber>) {
        let queue = Arc::new(SubscriberQueue {
            subscriber,
            queue: Mutex::new(VecDeque::with_capacity(self.queue_capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            capacity: self.queue_capacity,
        });
        tokio::spawn(queue.clone().drain_loop());
        self.subscribers.write().push(Registration { key, queue });
    }

    /// Remove every registration for `subscriber_id` on `key`.
    pub fn unsubscribe(&self, key: &BookKey, subscriber_id: &str) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|registration| {
            let matches = registration.key == *key
                && registration.queue.subscriber.id() == subscriber_id;
            if matches {
                registration.queue.close();
            }
            !matches
        });
    }

    /// Immutable copy for readers that cannot subscribe.
    #[must_use]
    pub fn snapshot(&self, key: &BookKey) -> Option<OrderBook> {
        self.books.read().get(key).cloned()
    }

    /// Drop a book once no task needs its pair any more.
    pub fn remove(&self, key: &BookKey) {
        self.books.write().remove(key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.books.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.books.read().is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> BookStoreStats {
        let dropped_messages = self
            .subscribers
            .read()
            .iter()
            .map(|registration| registration.queue.dropped.load(Ordering::Relaxed))
            .sum();
        BookStoreStats {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            crossed: self.crossed.load(Ordering::Relaxed),
            dropped_messages,
        }
    }

    /// Per-subscriber drop counter, for telemetry and tests.
    #[must_use]
    pub fn dropped_for(&self, subscriber_id: &str) -> u64 {
        self.subscribers
            .read()
            .iter()
            .filter(|registration| registration.queue.subscriber.id() == subscriber_id)
            .map(|registration| registration.queue.dropped.load(Ordering::Relaxed))
            .sum()
    }
}
