//! The Monitor role's book subscriber: turns normalized messages into
//! columnar rows and keeps a per-pair ring of recent updates.

use std::collections::HashMap;

use parking_lot::Mutex;
use rust_decimal::Decimal;

use arbor_book::Subscriber;
use arbor_core::{BookKey, MessagePayload, NormalizedMessage, PriceLevel, Side};

use crate::encoding::{DeltaRow, LevelAction, SnapshotRow};
use crate::ring::Ring;
use crate::sink::SinkHandle;

pub struct BookRecorder {
    id: String,
    sink: SinkHandle,
    ring_capacity: usize,
    rings: Mutex<HashMap<BookKey, Ring<NormalizedMessage>>>,
}

impl BookRecorder {
    pub fn new(id: impl Into<String>, sink: SinkHandle, ring_capacity: usize) -> Self {
        Self {
            id: id.into(),
            sink,
            ring_capacity,
            rings: Mutex::new(HashMap::new()),
        }
    }

    /// Recent messages for a pair, oldest first.
    #[must_use]
    pub fn recent(&self, key: &BookKey) -> Vec<NormalizedMessage> {
        self.rings
            .lock()
            .get(key)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the ring once the pair is no longer monitored.
    pub fn forget(&self, key: &BookKey) {
        self.rings.lock().remove(key);
    }

    fn record_levels(
        &self,
        message: &NormalizedMessage,
        side: Side,
        levels: &[PriceLevel],
    ) {
        for level in levels {
            let action = if level.amount <= Decimal::ZERO {
                LevelAction::Delete
            } else {
                LevelAction::Update
            };
            self.sink.record_delta(DeltaRow {
                timestamp_ms: message.header.timestamp_ms,
                venue: message.header.venue,
                market: message.header.market,
                pair: message.header.pair.clone(),
                side,
                price: level.price,
                amount: level.amount,
                action,
            });
        }
    }
}

impl Subscriber for BookRecorder {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_message(&self, message: NormalizedMessage) {
        match &message.payload {
            MessagePayload::BookDelta { bids, asks, .. } => {
                self.record_levels(&message, Side::Buy, bids);
                self.record_levels(&message, Side::Sell, asks);
            }
            MessagePayload::BookSnapshot { bids, asks } => {
                self.sink.record_snapshot(SnapshotRow {
                    timestamp_ms: message.header.timestamp_ms,
                    venue: message.header.venue,
                    market: message.header.market,
                    pair: message.header.pair.clone(),
                    bids: bids.clone(),
                    asks: asks.clone(),
                    seq: message.header.venue_seq,
                });
            }
            // Trades and private updates are not part of the analytics
            // feed.
            _ => return,
        }
        let key = message.header.book_key();
        let mut rings = self.rings.lock();
        rings
            .entry(key)
            .or_insert_with(|| Ring::new(self.ring_capacity))
            .push(message);
    }
}
