//! Subscription reconciliation: diff consecutive snapshots and drive
//! the pool.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arbor_core::{BookDepth, MarketKind, Pair, Subscription, VenueId};
use arbor_stream::SessionPool;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::TaskSnapshot;

type DesiredKey = (VenueId, MarketKind, Pair);

/// Trade tasks that do not co-specify a monitor depth ride this one.
const TRADE_DEFAULT_DEPTH: BookDepth = BookDepth::Fifty;

/// Changes to apply for one reconciliation round. Removes are issued
/// before subscribes so a depth change lands as unsubscribe+subscribe.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubscriptionDiff {
    pub unsubscribe: Vec<Subscription>,
    pub subscribe: Vec<Subscription>,
}

impl SubscriptionDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

/// Owns the previous desired state and turns each new snapshot into a
/// deterministic diff. Reapplying an unchanged snapshot yields an empty
/// diff.
pub struct SubscriptionController {
    pool: Arc<SessionPool>,
    desired: Mutex<BTreeMap<DesiredKey, BookDepth>>,
}

impl SubscriptionController {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self {
            pool,
            desired: Mutex::new(BTreeMap::new()),
        }
    }

    /// Merge a snapshot against the held state and return the diff,
    /// updating the held state.
    pub fn merge(&self, snapshot: &TaskSnapshot) -> SubscriptionDiff {
        let next = desired_from_snapshot(snapshot);
        let mut desired = self.desired.lock();
        let diff = compute_diff(&desired, &next);
        *desired = next;
        diff
    }

    /// Push a diff through the pool: removes first, then adds grouped
    /// by depth.
    pub fn apply(&self, diff: &SubscriptionDiff) {
        if diff.is_empty() {
            return;
        }
        for entry in &diff.unsubscribe {
            let pairs: Vec<Pair> = entry.pairs.iter().cloned().collect();
            self.pool.unsubscribe(entry.venue, entry.market, &pairs);
        }
        for entry in &diff.subscribe {
            let pairs: Vec<Pair> = entry.pairs.iter().cloned().collect();
            self.pool
                .subscribe(entry.venue, entry.market, &pairs, entry.depth);
        }
        info!(
            subscribed = diff.subscribe.iter().map(|s| s.pairs.len()).sum::<usize>(),
            unsubscribed = diff.unsubscribe.iter().map(|s| s.pairs.len()).sum::<usize>(),
            "applied subscription diff"
        );
    }

    /// Currently desired pair count, for status reporting.
    #[must_use]
    pub fn desired_pairs(&self) -> usize {
        self.desired.lock().len()
    }
}

/// Collapse monitor and trade tasks into the per-pair desired depth.
/// When both roles want the same pair the larger depth wins, so the
/// strategy consumer always sees a superset of what it asked for.
fn desired_from_snapshot(snapshot: &TaskSnapshot) -> BTreeMap<DesiredKey, BookDepth> {
    let mut desired: BTreeMap<DesiredKey, BookDepth> = BTreeMap::new();
    for task in &snapshot.monitor_tasks {
        let key = (task.venue, task.market, task.pair.clone());
        desired
            .entry(key)
            .and_modify(|depth| *depth = (*depth).max(task.depth))
            .or_insert(task.depth);
    }
    for task in &snapshot.trade_tasks {
        let key = (task.venue, task.market, task.pair.clone());
        desired
            .entry(key)
            .and_modify(|depth| *depth = (*depth).max(TRADE_DEFAULT_DEPTH))
            .or_insert(TRADE_DEFAULT_DEPTH);
    }
    desired
}

fn compute_diff(
    previous: &BTreeMap<DesiredKey, BookDepth>,
    next: &BTreeMap<DesiredKey, BookDepth>,
) -> SubscriptionDiff {
    // Grouping keys are ordered, so the diff is deterministic for
    // identical inputs.
    let mut subscribe: BTreeMap<(VenueId, MarketKind, BookDepth), BTreeSet<Pair>> = BTreeMap::new();
    let mut unsubscribe: BTreeMap<(VenueId, MarketKind), BTreeSet<Pair>> = BTreeMap::new();

    for ((venue, market, pair), depth) in next {
        match previous.get(&(*venue, *market, pair.clone())) {
            Some(existing) if existing == depth => {}
            Some(_) => {
                // Depth change: remove then re-add at the new depth.
                unsubscribe
                    .entry((*venue, *market))
                    .or_default()
                    .insert(pair.clone());
                subscribe
                    .entry((*venue, *market, *depth))
                    .or_default()
                    .insert(pair.clone());
            }
            None => {
                subscribe
                    .entry((*venue, *market, *depth))
                    .or_default()
                    .insert(pair.clone());
            }
        }
    }
    for ((venue, market, pair), _) in previous {
        if !next.contains_key(&(*venue, *market, pair.clone())) {
            unsubscribe
                .entry((*venue, *market))
                .or_default()
                .insert(pair.clone());
        }
    }

    let diff = SubscriptionDiff {
        unsubscribe: unsubscribe
            .into_iter()
            .map(|((venue, market), pairs)| Subscription {
                venue,
                market,
                pairs,
                depth: BookDepth::Twenty,
            })
            .collect(),
        subscribe: subscribe
            .into_iter()
            .map(|((venue, market, depth), pairs)| Subscription {
                venue,
                market,
                pairs,
                depth,
            })
            .collect(),
    };
    if !diff.is_empty() {
        debug!(
            adds = diff.subscribe.len(),
            removes = diff.unsubscribe.len(),
            "computed subscription diff"
        );
    }
    diff
}
