//! Desired-state plane: periodic task polling and the subscription
//! controller that reconciles the pool against it.
//!
//! The worker's reconcile loop ties the two together: poll the catalog
//! through [`TaskFetcher`], hand the snapshot to
//! [`SubscriptionController::merge`], and apply the resulting diff. A
//! failed poll keeps the previous snapshot live so subscriptions never
//! flap on catalog hiccups.

mod controller;
mod fetcher;

pub use controller::{SubscriptionController, SubscriptionDiff};
pub use fetcher::{TaskFetcher, TaskSnapshot, DEFAULT_POLL_INTERVAL};
