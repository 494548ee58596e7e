//! Persisted lock records.

use serde::{Deserialize, Serialize};

use crate::FeedId;

const FEED_LOCK_PREFIX: &str = "feeds_feed:";

/// A named lock as stored by a lock store.
///
/// Times are seconds since the Unix epoch with sub-second precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Lock name (e.g. `"feeds_feed:12"`).
    pub name: String,
    /// When the lock expires unless extended.
    pub expire: f64,
    /// Opaque token of the holder.
    pub value: String,
    /// When the lock was first acquired; extensions do not change it.
    pub acquired: f64,
}

/// Returns the lock name for a feed's import.
#[must_use]
pub fn feed_lock_name(feed_id: FeedId) -> String {
    format!("{FEED_LOCK_PREFIX}{feed_id}")
}

/// Extracts the feed id from a feed lock name.
#[must_use]
pub fn feed_id_from_lock_name(name: &str) -> Option<FeedId> {
    name.strip_prefix(FEED_LOCK_PREFIX)?
        .parse()
        .ok()
        .map(FeedId)
}
