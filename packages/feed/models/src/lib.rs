#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Core data model for the feeds import pipeline.
//!
//! A [`feed_type::FeedType`] is the reusable configuration (which fetcher,
//! parser, and processor to use, plus custom sources and mappings). A
//! [`Feed`] is one concrete import job bound to a feed type and a source
//! locator. Every pipeline [`Stage`] keeps a persisted [`state::State`] per
//! feed so imports can be split into small resumable tasks.

pub mod entity;
pub mod feed_type;
pub mod fetched;
pub mod item;
pub mod lock;
pub mod state;
pub mod task;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Identifier of a [`Feed`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FeedId(pub u64);

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an imported target entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stage of the import pipeline.
///
/// Stages run strictly in declaration order within one import, except that
/// `Parse` may repeat (batched parsing) and `Fetch` may repeat (fetchers
/// that yield several resources, such as a directory).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    /// Lock acquired, previous run state reset.
    Begin,
    /// The fetcher retrieves raw content.
    Fetch,
    /// The parser turns fetched content into items.
    Parse,
    /// The processor upserts one batch of items.
    Process,
    /// Stale entities from previous imports are cleaned.
    Clean,
    /// Entities past the retention window are deleted.
    Expire,
    /// Bookkeeping and lock release.
    Finish,
}

impl Stage {
    /// Stages that keep a persisted [`state::State`].
    pub const STATEFUL: [Self; 5] = [
        Self::Fetch,
        Self::Parse,
        Self::Process,
        Self::Clean,
        Self::Expire,
    ];
}

/// A concrete import job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    /// Unique feed identifier.
    pub id: FeedId,
    /// Id of the [`feed_type::FeedType`] this feed instantiates.
    pub feed_type: String,
    /// Human-readable label.
    pub label: String,
    /// Source locator: URL, file path, or directory, depending on the
    /// fetcher.
    pub source: String,
    /// Owner of the feed, stamped on nothing by default but available to
    /// mappings as `feed:owner`.
    #[serde(default)]
    pub owner: Option<String>,
    /// Inactive feeds are never picked up by the scheduler.
    #[serde(default = "default_active")]
    pub active: bool,
    /// When the feed was created.
    pub created: DateTime<Utc>,
    /// When the last import finished.
    #[serde(default)]
    pub imported: Option<DateTime<Utc>>,
    /// When the scheduler should import this feed next.
    #[serde(default)]
    pub next_import: Option<DateTime<Utc>>,
    /// Number of entities currently attributed to this feed.
    #[serde(default)]
    pub item_count: u64,
    /// Per-feed plugin overrides (for example extra request headers).
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

const fn default_active() -> bool {
    true
}

impl Feed {
    /// Returns the name of this feed's import lock.
    #[must_use]
    pub fn lock_name(&self) -> String {
        lock::feed_lock_name(self.id)
    }
}

/// The fields needed to create a new [`Feed`]; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFeed {
    /// Id of the feed type.
    pub feed_type: String,
    /// Human-readable label.
    pub label: String,
    /// Source locator.
    pub source: String,
    /// Optional owner.
    pub owner: Option<String>,
    /// Per-feed plugin overrides.
    pub config: BTreeMap<String, serde_json::Value>,
}

impl NewFeed {
    /// Creates a draft feed with no owner and no overrides.
    #[must_use]
    pub fn new(feed_type: &str, label: &str, source: &str) -> Self {
        Self {
            feed_type: feed_type.to_owned(),
            label: label.to_owned(),
            source: source.to_owned(),
            owner: None,
            config: BTreeMap::new(),
        }
    }

    /// Turns the draft into a [`Feed`] with the given id and creation time.
    #[must_use]
    pub fn into_feed(self, id: FeedId, created: DateTime<Utc>) -> Feed {
        Feed {
            id,
            feed_type: self.feed_type,
            label: self.label,
            source: self.source,
            owner: self.owner,
            active: true,
            created,
            imported: None,
            next_import: None,
            item_count: 0,
            config: self.config,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use super::*;

    #[test]
    fn stage_names_round_trip_through_strum() {
        assert_eq!(Stage::Process.to_string(), "process");
        assert_eq!(Stage::from_str("clean").unwrap(), Stage::Clean);
        assert!(Stage::from_str("cleaning").is_err());
    }

    #[test]
    fn stages_are_ordered_by_pipeline_position() {
        assert!(Stage::Fetch < Stage::Parse);
        assert!(Stage::Process < Stage::Clean);
        assert!(Stage::Expire < Stage::Finish);
    }

    #[test]
    fn new_feed_becomes_active_feed() {
        let created = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let feed = NewFeed::new("articles", "Articles", "https://example.com/a.csv")
            .into_feed(FeedId(7), created);
        assert!(feed.active);
        assert_eq!(feed.lock_name(), "feeds_feed:7");
        assert_eq!(feed.item_count, 0);
    }
}
