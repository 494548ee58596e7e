#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Processor plugins: turning items into target entities.
//!
//! A [`Processor`] upserts one item at a time, reports which previously
//! imported entities are candidates for the clean stage, applies the
//! configured clean action to one stale entity at a time, and lists and
//! deletes expired entities. The durable clean list itself is owned by the
//! pipeline; processors only decide what goes into it and what happens to
//! each entry.

pub mod clean;
pub mod entity;
pub mod mapping;

use chrono::{DateTime, Utc};
use feeds_database::DbError;
use feeds_database::EntityStore;
use feeds_feed_models::entity::Entity;
use feeds_feed_models::item::Item;
use feeds_feed_models::state::State;
use feeds_feed_models::{EntityId, Feed};

/// Errors that can occur while processing items.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The entity store failed.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Serializing mapped values failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Processor settings are invalid.
    #[error("Invalid processor settings: {message}")]
    InvalidSettings {
        /// Description of what went wrong.
        message: String,
    },

    /// A custom clean plugin failed on one entity.
    #[error("Clean plugin {plugin} failed: {message}")]
    Clean {
        /// Clean plugin id.
        plugin: String,
        /// Description of what went wrong.
        message: String,
    },
}

/// What happened to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// No match and new items are not inserted.
    SkippedNew,
    /// No match; a new entity was created.
    Created(EntityId),
    /// A match exists and existing entities are not updated.
    SkippedExisting(EntityId),
    /// A match exists and its stored hash equals the item's hash.
    Unchanged(EntityId),
    /// A match exists and was replaced or updated.
    Updated(EntityId),
}

impl ItemOutcome {
    /// Returns the matched or created entity, if any.
    #[must_use]
    pub const fn entity_id(self) -> Option<EntityId> {
        match self {
            Self::SkippedNew => None,
            Self::Created(id)
            | Self::SkippedExisting(id)
            | Self::Unchanged(id)
            | Self::Updated(id) => Some(id),
        }
    }

    /// Returns `true` if the item matched an entity that existed before
    /// it was processed.
    #[must_use]
    pub const fn matched_existing(self) -> bool {
        matches!(
            self,
            Self::SkippedExisting(_) | Self::Unchanged(_) | Self::Updated(_)
        )
    }

    /// Adds this outcome to the stage counters.
    pub const fn count(self, state: &mut State) {
        let counters = &mut state.counters;
        match self {
            Self::SkippedNew | Self::SkippedExisting(_) => counters.skipped += 1,
            Self::Created(_) => counters.created += 1,
            Self::Unchanged(_) => counters.unchanged += 1,
            Self::Updated(_) => counters.updated += 1,
        }
    }
}

/// A user-defined clean action, selected with `custom:<id>`.
pub trait CleanPlugin: Send + Sync {
    /// Returns the plugin id.
    fn id(&self) -> &'static str;

    /// Applies the action to one stale entity and persists the result.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if the action cannot be applied. The
    /// pipeline logs it and moves on to the next entity.
    fn clean(&self, entities: &dyn EntityStore, entity: Entity) -> Result<(), ProcessError>;
}

/// Writes items into a target collection.
pub trait Processor: Send + Sync {
    /// Returns the registry id of this processor (e.g. `"entity"`).
    fn id(&self) -> &'static str;

    /// Creates, updates, or skips the entity for one item and advances
    /// the stage progress by one.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if the target store fails.
    fn process(&self, feed: &Feed, item: &Item, state: &mut State)
    -> Result<ItemOutcome, ProcessError>;

    /// Called once the whole import has been processed. Returns the
    /// number of entities the feed now owns.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if the target store fails.
    fn post_process(&self, feed: &Feed, state: &State) -> Result<u64, ProcessError>;

    /// Returns the entities previously imported by `feed` that become
    /// stale unless an item matches them, or `None` if stale entities
    /// are kept.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if the target store fails.
    fn clean_candidates(&self, feed: &Feed) -> Result<Option<Vec<EntityId>>, ProcessError>;

    /// Applies the clean action to one stale entity. An entity that no
    /// longer exists is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if the action fails.
    fn clean(&self, feed: &Feed, id: EntityId, state: &mut State) -> Result<(), ProcessError>;

    /// Returns the entities of `feed` imported before the retention
    /// cutoff, or `None` if entities never expire.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if the target store fails.
    fn expired_ids(
        &self,
        feed: &Feed,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<EntityId>>, ProcessError>;

    /// Deletes one expired entity.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if the target store fails.
    fn expire_item(&self, feed: &Feed, id: EntityId, state: &mut State)
    -> Result<(), ProcessError>;
}
