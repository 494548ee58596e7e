#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Persistence for the feeds import pipeline.
//!
//! Every concern the pipeline persists has its own trait: feeds, per-stage
//! states, clean lists, named locks, the task queue, cached HTTP headers,
//! and target entities. [`memory::MemoryStore`] implements all of them in
//! process; with the `duckdb` feature, [`duckdb::DuckDbStore`] implements
//! them on a single `DuckDB` file.
//!
//! Each trait method is a single atomic operation. Operations that must
//! not race (lock insertion, conditional lock deletion, task claiming)
//! are expressed as one call so a backend can make them atomic.

#[cfg(feature = "duckdb")]
pub mod duckdb;
pub mod memory;
pub mod paths;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use feeds_feed_models::entity::Entity;
use feeds_feed_models::lock::LockRecord;
use feeds_feed_models::state::State;
use feeds_feed_models::task::{QueueTask, TaskId};
use feeds_feed_models::{EntityId, Feed, FeedId, NewFeed, Stage};
use serde::{Deserialize, Serialize};

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `DuckDB` error.
    #[cfg(feature = "duckdb")]
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] ::duckdb::Error),

    /// Stored JSON could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error while preparing the store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A referenced record does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record kind (e.g. `"feed"`).
        kind: &'static str,
        /// Record id.
        id: String,
    },

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}

/// Feed records.
pub trait FeedStore: Send + Sync {
    /// Creates a feed, assigning the next id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the feed cannot be stored.
    fn create_feed(&self, draft: NewFeed, created: DateTime<Utc>) -> Result<Feed, DbError>;

    /// Loads a feed by id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    fn load_feed(&self, id: FeedId) -> Result<Option<Feed>, DbError>;

    /// Overwrites an existing feed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if the feed does not exist.
    fn update_feed(&self, feed: &Feed) -> Result<(), DbError>;

    /// Deletes a feed. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the delete fails.
    fn delete_feed(&self, id: FeedId) -> Result<bool, DbError>;

    /// Lists all feeds ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the listing fails.
    fn list_feeds(&self) -> Result<Vec<Feed>, DbError>;
}

/// Per-feed, per-stage progress records.
pub trait StateStore: Send + Sync {
    /// Loads the state of one stage.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    fn load_state(&self, feed_id: FeedId, stage: Stage) -> Result<Option<State>, DbError>;

    /// Saves the state of one stage.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    fn save_state(&self, feed_id: FeedId, stage: Stage, state: &State) -> Result<(), DbError>;

    /// Removes every stage state of a feed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the delete fails.
    fn clear_states(&self, feed_id: FeedId) -> Result<(), DbError>;

    /// Returns the most recent progress time recorded by any stage.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if a state cannot be loaded.
    fn last_progress(&self, feed_id: FeedId) -> Result<Option<DateTime<Utc>>, DbError> {
        let mut latest = None;
        for stage in Stage::STATEFUL {
            if let Some(updated) = self
                .load_state(feed_id, stage)?
                .and_then(|state| state.updated)
            {
                latest = latest.max(Some(updated));
            }
        }
        Ok(latest)
    }
}

/// The ordered set of previously imported entity ids that have not been
/// seen in the current import.
pub trait CleanListStore: Send + Sync {
    /// Replaces a feed's clean list.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    fn set_clean_list(&self, feed_id: FeedId, ids: &[EntityId]) -> Result<(), DbError>;

    /// Removes one id. Returns `false` if it was not on the list.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the delete fails.
    fn remove_from_clean_list(&self, feed_id: FeedId, id: EntityId) -> Result<bool, DbError>;

    /// Returns up to `limit` ids from the front of the list without
    /// removing them.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    fn clean_list_head(&self, feed_id: FeedId, limit: usize) -> Result<Vec<EntityId>, DbError>;

    /// Returns the number of ids on the list.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the count fails.
    fn clean_list_len(&self, feed_id: FeedId) -> Result<u64, DbError>;

    /// Empties a feed's clean list.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the delete fails.
    fn clear_clean_list(&self, feed_id: FeedId) -> Result<(), DbError>;
}

/// Condition under which [`LockStore::delete_lock`] removes a record.
#[derive(Debug, Clone, PartialEq)]
pub enum LockGuard {
    /// Remove unconditionally.
    Any,
    /// Remove only if held by this token.
    Value(String),
    /// Remove only if the stored expiry still equals this value, so a
    /// concurrent extension wins over a stale delete.
    Expire(f64),
}

/// Named lock records.
pub trait LockStore: Send + Sync {
    /// Inserts a lock record. Returns `false` without writing if a record
    /// with the same name already exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the insert fails for another reason.
    fn insert_lock(&self, record: &LockRecord) -> Result<bool, DbError>;

    /// Loads a lock record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    fn load_lock(&self, name: &str) -> Result<Option<LockRecord>, DbError>;

    /// Moves the expiry of a lock held by `value`. Returns `false` if the
    /// lock is missing or held by someone else.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the update fails.
    fn extend_lock(&self, name: &str, value: &str, expire: f64) -> Result<bool, DbError>;

    /// Deletes a lock if `guard` holds. Returns `true` if a record was
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the delete fails.
    fn delete_lock(&self, name: &str, guard: &LockGuard) -> Result<bool, DbError>;
}

/// A task taken off the queue together with its id.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    /// Queue id; pass it back to [`TaskQueue::complete_task`] or
    /// [`TaskQueue::release_task`].
    pub id: TaskId,
    /// The task.
    pub task: QueueTask,
}

/// FIFO queue of stage tasks.
///
/// Claimed tasks stay in the queue (and count towards
/// [`TaskQueue::count_tasks`]) until completed. A claim older than the
/// lease passed to the claim methods is considered abandoned and the
/// task becomes claimable again.
pub trait TaskQueue: Send + Sync {
    /// Appends a task.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the insert fails.
    fn push_task(&self, task: &QueueTask) -> Result<TaskId, DbError>;

    /// Claims the oldest available task of any feed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the claim fails.
    fn claim_task(&self, now: DateTime<Utc>, lease: Duration)
    -> Result<Option<ClaimedTask>, DbError>;

    /// Claims the oldest available task of one feed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the claim fails.
    fn claim_task_for_feed(
        &self,
        feed_id: FeedId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, DbError>;

    /// Removes a finished task.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the delete fails.
    fn complete_task(&self, id: TaskId) -> Result<(), DbError>;

    /// Stores `task` under `id` and makes it claimable again, keeping its
    /// queue position.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the update fails.
    fn release_task(&self, id: TaskId, task: &QueueTask) -> Result<(), DbError>;

    /// Returns the number of queued or claimed tasks of a feed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the count fails.
    fn count_tasks(&self, feed_id: FeedId) -> Result<u64, DbError>;

    /// Removes every task of a feed. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the delete fails.
    fn purge_tasks(&self, feed_id: FeedId) -> Result<u64, DbError>;
}

/// Validators returned by a remote server for a fetched URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedHeaders {
    /// `ETag` response header.
    pub etag: Option<String>,
    /// `Last-Modified` response header.
    pub last_modified: Option<String>,
}

impl CachedHeaders {
    /// Returns `true` if neither validator is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// HTTP validator cache used for conditional requests.
pub trait HeaderCache: Send + Sync {
    /// Loads the validators stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    fn load_headers(&self, key: &str) -> Result<Option<CachedHeaders>, DbError>;

    /// Stores validators under `key`, owned by `feed_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    fn save_headers(
        &self,
        key: &str,
        feed_id: FeedId,
        headers: &CachedHeaders,
    ) -> Result<(), DbError>;

    /// Removes every entry owned by a feed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the delete fails.
    fn delete_headers_for_feed(&self, feed_id: FeedId) -> Result<(), DbError>;
}

/// The target entity collection written by the processor.
pub trait EntityStore: Send + Sync {
    /// Saves an entity, assigning an id on first save. Returns the id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    fn save_entity(&self, entity: &Entity) -> Result<EntityId, DbError>;

    /// Loads an entity.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    fn load_entity(&self, id: EntityId) -> Result<Option<Entity>, DbError>;

    /// Deletes an entity. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the delete fails.
    fn delete_entity(&self, id: EntityId) -> Result<bool, DbError>;

    /// Returns the lowest id of an entity of `entity_type` (and
    /// `langcode`, when given) whose `field` equals `value`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    fn find_entity_by_field(
        &self,
        entity_type: &str,
        langcode: Option<&str>,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<Option<EntityId>, DbError>;

    /// Returns the ids of entities last imported by a feed, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    fn entity_ids_for_feed(&self, feed_id: FeedId) -> Result<Vec<EntityId>, DbError>;

    /// Returns the ids of a feed's entities last imported before `cutoff`,
    /// ascending.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    fn entity_ids_imported_before(
        &self,
        feed_id: FeedId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EntityId>, DbError>;

    /// Returns the number of entities last imported by a feed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the count fails.
    fn count_entities_for_feed(&self, feed_id: FeedId) -> Result<u64, DbError> {
        Ok(self.entity_ids_for_feed(feed_id)?.len() as u64)
    }
}

/// One object implementing every store concern.
pub trait Store:
    FeedStore + StateStore + CleanListStore + LockStore + TaskQueue + HeaderCache + EntityStore
{
}

impl<T> Store for T where
    T: FeedStore + StateStore + CleanListStore + LockStore + TaskQueue + HeaderCache + EntityStore
{
}

/// Shared handles to every store concern.
///
/// Components hold only the handles they need; tests can swap one concern
/// without touching the others.
#[derive(Clone)]
pub struct Services {
    /// Feed records.
    pub feeds: Arc<dyn FeedStore>,
    /// Stage states.
    pub states: Arc<dyn StateStore>,
    /// Clean lists.
    pub clean_lists: Arc<dyn CleanListStore>,
    /// Named locks.
    pub locks: Arc<dyn LockStore>,
    /// Task queue.
    pub queue: Arc<dyn TaskQueue>,
    /// HTTP validator cache.
    pub headers: Arc<dyn HeaderCache>,
    /// Target entities.
    pub entities: Arc<dyn EntityStore>,
}

impl Services {
    /// Builds every handle from one store.
    #[must_use]
    pub fn from_store<S: Store + 'static>(store: Arc<S>) -> Self {
        Self {
            feeds: store.clone(),
            states: store.clone(),
            clean_lists: store.clone(),
            locks: store.clone(),
            queue: store.clone(),
            headers: store.clone(),
            entities: store,
        }
    }

    /// Builds handles backed by a fresh [`memory::MemoryStore`].
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_store(Arc::new(memory::MemoryStore::new()))
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

/// Returns `true` if a claim made at `claimed_at` is still within `lease`.
pub(crate) fn claim_is_live(
    claimed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lease: Duration,
) -> bool {
    claimed_at.is_some_and(|at| now - at < lease)
}
