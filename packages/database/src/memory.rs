//! In-process store.
//!
//! All data lives behind one mutex, so every trait method is atomic with
//! respect to every other. Used by tests and by the CLI when no database
//! file is configured.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use feeds_feed_models::entity::Entity;
use feeds_feed_models::lock::LockRecord;
use feeds_feed_models::state::State;
use feeds_feed_models::task::{QueueTask, TaskId};
use feeds_feed_models::{EntityId, Feed, FeedId, NewFeed, Stage};

use crate::{
    CachedHeaders, ClaimedTask, CleanListStore, DbError, EntityStore, FeedStore, HeaderCache,
    LockGuard, LockStore, StateStore, TaskQueue, claim_is_live,
};

#[derive(Debug)]
struct QueuedTask {
    task: QueueTask,
    claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    feeds: BTreeMap<FeedId, Feed>,
    next_feed: u64,
    states: BTreeMap<(FeedId, Stage), State>,
    clean_lists: BTreeMap<FeedId, Vec<EntityId>>,
    locks: BTreeMap<String, LockRecord>,
    tasks: BTreeMap<TaskId, QueuedTask>,
    next_task: u64,
    headers: BTreeMap<String, (FeedId, CachedHeaders)>,
    entities: BTreeMap<EntityId, Entity>,
    next_entity: u64,
}

impl Inner {
    fn claim(
        &mut self,
        feed_id: Option<FeedId>,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Option<ClaimedTask> {
        let (id, queued) = self.tasks.iter_mut().find(|(_, queued)| {
            feed_id.is_none_or(|f| queued.task.feed_id == f)
                && !claim_is_live(queued.claimed_at, now, lease)
        })?;
        queued.claimed_at = Some(now);
        Some(ClaimedTask {
            id: *id,
            task: queued.task.clone(),
        })
    }
}

/// A store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FeedStore for MemoryStore {
    fn create_feed(&self, draft: NewFeed, created: DateTime<Utc>) -> Result<Feed, DbError> {
        let mut inner = self.lock();
        inner.next_feed += 1;
        let feed = draft.into_feed(FeedId(inner.next_feed), created);
        inner.feeds.insert(feed.id, feed.clone());
        Ok(feed)
    }

    fn load_feed(&self, id: FeedId) -> Result<Option<Feed>, DbError> {
        Ok(self.lock().feeds.get(&id).cloned())
    }

    fn update_feed(&self, feed: &Feed) -> Result<(), DbError> {
        let mut inner = self.lock();
        let slot = inner.feeds.get_mut(&feed.id).ok_or_else(|| DbError::NotFound {
            kind: "feed",
            id: feed.id.to_string(),
        })?;
        *slot = feed.clone();
        Ok(())
    }

    fn delete_feed(&self, id: FeedId) -> Result<bool, DbError> {
        Ok(self.lock().feeds.remove(&id).is_some())
    }

    fn list_feeds(&self) -> Result<Vec<Feed>, DbError> {
        Ok(self.lock().feeds.values().cloned().collect())
    }
}

impl StateStore for MemoryStore {
    fn load_state(&self, feed_id: FeedId, stage: Stage) -> Result<Option<State>, DbError> {
        Ok(self.lock().states.get(&(feed_id, stage)).cloned())
    }

    fn save_state(&self, feed_id: FeedId, stage: Stage, state: &State) -> Result<(), DbError> {
        self.lock().states.insert((feed_id, stage), state.clone());
        Ok(())
    }

    fn clear_states(&self, feed_id: FeedId) -> Result<(), DbError> {
        self.lock().states.retain(|(f, _), _| *f != feed_id);
        Ok(())
    }
}

impl CleanListStore for MemoryStore {
    fn set_clean_list(&self, feed_id: FeedId, ids: &[EntityId]) -> Result<(), DbError> {
        let mut list = ids.to_vec();
        list.dedup();
        self.lock().clean_lists.insert(feed_id, list);
        Ok(())
    }

    fn remove_from_clean_list(&self, feed_id: FeedId, id: EntityId) -> Result<bool, DbError> {
        let mut inner = self.lock();
        let Some(list) = inner.clean_lists.get_mut(&feed_id) else {
            return Ok(false);
        };
        let Some(position) = list.iter().position(|x| *x == id) else {
            return Ok(false);
        };
        list.remove(position);
        Ok(true)
    }

    fn clean_list_head(&self, feed_id: FeedId, limit: usize) -> Result<Vec<EntityId>, DbError> {
        Ok(self
            .lock()
            .clean_lists
            .get(&feed_id)
            .map(|list| list.iter().take(limit).copied().collect())
            .unwrap_or_default())
    }

    fn clean_list_len(&self, feed_id: FeedId) -> Result<u64, DbError> {
        Ok(self
            .lock()
            .clean_lists
            .get(&feed_id)
            .map_or(0, |list| list.len() as u64))
    }

    fn clear_clean_list(&self, feed_id: FeedId) -> Result<(), DbError> {
        self.lock().clean_lists.remove(&feed_id);
        Ok(())
    }
}

impl LockStore for MemoryStore {
    fn insert_lock(&self, record: &LockRecord) -> Result<bool, DbError> {
        let mut inner = self.lock();
        if inner.locks.contains_key(&record.name) {
            return Ok(false);
        }
        inner.locks.insert(record.name.clone(), record.clone());
        Ok(true)
    }

    fn load_lock(&self, name: &str) -> Result<Option<LockRecord>, DbError> {
        Ok(self.lock().locks.get(name).cloned())
    }

    fn extend_lock(&self, name: &str, value: &str, expire: f64) -> Result<bool, DbError> {
        let mut inner = self.lock();
        match inner.locks.get_mut(name) {
            Some(record) if record.value == value => {
                record.expire = expire;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    #[allow(clippy::float_cmp)]
    fn delete_lock(&self, name: &str, guard: &LockGuard) -> Result<bool, DbError> {
        let mut inner = self.lock();
        let matches = inner.locks.get(name).is_some_and(|record| match guard {
            LockGuard::Any => true,
            LockGuard::Value(value) => record.value == *value,
            LockGuard::Expire(expire) => record.expire == *expire,
        });
        if matches {
            inner.locks.remove(name);
        }
        Ok(matches)
    }
}

impl TaskQueue for MemoryStore {
    fn push_task(&self, task: &QueueTask) -> Result<TaskId, DbError> {
        let mut inner = self.lock();
        inner.next_task += 1;
        let id = TaskId(inner.next_task);
        inner.tasks.insert(
            id,
            QueuedTask {
                task: task.clone(),
                claimed_at: None,
            },
        );
        Ok(id)
    }

    fn claim_task(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, DbError> {
        Ok(self.lock().claim(None, now, lease))
    }

    fn claim_task_for_feed(
        &self,
        feed_id: FeedId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, DbError> {
        Ok(self.lock().claim(Some(feed_id), now, lease))
    }

    fn complete_task(&self, id: TaskId) -> Result<(), DbError> {
        self.lock().tasks.remove(&id);
        Ok(())
    }

    fn release_task(&self, id: TaskId, task: &QueueTask) -> Result<(), DbError> {
        let mut inner = self.lock();
        let queued = inner.tasks.get_mut(&id).ok_or_else(|| DbError::NotFound {
            kind: "task",
            id: id.0.to_string(),
        })?;
        queued.task = task.clone();
        queued.claimed_at = None;
        Ok(())
    }

    fn count_tasks(&self, feed_id: FeedId) -> Result<u64, DbError> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|queued| queued.task.feed_id == feed_id)
            .count() as u64)
    }

    fn purge_tasks(&self, feed_id: FeedId) -> Result<u64, DbError> {
        let mut inner = self.lock();
        let before = inner.tasks.len();
        inner.tasks.retain(|_, queued| queued.task.feed_id != feed_id);
        Ok((before - inner.tasks.len()) as u64)
    }
}

impl HeaderCache for MemoryStore {
    fn load_headers(&self, key: &str) -> Result<Option<CachedHeaders>, DbError> {
        Ok(self.lock().headers.get(key).map(|(_, h)| h.clone()))
    }

    fn save_headers(
        &self,
        key: &str,
        feed_id: FeedId,
        headers: &CachedHeaders,
    ) -> Result<(), DbError> {
        self.lock()
            .headers
            .insert(key.to_owned(), (feed_id, headers.clone()));
        Ok(())
    }

    fn delete_headers_for_feed(&self, feed_id: FeedId) -> Result<(), DbError> {
        self.lock().headers.retain(|_, (owner, _)| *owner != feed_id);
        Ok(())
    }
}

impl EntityStore for MemoryStore {
    fn save_entity(&self, entity: &Entity) -> Result<EntityId, DbError> {
        let mut inner = self.lock();
        let id = if let Some(id) = entity.id {
            id
        } else {
            inner.next_entity += 1;
            EntityId(inner.next_entity)
        };
        let mut stored = entity.clone();
        stored.id = Some(id);
        inner.entities.insert(id, stored);
        Ok(id)
    }

    fn load_entity(&self, id: EntityId) -> Result<Option<Entity>, DbError> {
        Ok(self.lock().entities.get(&id).cloned())
    }

    fn delete_entity(&self, id: EntityId) -> Result<bool, DbError> {
        Ok(self.lock().entities.remove(&id).is_some())
    }

    fn find_entity_by_field(
        &self,
        entity_type: &str,
        langcode: Option<&str>,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<Option<EntityId>, DbError> {
        Ok(self
            .lock()
            .entities
            .iter()
            .find(|(_, entity)| {
                entity.entity_type == entity_type
                    && langcode.is_none_or(|l| entity.langcode.as_deref() == Some(l))
                    && entity.fields.get(field) == Some(value)
            })
            .map(|(id, _)| *id))
    }

    fn entity_ids_for_feed(&self, feed_id: FeedId) -> Result<Vec<EntityId>, DbError> {
        Ok(self
            .lock()
            .entities
            .iter()
            .filter(|(_, entity)| {
                entity
                    .provenance
                    .as_ref()
                    .is_some_and(|p| p.feed_id == feed_id)
            })
            .map(|(id, _)| *id)
            .collect())
    }

    fn entity_ids_imported_before(
        &self,
        feed_id: FeedId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EntityId>, DbError> {
        Ok(self
            .lock()
            .entities
            .iter()
            .filter(|(_, entity)| {
                entity
                    .provenance
                    .as_ref()
                    .is_some_and(|p| p.feed_id == feed_id && p.imported < cutoff)
            })
            .map(|(id, _)| *id)
            .collect())
    }
}
