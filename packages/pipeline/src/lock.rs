//! Per-feed import lock.
//!
//! A lock row `{name, expire, value, acquired}` marks a feed as being
//! imported. Each [`FeedLock`] instance has its own random token, so two
//! workers never mistake each other's lock for their own.
//!
//! An expired lock is not simply taken over: while the feed still has
//! queued tasks or recorded progress within the progress window, the
//! import is considered alive and the lock is extended instead. A lock
//! older than the maximum lifetime is released regardless.

use std::sync::Arc;

use chrono::Duration;
use feeds_database::{DbError, LockGuard, LockStore, StateStore, TaskQueue};
use feeds_feed_models::lock::{LockRecord, feed_id_from_lock_name};
use feeds_time::Clock;

use crate::config::ExecutorSettings;

#[allow(clippy::cast_precision_loss)]
fn seconds(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

/// What to do with a lock found expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// The import is alive; keep the lock.
    Extend,
    /// Nothing is running; the lock can go.
    Release,
}

/// Acquires, extends, and releases feed locks.
#[derive(Clone)]
pub struct FeedLock {
    locks: Arc<dyn LockStore>,
    queue: Arc<dyn TaskQueue>,
    states: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    token: String,
    timeout: Duration,
    progress_window: Duration,
    max_lifetime: Duration,
}

impl std::fmt::Debug for FeedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedLock")
            .field("token", &self.token)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl FeedLock {
    /// Creates a lock backend with a fresh token.
    #[must_use]
    pub fn new(
        locks: Arc<dyn LockStore>,
        queue: Arc<dyn TaskQueue>,
        states: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        settings: &ExecutorSettings,
    ) -> Self {
        Self {
            locks,
            queue,
            states,
            clock,
            token: uuid::Uuid::new_v4().to_string(),
            timeout: settings.lock_timeout,
            progress_window: settings.progress_window,
            max_lifetime: settings.max_lock_lifetime,
        }
    }

    /// Returns this instance's token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Tries to take the lock for `timeout`. Taking a lock this instance
    /// already holds extends it.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lock store fails.
    pub fn acquire(&self, name: &str, timeout: Duration) -> Result<bool, DbError> {
        let now = self.clock.now_secs();
        let record = LockRecord {
            name: name.to_owned(),
            expire: now + seconds(timeout),
            value: self.token.clone(),
            acquired: now,
        };
        if self.locks.insert_lock(&record)? {
            log::debug!("Acquired lock {name}");
            return Ok(true);
        }

        let Some(existing) = self.locks.load_lock(name)? else {
            return self.locks.insert_lock(&record);
        };
        if existing.value == self.token {
            return self.locks.extend_lock(name, &self.token, record.expire);
        }
        if now < existing.expire || self.judge(&existing, now)? == Verdict::Extend {
            return Ok(false);
        }
        if self
            .locks
            .delete_lock(name, &LockGuard::Expire(existing.expire))?
        {
            log::info!("Released stale lock {name} held by {}", existing.value);
        }
        self.locks.insert_lock(&record)
    }

    /// Takes the lock for the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lock store fails.
    pub fn acquire_default(&self, name: &str) -> Result<bool, DbError> {
        self.acquire(name, self.timeout)
    }

    /// Returns `true` if `name` is not held, or is held but expired with no
    /// sign of a running import (in which case the stale lock is removed).
    /// An expired lock of a live import is extended and reported busy.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lock or task stores fail.
    pub fn lock_may_be_available(&self, name: &str) -> Result<bool, DbError> {
        let Some(existing) = self.locks.load_lock(name)? else {
            return Ok(true);
        };
        let now = self.clock.now_secs();
        if now < existing.expire {
            return Ok(false);
        }
        match self.judge(&existing, now)? {
            Verdict::Extend => Ok(false),
            Verdict::Release => {
                self.locks
                    .delete_lock(name, &LockGuard::Expire(existing.expire))?;
                log::info!("Released stale lock {name} held by {}", existing.value);
                Ok(true)
            }
        }
    }

    /// Decides the fate of an expired lock, extending it if the import is
    /// alive.
    fn judge(&self, existing: &LockRecord, now: f64) -> Result<Verdict, DbError> {
        if now - existing.acquired >= seconds(self.max_lifetime) {
            log::warn!(
                "Lock {} exceeded its maximum lifetime of {}s",
                existing.name,
                self.max_lifetime.num_seconds()
            );
            return Ok(Verdict::Release);
        }
        let Some(feed_id) = feed_id_from_lock_name(&existing.name) else {
            return Ok(Verdict::Release);
        };

        let queued = self.queue.count_tasks(feed_id)?;
        let current = self.clock.now();
        let recent = self
            .states
            .last_progress(feed_id)?
            .is_some_and(|updated| current - updated < self.progress_window);
        if queued == 0 && !recent {
            return Ok(Verdict::Release);
        }

        let expire = now + seconds(self.timeout);
        self.locks
            .extend_lock(&existing.name, &existing.value, expire)?;
        log::debug!(
            "Extended lock {} ({queued} queued tasks, recent progress: {recent})",
            existing.name
        );
        Ok(Verdict::Extend)
    }

    /// Pushes the expiry of a held lock forward, whoever holds it. Returns
    /// `false` if the lock is not held.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lock store fails.
    pub fn refresh(&self, name: &str) -> Result<bool, DbError> {
        let Some(existing) = self.locks.load_lock(name)? else {
            return Ok(false);
        };
        let expire = self.clock.now_secs() + seconds(self.timeout);
        self.locks.extend_lock(name, &existing.value, expire)
    }

    /// Releases the lock if this instance holds it.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lock store fails.
    pub fn release(&self, name: &str) -> Result<bool, DbError> {
        self.locks
            .delete_lock(name, &LockGuard::Value(self.token.clone()))
    }

    /// Releases the lock whoever holds it. Used when an import run ends on
    /// another worker than the one that started it, and on feed deletion.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lock store fails.
    pub fn force_release(&self, name: &str) -> Result<bool, DbError> {
        self.locks.delete_lock(name, &LockGuard::Any)
    }
}

#[cfg(test)]
mod tests {
    use feeds_database::memory::MemoryStore;
    use feeds_feed_models::state::State;
    use feeds_feed_models::task::QueueTask;
    use feeds_feed_models::{FeedId, Stage};
    use feeds_time::ManualClock;

    use super::*;

    const NAME: &str = "feeds_feed:1";

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        settings: ExecutorSettings,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                clock: Arc::new(ManualClock::at_timestamp(1_000_000)),
                settings: ExecutorSettings {
                    lock_timeout: Duration::seconds(60),
                    progress_window: Duration::seconds(30),
                    max_lock_lifetime: Duration::hours(1),
                    ..ExecutorSettings::default()
                },
            }
        }

        fn worker(&self) -> FeedLock {
            FeedLock::new(
                self.store.clone(),
                self.store.clone(),
                self.store.clone(),
                self.clock.clone(),
                &self.settings,
            )
        }
    }

    #[test]
    fn exactly_one_worker_holds_a_feed_lock() {
        let fx = Fixture::new();
        let (a, b) = (fx.worker(), fx.worker());
        assert_ne!(a.token(), b.token());
        fx.store.push_task(&QueueTask::new(FeedId(1), Stage::Begin)).unwrap();

        assert!(a.acquire_default(NAME).unwrap());
        assert!(!b.acquire_default(NAME).unwrap());
        assert!(!b.lock_may_be_available(NAME).unwrap());
        assert!(a.acquire_default(NAME).unwrap(), "re-entrant for the holder");

        // expired, but the feed still has queued tasks: extended, not taken
        fx.clock.advance(Duration::seconds(90));
        assert!(!b.lock_may_be_available(NAME).unwrap());
        assert!(!b.acquire_default(NAME).unwrap());
        let record = fx.store.load_lock(NAME).unwrap().unwrap();
        assert_eq!(record.value, a.token());
        assert!(record.expire > fx.clock.now_secs());

        assert!(!b.release(NAME).unwrap());
        assert!(a.release(NAME).unwrap());
        assert!(b.lock_may_be_available(NAME).unwrap());
        assert!(b.acquire_default(NAME).unwrap());
    }

    #[test]
    fn expired_lock_without_activity_is_taken_over() {
        let fx = Fixture::new();
        let (a, b) = (fx.worker(), fx.worker());
        assert!(a.acquire_default(NAME).unwrap());

        fx.clock.advance(Duration::seconds(61));
        assert!(b.acquire_default(NAME).unwrap());
        assert_eq!(fx.store.load_lock(NAME).unwrap().unwrap().value, b.token());
    }

    #[test]
    fn recent_progress_keeps_an_expired_lock() {
        let fx = Fixture::new();
        let (a, b) = (fx.worker(), fx.worker());
        assert!(a.acquire_default(NAME).unwrap());

        fx.clock.advance(Duration::seconds(61));
        let mut state = State::default();
        state.set_progress(10, fx.clock.now());
        fx.store.save_state(FeedId(1), Stage::Process, &state).unwrap();
        assert!(!b.lock_may_be_available(NAME).unwrap());

        // progress stalls past the window after the extension expires
        fx.clock.advance(Duration::seconds(61));
        assert!(b.lock_may_be_available(NAME).unwrap());
        assert_eq!(fx.store.load_lock(NAME).unwrap(), None);
    }

    #[test]
    fn maximum_lifetime_overrides_extension() {
        let fx = Fixture::new();
        let (a, b) = (fx.worker(), fx.worker());
        fx.store.push_task(&QueueTask::new(FeedId(1), Stage::Process)).unwrap();
        assert!(a.acquire_default(NAME).unwrap());

        for _ in 0..59 {
            fx.clock.advance(Duration::seconds(61));
            assert!(!b.lock_may_be_available(NAME).unwrap());
        }
        fx.clock.advance(Duration::seconds(61));
        assert!(b.acquire_default(NAME).unwrap());
    }

    #[test]
    fn refresh_and_force_release_ignore_the_holder() {
        let fx = Fixture::new();
        let (a, b) = (fx.worker(), fx.worker());
        assert!(!b.refresh(NAME).unwrap());
        assert!(a.acquire_default(NAME).unwrap());

        fx.clock.advance(Duration::seconds(50));
        assert!(b.refresh(NAME).unwrap());
        let record = fx.store.load_lock(NAME).unwrap().unwrap();
        assert!((record.expire - (fx.clock.now_secs() + 60.0)).abs() < 1e-6);

        assert!(b.force_release(NAME).unwrap());
        assert_eq!(fx.store.load_lock(NAME).unwrap(), None);
    }
}
