//! Stage orchestration.
//!
//! An import run is a chain of queued tasks:
//! `Begin → Fetch → Parse → Process (repeated) → Clean → Expire → Finish`.
//! Each task runs one step of one stage, persists the stage's [`State`],
//! and enqueues exactly one successor, so a run can stop after any task and
//! be picked up again by any worker. Nothing survives in memory between
//! tasks except the plugins of a run, which are rebuilt on demand.
//!
//! Three entry points drive the chain:
//!
//! * [`Executor::import`] runs one feed's tasks in-process,
//! * [`Executor::work`] claims tasks of any feed from the queue,
//! * [`Executor::schedule_due`] enqueues imports of feeds that are due.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use feeds_database::{ClaimedTask, DbError, Services};
use feeds_feed_models::feed_type::FeedType;
use feeds_feed_models::fetched::FetcherResult;
use feeds_feed_models::item::Item;
use feeds_feed_models::state::{Counters, State};
use feeds_feed_models::task::{QueueTask, StageParams, TaskId};
use feeds_feed_models::{EntityId, Feed, FeedId, NewFeed, Stage};
use feeds_fetcher::{FetchError, Fetcher};
use feeds_parser::{ParseError, Parser};
use feeds_processor::{ProcessError, Processor};
use feeds_time::Clock;

use crate::config::{ConfigError, ExecutorSettings, FeedTypes};
use crate::filter::ItemFilter;
use crate::lock::FeedLock;
use crate::progress::{ProgressCallback, null_progress, report};
use crate::registry::PluginRegistry;

/// Why a stage failed.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The fetcher failed.
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The parser failed.
    #[error("Parse failed: {0}")]
    Parse(#[from] ParseError),

    /// The processor failed on an item.
    #[error("Processing failed: {0}")]
    Process(#[from] ProcessError),

    /// A store operation failed.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// The feed type or a plugin could not be built.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The task does not carry the inputs its stage needs.
    #[error("Task is missing its {expected}")]
    MissingParams {
        /// What the stage expected.
        expected: &'static str,
    },
}

/// Errors returned by the executor.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// A store operation outside of any stage failed.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// A feed type is unknown or invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No feed with this id exists.
    #[error("Feed {feed_id} not found")]
    FeedNotFound {
        /// The requested feed.
        feed_id: FeedId,
    },

    /// A stage failed. Its state stays at the last checkpoint and the task
    /// stays queued unless it ran out of attempts.
    #[error("Feed {feed_id} failed in stage {stage}: {source}")]
    Stage {
        /// The feed being imported.
        feed_id: FeedId,
        /// The stage that failed.
        stage: Stage,
        /// The underlying failure.
        source: StageError,
    },
}

/// Totals of one finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    /// The imported feed.
    pub feed_id: FeedId,
    /// Items handed to the processor.
    pub items: u64,
    /// Entities attributed to the feed after the run.
    pub item_count: u64,
    /// Outcome counters of every stage.
    pub counters: Counters,
    /// `true` when the fetcher reported no new content.
    pub empty: bool,
}

impl fmt::Display for ImportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.empty {
            return write!(f, "no new content, {} items kept", self.item_count);
        }
        let c = &self.counters;
        write!(
            f,
            "{} items: {} created, {} updated, {} unchanged, {} skipped, {} deleted, {} unpublished, {} failed; {} items kept",
            self.items,
            c.created,
            c.updated,
            c.unchanged,
            c.skipped,
            c.deleted,
            c.unpublished,
            c.failed,
            self.item_count,
        )
    }
}

/// Result of a direct import or expire run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The feed is locked by another run; try again later.
    Deferred,
    /// The run finished.
    Completed(ImportSummary),
}

/// What one [`Executor::work`] call did.
#[derive(Debug, Default)]
pub struct WorkReport {
    /// Tasks claimed.
    pub tasks: usize,
    /// Runs that finished.
    pub completed: Vec<ImportSummary>,
    /// Stage failures; the failed tasks were released or dropped.
    pub failures: Vec<ImportError>,
}

enum Step {
    Next(QueueTask),
    Done(ImportSummary),
}

enum TaskOutcome {
    Continued,
    Completed(ImportSummary),
    /// The task belonged to a deleted feed.
    Dropped,
}

/// Plugins of one run, built on first use.
struct Run {
    feed_type: FeedType,
    filter: ItemFilter,
    fetcher: Option<Arc<dyn Fetcher>>,
    parser: Option<Arc<dyn Parser>>,
    processor: Option<Arc<dyn Processor>>,
}

impl Run {
    fn new(feed_type: FeedType) -> Self {
        Self {
            filter: ItemFilter::for_feed_type(&feed_type),
            feed_type,
            fetcher: None,
            parser: None,
            processor: None,
        }
    }

    fn fetcher(&mut self, registry: &PluginRegistry) -> Result<Arc<dyn Fetcher>, ConfigError> {
        if let Some(fetcher) = &self.fetcher {
            return Ok(fetcher.clone());
        }
        let fetcher = registry.build_fetcher(&self.feed_type)?;
        self.fetcher = Some(fetcher.clone());
        Ok(fetcher)
    }

    fn parser(&mut self, registry: &PluginRegistry) -> Result<Arc<dyn Parser>, ConfigError> {
        if let Some(parser) = &self.parser {
            return Ok(parser.clone());
        }
        let parser = registry.build_parser(&self.feed_type)?;
        self.parser = Some(parser.clone());
        Ok(parser)
    }

    fn processor(&mut self, registry: &PluginRegistry) -> Result<Arc<dyn Processor>, ConfigError> {
        if let Some(processor) = &self.processor {
            return Ok(processor.clone());
        }
        let processor = registry.build_processor(&self.feed_type)?;
        self.processor = Some(processor.clone());
        Ok(processor)
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn to_index(pointer: u64) -> usize {
    pointer as usize
}

/// Expires `ids`, logging and counting individual failures.
fn expire_ids(
    processor: &dyn Processor,
    feed: &Feed,
    ids: &[EntityId],
    state: &mut State,
    now: DateTime<Utc>,
) {
    for &id in ids {
        if let Err(e) = processor.expire_item(feed, id, state) {
            log::error!("Feed {}: failed to expire entity {id}: {e}", feed.id);
            state.counters.failed += 1;
        }
        state.advance(1, now);
    }
}

/// Runs import tasks against a set of stores.
pub struct Executor {
    services: Services,
    registry: PluginRegistry,
    feed_types: FeedTypes,
    lock: FeedLock,
    clock: Arc<dyn Clock>,
    settings: ExecutorSettings,
    progress: Arc<dyn ProgressCallback>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("registry", &self.registry)
            .field("feed_types", &self.feed_types.len())
            .field("lock", &self.lock)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor with its own lock token.
    #[must_use]
    pub fn new(
        services: Services,
        registry: PluginRegistry,
        feed_types: FeedTypes,
        clock: Arc<dyn Clock>,
        settings: ExecutorSettings,
    ) -> Self {
        let lock = FeedLock::new(
            services.locks.clone(),
            services.queue.clone(),
            services.states.clone(),
            clock.clone(),
            &settings,
        );
        Self {
            services,
            registry,
            feed_types,
            lock,
            clock,
            settings,
            progress: null_progress(),
        }
    }

    /// Reports stage progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Returns the known feed types.
    #[must_use]
    pub const fn feed_types(&self) -> &FeedTypes {
        &self.feed_types
    }

    /// Returns the plugin registry.
    #[must_use]
    pub const fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Returns this executor's lock backend.
    #[must_use]
    pub const fn lock(&self) -> &FeedLock {
        &self.lock
    }

    /// Creates a feed after validating its type.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Config`] if the feed type is unknown or
    /// invalid, or [`ImportError::Database`] if the feed cannot be stored.
    pub fn add_feed(&self, draft: NewFeed) -> Result<Feed, ImportError> {
        let feed_type = self.feed_types.get(&draft.feed_type)?;
        self.registry.validate(feed_type)?;
        let feed = self.services.feeds.create_feed(draft, self.clock.now())?;
        log::info!(
            "Created feed {} ({}) of type {}",
            feed.id,
            feed.label,
            feed.feed_type
        );
        Ok(feed)
    }

    /// Returns every persisted stage state of a feed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if a state cannot be loaded.
    pub fn states(&self, feed_id: FeedId) -> Result<Vec<(Stage, State)>, DbError> {
        let mut states = Vec::new();
        for stage in Stage::STATEFUL {
            if let Some(state) = self.services.states.load_state(feed_id, stage)? {
                states.push((stage, state));
            }
        }
        Ok(states)
    }

    fn load_feed(&self, feed_id: FeedId) -> Result<Feed, ImportError> {
        self.services
            .feeds
            .load_feed(feed_id)?
            .ok_or(ImportError::FeedNotFound { feed_id })
    }

    /// Imports a feed in-process.
    ///
    /// Takes the feed's lock and queues `Begin`, then runs the feed's
    /// tasks until the run finishes. If the feed already has queued tasks,
    /// the interrupted run is resumed instead of starting over.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Stage`] if a stage fails; calling `import`
    /// again retries that stage. Returns other [`ImportError`]s if the
    /// feed does not exist or a store fails.
    pub async fn import(&self, feed_id: FeedId) -> Result<ImportOutcome, ImportError> {
        let feed = self.load_feed(feed_id)?;
        if self.services.queue.count_tasks(feed_id)? == 0 {
            if !self.enqueue_feed(&feed)? {
                return Ok(ImportOutcome::Deferred);
            }
        } else {
            log::info!("Feed {feed_id}: resuming queued import");
        }

        let mut runs = BTreeMap::new();
        loop {
            let Some(claimed) = self.services.queue.claim_task_for_feed(
                feed_id,
                self.clock.now(),
                self.settings.task_lease,
            )?
            else {
                log::info!("Feed {feed_id}: queued tasks are claimed by another worker");
                return Ok(ImportOutcome::Deferred);
            };
            match self.execute(&mut runs, claimed).await? {
                TaskOutcome::Continued => {}
                TaskOutcome::Completed(summary) => return Ok(ImportOutcome::Completed(summary)),
                TaskOutcome::Dropped => return Err(ImportError::FeedNotFound { feed_id }),
            }
        }
    }

    /// Queues an import of a feed for workers. Returns `false` if the feed
    /// already has queued tasks or is locked.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError`] if the feed does not exist or a store fails.
    pub fn enqueue(&self, feed_id: FeedId) -> Result<bool, ImportError> {
        let feed = self.load_feed(feed_id)?;
        self.enqueue_feed(&feed)
    }

    fn enqueue_feed(&self, feed: &Feed) -> Result<bool, ImportError> {
        if self.services.queue.count_tasks(feed.id)? > 0 {
            log::info!("Feed {}: an import is already queued", feed.id);
            return Ok(false);
        }
        if !self.lock.acquire_default(&feed.lock_name())? {
            log::info!("Feed {}: locked by another import", feed.id);
            return Ok(false);
        }
        self.services
            .queue
            .push_task(&QueueTask::new(feed.id, Stage::Begin))?;
        log::info!("Feed {} ({}): import queued", feed.id, feed.label);
        Ok(true)
    }

    /// Claims and runs up to `limit` tasks of any feed.
    ///
    /// Stage failures are logged and collected in the report. A task that
    /// fails is not run again in the same call: when it is claimed again it
    /// is held aside, so other feeds' tasks keep running, and released when
    /// the call returns.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError`] if the queue or another store fails outside
    /// of a stage.
    pub async fn work(&self, limit: usize) -> Result<WorkReport, ImportError> {
        let mut failed: BTreeSet<TaskId> = BTreeSet::new();
        let mut held: Vec<ClaimedTask> = Vec::new();

        let result = self.work_claims(limit, &mut failed, &mut held).await;
        for claimed in held {
            self.services
                .queue
                .release_task(claimed.id, &claimed.task)?;
        }
        result
    }

    async fn work_claims(
        &self,
        limit: usize,
        failed: &mut BTreeSet<TaskId>,
        held: &mut Vec<ClaimedTask>,
    ) -> Result<WorkReport, ImportError> {
        let mut report = WorkReport::default();
        let mut runs = BTreeMap::new();

        while report.tasks < limit {
            let Some(claimed) = self
                .services
                .queue
                .claim_task(self.clock.now(), self.settings.task_lease)?
            else {
                break;
            };
            if failed.contains(&claimed.id) {
                log::debug!(
                    "Feed {}: {} failed earlier in this pass, skipping",
                    claimed.task.feed_id,
                    claimed.task.stage
                );
                held.push(claimed);
                continue;
            }
            report.tasks += 1;

            let id = claimed.id;
            match self.execute(&mut runs, claimed).await {
                Ok(TaskOutcome::Completed(summary)) => report.completed.push(summary),
                Ok(TaskOutcome::Continued | TaskOutcome::Dropped) => {}
                Err(e @ ImportError::Stage { .. }) => {
                    log::error!("{e}");
                    failed.insert(id);
                    report.failures.push(e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Queues imports of active, scheduled feeds whose next import is due
    /// and whose lock may be available. Returns the queued feeds.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError`] if a store fails.
    pub fn schedule_due(&self) -> Result<Vec<FeedId>, ImportError> {
        let now = self.clock.now();
        let mut queued = Vec::new();
        for feed in self.services.feeds.list_feeds()? {
            if !feed.active {
                continue;
            }
            let feed_type = match self.feed_types.get(&feed.feed_type) {
                Ok(feed_type) => feed_type,
                Err(e) => {
                    log::warn!("Feed {}: not scheduled: {e}", feed.id);
                    continue;
                }
            };
            if !feed_type.is_scheduled() || feed.next_import.is_some_and(|at| at > now) {
                continue;
            }
            if self.services.queue.count_tasks(feed.id)? > 0
                || !self.lock.lock_may_be_available(&feed.lock_name())?
            {
                log::debug!("Feed {}: due but still importing", feed.id);
                continue;
            }
            if self.enqueue_feed(&feed)? {
                queued.push(feed.id);
            }
        }
        Ok(queued)
    }

    /// Runs only the expire step of a feed, outside of an import.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Stage`] if the processor cannot be built or
    /// cannot list expired entities, or another [`ImportError`] if the
    /// feed does not exist or a store fails.
    pub fn expire(&self, feed_id: FeedId) -> Result<ImportOutcome, ImportError> {
        let mut feed = self.load_feed(feed_id)?;
        let name = feed.lock_name();
        if self.services.queue.count_tasks(feed_id)? > 0 || !self.lock.acquire_default(&name)? {
            log::info!("Feed {feed_id}: expire deferred, an import is running");
            return Ok(ImportOutcome::Deferred);
        }

        let result = self.expire_now(&feed);
        self.lock.release(&name)?;
        let state = result.map_err(|source| ImportError::Stage {
            feed_id,
            stage: Stage::Expire,
            source,
        })?;

        feed.item_count = self.services.entities.count_entities_for_feed(feed_id)?;
        self.services.feeds.update_feed(&feed)?;
        let summary = ImportSummary {
            feed_id,
            items: 0,
            item_count: feed.item_count,
            counters: state.counters,
            empty: false,
        };
        log::info!("Feed {feed_id}: expired {} entities", state.counters.deleted);
        Ok(ImportOutcome::Completed(summary))
    }

    fn expire_now(&self, feed: &Feed) -> Result<State, StageError> {
        let feed_type = self.feed_types.get(&feed.feed_type)?;
        let processor = self.registry.build_processor(feed_type)?;
        let now = self.clock.now();
        let ids = processor.expired_ids(feed, now)?.unwrap_or_default();

        let mut state = State::default();
        state.set_total(ids.len() as u64);
        expire_ids(processor.as_ref(), feed, &ids, &mut state, now);
        state.complete(now);
        Ok(state)
    }

    /// Deletes a feed with its queued tasks, states, clean list, cached
    /// headers, fetched data, and lock. Entities it imported are kept.
    /// Returns `false` if the feed does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::Database`] if a store fails.
    pub async fn delete_feed(&self, feed_id: FeedId) -> Result<bool, ImportError> {
        let Some(feed) = self.services.feeds.load_feed(feed_id)? else {
            return Ok(false);
        };

        let purged = self.services.queue.purge_tasks(feed_id)?;
        self.services.states.clear_states(feed_id)?;
        self.services.clean_lists.clear_clean_list(feed_id)?;
        match self
            .feed_types
            .get(&feed.feed_type)
            .and_then(|feed_type| self.registry.build_fetcher(feed_type))
        {
            Ok(fetcher) => {
                if let Err(e) = fetcher.clear(&feed).await {
                    log::warn!("Feed {feed_id}: failed to clear fetched data: {e}");
                }
            }
            Err(e) => log::warn!("Feed {feed_id}: cannot clear fetched data: {e}"),
        }
        self.services.headers.delete_headers_for_feed(feed_id)?;
        self.lock.force_release(&feed.lock_name())?;

        let deleted = self.services.feeds.delete_feed(feed_id)?;
        log::info!("Deleted feed {feed_id} ({}), {purged} queued tasks purged", feed.label);
        Ok(deleted)
    }

    /// Runs one claimed task and queues its successor.
    async fn execute(
        &self,
        runs: &mut BTreeMap<FeedId, Run>,
        claimed: ClaimedTask,
    ) -> Result<TaskOutcome, ImportError> {
        let ClaimedTask { id, task } = claimed;
        let feed_id = task.feed_id;
        let Some(mut feed) = self.services.feeds.load_feed(feed_id)? else {
            log::info!("Dropping {} task of deleted feed {feed_id}", task.stage);
            self.services.queue.complete_task(id)?;
            runs.remove(&feed_id);
            return Ok(TaskOutcome::Dropped);
        };
        self.lock.refresh(&feed.lock_name())?;

        let result = match self.run_for(runs, &feed) {
            Ok(run) => self.run_stage(run, &mut feed, &task).await,
            Err(e) => Err(StageError::Config(e)),
        };

        match result {
            Ok(Step::Next(next)) => {
                self.services.queue.push_task(&next)?;
                self.services.queue.complete_task(id)?;
                Ok(TaskOutcome::Continued)
            }
            Ok(Step::Done(summary)) => {
                self.services.queue.complete_task(id)?;
                runs.remove(&feed_id);
                Ok(TaskOutcome::Completed(summary))
            }
            Err(source) => {
                runs.remove(&feed_id);
                let stage = task.stage;
                self.retry_or_drop(id, task, &feed)?;
                Err(ImportError::Stage {
                    feed_id,
                    stage,
                    source,
                })
            }
        }
    }

    fn run_for<'a>(
        &self,
        runs: &'a mut BTreeMap<FeedId, Run>,
        feed: &Feed,
    ) -> Result<&'a mut Run, ConfigError> {
        match runs.entry(feed.id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let feed_type = self.feed_types.get(&feed.feed_type)?;
                Ok(entry.insert(Run::new(feed_type.clone())))
            }
        }
    }

    fn retry_or_drop(&self, id: TaskId, mut task: QueueTask, feed: &Feed) -> Result<(), DbError> {
        task.attempts += 1;
        if task.attempts < self.settings.max_attempts {
            log::warn!(
                "Feed {}: {} failed (attempt {}/{}), will retry",
                feed.id,
                task.stage,
                task.attempts,
                self.settings.max_attempts
            );
            return self.services.queue.release_task(id, &task);
        }
        log::error!(
            "Feed {}: {} failed {} times, abandoning the import",
            feed.id,
            task.stage,
            task.attempts
        );
        self.services.queue.complete_task(id)?;
        self.services.queue.purge_tasks(feed.id)?;
        self.lock.force_release(&feed.lock_name())?;
        Ok(())
    }

    async fn run_stage(
        &self,
        run: &mut Run,
        feed: &mut Feed,
        task: &QueueTask,
    ) -> Result<Step, StageError> {
        log::debug!(
            "Feed {}: running {} (attempt {})",
            feed.id,
            task.stage,
            task.attempts + 1
        );
        match (task.stage, &task.params) {
            (Stage::Begin, _) => self.begin(feed),
            (Stage::Fetch, _) => self.fetch(run, feed).await,
            (Stage::Parse, StageParams::Fetched { fetched }) => self.parse(run, feed, fetched),
            (Stage::Parse, _) => Err(StageError::MissingParams {
                expected: "fetched content",
            }),
            (Stage::Process, StageParams::Items { fetched, items }) => {
                self.process(run, feed, fetched, items)
            }
            (Stage::Process, _) => Err(StageError::MissingParams {
                expected: "item batch",
            }),
            (Stage::Clean, _) => self.clean(run, feed),
            (Stage::Expire, StageParams::Expire { ids }) => {
                self.expire_batch(run, feed, ids.as_deref())
            }
            (Stage::Expire, _) => self.expire_batch(run, feed, None),
            (Stage::Finish, _) => {
                self.cleanup(run, feed).await?;
                self.finish(run, feed)
            }
        }
    }

    /// Drops what the fetcher downloaded for this run. A failure is logged
    /// and leaves the download for the next run's cleanup.
    async fn cleanup(&self, run: &mut Run, feed: &Feed) -> Result<(), StageError> {
        let fetcher = run.fetcher(&self.registry)?;
        if let Err(e) = fetcher.cleanup(feed).await {
            log::warn!("Feed {}: failed to remove downloaded content: {e}", feed.id);
        }
        Ok(())
    }

    fn state(&self, feed_id: FeedId, stage: Stage) -> Result<State, DbError> {
        Ok(self
            .services
            .states
            .load_state(feed_id, stage)?
            .unwrap_or_default())
    }

    fn save(&self, feed: &Feed, stage: Stage, state: &State) -> Result<(), DbError> {
        self.services.states.save_state(feed.id, stage, state)?;
        report(self.progress.as_ref(), &feed.label, stage, state);
        Ok(())
    }

    fn begin(&self, feed: &Feed) -> Result<Step, StageError> {
        log::info!(
            "Feed {} ({}): starting import from {}",
            feed.id,
            feed.label,
            feed.source
        );
        self.services.states.clear_states(feed.id)?;
        self.services.clean_lists.clear_clean_list(feed.id)?;
        Ok(Step::Next(QueueTask::new(feed.id, Stage::Fetch)))
    }

    async fn fetch(&self, run: &mut Run, feed: &Feed) -> Result<Step, StageError> {
        let fetcher = run.fetcher(&self.registry)?;
        let mut state = self.state(feed.id, Stage::Fetch)?;
        match fetcher.fetch(feed, &mut state).await {
            Ok(fetched) => {
                self.save(feed, Stage::Fetch, &state)?;
                Ok(Step::Next(QueueTask::with_params(
                    feed.id,
                    Stage::Parse,
                    StageParams::Fetched { fetched },
                )))
            }
            Err(FetchError::EmptyFeed) => {
                let now = self.clock.now();
                state.complete(now);
                let Some(mut process) = self.services.states.load_state(feed.id, Stage::Process)?
                else {
                    log::info!("Feed {}: no new content", feed.id);
                    state.set_message("no new content");
                    self.save(feed, Stage::Fetch, &state)?;
                    return Ok(Step::Next(QueueTask::new(feed.id, Stage::Finish)));
                };
                // Earlier resources of this run were processed: the run
                // still cleans up after them.
                log::info!("Feed {}: source ran out of content mid-run", feed.id);
                self.save(feed, Stage::Fetch, &state)?;
                process.pointer = None;
                process.complete(now);
                self.save(feed, Stage::Process, &process)?;
                Ok(Step::Next(QueueTask::new(feed.id, Stage::Clean)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn parse(
        &self,
        run: &mut Run,
        feed: &Feed,
        fetched: &FetcherResult,
    ) -> Result<Step, StageError> {
        let parser = run.parser(&self.registry)?;
        let mut state = self.state(feed.id, Stage::Parse)?;
        let mut items = parser.parse(feed, fetched, &mut state)?;

        let skipped = run.filter.apply(&mut items);
        if let Some(first) = skipped.first() {
            log::debug!(
                "Feed {}: skipped {} items ({}, ...)",
                feed.id,
                skipped.len(),
                first.reason
            );
            state.counters.skipped += skipped.len() as u64;
        }

        self.save(feed, Stage::Parse, &state)?;
        Ok(Step::Next(QueueTask::with_params(
            feed.id,
            Stage::Process,
            StageParams::Items {
                fetched: fetched.clone(),
                items: items.into_items(),
            },
        )))
    }

    fn process(
        &self,
        run: &mut Run,
        feed: &Feed,
        fetched: &FetcherResult,
        items: &[Item],
    ) -> Result<Step, StageError> {
        let processor = run.processor(&self.registry)?;
        let clean_lists = &self.services.clean_lists;

        let mut state = match self.services.states.load_state(feed.id, Stage::Process)? {
            Some(state) => state,
            None => {
                // First batch of the run: snapshot the entities this feed owns.
                if let Some(ids) = processor.clean_candidates(feed)? {
                    log::debug!("Feed {}: {} clean candidates", feed.id, ids.len());
                    clean_lists.set_clean_list(feed.id, &ids)?;
                }
                State::default()
            }
        };

        // The pointer is the index of the next item of this batch.
        let start = match state.pointer {
            Some(pointer) => to_index(pointer).min(items.len()),
            None => {
                state.add_total(items.len() as u64);
                0
            }
        };
        state.pointer = Some(start as u64);
        self.save(feed, Stage::Process, &state)?;

        for (index, item) in items.iter().enumerate().skip(start) {
            let outcome = processor.process(feed, item, &mut state)?;
            if outcome.matched_existing()
                && let Some(id) = outcome.entity_id()
            {
                clean_lists.remove_from_clean_list(feed.id, id)?;
            }
            state.pointer = Some(index as u64 + 1);
            self.save(feed, Stage::Process, &state)?;
        }
        state.pointer = None;

        let parse = self.state(feed.id, Stage::Parse)?;
        let next = if parse.completed {
            if self.state(feed.id, Stage::Fetch)?.completed {
                state.complete(self.clock.now());
                QueueTask::new(feed.id, Stage::Clean)
            } else {
                // The next resource is parsed from its beginning.
                let reset = State {
                    counters: parse.counters,
                    ..State::default()
                };
                self.services.states.save_state(feed.id, Stage::Parse, &reset)?;
                QueueTask::new(feed.id, Stage::Fetch)
            }
        } else {
            QueueTask::with_params(
                feed.id,
                Stage::Parse,
                StageParams::Fetched {
                    fetched: fetched.clone(),
                },
            )
        };
        self.save(feed, Stage::Process, &state)?;
        Ok(Step::Next(next))
    }

    fn clean(&self, run: &mut Run, feed: &Feed) -> Result<Step, StageError> {
        let clean_lists = &self.services.clean_lists;
        let now = self.clock.now();
        let mut state = match self.services.states.load_state(feed.id, Stage::Clean)? {
            Some(state) => state,
            None => {
                let mut state = State::default();
                state.set_total(clean_lists.clean_list_len(feed.id)?);
                state
            }
        };

        let batch = clean_lists.clean_list_head(feed.id, self.settings.clean_batch_size)?;
        if !batch.is_empty() {
            let processor = run.processor(&self.registry)?;
            for id in batch {
                if let Err(e) = processor.clean(feed, id, &mut state) {
                    log::error!("Feed {}: failed to clean entity {id}: {e}", feed.id);
                    state.counters.failed += 1;
                }
                clean_lists.remove_from_clean_list(feed.id, id)?;
                state.advance(1, now);
                self.save(feed, Stage::Clean, &state)?;
            }
        }

        if clean_lists.clean_list_len(feed.id)? > 0 {
            return Ok(Step::Next(QueueTask::new(feed.id, Stage::Clean)));
        }
        state.complete(now);
        self.save(feed, Stage::Clean, &state)?;
        Ok(Step::Next(QueueTask::with_params(
            feed.id,
            Stage::Expire,
            StageParams::Expire { ids: None },
        )))
    }

    fn expire_batch(
        &self,
        run: &mut Run,
        feed: &Feed,
        ids: Option<&[EntityId]>,
    ) -> Result<Step, StageError> {
        let processor = run.processor(&self.registry)?;
        let now = self.clock.now();
        let mut state = self.state(feed.id, Stage::Expire)?;

        let ids = if let Some(ids) = ids {
            ids.to_vec()
        } else {
            let Some(ids) = processor.expired_ids(feed, now)? else {
                state.complete(now);
                self.save(feed, Stage::Expire, &state)?;
                return Ok(Step::Next(QueueTask::new(feed.id, Stage::Finish)));
            };
            state.set_total(ids.len() as u64);
            ids
        };

        let (batch, rest) = ids.split_at(ids.len().min(self.settings.expire_batch_size));
        expire_ids(processor.as_ref(), feed, batch, &mut state, now);

        if rest.is_empty() {
            state.complete(now);
            self.save(feed, Stage::Expire, &state)?;
            return Ok(Step::Next(QueueTask::new(feed.id, Stage::Finish)));
        }
        self.save(feed, Stage::Expire, &state)?;
        Ok(Step::Next(QueueTask::with_params(
            feed.id,
            Stage::Expire,
            StageParams::Expire {
                ids: Some(rest.to_vec()),
            },
        )))
    }

    fn finish(&self, run: &mut Run, feed: &mut Feed) -> Result<Step, StageError> {
        let now = self.clock.now();
        let mut counters = Counters::default();
        for (_, state) in self.states(feed.id)? {
            counters.merge(&state.counters);
        }

        let process = self.services.states.load_state(feed.id, Stage::Process)?;
        if let Some(state) = &process {
            let processor = run.processor(&self.registry)?;
            feed.item_count = processor.post_process(feed, state)?;
        }

        feed.imported = Some(now);
        feed.next_import = run
            .feed_type
            .is_scheduled()
            .then(|| now + Duration::seconds(run.feed_type.import_period));
        self.services.feeds.update_feed(feed)?;
        self.services.clean_lists.clear_clean_list(feed.id)?;
        self.lock.force_release(&feed.lock_name())?;

        let summary = ImportSummary {
            feed_id: feed.id,
            items: process.as_ref().map_or(0, |state| state.progress),
            item_count: feed.item_count,
            counters,
            empty: process.is_none(),
        };
        log::info!("Feed {} ({}): import finished, {summary}", feed.id, feed.label);
        self.progress.finish(format!("{}: {summary}", feed.label));
        Ok(Step::Done(summary))
    }
}
