//! Queued units of stage work.

use serde::{Deserialize, Serialize};

use crate::fetched::FetcherResult;
use crate::item::Item;
use crate::{EntityId, FeedId, Stage};

/// Identifier assigned to a task by the queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub u64);

/// One unit of work: run `stage` for `feed_id` with `params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueTask {
    /// The feed the task belongs to.
    pub feed_id: FeedId,
    /// Which stage to run.
    pub stage: Stage,
    /// Stage inputs carried from the previous task.
    #[serde(default)]
    pub params: StageParams,
    /// How many times this task has failed and been released.
    #[serde(default)]
    pub attempts: u32,
}

impl QueueTask {
    /// Creates a task with no parameters.
    #[must_use]
    pub fn new(feed_id: FeedId, stage: Stage) -> Self {
        Self {
            feed_id,
            stage,
            params: StageParams::None,
            attempts: 0,
        }
    }

    /// Creates a task with parameters.
    #[must_use]
    pub const fn with_params(feed_id: FeedId, stage: Stage, params: StageParams) -> Self {
        Self {
            feed_id,
            stage,
            params,
            attempts: 0,
        }
    }
}

/// Stage inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageParams {
    /// No inputs.
    #[default]
    None,
    /// Content fetched by the previous fetch task.
    Fetched {
        /// The fetched content.
        fetched: FetcherResult,
    },
    /// A parsed batch waiting to be processed.
    Items {
        /// The content the batch came from; parsing continues from it.
        fetched: FetcherResult,
        /// Items to process, in order.
        items: Vec<Item>,
    },
    /// Entity ids still to expire; `None` until they are computed.
    Expire {
        /// Remaining ids.
        ids: Option<Vec<EntityId>>,
    },
}
