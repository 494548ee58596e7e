#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Fetcher plugins.
//!
//! A [`Fetcher`] retrieves the raw content of a feed's source and returns
//! a [`FetcherResult`] pointing at local bytes. Three plugins ship here:
//! [`http::HttpFetcher`] (streamed download with conditional requests),
//! [`file::FileFetcher`] (a local path), and
//! [`directory::DirectoryFetcher`] (every matching file of a directory,
//! one per fetch).
//!
//! [`FetchError::EmptyFeed`] is not a failure: it tells the pipeline the
//! source has nothing new and the run should finish with zero items.

pub mod directory;
pub mod file;
pub mod http;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use feeds_database::{DbError, HeaderCache};
use feeds_feed_models::Feed;
use feeds_feed_models::fetched::FetcherResult;
use feeds_feed_models::state::State;
use feeds_time::Clock;

/// Errors that can occur while fetching a feed.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The source has no new content. Ends the run successfully.
    #[error("Feed has no new content")]
    EmptyFeed,

    /// The HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {status} for {url}: {message}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Upstream message (response body or reason phrase).
        message: String,
    },

    /// I/O error (file read/write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The feed's source locator cannot be used by this fetcher.
    #[error("Invalid source '{locator}': {message}")]
    InvalidSource {
        /// The feed's source locator.
        locator: String,
        /// Description of what went wrong.
        message: String,
    },

    /// The conditional-request header cache failed.
    #[error("Header cache error: {0}")]
    Cache(#[from] DbError),
}

/// Retrieves raw content for a feed.
///
/// A fetcher reports completion through `state`: when
/// [`State::completed`] is still `false` after a successful fetch, the
/// pipeline parses and processes the result and then fetches again.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Returns the registry id of this fetcher (e.g. `"http"`).
    fn id(&self) -> &'static str;

    /// Fetches the next piece of content.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::EmptyFeed`] if the source has nothing new, or
    /// another [`FetchError`] if the content cannot be retrieved.
    async fn fetch(&self, feed: &Feed, state: &mut State) -> Result<FetcherResult, FetchError>;

    /// Removes content this fetcher downloaded for a run once the run is
    /// over. Files a feed points at are never touched.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if downloaded content cannot be removed.
    async fn cleanup(&self, _feed: &Feed) -> Result<(), FetchError> {
        Ok(())
    }

    /// Removes everything this fetcher stored for a feed. Called when the
    /// feed is deleted.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if stored data cannot be removed.
    async fn clear(&self, feed: &Feed) -> Result<(), FetchError>;
}

/// Collaborators shared by every fetcher instance.
#[derive(Clone)]
pub struct FetcherServices {
    /// HTTP client used for downloads.
    pub client: reqwest::Client,
    /// Conditional-request validator cache.
    pub headers: Arc<dyn HeaderCache>,
    /// Time source for state updates.
    pub clock: Arc<dyn Clock>,
    /// Root of the data directory; downloads go below it.
    pub data_dir: PathBuf,
}

impl std::fmt::Debug for FetcherServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetcherServices")
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

/// Marks a single-resource fetch as finished.
pub(crate) fn complete_single(state: &mut State, clock: &dyn Clock) {
    let now = clock.now();
    state.set_total(1);
    state.set_progress(1, now);
    state.complete(now);
}
