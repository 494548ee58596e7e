//! Local file fetcher (uploads and paths on shared storage).

use std::path::PathBuf;

use async_trait::async_trait;
use feeds_feed_models::Feed;
use feeds_feed_models::fetched::FetcherResult;
use feeds_feed_models::state::State;
use serde::Deserialize;

use crate::{FetchError, Fetcher, FetcherServices, complete_single};

/// Settings of the `file` fetcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    /// Delete the source file when the feed is deleted.
    pub delete_on_clear: bool,
}

/// Returns the feed's source path as-is.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    settings: FileSettings,
    services: FetcherServices,
}

impl FileFetcher {
    /// Creates a file fetcher.
    #[must_use]
    pub const fn new(settings: FileSettings, services: FetcherServices) -> Self {
        Self { settings, services }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    fn id(&self) -> &'static str {
        "file"
    }

    async fn fetch(&self, feed: &Feed, state: &mut State) -> Result<FetcherResult, FetchError> {
        let path = PathBuf::from(&feed.source);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| FetchError::InvalidSource {
                locator: feed.source.clone(),
                message: e.to_string(),
            })?;
        if !metadata.is_file() {
            return Err(FetchError::InvalidSource {
                locator: feed.source.clone(),
                message: "not a regular file".to_owned(),
            });
        }

        complete_single(state, self.services.clock.as_ref());
        if metadata.len() == 0 {
            log::info!("Feed {}: {} is empty", feed.id, path.display());
            return Err(FetchError::EmptyFeed);
        }
        Ok(FetcherResult::file(path))
    }

    async fn clear(&self, feed: &Feed) -> Result<(), FetchError> {
        if self.settings.delete_on_clear && tokio::fs::try_exists(&feed.source).await? {
            tokio::fs::remove_file(&feed.source).await?;
            log::info!("Feed {}: deleted source file {}", feed.id, feed.source);
        }
        Ok(())
    }
}
