//! Directory fetcher.
//!
//! Lists the files of a directory in sorted order and hands out one per
//! fetch. `State::pointer` is the index of the next file and
//! `State::total` the number of files, so a queued fetch resumes where
//! the last one stopped.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use feeds_feed_models::Feed;
use feeds_feed_models::fetched::FetcherResult;
use feeds_feed_models::state::State;
use serde::Deserialize;

use crate::{FetchError, Fetcher, FetcherServices};

/// Settings of the `directory` fetcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    /// Allowed file extensions without the dot; empty allows all.
    pub allowed_extensions: Vec<String>,
    /// Descend into subdirectories.
    pub recursive: bool,
}

impl DirectorySettings {
    fn allows(&self, path: &Path) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.allowed_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
    }
}

/// Hands out the files of a directory one per fetch.
#[derive(Debug, Clone)]
pub struct DirectoryFetcher {
    settings: DirectorySettings,
    services: FetcherServices,
}

impl DirectoryFetcher {
    /// Creates a directory fetcher.
    #[must_use]
    pub const fn new(settings: DirectorySettings, services: FetcherServices) -> Self {
        Self { settings, services }
    }

    /// Returns the matching files below `root`, sorted by path.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be read.
    pub async fn list(&self, root: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if self.settings.recursive {
                        pending.push(path);
                    }
                } else if file_type.is_file() && self.settings.allows(&path) {
                    files.push(path);
                }
            }
        }

        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl Fetcher for DirectoryFetcher {
    fn id(&self) -> &'static str {
        "directory"
    }

    async fn fetch(&self, feed: &Feed, state: &mut State) -> Result<FetcherResult, FetchError> {
        let root = PathBuf::from(&feed.source);
        if !tokio::fs::metadata(&root)
            .await
            .map_err(|e| FetchError::InvalidSource {
                locator: feed.source.clone(),
                message: e.to_string(),
            })?
            .is_dir()
        {
            return Err(FetchError::InvalidSource {
                locator: feed.source.clone(),
                message: "not a directory".to_owned(),
            });
        }

        let files = self.list(&root).await?;
        let now = self.services.clock.now();
        let count = files.len() as u64;
        state.set_total(count);

        let index = state.pointer.unwrap_or(0);
        let Some(path) = usize::try_from(index).ok().and_then(|i| files.get(i)) else {
            log::info!(
                "Feed {}: no files left in {} ({count} listed)",
                feed.id,
                root.display()
            );
            state.complete(now);
            return Err(FetchError::EmptyFeed);
        };

        state.pointer = Some(index + 1);
        state.set_progress(index + 1, now);
        if index + 1 >= count {
            state.complete(now);
        }
        state.set_message(path.display().to_string());
        log::debug!(
            "Feed {}: fetching file {} of {count}: {}",
            feed.id,
            index + 1,
            path.display()
        );
        Ok(FetcherResult::file(path.clone()))
    }

    async fn clear(&self, _feed: &Feed) -> Result<(), FetchError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::DateTime;
    use feeds_database::memory::MemoryStore;
    use feeds_feed_models::{FeedId, NewFeed};
    use feeds_time::SystemClock;

    use super::*;

    fn fetcher(settings: DirectorySettings) -> DirectoryFetcher {
        DirectoryFetcher::new(
            settings,
            FetcherServices {
                client: reqwest::Client::new(),
                headers: Arc::new(MemoryStore::new()),
                clock: Arc::new(SystemClock),
                data_dir: PathBuf::from("unused"),
            },
        )
    }

    fn feed(source: &Path) -> Feed {
        NewFeed::new("articles", "Articles", &source.display().to_string())
            .into_feed(FeedId(1), DateTime::from_timestamp(0, 0).unwrap())
    }

    fn populate(root: &Path) {
        std::fs::create_dir_all(root.join("nested")).unwrap();
        for name in ["b.csv", "a.csv", "notes.txt", "nested/c.CSV"] {
            std::fs::write(root.join(name), "x").unwrap();
        }
    }

    #[tokio::test]
    async fn hands_out_files_in_order_until_complete() {
        let tmp = tempfile::tempdir().unwrap();
        populate(tmp.path());
        let fetcher = fetcher(DirectorySettings {
            allowed_extensions: vec!["csv".to_string()],
            recursive: false,
        });
        let feed = feed(tmp.path());

        let mut state = State::default();
        let first = fetcher.fetch(&feed, &mut state).await.unwrap();
        assert_eq!(first.path(), Some(tmp.path().join("a.csv").as_path()));
        assert_eq!(state.total, Some(2));
        assert!(!state.completed);

        let second = fetcher.fetch(&feed, &mut state).await.unwrap();
        assert_eq!(second.path(), Some(tmp.path().join("b.csv").as_path()));
        assert!(state.completed);
    }

    #[tokio::test]
    async fn recursive_listing_matches_extensions_case_insensitively() {
        let tmp = tempfile::tempdir().unwrap();
        populate(tmp.path());
        let fetcher = fetcher(DirectorySettings {
            allowed_extensions: vec!["csv".to_string()],
            recursive: true,
        });
        let files = fetcher.list(tmp.path()).await.unwrap();
        assert_eq!(
            files,
            vec![
                tmp.path().join("a.csv"),
                tmp.path().join("b.csv"),
                tmp.path().join("nested").join("c.CSV"),
            ]
        );
    }

    #[tokio::test]
    async fn empty_directory_is_an_empty_feed() {
        let tmp = tempfile::tempdir().unwrap();
        let mut state = State::default();
        let err = fetcher(DirectorySettings::default())
            .fetch(&feed(tmp.path()), &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::EmptyFeed));
        assert!(state.completed);
    }

    #[tokio::test]
    async fn file_source_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.csv");
        std::fs::write(&path, "x").unwrap();
        let err = fetcher(DirectorySettings::default())
            .fetch(&feed(&path), &mut State::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidSource { .. }));
    }
}
