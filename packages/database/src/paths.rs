#![allow(clippy::module_name_repetitions)]
//! Canonical file paths for the feeds data directory.
//!
//! The data directory defaults to `data/` under the working directory and
//! can be moved with the `FEEDS_DATA_DIR` environment variable.

use std::path::{Path, PathBuf};

use feeds_feed_models::FeedId;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "FEEDS_DATA_DIR";

/// Returns the data directory path.
#[must_use]
pub fn data_dir() -> PathBuf {
    std::env::var_os(DATA_DIR_ENV).map_or_else(|| PathBuf::from("data"), PathBuf::from)
}

/// Returns the directory holding downloaded content, below `root`.
#[must_use]
pub fn fetched_dir(root: &Path) -> PathBuf {
    root.join("fetched")
}

/// Returns the download directory of one feed, below `root`.
#[must_use]
pub fn feed_fetched_dir(root: &Path, feed_id: FeedId) -> PathBuf {
    fetched_dir(root).join(feed_id.to_string())
}

/// Returns the path of the store's `DuckDB` file, below `root`.
#[must_use]
pub fn store_db_path(root: &Path) -> PathBuf {
    root.join("feeds.duckdb")
}

/// Ensures a directory exists, creating it if necessary.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_downloads_live_under_fetched() {
        let root = Path::new("/tmp/feeds");
        assert_eq!(
            feed_fetched_dir(root, FeedId(4)),
            PathBuf::from("/tmp/feeds/fetched/4")
        );
        assert_eq!(store_db_path(root), PathBuf::from("/tmp/feeds/feeds.duckdb"));
    }

    #[test]
    fn ensure_dir_creates_nested_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        ensure_dir(&nested).unwrap();
    }
}
