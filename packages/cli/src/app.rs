//! Wiring of stores, plugins, and the executor for one CLI invocation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use feeds_database::{DbError, Services};
use feeds_feed_models::{Feed, FeedId};
use feeds_fetcher::FetcherServices;
use feeds_pipeline::progress::ProgressCallback;
use feeds_pipeline::{Executor, ExecutorSettings, FeedTypes, PluginContext, PluginRegistry};
use feeds_time::Clock;

const USER_AGENT: &str = concat!("feeds/", env!("CARGO_PKG_VERSION"));

/// Everything a command needs, built once per invocation.
pub struct App {
    services: Services,
    feed_types: FeedTypes,
    settings: ExecutorSettings,
    clock: Arc<dyn Clock>,
    client: reqwest::Client,
    data_dir: PathBuf,
}

impl App {
    /// Opens the store below `data_dir` and loads feed types, including
    /// those in `config_dir` if given.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened, a feed type or
    /// setting is invalid, or the HTTP client cannot be built.
    pub fn open(
        data_dir: PathBuf,
        config_dir: Option<&Path>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let feed_types = match config_dir {
            Some(dir) => FeedTypes::builtin_and_dir(dir)?,
            None => FeedTypes::builtin()?,
        };
        log::debug!("Loaded {} feed types", feed_types.len());

        Ok(Self {
            services: open_services(&data_dir)?,
            feed_types,
            settings: ExecutorSettings::from_env()?,
            clock: feeds_time::system_clock(),
            client: reqwest::Client::builder().user_agent(USER_AGENT).build()?,
            data_dir,
        })
    }

    /// Builds an executor reporting to `progress`.
    pub fn executor(&self, progress: Arc<dyn ProgressCallback>) -> Executor {
        let context = PluginContext {
            fetcher: FetcherServices {
                client: self.client.clone(),
                headers: self.services.headers.clone(),
                clock: self.clock.clone(),
                data_dir: self.data_dir.clone(),
            },
            entities: self.services.entities.clone(),
            clock: self.clock.clone(),
        };
        Executor::new(
            self.services.clone(),
            PluginRegistry::with_defaults(context),
            self.feed_types.clone(),
            self.clock.clone(),
            self.settings,
        )
        .with_progress(progress)
    }

    pub const fn services(&self) -> &Services {
        &self.services
    }

    pub const fn feed_types(&self) -> &FeedTypes {
        &self.feed_types
    }

    /// Loads a feed, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed is unknown or the store fails.
    pub fn feed(&self, id: FeedId) -> Result<Feed, Box<dyn std::error::Error>> {
        Ok(self
            .services
            .feeds
            .load_feed(id)?
            .ok_or_else(|| format!("Feed {id} not found"))?)
    }

    #[cfg(test)]
    pub fn in_memory(data_dir: PathBuf) -> Self {
        Self {
            services: Services::in_memory(),
            feed_types: FeedTypes::builtin().unwrap(),
            settings: ExecutorSettings::default(),
            clock: feeds_time::system_clock(),
            client: reqwest::Client::new(),
            data_dir,
        }
    }
}

#[cfg(feature = "duckdb")]
fn open_services(data_dir: &Path) -> Result<Services, DbError> {
    let path = feeds_database::paths::store_db_path(data_dir);
    log::debug!("Opening store {}", path.display());
    let store = feeds_database::duckdb::DuckDbStore::open(&path)?;
    Ok(Services::from_store(Arc::new(store)))
}

#[cfg(not(feature = "duckdb"))]
#[allow(clippy::unnecessary_wraps)]
fn open_services(data_dir: &Path) -> Result<Services, DbError> {
    log::warn!(
        "Built without the `duckdb` feature: nothing is persisted below {}",
        data_dir.display()
    );
    Ok(Services::in_memory())
}
