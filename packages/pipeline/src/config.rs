//! Feed type definitions and executor settings.
//!
//! Each `.toml` file in `packages/pipeline/feed_types/` is baked into the
//! binary at compile time via [`include_str!`]. Additional feed types can
//! be loaded at runtime from a directory of `*.toml` files (see
//! [`CONFIG_DIR_ENV`]).

use std::path::Path;
use std::str::FromStr;

use chrono::Duration;
use feeds_feed_models::feed_type::FeedType;
use indexmap::IndexMap;

/// Environment variable naming a directory of extra feed type files.
pub const CONFIG_DIR_ENV: &str = "FEEDS_CONFIG_DIR";

/// Feed type configs embedded at compile time.
const FEED_TYPE_TOMLS: &[(&str, &str)] = &[
    ("articles_csv", include_str!("../feed_types/articles_csv.toml")),
    ("events_json", include_str!("../feed_types/events_json.toml")),
    ("local_csv", include_str!("../feed_types/local_csv.toml")),
    (
        "csv_drop_folder",
        include_str!("../feed_types/csv_drop_folder.toml"),
    ),
];

/// Errors in feed type configuration or executor settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A feed type file is not valid TOML for a [`FeedType`].
    #[error("Failed to parse {name}: {message}")]
    Toml {
        /// File or embedded config name.
        name: String,
        /// Parser message.
        message: String,
    },

    /// I/O error while reading a config directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Two feed types share an id.
    #[error("Duplicate feed type id '{id}'")]
    DuplicateFeedType {
        /// The repeated id.
        id: String,
    },

    /// No feed type with this id is known.
    #[error("Unknown feed type '{id}'")]
    UnknownFeedType {
        /// The requested id.
        id: String,
    },

    /// No plugin with this id is registered for the role.
    #[error("Unknown {role} plugin '{id}'")]
    UnknownPlugin {
        /// `fetcher`, `parser`, `processor`, `custom source`, or `clean`.
        role: &'static str,
        /// The requested id.
        id: String,
    },

    /// A plugin rejected its settings.
    #[error("Invalid settings for {role} plugin '{id}': {message}")]
    InvalidSettings {
        /// Plugin role.
        role: &'static str,
        /// Plugin id.
        id: String,
        /// Description of what went wrong.
        message: String,
    },

    /// A feed type failed validation.
    #[error("Feed type '{feed_type}' is invalid: {}", problems.join("; "))]
    Invalid {
        /// Feed type id.
        feed_type: String,
        /// Every problem found.
        problems: Vec<String>,
    },

    /// An environment override could not be parsed.
    #[error("Invalid value '{value}' for {name}: {message}")]
    Env {
        /// Variable name.
        name: String,
        /// The raw value.
        value: String,
        /// Description of what went wrong.
        message: String,
    },
}

/// Parses one feed type from TOML.
///
/// # Errors
///
/// Returns [`ConfigError::Toml`] if the text is not a valid feed type.
pub fn parse_feed_type_toml(name: &str, text: &str) -> Result<FeedType, ConfigError> {
    toml::from_str(text).map_err(|e| ConfigError::Toml {
        name: name.to_owned(),
        message: e.to_string(),
    })
}

/// The known feed types, keyed by id in load order.
#[derive(Debug, Clone, Default)]
pub struct FeedTypes {
    types: IndexMap<String, FeedType>,
}

impl FeedTypes {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the feed types embedded in the binary.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an embedded config is malformed or two
    /// share an id.
    pub fn builtin() -> Result<Self, ConfigError> {
        let mut types = Self::new();
        for (name, text) in FEED_TYPE_TOMLS {
            types.insert(parse_feed_type_toml(&format!("{name}.toml"), text)?)?;
        }
        Ok(types)
    }

    /// Loads the embedded feed types plus every `*.toml` file in `dir`,
    /// in file name order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the directory cannot be read, a file is
    /// malformed, or an id is repeated.
    pub fn builtin_and_dir(dir: &Path) -> Result<Self, ConfigError> {
        let mut types = Self::builtin()?;
        types.load_dir(dir)?;
        Ok(types)
    }

    /// Adds every `*.toml` file in `dir`, in file name order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the directory cannot be read, a file is
    /// malformed, or an id is repeated.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, ConfigError> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == "toml") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in &paths {
            let text = std::fs::read_to_string(path)?;
            let feed_type = parse_feed_type_toml(&path.display().to_string(), &text)?;
            log::debug!("Loaded feed type '{}' from {}", feed_type.id, path.display());
            self.insert(feed_type)?;
        }
        Ok(paths.len())
    }

    /// Adds a feed type.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateFeedType`] if the id is taken.
    pub fn insert(&mut self, feed_type: FeedType) -> Result<(), ConfigError> {
        if self.types.contains_key(&feed_type.id) {
            return Err(ConfigError::DuplicateFeedType { id: feed_type.id });
        }
        self.types.insert(feed_type.id.clone(), feed_type);
        Ok(())
    }

    /// Returns a feed type by id.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownFeedType`] if there is none.
    pub fn get(&self, id: &str) -> Result<&FeedType, ConfigError> {
        self.types
            .get(id)
            .ok_or_else(|| ConfigError::UnknownFeedType { id: id.to_owned() })
    }

    /// Iterates feed types in load order.
    pub fn iter(&self) -> impl Iterator<Item = &FeedType> {
        self.types.values()
    }

    /// Returns the number of feed types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns `true` if there are no feed types.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Tunables of the [`crate::executor::Executor`] and the feed lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// How long an acquired feed lock is valid before it must be extended.
    pub lock_timeout: Duration,
    /// An expired lock is extended while progress was recorded this
    /// recently.
    pub progress_window: Duration,
    /// A lock older than this is released even if it would be extended.
    pub max_lock_lifetime: Duration,
    /// How long a claimed task is reserved for its worker.
    pub task_lease: Duration,
    /// Failed tasks are retried until they have failed this many times.
    pub max_attempts: u32,
    /// Stale entities cleaned per clean task.
    pub clean_batch_size: usize,
    /// Entities expired per expire task.
    pub expire_batch_size: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::hours(1),
            progress_window: Duration::minutes(30),
            max_lock_lifetime: Duration::hours(24),
            task_lease: Duration::minutes(10),
            max_attempts: 3,
            clean_batch_size: 50,
            expire_batch_size: 50,
        }
    }
}

impl ExecutorSettings {
    /// Reads overrides from `FEEDS_LOCK_TIMEOUT`, `FEEDS_PROGRESS_WINDOW`,
    /// `FEEDS_MAX_LOCK_LIFETIME`, `FEEDS_TASK_LEASE` (all in seconds),
    /// `FEEDS_MAX_ATTEMPTS`, `FEEDS_CLEAN_BATCH_SIZE`, and
    /// `FEEDS_EXPIRE_BATCH_SIZE`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if a variable is set to an invalid
    /// value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`Self::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if a variable is set to an invalid
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let seconds = |name: &str, default: Duration| {
            parse_var::<u32>(&lookup, name)
                .map(|v| v.map_or(default, |s| Duration::seconds(i64::from(s))))
        };
        let settings = Self {
            lock_timeout: seconds("FEEDS_LOCK_TIMEOUT", defaults.lock_timeout)?,
            progress_window: seconds("FEEDS_PROGRESS_WINDOW", defaults.progress_window)?,
            max_lock_lifetime: seconds("FEEDS_MAX_LOCK_LIFETIME", defaults.max_lock_lifetime)?,
            task_lease: seconds("FEEDS_TASK_LEASE", defaults.task_lease)?,
            max_attempts: parse_var(&lookup, "FEEDS_MAX_ATTEMPTS")?
                .unwrap_or(defaults.max_attempts),
            clean_batch_size: parse_var(&lookup, "FEEDS_CLEAN_BATCH_SIZE")?
                .unwrap_or(defaults.clean_batch_size),
            expire_batch_size: parse_var(&lookup, "FEEDS_EXPIRE_BATCH_SIZE")?
                .unwrap_or(defaults.expire_batch_size),
        };

        for (name, value) in [
            ("FEEDS_MAX_ATTEMPTS", settings.max_attempts as usize),
            ("FEEDS_CLEAN_BATCH_SIZE", settings.clean_batch_size),
            ("FEEDS_EXPIRE_BATCH_SIZE", settings.expire_batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Env {
                    name: name.to_owned(),
                    value: "0".to_owned(),
                    message: "must be at least 1".to_owned(),
                });
            }
        }
        Ok(settings)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    raw.trim().parse().map(Some).map_err(|e: T::Err| ConfigError::Env {
        name: name.to_owned(),
        value: raw,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn loads_builtin_feed_types() {
        let types = FeedTypes::builtin().unwrap();
        assert_eq!(types.len(), FEED_TYPE_TOMLS.len());
        for (name, _) in FEED_TYPE_TOMLS {
            assert_eq!(types.get(name).unwrap().id, *name);
        }
        assert!(types.get("articles_csv").unwrap().is_scheduled());
        assert!(matches!(
            types.get("nope"),
            Err(ConfigError::UnknownFeedType { .. })
        ));
    }

    #[test]
    fn loads_directory_and_rejects_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("b.toml"),
            "id = \"extra\"\nlabel = \"Extra\"\n[fetcher]\nid = \"file\"\n[parser]\nid = \"csv\"\n[processor]\nid = \"entity\"\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let types = FeedTypes::builtin_and_dir(tmp.path()).unwrap();
        assert_eq!(types.iter().last().unwrap().id, "extra");

        std::fs::write(
            tmp.path().join("c.toml"),
            "id = \"extra\"\nlabel = \"Again\"\n[fetcher]\nid = \"file\"\n[parser]\nid = \"csv\"\n[processor]\nid = \"entity\"\n",
        )
        .unwrap();
        assert!(matches!(
            FeedTypes::builtin_and_dir(tmp.path()),
            Err(ConfigError::DuplicateFeedType { .. })
        ));

        std::fs::write(tmp.path().join("a.toml"), "id = ").unwrap();
        assert!(matches!(
            FeedTypes::builtin_and_dir(tmp.path()),
            Err(ConfigError::Toml { .. })
        ));
    }

    #[test]
    fn executor_settings_read_overrides() {
        let vars: BTreeMap<&str, &str> = [
            ("FEEDS_LOCK_TIMEOUT", "120"),
            ("FEEDS_MAX_ATTEMPTS", " 5 "),
        ]
        .into_iter()
        .collect();
        let settings =
            ExecutorSettings::from_lookup(|name| vars.get(name).map(|v| (*v).to_string())).unwrap();
        assert_eq!(settings.lock_timeout, Duration::seconds(120));
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.clean_batch_size, 50);
    }

    #[test]
    fn executor_settings_reject_bad_values() {
        let bad = |name: &'static str, value: &'static str| {
            ExecutorSettings::from_lookup(move |n| (n == name).then(|| value.to_string()))
        };
        assert!(matches!(
            bad("FEEDS_PROGRESS_WINDOW", "soon"),
            Err(ConfigError::Env { .. })
        ));
        assert!(bad("FEEDS_CLEAN_BATCH_SIZE", "0").is_err());
        assert!(bad("FEEDS_TASK_LEASE", "-1").is_err());
    }
}
