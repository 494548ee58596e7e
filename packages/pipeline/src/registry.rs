//! Explicit plugin registry.
//!
//! Every plugin role maps a string id to a factory. A feed type names the
//! ids it wants; [`PluginRegistry`] builds the plugins from the feed
//! type's settings and validates feed types before they are used.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use feeds_database::EntityStore;
use feeds_feed_models::feed_type::{FEED_PROPERTIES, FEED_PROPERTY_PREFIX, FeedType, PluginConfig};
use feeds_fetcher::directory::DirectoryFetcher;
use feeds_fetcher::file::FileFetcher;
use feeds_fetcher::http::HttpFetcher;
use feeds_fetcher::{Fetcher, FetcherServices};
use feeds_parser::Parser;
use feeds_parser::csv_parser::CsvParser;
use feeds_parser::json_parser::JsonParser;
use feeds_parser::sources::{
    BlankSource, CsvColumnSource, CustomSourcePlugin, JsonPathSource, SourceResolver,
};
use feeds_processor::clean::{CleanAction, FlagStale};
use feeds_processor::entity::{EntityProcessor, EntitySettings};
use feeds_processor::{CleanPlugin, Processor};
use feeds_time::Clock;
use serde::de::DeserializeOwned;

use crate::config::ConfigError;

/// Collaborators handed to plugin factories.
#[derive(Clone)]
pub struct PluginContext {
    /// Shared fetcher collaborators (HTTP client, header cache, data dir).
    pub fetcher: FetcherServices,
    /// Target entity store.
    pub entities: Arc<dyn EntityStore>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("fetcher", &self.fetcher)
            .finish_non_exhaustive()
    }
}

/// Builds a fetcher from its config.
pub type FetcherFactory = Arc<
    dyn Fn(&PluginConfig, &PluginContext) -> Result<Arc<dyn Fetcher>, ConfigError> + Send + Sync,
>;

/// Builds a parser from its config and the feed type's custom sources.
pub type ParserFactory = Arc<
    dyn Fn(&PluginConfig, SourceResolver, &PluginContext) -> Result<Arc<dyn Parser>, ConfigError>
        + Send
        + Sync,
>;

/// Builds a processor from the feed type (settings and mappings).
pub type ProcessorFactory = Arc<
    dyn Fn(
            &FeedType,
            &PluginContext,
            &BTreeMap<String, Arc<dyn CleanPlugin>>,
        ) -> Result<Arc<dyn Processor>, ConfigError>
        + Send
        + Sync,
>;

/// Deserializes a plugin's settings table.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidSettings`] if the settings do not match
/// `T`.
pub fn settings<T: DeserializeOwned>(
    role: &'static str,
    config: &PluginConfig,
) -> Result<T, ConfigError> {
    config
        .settings_as()
        .map_err(|e| ConfigError::InvalidSettings {
            role,
            id: config.id.clone(),
            message: e.to_string(),
        })
}

fn http_fetcher(
    config: &PluginConfig,
    ctx: &PluginContext,
) -> Result<Arc<dyn Fetcher>, ConfigError> {
    Ok(Arc::new(HttpFetcher::new(
        settings("fetcher", config)?,
        ctx.fetcher.clone(),
    )))
}

pub(crate) fn file_fetcher(
    config: &PluginConfig,
    ctx: &PluginContext,
) -> Result<Arc<dyn Fetcher>, ConfigError> {
    Ok(Arc::new(FileFetcher::new(
        settings("fetcher", config)?,
        ctx.fetcher.clone(),
    )))
}

fn directory_fetcher(
    config: &PluginConfig,
    ctx: &PluginContext,
) -> Result<Arc<dyn Fetcher>, ConfigError> {
    Ok(Arc::new(DirectoryFetcher::new(
        settings("fetcher", config)?,
        ctx.fetcher.clone(),
    )))
}

fn csv_parser(
    config: &PluginConfig,
    resolver: SourceResolver,
    ctx: &PluginContext,
) -> Result<Arc<dyn Parser>, ConfigError> {
    let parser = CsvParser::new(settings("parser", config)?, resolver, ctx.clock.clone())
        .map_err(|e| ConfigError::InvalidSettings {
            role: "parser",
            id: config.id.clone(),
            message: e.to_string(),
        })?;
    Ok(Arc::new(parser))
}

fn json_parser(
    config: &PluginConfig,
    resolver: SourceResolver,
    ctx: &PluginContext,
) -> Result<Arc<dyn Parser>, ConfigError> {
    Ok(Arc::new(JsonParser::new(
        settings("parser", config)?,
        resolver,
        ctx.clock.clone(),
    )))
}

pub(crate) fn entity_processor(
    feed_type: &FeedType,
    ctx: &PluginContext,
    clean_plugins: &BTreeMap<String, Arc<dyn CleanPlugin>>,
) -> Result<Arc<dyn Processor>, ConfigError> {
    let config = &feed_type.processor;
    let entity_settings: EntitySettings = settings("processor", config)?;
    let clean_plugin = match &entity_settings.update_non_existent {
        CleanAction::Custom(id) => Some(clean_plugins.get(id).cloned().ok_or_else(|| {
            ConfigError::UnknownPlugin {
                role: "clean",
                id: id.clone(),
            }
        })?),
        _ => None,
    };
    let processor = EntityProcessor::new(
        entity_settings,
        feed_type.mappings.clone(),
        ctx.entities.clone(),
        ctx.clock.clone(),
        clean_plugin,
    )
    .map_err(|e| ConfigError::InvalidSettings {
        role: "processor",
        id: config.id.clone(),
        message: e.to_string(),
    })?;
    Ok(Arc::new(processor))
}

/// Maps plugin ids to factories for every role.
#[derive(Clone)]
pub struct PluginRegistry {
    context: PluginContext,
    fetchers: BTreeMap<String, FetcherFactory>,
    parsers: BTreeMap<String, ParserFactory>,
    processors: BTreeMap<String, ProcessorFactory>,
    custom_sources: BTreeMap<String, Arc<dyn CustomSourcePlugin>>,
    clean_plugins: BTreeMap<String, Arc<dyn CleanPlugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("fetchers", &self.fetchers.keys().collect::<Vec<_>>())
            .field("parsers", &self.parsers.keys().collect::<Vec<_>>())
            .field("processors", &self.processors.keys().collect::<Vec<_>>())
            .field("custom_sources", &self.custom_sources.keys().collect::<Vec<_>>())
            .field("clean_plugins", &self.clean_plugins.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    /// Creates a registry with no plugins.
    #[must_use]
    pub fn empty(context: PluginContext) -> Self {
        Self {
            context,
            fetchers: BTreeMap::new(),
            parsers: BTreeMap::new(),
            processors: BTreeMap::new(),
            custom_sources: BTreeMap::new(),
            clean_plugins: BTreeMap::new(),
        }
    }

    /// Creates a registry with the built-in plugins: fetchers `http`,
    /// `file`, `directory`; parsers `csv`, `json`; processor `entity`;
    /// custom sources `csv`, `json`, `blank`; clean plugin `flag_stale`.
    #[must_use]
    pub fn with_defaults(context: PluginContext) -> Self {
        Self::empty(context)
            .with_fetcher("http", Arc::new(http_fetcher))
            .with_fetcher("file", Arc::new(file_fetcher))
            .with_fetcher("directory", Arc::new(directory_fetcher))
            .with_parser("csv", Arc::new(csv_parser))
            .with_parser("json", Arc::new(json_parser))
            .with_processor("entity", Arc::new(entity_processor))
            .with_custom_source(Arc::new(CsvColumnSource))
            .with_custom_source(Arc::new(JsonPathSource))
            .with_custom_source(Arc::new(BlankSource))
            .with_clean_plugin(Arc::new(FlagStale::default()))
    }

    /// Registers a fetcher factory.
    #[must_use]
    pub fn with_fetcher(mut self, id: &str, factory: FetcherFactory) -> Self {
        self.fetchers.insert(id.to_owned(), factory);
        self
    }

    /// Registers a parser factory.
    #[must_use]
    pub fn with_parser(mut self, id: &str, factory: ParserFactory) -> Self {
        self.parsers.insert(id.to_owned(), factory);
        self
    }

    /// Registers a processor factory.
    #[must_use]
    pub fn with_processor(mut self, id: &str, factory: ProcessorFactory) -> Self {
        self.processors.insert(id.to_owned(), factory);
        self
    }

    /// Registers a custom source plugin under its own id.
    #[must_use]
    pub fn with_custom_source(mut self, plugin: Arc<dyn CustomSourcePlugin>) -> Self {
        self.custom_sources.insert(plugin.id().to_owned(), plugin);
        self
    }

    /// Registers a clean plugin under its own id.
    #[must_use]
    pub fn with_clean_plugin(mut self, plugin: Arc<dyn CleanPlugin>) -> Self {
        self.clean_plugins.insert(plugin.id().to_owned(), plugin);
        self
    }

    /// Returns the context plugins are built with.
    #[must_use]
    pub const fn context(&self) -> &PluginContext {
        &self.context
    }

    /// Returns the registered ids per role, for listings.
    #[must_use]
    pub fn plugin_ids(&self) -> BTreeMap<&'static str, Vec<&str>> {
        BTreeMap::from([
            ("fetcher", self.fetchers.keys().map(String::as_str).collect()),
            ("parser", self.parsers.keys().map(String::as_str).collect()),
            ("processor", self.processors.keys().map(String::as_str).collect()),
            (
                "custom_source",
                self.custom_sources.keys().map(String::as_str).collect(),
            ),
            ("clean", self.clean_plugins.keys().map(String::as_str).collect()),
        ])
    }

    /// Builds the feed type's fetcher.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the id is unknown or the settings are
    /// invalid.
    pub fn build_fetcher(&self, feed_type: &FeedType) -> Result<Arc<dyn Fetcher>, ConfigError> {
        let config = &feed_type.fetcher;
        let factory = self
            .fetchers
            .get(&config.id)
            .ok_or_else(|| ConfigError::UnknownPlugin {
                role: "fetcher",
                id: config.id.clone(),
            })?;
        factory(config, &self.context)
    }

    /// Builds the feed type's custom source resolver.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownPlugin`] if a custom source type is
    /// not registered.
    pub fn build_resolver(&self, feed_type: &FeedType) -> Result<SourceResolver, ConfigError> {
        let mut resolver = SourceResolver::new();
        for (name, source) in &feed_type.custom_sources {
            let plugin = self.custom_sources.get(&source.kind).ok_or_else(|| {
                ConfigError::UnknownPlugin {
                    role: "custom source",
                    id: source.kind.clone(),
                }
            })?;
            resolver = resolver.with_source(name, source.clone(), plugin.clone());
        }
        Ok(resolver)
    }

    /// Builds the feed type's parser.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an id is unknown or the settings are
    /// invalid.
    pub fn build_parser(&self, feed_type: &FeedType) -> Result<Arc<dyn Parser>, ConfigError> {
        let config = &feed_type.parser;
        let factory = self
            .parsers
            .get(&config.id)
            .ok_or_else(|| ConfigError::UnknownPlugin {
                role: "parser",
                id: config.id.clone(),
            })?;
        factory(config, self.build_resolver(feed_type)?, &self.context)
    }

    /// Builds the feed type's processor.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the id is unknown or the settings are
    /// invalid.
    pub fn build_processor(
        &self,
        feed_type: &FeedType,
    ) -> Result<Arc<dyn Processor>, ConfigError> {
        let config = &feed_type.processor;
        let factory = self
            .processors
            .get(&config.id)
            .ok_or_else(|| ConfigError::UnknownPlugin {
                role: "processor",
                id: config.id.clone(),
            })?;
        factory(feed_type, &self.context, &self.clean_plugins)
    }

    /// Checks a feed type before it is used.
    ///
    /// All three plugins must build from their settings; every custom
    /// source type must be registered and supported by the parser (and
    /// support the parser in turn); every mapping and `skip_if_empty`
    /// source must name a custom source, a parser-native source, or a
    /// feed property; and each target may be unique at most once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing every problem found.
    pub fn validate(&self, feed_type: &FeedType) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if let Err(e) = self.build_fetcher(feed_type) {
            problems.push(e.to_string());
        }
        if let Err(e) = self.build_processor(feed_type) {
            problems.push(e.to_string());
        }

        let parser = self
            .parsers
            .get(&feed_type.parser.id)
            .ok_or_else(|| ConfigError::UnknownPlugin {
                role: "parser",
                id: feed_type.parser.id.clone(),
            })
            .and_then(|factory| factory(&feed_type.parser, SourceResolver::new(), &self.context));
        let parser = match parser {
            Ok(parser) => Some(parser),
            Err(e) => {
                problems.push(e.to_string());
                None
            }
        };

        for (name, source) in &feed_type.custom_sources {
            let Some(plugin) = self.custom_sources.get(&source.kind) else {
                problems.push(format!(
                    "custom source '{name}' has unknown type '{}'",
                    source.kind
                ));
                continue;
            };
            if let Some(parser) = &parser
                && (!parser.custom_source_types().contains(&source.kind.as_str())
                    || !plugin.supported_parsers().contains(&parser.id()))
            {
                problems.push(format!(
                    "custom source '{name}' of type '{}' is not supported by parser '{}'",
                    source.kind,
                    parser.id()
                ));
            }
        }

        let native: BTreeSet<String> = parser
            .as_ref()
            .map(|p| p.mapping_sources().into_iter().map(|s| s.key).collect())
            .unwrap_or_default();
        let known_source = |source: &str| {
            feed_type.custom_sources.contains_key(source)
                || native.contains(source)
                || source
                    .strip_prefix(FEED_PROPERTY_PREFIX)
                    .is_some_and(|p| FEED_PROPERTIES.contains(&p))
        };

        let mut unique_targets = BTreeSet::new();
        for mapping in &feed_type.mappings {
            if !known_source(&mapping.source) {
                problems.push(format!(
                    "mapping to '{}' reads unknown source '{}'",
                    mapping.target, mapping.source
                ));
            }
            if mapping.unique && !unique_targets.insert(mapping.target.as_str()) {
                problems.push(format!(
                    "target '{}' is marked unique more than once",
                    mapping.target
                ));
            }
        }
        for source in &feed_type.skip_if_empty {
            if !known_source(source) {
                problems.push(format!("skip_if_empty names unknown source '{source}'"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                feed_type: feed_type.id.clone(),
                problems,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use feeds_database::memory::MemoryStore;
    use feeds_feed_models::feed_type::{CustomSource, Mapping};
    use feeds_time::SystemClock;
    use serde_json::json;

    use super::*;
    use crate::config::FeedTypes;

    fn registry() -> PluginRegistry {
        let store = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        PluginRegistry::with_defaults(PluginContext {
            fetcher: FetcherServices {
                client: reqwest::Client::new(),
                headers: store.clone(),
                clock: clock.clone(),
                data_dir: PathBuf::from("unused"),
            },
            entities: store,
            clock,
        })
    }

    fn csv_type() -> FeedType {
        FeedTypes::builtin()
            .unwrap()
            .get("local_csv")
            .unwrap()
            .clone()
    }

    fn problems(feed_type: &FeedType) -> Vec<String> {
        match registry().validate(feed_type) {
            Err(ConfigError::Invalid { problems, .. }) => problems,
            other => panic!("expected validation problems, got {other:?}"),
        }
    }

    #[test]
    fn builtin_feed_types_are_valid() {
        let registry = registry();
        for feed_type in FeedTypes::builtin().unwrap().iter() {
            registry.validate(feed_type).unwrap();
            registry.build_fetcher(feed_type).unwrap();
            registry.build_parser(feed_type).unwrap();
            registry.build_processor(feed_type).unwrap();
        }
    }

    #[test]
    fn rejects_custom_sources_the_parser_cannot_resolve() {
        let mut feed_type = csv_type();
        feed_type
            .custom_sources
            .insert("path".to_string(), CustomSource::new("json", "a.b"));
        feed_type
            .custom_sources
            .insert("xpath".to_string(), CustomSource::new("xpath", "//a"));
        let found = problems(&feed_type);
        assert_eq!(found.len(), 2, "{found:?}");
        assert!(found[0].contains("'path'"));
        assert!(found[1].contains("unknown type 'xpath'"));
    }

    #[test]
    fn rejects_unknown_sources_and_repeated_unique_targets() {
        let mut feed_type = csv_type();
        feed_type.mappings.push(Mapping::new("nope", "x"));
        feed_type.mappings.push(Mapping::new("title", "guid").unique());
        feed_type.mappings.push(Mapping::new("feed:label", "label"));
        feed_type.mappings.push(Mapping::new("feed:secret", "secret"));
        feed_type.skip_if_empty.push("missing".to_string());
        let found = problems(&feed_type);
        assert_eq!(found.len(), 4, "{found:?}");
        assert!(found.iter().any(|p| p.contains("unknown source 'nope'")));
        assert!(found.iter().any(|p| p.contains("unique more than once")));
        assert!(found.iter().any(|p| p.contains("'feed:secret'")));
        assert!(found.iter().any(|p| p.contains("skip_if_empty")));
    }

    #[test]
    fn parser_native_sources_are_mappable() {
        let mut feed_type = csv_type();
        feed_type.parser.settings.insert(
            "columns".to_string(),
            json!(["id", "title"]),
        );
        feed_type.parser.settings.insert("has_header".to_string(), json!(false));
        feed_type.mappings.push(Mapping::new("id", "raw_id"));
        registry().validate(&feed_type).unwrap();
    }

    #[test]
    fn rejects_unknown_plugins_and_bad_settings() {
        let mut feed_type = csv_type();
        feed_type.fetcher = PluginConfig::new("ftp");
        feed_type.parser = feed_type.parser.with_setting("delimiter", json!("::"));
        feed_type.processor = feed_type
            .processor
            .with_setting("update_non_existent", json!("custom:archive"));
        let found = problems(&feed_type);
        assert_eq!(found.len(), 3, "{found:?}");
        assert!(found[0].contains("Unknown fetcher plugin 'ftp'"));
        assert!(found[1].contains("archive"));
        assert!(found[2].contains("delimiter"));
    }
}
