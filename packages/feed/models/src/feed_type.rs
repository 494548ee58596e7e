//! Feed type configuration.
//!
//! A [`FeedType`] names one fetcher, one parser, and one processor plugin
//! (each selected by registry id and configured with a free-form settings
//! table), declares the custom sources the parser should extract, and maps
//! sources onto target fields.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Prefix of mapping sources that read a property of the feed itself
/// rather than of the parsed item.
pub const FEED_PROPERTY_PREFIX: &str = "feed:";

/// Feed properties available to mappings as `feed:<name>`.
pub const FEED_PROPERTIES: &[&str] = &["id", "label", "source", "owner"];

/// Value of [`FeedType::import_period`] that disables scheduled imports.
pub const IMPORT_PERIOD_NEVER: i64 = -1;

/// Reusable import configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedType {
    /// Unique identifier (e.g. `"csv_articles"`).
    pub id: String,
    /// Human-readable name.
    pub label: String,
    /// Optional description shown in listings.
    #[serde(default)]
    pub description: Option<String>,
    /// Fetcher plugin and its settings.
    pub fetcher: PluginConfig,
    /// Parser plugin and its settings.
    pub parser: PluginConfig,
    /// Processor plugin and its settings.
    pub processor: PluginConfig,
    /// Named extraction rules, in declaration order.
    #[serde(default)]
    pub custom_sources: IndexMap<String, CustomSource>,
    /// Source to target mappings, in declaration order.
    #[serde(default)]
    pub mappings: Vec<Mapping>,
    /// Seconds between scheduled imports; `-1` disables scheduling.
    #[serde(default = "default_import_period")]
    pub import_period: i64,
    /// Sources whose empty value causes the whole item to be skipped.
    #[serde(default)]
    pub skip_if_empty: Vec<String>,
}

const fn default_import_period() -> i64 {
    IMPORT_PERIOD_NEVER
}

impl FeedType {
    /// Returns the unique mappings in declaration order.
    pub fn unique_mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.iter().filter(|m| m.unique)
    }

    /// Returns `true` if feeds of this type are imported on a schedule.
    #[must_use]
    pub const fn is_scheduled(&self) -> bool {
        self.import_period >= 0
    }

    /// Returns the custom source with the given name.
    #[must_use]
    pub fn custom_source(&self, name: &str) -> Option<&CustomSource> {
        self.custom_sources.get(name)
    }
}

/// Selects a plugin by registry id and carries its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Registry id of the plugin (e.g. `"http"`, `"csv"`, `"entity"`).
    pub id: String,
    /// Plugin-specific settings, deserialized by the plugin factory.
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl PluginConfig {
    /// Creates a plugin config with empty settings.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            settings: serde_json::Map::new(),
        }
    }

    /// Adds a setting.
    #[must_use]
    pub fn with_setting(mut self, key: &str, value: serde_json::Value) -> Self {
        self.settings.insert(key.to_owned(), value);
        self
    }

    /// Deserializes the settings table into a typed configuration.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`serde_json::Error`] if the settings do not
    /// match `T`.
    pub fn settings_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(self.settings.clone()))
    }
}

/// A named extraction rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomSource {
    /// Custom source plugin id (`"csv"`, `"json"`, `"blank"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// The extraction rule: a column name, a dot-path, or empty.
    #[serde(default)]
    pub value: String,
    /// Optional human-readable label.
    #[serde(default)]
    pub label: Option<String>,
}

impl CustomSource {
    /// Creates a custom source of the given type and rule.
    #[must_use]
    pub fn new(kind: &str, value: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            value: value.to_owned(),
            label: None,
        }
    }
}

/// Maps one source onto one target field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    /// A custom source name, a parser-native source, or `feed:<property>`.
    pub source: String,
    /// Target field on the entity.
    pub target: String,
    /// Whether this mapping participates in matching existing entities.
    #[serde(default)]
    pub unique: bool,
    /// Per-mapping target settings.
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl Mapping {
    /// Creates a non-unique mapping.
    #[must_use]
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_owned(),
            target: target.to_owned(),
            unique: false,
            settings: serde_json::Map::new(),
        }
    }

    /// Marks the mapping as unique.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Returns a boolean setting, defaulting to `false`.
    #[must_use]
    pub fn bool_setting(&self, key: &str) -> bool {
        self.settings
            .get(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Returns the property name if this mapping reads a feed property.
    #[must_use]
    pub fn feed_property(&self) -> Option<&str> {
        self.source.strip_prefix(FEED_PROPERTY_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLES: &str = r#"
id = "articles"
label = "Articles"

[fetcher]
id = "http"

[parser]
id = "csv"
settings = { delimiter = ";", has_header = true }

[processor]
id = "entity"
settings = { entity_type = "article", update_existing = "update" }

[custom_sources.guid]
type = "csv"
value = "id"

[custom_sources.title]
type = "csv"
value = "Title"

[[mappings]]
source = "guid"
target = "guid"
unique = true

[[mappings]]
source = "title"
target = "title"
settings = { trim = true }
"#;

    #[test]
    fn parses_feed_type_from_toml() {
        let feed_type: FeedType = toml::from_str(ARTICLES).unwrap();
        assert_eq!(feed_type.id, "articles");
        assert_eq!(feed_type.parser.id, "csv");
        assert_eq!(
            feed_type.parser.settings.get("delimiter"),
            Some(&serde_json::json!(";"))
        );
        assert_eq!(feed_type.import_period, IMPORT_PERIOD_NEVER);
        assert!(!feed_type.is_scheduled());
        assert_eq!(
            feed_type.custom_sources.keys().collect::<Vec<_>>(),
            vec!["guid", "title"]
        );
    }

    #[test]
    fn unique_mappings_keep_declaration_order() {
        let mut feed_type: FeedType = toml::from_str(ARTICLES).unwrap();
        feed_type
            .mappings
            .push(Mapping::new("title", "alt_key").unique());
        let targets: Vec<&str> = feed_type
            .unique_mappings()
            .map(|m| m.target.as_str())
            .collect();
        assert_eq!(targets, vec!["guid", "alt_key"]);
    }

    #[test]
    fn reads_mapping_settings_and_feed_properties() {
        let feed_type: FeedType = toml::from_str(ARTICLES).unwrap();
        assert!(feed_type.mappings[1].bool_setting("trim"));
        assert!(!feed_type.mappings[0].bool_setting("trim"));
        assert_eq!(Mapping::new("feed:id", "feed").feed_property(), Some("id"));
        assert_eq!(Mapping::new("title", "title").feed_property(), None);
    }

    #[test]
    fn settings_deserialize_into_typed_config() {
        #[derive(Deserialize)]
        struct Csv {
            delimiter: String,
            has_header: bool,
        }
        let feed_type: FeedType = toml::from_str(ARTICLES).unwrap();
        let csv: Csv = feed_type.parser.settings_as().unwrap();
        assert_eq!(csv.delimiter, ";");
        assert!(csv.has_header);
    }
}
