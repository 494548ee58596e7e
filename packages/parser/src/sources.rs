//! Custom source plugins and their resolution onto items.
//!
//! A custom source is a named extraction rule declared by the feed type.
//! Its plugin reads the raw item a parser built and returns one value,
//! which [`SourceResolver::apply`] stores on the item under the custom
//! source's name. Each plugin lists the parsers it works with; each parser
//! lists the plugin types it accepts. A feed type is only valid when both
//! sides agree.

use std::sync::Arc;

use feeds_feed_models::feed_type::CustomSource;
use feeds_feed_models::item::Item;
use serde_json::Value;

use crate::ParseError;

/// Extracts one value from a parsed item.
pub trait CustomSourcePlugin: Send + Sync {
    /// Returns the custom source type id (e.g. `"csv"`).
    fn id(&self) -> &'static str;

    /// Returns the parser ids this plugin works with.
    fn supported_parsers(&self) -> &'static [&'static str];

    /// Resolves `source` against `item`. Missing values resolve to `null`.
    fn resolve(&self, source: &CustomSource, item: &Item) -> Value;
}

/// Reads a CSV column by header name (case-insensitively) or, for files
/// without a header, by column index.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvColumnSource;

impl CustomSourcePlugin for CsvColumnSource {
    fn id(&self) -> &'static str {
        "csv"
    }

    fn supported_parsers(&self) -> &'static [&'static str] {
        &["csv"]
    }

    fn resolve(&self, source: &CustomSource, item: &Item) -> Value {
        let column = source.value.trim();
        item.get(column)
            .or_else(|| {
                item.iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(column))
                    .map(|(_, value)| value)
            })
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Reads a value from a JSON record by dot-path (`a.b[0].c`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPathSource;

impl CustomSourcePlugin for JsonPathSource {
    fn id(&self) -> &'static str {
        "json"
    }

    fn supported_parsers(&self) -> &'static [&'static str] {
        &["json"]
    }

    fn resolve(&self, source: &CustomSource, item: &Item) -> Value {
        let record = item.to_value();
        resolve_path(&record, source.value.trim())
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Always empty; a placeholder target for later processing.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlankSource;

impl CustomSourcePlugin for BlankSource {
    fn id(&self) -> &'static str {
        "blank"
    }

    fn supported_parsers(&self) -> &'static [&'static str] {
        &["csv", "json"]
    }

    fn resolve(&self, _source: &CustomSource, _item: &Item) -> Value {
        Value::Null
    }
}

/// Splits `name[0][2]` into `("name", [0, 2])`.
fn split_indexes(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(open) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };
    let (name, mut rest) = segment.split_at(open);
    let mut indexes = Vec::new();
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        indexes.push(inner[..close].trim().parse().ok()?);
        rest = &inner[close + 1..];
    }
    Some((name, indexes))
}

/// Resolves a dot-separated path with optional `[n]` array indexing.
///
/// A numeric segment also indexes into an array, so `items.0.id` and
/// `items[0].id` are equivalent. An empty path returns `value` itself.
#[must_use]
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    if path.is_empty() {
        return Some(current);
    }
    for segment in path.split('.') {
        let (name, indexes) = split_indexes(segment)?;
        if !name.is_empty() {
            current = match current {
                Value::Array(items) => items.get(name.parse::<usize>().ok()?)?,
                _ => current.get(name)?,
            };
        }
        for index in indexes {
            current = current.get(index)?;
        }
    }
    Some(current)
}

/// A feed type's custom sources bound to their plugins, in declaration
/// order.
#[derive(Clone, Default)]
pub struct SourceResolver {
    entries: Vec<(String, CustomSource, Arc<dyn CustomSourcePlugin>)>,
}

impl std::fmt::Debug for SourceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, source, _)| (name, &source.kind)))
            .finish()
    }
}

impl SourceResolver {
    /// Creates a resolver with no custom sources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a custom source.
    #[must_use]
    pub fn with_source(
        mut self,
        name: &str,
        source: CustomSource,
        plugin: Arc<dyn CustomSourcePlugin>,
    ) -> Self {
        self.entries.push((name.to_owned(), source, plugin));
        self
    }

    /// Returns the custom source names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _, _)| name.as_str())
    }

    /// Returns `true` if there are no custom sources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves every custom source against `item` as parsed, then stores
    /// the values on the item.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Item`] if a fixed-schema item does not declare
    /// a custom source name.
    pub fn apply(&self, item: &mut Item) -> Result<(), ParseError> {
        let values: Vec<(String, Value)> = self
            .entries
            .iter()
            .map(|(name, source, plugin)| (name.clone(), plugin.resolve(source, item)))
            .collect();
        for (name, value) in values {
            item.set(name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn csv_item(pairs: &[(&str, &str)]) -> Item {
        let mut item = Item::dynamic();
        for (k, v) in pairs {
            item.set(*k, json!(v)).unwrap();
        }
        item
    }

    #[test]
    fn csv_column_matches_case_insensitively() {
        let item = csv_item(&[("ID", "7"), ("Title", "Alpha")]);
        assert_eq!(
            CsvColumnSource.resolve(&CustomSource::new("csv", "title"), &item),
            json!("Alpha")
        );
        assert_eq!(
            CsvColumnSource.resolve(&CustomSource::new("csv", "missing"), &item),
            Value::Null
        );
    }

    #[test]
    fn csv_column_reads_index_without_header() {
        let item = csv_item(&[("0", "7"), ("1", "Alpha")]);
        assert_eq!(
            CsvColumnSource.resolve(&CustomSource::new("csv", "1"), &item),
            json!("Alpha")
        );
    }

    #[test]
    fn resolve_path_walks_objects_and_arrays() {
        let doc = json!({"a": {"b": [{"c": 1}, {"c": 2}]}, "list": [[10, 20]]});
        assert_eq!(resolve_path(&doc, "a.b[1].c"), Some(&json!(2)));
        assert_eq!(resolve_path(&doc, "a.b.0.c"), Some(&json!(1)));
        assert_eq!(resolve_path(&doc, "list[0][1]"), Some(&json!(20)));
        assert_eq!(resolve_path(&doc, ""), Some(&doc));
        assert_eq!(resolve_path(&doc, "a.x"), None);
        assert_eq!(resolve_path(&doc, "a.b[9]"), None);
        assert_eq!(resolve_path(&doc, "a.b[x]"), None);
    }

    #[test]
    fn resolver_reads_raw_values_before_writing() {
        let resolver = SourceResolver::new()
            .with_source("title", CustomSource::new("csv", "name"), Arc::new(CsvColumnSource))
            .with_source("name", CustomSource::new("csv", "title"), Arc::new(CsvColumnSource))
            .with_source("note", CustomSource::new("blank", ""), Arc::new(BlankSource));
        let mut item = csv_item(&[("title", "T"), ("name", "N")]);
        resolver.apply(&mut item).unwrap();
        assert_eq!(item.get("title"), Some(&json!("N")));
        assert_eq!(item.get("name"), Some(&json!("T")));
        assert_eq!(item.get("note"), Some(&Value::Null));
        assert_eq!(resolver.names().collect::<Vec<_>>(), vec!["title", "name", "note"]);
    }

    #[test]
    fn resolver_rejects_undeclared_names_on_fixed_items() {
        let resolver = SourceResolver::new().with_source(
            "guid",
            CustomSource::new("csv", "id"),
            Arc::new(CsvColumnSource),
        );
        let schema: Arc<[String]> = vec!["id".to_string()].into();
        let mut item = Item::with_schema(schema);
        item.set("id", json!("1")).unwrap();
        assert!(matches!(resolver.apply(&mut item), Err(ParseError::Item(_))));
    }

    #[test]
    fn plugins_declare_supported_parsers() {
        assert_eq!(CsvColumnSource.supported_parsers(), &["csv"]);
        assert_eq!(JsonPathSource.supported_parsers(), &["json"]);
        assert!(BlankSource.supported_parsers().contains(&"csv"));
    }
}
