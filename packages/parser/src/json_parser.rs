//! JSON document parser.
//!
//! Reads the whole document and yields one dynamic item per record. The
//! records are found at `records_path` (a dot-path, see
//! [`crate::sources::resolve_path`]); an array yields one item per element,
//! an object yields a single item, and a scalar is wrapped as
//! `{"value": ...}`.

use std::sync::Arc;

use feeds_feed_models::Feed;
use feeds_feed_models::fetched::FetcherResult;
use feeds_feed_models::item::{Item, ParserResult};
use feeds_feed_models::state::State;
use feeds_time::Clock;
use serde::Deserialize;
use serde_json::Value;

use crate::sources::{SourceResolver, resolve_path};
use crate::{MappingSource, ParseError, Parser};

/// Settings of the `json` parser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JsonSettings {
    /// Dot-path to the records; the document root when unset.
    pub records_path: Option<String>,
}

/// Parses a JSON document into dynamic items.
#[derive(Debug, Clone)]
pub struct JsonParser {
    settings: JsonSettings,
    resolver: SourceResolver,
    clock: Arc<dyn Clock>,
}

impl JsonParser {
    /// Custom source types this parser resolves.
    pub const CUSTOM_SOURCE_TYPES: &'static [&'static str] = &["json", "blank"];

    /// Creates a JSON parser.
    #[must_use]
    pub const fn new(
        settings: JsonSettings,
        resolver: SourceResolver,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            resolver,
            clock,
        }
    }

    fn to_item(&self, record: Value) -> Result<Item, ParseError> {
        let mut item = Item::dynamic();
        match record {
            Value::Object(fields) => {
                for (name, value) in fields {
                    item.set(name, value)?;
                }
            }
            scalar => item.set("value", scalar)?,
        }
        self.resolver.apply(&mut item)?;
        Ok(item)
    }
}

impl Parser for JsonParser {
    fn id(&self) -> &'static str {
        "json"
    }

    fn parse(
        &self,
        feed: &Feed,
        fetched: &FetcherResult,
        state: &mut State,
    ) -> Result<ParserResult, ParseError> {
        let bytes = fetched.sanitized_bytes()?;
        let document: Value = serde_json::from_slice(&bytes)?;

        let records = match self.settings.records_path.as_deref() {
            None | Some("") => document,
            Some(path) => resolve_path(&document, path).cloned().ok_or_else(|| {
                ParseError::InvalidInput {
                    message: format!("records path {path:?} not found in document"),
                }
            })?,
        };

        let records = match records {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };

        let mut result = ParserResult::new();
        for record in records {
            result.push(self.to_item(record)?);
        }

        let now = self.clock.now();
        state.set_total(result.len() as u64);
        state.complete(now);
        log::debug!("Feed {}: parsed {} JSON records", feed.id, result.len());
        Ok(result)
    }

    fn mapping_sources(&self) -> Vec<MappingSource> {
        Vec::new()
    }

    fn custom_source_types(&self) -> &'static [&'static str] {
        Self::CUSTOM_SOURCE_TYPES
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use feeds_feed_models::feed_type::CustomSource;
    use feeds_feed_models::{FeedId, NewFeed};
    use feeds_time::SystemClock;
    use serde_json::json;

    use super::*;
    use crate::sources::JsonPathSource;

    fn feed() -> Feed {
        NewFeed::new("events", "Events", "inline")
            .into_feed(FeedId(3), DateTime::from_timestamp(0, 0).unwrap())
    }

    fn parser(records_path: Option<&str>) -> JsonParser {
        let resolver = SourceResolver::new()
            .with_source("guid", CustomSource::new("json", "id"), Arc::new(JsonPathSource))
            .with_source(
                "city",
                CustomSource::new("json", "venue.address.city"),
                Arc::new(JsonPathSource),
            );
        JsonParser::new(
            JsonSettings {
                records_path: records_path.map(str::to_owned),
            },
            resolver,
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn extracts_records_at_path_and_resolves_sources() {
        let doc = json!({
            "data": {"events": [
                {"id": 1, "venue": {"address": {"city": "Lincoln"}}},
                {"id": 2},
            ]}
        });
        let fetched = FetcherResult::raw(serde_json::to_vec(&doc).unwrap());
        let mut state = State::default();
        let result = parser(Some("data.events"))
            .parse(&feed(), &fetched, &mut state)
            .unwrap();

        assert_eq!(result.len(), 2);
        let first = result.get(0).unwrap();
        assert!(!first.is_fixed());
        assert_eq!(first.get("guid"), Some(&json!(1)));
        assert_eq!(first.get("city"), Some(&json!("Lincoln")));
        assert_eq!(result.get(1).unwrap().get("city"), Some(&Value::Null));
        assert!(state.completed);
        assert_eq!(state.total, Some(2));
    }

    #[test]
    fn root_object_and_scalars_become_items() {
        let fetched = FetcherResult::raw(b"\xEF\xBB\xBF{\"id\": \"x\"}".to_vec());
        let result = parser(None)
            .parse(&feed(), &fetched, &mut State::default())
            .unwrap();
        assert_eq!(result.get(0).unwrap().get("guid"), Some(&json!("x")));

        let fetched = FetcherResult::raw(b"[1, 2]".to_vec());
        let result = parser(None)
            .parse(&feed(), &fetched, &mut State::default())
            .unwrap();
        assert_eq!(result.get(1).unwrap().get("value"), Some(&json!(2)));
    }

    #[test]
    fn indexed_records_path_is_resolved() {
        let fetched = FetcherResult::raw(br#"{"pages": [{"rows": [{"id": 5}]}]}"#.to_vec());
        let result = parser(Some("pages[0].rows"))
            .parse(&feed(), &fetched, &mut State::default())
            .unwrap();
        assert_eq!(result.get(0).unwrap().get("guid"), Some(&json!(5)));
    }

    #[test]
    fn missing_path_and_malformed_input_fail() {
        let fetched = FetcherResult::raw(b"{\"a\": []}".to_vec());
        assert!(matches!(
            parser(Some("b")).parse(&feed(), &fetched, &mut State::default()),
            Err(ParseError::InvalidInput { .. })
        ));

        let mut state = State::default();
        let fetched = FetcherResult::raw(b"{not json".to_vec());
        assert!(matches!(
            parser(None).parse(&feed(), &fetched, &mut state),
            Err(ParseError::Json(_))
        ));
        assert!(!state.completed);
    }
}
