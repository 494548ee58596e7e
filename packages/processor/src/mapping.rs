//! Mapping resolution and item hashing.

use feeds_feed_models::Feed;
use feeds_feed_models::feed_type::Mapping;
use feeds_feed_models::item::Item;
use indexmap::IndexMap;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Reads a feed property by name (`id`, `label`, `source`, `owner`).
#[must_use]
pub fn feed_property(feed: &Feed, name: &str) -> Option<Value> {
    match name {
        "id" => Some(Value::from(feed.id.0)),
        "label" => Some(Value::String(feed.label.clone())),
        "source" => Some(Value::String(feed.source.clone())),
        "owner" => Some(feed.owner.clone().map_or(Value::Null, Value::String)),
        _ => None,
    }
}

/// Resolves every mapping against `item`, keyed by target field in
/// mapping order.
///
/// Sources missing from the item resolve to `null`. A mapping with the
/// `trim` setting trims string values. When several mappings share a
/// target, the last one wins.
#[must_use]
pub fn map_item(mappings: &[Mapping], feed: &Feed, item: &Item) -> IndexMap<String, Value> {
    let mut values = IndexMap::with_capacity(mappings.len());
    for mapping in mappings {
        let mut value = match mapping.feed_property() {
            Some(property) => feed_property(feed, property),
            None => item.get(&mapping.source).cloned(),
        }
        .unwrap_or(Value::Null);

        if mapping.bool_setting("trim")
            && let Value::String(text) = &value
        {
            value = Value::String(text.trim().to_owned());
        }
        values.insert(mapping.target.clone(), value);
    }
    values
}

/// Hashes mapped values; equal values in equal order hash equally.
///
/// # Errors
///
/// Returns an error if the values cannot be serialized.
pub fn hash_values(values: &IndexMap<String, Value>) -> Result<String, serde_json::Error> {
    let encoded = serde_json::to_vec(values)?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// Renders a unique value as a GUID string.
#[must_use]
pub fn guid_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use feeds_feed_models::{FeedId, NewFeed};
    use serde_json::json;

    use super::*;

    fn feed() -> Feed {
        let mut draft = NewFeed::new("articles", "News", "https://example.com/a.csv");
        draft.owner = Some("editor".to_string());
        draft.into_feed(FeedId(9), DateTime::from_timestamp(0, 0).unwrap())
    }

    fn item() -> Item {
        let mut item = Item::dynamic();
        item.set("guid", json!("1")).unwrap();
        item.set("title", json!("  Alpha  ")).unwrap();
        item
    }

    #[test]
    fn maps_item_and_feed_sources_in_order() {
        let mut trimmed = Mapping::new("title", "title");
        trimmed.settings.insert("trim".to_string(), json!(true));
        let mappings = vec![
            Mapping::new("guid", "id").unique(),
            trimmed,
            Mapping::new("feed:owner", "author"),
            Mapping::new("feed:id", "feed"),
            Mapping::new("missing", "body"),
        ];
        let values = map_item(&mappings, &feed(), &item());
        assert_eq!(
            values.into_iter().collect::<Vec<_>>(),
            vec![
                ("id".to_string(), json!("1")),
                ("title".to_string(), json!("Alpha")),
                ("author".to_string(), json!("editor")),
                ("feed".to_string(), json!(9)),
                ("body".to_string(), Value::Null),
            ]
        );
    }

    #[test]
    fn hash_changes_with_values() {
        let mappings = vec![Mapping::new("title", "title")];
        let first = hash_values(&map_item(&mappings, &feed(), &item())).unwrap();
        let again = hash_values(&map_item(&mappings, &feed(), &item())).unwrap();
        assert_eq!(first, again);
        assert_eq!(first.len(), 64);

        let mut changed = item();
        changed.set("title", json!("Beta")).unwrap();
        assert_ne!(first, hash_values(&map_item(&mappings, &feed(), &changed)).unwrap());
    }

    #[test]
    fn guids_render_scalars() {
        assert_eq!(guid_of(&json!("a")), Some("a".to_string()));
        assert_eq!(guid_of(&json!(7)), Some("7".to_string()));
        assert_eq!(guid_of(&Value::Null), None);
    }
}
