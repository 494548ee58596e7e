//! Item filters applied between parsing and processing.

use feeds_feed_models::feed_type::{FEED_PROPERTY_PREFIX, FeedType};
use feeds_feed_models::item::{ParserResult, SkipItem, is_empty_value};

/// Drops items whose value for any of the configured sources is empty.
///
/// Feed properties never vary per item and are ignored.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    required: Vec<String>,
}

impl ItemFilter {
    /// Creates a filter from a feed type's `skip_if_empty` list.
    #[must_use]
    pub fn for_feed_type(feed_type: &FeedType) -> Self {
        Self::new(feed_type.skip_if_empty.iter().map(String::as_str))
    }

    /// Creates a filter requiring every source in `required`.
    pub fn new<'a>(required: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            required: required
                .into_iter()
                .filter(|source| !source.starts_with(FEED_PROPERTY_PREFIX))
                .map(str::to_owned)
                .collect(),
        }
    }

    /// Returns `true` if the filter never skips anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }

    /// Removes failing items from `items` in place and returns why each
    /// was skipped.
    pub fn apply(&self, items: &mut ParserResult) -> Vec<SkipItem> {
        if self.is_empty() {
            return Vec::new();
        }
        items.retain_with(|item| {
            for source in &self.required {
                if item.get(source).is_none_or(is_empty_value) {
                    return Err(SkipItem::new(format!("'{source}' is empty")));
                }
            }
            Ok(())
        })
    }
}
