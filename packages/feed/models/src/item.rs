//! Parsed records and the collection a parser returns.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors raised when mutating an [`Item`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemError {
    /// A fixed-schema item was asked to store a field it does not declare.
    #[error("Field '{field}' is not declared by this item's schema")]
    UndeclaredField {
        /// The rejected field name.
        field: String,
    },
}

/// Signal raised by an item filter to drop one item from a
/// [`ParserResult`]. Not an error: the rest of the batch continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Item skipped: {reason}")]
pub struct SkipItem {
    /// Why the item was skipped.
    pub reason: String,
}

impl SkipItem {
    /// Creates a skip signal with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// One parsed record: an ordered map of field name to value.
///
/// Items built with [`Item::with_schema`] only accept declared fields;
/// items built with [`Item::dynamic`] accept anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    fields: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema: Option<Arc<[String]>>,
}

impl Item {
    /// Creates an item that accepts any field.
    #[must_use]
    pub fn dynamic() -> Self {
        Self::default()
    }

    /// Creates an item restricted to the given field names.
    #[must_use]
    pub fn with_schema(schema: Arc<[String]>) -> Self {
        Self {
            fields: IndexMap::new(),
            schema: Some(schema),
        }
    }

    /// Creates a dynamic item from an existing map.
    #[must_use]
    pub const fn from_fields(fields: IndexMap<String, Value>) -> Self {
        Self {
            fields,
            schema: None,
        }
    }

    /// Returns `true` if this item only accepts declared fields.
    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        self.schema.is_some()
    }

    /// Returns `true` if the item can store `field`.
    #[must_use]
    pub fn accepts(&self, field: &str) -> bool {
        self.schema
            .as_ref()
            .is_none_or(|schema| schema.iter().any(|f| f == field))
    }

    /// Sets a field value.
    ///
    /// # Errors
    ///
    /// Returns [`ItemError::UndeclaredField`] if this is a fixed-schema
    /// item and `field` is not part of its schema.
    pub fn set(&mut self, field: impl Into<String>, value: Value) -> Result<(), ItemError> {
        let field = field.into();
        if !self.accepts(&field) {
            return Err(ItemError::UndeclaredField { field });
        }
        self.fields.insert(field, value);
        Ok(())
    }

    /// Returns a field value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns a field value as a string slice, if it is a JSON string.
    #[must_use]
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field)?.as_str()
    }

    /// Iterates fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Returns the number of fields set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the item as a JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Returns the underlying map.
    #[must_use]
    pub fn into_fields(self) -> IndexMap<String, Value> {
        self.fields
    }
}

/// Returns `true` for values treated as absent: `null`, blank strings,
/// and empty arrays.
#[must_use]
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Ordered, indexable, mutable collection of items returned by a parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParserResult {
    items: Vec<Item>,
}

impl ParserResult {
    /// Creates an empty result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an item.
    pub fn push(&mut self, item: Item) {
        self.items.push(item);
    }

    /// Returns the number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if there are no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the item at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Item> {
        self.items.get(index)
    }

    /// Returns the item at `index` mutably.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Item> {
        self.items.get_mut(index)
    }

    /// Removes and returns the item at `index`, shifting later items down.
    pub fn remove(&mut self, index: usize) -> Option<Item> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    /// Iterates items in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Item> {
        self.items.iter()
    }

    /// Visits every item in order, letting `visit` mutate it or skip it.
    ///
    /// An item for which `visit` returns [`SkipItem`] is removed in place;
    /// iteration continues with the item that followed it. Returns the
    /// skip signals in the order they were raised.
    pub fn retain_with<F>(&mut self, mut visit: F) -> Vec<SkipItem>
    where
        F: FnMut(&mut Item) -> Result<(), SkipItem>,
    {
        let mut skipped = Vec::new();
        let mut index = 0;
        while index < self.items.len() {
            match visit(&mut self.items[index]) {
                Ok(()) => index += 1,
                Err(skip) => {
                    self.items.remove(index);
                    skipped.push(skip);
                }
            }
        }
        skipped
    }

    /// Consumes the result and returns its items.
    #[must_use]
    pub fn into_items(self) -> Vec<Item> {
        self.items
    }
}

impl From<Vec<Item>> for ParserResult {
    fn from(items: Vec<Item>) -> Self {
        Self { items }
    }
}

impl IntoIterator for ParserResult {
    type Item = Item;
    type IntoIter = std::vec::IntoIter<Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a ParserResult {
    type Item = &'a Item;
    type IntoIter = std::slice::Iter<'a, Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
