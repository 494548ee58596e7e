//! Target entities created and updated by the processor.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EntityId, FeedId};

/// A record in the target entity collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Assigned by the store on first save.
    pub id: Option<EntityId>,
    /// Target collection (e.g. `"article"`).
    pub entity_type: String,
    /// Language code, if the collection is translatable.
    #[serde(default)]
    pub langcode: Option<String>,
    /// Unpublished entities stay stored but are hidden from consumers.
    pub published: bool,
    /// Field values.
    #[serde(default)]
    pub fields: IndexMap<String, Value>,
    /// Import provenance; `None` for entities not created by a feed.
    #[serde(default)]
    pub provenance: Option<Provenance>,
}

impl Entity {
    /// Creates an unsaved, published entity with no fields.
    #[must_use]
    pub fn new(entity_type: &str, langcode: Option<String>) -> Self {
        Self {
            id: None,
            entity_type: entity_type.to_owned(),
            langcode,
            published: true,
            fields: IndexMap::new(),
            provenance: None,
        }
    }

    /// Returns a field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Where an imported entity came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// The feed that last imported this entity.
    pub feed_id: FeedId,
    /// When the entity was last written by an import.
    pub imported: DateTime<Utc>,
    /// Hash of the mapped values at the last import.
    pub hash: String,
    /// Source-side identifier, taken from the first unique mapping.
    #[serde(default)]
    pub guid: Option<String>,
}
