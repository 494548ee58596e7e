//! What happens to entities a feed no longer provides.

use std::fmt;
use std::str::FromStr;

use feeds_database::EntityStore;
use feeds_feed_models::entity::Entity;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CleanPlugin, ProcessError};

const CUSTOM_PREFIX: &str = "custom:";

/// The `update_non_existent` setting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CleanAction {
    /// Leave stale entities alone; the clean stage is skipped.
    #[default]
    Keep,
    /// Delete stale entities.
    Delete,
    /// Unpublish stale entities.
    Unpublish,
    /// Hand stale entities to a [`CleanPlugin`] by id.
    Custom(String),
}

impl CleanAction {
    /// Returns `true` if this action requires a clean stage.
    #[must_use]
    pub const fn cleans(&self) -> bool {
        !matches!(self, Self::Keep)
    }
}

impl fmt::Display for CleanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keep => f.write_str("keep"),
            Self::Delete => f.write_str("delete"),
            Self::Unpublish => f.write_str("unpublish"),
            Self::Custom(id) => write!(f, "{CUSTOM_PREFIX}{id}"),
        }
    }
}

impl FromStr for CleanAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep" => Ok(Self::Keep),
            "delete" => Ok(Self::Delete),
            "unpublish" => Ok(Self::Unpublish),
            other => match other.strip_prefix(CUSTOM_PREFIX) {
                Some(id) if !id.is_empty() => Ok(Self::Custom(id.to_owned())),
                _ => Err(format!(
                    "unknown clean action {other:?} (expected keep, delete, unpublish, or custom:<id>)"
                )),
            },
        }
    }
}

impl TryFrom<String> for CleanAction {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CleanAction> for String {
    fn from(value: CleanAction) -> Self {
        value.to_string()
    }
}

/// Marks stale entities with a boolean field instead of removing them.
#[derive(Debug, Clone)]
pub struct FlagStale {
    field: String,
}

impl FlagStale {
    /// Registry id of this plugin.
    pub const ID: &'static str = "flag_stale";

    /// Creates the plugin writing `true` into `field`.
    #[must_use]
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_owned(),
        }
    }
}

impl Default for FlagStale {
    fn default() -> Self {
        Self::new("stale")
    }
}

impl CleanPlugin for FlagStale {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn clean(&self, entities: &dyn EntityStore, mut entity: Entity) -> Result<(), ProcessError> {
        if entity.field(&self.field) == Some(&Value::Bool(true)) {
            return Ok(());
        }
        entity.fields.insert(self.field.clone(), Value::Bool(true));
        entities.save_entity(&entity)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use feeds_database::memory::MemoryStore;

    use super::*;

    #[test]
    fn parses_actions() {
        assert_eq!("keep".parse(), Ok(CleanAction::Keep));
        assert_eq!("unpublish".parse(), Ok(CleanAction::Unpublish));
        assert_eq!(
            "custom:flag_stale".parse(),
            Ok(CleanAction::Custom("flag_stale".to_string()))
        );
        assert!("custom:".parse::<CleanAction>().is_err());
        assert!("archive".parse::<CleanAction>().is_err());
        assert!(!CleanAction::Keep.cleans());
        assert!(CleanAction::Delete.cleans());
    }

    #[test]
    fn deserializes_from_settings() {
        let action: CleanAction = serde_json::from_value(serde_json::json!("delete")).unwrap();
        assert_eq!(action, CleanAction::Delete);
        assert!(serde_json::from_value::<CleanAction>(serde_json::json!("nope")).is_err());
        assert_eq!(
            serde_json::to_value(CleanAction::Custom("x".to_string())).unwrap(),
            serde_json::json!("custom:x")
        );
    }

    #[test]
    fn flag_stale_sets_field() {
        let store = MemoryStore::new();
        let id = store.save_entity(&Entity::new("article", None)).unwrap();
        let entity = store.load_entity(id).unwrap().unwrap();

        FlagStale::default().clean(&store, entity).unwrap();
        let flagged = store.load_entity(id).unwrap().unwrap();
        assert_eq!(flagged.field("stale"), Some(&Value::Bool(true)));
        assert!(flagged.published);
    }
}
