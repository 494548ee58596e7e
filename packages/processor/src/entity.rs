//! The `entity` processor.
//!
//! Matches each item against existing entities through the feed type's
//! unique mappings (in declaration order, first match wins) and then
//! inserts, skips, replaces, or updates according to its settings. Every
//! written entity carries [`Provenance`] so later imports can find, clean,
//! and expire it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use feeds_database::EntityStore;
use feeds_feed_models::entity::{Entity, Provenance};
use feeds_feed_models::feed_type::Mapping;
use feeds_feed_models::item::{Item, is_empty_value};
use feeds_feed_models::state::State;
use feeds_feed_models::{EntityId, Feed};
use feeds_time::Clock;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clean::CleanAction;
use crate::mapping::{guid_of, hash_values, map_item};
use crate::{CleanPlugin, ItemOutcome, ProcessError, Processor};

/// Value of [`EntitySettings::expire`] that disables expiry.
pub const EXPIRE_NEVER: i64 = -1;

/// What to do with an item that matches an existing entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateExisting {
    /// Leave the entity untouched.
    #[default]
    Skip,
    /// Overwrite every mapped field, clearing those the item lacks.
    /// Fields no mapping targets are kept.
    Replace,
    /// Write only the mapped values the item provides; other fields stay.
    Update,
}

/// Settings of the `entity` processor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EntitySettings {
    /// Target collection.
    pub entity_type: String,
    /// Create entities for items with no match.
    pub insert_new: bool,
    /// Policy for items that match an existing entity.
    pub update_existing: UpdateExisting,
    /// Policy for entities the current import no longer provides.
    pub update_non_existent: CleanAction,
    /// Seconds after their last import before entities are deleted;
    /// `-1` never expires.
    pub expire: i64,
    /// Write matched entities even when their content hash is unchanged.
    pub skip_hash_check: bool,
    /// Restricts matching to this language and stamps new entities.
    pub langcode: Option<String>,
}

impl Default for EntitySettings {
    fn default() -> Self {
        Self {
            entity_type: String::new(),
            insert_new: true,
            update_existing: UpdateExisting::Skip,
            update_non_existent: CleanAction::Keep,
            expire: EXPIRE_NEVER,
            skip_hash_check: false,
            langcode: None,
        }
    }
}

/// Upserts items into an [`EntityStore`].
pub struct EntityProcessor {
    settings: EntitySettings,
    mappings: Vec<Mapping>,
    entities: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    clean_plugin: Option<Arc<dyn CleanPlugin>>,
}

impl std::fmt::Debug for EntityProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityProcessor")
            .field("settings", &self.settings)
            .field("mappings", &self.mappings.len())
            .finish_non_exhaustive()
    }
}

impl EntityProcessor {
    /// Creates an entity processor.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::InvalidSettings`] if no entity type is set,
    /// the expiry is negative but not `-1`, or a custom clean action is
    /// configured without a matching plugin.
    pub fn new(
        settings: EntitySettings,
        mappings: Vec<Mapping>,
        entities: Arc<dyn EntityStore>,
        clock: Arc<dyn Clock>,
        clean_plugin: Option<Arc<dyn CleanPlugin>>,
    ) -> Result<Self, ProcessError> {
        if settings.entity_type.trim().is_empty() {
            return Err(ProcessError::InvalidSettings {
                message: "entity_type is required".to_owned(),
            });
        }
        if settings.expire < EXPIRE_NEVER {
            return Err(ProcessError::InvalidSettings {
                message: format!("expire must be -1 or at least 0, got {}", settings.expire),
            });
        }
        if let CleanAction::Custom(id) = &settings.update_non_existent
            && clean_plugin.as_ref().is_none_or(|p| p.id() != id)
        {
            return Err(ProcessError::InvalidSettings {
                message: format!("no clean plugin registered as {id:?}"),
            });
        }
        Ok(Self {
            settings,
            mappings,
            entities,
            clock,
            clean_plugin,
        })
    }

    /// Returns the processor settings.
    #[must_use]
    pub const fn settings(&self) -> &EntitySettings {
        &self.settings
    }

    /// Finds an existing entity through the unique mappings.
    fn find_existing(
        &self,
        values: &IndexMap<String, Value>,
    ) -> Result<Option<EntityId>, ProcessError> {
        for mapping in self.mappings.iter().filter(|m| m.unique) {
            let Some(value) = values.get(&mapping.target) else {
                continue;
            };
            if is_empty_value(value) {
                continue;
            }
            if let Some(id) = self.entities.find_entity_by_field(
                &self.settings.entity_type,
                self.settings.langcode.as_deref(),
                &mapping.target,
                value,
            )? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    fn guid(&self, values: &IndexMap<String, Value>) -> Option<String> {
        self.mappings
            .iter()
            .find(|m| m.unique)
            .and_then(|m| values.get(&m.target))
            .and_then(guid_of)
    }

    fn provenance(
        &self,
        feed: &Feed,
        values: &IndexMap<String, Value>,
        hash: String,
        now: DateTime<Utc>,
    ) -> Provenance {
        Provenance {
            feed_id: feed.id,
            imported: now,
            hash,
            guid: self.guid(values),
        }
    }
}

impl Processor for EntityProcessor {
    fn id(&self) -> &'static str {
        "entity"
    }

    fn process(
        &self,
        feed: &Feed,
        item: &Item,
        state: &mut State,
    ) -> Result<ItemOutcome, ProcessError> {
        let values = map_item(&self.mappings, feed, item);
        let hash = hash_values(&values)?;
        let now = self.clock.now();

        let outcome = match self.find_existing(&values)? {
            None if !self.settings.insert_new => ItemOutcome::SkippedNew,
            None => {
                let mut entity =
                    Entity::new(&self.settings.entity_type, self.settings.langcode.clone());
                entity.provenance = Some(self.provenance(feed, &values, hash, now));
                entity.fields = values;
                ItemOutcome::Created(self.entities.save_entity(&entity)?)
            }
            Some(id) if self.settings.update_existing == UpdateExisting::Skip => {
                ItemOutcome::SkippedExisting(id)
            }
            Some(id) => {
                let Some(mut entity) = self.entities.load_entity(id)? else {
                    return Err(ProcessError::Database(
                        feeds_database::DbError::NotFound {
                            kind: "entity",
                            id: id.to_string(),
                        },
                    ));
                };
                let unchanged = !self.settings.skip_hash_check
                    && entity.published
                    && entity
                        .provenance
                        .as_ref()
                        .is_some_and(|p| p.feed_id == feed.id && p.hash == hash);
                if unchanged {
                    ItemOutcome::Unchanged(id)
                } else {
                    if self.settings.update_existing == UpdateExisting::Replace {
                        // Every mapped target is written, nulls included;
                        // fields no mapping targets are left alone.
                        entity.fields.extend(values.clone());
                    } else {
                        entity.fields.extend(
                            values
                                .iter()
                                .filter(|(_, v)| !v.is_null())
                                .map(|(k, v)| (k.clone(), v.clone())),
                        );
                    }
                    entity.published = true;
                    entity.provenance = Some(self.provenance(feed, &values, hash, now));
                    self.entities.save_entity(&entity)?;
                    ItemOutcome::Updated(id)
                }
            }
        };

        outcome.count(state);
        state.advance(1, now);
        log::trace!("Feed {}: item processed: {outcome:?}", feed.id);
        Ok(outcome)
    }

    fn post_process(&self, feed: &Feed, state: &State) -> Result<u64, ProcessError> {
        let count = self.entities.count_entities_for_feed(feed.id)?;
        let c = &state.counters;
        log::info!(
            "Feed {}: {} created, {} updated, {} unchanged, {} skipped; feed owns {count} {}",
            feed.id,
            c.created,
            c.updated,
            c.unchanged,
            c.skipped,
            self.settings.entity_type,
        );
        Ok(count)
    }

    fn clean_candidates(&self, feed: &Feed) -> Result<Option<Vec<EntityId>>, ProcessError> {
        if !self.settings.update_non_existent.cleans() {
            return Ok(None);
        }
        Ok(Some(self.entities.entity_ids_for_feed(feed.id)?))
    }

    fn clean(&self, feed: &Feed, id: EntityId, state: &mut State) -> Result<(), ProcessError> {
        let Some(mut entity) = self.entities.load_entity(id)? else {
            log::debug!("Feed {}: stale entity {id} is already gone", feed.id);
            return Ok(());
        };

        match &self.settings.update_non_existent {
            CleanAction::Keep => {}
            CleanAction::Delete => {
                if self.entities.delete_entity(id)? {
                    state.counters.deleted += 1;
                }
            }
            CleanAction::Unpublish => {
                if entity.published {
                    entity.published = false;
                    self.entities.save_entity(&entity)?;
                    state.counters.unpublished += 1;
                }
            }
            CleanAction::Custom(plugin_id) => {
                let plugin = self.clean_plugin.as_ref().ok_or_else(|| ProcessError::Clean {
                    plugin: plugin_id.clone(),
                    message: "plugin not registered".to_owned(),
                })?;
                plugin.clean(self.entities.as_ref(), entity)?;
            }
        }
        Ok(())
    }

    fn expired_ids(
        &self,
        feed: &Feed,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<EntityId>>, ProcessError> {
        if self.settings.expire == EXPIRE_NEVER {
            return Ok(None);
        }
        let cutoff = now - Duration::seconds(self.settings.expire);
        Ok(Some(self.entities.entity_ids_imported_before(feed.id, cutoff)?))
    }

    fn expire_item(
        &self,
        feed: &Feed,
        id: EntityId,
        state: &mut State,
    ) -> Result<(), ProcessError> {
        if self.entities.delete_entity(id)? {
            state.counters.deleted += 1;
            log::debug!("Feed {}: expired entity {id}", feed.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use feeds_database::memory::MemoryStore;
    use feeds_feed_models::{FeedId, NewFeed};
    use feeds_time::ManualClock;
    use serde_json::json;

    use super::*;
    use crate::clean::FlagStale;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        feed: Feed,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::at_timestamp(1_000_000));
            let feed = NewFeed::new("articles", "Articles", "inline")
                .into_feed(FeedId(1), clock.now());
            Self {
                store: Arc::new(MemoryStore::new()),
                clock,
                feed,
            }
        }

        fn processor(&self, settings: EntitySettings) -> EntityProcessor {
            EntityProcessor::new(
                settings,
                vec![
                    Mapping::new("guid", "guid").unique(),
                    Mapping::new("title", "title"),
                    Mapping::new("body", "body"),
                ],
                self.store.clone(),
                self.clock.clone(),
                Some(Arc::new(FlagStale::default())),
            )
            .unwrap()
        }
    }

    fn settings(update_existing: UpdateExisting) -> EntitySettings {
        EntitySettings {
            entity_type: "article".to_string(),
            update_existing,
            ..EntitySettings::default()
        }
    }

    fn item(guid: &str, title: &str) -> Item {
        let mut item = Item::dynamic();
        item.set("guid", json!(guid)).unwrap();
        item.set("title", json!(title)).unwrap();
        item
    }

    #[test]
    fn same_source_twice_never_duplicates() {
        let fx = Fixture::new();
        let processor = fx.processor(settings(UpdateExisting::Update));
        let mut state = State::default();

        let first = processor.process(&fx.feed, &item("1", "Alpha"), &mut state).unwrap();
        let again = processor.process(&fx.feed, &item("1", "Alpha"), &mut state).unwrap();
        assert!(matches!(first, ItemOutcome::Created(_)));
        assert_eq!(again, ItemOutcome::Unchanged(first.entity_id().unwrap()));
        assert_eq!(fx.store.count_entities_for_feed(fx.feed.id).unwrap(), 1);
        assert_eq!(state.progress, 2);

        let skipping = fx.processor(settings(UpdateExisting::Skip));
        let outcome = skipping.process(&fx.feed, &item("1", "Changed"), &mut state).unwrap();
        assert!(matches!(outcome, ItemOutcome::SkippedExisting(_)));
        assert_eq!(fx.store.count_entities_for_feed(fx.feed.id).unwrap(), 1);
    }

    #[test]
    fn update_merges_and_replace_overwrites() {
        let fx = Fixture::new();
        let mut state = State::default();
        let mut full = item("1", "Alpha");
        full.set("body", json!("text")).unwrap();
        let id = fx
            .processor(settings(UpdateExisting::Update))
            .process(&fx.feed, &full, &mut state)
            .unwrap()
            .entity_id()
            .unwrap();

        let mut entity = fx.store.load_entity(id).unwrap().unwrap();
        entity.fields.insert("extra".to_string(), json!("kept"));
        fx.store.save_entity(&entity).unwrap();

        fx.processor(settings(UpdateExisting::Update))
            .process(&fx.feed, &item("1", "Beta"), &mut state)
            .unwrap();
        let updated = fx.store.load_entity(id).unwrap().unwrap();
        assert_eq!(updated.field("title"), Some(&json!("Beta")));
        assert_eq!(updated.field("body"), Some(&json!("text")));
        assert_eq!(updated.field("extra"), Some(&json!("kept")));

        let outcome = fx
            .processor(settings(UpdateExisting::Replace))
            .process(&fx.feed, &item("1", "Gamma"), &mut state)
            .unwrap();
        assert_eq!(outcome, ItemOutcome::Updated(id));
        let replaced = fx.store.load_entity(id).unwrap().unwrap();
        assert_eq!(replaced.field("title"), Some(&json!("Gamma")));
        assert_eq!(replaced.field("body"), Some(&Value::Null));
        assert_eq!(replaced.field("extra"), Some(&json!("kept")));
        assert_eq!(state.counters.updated, 2);
    }

    #[test]
    fn replace_keeps_fields_no_mapping_targets() {
        let fx = Fixture::new();
        let processor = fx.processor(settings(UpdateExisting::Replace));
        let mut state = State::default();
        let id = processor
            .process(&fx.feed, &item("7", "First"), &mut state)
            .unwrap()
            .entity_id()
            .unwrap();

        let mut entity = fx.store.load_entity(id).unwrap().unwrap();
        entity
            .fields
            .insert("editor_note".to_string(), json!("keep me"));
        fx.store.save_entity(&entity).unwrap();

        processor
            .process(&fx.feed, &item("7", "Second"), &mut state)
            .unwrap();
        let replaced = fx.store.load_entity(id).unwrap().unwrap();
        assert_eq!(replaced.field("title"), Some(&json!("Second")));
        assert_eq!(replaced.field("editor_note"), Some(&json!("keep me")));
    }

    #[test]
    fn first_unique_mapping_wins() {
        let fx = Fixture::new();
        let mut state = State::default();
        for (guid, url) in [("a", "u1"), ("b", "u2")] {
            let mut entity = Entity::new("article", None);
            entity.fields.insert("guid".to_string(), json!(guid));
            entity.fields.insert("url".to_string(), json!(url));
            fx.store.save_entity(&entity).unwrap();
        }
        let processor = EntityProcessor::new(
            settings(UpdateExisting::Update),
            vec![
                Mapping::new("guid", "guid").unique(),
                Mapping::new("url", "url").unique(),
            ],
            fx.store.clone(),
            fx.clock.clone(),
            None,
        )
        .unwrap();

        let mut both = item("b", "x");
        both.set("url", json!("u1")).unwrap();
        let outcome = processor.process(&fx.feed, &both, &mut state).unwrap();
        assert_eq!(outcome, ItemOutcome::Updated(EntityId(2)));

        let mut url_only = item("", "x");
        url_only.set("url", json!("u1")).unwrap();
        let outcome = processor.process(&fx.feed, &url_only, &mut state).unwrap();
        assert_eq!(outcome, ItemOutcome::Updated(EntityId(1)));
    }

    #[test]
    fn new_items_can_be_skipped() {
        let fx = Fixture::new();
        let processor = fx.processor(EntitySettings {
            insert_new: false,
            ..settings(UpdateExisting::Update)
        });
        let mut state = State::default();
        let outcome = processor.process(&fx.feed, &item("1", "Alpha"), &mut state).unwrap();
        assert_eq!(outcome, ItemOutcome::SkippedNew);
        assert_eq!(state.counters.skipped, 1);
        assert_eq!(state.progress, 1);
    }

    #[test]
    fn hash_check_can_be_disabled() {
        let fx = Fixture::new();
        let processor = fx.processor(EntitySettings {
            skip_hash_check: true,
            ..settings(UpdateExisting::Update)
        });
        let mut state = State::default();
        processor.process(&fx.feed, &item("1", "Alpha"), &mut state).unwrap();
        let again = processor.process(&fx.feed, &item("1", "Alpha"), &mut state).unwrap();
        assert!(matches!(again, ItemOutcome::Updated(_)));
    }

    #[test]
    fn langcode_scopes_matching_and_stamps_entities() {
        let fx = Fixture::new();
        let mut state = State::default();
        let english = fx.processor(EntitySettings {
            langcode: Some("en".to_string()),
            ..settings(UpdateExisting::Update)
        });
        let german = fx.processor(EntitySettings {
            langcode: Some("de".to_string()),
            ..settings(UpdateExisting::Update)
        });
        let en = english.process(&fx.feed, &item("1", "Hello"), &mut state).unwrap();
        let de = german.process(&fx.feed, &item("1", "Hallo"), &mut state).unwrap();
        assert!(matches!(de, ItemOutcome::Created(_)));
        assert_ne!(en.entity_id(), de.entity_id());
        let stored = fx.store.load_entity(de.entity_id().unwrap()).unwrap().unwrap();
        assert_eq!(stored.langcode.as_deref(), Some("de"));
        assert_eq!(stored.provenance.unwrap().guid.as_deref(), Some("1"));
    }

    #[test]
    fn clean_actions() {
        let fx = Fixture::new();
        let mut state = State::default();
        let seed = fx.processor(settings(UpdateExisting::Update));
        let ids: Vec<EntityId> = ["1", "2", "3"]
            .iter()
            .map(|g| {
                seed.process(&fx.feed, &item(g, "t"), &mut state)
                    .unwrap()
                    .entity_id()
                    .unwrap()
            })
            .collect();
        assert_eq!(seed.clean_candidates(&fx.feed).unwrap(), None);

        let mut clean_state = State::default();
        let unpublish = fx.processor(EntitySettings {
            update_non_existent: CleanAction::Unpublish,
            ..settings(UpdateExisting::Update)
        });
        assert_eq!(unpublish.clean_candidates(&fx.feed).unwrap(), Some(ids.clone()));
        unpublish.clean(&fx.feed, ids[0], &mut clean_state).unwrap();
        unpublish.clean(&fx.feed, ids[0], &mut clean_state).unwrap();
        assert!(!fx.store.load_entity(ids[0]).unwrap().unwrap().published);
        assert_eq!(clean_state.counters.unpublished, 1);

        let delete = fx.processor(EntitySettings {
            update_non_existent: CleanAction::Delete,
            ..settings(UpdateExisting::Update)
        });
        delete.clean(&fx.feed, ids[1], &mut clean_state).unwrap();
        delete.clean(&fx.feed, ids[1], &mut clean_state).unwrap();
        assert_eq!(fx.store.load_entity(ids[1]).unwrap(), None);
        assert_eq!(clean_state.counters.deleted, 1);

        let custom = fx.processor(EntitySettings {
            update_non_existent: CleanAction::Custom(FlagStale::ID.to_string()),
            ..settings(UpdateExisting::Update)
        });
        custom.clean(&fx.feed, ids[2], &mut clean_state).unwrap();
        let flagged = fx.store.load_entity(ids[2]).unwrap().unwrap();
        assert_eq!(flagged.field("stale"), Some(&json!(true)));

        // a reappearing item republishes its entity
        let outcome = unpublish
            .process(&fx.feed, &item("1", "back"), &mut state)
            .unwrap();
        assert_eq!(outcome, ItemOutcome::Updated(ids[0]));
        assert!(fx.store.load_entity(ids[0]).unwrap().unwrap().published);
    }

    #[test]
    fn expiry_uses_import_time() {
        let fx = Fixture::new();
        let processor = fx.processor(EntitySettings {
            expire: 3600,
            ..settings(UpdateExisting::Update)
        });
        let mut state = State::default();
        let old = processor.process(&fx.feed, &item("1", "old"), &mut state).unwrap();
        fx.clock.advance(Duration::hours(2));
        let fresh = processor.process(&fx.feed, &item("2", "new"), &mut state).unwrap();

        let expired = processor.expired_ids(&fx.feed, fx.clock.now()).unwrap().unwrap();
        assert_eq!(expired, vec![old.entity_id().unwrap()]);
        processor.expire_item(&fx.feed, expired[0], &mut state).unwrap();
        assert_eq!(state.counters.deleted, 1);
        assert!(fx.store.load_entity(fresh.entity_id().unwrap()).unwrap().is_some());

        let never = fx.processor(settings(UpdateExisting::Update));
        assert_eq!(never.expired_ids(&fx.feed, fx.clock.now()).unwrap(), None);
    }

    #[test]
    fn rejects_invalid_settings() {
        let fx = Fixture::new();
        let build = |settings: EntitySettings, plugin: Option<Arc<dyn CleanPlugin>>| {
            EntityProcessor::new(settings, Vec::new(), fx.store.clone(), fx.clock.clone(), plugin)
        };
        assert!(build(EntitySettings::default(), None).is_err());
        assert!(
            build(
                EntitySettings {
                    expire: -5,
                    ..settings(UpdateExisting::Skip)
                },
                None
            )
            .is_err()
        );
        assert!(
            build(
                EntitySettings {
                    update_non_existent: CleanAction::Custom("other".to_string()),
                    ..settings(UpdateExisting::Skip)
                },
                Some(Arc::new(FlagStale::default()))
            )
            .is_err()
        );
    }
}
