//! `DuckDB`-backed store.
//!
//! One database file holds every table. Structured records (feeds, states,
//! tasks, entities) are stored as JSON text next to the columns queries
//! filter on. Entity field values are additionally indexed in
//! `entity_fields` so unique lookups do not scan entity bodies.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use duckdb::{Connection, params};
use feeds_feed_models::entity::Entity;
use feeds_feed_models::lock::LockRecord;
use feeds_feed_models::state::State;
use feeds_feed_models::task::{QueueTask, TaskId};
use feeds_feed_models::{EntityId, Feed, FeedId, NewFeed, Stage};

use crate::{
    CachedHeaders, ClaimedTask, CleanListStore, DbError, EntityStore, FeedStore, HeaderCache,
    LockGuard, LockStore, StateStore, TaskQueue,
};

/// A store on a single `DuckDB` connection.
#[derive(Debug)]
pub struct DuckDbStore {
    conn: Mutex<Connection>,
}

impl DuckDbStore {
    /// Opens (or creates) a store file and ensures the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or schema creation fails.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            crate::paths::ensure_dir(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a store that lives only as long as this value.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or schema creation fails.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        create_schema(&conn)?;
        log::debug!("Feeds store schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn create_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE SEQUENCE IF NOT EXISTS feed_ids START 1;
        CREATE SEQUENCE IF NOT EXISTS task_ids START 1;
        CREATE SEQUENCE IF NOT EXISTS entity_ids START 1;

        CREATE TABLE IF NOT EXISTS feeds (
            id BIGINT NOT NULL PRIMARY KEY,
            data TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS states (
            feed_id BIGINT NOT NULL,
            stage TEXT NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (feed_id, stage)
        );

        CREATE TABLE IF NOT EXISTS clean_list (
            feed_id BIGINT NOT NULL,
            position BIGINT NOT NULL,
            entity_id BIGINT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS locks (
            name TEXT NOT NULL PRIMARY KEY,
            expire DOUBLE NOT NULL,
            value TEXT NOT NULL,
            acquired DOUBLE NOT NULL
        );

        CREATE TABLE IF NOT EXISTS queue (
            id BIGINT NOT NULL PRIMARY KEY,
            feed_id BIGINT NOT NULL,
            data TEXT NOT NULL,
            claimed_at BIGINT
        );

        CREATE TABLE IF NOT EXISTS header_cache (
            key TEXT NOT NULL PRIMARY KEY,
            feed_id BIGINT NOT NULL,
            etag TEXT,
            last_modified TEXT
        );

        CREATE TABLE IF NOT EXISTS entities (
            id BIGINT NOT NULL PRIMARY KEY,
            entity_type TEXT NOT NULL,
            langcode TEXT,
            feed_id BIGINT,
            imported BIGINT,
            data TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entity_fields (
            entity_id BIGINT NOT NULL,
            field TEXT NOT NULL,
            value TEXT NOT NULL
        );",
    )?;

    Ok(())
}

fn to_i64(value: u64) -> Result<i64, DbError> {
    i64::try_from(value).map_err(|_| DbError::Conversion {
        message: format!("{value} does not fit in BIGINT"),
    })
}

fn to_u64(value: i64) -> Result<u64, DbError> {
    u64::try_from(value).map_err(|_| DbError::Conversion {
        message: format!("negative id {value}"),
    })
}

fn optional<T>(result: duckdb::Result<T>) -> Result<Option<T>, DbError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(DbError::DuckDb(e)),
    }
}

fn next_id(conn: &Connection, sequence: &str) -> Result<u64, DbError> {
    let id: i64 = conn.query_row(&format!("SELECT nextval('{sequence}')"), [], |row| {
        row.get(0)
    })?;
    to_u64(id)
}

fn ids(conn: &Connection, sql: &str, params: &[&dyn duckdb::ToSql]) -> Result<Vec<u64>, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, i64>(0))?;
    rows.map(|row| to_u64(row?)).collect()
}

impl FeedStore for DuckDbStore {
    fn create_feed(&self, draft: NewFeed, created: DateTime<Utc>) -> Result<Feed, DbError> {
        let conn = self.conn();
        let feed = draft.into_feed(FeedId(next_id(&conn, "feed_ids")?), created);
        conn.execute(
            "INSERT INTO feeds (id, data) VALUES (?, ?)",
            params![to_i64(feed.id.0)?, serde_json::to_string(&feed)?],
        )?;
        Ok(feed)
    }

    fn load_feed(&self, id: FeedId) -> Result<Option<Feed>, DbError> {
        let conn = self.conn();
        let data: Option<String> = optional(conn.query_row(
            "SELECT data FROM feeds WHERE id = ?",
            params![to_i64(id.0)?],
            |row| row.get(0),
        ))?;
        data.map(|d| serde_json::from_str(&d).map_err(DbError::from))
            .transpose()
    }

    fn update_feed(&self, feed: &Feed) -> Result<(), DbError> {
        let rows = self.conn().execute(
            "UPDATE feeds SET data = ? WHERE id = ?",
            params![serde_json::to_string(feed)?, to_i64(feed.id.0)?],
        )?;
        if rows == 0 {
            return Err(DbError::NotFound {
                kind: "feed",
                id: feed.id.to_string(),
            });
        }
        Ok(())
    }

    fn delete_feed(&self, id: FeedId) -> Result<bool, DbError> {
        let rows = self
            .conn()
            .execute("DELETE FROM feeds WHERE id = ?", params![to_i64(id.0)?])?;
        Ok(rows > 0)
    }

    fn list_feeds(&self) -> Result<Vec<Feed>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT data FROM feeds ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.map(|row| Ok(serde_json::from_str(&row?)?)).collect()
    }
}

impl StateStore for DuckDbStore {
    fn load_state(&self, feed_id: FeedId, stage: Stage) -> Result<Option<State>, DbError> {
        let conn = self.conn();
        let data: Option<String> = optional(conn.query_row(
            "SELECT data FROM states WHERE feed_id = ? AND stage = ?",
            params![to_i64(feed_id.0)?, stage.as_ref()],
            |row| row.get(0),
        ))?;
        data.map(|d| serde_json::from_str(&d).map_err(DbError::from))
            .transpose()
    }

    fn save_state(&self, feed_id: FeedId, stage: Stage, state: &State) -> Result<(), DbError> {
        self.conn().execute(
            "INSERT INTO states (feed_id, stage, data) VALUES (?, ?, ?)
             ON CONFLICT (feed_id, stage) DO UPDATE SET data = EXCLUDED.data",
            params![
                to_i64(feed_id.0)?,
                stage.as_ref(),
                serde_json::to_string(state)?
            ],
        )?;
        Ok(())
    }

    fn clear_states(&self, feed_id: FeedId) -> Result<(), DbError> {
        self.conn().execute(
            "DELETE FROM states WHERE feed_id = ?",
            params![to_i64(feed_id.0)?],
        )?;
        Ok(())
    }
}

impl CleanListStore for DuckDbStore {
    fn set_clean_list(&self, feed_id: FeedId, list: &[EntityId]) -> Result<(), DbError> {
        let mut conn = self.conn();
        let feed = to_i64(feed_id.0)?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM clean_list WHERE feed_id = ?", params![feed])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO clean_list (feed_id, position, entity_id) VALUES (?, ?, ?)")?;
            for (position, id) in list.iter().enumerate() {
                stmt.execute(params![feed, to_i64(position as u64)?, to_i64(id.0)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn remove_from_clean_list(&self, feed_id: FeedId, id: EntityId) -> Result<bool, DbError> {
        let rows = self.conn().execute(
            "DELETE FROM clean_list WHERE feed_id = ? AND entity_id = ?",
            params![to_i64(feed_id.0)?, to_i64(id.0)?],
        )?;
        Ok(rows > 0)
    }

    fn clean_list_head(&self, feed_id: FeedId, limit: usize) -> Result<Vec<EntityId>, DbError> {
        let conn = self.conn();
        Ok(ids(
            &conn,
            "SELECT entity_id FROM clean_list WHERE feed_id = ? ORDER BY position LIMIT ?",
            &[&to_i64(feed_id.0)?, &to_i64(limit as u64)?],
        )?
        .into_iter()
        .map(EntityId)
        .collect())
    }

    fn clean_list_len(&self, feed_id: FeedId) -> Result<u64, DbError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM clean_list WHERE feed_id = ?",
            params![to_i64(feed_id.0)?],
            |row| row.get(0),
        )?;
        to_u64(count)
    }

    fn clear_clean_list(&self, feed_id: FeedId) -> Result<(), DbError> {
        self.conn().execute(
            "DELETE FROM clean_list WHERE feed_id = ?",
            params![to_i64(feed_id.0)?],
        )?;
        Ok(())
    }
}

impl LockStore for DuckDbStore {
    fn insert_lock(&self, record: &LockRecord) -> Result<bool, DbError> {
        let rows = self.conn().execute(
            "INSERT INTO locks (name, expire, value, acquired) VALUES (?, ?, ?, ?)
             ON CONFLICT (name) DO NOTHING",
            params![record.name, record.expire, record.value, record.acquired],
        )?;
        Ok(rows > 0)
    }

    fn load_lock(&self, name: &str) -> Result<Option<LockRecord>, DbError> {
        let conn = self.conn();
        optional(conn.query_row(
            "SELECT name, expire, value, acquired FROM locks WHERE name = ?",
            params![name],
            |row| {
                Ok(LockRecord {
                    name: row.get(0)?,
                    expire: row.get(1)?,
                    value: row.get(2)?,
                    acquired: row.get(3)?,
                })
            },
        ))
    }

    fn extend_lock(&self, name: &str, value: &str, expire: f64) -> Result<bool, DbError> {
        let rows = self.conn().execute(
            "UPDATE locks SET expire = ? WHERE name = ? AND value = ?",
            params![expire, name, value],
        )?;
        Ok(rows > 0)
    }

    fn delete_lock(&self, name: &str, guard: &LockGuard) -> Result<bool, DbError> {
        let conn = self.conn();
        let rows = match guard {
            LockGuard::Any => conn.execute("DELETE FROM locks WHERE name = ?", params![name])?,
            LockGuard::Value(value) => conn.execute(
                "DELETE FROM locks WHERE name = ? AND value = ?",
                params![name, value],
            )?,
            LockGuard::Expire(expire) => conn.execute(
                "DELETE FROM locks WHERE name = ? AND expire = ?",
                params![name, expire],
            )?,
        };
        Ok(rows > 0)
    }
}

impl DuckDbStore {
    fn claim(
        &self,
        feed_id: Option<FeedId>,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, DbError> {
        let mut conn = self.conn();
        let stale_before = (now - lease).timestamp_micros();
        let tx = conn.transaction()?;
        let row: Option<(i64, String)> = match feed_id {
            Some(feed_id) => optional(tx.query_row(
                "SELECT id, data FROM queue
                 WHERE feed_id = ? AND (claimed_at IS NULL OR claimed_at <= ?)
                 ORDER BY id LIMIT 1",
                params![to_i64(feed_id.0)?, stale_before],
                |row| Ok((row.get(0)?, row.get(1)?)),
            ))?,
            None => optional(tx.query_row(
                "SELECT id, data FROM queue
                 WHERE claimed_at IS NULL OR claimed_at <= ?
                 ORDER BY id LIMIT 1",
                params![stale_before],
                |row| Ok((row.get(0)?, row.get(1)?)),
            ))?,
        };
        let Some((id, data)) = row else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE queue SET claimed_at = ? WHERE id = ?",
            params![now.timestamp_micros(), id],
        )?;
        tx.commit()?;
        Ok(Some(ClaimedTask {
            id: TaskId(to_u64(id)?),
            task: serde_json::from_str(&data)?,
        }))
    }
}

impl TaskQueue for DuckDbStore {
    fn push_task(&self, task: &QueueTask) -> Result<TaskId, DbError> {
        let conn = self.conn();
        let id = next_id(&conn, "task_ids")?;
        conn.execute(
            "INSERT INTO queue (id, feed_id, data, claimed_at) VALUES (?, ?, ?, NULL)",
            params![
                to_i64(id)?,
                to_i64(task.feed_id.0)?,
                serde_json::to_string(task)?
            ],
        )?;
        Ok(TaskId(id))
    }

    fn claim_task(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, DbError> {
        self.claim(None, now, lease)
    }

    fn claim_task_for_feed(
        &self,
        feed_id: FeedId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<ClaimedTask>, DbError> {
        self.claim(Some(feed_id), now, lease)
    }

    fn complete_task(&self, id: TaskId) -> Result<(), DbError> {
        self.conn()
            .execute("DELETE FROM queue WHERE id = ?", params![to_i64(id.0)?])?;
        Ok(())
    }

    fn release_task(&self, id: TaskId, task: &QueueTask) -> Result<(), DbError> {
        let rows = self.conn().execute(
            "UPDATE queue SET data = ?, claimed_at = NULL WHERE id = ?",
            params![serde_json::to_string(task)?, to_i64(id.0)?],
        )?;
        if rows == 0 {
            return Err(DbError::NotFound {
                kind: "task",
                id: id.0.to_string(),
            });
        }
        Ok(())
    }

    fn count_tasks(&self, feed_id: FeedId) -> Result<u64, DbError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM queue WHERE feed_id = ?",
            params![to_i64(feed_id.0)?],
            |row| row.get(0),
        )?;
        to_u64(count)
    }

    fn purge_tasks(&self, feed_id: FeedId) -> Result<u64, DbError> {
        let rows = self.conn().execute(
            "DELETE FROM queue WHERE feed_id = ?",
            params![to_i64(feed_id.0)?],
        )?;
        Ok(rows as u64)
    }
}

impl HeaderCache for DuckDbStore {
    fn load_headers(&self, key: &str) -> Result<Option<CachedHeaders>, DbError> {
        let conn = self.conn();
        optional(conn.query_row(
            "SELECT etag, last_modified FROM header_cache WHERE key = ?",
            params![key],
            |row| {
                Ok(CachedHeaders {
                    etag: row.get(0)?,
                    last_modified: row.get(1)?,
                })
            },
        ))
    }

    fn save_headers(
        &self,
        key: &str,
        feed_id: FeedId,
        headers: &CachedHeaders,
    ) -> Result<(), DbError> {
        self.conn().execute(
            "INSERT INTO header_cache (key, feed_id, etag, last_modified) VALUES (?, ?, ?, ?)
             ON CONFLICT (key) DO UPDATE SET
                feed_id = EXCLUDED.feed_id,
                etag = EXCLUDED.etag,
                last_modified = EXCLUDED.last_modified",
            params![
                key,
                to_i64(feed_id.0)?,
                headers.etag.as_deref(),
                headers.last_modified.as_deref()
            ],
        )?;
        Ok(())
    }

    fn delete_headers_for_feed(&self, feed_id: FeedId) -> Result<(), DbError> {
        self.conn().execute(
            "DELETE FROM header_cache WHERE feed_id = ?",
            params![to_i64(feed_id.0)?],
        )?;
        Ok(())
    }
}

impl EntityStore for DuckDbStore {
    fn save_entity(&self, entity: &Entity) -> Result<EntityId, DbError> {
        let mut conn = self.conn();
        let id = match entity.id {
            Some(id) => id,
            None => EntityId(next_id(&conn, "entity_ids")?),
        };
        let mut stored = entity.clone();
        stored.id = Some(id);
        let entity_id = to_i64(id.0)?;
        let feed_id = stored
            .provenance
            .as_ref()
            .map(|p| to_i64(p.feed_id.0))
            .transpose()?;
        let imported = stored
            .provenance
            .as_ref()
            .map(|p| p.imported.timestamp_micros());

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO entities (id, entity_type, langcode, feed_id, imported, data)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                entity_type = EXCLUDED.entity_type,
                langcode = EXCLUDED.langcode,
                feed_id = EXCLUDED.feed_id,
                imported = EXCLUDED.imported,
                data = EXCLUDED.data",
            params![
                entity_id,
                stored.entity_type,
                stored.langcode.as_deref(),
                feed_id,
                imported,
                serde_json::to_string(&stored)?
            ],
        )?;
        tx.execute(
            "DELETE FROM entity_fields WHERE entity_id = ?",
            params![entity_id],
        )?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO entity_fields (entity_id, field, value) VALUES (?, ?, ?)")?;
            for (field, value) in &stored.fields {
                stmt.execute(params![entity_id, field, serde_json::to_string(value)?])?;
            }
        }
        tx.commit()?;
        Ok(id)
    }

    fn load_entity(&self, id: EntityId) -> Result<Option<Entity>, DbError> {
        let conn = self.conn();
        let data: Option<String> = optional(conn.query_row(
            "SELECT data FROM entities WHERE id = ?",
            params![to_i64(id.0)?],
            |row| row.get(0),
        ))?;
        data.map(|d| serde_json::from_str(&d).map_err(DbError::from))
            .transpose()
    }

    fn delete_entity(&self, id: EntityId) -> Result<bool, DbError> {
        let mut conn = self.conn();
        let entity_id = to_i64(id.0)?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM entity_fields WHERE entity_id = ?",
            params![entity_id],
        )?;
        let rows = tx.execute("DELETE FROM entities WHERE id = ?", params![entity_id])?;
        tx.commit()?;
        Ok(rows > 0)
    }

    fn find_entity_by_field(
        &self,
        entity_type: &str,
        langcode: Option<&str>,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<Option<EntityId>, DbError> {
        let conn = self.conn();
        let value = serde_json::to_string(value)?;
        let found = match langcode {
            Some(langcode) => ids(
                &conn,
                "SELECT e.id FROM entities e
                 JOIN entity_fields f ON f.entity_id = e.id
                 WHERE e.entity_type = ? AND e.langcode = ? AND f.field = ? AND f.value = ?
                 ORDER BY e.id LIMIT 1",
                &[&entity_type, &langcode, &field, &value],
            )?,
            None => ids(
                &conn,
                "SELECT e.id FROM entities e
                 JOIN entity_fields f ON f.entity_id = e.id
                 WHERE e.entity_type = ? AND f.field = ? AND f.value = ?
                 ORDER BY e.id LIMIT 1",
                &[&entity_type, &field, &value],
            )?,
        };
        Ok(found.first().copied().map(EntityId))
    }

    fn entity_ids_for_feed(&self, feed_id: FeedId) -> Result<Vec<EntityId>, DbError> {
        let conn = self.conn();
        Ok(ids(
            &conn,
            "SELECT id FROM entities WHERE feed_id = ? ORDER BY id",
            &[&to_i64(feed_id.0)?],
        )?
        .into_iter()
        .map(EntityId)
        .collect())
    }

    fn entity_ids_imported_before(
        &self,
        feed_id: FeedId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EntityId>, DbError> {
        let conn = self.conn();
        Ok(ids(
            &conn,
            "SELECT id FROM entities WHERE feed_id = ? AND imported < ? ORDER BY id",
            &[&to_i64(feed_id.0)?, &cutoff.timestamp_micros()],
        )?
        .into_iter()
        .map(EntityId)
        .collect())
    }

    fn count_entities_for_feed(&self, feed_id: FeedId) -> Result<u64, DbError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM entities WHERE feed_id = ?",
            params![to_i64(feed_id.0)?],
            |row| row.get(0),
        )?;
        to_u64(count)
    }
}
