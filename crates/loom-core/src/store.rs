//! Durable scenes, lines and access log
//!
//! The [`Store`] trait is the seam the scheduler depends on; [`SqliteStore`]
//! is the production implementation. Every method is one short critical
//! section on a single connection.
//!
//! Write rules:
//! - lines are insert-if-absent and never overwritten
//! - scene ids get a numeric suffix on collision, atomically
//! - access log rows are upserted per `(key, username)`

use crate::error::StoreError;
use crate::types::{timestamp, AccessEntry, Line, NewScene, Scene, SearchField, SearchResults};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

/// Letters tried, in order, for human-written lines
pub const HUMAN_LETTERS: std::ops::RangeInclusive<char> = 'A'..='Z';

/// Persistent storage used by the scheduler
pub trait Store: Send + Sync {
    /// Insert a scene, suffixing `_1`, `_2`, ... up to `max_suffix` on collision
    ///
    /// Returns the stored id, or `None` when every suffix is taken.
    fn insert_scene(&self, scene: &NewScene, max_suffix: u32) -> Result<Option<String>, StoreError>;

    /// Scene by id
    fn scene(&self, key: &str) -> Result<Option<Scene>, StoreError>;

    /// Fill missing translations of a scene
    fn set_scene_translation(&self, key: &str, prompt: &str, outline: Option<&str>) -> Result<(), StoreError>;

    /// Line by full expanded key
    fn line(&self, key: &str) -> Result<Option<Line>, StoreError>;

    /// Insert a line unless its key exists; returns whether it was written
    fn insert_line(&self, line: &Line) -> Result<bool, StoreError>;

    /// Fill the missing translation of a line
    fn set_line_translation(&self, key: &str, text: &str) -> Result<(), StoreError>;

    /// Store a human line under the first free uppercase letter after `parent`
    ///
    /// Returns the new key, or `None` when `A` to `Z` are all taken.
    fn insert_human_line(&self, parent: &str, text: &str, input_type: &str) -> Result<Option<String>, StoreError>;

    /// Record an access; keeps the rating only if the latest rating is this user's
    ///
    /// Returns the latest rating of the key by anyone.
    fn log_access(&self, key: &str, username: &str) -> Result<Option<i64>, StoreError>;

    /// Upsert a rating for `(key, username)`
    fn rate(&self, key: &str, username: &str, rating: i64) -> Result<AccessEntry, StoreError>;

    /// Access log, newest first; `page_len == 0` returns everything
    fn recent(&self, page_len: usize, page: usize, username: Option<&str>) -> Result<Vec<AccessEntry>, StoreError>;

    /// All scenes, optionally of one user and/or only those with an outline
    fn scenes(&self, username: Option<&str>, with_outline: bool) -> Result<Vec<Scene>, StoreError>;

    /// Substring search on an allow-listed column
    fn search(&self, field: SearchField, query: &str) -> Result<SearchResults, StoreError>;
}

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS scenes (
      id INTEGER PRIMARY KEY,
      key TEXT NOT NULL UNIQUE,
      prompt TEXT NOT NULL,
      outline TEXT,
      char1 TEXT,
      char2 TEXT,
      username TEXT NOT NULL DEFAULT '',
      timestamp TEXT NOT NULL,
      translated_prompt TEXT,
      translated_outline TEXT
    );

    CREATE TABLE IF NOT EXISTS lines (
      id INTEGER PRIMARY KEY,
      key TEXT NOT NULL UNIQUE,
      text TEXT NOT NULL,
      model TEXT NOT NULL,
      server_version TEXT NOT NULL,
      timestamp TEXT NOT NULL,
      translated_text TEXT
    );

    CREATE TABLE IF NOT EXISTS access_log (
      id INTEGER PRIMARY KEY,
      key TEXT NOT NULL,
      username TEXT NOT NULL,
      timestamp TEXT NOT NULL,
      rating INTEGER,
      UNIQUE(key, username)
    );

    CREATE INDEX IF NOT EXISTS access_log_timestamp ON access_log(timestamp);
";

const SCENE_COLUMNS: &str =
    "key, prompt, outline, char1, char2, username, timestamp, translated_prompt, translated_outline";
const LINE_COLUMNS: &str = "key, text, model, server_version, timestamp, translated_text";

/// SQLite-backed store
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (and migrate) a database file
    ///
    /// # Errors
    /// Returns `StoreError::Open` if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| StoreError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        conn.busy_timeout(std::time::Duration::from_secs(60))?;
        Self::with_connection(conn)
    }

    /// Fresh in-memory database
    ///
    /// # Errors
    /// Returns `StoreError::Sqlite` if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn scene_from_row(row: &Row<'_>) -> rusqlite::Result<Scene> {
    Ok(Scene {
        key: row.get(0)?,
        prompt: row.get(1)?,
        outline: row.get(2)?,
        char1: row.get(3)?,
        char2: row.get(4)?,
        username: row.get(5)?,
        timestamp: row.get(6)?,
        translated_prompt: row.get(7)?,
        translated_outline: row.get(8)?,
    })
}

fn line_from_row(row: &Row<'_>) -> rusqlite::Result<Line> {
    Ok(Line {
        key: row.get(0)?,
        text: row.get(1)?,
        model: row.get(2)?,
        server_version: row.get(3)?,
        timestamp: row.get(4)?,
        translated_text: row.get(5)?,
    })
}

fn access_from_row(row: &Row<'_>) -> rusqlite::Result<AccessEntry> {
    Ok(AccessEntry {
        key: row.get(0)?,
        username: row.get(1)?,
        timestamp: row.get(2)?,
        rating: row.get(3)?,
    })
}

impl Store for SqliteStore {
    fn insert_scene(&self, scene: &NewScene, max_suffix: u32) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = timestamp();
        let mut stored = None;

        for suffix in 0..=max_suffix {
            let key = if suffix == 0 {
                scene.key.clone()
            } else {
                format!("{}_{suffix}", scene.key)
            };
            let inserted = tx.execute(
                r"
                INSERT OR IGNORE INTO scenes(key, prompt, outline, char1, char2, username, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    key,
                    scene.prompt,
                    scene.outline,
                    scene.char1,
                    scene.char2,
                    scene.username,
                    now
                ],
            )?;
            if inserted == 1 {
                stored = Some(key);
                break;
            }
        }

        tx.commit()?;
        Ok(stored)
    }

    fn scene(&self, key: &str) -> Result<Option<Scene>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {SCENE_COLUMNS} FROM scenes WHERE key = ?1"),
                params![key],
                scene_from_row,
            )
            .optional()?)
    }

    fn set_scene_translation(&self, key: &str, prompt: &str, outline: Option<&str>) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r"
            UPDATE scenes
            SET translated_prompt = COALESCE(translated_prompt, ?2),
                translated_outline = COALESCE(translated_outline, ?3)
            WHERE key = ?1
            ",
            params![key, prompt, outline],
        )?;
        Ok(())
    }

    fn line(&self, key: &str) -> Result<Option<Line>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {LINE_COLUMNS} FROM lines WHERE key = ?1"),
                params![key],
                line_from_row,
            )
            .optional()?)
    }

    fn insert_line(&self, line: &Line) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            r"
            INSERT OR IGNORE INTO lines(key, text, model, server_version, timestamp, translated_text)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                line.key,
                line.text,
                line.model,
                line.server_version,
                line.timestamp,
                line.translated_text
            ],
        )?;
        Ok(inserted == 1)
    }

    fn set_line_translation(&self, key: &str, text: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE lines SET translated_text = COALESCE(translated_text, ?2) WHERE key = ?1",
            params![key, text],
        )?;
        Ok(())
    }

    fn insert_human_line(&self, parent: &str, text: &str, input_type: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = timestamp();
        let mut stored = None;

        for letter in HUMAN_LETTERS {
            let key = format!("{parent}{letter}");
            let inserted = tx.execute(
                r"
                INSERT OR IGNORE INTO lines(key, text, model, server_version, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![key, text, input_type, crate::VERSION, now],
            )?;
            if inserted == 1 {
                stored = Some(key);
                break;
            }
        }

        tx.commit()?;
        Ok(stored)
    }

    fn log_access(&self, key: &str, username: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let latest: Option<(String, i64)> = tx
            .query_row(
                r"
                SELECT username, rating FROM access_log
                WHERE key = ?1 AND rating IS NOT NULL
                ORDER BY timestamp DESC, id DESC
                LIMIT 1
                ",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let kept = latest
            .as_ref()
            .filter(|(user, _)| user == username)
            .map(|(_, rating)| *rating);

        tx.execute(
            r"
            INSERT INTO access_log(key, username, timestamp, rating)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key, username) DO UPDATE SET timestamp = excluded.timestamp, rating = excluded.rating
            ",
            params![key, username, timestamp(), kept],
        )?;
        tx.commit()?;

        Ok(latest.map(|(_, rating)| rating))
    }

    fn rate(&self, key: &str, username: &str, rating: i64) -> Result<AccessEntry, StoreError> {
        let entry = AccessEntry {
            key: key.to_string(),
            username: username.to_string(),
            timestamp: timestamp(),
            rating: Some(rating),
        };
        let conn = self.conn.lock();
        conn.execute(
            r"
            INSERT INTO access_log(key, username, timestamp, rating)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key, username) DO UPDATE SET timestamp = excluded.timestamp, rating = excluded.rating
            ",
            params![entry.key, entry.username, entry.timestamp, entry.rating],
        )?;
        Ok(entry)
    }

    fn recent(&self, page_len: usize, page: usize, username: Option<&str>) -> Result<Vec<AccessEntry>, StoreError> {
        let limit = if page_len == 0 {
            -1
        } else {
            i64::try_from(page_len).unwrap_or(i64::MAX)
        };
        let offset = i64::try_from(page.saturating_mul(page_len)).unwrap_or(i64::MAX);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r"
            SELECT key, username, timestamp, rating FROM access_log
            WHERE ?1 IS NULL OR username = ?1
            ORDER BY timestamp DESC, id DESC
            LIMIT ?2 OFFSET ?3
            ",
        )?;
        let rows = stmt.query_map(params![username, limit, offset], access_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn scenes(&self, username: Option<&str>, with_outline: bool) -> Result<Vec<Scene>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r"
            SELECT {SCENE_COLUMNS} FROM scenes
            WHERE (?1 IS NULL OR username = ?1)
              AND (?2 = 0 OR (outline IS NOT NULL AND outline != ''))
            ORDER BY id
            "
        ))?;
        let rows = stmt.query_map(params![username, with_outline], scene_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn search(&self, field: SearchField, query: &str) -> Result<SearchResults, StoreError> {
        let pattern = format!("%{query}%");
        let conn = self.conn.lock();
        if field.in_scenes() {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCENE_COLUMNS} FROM scenes WHERE {} LIKE ?1 ORDER BY id",
                field.column()
            ))?;
            let rows = stmt.query_map(params![pattern], scene_from_row)?;
            Ok(SearchResults::Scenes(rows.collect::<Result<Vec<_>, _>>()?))
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT {LINE_COLUMNS} FROM lines WHERE {} LIKE ?1 ORDER BY id",
                field.column()
            ))?;
            let rows = stmt.query_map(params![pattern], line_from_row)?;
            Ok(SearchResults::Lines(rows.collect::<Result<Vec<_>, _>>()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn new_scene(key: &str) -> NewScene {
        NewScene {
            key: key.to_string(),
            prompt: "A room.".to_string(),
            username: "ann".to_string(),
            ..NewScene::default()
        }
    }

    #[test]
    fn scene_ids_get_suffixes() {
        let store = store();
        assert_eq!(store.insert_scene(&new_scene("demo"), 3).unwrap().as_deref(), Some("demo"));
        assert_eq!(store.insert_scene(&new_scene("demo"), 3).unwrap().as_deref(), Some("demo_1"));
        assert_eq!(store.insert_scene(&new_scene("demo"), 3).unwrap().as_deref(), Some("demo_2"));
    }

    #[test]
    fn scene_suffixes_run_out() {
        let store = store();
        for _ in 0..=2 {
            store.insert_scene(&new_scene("demo"), 2).unwrap().unwrap();
        }
        assert_eq!(store.insert_scene(&new_scene("demo"), 2).unwrap(), None);
    }

    #[test]
    fn lines_are_never_overwritten() {
        let store = store();
        assert!(store.insert_line(&Line::new("demo-a", "first", "m")).unwrap());
        assert!(!store.insert_line(&Line::new("demo-a", "second", "m")).unwrap());
        assert_eq!(store.line("demo-a").unwrap().unwrap().text, "first");
    }

    #[test]
    fn human_lines_take_free_letters() {
        let store = store();
        store.insert_line(&Line::new("demo-aA", "taken", "human")).unwrap();
        let key = store.insert_human_line("demo-a", "Hi.", "human").unwrap();
        assert_eq!(key.as_deref(), Some("demo-aB"));
        assert_eq!(store.line("demo-aB").unwrap().unwrap().model, "human");
    }

    #[test]
    fn human_letters_run_out() {
        let store = store();
        for _ in HUMAN_LETTERS {
            store.insert_human_line("demo-", "x", "human").unwrap().unwrap();
        }
        assert_eq!(store.insert_human_line("demo-", "x", "human").unwrap(), None);
    }

    #[test]
    fn access_keeps_own_rating_only() {
        let store = store();
        store.rate("demo-a", "ann", 4).unwrap();

        assert_eq!(store.log_access("demo-a", "ann").unwrap(), Some(4));
        assert_eq!(store.log_access("demo-a", "bob").unwrap(), Some(4));

        let rows = store.recent(0, 0, None).unwrap();
        let ann = rows.iter().find(|r| r.username == "ann").unwrap();
        let bob = rows.iter().find(|r| r.username == "bob").unwrap();
        assert_eq!(ann.rating, Some(4));
        assert_eq!(bob.rating, None);
    }

    #[test]
    fn recent_pages_and_filters() {
        let store = store();
        for key in ["s-a", "s-b", "s-c"] {
            store.log_access(key, "ann").unwrap();
        }
        store.log_access("s-d", "bob").unwrap();

        assert_eq!(store.recent(0, 0, None).unwrap().len(), 4);
        assert_eq!(store.recent(0, 0, Some("ann")).unwrap().len(), 3);
        assert_eq!(store.recent(2, 1, Some("ann")).unwrap().len(), 1);
    }

    #[test]
    fn scenes_filter_by_user_and_outline() {
        let store = store();
        store.insert_scene(&new_scene("one"), 0).unwrap();
        store
            .insert_scene(
                &NewScene {
                    outline: Some("They meet.".to_string()),
                    username: "bob".to_string(),
                    ..new_scene("two")
                },
                0,
            )
            .unwrap();

        assert_eq!(store.scenes(None, false).unwrap().len(), 2);
        assert_eq!(store.scenes(Some("bob"), false).unwrap().len(), 1);
        assert_eq!(store.scenes(None, true).unwrap()[0].key, "two");
        assert!(store.scenes(Some("ann"), true).unwrap().is_empty());
    }

    #[test]
    fn search_wraps_query() {
        let store = store();
        store.insert_line(&Line::new("s-a", "Anna: Hello there.", "m")).unwrap();
        store.insert_line(&Line::new("s-b", "Bob: Bye.", "m")).unwrap();

        match store.search(SearchField::Text, "llo").unwrap() {
            SearchResults::Lines(lines) => assert_eq!(lines.len(), 1),
            SearchResults::Scenes(_) => panic!("expected lines"),
        }
    }

    #[test]
    fn translations_fill_once() {
        let store = store();
        store.insert_line(&Line::new("s-a", "Hi.", "m")).unwrap();
        store.set_line_translation("s-a", "Ahoj.").unwrap();
        store.set_line_translation("s-a", "Nazdar.").unwrap();
        assert_eq!(store.line("s-a").unwrap().unwrap().translated_text.as_deref(), Some("Ahoj."));
    }

    #[test]
    fn file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loom.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_scene(&new_scene("demo"), 0).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.scene("demo").unwrap().unwrap().prompt, "A room.");
    }
}
