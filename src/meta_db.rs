//! SQLite-backed view of a WordPress database: `{prefix}posts`,
//! `{prefix}postmeta` and `{prefix}options`.
//!
//! Existing databases are opened as-is (only a busy timeout is applied, the
//! journal mode is left to the owner). `open_or_create` bootstraps the minimal
//! schema the fixer needs, for fixtures and fresh sandboxes.

use std::path::Path;
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{FixerError, Result};
use crate::store::{MetaStore, MetadataRecord, OPTION_TRUE, OptionStore};

pub(crate) const DEFAULT_TABLE_PREFIX: &str = "wp_";

pub(crate) struct MetaDb {
    conn: Connection,
    posts: String,
    postmeta: String,
    options: String,
}

// ── Schema SQL ───────────────────────────────────────────────────────────

fn schema_sql(prefix: &str) -> String {
    format!(
        "
CREATE TABLE IF NOT EXISTS {prefix}posts (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    post_title TEXT NOT NULL DEFAULT '',
    post_type TEXT NOT NULL DEFAULT 'post'
);

CREATE TABLE IF NOT EXISTS {prefix}postmeta (
    meta_id INTEGER PRIMARY KEY AUTOINCREMENT,
    post_id INTEGER NOT NULL DEFAULT 0,
    meta_key TEXT,
    meta_value TEXT
);

CREATE INDEX IF NOT EXISTS {prefix}postmeta_post_id ON {prefix}postmeta(post_id);
CREATE INDEX IF NOT EXISTS {prefix}postmeta_meta_key ON {prefix}postmeta(meta_key);

CREATE TABLE IF NOT EXISTS {prefix}options (
    option_id INTEGER PRIMARY KEY AUTOINCREMENT,
    option_name TEXT NOT NULL UNIQUE,
    option_value TEXT NOT NULL DEFAULT '',
    autoload TEXT NOT NULL DEFAULT 'yes'
);
"
    )
}

/// Table prefixes are spliced into SQL, so only identifier characters pass.
pub(crate) fn validate_prefix(prefix: &str) -> Result<()> {
    if !prefix.is_empty()
        && prefix
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    {
        Ok(())
    } else {
        Err(FixerError::InvalidPrefix(prefix.to_string()))
    }
}

/// Column content as text, and whether it was valid UTF-8. SQLite happily
/// stores arbitrary bytes in TEXT columns, so one bad row must not fail the
/// whole query.
fn text_column(value: ValueRef<'_>) -> (String, bool) {
    match value {
        ValueRef::Null => (String::new(), true),
        ValueRef::Integer(n) => (n.to_string(), true),
        ValueRef::Real(f) => (f.to_string(), true),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => (text.to_string(), true),
            Err(_) => (String::from_utf8_lossy(bytes).into_owned(), false),
        },
    }
}

// ── Core implementation ──────────────────────────────────────────────────

impl MetaDb {
    /// Open an existing database. Errors if the file doesn't exist.
    pub(crate) fn open(path: &Path, prefix: &str) -> Result<Self> {
        if !path.exists() {
            return Err(FixerError::DatabaseNotFound(path.to_path_buf()));
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, prefix)
    }

    /// Open or create a database file with the fixer's schema.
    pub(crate) fn open_or_create(path: &Path, prefix: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db = Self::with_connection(conn, prefix)?;
        db.conn.execute_batch(&schema_sql(prefix))?;
        Ok(db)
    }

    fn with_connection(conn: Connection, prefix: &str) -> Result<Self> {
        validate_prefix(prefix)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn,
            posts: format!("{prefix}posts"),
            postmeta: format!("{prefix}postmeta"),
            options: format!("{prefix}options"),
        })
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<MetadataRecord> {
        let (key, key_ok) = text_column(row.get_ref(2)?);
        let (value, value_ok) = text_column(row.get_ref(3)?);
        Ok(MetadataRecord {
            id: row.get::<_, i64>(0)? as u64,
            owner_id: row.get::<_, i64>(1)? as u64,
            key,
            value,
            binary: !(key_ok && value_ok),
        })
    }
}

impl MetaStore for MetaDb {
    fn range_query(&self, low: u64, high: u64) -> Result<Vec<MetadataRecord>> {
        let sql = format!(
            "SELECT meta_id, post_id, meta_key, meta_value FROM {}
             WHERE post_id > ?1 AND post_id <= ?2
             ORDER BY meta_id",
            self.postmeta
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![low as i64, high as i64], Self::row_to_record)?;
        let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn get_by_id(&self, id: u64) -> Result<Option<MetadataRecord>> {
        let sql = format!(
            "SELECT meta_id, post_id, meta_key, meta_value FROM {} WHERE meta_id = ?1",
            self.postmeta
        );
        let record = self
            .conn
            .query_row(&sql, params![id as i64], Self::row_to_record)
            .optional()?;
        Ok(record)
    }

    fn update_value(&self, id: u64, value: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET meta_value = ?1 WHERE meta_id = ?2",
            self.postmeta
        );
        self.conn.execute(&sql, params![value, id as i64])?;
        Ok(())
    }

    fn count_owners(&self) -> Result<u64> {
        let sql = format!("SELECT COUNT(ID) FROM {}", self.posts);
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

impl OptionStore for MetaDb {
    fn get_option(&self, name: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT option_value FROM {} WHERE option_name = ?1",
            self.options
        );
        let value = self
            .conn
            .query_row(&sql, params![name], |row| row.get::<_, Option<String>>(0))
            .optional()?;
        Ok(value.map(Option::unwrap_or_default))
    }

    fn set_option(&self, name: &str, value: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (option_name, option_value, autoload) VALUES (?1, ?2, 'no')
             ON CONFLICT(option_name) DO UPDATE SET option_value = excluded.option_value",
            self.options
        );
        self.conn.execute(&sql, params![name, value])?;
        Ok(())
    }

    fn try_set_flag(&self, name: &str) -> Result<bool> {
        // Single conditional write: the row only changes when the flag was not
        // already set (same truthiness as `flag_is_set`), so two racing
        // callers cannot both observe success.
        let sql = format!(
            "INSERT INTO {table} (option_name, option_value, autoload) VALUES (?1, ?2, 'no')
             ON CONFLICT(option_name) DO UPDATE SET option_value = excluded.option_value
             WHERE {table}.option_value IS NULL OR {table}.option_value IN ('', '0')",
            table = self.options
        );
        let changed = self.conn.execute(&sql, params![name, OPTION_TRUE])?;
        Ok(changed == 1)
    }
}

#[cfg(test)]
impl MetaDb {
    pub(crate) fn insert_post(&self, title: &str) -> Result<u64> {
        let sql = format!("INSERT INTO {} (post_title) VALUES (?1)", self.posts);
        self.conn.execute(&sql, params![title])?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    /// Store raw bytes as TEXT, the way a misbehaving writer could.
    pub(crate) fn insert_raw_meta(&self, post_id: u64, key: &str, bytes: &[u8]) -> Result<u64> {
        let sql = format!(
            "INSERT INTO {} (post_id, meta_key, meta_value) VALUES (?1, ?2, CAST(?3 AS TEXT))",
            self.postmeta
        );
        self.conn
            .execute(&sql, params![post_id as i64, key, bytes])?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    pub(crate) fn insert_meta(&self, post_id: u64, key: &str, value: &str) -> Result<u64> {
        let sql = format!(
            "INSERT INTO {} (post_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
            self.postmeta
        );
        self.conn
            .execute(&sql, params![post_id as i64, key, value])?;
        Ok(self.conn.last_insert_rowid() as u64)
    }
}

#[cfg(test)]
pub(crate) fn temp_db_path(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join("acfml_fixer_test");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(format!("test_{}_{name}.sqlite", std::process::id()))
}
