use anyhow::Context;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{lock_or_recover, Backend, StoredRow};

/// Player rows in a local SQLite database.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("open progress sqlite db")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        lock_or_recover(&self.conn, "sqlite backend")
    }
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         CREATE TABLE IF NOT EXISTS players (
             player_key TEXT PRIMARY KEY,
             nickname TEXT NOT NULL DEFAULT '',
             data TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS players_nickname ON players(nickname);
         CREATE TABLE IF NOT EXISTS store_meta (
             name TEXT PRIMARY KEY,
             value TEXT NOT NULL
         );",
    )
    .context("init progress sqlite schema")?;
    Ok(())
}

/// Reads a payload column as text whatever SQLite type it was stored with,
/// so a mangled row surfaces as an undecodable payload instead of a query
/// error.
fn payload_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ValueRef::Integer(value) => value.to_string(),
        ValueRef::Real(value) => value.to_string(),
        ValueRef::Null => String::new(),
    }
}

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn load(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.lock()
            .query_row(
                "SELECT data FROM players WHERE player_key = ?1",
                params![key],
                |row| Ok(payload_text(row.get_ref(0)?)),
            )
            .optional()
            .context("load player row")
    }

    fn insert_if_absent(&self, key: &str, nickname: &str, payload: &str) -> anyhow::Result<bool> {
        let inserted = self
            .lock()
            .execute(
                "INSERT OR IGNORE INTO players (player_key, nickname, data) VALUES (?1, ?2, ?3)",
                params![key, nickname, payload],
            )
            .context("insert player row")?;
        Ok(inserted == 1)
    }

    fn store(&self, key: &str, nickname: &str, payload: &str) -> anyhow::Result<()> {
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO players (player_key, nickname, data) VALUES (?1, ?2, ?3)",
                params![key, nickname, payload],
            )
            .context("store player row")?;
        Ok(())
    }

    fn scan(&self) -> anyhow::Result<Vec<StoredRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT player_key, data FROM players")?;
        let rows = stmt.query_map([], |row| {
            Ok(StoredRow {
                key: payload_text(row.get_ref(0)?),
                payload: payload_text(row.get_ref(1)?),
            })
        })?;
        let mut scanned = Vec::new();
        for row in rows {
            scanned.push(row.context("scan player rows")?);
        }
        Ok(scanned)
    }

    fn delete_all(&self) -> anyhow::Result<usize> {
        self.lock()
            .execute("DELETE FROM players", [])
            .context("delete player rows")
    }

    fn delete_nickname(&self, nickname: &str, keep_key: &str) -> anyhow::Result<usize> {
        self.lock()
            .execute(
                "DELETE FROM players WHERE nickname = ?1 AND player_key <> ?2",
                params![nickname, keep_key],
            )
            .context("delete players by nickname")
    }

    fn swap_meta(&self, name: &str, value: &str) -> anyhow::Result<bool> {
        let changed = self
            .lock()
            .execute(
                "INSERT INTO store_meta (name, value) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value
                 WHERE store_meta.value <> excluded.value",
                params![name, value],
            )
            .context("update store metadata")?;
        Ok(changed == 1)
    }
}
