use anyhow::Context;
use redis::{Commands, Connection, RedisResult};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

use super::{lock_or_recover, Backend, StoredRow};

/// Player payloads in a single Redis hash, `{prefix}players`, keyed by
/// player key. Metadata lives in plain string keys under `{prefix}meta:`.
pub struct RedisBackend {
    client: redis::Client,
    connection: Mutex<Option<Connection>>,
    prefix: String,
}

impl RedisBackend {
    pub fn open(url: &str, prefix: impl Into<String>) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("parse redis url")?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            prefix: prefix.into(),
        })
    }

    fn players_key(&self) -> String {
        format!("{}players", self.prefix)
    }

    fn meta_key(&self, name: &str) -> String {
        format!("{}meta:{name}", self.prefix)
    }

    /// Runs `op` on the shared connection, dialing first if needed. A failed
    /// command drops the connection so the next call reconnects.
    fn with_connection<T>(
        &self,
        what: &'static str,
        op: impl FnOnce(&mut Connection) -> RedisResult<T>,
    ) -> anyhow::Result<T> {
        let mut guard = lock_or_recover(&self.connection, "redis backend");
        if guard.is_none() {
            *guard = Some(self.client.get_connection().context("connect to redis")?);
        }
        let Some(conn) = guard.as_mut() else {
            anyhow::bail!("redis connection unavailable");
        };
        match op(conn) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!("redis {what} failed: {err}");
                *guard = None;
                Err(anyhow::Error::new(err).context(what))
            }
        }
    }
}

fn payload_nickname(payload: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value.get("nickname")?.as_str().map(str::to_string)
}

impl Backend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn load(&self, key: &str) -> anyhow::Result<Option<String>> {
        let players = self.players_key();
        let raw: Option<Vec<u8>> = self.with_connection("load player", |conn| conn.hget(&players, key))?;
        Ok(raw.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn insert_if_absent(&self, key: &str, _nickname: &str, payload: &str) -> anyhow::Result<bool> {
        let players = self.players_key();
        self.with_connection("insert player", |conn| conn.hset_nx(&players, key, payload))
    }

    fn store(&self, key: &str, _nickname: &str, payload: &str) -> anyhow::Result<()> {
        let players = self.players_key();
        self.with_connection("store player", |conn| conn.hset(&players, key, payload))
    }

    fn scan(&self) -> anyhow::Result<Vec<StoredRow>> {
        let players = self.players_key();
        let entries: HashMap<String, Vec<u8>> =
            self.with_connection("scan players", |conn| conn.hgetall(&players))?;
        Ok(entries
            .into_iter()
            .map(|(key, payload)| StoredRow {
                key,
                payload: String::from_utf8_lossy(&payload).into_owned(),
            })
            .collect())
    }

    fn delete_all(&self) -> anyhow::Result<usize> {
        let players = self.players_key();
        let (count, _): (usize, usize) = self.with_connection("delete players", |conn| {
            redis::pipe()
                .atomic()
                .cmd("HLEN")
                .arg(&players)
                .cmd("DEL")
                .arg(&players)
                .query(conn)
        })?;
        Ok(count)
    }

    fn delete_nickname(&self, nickname: &str, keep_key: &str) -> anyhow::Result<usize> {
        let players = self.players_key();
        let entries: HashMap<String, Vec<u8>> =
            self.with_connection("scan players", |conn| conn.hgetall(&players))?;
        let doomed: Vec<String> = entries
            .into_iter()
            .filter(|(key, payload)| {
                key != keep_key && payload_nickname(payload).as_deref() == Some(nickname)
            })
            .map(|(key, _)| key)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        self.with_connection("delete players by nickname", |conn| conn.hdel(&players, &doomed))
    }

    fn swap_meta(&self, name: &str, value: &str) -> anyhow::Result<bool> {
        let key = self.meta_key(name);
        let previous: Option<String> = self.with_connection("update store metadata", |conn| {
            redis::cmd("GETSET").arg(&key).arg(value).query(conn)
        })?;
        Ok(previous.as_deref() != Some(value))
    }
}
