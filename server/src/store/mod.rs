//! Key-addressed player progress storage.
//!
//! Backends only move raw JSON text around. Decoding, normalization, merging
//! and write stamping all happen in [`ProgressStore`], so every engine gets
//! identical semantics.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tapledger_types::{civil_day, PlayerDocument, PlayerRecord, SchemaError, DEFAULT_NICKNAME};
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::metrics::StoreMetrics;
use crate::{Error, Result};

mod file;
mod memory;
mod pg;
mod redis_hash;
mod sqlite;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use pg::PostgresBackend;
pub use redis_hash::RedisBackend;
pub use sqlite::SqliteBackend;

/// Metadata entry holding the civil day of the most recent daily reset.
pub(crate) const LAST_RESET_DAY: &str = "last_reset_day";

/// A stored payload as returned by a full scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRow {
    pub key: String,
    pub payload: String,
}

/// Storage engine behind a [`ProgressStore`].
///
/// Every method is a single atomic operation against the engine. `payload`
/// is the JSON encoding of a [`PlayerRecord`]; `nickname` is passed
/// alongside so engines with a nickname column can index it.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Inserts `payload` unless `key` already exists. Returns whether the
    /// row was inserted.
    fn insert_if_absent(&self, key: &str, nickname: &str, payload: &str) -> anyhow::Result<bool>;

    fn store(&self, key: &str, nickname: &str, payload: &str) -> anyhow::Result<()>;

    fn scan(&self) -> anyhow::Result<Vec<StoredRow>>;

    /// Removes every player row and returns how many were removed.
    fn delete_all(&self) -> anyhow::Result<usize>;

    /// Removes every row whose nickname equals `nickname`, except `keep_key`.
    fn delete_nickname(&self, nickname: &str, keep_key: &str) -> anyhow::Result<usize>;

    /// Sets metadata `name` to `value` unless it already holds `value`.
    /// Returns whether the value changed.
    fn swap_meta(&self, name: &str, value: &str) -> anyhow::Result<bool>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreOptions {
    /// Delete other players holding the same nickname before fetching a
    /// record. Destructive; off unless explicitly configured.
    pub evict_duplicate_nicknames: bool,
}

/// One entry of a full scan.
#[derive(Clone, Debug, PartialEq)]
pub enum ScannedRecord {
    Decoded(PlayerRecord),
    Skipped { key: String, reason: String },
}

pub struct ProgressStore {
    backend: Box<dyn Backend>,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
    metrics: Arc<StoreMetrics>,
    // Serializes read-modify-write cycles issued by this process.
    writes: Mutex<()>,
}

impl ProgressStore {
    pub fn new(backend: Box<dyn Backend>, clock: Arc<dyn Clock>, options: StoreOptions) -> Self {
        Self {
            backend,
            clock,
            options,
            metrics: Arc::new(StoreMetrics::default()),
            writes: Mutex::new(()),
        }
    }

    /// A store with no durability, backed by process memory.
    pub fn in_memory() -> Self {
        Self::new(
            Box::new(MemoryBackend::default()),
            Arc::new(SystemClock),
            StoreOptions::default(),
        )
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Civil day (UTC+3) of the store's clock.
    pub fn current_day(&self) -> NaiveDate {
        civil_day(self.clock.now())
    }

    /// Read-only lookup. Corrupt payloads read as absent.
    pub fn get(&self, key: &str) -> Result<Option<PlayerRecord>> {
        let key = validate_key(key)?;
        self.load_record(key, None, self.clock.now())
    }

    /// Returns the record for `key`, creating and persisting a default one
    /// first if the key is unknown.
    ///
    /// Concurrent first requests for the same key race on an atomic
    /// insert-if-absent; losers read back the winner's record. A corrupt
    /// stored payload is replaced with a fresh default record.
    pub fn get_or_create(&self, key: &str, nickname: Option<&str>) -> Result<PlayerRecord> {
        let key = validate_key(key)?;
        let nickname = nickname.filter(|value| !value.trim().is_empty());
        // Every player without a chosen nickname shares the default one.
        if let Some(nickname) = nickname.filter(|value| *value != DEFAULT_NICKNAME) {
            if self.options.evict_duplicate_nicknames {
                self.evict_nickname(nickname, key)?;
            }
        }

        let now = self.clock.now();
        if let Some(raw) = self.backend.load(key).map_err(Error::Storage)? {
            return match PlayerDocument::decode(&raw) {
                Ok(document) => Ok(document.normalize(key, nickname, now)),
                Err(err) => {
                    warn!(key, backend = self.backend.name(), "found corrupt player record: {err}");
                    self.replace_unreadable(key, nickname, now)
                }
            };
        }

        let record = PlayerDocument::default().normalize(key, nickname, now);
        let payload = encode(&record)?;
        let inserted = self
            .backend
            .insert_if_absent(key, &record.nickname, &payload)
            .map_err(|err| self.write_failed(key, err))?;
        if inserted {
            self.metrics.inc_created();
            info!(key, nickname = %record.nickname, "created player record");
            return Ok(record);
        }

        // Another writer created the key between our load and insert.
        match self.load_record(key, nickname, now)? {
            Some(existing) => Ok(existing),
            None => self.replace_unreadable(key, nickname, now),
        }
    }

    /// Merges `fields` into the stored record for `key` and persists it.
    ///
    /// Recognized fields overwrite, absent fields keep their stored value,
    /// and fields never stored before take schema defaults. Writes are
    /// last-writer-wins across processes; there is no version check.
    pub fn upsert(&self, key: &str, fields: &Value) -> Result<PlayerRecord> {
        let key = validate_key(key)?;
        let patch = PlayerDocument::from_patch(fields).map_err(invalid_input)?;

        let _guard = self.write_guard();
        let now = self.clock.now();
        let mut record = self
            .load_record(key, None, now)?
            .unwrap_or_else(|| PlayerRecord::new(key, DEFAULT_NICKNAME, now));
        record.apply(&patch);
        record.stamp(now);
        self.put(&record)?;
        self.metrics.inc_saved();
        Ok(record)
    }

    /// Snapshot of every stored record. Undecodable payloads are reported
    /// as [`ScannedRecord::Skipped`] rather than failing the scan.
    pub fn scan_all(&self) -> Result<Vec<ScannedRecord>> {
        let now = self.clock.now();
        let rows = self.backend.scan().map_err(Error::Storage)?;
        let scanned = rows
            .into_iter()
            .map(|row| match PlayerDocument::decode(&row.payload) {
                Ok(document) => ScannedRecord::Decoded(document.normalize(&row.key, None, now)),
                Err(err) => {
                    warn!(key = %row.key, "skipping corrupt player record: {err}");
                    self.metrics.inc_corrupt_skipped();
                    ScannedRecord::Skipped {
                        key: row.key,
                        reason: err.to_string(),
                    }
                }
            })
            .collect();
        Ok(scanned)
    }

    /// Number of stored rows, including undecodable ones.
    pub fn count(&self) -> Result<usize> {
        Ok(self.backend.scan().map_err(Error::Storage)?.len())
    }

    /// Administrative wipe of every player record.
    pub fn delete_all(&self) -> Result<usize> {
        let _guard = self.write_guard();
        let deleted = self
            .backend
            .delete_all()
            .map_err(|err| self.write_failed("*", err))?;
        self.metrics.inc_wipe();
        warn!(deleted, backend = self.backend.name(), "wiped all player records");
        Ok(deleted)
    }

    /// Records `day` as the most recent reset day. Returns `false` when some
    /// process already claimed it.
    pub fn claim_reset_day(&self, day: NaiveDate) -> Result<bool> {
        self.backend
            .swap_meta(LAST_RESET_DAY, &day.to_string())
            .map_err(Error::Storage)
    }

    /// Hands a claimed day back so the next claim for it succeeds again.
    pub(crate) fn release_reset_day(&self, day: NaiveDate) -> Result<()> {
        let previous = day.pred_opt().map(|day| day.to_string()).unwrap_or_default();
        self.backend
            .swap_meta(LAST_RESET_DAY, &previous)
            .map_err(Error::Storage)?;
        Ok(())
    }

    pub(crate) fn write_guard(&self) -> MutexGuard<'_, ()> {
        lock_or_recover(&self.writes, "progress store write lock")
    }

    pub(crate) fn put(&self, record: &PlayerRecord) -> Result<()> {
        let payload = encode(record)?;
        self.backend
            .store(&record.key, &record.nickname, &payload)
            .map_err(|err| self.write_failed(&record.key, err))
    }

    /// Writes a default record for `key` unless, once writes are held, the
    /// stored payload turns out to be readable after all.
    fn replace_unreadable(
        &self,
        key: &str,
        nickname: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PlayerRecord> {
        let _guard = self.write_guard();
        let stored = self.backend.load(key).map_err(Error::Storage)?;
        if let Some(raw) = &stored {
            if let Ok(document) = PlayerDocument::decode(raw) {
                return Ok(document.normalize(key, nickname, now));
            }
        }
        let record = PlayerRecord::new(key, nickname.unwrap_or(DEFAULT_NICKNAME), now);
        self.put(&record)?;
        if stored.is_some() {
            self.metrics.inc_corrupt_recreated();
            warn!(key, backend = self.backend.name(), "replaced corrupt player record");
        } else {
            self.metrics.inc_created();
            info!(key, nickname = %record.nickname, "created player record");
        }
        Ok(record)
    }

    fn load_record(
        &self,
        key: &str,
        nickname: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<PlayerRecord>> {
        let Some(raw) = self.backend.load(key).map_err(Error::Storage)? else {
            return Ok(None);
        };
        match PlayerDocument::decode(&raw) {
            Ok(document) => Ok(Some(document.normalize(key, nickname, now))),
            Err(err) => {
                warn!(key, "treating corrupt player record as absent: {err}");
                self.metrics.inc_corrupt_skipped();
                Ok(None)
            }
        }
    }

    fn evict_nickname(&self, nickname: &str, keep_key: &str) -> Result<()> {
        let evicted = self
            .backend
            .delete_nickname(nickname, keep_key)
            .map_err(|err| self.write_failed(keep_key, err))?;
        if evicted > 0 {
            self.metrics.add_evicted(evicted as u64);
            info!(nickname, keep_key, evicted, "evicted records sharing nickname");
        }
        Ok(())
    }

    fn write_failed(&self, key: &str, err: anyhow::Error) -> Error {
        self.metrics.inc_write_error();
        error!(key, backend = self.backend.name(), "progress store write failed: {err:#}");
        Error::Storage(err)
    }
}

fn validate_key(key: &str) -> Result<&str> {
    if key.trim().is_empty() {
        return Err(Error::InvalidInput("missing player key".to_string()));
    }
    Ok(key)
}

fn invalid_input(err: SchemaError) -> Error {
    Error::InvalidInput(err.to_string())
}

fn encode(record: &PlayerRecord) -> Result<String> {
    serde_json::to_string(record)
        .map_err(|err| Error::Storage(anyhow::Error::new(err).context("encode player record")))
}

pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("{what} poisoned; recovering");
            poisoned.into_inner()
        }
    }
}
