use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{lock_or_recover, Backend, StoredRow};

#[derive(Default)]
struct MemoryState {
    // key -> (nickname, payload)
    players: BTreeMap<String, (String, String)>,
    meta: HashMap<String, String>,
}

/// Process-local backend. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        lock_or_recover(&self.state, "memory backend")
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.lock().players.get(key).map(|(_, payload)| payload.clone()))
    }

    fn insert_if_absent(&self, key: &str, nickname: &str, payload: &str) -> anyhow::Result<bool> {
        let mut state = self.lock();
        if state.players.contains_key(key) {
            return Ok(false);
        }
        state
            .players
            .insert(key.to_string(), (nickname.to_string(), payload.to_string()));
        Ok(true)
    }

    fn store(&self, key: &str, nickname: &str, payload: &str) -> anyhow::Result<()> {
        self.lock()
            .players
            .insert(key.to_string(), (nickname.to_string(), payload.to_string()));
        Ok(())
    }

    fn scan(&self) -> anyhow::Result<Vec<StoredRow>> {
        Ok(self
            .lock()
            .players
            .iter()
            .map(|(key, (_, payload))| StoredRow {
                key: key.clone(),
                payload: payload.clone(),
            })
            .collect())
    }

    fn delete_all(&self) -> anyhow::Result<usize> {
        let mut state = self.lock();
        let deleted = state.players.len();
        state.players.clear();
        Ok(deleted)
    }

    fn delete_nickname(&self, nickname: &str, keep_key: &str) -> anyhow::Result<usize> {
        let mut state = self.lock();
        let before = state.players.len();
        state
            .players
            .retain(|key, (stored, _)| key == keep_key || stored != nickname);
        Ok(before - state.players.len())
    }

    fn swap_meta(&self, name: &str, value: &str) -> anyhow::Result<bool> {
        let mut state = self.lock();
        if state.meta.get(name).map(String::as_str) == Some(value) {
            return Ok(false);
        }
        state.meta.insert(name.to_string(), value.to_string());
        Ok(true)
    }
}
