use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{lock_or_recover, Backend, StoredRow};

#[derive(Default, Serialize, Deserialize)]
struct FileDocument {
    #[serde(default)]
    players: BTreeMap<String, Value>,
    #[serde(default)]
    meta: BTreeMap<String, String>,
}

/// Keeps every record in one JSON document on disk.
///
/// The whole document is held in memory and rewritten through a temporary
/// file plus rename on each mutation, so a crash never leaves a torn file.
/// A legacy file that is a bare `{key: record}` map is read as the player
/// map.
pub struct FileBackend {
    path: PathBuf,
    document: Mutex<FileDocument>,
}

impl FileBackend {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let document = match fs::read_to_string(path) {
            Ok(raw) if raw.trim().is_empty() => FileDocument::default(),
            Ok(raw) => parse_document(&raw)
                .with_context(|| format!("decode progress file {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => FileDocument::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("read progress file {}", path.display()))
            }
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create progress file directory {}", parent.display()))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            document: Mutex::new(document),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FileDocument> {
        lock_or_recover(&self.document, "file backend")
    }

    fn flush(&self, document: &FileDocument) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("tmp");
        let raw = serde_json::to_vec_pretty(document).context("encode progress file")?;
        fs::write(&tmp, raw).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace progress file {}", self.path.display()))?;
        Ok(())
    }

    fn put_player(
        &self,
        document: &mut FileDocument,
        key: &str,
        payload: &str,
    ) -> anyhow::Result<()> {
        let value: Value = serde_json::from_str(payload).context("decode player payload")?;
        let previous = document.players.insert(key.to_string(), value);
        if let Err(err) = self.flush(document) {
            match previous {
                Some(previous) => {
                    document.players.insert(key.to_string(), previous);
                }
                None => {
                    document.players.remove(key);
                }
            }
            return Err(err);
        }
        Ok(())
    }
}

fn parse_document(raw: &str) -> anyhow::Result<FileDocument> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(map) = value else {
        bail!("progress file must contain a JSON object");
    };
    if map.contains_key("players") || map.contains_key("meta") {
        return Ok(serde_json::from_value(Value::Object(map))?);
    }
    Ok(FileDocument {
        players: map.into_iter().collect(),
        meta: BTreeMap::new(),
    })
}

impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn load(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.lock().players.get(key).map(Value::to_string))
    }

    fn insert_if_absent(&self, key: &str, _nickname: &str, payload: &str) -> anyhow::Result<bool> {
        let mut document = self.lock();
        if document.players.contains_key(key) {
            return Ok(false);
        }
        self.put_player(&mut document, key, payload)?;
        Ok(true)
    }

    fn store(&self, key: &str, _nickname: &str, payload: &str) -> anyhow::Result<()> {
        let mut document = self.lock();
        self.put_player(&mut document, key, payload)
    }

    fn scan(&self) -> anyhow::Result<Vec<StoredRow>> {
        Ok(self
            .lock()
            .players
            .iter()
            .map(|(key, value)| StoredRow {
                key: key.clone(),
                payload: value.to_string(),
            })
            .collect())
    }

    fn delete_all(&self) -> anyhow::Result<usize> {
        let mut document = self.lock();
        let previous = std::mem::take(&mut document.players);
        if let Err(err) = self.flush(&document) {
            document.players = previous;
            return Err(err);
        }
        Ok(previous.len())
    }

    fn delete_nickname(&self, nickname: &str, keep_key: &str) -> anyhow::Result<usize> {
        let mut document = self.lock();
        let doomed: Vec<String> = document
            .players
            .iter()
            .filter(|(key, value)| {
                key.as_str() != keep_key
                    && value.get("nickname").and_then(Value::as_str) == Some(nickname)
            })
            .map(|(key, _)| key.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        let removed: Vec<(String, Value)> = doomed
            .into_iter()
            .filter_map(|key| document.players.remove(&key).map(|value| (key, value)))
            .collect();
        if let Err(err) = self.flush(&document) {
            document.players.extend(removed);
            return Err(err);
        }
        Ok(removed.len())
    }

    fn swap_meta(&self, name: &str, value: &str) -> anyhow::Result<bool> {
        let mut document = self.lock();
        if document.meta.get(name).map(String::as_str) == Some(value) {
            return Ok(false);
        }
        let previous = document.meta.insert(name.to_string(), value.to_string());
        if let Err(err) = self.flush(&document) {
            match previous {
                Some(previous) => {
                    document.meta.insert(name.to_string(), previous);
                }
                None => {
                    document.meta.remove(name);
                }
            }
            return Err(err);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{exercise_backend, exercise_create_race, store_with};
    use crate::store::ScannedRecord;
    use tempfile::tempdir;

    #[test]
    fn file_backend_behaves() {
        let dir = tempdir().expect("create temp dir");
        let backend = FileBackend::open(&dir.path().join("progress.json")).unwrap();
        exercise_backend(Box::new(backend));
    }

    #[test]
    fn file_backend_create_race() {
        let dir = tempdir().expect("create temp dir");
        let backend = FileBackend::open(&dir.path().join("progress.json")).unwrap();
        exercise_create_race(Box::new(backend));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("nested").join("progress.json");
        {
            let (store, _) = store_with(Box::new(FileBackend::open(&path).unwrap()));
            store
                .upsert("7", &serde_json::json!({"nickname": "Kai", "totalClicks": 12}))
                .unwrap();
        }
        let (store, _) = store_with(Box::new(FileBackend::open(&path).unwrap()));
        let record = store.get("7").unwrap().unwrap();
        assert_eq!(record.nickname, "Kai");
        assert_eq!(record.total_clicks, 12);
    }

    #[test]
    fn reads_legacy_flat_files() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("users.json");
        fs::write(
            &path,
            r#"{"11": {"nickname": "Old", "totalEarned": 70}, "12": "garbage"}"#,
        )
        .unwrap();
        let (store, _) = store_with(Box::new(FileBackend::open(&path).unwrap()));
        let scanned = store.scan_all().unwrap();
        assert_eq!(scanned.len(), 2);
        assert!(scanned.iter().any(|entry| matches!(
            entry,
            ScannedRecord::Decoded(record) if record.key == "11" && record.total_earned == 70.0
        )));
        assert!(scanned
            .iter()
            .any(|entry| matches!(entry, ScannedRecord::Skipped { key, .. } if key == "12")));
    }

    #[test]
    fn rejects_unreadable_file() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("progress.json");
        fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(FileBackend::open(&path).is_err());
    }
}
