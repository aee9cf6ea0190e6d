use anyhow::{bail, Context};
use serde::Serialize;
use std::path::PathBuf;

use crate::store::{
    Backend, FileBackend, MemoryBackend, PostgresBackend, RedisBackend, SqliteBackend,
    StoreOptions,
};

pub const DEFAULT_LEADERBOARD_LIMIT: usize = 20;
pub const MAX_LEADERBOARD_LIMIT: usize = 100;
pub const DEFAULT_RESET_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 64 * 1024;
pub const DEFAULT_REDIS_PREFIX: &str = "tapledger:";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
    Sqlite,
    Postgres,
    Redis,
}

impl std::str::FromStr for BackendKind {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" | "json" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "redis" => Ok(Self::Redis),
            _ => Err("valid values: memory, file, sqlite, postgres, redis"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ServerConfig {
    pub backend: BackendKind,
    /// Data file for the `file` and `sqlite` backends.
    pub data_path: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub database_url: Option<String>,
    #[serde(skip_serializing)]
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    pub store: StoreOptions,
    pub leaderboard_default_limit: usize,
    pub leaderboard_max_limit: usize,
    /// How often to poll for a civil-day rollover. `None` leaves resets to
    /// the admin endpoint.
    pub reset_interval_secs: Option<u64>,
    pub http_body_limit_bytes: Option<usize>,
    #[serde(skip_serializing)]
    pub admin_token: Option<String>,
    /// Required on `/metrics/*` when set.
    #[serde(skip_serializing)]
    pub metrics_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            data_path: None,
            database_url: None,
            redis_url: None,
            redis_prefix: DEFAULT_REDIS_PREFIX.to_string(),
            store: StoreOptions::default(),
            leaderboard_default_limit: DEFAULT_LEADERBOARD_LIMIT,
            leaderboard_max_limit: MAX_LEADERBOARD_LIMIT,
            reset_interval_secs: Some(DEFAULT_RESET_INTERVAL_SECS),
            http_body_limit_bytes: Some(DEFAULT_HTTP_BODY_LIMIT_BYTES),
            admin_token: None,
            metrics_token: None,
        }
    }
}

impl ServerConfig {
    /// Opens the configured backend. Network backends block while
    /// connecting, so call this from a blocking context.
    pub fn open_backend(&self) -> anyhow::Result<Box<dyn Backend>> {
        let backend: Box<dyn Backend> = match self.backend {
            BackendKind::Memory => Box::new(MemoryBackend::default()),
            BackendKind::File => {
                let path = self.data_path_or("tapledger.json");
                Box::new(
                    FileBackend::open(&path)
                        .with_context(|| format!("open file backend at {}", path.display()))?,
                )
            }
            BackendKind::Sqlite => {
                let path = self.data_path_or("tapledger.db");
                Box::new(
                    SqliteBackend::open(&path)
                        .with_context(|| format!("open sqlite backend at {}", path.display()))?,
                )
            }
            BackendKind::Postgres => {
                let Some(url) = self.database_url.as_deref() else {
                    bail!("postgres backend requires --database-url or DATABASE_URL");
                };
                Box::new(PostgresBackend::connect(url)?)
            }
            BackendKind::Redis => {
                let Some(url) = self.redis_url.as_deref() else {
                    bail!("redis backend requires --redis-url or REDIS_URL");
                };
                Box::new(RedisBackend::open(url, self.redis_prefix.clone())?)
            }
        };
        Ok(backend)
    }

    /// Clamps a requested leaderboard size; `None` means the default.
    pub fn leaderboard_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.leaderboard_default_limit)
            .min(self.leaderboard_max_limit)
    }

    fn data_path_or(&self, fallback: &str) -> PathBuf {
        self.data_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_backend_names() {
        assert_eq!("SQLite".parse::<BackendKind>(), Ok(BackendKind::Sqlite));
        assert_eq!("postgresql".parse::<BackendKind>(), Ok(BackendKind::Postgres));
        assert_eq!("json".parse::<BackendKind>(), Ok(BackendKind::File));
        assert!("mongo".parse::<BackendKind>().is_err());
    }

    #[test]
    fn leaderboard_limit_is_defaulted_and_capped() {
        let config = ServerConfig::default();
        assert_eq!(config.leaderboard_limit(None), 20);
        assert_eq!(config.leaderboard_limit(Some(5)), 5);
        assert_eq!(config.leaderboard_limit(Some(5_000)), 100);
    }

    #[test]
    fn network_backends_need_urls() {
        let config = ServerConfig {
            backend: BackendKind::Postgres,
            ..ServerConfig::default()
        };
        assert!(config.open_backend().is_err());
        let config = ServerConfig {
            backend: BackendKind::Redis,
            ..ServerConfig::default()
        };
        assert!(config.open_backend().is_err());
    }

    #[test]
    fn opens_local_backends() {
        let dir = tempdir().expect("create temp dir");
        let config = ServerConfig {
            backend: BackendKind::Sqlite,
            data_path: Some(dir.path().join("progress.db")),
            ..ServerConfig::default()
        };
        assert_eq!(config.open_backend().unwrap().name(), "sqlite");
        let config = ServerConfig {
            backend: BackendKind::File,
            data_path: Some(dir.path().join("progress.json")),
            ..ServerConfig::default()
        };
        assert_eq!(config.open_backend().unwrap().name(), "file");
    }

    #[test]
    fn secrets_are_not_serialized() {
        let config = ServerConfig {
            database_url: Some("postgres://user:pw@10.0.0.1/db".to_string()),
            admin_token: Some("hunter2".to_string()),
            ..ServerConfig::default()
        };
        let rendered = serde_json::to_string(&config).unwrap();
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("pw@"));
    }
}
