use anyhow::{bail, Context};
use postgres::{Client, NoTls};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::{lock_or_recover, Backend, StoredRow};

/// Player rows in a shared Postgres database.
///
/// The client is synchronous and must only be driven from blocking threads.
pub struct PostgresBackend {
    client: Mutex<Client>,
}

impl PostgresBackend {
    pub fn connect(url: &str) -> anyhow::Result<Self> {
        validate_postgres_url(url)?;
        let mut client = Client::connect(url, NoTls).context("open progress postgres")?;
        init_schema(&mut client)?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Client> {
        lock_or_recover(&self.client, "postgres backend")
    }
}

fn init_schema(client: &mut Client) -> anyhow::Result<()> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS players (
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
        .context("init progress postgres schema")?;
    Ok(())
}

impl Backend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn load(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row = self
            .lock()
            .query_opt("SELECT data FROM players WHERE player_key = $1", &[&key])
            .context("load player row")?;
        Ok(row.map(|row| row.try_get::<_, Option<String>>(0).ok().flatten().unwrap_or_default()))
    }

    fn insert_if_absent(&self, key: &str, nickname: &str, payload: &str) -> anyhow::Result<bool> {
        let inserted = self
            .lock()
            .execute(
                "INSERT INTO players (player_key, nickname, data) VALUES ($1, $2, $3)
                 ON CONFLICT (player_key) DO NOTHING",
                &[&key, &nickname, &payload],
            )
            .context("insert player row")?;
        Ok(inserted == 1)
    }

    fn store(&self, key: &str, nickname: &str, payload: &str) -> anyhow::Result<()> {
        self.lock()
            .execute(
                "INSERT INTO players (player_key, nickname, data) VALUES ($1, $2, $3)
                 ON CONFLICT (player_key) DO UPDATE
                 SET nickname = EXCLUDED.nickname, data = EXCLUDED.data",
                &[&key, &nickname, &payload],
            )
            .context("store player row")?;
        Ok(())
    }

    fn scan(&self) -> anyhow::Result<Vec<StoredRow>> {
        let rows = self
            .lock()
            .query("SELECT player_key, data FROM players", &[])
            .context("scan player rows")?;
        rows.iter()
            .map(|row| -> anyhow::Result<StoredRow> {
                let key: String = row.try_get(0)?;
                let payload: Option<String> = row.try_get(1)?;
                Ok(StoredRow {
                    key,
                    payload: payload.unwrap_or_default(),
                })
            })
            .collect()
    }

    fn delete_all(&self) -> anyhow::Result<usize> {
        let deleted = self
            .lock()
            .execute("DELETE FROM players", &[])
            .context("delete player rows")?;
        Ok(deleted as usize)
    }

    fn delete_nickname(&self, nickname: &str, keep_key: &str) -> anyhow::Result<usize> {
        let deleted = self
            .lock()
            .execute(
                "DELETE FROM players WHERE nickname = $1 AND player_key <> $2",
                &[&nickname, &keep_key],
            )
            .context("delete players by nickname")?;
        Ok(deleted as usize)
    }

    fn swap_meta(&self, name: &str, value: &str) -> anyhow::Result<bool> {
        let changed = self
            .lock()
            .execute(
                "INSERT INTO store_meta (name, value) VALUES ($1, $2)
                 ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value
                 WHERE store_meta.value <> EXCLUDED.value",
                &[&name, &value],
            )
            .context("update store metadata")?;
        Ok(changed == 1)
    }
}

fn validate_postgres_url(url: &str) -> anyhow::Result<()> {
    if env_flag("TAPLEDGER_ALLOW_PUBLIC_DB") {
        return Ok(());
    }
    check_postgres_host(url, env_flag("TAPLEDGER_ALLOW_DB_HOSTNAME"))
}

fn check_postgres_host(url: &str, allow_hostname: bool) -> anyhow::Result<()> {
    let parsed = Url::parse(url).context("parse postgres url")?;
    let scheme = parsed.scheme();
    if scheme != "postgres" && scheme != "postgresql" {
        bail!("postgres url must start with postgres:// or postgresql://");
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("postgres url missing host"))?;
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(());
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Ok(());
        }
        bail!("postgres host is public; set TAPLEDGER_ALLOW_PUBLIC_DB=1 to override");
    }

    if allow_hostname {
        return Ok(());
    }
    bail!("postgres host must be a private IP; set TAPLEDGER_ALLOW_DB_HOSTNAME=1 to allow hostnames");
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_hosts_are_accepted() {
        for url in [
            "postgres://app@localhost/progress",
            "postgresql://app@127.0.0.1:5432/progress",
            "postgres://app@10.1.2.3/progress",
            "postgres://app@192.168.0.4/progress",
            "postgres://app@[::1]/progress",
        ] {
            assert!(check_postgres_host(url, false).is_ok(), "{url}");
        }
    }

    #[test]
    fn public_hosts_are_rejected() {
        let err = check_postgres_host("postgres://app@8.8.8.8/progress", true).unwrap_err();
        assert!(err.to_string().contains("public"));
        assert!(check_postgres_host("mysql://app@10.0.0.1/progress", false).is_err());
    }

    #[test]
    fn hostnames_need_opt_in() {
        let url = "postgres://app@db.internal/progress";
        assert!(check_postgres_host(url, false).is_err());
        assert!(check_postgres_host(url, true).is_ok());
    }
}
