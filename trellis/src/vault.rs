use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, warn};
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{collections::HashMap, path::Path};
use trellis_cdm::ContentKey;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS content_keys (
    service     TEXT NOT NULL COLLATE NOCASE,
    content_id  TEXT NOT NULL COLLATE NOCASE,
    kid         TEXT NOT NULL COLLATE NOCASE,
    key         TEXT NOT NULL COLLATE NOCASE,
    key_type    TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (service, content_id, kid)
);
";

/// Persistent cache of negotiated content keys, keyed by
/// `(service, content_id)`. The vault is the single authority on whether a
/// title is already licensed; the pipeline never receives keys any other
/// way.
pub struct Vault {
    pool: SqlitePool,
}

impl Vault {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("could not open key vault {}", path.display()))?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Full-coverage lookup: returns the KID to key map only when every
    /// required kid is present. Partial coverage is a miss, which forces a
    /// renegotiation that supersedes the stale entry.
    pub async fn lookup(
        &self,
        service: &str,
        content_id: &str,
        required_kids: &[String],
    ) -> Result<Option<HashMap<String, String>>> {
        let rows = sqlx::query(
            "SELECT kid, key FROM content_keys WHERE service = ? AND content_id = ?",
        )
        .bind(service)
        .bind(content_id)
        .fetch_all(&self.pool)
        .await?;

        let keys = rows
            .iter()
            .map(|row| (row.get::<String, _>("kid"), row.get::<String, _>("key")))
            .collect::<HashMap<_, _>>();

        if keys.is_empty() {
            return Ok(None);
        }

        for kid in required_kids {
            if !keys.contains_key(kid) {
                debug!("vault entry for {service}/{content_id} is missing kid {kid}");
                return Ok(None);
            }
        }

        Ok(Some(keys))
    }

    /// Upsert-with-merge. New kids are added to the entry; a differing value
    /// for a known kid is a consistency fault that is logged, after which the
    /// newest value wins.
    pub async fn store(&self, service: &str, content_id: &str, keys: &[ContentKey]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        for key in keys {
            let kid = key.kid_hex();
            let value = key.key_hex();

            let existing = sqlx::query(
                "SELECT key FROM content_keys WHERE service = ? AND content_id = ? AND kid = ?",
            )
            .bind(service)
            .bind(content_id)
            .bind(&kid)
            .fetch_optional(&mut *tx)
            .await?;

            match existing.map(|row| row.get::<String, _>("key")) {
                Some(stored) if stored == value => {}
                Some(stored) => {
                    warn!(
                        "vault value conflict for {service}/{content_id} kid {kid} \
                        (stored {}…, new {}…), keeping the newest",
                        &stored[..8.min(stored.len())],
                        &value[..8]
                    );
                    sqlx::query(
                        "UPDATE content_keys SET key = ?, key_type = ?, created_at = ? \
                        WHERE service = ? AND content_id = ? AND kid = ?",
                    )
                    .bind(&value)
                    .bind(key.kind.to_string())
                    .bind(&now)
                    .bind(service)
                    .bind(content_id)
                    .bind(&kid)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO content_keys (service, content_id, kid, key, key_type, created_at) \
                        VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(service)
                    .bind(content_id)
                    .bind(&kid)
                    .bind(&value)
                    .bind(key.kind.to_string())
                    .bind(&now)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// All keys stored for a service as `KID:KEY` lines, ready for external
    /// decryption tools.
    pub async fn export(&self, service: &str, content_id: Option<&str>) -> Result<Vec<String>> {
        let rows = match content_id {
            Some(content_id) => {
                sqlx::query(
                    "SELECT kid, key FROM content_keys WHERE service = ? AND content_id = ? ORDER BY kid",
                )
                .bind(service)
                .bind(content_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT kid, key FROM content_keys WHERE service = ? ORDER BY kid")
                    .bind(service)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows
            .iter()
            .map(|row| {
                format!(
                    "{}:{}",
                    row.get::<String, _>("kid"),
                    row.get::<String, _>("key")
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_cdm::KeyType;

    fn key(kid: u8, value: u8) -> ContentKey {
        ContentKey {
            kid: [kid; 16],
            key: [value; 16],
            kind: KeyType::Content,
        }
    }

    async fn open_temp() -> (tempfile::TempDir, Vault) {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(&dir.path().join("vault.db")).await.unwrap();
        (dir, vault)
    }

    #[tokio::test]
    async fn store_is_idempotent() {
        let (_dir, vault) = open_temp().await;
        let keys = [key(0xaa, 0x01), key(0xbb, 0x02)];

        vault.store("test", "title", &keys).await.unwrap();
        vault.store("test", "title", &keys).await.unwrap();

        let lines = vault.export("test", Some("title")).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            format!("{}:{}", "aa".repeat(16), "01".repeat(16))
        );
    }

    #[tokio::test]
    async fn partial_coverage_is_a_miss() {
        let (_dir, vault) = open_temp().await;
        vault.store("test", "title", &[key(0xaa, 0x01)]).await.unwrap();

        let required_one = vec![hex::encode([0xaa; 16])];
        let required_two = vec![hex::encode([0xaa; 16]), hex::encode([0xbb; 16])];

        assert!(
            vault
                .lookup("test", "title", &required_one)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            vault
                .lookup("test", "title", &required_two)
                .await
                .unwrap()
                .is_none()
        );
        assert!(vault.lookup("test", "other", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn value_conflict_newest_wins() {
        let (_dir, vault) = open_temp().await;
        vault.store("test", "title", &[key(0xaa, 0x01)]).await.unwrap();
        vault.store("test", "title", &[key(0xaa, 0x02)]).await.unwrap();

        let keys = vault
            .lookup("test", "title", &[hex::encode([0xaa; 16])])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(keys[&hex::encode([0xaa; 16])], hex::encode([0x02; 16]));

        let lines = vault.export("test", None).await.unwrap();
        assert_eq!(lines.len(), 1);
    }
}
