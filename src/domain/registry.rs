// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The global domain registry: which tenant database backs each domain,
//! plus host administrators, who live outside any tenant database
//! (`spec.md` §3, §4.1).

use chrono::{DateTime, Utc};
use log::info;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct DomainRecord {
    pub id: i64,
    pub name: String,
    pub database_name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct HostAdmin {
    pub id: i64,
    pub username: String,
    pub password_hash: Vec<u8>,
    pub salt: Vec<u8>,
    pub can_login: bool,
    pub failed_login_attempts: i64,
    pub lockout_end: Option<DateTime<Utc>>,
    pub last_failed_login: Option<DateTime<Utc>>,
}

/// The single, process-wide registry database (`spec.md` §3: "the registry
/// database maps each domain to its backing tenant database").
pub struct DomainRegistry {
    pool: SqlitePool,
}

impl DomainRegistry {
    pub async fn open(database_url: &str) -> CoreResult<Self> {
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CoreError::internal(format!("failed to create registry data dir: {e}")))?;
            }
            if !Path::new(path).exists() {
                std::fs::File::create(path)
                    .map_err(|e| CoreError::internal(format!("failed to create registry database file: {e}")))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::internal(format!("failed to open registry database: {e}")))?;

        sqlx::migrate!("./migrations/registry")
            .run(&pool)
            .await
            .map_err(|e| CoreError::internal(format!("registry migration failed: {e}")))?;

        info!("Opened domain registry at {database_url}");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> CoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::internal(e.to_string()))?;
        sqlx::migrate!("./migrations/registry")
            .run(&pool)
            .await
            .map_err(|e| CoreError::internal(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Registers `domain` against `database_name`. Several domains may
    /// share one `database_name` (`spec.md` §3).
    pub async fn register_domain(&self, domain: &str, database_name: &str) -> CoreResult<DomainRecord> {
        if self.find_domain(domain).await?.is_some() {
            return Err(CoreError::Syntax(format!("domain {domain} is already registered")));
        }
        let result = sqlx::query("INSERT INTO domain_registry (name, database_name, is_active) VALUES (?, ?, 1)")
            .bind(domain)
            .bind(database_name)
            .execute(&self.pool)
            .await?;
        self.find_domain_by_id(result.last_insert_rowid()).await
    }

    pub async fn find_domain(&self, domain: &str) -> CoreResult<Option<DomainRecord>> {
        let row = sqlx::query("SELECT id, name, database_name, is_active FROM domain_registry WHERE name = ? COLLATE NOCASE")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_domain))
    }

    /// `spec.md` §4.1 `find_active`: resolves `domain` only if it is
    /// registered *and* active; an inactive domain resolves as absent so
    /// callers treat it exactly like an unknown domain.
    pub async fn find_active(&self, domain: &str) -> CoreResult<Option<DomainRecord>> {
        Ok(self.find_domain(domain).await?.filter(|d| d.is_active))
    }

    async fn find_domain_by_id(&self, id: i64) -> CoreResult<DomainRecord> {
        let row = sqlx::query("SELECT id, name, database_name, is_active FROM domain_registry WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("domain id {id}")))?;
        Ok(row_to_domain(row))
    }

    pub async fn list_domains(&self) -> CoreResult<Vec<DomainRecord>> {
        let rows = sqlx::query("SELECT id, name, database_name, is_active FROM domain_registry ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_domain).collect())
    }

    /// `spec.md` §4.1 `move_domain`: repoints a domain at a different
    /// tenant database, e.g. splitting it out of a shared database.
    pub async fn move_domain(&self, domain: &str, new_database_name: &str) -> CoreResult<()> {
        let result = sqlx::query("UPDATE domain_registry SET database_name = ? WHERE name = ? COLLATE NOCASE")
            .bind(new_database_name)
            .bind(domain)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("domain {domain}")));
        }
        Ok(())
    }

    pub async fn set_active(&self, domain: &str, is_active: bool) -> CoreResult<()> {
        let result = sqlx::query("UPDATE domain_registry SET is_active = ? WHERE name = ? COLLATE NOCASE")
            .bind(is_active)
            .bind(domain)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("domain {domain}")));
        }
        Ok(())
    }

    pub async fn create_host_admin(&self, username: &str, password_hash: &[u8], salt: &[u8], full_name: &str) -> CoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO host_admins (username, password_hash, salt, full_name, can_login) VALUES (?, ?, ?, ?, 1)",
        )
        .bind(username)
        .bind(password_hash)
        .bind(salt)
        .bind(full_name)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn find_host_admin(&self, username: &str) -> CoreResult<Option<HostAdmin>> {
        let row = sqlx::query(
            r#"
            SELECT id, username, password_hash, salt, can_login, failed_login_attempts,
                   lockout_end, last_failed_login
            FROM host_admins WHERE username = ? COLLATE NOCASE
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| HostAdmin {
            id: row.get("id"),
            username: row.get("username"),
            password_hash: row.get("password_hash"),
            salt: row.get("salt"),
            can_login: row.get::<i64, _>("can_login") != 0,
            failed_login_attempts: row.get("failed_login_attempts"),
            lockout_end: crate::store::parse_ts(row.get("lockout_end")),
            last_failed_login: crate::store::parse_ts(row.get("last_failed_login")),
        }))
    }

    pub async fn record_host_admin_login_success(&self, admin_id: i64, now: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query("UPDATE host_admins SET failed_login_attempts = 0, lockout_end = NULL, last_login = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind(admin_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_host_admin_login_failure(
        &self,
        admin: &HostAdmin,
        now: DateTime<Utc>,
        reset_window: chrono::Duration,
        max_attempts: u32,
        lockout_duration: chrono::Duration,
    ) -> CoreResult<()> {
        let stale = admin
            .last_failed_login
            .map(|last| now - last > reset_window)
            .unwrap_or(true);
        let new_count = if stale { 1 } else { admin.failed_login_attempts + 1 };
        let lockout_end = if new_count >= max_attempts as i64 {
            Some(now + lockout_duration)
        } else {
            None
        };

        sqlx::query("UPDATE host_admins SET failed_login_attempts = ?, lockout_end = ?, last_failed_login = ? WHERE id = ?")
            .bind(new_count)
            .bind(lockout_end.map(|d| d.to_rfc3339()))
            .bind(now.to_rfc3339())
            .bind(admin.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_domain(row: sqlx::sqlite::SqliteRow) -> DomainRecord {
    DomainRecord {
        id: row.get("id"),
        name: row.get("name"),
        database_name: row.get("database_name"),
        is_active: row.get::<i64, _>("is_active") != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_resolve_domain() {
        let registry = DomainRegistry::open_in_memory().await.unwrap();
        registry.register_domain("example.com", "tenant_a").await.unwrap();
        let found = registry.find_active("EXAMPLE.COM").await.unwrap().unwrap();
        assert_eq!(found.database_name, "tenant_a");
    }

    #[tokio::test]
    async fn inactive_domain_resolves_as_absent() {
        let registry = DomainRegistry::open_in_memory().await.unwrap();
        registry.register_domain("example.com", "tenant_a").await.unwrap();
        registry.set_active("example.com", false).await.unwrap();
        assert!(registry.find_active("example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn move_domain_repoints_database() {
        let registry = DomainRegistry::open_in_memory().await.unwrap();
        registry.register_domain("example.com", "tenant_a").await.unwrap();
        registry.move_domain("example.com", "tenant_b").await.unwrap();
        let found = registry.find_active("example.com").await.unwrap().unwrap();
        assert_eq!(found.database_name, "tenant_b");
    }
}
