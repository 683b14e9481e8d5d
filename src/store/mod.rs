// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The shared, per-tenant message store (`spec.md` §4.2).
//!
//! One [`TenantStore`] wraps a single SQLite database that may back several
//! domains (`domain_settings` rows). Every mutating operation runs inside a
//! single `sqlx` transaction so the folder-counter invariants in `spec.md`
//! §8 are never observable mid-update.

pub mod message;
pub mod models;
pub mod search;

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use log::{debug, info};
use models::{Folder, SystemFolderType, User, UserRole};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;

pub struct TenantStore {
    pool: SqlitePool,
    attachments_dir: String,
}

impl TenantStore {
    /// Opens (creating if necessary) the SQLite database at `database_url`
    /// and applies migrations, mirroring the teacher's
    /// `CacheService::initialize` pattern. `attachments_dir` is where
    /// extracted MIME attachments are written, keyed by `{guid}.{ext}`
    /// (`spec.md` §6).
    pub async fn open(database_url: &str, attachments_dir: &str) -> CoreResult<Self> {
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CoreError::internal(format!("failed to create tenant data dir: {e}")))?;
            }
            if !Path::new(path).exists() {
                std::fs::File::create(path)
                    .map_err(|e| CoreError::internal(format!("failed to create tenant database file: {e}")))?;
            }
        }

        tokio::fs::create_dir_all(attachments_dir)
            .await
            .map_err(|e| CoreError::internal(format!("failed to create attachments dir: {e}")))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::internal(format!("failed to open tenant database: {e}")))?;

        sqlx::migrate!("./migrations/tenant")
            .run(&pool)
            .await
            .map_err(|e| CoreError::internal(format!("tenant migration failed: {e}")))?;

        info!("Opened tenant store at {database_url}");
        Ok(Self { pool, attachments_dir: attachments_dir.to_string() })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> CoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::internal(e.to_string()))?;
        sqlx::migrate!("./migrations/tenant")
            .run(&pool)
            .await
            .map_err(|e| CoreError::internal(e.to_string()))?;
        let attachments_dir = std::env::temp_dir().join(format!("postkeep-test-attachments-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&attachments_dir)
            .await
            .map_err(|e| CoreError::internal(e.to_string()))?;
        Ok(Self { pool, attachments_dir: attachments_dir.to_string_lossy().into_owned() })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn attachments_dir(&self) -> &str {
        &self.attachments_dir
    }

    /// Finds the `domain_settings` row for `name`, creating it if this is
    /// the first time this store has seen the domain.
    pub async fn ensure_domain_settings(&self, name: &str) -> CoreResult<i64> {
        if let Some(row) = sqlx::query("SELECT id FROM domain_settings WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(row.get::<i64, _>("id"));
        }

        let result = sqlx::query("INSERT INTO domain_settings (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Returns the `catch_all_user_id` configured for `domain_id`, if any
    /// (`spec.md` §4.6 step 3).
    pub async fn find_domain_catch_all(&self, domain_id: i64) -> CoreResult<Option<i64>> {
        let row = sqlx::query("SELECT catch_all_user_id FROM domain_settings WHERE id = ?")
            .bind(domain_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<i64>, _>("catch_all_user_id")))
    }

    pub async fn set_domain_catch_all(&self, domain_id: i64, user_id: Option<i64>) -> CoreResult<()> {
        sqlx::query("UPDATE domain_settings SET catch_all_user_id = ? WHERE id = ?")
            .bind(user_id)
            .bind(domain_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn find_user(&self, username: &str, domain_id: i64) -> CoreResult<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, username, domain_id, password_hash, salt, full_name, role,
                   can_receive, can_login, failed_login_attempts,
                   lockout_end, last_failed_login, last_login
            FROM users
            WHERE username = ? COLLATE NOCASE AND domain_id = ?
            "#,
        )
        .bind(username)
        .bind(domain_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_user))
    }

    pub async fn find_user_by_id(&self, user_id: i64) -> CoreResult<User> {
        let row = sqlx::query(
            r#"
            SELECT id, username, domain_id, password_hash, salt, full_name, role,
                   can_receive, can_login, failed_login_attempts,
                   lockout_end, last_failed_login, last_login
            FROM users WHERE id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_user)
            .ok_or_else(|| CoreError::NotFound(format!("user {user_id}")))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_user(
        &self,
        username: &str,
        domain_id: i64,
        password_hash: &[u8],
        salt: &[u8],
        full_name: &str,
        role: UserRole,
        can_receive: bool,
    ) -> CoreResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (username, domain_id, password_hash, salt, full_name, role, can_receive, can_login)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(username)
        .bind(domain_id)
        .bind(password_hash)
        .bind(salt)
        .bind(full_name)
        .bind(role.as_str())
        .bind(can_receive)
        .execute(&self.pool)
        .await?;

        let user_id = result.last_insert_rowid();
        for system_type in [SystemFolderType::Inbox, SystemFolderType::Sent, SystemFolderType::Drafts, SystemFolderType::Trash] {
            self.ensure_system_folder(user_id, system_type).await?;
        }
        Ok(user_id)
    }

    pub async fn record_login_success(&self, user_id: i64, now: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query(
            "UPDATE users SET failed_login_attempts = 0, lockout_end = NULL, last_login = ? WHERE id = ?",
        )
        .bind(now.to_rfc3339())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `spec.md` §4.3 step 5: bump/reset the failed-attempt counter and set
    /// `lockout_end` once the threshold is crossed, all under one update so
    /// the read-then-write can't race another failed attempt.
    pub async fn record_login_failure(
        &self,
        user: &User,
        now: DateTime<Utc>,
        reset_window: chrono::Duration,
        max_attempts: u32,
        lockout_duration: chrono::Duration,
    ) -> CoreResult<()> {
        let stale = user
            .last_failed_login
            .map(|last| now - last > reset_window)
            .unwrap_or(true);

        let new_count = if stale { 1 } else { user.failed_login_attempts + 1 };
        let lockout_end = if new_count >= max_attempts as i64 {
            Some(now + lockout_duration)
        } else {
            None
        };

        sqlx::query(
            "UPDATE users SET failed_login_attempts = ?, lockout_end = ?, last_failed_login = ? WHERE id = ?",
        )
        .bind(new_count)
        .bind(lockout_end.map(|d| d.to_rfc3339()))
        .bind(now.to_rfc3339())
        .bind(user.id)
        .execute(&self.pool)
        .await?;

        debug!("login failure recorded for user {}: attempts={new_count} lockout_end={lockout_end:?}", user.id);
        Ok(())
    }

    pub async fn ensure_system_folder(&self, user_id: i64, system_type: SystemFolderType) -> CoreResult<Folder> {
        if let Some(folder) = self.find_system_folder(user_id, system_type).await? {
            return Ok(folder);
        }
        let name = system_type.as_str().to_string();
        let id = self.insert_folder(user_id, &name, Some(system_type)).await?;
        self.find_folder_by_id(id).await
    }

    async fn find_system_folder(&self, user_id: i64, system_type: SystemFolderType) -> CoreResult<Option<Folder>> {
        let row = sqlx::query(&folder_select_sql("WHERE user_id = ? AND system_type = ?"))
            .bind(user_id)
            .bind(system_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_folder))
    }

    pub async fn find_folder_by_name(&self, user_id: i64, name: &str) -> CoreResult<Option<Folder>> {
        if name.eq_ignore_ascii_case("INBOX") {
            return self.find_system_folder(user_id, SystemFolderType::Inbox).await;
        }
        let row = sqlx::query(&folder_select_sql("WHERE user_id = ? AND name = ?"))
            .bind(user_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_folder))
    }

    pub async fn find_folder_by_id(&self, folder_id: i64) -> CoreResult<Folder> {
        let row = sqlx::query(&folder_select_sql("WHERE id = ?"))
            .bind(folder_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_folder)
            .ok_or_else(|| CoreError::NotFound(format!("folder {folder_id}")))
    }

    pub async fn list_folders(&self, user_id: i64) -> CoreResult<Vec<Folder>> {
        let rows = sqlx::query(&folder_select_sql("WHERE user_id = ? ORDER BY name"))
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_folder).collect())
    }

    pub async fn create_folder(&self, user_id: i64, name: &str) -> CoreResult<Folder> {
        if self.find_folder_by_name(user_id, name).await?.is_some() {
            return Err(CoreError::Conflict(format!("folder {name} already exists")));
        }
        let id = self.insert_folder(user_id, name, None).await?;
        self.find_folder_by_id(id).await
    }

    async fn insert_folder(&self, user_id: i64, name: &str, system_type: Option<SystemFolderType>) -> CoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO folders (user_id, name, system_type, uid_next, uid_validity) VALUES (?, ?, ?, 1, 1)",
        )
        .bind(user_id)
        .bind(name)
        .bind(system_type.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn delete_folder(&self, user_id: i64, name: &str) -> CoreResult<()> {
        let folder = self
            .find_folder_by_name(user_id, name)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("folder {name}")))?;
        if folder.system_type.is_some() {
            return Err(CoreError::Syntax("cannot delete a system folder".to_string()));
        }
        sqlx::query("DELETE FROM user_messages WHERE folder_id = ?")
            .bind(folder.id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM folders WHERE id = ?")
            .bind(folder.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn next_uid_validity(&self) -> CoreResult<i64> {
        sqlx::query("UPDATE uid_validity_sequence SET value = value + 1 WHERE id = 1")
            .execute(&self.pool)
            .await?;
        let row = sqlx::query("SELECT value FROM uid_validity_sequence WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("value"))
    }
}

fn folder_select_sql(predicate: &str) -> String {
    format!(
        "SELECT id, user_id, name, system_type, uid_next, uid_validity, exists_count, recent_count, unseen_count, subscribed FROM folders {predicate}"
    )
}

fn row_to_folder(row: sqlx::sqlite::SqliteRow) -> Folder {
    Folder {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        system_type: row
            .get::<Option<String>, _>("system_type")
            .and_then(|s| SystemFolderType::from_str(&s)),
        uid_next: row.get("uid_next"),
        uid_validity: row.get("uid_validity"),
        exists_count: row.get("exists_count"),
        recent_count: row.get("recent_count"),
        unseen_count: row.get("unseen_count"),
        subscribed: row.get::<i64, _>("subscribed") != 0,
    }
}

fn row_to_user(row: sqlx::sqlite::SqliteRow) -> User {
    User {
        id: row.get("id"),
        username: row.get("username"),
        domain_id: row.get("domain_id"),
        password_hash: row.get("password_hash"),
        salt: row.get("salt"),
        full_name: row.get("full_name"),
        role: UserRole::from_str(&row.get::<String, _>("role")),
        can_receive: row.get::<i64, _>("can_receive") != 0,
        can_login: row.get::<i64, _>("can_login") != 0,
        failed_login_attempts: row.get("failed_login_attempts"),
        lockout_end: parse_ts(row.get::<Option<String>, _>("lockout_end")),
        last_failed_login: parse_ts(row.get::<Option<String>, _>("last_failed_login")),
        last_login: parse_ts(row.get::<Option<String>, _>("last_login")),
    }
}

pub(crate) fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|v| DateTime::parse_from_rfc3339(&v).ok()).map(|dt| dt.with_timezone(&Utc))
}
