// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use config::{Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpListenConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapListenConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pop3ListenConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockoutConfig {
    pub enabled: bool,
    pub max_failed_attempts: u32,
    pub lockout_duration_minutes: i64,
    pub reset_window_minutes: i64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failed_attempts: 5,
            lockout_duration_minutes: 15,
            reset_window_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub database_url: String,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub log: LogConfig,
    pub registry: RegistryConfig,
    pub smtp: SmtpListenConfig,
    pub imap: ImapListenConfig,
    pub pop3: Pop3ListenConfig,
    pub lockout: LockoutConfig,

    /// Directory tenant SQLite databases are created in, keyed by
    /// `DomainRegistry.database_name`.
    pub tenant_data_dir: String,
    /// Directory attachment blobs are written to (`{guid}.{ext}`).
    pub attachments_path: String,
    pub max_message_size_bytes: u64,
    pub storage_quota_per_user_bytes: u64,
    /// Domain under which HostAdmin accounts are resolved.
    pub reserved_admin_domain: String,
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let default_config_path = "config/default.toml";
        let path_to_use = config_path.unwrap_or(default_config_path);

        let builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("registry.database_url", "sqlite://data/registry.db")?
            .set_default("registry.cache_ttl_secs", 3600)?
            .set_default("registry.cache_capacity", 256)?
            .set_default("smtp.enabled", true)?
            .set_default("smtp.bind", "0.0.0.0")?
            .set_default("smtp.port", 2525)?
            .set_default("smtp.idle_timeout_secs", 600)?
            .set_default("imap.enabled", true)?
            .set_default("imap.bind", "0.0.0.0")?
            .set_default("imap.port", 1143)?
            .set_default("imap.idle_timeout_secs", 1800)?
            .set_default("pop3.enabled", true)?
            .set_default("pop3.bind", "0.0.0.0")?
            .set_default("pop3.port", 1110)?
            .set_default("pop3.idle_timeout_secs", 600)?
            .set_default("lockout.enabled", true)?
            .set_default("lockout.max_failed_attempts", 5)?
            .set_default("lockout.lockout_duration_minutes", 15)?
            .set_default("lockout.reset_window_minutes", 60)?
            .set_default("tenant_data_dir", "data/tenants")?
            .set_default("attachments_path", "data/attachments")?
            .set_default("max_message_size_bytes", 25 * 1024 * 1024)?
            .set_default("storage_quota_per_user_bytes", 5 * 1024 * 1024 * 1024i64)?
            .set_default("reserved_admin_domain", "admin.local")?
            .add_source(File::with_name(path_to_use).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load or parse configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_config_file() {
        let settings = Settings::new(Some("config/does-not-exist.toml")).unwrap();
        assert_eq!(settings.smtp.port, 2525);
        assert_eq!(settings.lockout.max_failed_attempts, 5);
        assert_eq!(settings.reserved_admin_domain, "admin.local");
    }
}
