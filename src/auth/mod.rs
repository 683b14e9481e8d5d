// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Combines domain resolution, per-tenant user lookup, and the lockout
//! algorithm into a single `authenticate` entry point (`spec.md` §4.3).

pub mod password;

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::LockoutConfig;
use crate::domain::registry::HostAdmin;
use crate::domain::DomainResolver;
use crate::error::{CoreError, CoreResult};
use crate::store::models::User;
use crate::store::TenantStore;

/// The account that authenticated, together with whatever it takes to act
/// on its behalf: a tenant store handle for ordinary users, or nothing
/// extra for host admins, who live outside any tenant database.
pub enum AuthenticatedPrincipal {
    TenantUser { store: Arc<TenantStore>, domain_id: i64, user: User },
    HostAdmin(HostAdmin),
}

pub struct Authenticator {
    resolver: Arc<DomainResolver>,
    clock: Arc<dyn Clock>,
    lockout: LockoutConfig,
    reserved_admin_domain: String,
}

impl Authenticator {
    pub fn new(resolver: Arc<DomainResolver>, clock: Arc<dyn Clock>, lockout: LockoutConfig, reserved_admin_domain: impl Into<String>) -> Self {
        Self {
            resolver,
            clock,
            lockout,
            reserved_admin_domain: reserved_admin_domain.into(),
        }
    }

    /// `spec.md` §4.3 `authenticate(email, password)`.
    pub async fn authenticate(&self, email: &str, password: &str) -> CoreResult<AuthenticatedPrincipal> {
        let (local, domain) = split_email(email)?;

        if domain.eq_ignore_ascii_case(&self.reserved_admin_domain) {
            self.authenticate_host_admin(local, password).await
        } else {
            self.authenticate_tenant_user(local, domain, password).await
        }
    }

    async fn authenticate_tenant_user(&self, local: &str, domain: &str, password: &str) -> CoreResult<AuthenticatedPrincipal> {
        let store = self.resolver.resolve(domain).await?;
        let domain_id = store.ensure_domain_settings(domain).await?;

        let user = store
            .find_user(local, domain_id)
            .await?
            .ok_or(CoreError::AuthFailed)?;

        if !user.can_login {
            return Err(CoreError::AuthFailed);
        }

        let now = self.clock.now();
        if self.lockout.enabled {
            if let Some(lockout_end) = user.lockout_end {
                if lockout_end > now {
                    return Err(CoreError::LockedOut(lockout_end));
                }
            }
        }

        if !password::verify_password(password, &user.salt, &user.password_hash) {
            if self.lockout.enabled {
                store
                    .record_login_failure(
                        &user,
                        now,
                        chrono::Duration::minutes(self.lockout.reset_window_minutes),
                        self.lockout.max_failed_attempts,
                        chrono::Duration::minutes(self.lockout.lockout_duration_minutes),
                    )
                    .await?;
            }
            return Err(CoreError::AuthFailed);
        }

        if self.lockout.enabled {
            store.record_login_success(user.id, now).await?;
        }

        let refreshed = store.find_user_by_id(user.id).await?;
        Ok(AuthenticatedPrincipal::TenantUser { store, domain_id, user: refreshed })
    }

    async fn authenticate_host_admin(&self, local: &str, password: &str) -> CoreResult<AuthenticatedPrincipal> {
        let registry = self.resolver.registry();
        let admin = registry.find_host_admin(local).await?.ok_or(CoreError::AuthFailed)?;

        if !admin.can_login {
            return Err(CoreError::AuthFailed);
        }

        let now = self.clock.now();
        if self.lockout.enabled {
            if let Some(lockout_end) = admin.lockout_end {
                if lockout_end > now {
                    return Err(CoreError::LockedOut(lockout_end));
                }
            }
        }

        if !password::verify_password(password, &admin.salt, &admin.password_hash) {
            if self.lockout.enabled {
                registry
                    .record_host_admin_login_failure(
                        &admin,
                        now,
                        chrono::Duration::minutes(self.lockout.reset_window_minutes),
                        self.lockout.max_failed_attempts,
                        chrono::Duration::minutes(self.lockout.lockout_duration_minutes),
                    )
                    .await?;
            }
            return Err(CoreError::AuthFailed);
        }

        if self.lockout.enabled {
            registry.record_host_admin_login_success(admin.id, now).await?;
        }

        Ok(AuthenticatedPrincipal::HostAdmin(admin))
    }
}

fn split_email(email: &str) -> CoreResult<(&str, &str)> {
    email
        .split_once('@')
        .filter(|(local, domain)| !local.is_empty() && !domain.is_empty())
        .ok_or_else(|| CoreError::Syntax(format!("not a valid address: {email}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::domain::registry::DomainRegistry;
    use crate::store::models::UserRole;
    use chrono::TimeZone;
    use chrono::Utc;
    use tempfile::tempdir;

    async fn test_authenticator(clock: Arc<FakeClock>, lockout: LockoutConfig) -> (Authenticator, tempfile::TempDir) {
        let registry = Arc::new(DomainRegistry::open_in_memory().await.unwrap());
        registry.register_domain("example.com", "tenant_a").await.unwrap();
        let dir = tempdir().unwrap();
        let resolver = Arc::new(DomainResolver::new(
            registry,
            dir.path().to_string_lossy().to_string(),
            dir.path().join("attachments").to_string_lossy().to_string(),
            chrono::Duration::hours(1),
            clock.clone(),
            16,
        ));

        let store = resolver.resolve("example.com").await.unwrap();
        let domain_id = store.ensure_domain_settings("example.com").await.unwrap();
        let salt = password::generate_salt();
        let hash = password::hash_password("hunter2", &salt);
        store
            .create_user("alice", domain_id, &hash, &salt, "Alice", UserRole::User, true)
            .await
            .unwrap();

        let authenticator = Authenticator::new(resolver, clock, lockout, "admin.local");
        (authenticator, dir)
    }

    #[tokio::test]
    async fn correct_password_succeeds() {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let (auth, _dir) = test_authenticator(clock, LockoutConfig::default()).await;
        let result = auth.authenticate("alice@example.com", "hunter2").await;
        assert!(matches!(result, Ok(AuthenticatedPrincipal::TenantUser { .. })));
    }

    #[tokio::test]
    async fn wrong_password_fails_without_locking_on_first_attempt() {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let (auth, _dir) = test_authenticator(clock, LockoutConfig::default()).await;
        let result = auth.authenticate("alice@example.com", "wrong").await;
        assert!(matches!(result, Err(CoreError::AuthFailed)));
    }

    #[tokio::test]
    async fn fifth_failure_locks_the_account() {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let (auth, _dir) = test_authenticator(clock.clone(), LockoutConfig::default()).await;
        for _ in 0..4 {
            let _ = auth.authenticate("alice@example.com", "wrong").await;
        }
        // Fifth consecutive failure within the reset window crosses the
        // default threshold of 5 and locks the account.
        let _ = auth.authenticate("alice@example.com", "wrong").await;
        let result = auth.authenticate("alice@example.com", "hunter2").await;
        assert!(matches!(result, Err(CoreError::LockedOut(_))));
    }

    #[tokio::test]
    async fn stale_failure_resets_the_counter() {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let (auth, _dir) = test_authenticator(clock.clone(), LockoutConfig::default()).await;
        for _ in 0..3 {
            let _ = auth.authenticate("alice@example.com", "wrong").await;
        }
        clock.advance(chrono::Duration::minutes(61));
        for _ in 0..3 {
            let _ = auth.authenticate("alice@example.com", "wrong").await;
        }
        // Only 3 failures since the reset window elapsed; not locked yet.
        let result = auth.authenticate("alice@example.com", "hunter2").await;
        assert!(matches!(result, Ok(AuthenticatedPrincipal::TenantUser { .. })));
    }

    #[tokio::test]
    async fn malformed_address_is_a_syntax_error() {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let (auth, _dir) = test_authenticator(clock, LockoutConfig::default()).await;
        let result = auth.authenticate("not-an-email", "x").await;
        assert!(matches!(result, Err(CoreError::Syntax(_))));
    }
}
