// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Core of a self-hosted, multi-tenant mail server: SMTP receive,
//! IMAP4rev1, and POP3 engines over a shared per-domain message store.

pub mod auth;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod domain;
pub mod error;
pub mod imap;
pub mod listener;
pub mod pop3;
pub mod protocol;
pub mod smtp;
pub mod store;

pub mod prelude {
    pub use crate::auth::{AuthenticatedPrincipal, Authenticator};
    pub use crate::config::Settings;
    pub use crate::delivery::LocalDelivery;
    pub use crate::domain::{DomainRegistry, DomainResolver};
    pub use crate::error::{CoreError, CoreResult};
    pub use crate::store::TenantStore;

    pub use log::{debug, error, info, trace, warn};
    pub use std::sync::Arc;
    pub use thiserror::Error;
}
