// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use dotenvy::dotenv;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::broadcast;

use postkeep::auth::Authenticator;
use postkeep::clock::SystemClock;
use postkeep::config::Settings;
use postkeep::delivery::LocalDelivery;
use postkeep::domain::{DomainRegistry, DomainResolver};
use postkeep::listener;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    info!("starting postkeep server");

    let settings = match Settings::new(None) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to load configuration: {e:?}");
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()));
        }
    };

    std::fs::create_dir_all(&settings.tenant_data_dir)?;
    std::fs::create_dir_all(&settings.attachments_path)?;

    let registry = Arc::new(
        DomainRegistry::open(&settings.registry.database_url)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?,
    );

    let clock = Arc::new(SystemClock);
    let resolver = Arc::new(DomainResolver::new(
        registry.clone(),
        settings.tenant_data_dir.clone(),
        settings.attachments_path.clone(),
        chrono::Duration::seconds(settings.registry.cache_ttl_secs as i64),
        clock.clone(),
        settings.registry.cache_capacity,
    ));

    let authenticator = Arc::new(Authenticator::new(resolver.clone(), clock, settings.lockout.clone(), settings.reserved_admin_domain.clone()));
    let delivery = Arc::new(LocalDelivery::new(resolver.clone()));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let server_name = "postkeep".to_string();

    let smtp_handle = tokio::spawn(listener::run_smtp_listener(
        settings.smtp.clone(),
        authenticator.clone(),
        delivery,
        server_name.clone(),
        settings.max_message_size_bytes,
        shutdown_tx.subscribe(),
    ));
    let imap_handle = tokio::spawn(listener::run_imap_listener(settings.imap.clone(), authenticator.clone(), server_name.clone(), shutdown_tx.subscribe()));
    let pop3_handle = tokio::spawn(listener::run_pop3_listener(settings.pop3.clone(), authenticator, server_name, shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, notifying listeners");
    let _ = shutdown_tx.send(());

    for handle in [smtp_handle, imap_handle, pop3_handle] {
        if let Err(e) = handle.await {
            error!("listener task panicked: {e}");
        }
    }

    info!("postkeep server stopped");
    Ok(())
}
