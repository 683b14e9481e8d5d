// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Listener Supervisor: one TCP acceptor per configured protocol port,
//! each accepted connection handed to an isolated session task
//! (`spec.md` §2 item 9, §5).

use log::{error, info, warn};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::auth::Authenticator;
use crate::config::{ImapListenConfig, Pop3ListenConfig, SmtpListenConfig};
use crate::delivery::LocalDelivery;
use crate::imap::ImapSession;
use crate::pop3::Pop3Session;
use crate::smtp::SmtpSession;

/// Runs the SMTP acceptor loop until `shutdown` fires. A panic inside one
/// session task is caught by `tokio::spawn`'s own task boundary, so it
/// cannot take the listener down with it (`spec.md` §7).
pub async fn run_smtp_listener(
    config: SmtpListenConfig,
    authenticator: Arc<Authenticator>,
    delivery: Arc<LocalDelivery>,
    server_name: String,
    max_message_size: u64,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    if !config.enabled {
        return Ok(());
    }
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("SMTP listening on {addr}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => { warn!("SMTP accept error: {e}"); continue; }
                };
                info!("SMTP connection from {peer}");
                let authenticator = authenticator.clone();
                let delivery = delivery.clone();
                let server_name = server_name.clone();
                tokio::spawn(async move {
                    let (read_half, write_half) = socket.into_split();
                    let session = SmtpSession::new(read_half, write_half, authenticator, delivery, server_name, max_message_size);
                    if let Err(e) = session.run().await {
                        error!("SMTP session with {peer} ended in error: {e}");
                    }
                });
            }
            _ = shutdown.recv() => {
                info!("SMTP listener shutting down");
                return Ok(());
            }
        }
    }
}

pub async fn run_imap_listener(
    config: ImapListenConfig,
    authenticator: Arc<Authenticator>,
    server_name: String,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    if !config.enabled {
        return Ok(());
    }
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("IMAP listening on {addr}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => { warn!("IMAP accept error: {e}"); continue; }
                };
                info!("IMAP connection from {peer}");
                let authenticator = authenticator.clone();
                let server_name = server_name.clone();
                tokio::spawn(async move {
                    let (read_half, write_half) = socket.into_split();
                    let session = ImapSession::new(read_half, write_half, authenticator, server_name);
                    if let Err(e) = session.run().await {
                        error!("IMAP session with {peer} ended in error: {e}");
                    }
                });
            }
            _ = shutdown.recv() => {
                info!("IMAP listener shutting down");
                return Ok(());
            }
        }
    }
}

pub async fn run_pop3_listener(
    config: Pop3ListenConfig,
    authenticator: Arc<Authenticator>,
    server_name: String,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    if !config.enabled {
        return Ok(());
    }
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("POP3 listening on {addr}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => { warn!("POP3 accept error: {e}"); continue; }
                };
                info!("POP3 connection from {peer}");
                let authenticator = authenticator.clone();
                let server_name = server_name.clone();
                tokio::spawn(async move {
                    let (read_half, write_half) = socket.into_split();
                    let session = Pop3Session::new(read_half, write_half, authenticator, server_name);
                    if let Err(e) = session.run().await {
                        error!("POP3 session with {peer} ended in error: {e}");
                    }
                });
            }
            _ = shutdown.recv() => {
                info!("POP3 listener shutting down");
                return Ok(());
            }
        }
    }
}
