// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SMTP session state machine (`spec.md` §4.5).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::auth::{AuthenticatedPrincipal, Authenticator};
use crate::delivery::LocalDelivery;
use crate::error::CoreError;
use crate::protocol::dotstuff::read_dot_stuffed_body;
use crate::protocol::framing::{LineReader, ReadOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connected,
    Greeted,
    Authenticated,
    MailFrom,
    RcptTo,
}

pub struct SmtpSession<R, W> {
    reader: LineReader<R>,
    writer: W,
    state: State,
    authenticated_address: Option<String>,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    authenticator: Arc<Authenticator>,
    delivery: Arc<LocalDelivery>,
    server_name: String,
    max_message_size: u64,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> SmtpSession<R, W> {
    pub fn new(reader: R, writer: W, authenticator: Arc<Authenticator>, delivery: Arc<LocalDelivery>, server_name: impl Into<String>, max_message_size: u64) -> Self {
        Self {
            reader: LineReader::new(reader),
            writer,
            state: State::Connected,
            authenticated_address: None,
            mail_from: None,
            rcpt_to: Vec::new(),
            authenticator,
            delivery,
            server_name: server_name.into(),
            max_message_size,
        }
    }

    pub async fn run(mut self) -> std::io::Result<()> {
        self.reply(220, &format!("{} postkeep ready", self.server_name)).await?;

        loop {
            let line = match self.reader.read_line().await {
                Ok(ReadOutcome::Line(line)) => line,
                Ok(ReadOutcome::Eof) => return Ok(()),
                Err(e) => {
                    warn!("SMTP session read error: {e}");
                    return Ok(());
                }
            };

            let (verb, rest) = split_command(&line);
            match verb.to_ascii_uppercase().as_str() {
                "HELO" => self.handle_helo(rest, false).await?,
                "EHLO" => self.handle_helo(rest, true).await?,
                "AUTH" => self.handle_auth(rest).await?,
                "MAIL" => self.handle_mail_from(rest).await?,
                "RCPT" => self.handle_rcpt_to(rest).await?,
                "DATA" => self.handle_data().await?,
                "RSET" => self.handle_rset().await?,
                "NOOP" => self.reply(250, "OK").await?,
                "HELP" => self.reply(214, "HELO EHLO AUTH MAIL RCPT DATA RSET NOOP QUIT HELP").await?,
                "QUIT" => {
                    self.reply(221, "Bye").await?;
                    return Ok(());
                }
                _ => self.reply(500, "Command not recognized").await?,
            }
        }
    }

    async fn handle_helo(&mut self, rest: &str, esmtp: bool) -> std::io::Result<()> {
        if rest.trim().is_empty() {
            return self.reply(501, "Syntax: HELO/EHLO hostname").await;
        }
        self.state = State::Greeted;
        self.mail_from = None;
        self.rcpt_to.clear();

        if esmtp {
            let lines = [
                format!("250-{} greets {}", self.server_name, rest.trim()),
                "250-AUTH PLAIN LOGIN".to_string(),
                "250-8BITMIME".to_string(),
                "250 ENHANCEDSTATUSCODES".to_string(),
            ];
            for (i, l) in lines.iter().enumerate() {
                let final_line = i == lines.len() - 1;
                self.write_line(l, final_line).await?;
            }
            Ok(())
        } else {
            self.reply(250, &format!("{} greets {}", self.server_name, rest.trim())).await
        }
    }

    async fn handle_auth(&mut self, rest: &str) -> std::io::Result<()> {
        if self.state == State::Connected {
            return self.reply(503, "Send HELO/EHLO first").await;
        }
        let mut parts = rest.splitn(2, ' ');
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
        let initial = parts.next();

        let credentials = match mechanism.as_str() {
            "PLAIN" => match initial {
                Some(payload) => self.decode_auth_plain(payload),
                None => {
                    self.reply(334, "").await?;
                    match self.reader.read_line().await? {
                        ReadOutcome::Line(line) => self.decode_auth_plain(&line),
                        ReadOutcome::Eof => return Ok(()),
                    }
                }
            },
            "LOGIN" => {
                self.reply(334, &BASE64.encode("Username:")).await?;
                let username = match self.reader.read_line().await? {
                    ReadOutcome::Line(line) => BASE64.decode(line.trim()).ok().and_then(|b| String::from_utf8(b).ok()),
                    ReadOutcome::Eof => return Ok(()),
                };
                self.reply(334, &BASE64.encode("Password:")).await?;
                let password = match self.reader.read_line().await? {
                    ReadOutcome::Line(line) => BASE64.decode(line.trim()).ok().and_then(|b| String::from_utf8(b).ok()),
                    ReadOutcome::Eof => return Ok(()),
                };
                username.zip(password)
            }
            other => {
                warn!("unsupported AUTH mechanism {other}");
                None
            }
        };

        let Some((username, password)) = credentials else {
            return self.reply(535, "Authentication failed").await;
        };

        match self.authenticator.authenticate(&username, &password).await {
            Ok(AuthenticatedPrincipal::TenantUser { user, .. }) => {
                self.authenticated_address = Some(username.clone());
                self.state = State::Authenticated;
                info!("SMTP AUTH succeeded for {}", user.username);
                self.reply(235, "Authentication successful").await
            }
            Ok(AuthenticatedPrincipal::HostAdmin(_)) => self.reply(235, "Authentication successful").await,
            Err(CoreError::LockedOut(_)) | Err(CoreError::AuthFailed) => self.reply(535, "Authentication failed").await,
            Err(e) => {
                warn!("SMTP AUTH internal error: {e}");
                self.reply(451, "Temporary authentication failure").await
            }
        }
    }

    fn decode_auth_plain(&self, payload: &str) -> Option<(String, String)> {
        let decoded = BASE64.decode(payload.trim()).ok()?;
        let mut parts = decoded.split(|&b| b == 0);
        let _authzid = parts.next()?;
        let authcid = parts.next()?;
        let password = parts.next()?;
        Some((String::from_utf8(authcid.to_vec()).ok()?, String::from_utf8(password.to_vec()).ok()?))
    }

    async fn handle_mail_from(&mut self, rest: &str) -> std::io::Result<()> {
        if self.state == State::Connected {
            return self.reply(503, "Send HELO/EHLO first").await;
        }
        let Some(address) = parse_path_argument(rest, "FROM:") else {
            return self.reply(501, "Syntax: MAIL FROM:<address>").await;
        };
        self.mail_from = Some(address);
        self.rcpt_to.clear();
        self.state = State::MailFrom;
        self.reply(250, "OK").await
    }

    async fn handle_rcpt_to(&mut self, rest: &str) -> std::io::Result<()> {
        if !matches!(self.state, State::MailFrom | State::RcptTo) {
            return self.reply(503, "Send MAIL FROM first").await;
        }
        let Some(address) = parse_path_argument(rest, "TO:") else {
            return self.reply(501, "Syntax: RCPT TO:<address>").await;
        };
        self.rcpt_to.push(address);
        self.state = State::RcptTo;
        self.reply(250, "OK").await
    }

    async fn handle_data(&mut self) -> std::io::Result<()> {
        if self.state != State::RcptTo || self.rcpt_to.is_empty() {
            return self.reply(503, "Send MAIL FROM/RCPT TO first").await;
        }
        self.reply(354, "Start mail input; end with <CRLF>.<CRLF>").await?;

        let body = match read_dot_stuffed_body(&mut self.reader).await {
            Ok(body) => body,
            Err(e) => {
                warn!("SMTP DATA read error: {e}");
                self.rewind_after_data();
                return self.reply(451, "Error reading message body").await;
            }
        };

        if body.len() as u64 > self.max_message_size {
            self.rewind_after_data();
            return self.reply(552, "Message size exceeds fixed maximum message size").await;
        }

        let mail_from = self.mail_from.clone().unwrap_or_default();
        let rcpt_to = self.rcpt_to.clone();

        match self.delivery.deliver(&mail_from, &rcpt_to, &body).await {
            Ok(outcome) if !outcome.delivered_to.is_empty() => {
                debug!("delivered to {:?}, rejected {:?}", outcome.delivered_to, outcome.rejected);
                self.rewind_after_data();
                self.reply(250, "OK: message accepted for delivery").await
            }
            Ok(_) => {
                self.rewind_after_data();
                self.reply(550, "No valid recipients").await
            }
            Err(e) => {
                warn!("local delivery failed: {e}");
                self.rewind_after_data();
                self.reply(451, "Requested action aborted: local error in processing").await
            }
        }
    }

    fn rewind_after_data(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.state = if self.authenticated_address.is_some() { State::Authenticated } else { State::Greeted };
    }

    async fn handle_rset(&mut self) -> std::io::Result<()> {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.state = if self.authenticated_address.is_some() { State::Authenticated } else { State::Greeted };
        self.reply(250, "OK").await
    }

    async fn reply(&mut self, code: u16, message: &str) -> std::io::Result<()> {
        self.write_line(&format!("{code} {message}"), true).await
    }

    async fn write_line(&mut self, line: &str, _final_line: bool) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await
    }
}

fn split_command(line: &str) -> (&str, &str) {
    match line.find(' ') {
        Some(idx) => (&line[..idx], line[idx + 1..].trim()),
        None => (line, ""),
    }
}

/// Extracts the address inside `<...>` following `FROM:`/`TO:`, per
/// `spec.md` §4.5: "`<…>` required".
fn parse_path_argument(rest: &str, prefix: &str) -> Option<String> {
    let upper = rest.to_ascii_uppercase();
    let prefix_upper = prefix.to_ascii_uppercase();
    let idx = upper.find(&prefix_upper)?;
    let after = rest[idx + prefix.len()..].trim_start();
    let start = after.find('<')?;
    let end = after[start..].find('>')? + start;
    Some(after[start + 1..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mail_from_path_argument() {
        assert_eq!(parse_path_argument("FROM:<alice@example.com>", "FROM:"), Some("alice@example.com".to_string()));
        assert_eq!(parse_path_argument("FROM:<alice@example.com> SIZE=100", "FROM:"), Some("alice@example.com".to_string()));
        assert_eq!(parse_path_argument("FROM:alice@example.com", "FROM:"), None);
    }

    #[test]
    fn splits_verb_and_remainder() {
        assert_eq!(split_command("MAIL FROM:<a@b.com>"), ("MAIL", "FROM:<a@b.com>"));
        assert_eq!(split_command("QUIT"), ("QUIT", ""));
    }
}
