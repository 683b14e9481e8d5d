// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Local delivery: parses a raw RFC 822 message once and appends it to
//! every local recipient's INBOX (`spec.md` §4.6).

use chrono::Utc;
use log::{info, warn};
use mail_parser::{Address, MessageParser, MimeHeaders};
use std::sync::Arc;

use crate::domain::DomainResolver;
use crate::error::CoreResult;
use crate::store::message::{NewAttachment, NewMessage};
use crate::store::models::SystemFolderType;

pub struct LocalDelivery {
    resolver: Arc<DomainResolver>,
}

#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub delivered_to: Vec<String>,
    pub rejected: Vec<(String, &'static str)>,
}

impl LocalDelivery {
    pub fn new(resolver: Arc<DomainResolver>) -> Self {
        Self { resolver }
    }

    /// `spec.md` §4.6: attempts delivery to every recipient independently;
    /// a non-local or unknown recipient is rejected rather than failing
    /// the whole transaction, since relaying to a remote hop is out of
    /// scope (`spec.md` §1 Non-goals).
    pub async fn deliver(&self, _mail_from: &str, rcpt_to: &[String], raw_message: &[u8]) -> CoreResult<DeliveryOutcome> {
        let new_message = parse_message(raw_message);

        let mut delivered_to = Vec::new();
        let mut rejected = Vec::new();

        for recipient in rcpt_to {
            match self.deliver_one(recipient, &new_message).await {
                Ok(()) => delivered_to.push(recipient.clone()),
                Err(reason) => {
                    warn!("rejecting delivery to {recipient}: {reason}");
                    rejected.push((recipient.clone(), reason));
                }
            }
        }

        Ok(DeliveryOutcome { delivered_to, rejected })
    }

    async fn deliver_one(&self, recipient: &str, new_message: &NewMessage) -> Result<(), &'static str> {
        let (local_part, domain) = recipient.split_once('@').ok_or("malformed recipient address")?;

        let store = self.resolver.resolve(domain).await.map_err(|_| "unknown domain")?;
        let domain_id = store.ensure_domain_settings(domain).await.map_err(|_| "internal error")?;

        let user = match store.find_user(local_part, domain_id).await.map_err(|_| "internal error")? {
            Some(user) => user,
            None => {
                let domain_settings = store.find_domain_catch_all(domain_id).await.map_err(|_| "internal error")?;
                match domain_settings {
                    Some(catch_all_user_id) => store.find_user_by_id(catch_all_user_id).await.map_err(|_| "no such user")?,
                    None => return Err("no such user"),
                }
            }
        };

        if !user.can_receive {
            return Err("recipient cannot receive mail");
        }

        let inbox = store.ensure_system_folder(user.id, SystemFolderType::Inbox).await.map_err(|_| "internal error")?;
        store
            .append(user.id, inbox.id, new_message, Utc::now(), &["\\Recent"])
            .await
            .map_err(|_| "delivery failed")?;

        info!("delivered message {} to {}", new_message.header_message_id, recipient);
        Ok(())
    }
}

/// Parses a raw RFC 822 message into a [`NewMessage`], computing the
/// `envelope`/`body_structure` cache once (`spec.md` §4.6 step 2). Shared
/// by local delivery and IMAP `APPEND`, which both produce a `NewMessage`
/// from raw bytes.
pub fn parse_message(raw_message: &[u8]) -> NewMessage {
    let parsed = MessageParser::default().parse(raw_message);

    let header_message_id = parsed
        .as_ref()
        .and_then(|m| m.message_id())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("generated-{}@local", uuid::Uuid::new_v4()));
    let from_address = parsed
        .as_ref()
        .and_then(|m| m.from())
        .and_then(|addrs| addrs.first())
        .map(format_address)
        .unwrap_or_default();
    let to_address = parsed.as_ref().and_then(|m| m.to()).map(join_addresses).unwrap_or_default();
    let cc = parsed.as_ref().and_then(|m| m.cc()).map(join_addresses).unwrap_or_default();
    let bcc = parsed.as_ref().and_then(|m| m.bcc()).map(join_addresses).unwrap_or_default();
    let subject = parsed.as_ref().and_then(|m| m.subject()).unwrap_or_default().to_string();
    let body_text = parsed
        .as_ref()
        .and_then(|m| m.text_bodies().next())
        .map(|p| String::from_utf8_lossy(p.contents()).into_owned());
    let body_html = parsed
        .as_ref()
        .and_then(|m| m.html_bodies().next())
        .map(|p| String::from_utf8_lossy(p.contents()).into_owned());
    let sent_date = parsed
        .as_ref()
        .and_then(|m| m.date())
        .and_then(|d| chrono::DateTime::parse_from_rfc3339(&d.to_rfc3339()).ok().map(|dt| dt.with_timezone(&Utc)));
    let in_reply_to = parsed.as_ref().and_then(|m| m.in_reply_to().as_text()).map(|s| s.to_string());
    let references_header = parsed
        .as_ref()
        .and_then(|m| m.references().as_text_list())
        .map(|refs| refs.join(" "));
    let attachments = parsed.as_ref().map(extract_attachments).unwrap_or_default();

    let header_end = find_header_boundary(raw_message);
    let headers = String::from_utf8_lossy(&raw_message[..header_end]).into_owned();
    let body = raw_message.get(header_end + 2..).unwrap_or(&[]).to_vec();
    let envelope = build_envelope(&from_address, &to_address, &cc, &subject, &header_message_id);
    let body_structure = build_body_structure(body_text.as_deref(), body_html.as_deref(), raw_message.len());

    NewMessage {
        header_message_id,
        from_address,
        to_address,
        cc,
        bcc,
        subject,
        headers,
        body,
        body_html,
        sent_date,
        in_reply_to,
        references_header,
        body_structure,
        envelope,
        attachments,
    }
}

/// Pulls the attachment parts out of a parsed message (`spec.md` §4.6 step
/// 2): a part counts as an attachment when `mail-parser` reports a
/// `Content-Disposition` filename for it.
fn extract_attachments(message: &mail_parser::Message) -> Vec<NewAttachment> {
    message
        .attachments()
        .map(|part| {
            let file_name = part.attachment_name().unwrap_or("attachment").to_string();
            let content_type = part
                .content_type()
                .map(|ct| format!("{}/{}", ct.c_type, ct.c_subtype.as_ref().map(|s| s.as_ref()).unwrap_or("octet-stream")))
                .unwrap_or_else(|| "application/octet-stream".to_string());
            NewAttachment {
                file_name,
                content_type,
                data: part.contents().to_vec(),
            }
        })
        .collect()
}

fn format_address(addr: &mail_parser::Addr) -> String {
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) => format!("{name} <{address}>"),
        (None, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}

fn join_addresses(address: &Address) -> String {
    match address {
        Address::List(addrs) => addrs.iter().map(format_address).collect::<Vec<_>>().join(", "),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter())
            .map(format_address)
            .collect::<Vec<_>>()
            .join(", "),
    }
}

/// `mail-parser` exposes individual headers, not the raw block; IMAP
/// `RFC822.HEADER`/`BODY[HEADER]` fetch items want the literal header
/// bytes, so we slice them out of the raw message instead of
/// reconstructing them from the parsed representation. The returned index
/// points just past the header block's trailing CRLF; the blank line's
/// second CRLF and everything after it is the body.
fn find_header_boundary(raw_message: &[u8]) -> usize {
    raw_message
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 2)
        .unwrap_or(raw_message.len())
}

fn build_envelope(from: &str, to: &str, cc: &str, subject: &str, message_id: &str) -> String {
    serde_json::json!({
        "subject": subject,
        "from": from,
        "to": to,
        "cc": cc,
        "message_id": message_id,
    })
    .to_string()
}

fn build_body_structure(text: Option<&str>, html: Option<&str>, total_size: usize) -> String {
    let mime_type = match (text.is_some(), html.is_some()) {
        (_, true) => "text/html",
        (true, false) => "text/plain",
        (false, false) => "application/octet-stream",
    };
    serde_json::json!({
        "type": mime_type,
        "size": total_size,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::domain::registry::DomainRegistry;
    use chrono::TimeZone;
    use chrono::Utc;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn delivers_to_known_local_recipient() {
        let registry = Arc::new(DomainRegistry::open_in_memory().await.unwrap());
        registry.register_domain("example.com", "tenant_a").await.unwrap();
        let dir = tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let resolver = Arc::new(DomainResolver::new(
            registry,
            dir.path().to_string_lossy().to_string(),
            dir.path().join("attachments").to_string_lossy().to_string(),
            chrono::Duration::hours(1),
            clock,
            16,
        ));

        let store = resolver.resolve("example.com").await.unwrap();
        let domain_id = store.ensure_domain_settings("example.com").await.unwrap();
        store
            .create_user("alice", domain_id, b"hash", b"salt", "Alice", crate::store::models::UserRole::User, true)
            .await
            .unwrap();

        let delivery = LocalDelivery::new(resolver);
        let raw = b"From: bob@other.com\r\nTo: alice@example.com\r\nSubject: hi\r\nMessage-ID: <1@other.com>\r\n\r\nhello\r\n";
        let outcome = delivery.deliver("bob@other.com", &["alice@example.com".to_string()], raw).await.unwrap();
        assert_eq!(outcome.delivered_to, vec!["alice@example.com".to_string()]);
        assert!(outcome.rejected.is_empty());
    }

    #[tokio::test]
    async fn rejects_unknown_recipient_without_catch_all() {
        let registry = Arc::new(DomainRegistry::open_in_memory().await.unwrap());
        registry.register_domain("example.com", "tenant_a").await.unwrap();
        let dir = tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let resolver = Arc::new(DomainResolver::new(
            registry,
            dir.path().to_string_lossy().to_string(),
            dir.path().join("attachments").to_string_lossy().to_string(),
            chrono::Duration::hours(1),
            clock,
            16,
        ));
        let delivery = LocalDelivery::new(resolver);

        let raw = b"From: bob@other.com\r\nTo: nobody@example.com\r\nSubject: hi\r\n\r\nhello\r\n";
        let outcome = delivery.deliver("bob@other.com", &["nobody@example.com".to_string()], raw).await.unwrap();
        assert!(outcome.delivered_to.is_empty());
        assert_eq!(outcome.rejected[0].0, "nobody@example.com");
    }
}
