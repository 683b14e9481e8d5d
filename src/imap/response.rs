// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Renders store-layer data as IMAP wire syntax: `ENVELOPE`,
//! `BODYSTRUCTURE`, flag lists, and quoted strings (`spec.md` §4.7).

use crate::store::models::StoredMessage;

pub fn quote(s: &str) -> String {
    format!("\"{}\"", crate::protocol::framing::escape_quoted(s))
}

pub fn flag_list(flags: &[String]) -> String {
    format!("({})", flags.join(" "))
}

/// Builds an RFC 3501 `ENVELOPE` structure from the message's cached
/// envelope fields. Each address is rendered as a single
/// `(name NIL mailbox host)` tuple rather than splitting local-part/host,
/// which is sufficient for clients that only redisplay the address.
pub fn envelope(message: &StoredMessage) -> String {
    let date = message.sent_date.unwrap_or(message.received_at).to_rfc2822();
    format!(
        "({} {} {} {} {} {} {} NIL NIL {})",
        quote(&date),
        quote(&message.subject),
        address_list(&message.from_address),
        address_list(&message.from_address),
        address_list(&message.from_address),
        address_list(&message.to_address),
        address_list(&message.cc),
        message.in_reply_to.as_deref().map(quote).unwrap_or_else(|| "NIL".to_string()),
    )
}

fn address_list(raw: &str) -> String {
    if raw.trim().is_empty() {
        return "NIL".to_string();
    }
    let addrs: Vec<String> = raw
        .split(',')
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .map(one_address)
        .collect();
    format!("({})", addrs.join(" "))
}

fn one_address(addr: &str) -> String {
    let (name, mailbox_host) = match addr.split_once('<') {
        Some((name, rest)) => (Some(name.trim()), rest.trim_end_matches('>')),
        None => (None, addr),
    };
    let (mailbox, host) = mailbox_host.split_once('@').unwrap_or((mailbox_host, ""));
    format!(
        "({} NIL {} {})",
        name.filter(|n| !n.is_empty()).map(quote).unwrap_or_else(|| "NIL".to_string()),
        quote(mailbox),
        quote(host),
    )
}

/// Minimal single-part `BODYSTRUCTURE`, derived from the cached
/// `body_structure` JSON (`spec.md` §4.6 step 2). Multipart messages are
/// flattened to their primary type since the store keeps only the
/// top-level MIME type, not the full part tree.
pub fn body_structure(message: &StoredMessage) -> String {
    let parsed: serde_json::Value = serde_json::from_str(&message.body_structure).unwrap_or_default();
    let mime_type = parsed.get("type").and_then(|v| v.as_str()).unwrap_or("text/plain");
    let (main, sub) = mime_type.split_once('/').unwrap_or(("text", "plain"));
    let lines = message.body.iter().filter(|&&b| b == b'\n').count() + 1;
    format!(
        "({} {} NIL NIL NIL \"7BIT\" {} {})",
        quote(&main.to_ascii_uppercase()),
        quote(&sub.to_ascii_uppercase()),
        message.size_bytes,
        lines,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_message() -> StoredMessage {
        StoredMessage {
            id: 1,
            header_message_id: "<1@x>".to_string(),
            from_address: "Alice <alice@example.com>".to_string(),
            to_address: "bob@example.com".to_string(),
            cc: String::new(),
            bcc: String::new(),
            subject: "Hi".to_string(),
            headers: String::new(),
            body: b"hello\r\nworld".to_vec(),
            body_html: None,
            size_bytes: 12,
            received_at: Utc::now(),
            sent_date: None,
            in_reply_to: None,
            references_header: None,
            body_structure: r#"{"type":"text/plain","size":12}"#.to_string(),
            envelope: "{}".to_string(),
        }
    }

    #[test]
    fn envelope_contains_subject_and_from() {
        let env = envelope(&sample_message());
        assert!(env.contains("\"Hi\""));
        assert!(env.contains("alice@example.com") || env.contains("\"alice\""));
    }

    #[test]
    fn body_structure_reflects_cached_type() {
        let bs = body_structure(&sample_message());
        assert!(bs.contains("\"TEXT\""));
        assert!(bs.contains("\"PLAIN\""));
    }
}
