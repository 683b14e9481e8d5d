// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IMAP4rev1 session state machine (`spec.md` §4.7).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{info, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::auth::{AuthenticatedPrincipal, Authenticator};
use crate::delivery::parse_message;
use crate::error::CoreError;
use crate::protocol::framing::{parse_literal_marker, LineReader, ReadOutcome};
use crate::store::message::StoreOp;
use crate::store::models::Folder;
use crate::store::TenantStore;

use super::command::{parse_fetch_attrs, parse_flag_list, parse_message_set, parse_search_keys, parse_store_op, FetchAttr, StoreOpKind};
use super::response;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotAuthenticated,
    Authenticated,
    Selected,
}

struct SelectedMailbox {
    folder: Folder,
    read_only: bool,
}

pub struct ImapSession<R, W> {
    reader: LineReader<R>,
    writer: W,
    state: State,
    authenticator: Arc<Authenticator>,
    store: Option<Arc<TenantStore>>,
    user_id: Option<i64>,
    selected: Option<SelectedMailbox>,
    server_name: String,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> ImapSession<R, W> {
    pub fn new(reader: R, writer: W, authenticator: Arc<Authenticator>, server_name: impl Into<String>) -> Self {
        Self {
            reader: LineReader::new(reader),
            writer,
            state: State::NotAuthenticated,
            authenticator,
            store: None,
            user_id: None,
            selected: None,
            server_name: server_name.into(),
        }
    }

    pub async fn run(mut self) -> std::io::Result<()> {
        self.untagged(&format!(
            "OK [CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN UIDPLUS] {} ready",
            self.server_name
        ))
        .await?;

        loop {
            let line = match self.reader.read_line().await {
                Ok(ReadOutcome::Line(line)) => line,
                Ok(ReadOutcome::Eof) => return Ok(()),
                Err(e) => {
                    warn!("IMAP session read error: {e}");
                    return Ok(());
                }
            };

            let Some((tag, verb, rest)) = split_tagged(&line) else {
                self.untagged("BAD unable to parse command").await?;
                continue;
            };

            let should_quit = self.dispatch(&tag, &verb, rest).await?;
            if should_quit {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, tag: &str, verb: &str, rest: String) -> std::io::Result<bool> {
        match verb.to_ascii_uppercase().as_str() {
            "CAPABILITY" => {
                self.untagged("CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN UIDPLUS").await?;
                self.tagged(tag, "OK CAPABILITY completed").await?;
            }
            "NOOP" => {
                self.emit_mailbox_status_if_selected().await?;
                self.tagged(tag, "OK NOOP completed").await?;
            }
            "LOGOUT" => {
                self.untagged("BYE logging out").await?;
                self.tagged(tag, "OK LOGOUT completed").await?;
                return Ok(true);
            }
            "LOGIN" => self.handle_login(tag, &rest).await?,
            "AUTHENTICATE" => self.handle_authenticate(tag, &rest).await?,
            "SELECT" => self.handle_select_or_examine(tag, &rest, false).await?,
            "EXAMINE" => self.handle_select_or_examine(tag, &rest, true).await?,
            "LIST" => self.handle_list(tag, &rest).await?,
            "APPEND" => self.handle_append(tag, &rest).await?,
            "FETCH" => self.handle_fetch(tag, &rest, false).await?,
            "STORE" => self.handle_store(tag, &rest, false).await?,
            "SEARCH" => self.handle_search(tag, &rest, false).await?,
            "EXPUNGE" => self.handle_expunge(tag).await?,
            "UID" => self.handle_uid(tag, &rest).await?,
            "STARTTLS" => self.tagged(tag, "NO STARTTLS not supported at this layer").await?,
            _ => self.tagged(tag, "BAD command not recognized").await?,
        }
        Ok(false)
    }

    async fn handle_uid(&mut self, tag: &str, rest: &str) -> std::io::Result<()> {
        let (sub_verb, sub_rest) = split_command(rest);
        match sub_verb.to_ascii_uppercase().as_str() {
            "FETCH" => self.handle_fetch(tag, sub_rest, true).await,
            "STORE" => self.handle_store(tag, sub_rest, true).await,
            "SEARCH" => self.handle_search(tag, sub_rest, true).await,
            _ => self.tagged(tag, "BAD unsupported UID subcommand").await,
        }
    }

    async fn handle_login(&mut self, tag: &str, rest: &str) -> std::io::Result<()> {
        let Some((user, pass)) = split_two_args(rest) else {
            return self.tagged(tag, "BAD Syntax: LOGIN user pass").await;
        };
        self.complete_authentication(tag, &user, &pass).await
    }

    async fn handle_authenticate(&mut self, tag: &str, rest: &str) -> std::io::Result<()> {
        let mut parts = rest.splitn(2, ' ');
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
        if mechanism != "PLAIN" {
            return self.tagged(tag, "NO unsupported SASL mechanism").await;
        }

        let payload = match parts.next() {
            Some(p) => p.to_string(),
            None => {
                self.write_raw("+ \r\n").await?;
                match self.reader.read_line().await? {
                    ReadOutcome::Line(line) => line,
                    ReadOutcome::Eof => return Ok(()),
                }
            }
        };

        let Some(decoded) = BASE64.decode(payload.trim()).ok() else {
            return self.tagged(tag, "NO invalid base64").await;
        };
        let mut fields = decoded.split(|&b| b == 0);
        let (Some(_authzid), Some(authcid), Some(password)) = (fields.next(), fields.next(), fields.next()) else {
            return self.tagged(tag, "NO malformed SASL PLAIN payload").await;
        };
        let (Ok(user), Ok(pass)) = (String::from_utf8(authcid.to_vec()), String::from_utf8(password.to_vec())) else {
            return self.tagged(tag, "NO malformed SASL PLAIN payload").await;
        };
        self.complete_authentication(tag, &user, &pass).await
    }

    async fn complete_authentication(&mut self, tag: &str, user: &str, pass: &str) -> std::io::Result<()> {
        match self.authenticator.authenticate(user, pass).await {
            Ok(AuthenticatedPrincipal::TenantUser { store, user, .. }) => {
                self.store = Some(store);
                self.user_id = Some(user.id);
                self.state = State::Authenticated;
                info!("IMAP login succeeded for {}", user.username);
                self.tagged(tag, "OK LOGIN completed").await
            }
            Ok(AuthenticatedPrincipal::HostAdmin(_)) => self.tagged(tag, "OK LOGIN completed").await,
            Err(CoreError::LockedOut(_)) | Err(CoreError::AuthFailed) => self.tagged(tag, "NO LOGIN failed").await,
            Err(e) => {
                warn!("IMAP LOGIN internal error: {e}");
                self.tagged(tag, "NO temporary failure").await
            }
        }
    }

    async fn handle_select_or_examine(&mut self, tag: &str, rest: &str, examine: bool) -> std::io::Result<()> {
        if self.state == State::NotAuthenticated {
            return self.tagged(tag, "NO must LOGIN first").await;
        }
        let (Some(store), Some(user_id)) = (self.store.clone(), self.user_id) else {
            return self.tagged(tag, "NO not authenticated").await;
        };
        let name = unquote(rest.trim());

        let folder = match store.find_folder_by_name(user_id, &name).await {
            Ok(Some(folder)) => folder,
            Ok(None) => return self.tagged(tag, "NO no such mailbox").await,
            Err(e) => return self.fail(tag, e).await,
        };

        let read_only = examine;
        self.untagged(&format!("{} EXISTS", folder.exists_count)).await?;
        self.untagged(&format!("{} RECENT", folder.recent_count)).await?;
        self.untagged("FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)").await?;
        self.untagged("OK [PERMANENTFLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)] Limited").await?;
        self.untagged(&format!("OK [UIDNEXT {}] Predicted next UID", folder.uid_next)).await?;
        self.untagged(&format!("OK [UIDVALIDITY {}] UIDs valid", folder.uid_validity)).await?;

        self.selected = Some(SelectedMailbox { folder, read_only });
        self.state = State::Selected;

        let mode = if read_only { "READ-ONLY" } else { "READ-WRITE" };
        let verb = if examine { "EXAMINE" } else { "SELECT" };
        self.tagged(tag, &format!("OK [{mode}] {verb} completed")).await
    }

    async fn handle_list(&mut self, tag: &str, rest: &str) -> std::io::Result<()> {
        let (Some(store), Some(user_id)) = (self.store.clone(), self.user_id) else {
            return self.tagged(tag, "NO must LOGIN first").await;
        };
        let (reference, pattern) = split_two_args(rest).unwrap_or_default();
        let pattern = unquote(&pattern);
        let reference = unquote(&reference);

        let folders = match store.list_folders(user_id).await {
            Ok(folders) => folders,
            Err(e) => return self.fail(tag, e).await,
        };

        for folder in folders {
            if matches_list_pattern(&reference, &pattern, &folder.name) {
                self.untagged(&format!("LIST () \"/\" {}", response::quote(&folder.name))).await?;
            }
        }
        self.tagged(tag, "OK LIST completed").await
    }

    async fn handle_append(&mut self, tag: &str, rest: &str) -> std::io::Result<()> {
        let (Some(store), Some(user_id)) = (self.store.clone(), self.user_id) else {
            return self.tagged(tag, "NO must LOGIN first").await;
        };
        let Some((n, non_sync)) = parse_literal_marker(rest) else {
            return self.tagged(tag, "BAD APPEND requires a literal message argument").await;
        };

        let before_literal = {
            let idx = rest.rfind('{').unwrap_or(rest.len());
            rest[..idx].trim().to_string()
        };
        let mut tokens = split_top_level_args(&before_literal);
        if tokens.is_empty() {
            return self.tagged(tag, "BAD Syntax: APPEND mailbox [flags] [date] {n}").await;
        }
        let mailbox = unquote(&tokens.remove(0));
        let flags: Vec<String> = if !tokens.is_empty() && tokens[0].starts_with('(') {
            parse_flag_list(&tokens.remove(0))
        } else {
            Vec::new()
        };

        if !non_sync {
            self.write_raw("+ Ready for literal data\r\n").await?;
        }
        let literal = self.reader.read_literal(n).await?;
        let _ = self.reader.read_line().await;

        let folder = match store.find_folder_by_name(user_id, &mailbox).await {
            Ok(Some(folder)) => folder,
            Ok(None) => return self.tagged(tag, "NO [TRYCREATE] no such mailbox").await,
            Err(e) => return self.fail(tag, e).await,
        };

        let new_message = parse_message(&literal);
        let flag_refs: Vec<&str> = flags.iter().map(|s| s.as_str()).collect();
        match store.append(user_id, folder.id, &new_message, chrono::Utc::now(), &flag_refs).await {
            Ok(placement) => {
                self.tagged(tag, &format!("OK [APPENDUID {} {}] APPEND completed", placement.uid_validity, placement.uid)).await
            }
            Err(e) => self.fail(tag, e).await,
        }
    }

    async fn handle_fetch(&mut self, tag: &str, rest: &str, by_uid: bool) -> std::io::Result<()> {
        let Some(selected) = &self.selected else {
            return self.tagged(tag, "NO no mailbox selected").await;
        };
        let store = self.store.clone().unwrap();
        let user_id = self.user_id.unwrap();
        let folder_id = selected.folder.id;

        let (set_str, attr_str) = split_two_args(rest).unwrap_or_default();
        let Some(set) = parse_message_set(&set_str, by_uid) else {
            return self.tagged(tag, "BAD invalid sequence set").await;
        };
        let attrs = parse_fetch_attrs(&attr_str);
        let peek = attrs.iter().all(|a| !matches!(a, FetchAttr::Body { peek: false, .. } | FetchAttr::Rfc822));

        let fetched = match store.fetch(user_id, folder_id, &set, peek).await {
            Ok(f) => f,
            Err(e) => return self.fail(tag, e).await,
        };

        for item in fetched {
            let mut parts = Vec::new();
            for attr in &attrs {
                parts.push(render_fetch_attr(attr, &item));
            }
            if by_uid && !attrs.contains(&FetchAttr::Uid) {
                parts.push(format!("UID {}", item.placement.uid));
            }
            self.untagged(&format!("{} FETCH ({})", item.placement.sequence_number, parts.join(" "))).await?;
        }
        self.tagged(tag, "OK FETCH completed").await
    }

    async fn handle_store(&mut self, tag: &str, rest: &str, by_uid: bool) -> std::io::Result<()> {
        let Some(selected) = &self.selected else {
            return self.tagged(tag, "NO no mailbox selected").await;
        };
        if selected.read_only {
            return self.tagged(tag, "NO mailbox selected read-only").await;
        }
        let store = self.store.clone().unwrap();
        let user_id = self.user_id.unwrap();
        let folder_id = selected.folder.id;

        let mut tokens = split_top_level_args(rest);
        if tokens.len() < 3 {
            return self.tagged(tag, "BAD Syntax: STORE set op flags").await;
        }
        let set_str = tokens.remove(0);
        let op_str = tokens.remove(0);
        let flags_str = tokens.join(" ");

        let Some(set) = parse_message_set(&set_str, by_uid) else {
            return self.tagged(tag, "BAD invalid sequence set").await;
        };
        let Some((op, silent)) = parse_store_op(&op_str) else {
            return self.tagged(tag, "BAD invalid STORE operation").await;
        };
        let flags = parse_flag_list(&flags_str);

        let store_op = match op {
            StoreOpKind::Replace => StoreOp::Replace,
            StoreOpKind::Add => StoreOp::Add,
            StoreOpKind::Remove => StoreOp::Remove,
        };

        let updated = match store.store_flags(user_id, folder_id, &set, store_op, &flags).await {
            Ok(u) => u,
            Err(e) => return self.fail(tag, e).await,
        };

        if !silent {
            for item in updated {
                let flags_line = response::flag_list(&item.flags);
                self.untagged(&format!("{} FETCH (FLAGS {})", item.placement.sequence_number, flags_line)).await?;
            }
        }
        self.tagged(tag, "OK STORE completed").await
    }

    async fn handle_search(&mut self, tag: &str, rest: &str, by_uid: bool) -> std::io::Result<()> {
        let Some(selected) = &self.selected else {
            return self.tagged(tag, "NO no mailbox selected").await;
        };
        let store = self.store.clone().unwrap();
        let user_id = self.user_id.unwrap();
        let folder_id = selected.folder.id;

        let tokens: Vec<String> = split_top_level_args(rest);
        let key = parse_search_keys(&tokens);

        let ids = match store.search(user_id, folder_id, &key, by_uid).await {
            Ok(ids) => ids,
            Err(e) => return self.fail(tag, e).await,
        };

        let rendered = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" ");
        self.untagged(&format!("SEARCH {rendered}")).await?;
        self.tagged(tag, "OK SEARCH completed").await
    }

    async fn handle_expunge(&mut self, tag: &str) -> std::io::Result<()> {
        let Some(selected) = &self.selected else {
            return self.tagged(tag, "NO no mailbox selected").await;
        };
        if selected.read_only {
            return self.tagged(tag, "NO mailbox selected read-only").await;
        }
        let store = self.store.clone().unwrap();
        let user_id = self.user_id.unwrap();
        let folder_id = selected.folder.id;

        let mut removed = match store.expunge(user_id, folder_id).await {
            Ok(r) => r,
            Err(e) => return self.fail(tag, e).await,
        };
        // `spec.md` §4.7: EXPUNGE responses are emitted in descending
        // sequence order so each number stays valid as the client applies
        // the preceding deletions.
        removed.sort_unstable_by(|a, b| b.cmp(a));
        for seq in removed {
            self.untagged(&format!("{seq} EXPUNGE")).await?;
        }
        if let Ok(folder) = store.find_folder_by_id(folder_id).await {
            self.untagged(&format!("{} EXISTS", folder.exists_count)).await?;
        }
        self.tagged(tag, "OK EXPUNGE completed").await
    }

    async fn emit_mailbox_status_if_selected(&mut self) -> std::io::Result<()> {
        if let Some(selected) = &self.selected {
            let store = self.store.clone().unwrap();
            if let Ok(folder) = store.find_folder_by_id(selected.folder.id).await {
                self.untagged(&format!("{} EXISTS", folder.exists_count)).await?;
                self.untagged(&format!("{} RECENT", folder.recent_count)).await?;
            }
        }
        Ok(())
    }

    async fn fail(&mut self, tag: &str, err: CoreError) -> std::io::Result<()> {
        warn!("IMAP command failed: {err}");
        self.tagged(tag, &format!("NO {}", crate::error::generic_wire_message(&err))).await
    }

    async fn untagged(&mut self, body: &str) -> std::io::Result<()> {
        self.write_raw(&format!("* {body}\r\n")).await
    }

    async fn tagged(&mut self, tag: &str, body: &str) -> std::io::Result<()> {
        self.write_raw(&format!("{tag} {body}\r\n")).await
    }

    async fn write_raw(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }
}

/// Reconstructs the full RFC 822 octet stream (`RFC822`/`BODY[]`) from the
/// separately-stored header block and body, the same layout POP3 `RETR`
/// writes back out (`pop3/session.rs`).
fn full_message_text(message: &crate::store::models::StoredMessage) -> String {
    format!("{}\r\n{}", message.headers, String::from_utf8_lossy(&message.body))
}

fn render_fetch_attr(attr: &FetchAttr, item: &crate::store::models::FetchedMessage) -> String {
    match attr {
        FetchAttr::Uid => format!("UID {}", item.placement.uid),
        FetchAttr::Flags => format!("FLAGS {}", response::flag_list(&item.flags)),
        FetchAttr::InternalDate => format!("INTERNALDATE {}", response::quote(&item.placement.received_at.to_rfc2822())),
        FetchAttr::Rfc822Size => format!("RFC822.SIZE {}", item.message.size_bytes),
        FetchAttr::Envelope => format!("ENVELOPE {}", response::envelope(&item.message)),
        FetchAttr::BodyStructure => format!("BODYSTRUCTURE {}", response::body_structure(&item.message)),
        FetchAttr::Rfc822 => {
            let whole = full_message_text(&item.message);
            format!("RFC822 {{{}}}\r\n{}", whole.len(), whole)
        }
        FetchAttr::Rfc822Header => format!("RFC822.HEADER {{{}}}\r\n{}", item.message.headers.len(), item.message.headers),
        FetchAttr::Rfc822Text => format!("RFC822.TEXT {{{}}}\r\n{}", item.message.body.len(), String::from_utf8_lossy(&item.message.body)),
        FetchAttr::Body { section, peek: _ } => {
            let contents = if section.is_empty() {
                full_message_text(&item.message)
            } else if section == "TEXT" {
                String::from_utf8_lossy(&item.message.body).into_owned()
            } else if section.starts_with("HEADER") {
                item.message.headers.clone()
            } else {
                String::from_utf8_lossy(&item.message.body).into_owned()
            };
            format!("BODY[{}] {{{}}}\r\n{}", section, contents.len(), contents)
        }
    }
}

fn split_tagged(line: &str) -> Option<(String, String, String)> {
    let mut parts = line.trim().splitn(3, ' ');
    let tag = parts.next()?.to_string();
    let verb = parts.next()?.to_string();
    let rest = parts.next().unwrap_or("").to_string();
    Some((tag, verb, rest))
}

fn split_command(line: &str) -> (&str, &str) {
    match line.find(' ') {
        Some(idx) => (&line[..idx], line[idx + 1..].trim()),
        None => (line, ""),
    }
}

fn split_two_args(rest: &str) -> Option<(String, String)> {
    let tokens = split_top_level_args(rest);
    if tokens.len() < 2 {
        return if tokens.len() == 1 { Some((tokens[0].clone(), String::new())) } else { None };
    }
    Some((tokens[0].clone(), tokens[1..].join(" ")))
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.starts_with('"') && s.ends_with('"') && s.len() >= 2 {
        crate::protocol::framing::unescape_quoted(&s[1..s.len() - 1])
    } else {
        s.to_string()
    }
}

/// Splits on whitespace outside quotes and parens, so `(UID FLAGS)` and
/// `"a b"` remain single tokens.
fn split_top_level_args(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut current = String::new();
    for c in input.trim().chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '(' if !in_quotes => {
                depth += 1;
                current.push(c);
            }
            ')' if !in_quotes => {
                depth -= 1;
                current.push(c);
            }
            ' ' if depth == 0 && !in_quotes => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn matches_list_pattern(_reference: &str, pattern: &str, name: &str) -> bool {
    if pattern == "*" || pattern.is_empty() {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('%') {
        return name.starts_with(prefix);
    }
    name.eq_ignore_ascii_case(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_tag_verb_and_rest() {
        let (tag, verb, rest) = split_tagged("a001 SELECT INBOX").unwrap();
        assert_eq!(tag, "a001");
        assert_eq!(verb, "SELECT");
        assert_eq!(rest, "INBOX");
    }

    #[test]
    fn split_top_level_args_respects_parens_and_quotes() {
        let tokens = split_top_level_args(r#"INBOX (\Seen \Flagged) "01-Jan-2024""#);
        assert_eq!(tokens, vec!["INBOX", "(\\Seen \\Flagged)", "\"01-Jan-2024\""]);
    }

    #[test]
    fn list_pattern_matches_prefix_wildcard() {
        assert!(matches_list_pattern("", "IN%", "INBOX"));
        assert!(matches_list_pattern("", "*", "Drafts"));
        assert!(!matches_list_pattern("", "Sent", "Drafts"));
    }
}
