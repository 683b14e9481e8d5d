// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! POP3 transaction state machine (`spec.md` §4.8).

use log::{info, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::auth::{AuthenticatedPrincipal, Authenticator};
use crate::error::CoreError;
use crate::protocol::dotstuff::write_byte_stuffed;
use crate::protocol::framing::{LineReader, ReadOutcome};
use crate::store::message::StoreOp;
use crate::store::models::SystemFolderType;
use crate::store::search::{IdRange, MessageSet};
use crate::store::TenantStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Authorization,
    Transaction,
}

/// One entry in the frozen INBOX view taken at `PASS` success
/// (`spec.md` §4.8: "TRANSACTION phase operates on a frozen snapshot").
#[derive(Debug, Clone)]
struct SnapshotEntry {
    uid: i64,
    size: i64,
    unique_id: String,
    deleted: bool,
}

pub struct Pop3Session<R, W> {
    reader: LineReader<R>,
    writer: W,
    state: State,
    authenticator: Arc<Authenticator>,
    pending_user: Option<String>,
    store: Option<Arc<TenantStore>>,
    user_id: Option<i64>,
    folder_id: Option<i64>,
    snapshot: Vec<SnapshotEntry>,
    server_name: String,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Pop3Session<R, W> {
    pub fn new(reader: R, writer: W, authenticator: Arc<Authenticator>, server_name: impl Into<String>) -> Self {
        Self {
            reader: LineReader::new(reader),
            writer,
            state: State::Authorization,
            authenticator,
            pending_user: None,
            store: None,
            user_id: None,
            folder_id: None,
            snapshot: Vec::new(),
            server_name: server_name.into(),
        }
    }

    pub async fn run(mut self) -> std::io::Result<()> {
        self.reply_ok(&format!("{} POP3 server ready", self.server_name)).await?;

        loop {
            let line = match self.reader.read_line().await {
                Ok(ReadOutcome::Line(line)) => line,
                Ok(ReadOutcome::Eof) => return Ok(()),
                Err(e) => {
                    warn!("POP3 session read error: {e}");
                    return Ok(());
                }
            };

            let (verb, rest) = split_command(&line);
            let quit = match verb.to_ascii_uppercase().as_str() {
                "USER" => self.handle_user(rest).await.map(|_| false)?,
                "PASS" => self.handle_pass(rest).await.map(|_| false)?,
                "STAT" => self.handle_stat().await.map(|_| false)?,
                "LIST" => self.handle_list(rest).await.map(|_| false)?,
                "RETR" => self.handle_retr(rest).await.map(|_| false)?,
                "TOP" => self.handle_top(rest).await.map(|_| false)?,
                "DELE" => self.handle_dele(rest).await.map(|_| false)?,
                "UIDL" => self.handle_uidl(rest).await.map(|_| false)?,
                "NOOP" => self.reply_ok("").await.map(|_| false)?,
                "RSET" => self.handle_rset().await.map(|_| false)?,
                "CAPA" => self.handle_capa().await.map(|_| false)?,
                "QUIT" => self.handle_quit().await.map(|_| true)?,
                _ => self.reply_err("command not recognized").await.map(|_| false)?,
            };
            if quit {
                return Ok(());
            }
        }
    }

    async fn handle_user(&mut self, rest: &str) -> std::io::Result<()> {
        if self.state != State::Authorization {
            return self.reply_err("already authenticated");
        }
        let name = rest.trim();
        if name.is_empty() {
            return self.reply_err("Syntax: USER name");
        }
        self.pending_user = Some(name.to_string());
        self.reply_ok("send PASS").await
    }

    async fn handle_pass(&mut self, rest: &str) -> std::io::Result<()> {
        let Some(username) = self.pending_user.clone() else {
            return self.reply_err("send USER first");
        };
        let password = rest.trim();

        match self.authenticator.authenticate(&username, password).await {
            Ok(AuthenticatedPrincipal::TenantUser { store, user, .. }) => {
                let inbox = match store.ensure_system_folder(user.id, SystemFolderType::Inbox).await {
                    Ok(f) => f,
                    Err(e) => return self.fail(e).await,
                };

                let set = MessageSet::Sequence(vec![IdRange { start: 1, end: None }]);
                let fetched = match store.fetch(user.id, inbox.id, &set, true).await {
                    Ok(f) => f,
                    Err(e) => return self.fail(e).await,
                };
                self.snapshot = fetched
                    .into_iter()
                    .map(|f| SnapshotEntry {
                        uid: f.placement.uid,
                        size: f.message.size_bytes,
                        unique_id: f.message.header_message_id,
                        deleted: false,
                    })
                    .collect();

                self.store = Some(store);
                self.user_id = Some(user.id);
                self.folder_id = Some(inbox.id);
                self.state = State::Transaction;
                info!("POP3 login succeeded for {}", user.username);
                self.reply_ok(&format!("{} messages", self.snapshot.len())).await
            }
            Ok(AuthenticatedPrincipal::HostAdmin(_)) => self.reply_err("host admins cannot use POP3"),
            Err(CoreError::LockedOut(_)) | Err(CoreError::AuthFailed) => self.reply_err("authentication failed"),
            Err(e) => {
                warn!("POP3 PASS internal error: {e}");
                self.reply_err("temporary failure")
            }
        }
    }

    async fn handle_stat(&mut self) -> std::io::Result<()> {
        if self.state != State::Transaction {
            return self.reply_err("not authenticated");
        }
        let (count, total) = self.live_totals();
        self.write_raw(&format!("+OK {count} {total}\r\n")).await
    }

    async fn handle_list(&mut self, rest: &str) -> std::io::Result<()> {
        if self.state != State::Transaction {
            return self.reply_err("not authenticated");
        }
        let arg = rest.trim();
        if arg.is_empty() {
            let (count, total) = self.live_totals();
            self.write_raw(&format!("+OK {count} messages ({total} octets)\r\n")).await?;
            for (i, entry) in self.snapshot.iter().enumerate() {
                if !entry.deleted {
                    self.write_raw(&format!("{} {}\r\n", i + 1, entry.size)).await?;
                }
            }
            self.write_raw(".\r\n").await
        } else {
            let Some((idx, entry)) = self.lookup(arg) else {
                return self.reply_err("no such message");
            };
            self.write_raw(&format!("+OK {} {}\r\n", idx + 1, entry.size)).await
        }
    }

    async fn handle_retr(&mut self, rest: &str) -> std::io::Result<()> {
        if self.state != State::Transaction {
            return self.reply_err("not authenticated");
        }
        let Some((_, entry)) = self.lookup(rest.trim()) else {
            return self.reply_err("no such message");
        };
        let uid = entry.uid;
        let store = self.store.clone().unwrap();
        let user_id = self.user_id.unwrap();
        let folder_id = self.folder_id.unwrap();

        let set = MessageSet::Uid(vec![IdRange::single(uid)]);
        let fetched = match store.fetch(user_id, folder_id, &set, true).await {
            Ok(f) => f,
            Err(e) => return self.fail(e).await,
        };
        let Some(item) = fetched.into_iter().next() else {
            return self.reply_err("no such message");
        };

        self.write_raw(&format!("+OK {} octets\r\n", item.message.size_bytes)).await?;
        let mut full = item.message.headers.clone().into_bytes();
        full.extend_from_slice(b"\r\n");
        full.extend_from_slice(&item.message.body);
        write_byte_stuffed(&mut self.writer, &full).await
    }

    async fn handle_top(&mut self, rest: &str) -> std::io::Result<()> {
        if self.state != State::Transaction {
            return self.reply_err("not authenticated");
        }
        let mut parts = rest.trim().splitn(2, ' ');
        let Some(n) = parts.next() else {
            return self.reply_err("Syntax: TOP n lines");
        };
        let lines: usize = match parts.next().and_then(|s| s.trim().parse().ok()) {
            Some(n) => n,
            None => return self.reply_err("Syntax: TOP n lines"),
        };

        let Some((_, entry)) = self.lookup(n) else {
            return self.reply_err("no such message");
        };
        let uid = entry.uid;
        let store = self.store.clone().unwrap();
        let user_id = self.user_id.unwrap();
        let folder_id = self.folder_id.unwrap();

        let set = MessageSet::Uid(vec![IdRange::single(uid)]);
        let fetched = match store.fetch(user_id, folder_id, &set, true).await {
            Ok(f) => f,
            Err(e) => return self.fail(e).await,
        };
        let Some(item) = fetched.into_iter().next() else {
            return self.reply_err("no such message");
        };

        self.write_raw("+OK top of message follows\r\n").await?;
        let mut out = item.message.headers.clone().into_bytes();
        out.extend_from_slice(b"\r\n");
        let body_text = String::from_utf8_lossy(&item.message.body);
        let truncated: String = body_text.lines().take(lines).collect::<Vec<_>>().join("\r\n");
        out.extend_from_slice(truncated.as_bytes());
        write_byte_stuffed(&mut self.writer, &out).await
    }

    async fn handle_dele(&mut self, rest: &str) -> std::io::Result<()> {
        if self.state != State::Transaction {
            return self.reply_err("not authenticated");
        }
        let arg = rest.trim().to_string();
        let Some((idx, entry)) = self.lookup(&arg) else {
            return self.reply_err("no such message");
        };
        if entry.deleted {
            return self.reply_err("message already deleted");
        }
        self.snapshot[idx].deleted = true;
        self.reply_ok(&format!("message {} deleted", idx + 1)).await
    }

    async fn handle_uidl(&mut self, rest: &str) -> std::io::Result<()> {
        if self.state != State::Transaction {
            return self.reply_err("not authenticated");
        }
        let arg = rest.trim();
        if arg.is_empty() {
            self.write_raw("+OK\r\n").await?;
            for (i, entry) in self.snapshot.iter().enumerate() {
                if !entry.deleted {
                    self.write_raw(&format!("{} {}\r\n", i + 1, entry.unique_id)).await?;
                }
            }
            self.write_raw(".\r\n").await
        } else {
            let Some((idx, entry)) = self.lookup(arg) else {
                return self.reply_err("no such message");
            };
            self.write_raw(&format!("+OK {} {}\r\n", idx + 1, entry.unique_id)).await
        }
    }

    async fn handle_rset(&mut self) -> std::io::Result<()> {
        for entry in &mut self.snapshot {
            entry.deleted = false;
        }
        self.reply_ok("deletion marks cleared").await
    }

    async fn handle_capa(&mut self) -> std::io::Result<()> {
        self.write_raw("+OK Capability list follows\r\n").await?;
        for line in ["USER", "TOP", "UIDL", "RESP-CODES", "PIPELINING"] {
            self.write_raw(&format!("{line}\r\n")).await?;
        }
        self.write_raw(".\r\n").await
    }

    /// `spec.md` §4.8: deletion is committed only on `QUIT` from
    /// TRANSACTION; an abnormal disconnect discards the marks instead.
    async fn handle_quit(&mut self) -> std::io::Result<()> {
        if self.state != State::Transaction {
            return self.reply_ok("goodbye").await;
        }

        let marked: Vec<i64> = self.snapshot.iter().filter(|e| e.deleted).map(|e| e.uid).collect();
        if !marked.is_empty() {
            let store = self.store.clone().unwrap();
            let user_id = self.user_id.unwrap();
            let folder_id = self.folder_id.unwrap();

            let ranges = marked.iter().map(|&uid| IdRange::single(uid)).collect();
            let set = MessageSet::Uid(ranges);
            if let Err(e) = store.store_flags(user_id, folder_id, &set, StoreOp::Add, &["\\Deleted".to_string()]).await {
                warn!("POP3 QUIT failed to mark deletions: {e}");
                return self.reply_err("deletion failed");
            }
            if let Err(e) = store.expunge(user_id, folder_id).await {
                warn!("POP3 QUIT failed to commit deletions: {e}");
                return self.reply_err("deletion failed");
            }
        }

        self.reply_ok(&format!("{} deleted", marked.len())).await
    }

    fn live_totals(&self) -> (usize, i64) {
        let live: Vec<&SnapshotEntry> = self.snapshot.iter().filter(|e| !e.deleted).collect();
        (live.len(), live.iter().map(|e| e.size).sum())
    }

    fn lookup(&self, arg: &str) -> Option<(usize, &SnapshotEntry)> {
        let n: usize = arg.parse().ok()?;
        let idx = n.checked_sub(1)?;
        let entry = self.snapshot.get(idx)?;
        if entry.deleted {
            None
        } else {
            Some((idx, entry))
        }
    }

    async fn fail(&mut self, err: CoreError) -> std::io::Result<()> {
        warn!("POP3 command failed: {err}");
        self.reply_err(crate::error::generic_wire_message(&err)).await
    }

    async fn reply_ok(&mut self, message: &str) -> std::io::Result<()> {
        if message.is_empty() {
            self.write_raw("+OK\r\n").await
        } else {
            self.write_raw(&format!("+OK {message}\r\n")).await
        }
    }

    async fn reply_err(&mut self, message: &str) -> std::io::Result<()> {
        self.write_raw(&format!("-ERR {message}\r\n")).await
    }

    async fn write_raw(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }
}

fn split_command(line: &str) -> (&str, &str) {
    match line.find(' ') {
        Some(idx) => (&line[..idx], line[idx + 1..].trim()),
        None => (line, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_verb_and_remainder() {
        assert_eq!(split_command("RETR 3"), ("RETR", "3"));
        assert_eq!(split_command("QUIT"), ("QUIT", ""));
    }

    #[test]
    fn lookup_excludes_deleted_entries() {
        let session_snapshot = vec![
            SnapshotEntry { uid: 1, size: 10, unique_id: "a".into(), deleted: false },
            SnapshotEntry { uid: 2, size: 20, unique_id: "b".into(), deleted: true },
        ];
        let fake = TestHelper { snapshot: session_snapshot };
        assert!(fake.lookup_test("1").is_some());
        assert!(fake.lookup_test("2").is_none());
    }

    struct TestHelper {
        snapshot: Vec<SnapshotEntry>,
    }

    impl TestHelper {
        fn lookup_test(&self, arg: &str) -> Option<(usize, &SnapshotEntry)> {
            let n: usize = arg.parse().ok()?;
            let idx = n.checked_sub(1)?;
            let entry = self.snapshot.get(idx)?;
            if entry.deleted {
                None
            } else {
                Some((idx, entry))
            }
        }
    }
}
