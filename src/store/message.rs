// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Message placement operations: append, fetch, store, search, expunge,
//! move, status (`spec.md` §4.2).

use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::HashSet;

use super::models::{Attachment, Folder, FetchedMessage, StoredMessage, UserMessage, STANDARD_FLAGS};
use super::search::{MessageSet, SearchContext, SearchKey};
use super::{parse_ts, TenantStore};
use crate::error::{CoreError, CoreResult};

/// A parsed, not-yet-stored message, produced by local delivery or IMAP
/// APPEND (`spec.md` §4.6, §4.7).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub header_message_id: String,
    pub from_address: String,
    pub to_address: String,
    pub cc: String,
    pub bcc: String,
    pub subject: String,
    pub headers: String,
    pub body: Vec<u8>,
    pub body_html: Option<String>,
    pub sent_date: Option<DateTime<Utc>>,
    pub in_reply_to: Option<String>,
    pub references_header: Option<String>,
    pub body_structure: String,
    pub envelope: String,
    pub attachments: Vec<NewAttachment>,
}

/// A MIME attachment extracted during parsing, not yet written to disk
/// (`spec.md` §4.6 step 2, §6).
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Replace,
    Add,
    Remove,
}

#[derive(Debug, Clone)]
pub struct FolderStatus {
    pub exists: i64,
    pub recent: i64,
    pub unseen: i64,
    pub uid_next: i64,
    pub uid_validity: i64,
}

impl TenantStore {
    /// `spec.md` §4.2 `append`: allocate (or reuse) the canonical message,
    /// assign the next UID under the folder's critical section, and update
    /// the folder counters — all in one transaction.
    pub async fn append(
        &self,
        user_id: i64,
        folder_id: i64,
        new_message: &NewMessage,
        received_at: DateTime<Utc>,
        initial_flags: &[&str],
    ) -> CoreResult<UserMessage> {
        let mut tx = self.pool().begin().await?;

        let (message_id, newly_inserted) = find_or_insert_message(&mut tx, new_message, received_at).await?;
        if newly_inserted && !new_message.attachments.is_empty() {
            self.store_attachments(&mut tx, message_id, &new_message.attachments).await?;
        }

        // SQLite has no row-level locking; the transaction's write lock on
        // the database file is what actually serializes concurrent UID
        // assignment (`spec.md` §5).
        let folder_row = sqlx::query("SELECT uid_next, uid_validity FROM folders WHERE id = ?")
            .bind(folder_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("folder {folder_id}")))?;
        let uid: i64 = folder_row.get("uid_next");
        let uid_validity: i64 = folder_row.get("uid_validity");

        sqlx::query("UPDATE folders SET uid_next = uid_next + 1 WHERE id = ?")
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;

        let next_seq: i64 = sqlx::query("SELECT COALESCE(MAX(sequence_number), 0) + 1 AS n FROM user_messages WHERE folder_id = ?")
            .bind(folder_id)
            .fetch_one(&mut *tx)
            .await?
            .get("n");

        let result = sqlx::query(
            r#"
            INSERT INTO user_messages (user_id, message_id, folder_id, uid, uid_validity, sequence_number, received_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(message_id)
        .bind(folder_id)
        .bind(uid)
        .bind(uid_validity)
        .bind(next_seq)
        .bind(received_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        let placement_id = result.last_insert_rowid();

        for flag in initial_flags {
            set_flag(&mut tx, message_id, user_id, flag, received_at).await?;
        }

        recompute_folder_counters(&mut tx, folder_id).await?;
        tx.commit().await?;

        Ok(UserMessage {
            id: placement_id,
            user_id,
            message_id,
            folder_id,
            uid,
            uid_validity,
            sequence_number: next_seq,
            received_at,
        })
    }

    /// Writes each attachment's bytes to `{attachments_dir}/{guid}.{ext}`
    /// and inserts its `attachments` row, all inside the caller's
    /// transaction. Only called for a newly-inserted canonical message,
    /// since a `header_message_id` dedup hit already has its attachments
    /// on disk (`spec.md` §4.6 step 2, §6).
    async fn store_attachments(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        message_id: i64,
        attachments: &[NewAttachment],
    ) -> CoreResult<()> {
        for attachment in attachments {
            let guid = uuid::Uuid::new_v4().to_string();
            let extension = attachment
                .file_name
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
                .unwrap_or_default();
            let file_path = if extension.is_empty() {
                format!("{}/{guid}", self.attachments_dir())
            } else {
                format!("{}/{guid}.{extension}", self.attachments_dir())
            };

            tokio::fs::write(&file_path, &attachment.data)
                .await
                .map_err(|e| CoreError::internal(format!("failed to write attachment: {e}")))?;

            sqlx::query(
                r#"
                INSERT INTO attachments (message_id, file_name, content_type, size, file_guid, file_extension, file_path)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(message_id)
            .bind(&attachment.file_name)
            .bind(&attachment.content_type)
            .bind(attachment.data.len() as i64)
            .bind(&guid)
            .bind(&extension)
            .bind(&file_path)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// `spec.md` §4.2 `fetch`: return placements + canonical message + flags
    /// for the given id set. `peek` suppresses the `\Seen`-setting side
    /// effect that a non-`.PEEK` `BODY[...]` fetch implies; callers decide
    /// whether to peek based on which attributes were requested.
    pub async fn fetch(&self, user_id: i64, folder_id: i64, set: &MessageSet, peek: bool) -> CoreResult<Vec<FetchedMessage>> {
        let max = self.max_sequence(folder_id).await?;
        let rows = self.load_placements(folder_id).await?;

        let mut out = Vec::new();
        for um in rows {
            let key = if set.is_uid() { um.uid } else { um.sequence_number };
            if !set.matches(key, max) {
                continue;
            }
            let message = self.load_message(um.message_id).await?;
            let mut flags = self.load_flags(um.message_id, user_id).await?;

            if !peek && !flags.contains(&"\\Seen".to_string()) {
                let now = Utc::now();
                let mut tx = self.pool().begin().await?;
                set_flag(&mut tx, um.message_id, user_id, "\\Seen", now).await?;
                recompute_folder_counters(&mut tx, folder_id).await?;
                tx.commit().await?;
                flags.push("\\Seen".to_string());
            }

            out.push(FetchedMessage { placement: um, message, flags });
        }
        out.sort_by_key(|f| f.placement.sequence_number);
        Ok(out)
    }

    /// `spec.md` §4.2 `store`: apply REPLACE/ADD/REMOVE to the flag set for
    /// every placement in `set`, recomputing `unseen` if `\Seen` changed.
    pub async fn store_flags(
        &self,
        user_id: i64,
        folder_id: i64,
        set: &MessageSet,
        op: StoreOp,
        flags: &[String],
    ) -> CoreResult<Vec<FetchedMessage>> {
        let max = self.max_sequence(folder_id).await?;
        let placements = self.load_placements(folder_id).await?;
        let now = Utc::now();

        let mut touched = Vec::new();
        for um in placements {
            let key = if set.is_uid() { um.uid } else { um.sequence_number };
            if !set.matches(key, max) {
                continue;
            }

            let mut tx = self.pool().begin().await?;
            match op {
                StoreOp::Replace => {
                    for standard in STANDARD_FLAGS {
                        if *standard != "\\Recent" {
                            clear_flag(&mut tx, um.message_id, user_id, standard).await?;
                        }
                    }
                    for flag in flags {
                        set_flag(&mut tx, um.message_id, user_id, flag, now).await?;
                    }
                }
                StoreOp::Add => {
                    for flag in flags {
                        set_flag(&mut tx, um.message_id, user_id, flag, now).await?;
                    }
                }
                StoreOp::Remove => {
                    for flag in flags {
                        clear_flag(&mut tx, um.message_id, user_id, flag).await?;
                    }
                }
            }
            recompute_folder_counters(&mut tx, folder_id).await?;
            tx.commit().await?;

            let updated_flags = self.load_flags(um.message_id, user_id).await?;
            touched.push(FetchedMessage {
                message: self.load_message(um.message_id).await?,
                placement: um,
                flags: updated_flags,
            });
        }
        touched.sort_by_key(|f| f.placement.sequence_number);
        Ok(touched)
    }

    /// `spec.md` §4.2 `search`. Returns sequence numbers unless `by_uid`.
    pub async fn search(&self, user_id: i64, folder_id: i64, key: &SearchKey, by_uid: bool) -> CoreResult<Vec<i64>> {
        let placements = self.load_placements(folder_id).await?;
        let mut matches = Vec::new();
        for um in placements {
            let message = self.load_message(um.message_id).await?;
            let flags: HashSet<String> = self.load_flags(um.message_id, user_id).await?.into_iter().collect();
            let ctx = SearchContext { message: &message, flags: &flags };
            if key.matches(&ctx) {
                matches.push(if by_uid { um.uid } else { um.sequence_number });
            }
        }
        matches.sort_unstable();
        Ok(matches)
    }

    /// `spec.md` §4.2 `expunge`: remove every placement with `\Deleted` set,
    /// renumber sequence numbers contiguously, and return the *ascending*
    /// sequence numbers removed. Protocol layers that must emit untagged
    /// `EXPUNGE` responses in descending order reverse this themselves
    /// (`spec.md` §4.7) so the store stays agnostic of wire ordering.
    pub async fn expunge(&self, user_id: i64, folder_id: i64) -> CoreResult<Vec<i64>> {
        let placements = self.load_placements(folder_id).await?;
        let mut removed = Vec::new();

        let mut tx = self.pool().begin().await?;
        for um in &placements {
            let is_deleted = sqlx::query(
                "SELECT is_set FROM message_flags WHERE message_id = ? AND user_id = ? AND flag_name = '\\Deleted'",
            )
            .bind(um.message_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| r.get::<i64, _>("is_set") != 0)
            .unwrap_or(false);

            if !is_deleted {
                continue;
            }

            sqlx::query("DELETE FROM user_messages WHERE id = ?")
                .bind(um.id)
                .execute(&mut *tx)
                .await?;

            let still_referenced: i64 = sqlx::query("SELECT COUNT(*) AS n FROM user_messages WHERE message_id = ?")
                .bind(um.message_id)
                .fetch_one(&mut *tx)
                .await?
                .get("n");
            if still_referenced == 0 {
                sqlx::query("DELETE FROM message_flags WHERE message_id = ?")
                    .bind(um.message_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM messages WHERE id = ?")
                    .bind(um.message_id)
                    .execute(&mut *tx)
                    .await?;
            }

            removed.push(um.sequence_number);
        }

        renumber_sequence(&mut tx, folder_id).await?;
        recompute_folder_counters(&mut tx, folder_id).await?;
        tx.commit().await?;

        removed.sort_unstable();
        Ok(removed)
    }

    /// Moves `uids` from `src_folder` to `dst_folder`, reassigning fresh
    /// UIDs under the destination folder's counter (used by REST DELETE →
    /// TRASH and IMAP COPY-like semantics).
    pub async fn move_messages(&self, user_id: i64, src_folder: i64, dst_folder: i64, uids: &[i64]) -> CoreResult<()> {
        let mut tx = self.pool().begin().await?;
        for uid in uids {
            let row = sqlx::query("SELECT id, message_id, received_at FROM user_messages WHERE folder_id = ? AND uid = ?")
                .bind(src_folder)
                .bind(uid)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else { continue };
            let message_id: i64 = row.get("message_id");
            let received_at: String = row.get("received_at");
            let placement_id: i64 = row.get("id");

            let dst_row = sqlx::query("SELECT uid_next, uid_validity FROM folders WHERE id = ?")
                .bind(dst_folder)
                .fetch_one(&mut *tx)
                .await?;
            let new_uid: i64 = dst_row.get("uid_next");
            let uid_validity: i64 = dst_row.get("uid_validity");
            sqlx::query("UPDATE folders SET uid_next = uid_next + 1 WHERE id = ?")
                .bind(dst_folder)
                .execute(&mut *tx)
                .await?;

            let next_seq: i64 = sqlx::query("SELECT COALESCE(MAX(sequence_number), 0) + 1 AS n FROM user_messages WHERE folder_id = ?")
                .bind(dst_folder)
                .fetch_one(&mut *tx)
                .await?
                .get("n");

            sqlx::query("DELETE FROM user_messages WHERE id = ?")
                .bind(placement_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                r#"
                INSERT INTO user_messages (user_id, message_id, folder_id, uid, uid_validity, sequence_number, received_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(user_id)
            .bind(message_id)
            .bind(dst_folder)
            .bind(new_uid)
            .bind(uid_validity)
            .bind(next_seq)
            .bind(received_at)
            .execute(&mut *tx)
            .await?;
        }
        renumber_sequence(&mut tx, src_folder).await?;
        recompute_folder_counters(&mut tx, src_folder).await?;
        recompute_folder_counters(&mut tx, dst_folder).await?;
        tx.commit().await?;
        Ok(())
    }

    /// `spec.md` §4.2 `status`.
    pub async fn status(&self, folder: &Folder) -> CoreResult<FolderStatus> {
        Ok(FolderStatus {
            exists: folder.exists_count,
            recent: folder.recent_count,
            unseen: folder.unseen_count,
            uid_next: folder.uid_next,
            uid_validity: folder.uid_validity,
        })
    }

    async fn max_sequence(&self, folder_id: i64) -> CoreResult<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(sequence_number), 0) AS n FROM user_messages WHERE folder_id = ?")
            .bind(folder_id)
            .fetch_one(self.pool())
            .await?;
        Ok(row.get("n"))
    }

    async fn load_placements(&self, folder_id: i64) -> CoreResult<Vec<UserMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, message_id, folder_id, uid, uid_validity, sequence_number, received_at
            FROM user_messages WHERE folder_id = ? ORDER BY sequence_number
            "#,
        )
        .bind(folder_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| UserMessage {
                id: row.get("id"),
                user_id: row.get("user_id"),
                message_id: row.get("message_id"),
                folder_id: row.get("folder_id"),
                uid: row.get("uid"),
                uid_validity: row.get("uid_validity"),
                sequence_number: row.get("sequence_number"),
                received_at: parse_ts(row.get("received_at")).unwrap_or_else(Utc::now),
            })
            .collect())
    }

    pub(crate) async fn load_message(&self, message_id: i64) -> CoreResult<StoredMessage> {
        let row = sqlx::query(
            r#"
            SELECT id, header_message_id, from_address, to_address, cc, bcc, subject, headers,
                   body, body_html, size_bytes, received_at, sent_date, in_reply_to,
                   references_header, body_structure, envelope
            FROM messages WHERE id = ?
            "#,
        )
        .bind(message_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("message {message_id}")))?;

        Ok(StoredMessage {
            id: row.get("id"),
            header_message_id: row.get("header_message_id"),
            from_address: row.get("from_address"),
            to_address: row.get("to_address"),
            cc: row.get("cc"),
            bcc: row.get("bcc"),
            subject: row.get("subject"),
            headers: row.get("headers"),
            body: row.get("body"),
            body_html: row.get("body_html"),
            size_bytes: row.get("size_bytes"),
            received_at: parse_ts(row.get("received_at")).unwrap_or_else(Utc::now),
            sent_date: parse_ts(row.get("sent_date")),
            in_reply_to: row.get("in_reply_to"),
            references_header: row.get("references_header"),
            body_structure: row.get("body_structure"),
            envelope: row.get("envelope"),
        })
    }

    pub(crate) async fn load_flags(&self, message_id: i64, user_id: i64) -> CoreResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT flag_name FROM message_flags WHERE message_id = ? AND user_id = ? AND is_set = 1",
        )
        .bind(message_id)
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|r| r.get("flag_name")).collect())
    }

    /// Lists the attachments extracted from `message_id` at delivery time
    /// (`spec.md` §4.6 step 2).
    pub async fn list_attachments(&self, message_id: i64) -> CoreResult<Vec<Attachment>> {
        let rows = sqlx::query(
            "SELECT id, message_id, file_name, content_type, size, file_guid, file_extension, file_path FROM attachments WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| Attachment {
                id: row.get("id"),
                message_id: row.get("message_id"),
                file_name: row.get("file_name"),
                content_type: row.get("content_type"),
                size: row.get("size"),
                file_guid: row.get("file_guid"),
                file_extension: row.get("file_extension"),
                file_path: row.get("file_path"),
            })
            .collect())
    }
}

/// Returns the canonical message id plus whether it was just inserted
/// (as opposed to a `header_message_id` dedup hit), so callers know
/// whether to persist this delivery's attachments.
async fn find_or_insert_message(
    tx: &mut Transaction<'_, Sqlite>,
    new_message: &NewMessage,
    received_at: DateTime<Utc>,
) -> CoreResult<(i64, bool)> {
    if let Some(row) = sqlx::query("SELECT id FROM messages WHERE header_message_id = ?")
        .bind(&new_message.header_message_id)
        .fetch_optional(&mut **tx)
        .await?
    {
        return Ok((row.get("id"), false));
    }

    let result = sqlx::query(
        r#"
        INSERT INTO messages (
            header_message_id, from_address, to_address, cc, bcc, subject, headers, body,
            body_html, size_bytes, received_at, sent_date, in_reply_to, references_header,
            body_structure, envelope
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&new_message.header_message_id)
    .bind(&new_message.from_address)
    .bind(&new_message.to_address)
    .bind(&new_message.cc)
    .bind(&new_message.bcc)
    .bind(&new_message.subject)
    .bind(&new_message.headers)
    .bind(&new_message.body)
    .bind(&new_message.body_html)
    .bind((new_message.headers.len() + 2 + new_message.body.len()) as i64)
    .bind(received_at.to_rfc3339())
    .bind(new_message.sent_date.map(|d| d.to_rfc3339()))
    .bind(&new_message.in_reply_to)
    .bind(&new_message.references_header)
    .bind(&new_message.body_structure)
    .bind(&new_message.envelope)
    .execute(&mut **tx)
    .await?;

    Ok((result.last_insert_rowid(), true))
}

async fn set_flag(
    tx: &mut Transaction<'_, Sqlite>,
    message_id: i64,
    user_id: i64,
    flag: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO message_flags (message_id, user_id, flag_name, is_set, modified_at)
        VALUES (?, ?, ?, 1, ?)
        ON CONFLICT(message_id, user_id, flag_name) DO UPDATE SET is_set = 1, modified_at = excluded.modified_at
        "#,
    )
    .bind(message_id)
    .bind(user_id)
    .bind(flag)
    .bind(now.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn clear_flag(tx: &mut Transaction<'_, Sqlite>, message_id: i64, user_id: i64, flag: &str) -> CoreResult<()> {
    sqlx::query("UPDATE message_flags SET is_set = 0 WHERE message_id = ? AND user_id = ? AND flag_name = ?")
        .bind(message_id)
        .bind(user_id)
        .bind(flag)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn renumber_sequence(tx: &mut Transaction<'_, Sqlite>, folder_id: i64) -> CoreResult<()> {
    let ids: Vec<i64> = sqlx::query("SELECT id FROM user_messages WHERE folder_id = ? ORDER BY uid")
        .bind(folder_id)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .map(|r| r.get("id"))
        .collect();

    for (idx, id) in ids.into_iter().enumerate() {
        sqlx::query("UPDATE user_messages SET sequence_number = ? WHERE id = ?")
            .bind(idx as i64 + 1)
            .bind(id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// `spec.md` §8 invariant 1: `exists`/`unseen` are derived on every mutating
/// operation rather than drifting (`spec.md` §9: "never allow the two to
/// drift").
async fn recompute_folder_counters(tx: &mut Transaction<'_, Sqlite>, folder_id: i64) -> CoreResult<()> {
    let exists: i64 = sqlx::query("SELECT COUNT(*) AS n FROM user_messages WHERE folder_id = ?")
        .bind(folder_id)
        .fetch_one(&mut **tx)
        .await?
        .get("n");

    let unseen: i64 = sqlx::query(
        r#"
        SELECT COUNT(*) AS n FROM user_messages um
        WHERE um.folder_id = ?
        AND NOT EXISTS (
            SELECT 1 FROM message_flags mf
            WHERE mf.message_id = um.message_id AND mf.user_id = um.user_id
              AND mf.flag_name = '\Seen' AND mf.is_set = 1
        )
        "#,
    )
    .bind(folder_id)
    .fetch_one(&mut **tx)
    .await?
    .get("n");

    let recent: i64 = sqlx::query(
        r#"
        SELECT COUNT(*) AS n FROM user_messages um
        JOIN message_flags mf ON mf.message_id = um.message_id AND mf.user_id = um.user_id
        WHERE um.folder_id = ? AND mf.flag_name = '\Recent' AND mf.is_set = 1
        "#,
    )
    .bind(folder_id)
    .fetch_one(&mut **tx)
    .await?
    .get("n");

    sqlx::query("UPDATE folders SET exists_count = ?, unseen_count = ?, recent_count = ? WHERE id = ?")
        .bind(exists)
        .bind(unseen)
        .bind(recent)
        .bind(folder_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
