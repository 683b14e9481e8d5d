// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Row types for the tenant message store (`spec.md` §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRole {
    User,
    DomainAdmin,
    HostAdmin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::DomainAdmin => "domain_admin",
            UserRole::HostAdmin => "host_admin",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "domain_admin" => UserRole::DomainAdmin,
            "host_admin" => UserRole::HostAdmin,
            _ => UserRole::User,
        }
    }
}

/// System folder types (`spec.md` §9: "promote folder system types to a
/// sum type; never compare raw strings in hot paths").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemFolderType {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Spam,
    Outbox,
}

impl SystemFolderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemFolderType::Inbox => "INBOX",
            SystemFolderType::Sent => "SENT",
            SystemFolderType::Drafts => "DRAFTS",
            SystemFolderType::Trash => "TRASH",
            SystemFolderType::Spam => "SPAM",
            SystemFolderType::Outbox => "OUTBOX",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INBOX" => Some(SystemFolderType::Inbox),
            "SENT" => Some(SystemFolderType::Sent),
            "DRAFTS" => Some(SystemFolderType::Drafts),
            "TRASH" => Some(SystemFolderType::Trash),
            "SPAM" => Some(SystemFolderType::Spam),
            "OUTBOX" => Some(SystemFolderType::Outbox),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub domain_id: i64,
    pub password_hash: Vec<u8>,
    pub salt: Vec<u8>,
    pub full_name: String,
    pub role: UserRole,
    pub can_receive: bool,
    pub can_login: bool,
    pub failed_login_attempts: i64,
    pub lockout_end: Option<DateTime<Utc>>,
    pub last_failed_login: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Folder {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub system_type: Option<SystemFolderType>,
    pub uid_next: i64,
    pub uid_validity: i64,
    pub exists_count: i64,
    pub recent_count: i64,
    pub unseen_count: i64,
    pub subscribed: bool,
}

impl Folder {
    /// `spec.md` invariant: `INBOX` is case-insensitive.
    pub fn name_matches(&self, other: &str) -> bool {
        if self.system_type == Some(SystemFolderType::Inbox) || other.eq_ignore_ascii_case("INBOX") {
            self.name.eq_ignore_ascii_case(other)
        } else {
            self.name == other
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub header_message_id: String,
    pub from_address: String,
    pub to_address: String,
    pub cc: String,
    pub bcc: String,
    pub subject: String,
    pub headers: String,
    pub body: Vec<u8>,
    pub body_html: Option<String>,
    pub size_bytes: i64,
    pub received_at: DateTime<Utc>,
    pub sent_date: Option<DateTime<Utc>>,
    pub in_reply_to: Option<String>,
    pub references_header: Option<String>,
    pub body_structure: String,
    pub envelope: String,
}

#[derive(Debug, Clone)]
pub struct UserMessage {
    pub id: i64,
    pub user_id: i64,
    pub message_id: i64,
    pub folder_id: i64,
    pub uid: i64,
    pub uid_validity: i64,
    pub sequence_number: i64,
    pub received_at: DateTime<Utc>,
}

pub const STANDARD_FLAGS: &[&str] = &["\\Seen", "\\Answered", "\\Flagged", "\\Deleted", "\\Draft", "\\Recent"];

#[derive(Debug, Clone)]
pub struct MessageFlag {
    pub message_id: i64,
    pub user_id: i64,
    pub flag_name: String,
    pub is_set: bool,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub id: i64,
    pub message_id: i64,
    pub file_name: String,
    pub content_type: String,
    pub size: i64,
    pub file_guid: String,
    pub file_extension: String,
    pub file_path: String,
}

/// A message together with the caller's flags and its sequence/UID
/// placement, the shape FETCH/STORE responses are built from.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub placement: UserMessage,
    pub message: StoredMessage,
    pub flags: Vec<String>,
}
