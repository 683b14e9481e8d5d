// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SEARCH criteria (`spec.md` §4.2) and the ranged id-sets FETCH/STORE/
//! SEARCH/EXPUNGE operate on (sequence numbers or UIDs).

use chrono::NaiveDate;
use std::collections::HashSet;

use super::models::StoredMessage;

/// An inclusive range of sequence numbers or UIDs; `None` as the upper
/// bound means "*" (the highest existing value).
#[derive(Debug, Clone, Copy)]
pub struct IdRange {
    pub start: i64,
    pub end: Option<i64>,
}

impl IdRange {
    pub fn single(value: i64) -> Self {
        Self { start: value, end: Some(value) }
    }

    pub fn contains(&self, value: i64, max: i64) -> bool {
        let end = self.end.unwrap_or(max);
        let (lo, hi) = if self.start <= end { (self.start, end) } else { (end, self.start) };
        value >= lo && value <= hi
    }
}

#[derive(Debug, Clone)]
pub enum MessageSet {
    Sequence(Vec<IdRange>),
    Uid(Vec<IdRange>),
}

impl MessageSet {
    pub fn is_uid(&self) -> bool {
        matches!(self, MessageSet::Uid(_))
    }

    pub fn ranges(&self) -> &[IdRange] {
        match self {
            MessageSet::Sequence(r) | MessageSet::Uid(r) => r,
        }
    }

    pub fn matches(&self, value: i64, max: i64) -> bool {
        self.ranges().iter().any(|r| r.contains(value, max))
    }
}

/// The date comparisons in `SearchKey::{Before,On,Since}` compare at
/// day granularity, per RFC 3501.
#[derive(Debug, Clone)]
pub enum DateField {
    Received,
    Sent,
}

#[derive(Debug, Clone)]
pub enum SearchKey {
    All,
    Body(String),
    Text(String),
    Header(String, String),
    Subject(String),
    From(String),
    To(String),
    Cc(String),
    Bcc(String),
    Before(DateField, NaiveDate),
    On(DateField, NaiveDate),
    Since(DateField, NaiveDate),
    Larger(i64),
    Smaller(i64),
    FlagSet(String),
    FlagUnset(String),
    And(Vec<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    Not(Box<SearchKey>),
}

/// Evaluation context: the message plus the caller's per-user flag set.
pub struct SearchContext<'a> {
    pub message: &'a StoredMessage,
    pub flags: &'a HashSet<String>,
}

impl SearchKey {
    pub fn matches(&self, ctx: &SearchContext) -> bool {
        match self {
            SearchKey::All => true,
            SearchKey::Body(needle) => contains_ci(&ctx.message.body_text(), needle),
            SearchKey::Text(needle) => {
                contains_ci(&ctx.message.headers, needle) || contains_ci(&ctx.message.body_text(), needle)
            }
            SearchKey::Header(name, needle) => header_contains(&ctx.message.headers, name, needle),
            SearchKey::Subject(needle) => contains_ci(&ctx.message.subject, needle),
            SearchKey::From(needle) => contains_ci(&ctx.message.from_address, needle),
            SearchKey::To(needle) => contains_ci(&ctx.message.to_address, needle),
            SearchKey::Cc(needle) => contains_ci(&ctx.message.cc, needle),
            SearchKey::Bcc(needle) => contains_ci(&ctx.message.bcc, needle),
            SearchKey::Before(field, date) => date_of(ctx.message, field).map(|d| d < *date).unwrap_or(false),
            SearchKey::On(field, date) => date_of(ctx.message, field).map(|d| d == *date).unwrap_or(false),
            SearchKey::Since(field, date) => date_of(ctx.message, field).map(|d| d >= *date).unwrap_or(false),
            SearchKey::Larger(size) => ctx.message.size_bytes > *size,
            SearchKey::Smaller(size) => ctx.message.size_bytes < *size,
            SearchKey::FlagSet(flag) => ctx.flags.contains(flag.as_str()),
            SearchKey::FlagUnset(flag) => !ctx.flags.contains(flag.as_str()),
            SearchKey::And(keys) => keys.iter().all(|k| k.matches(ctx)),
            SearchKey::Or(a, b) => a.matches(ctx) || b.matches(ctx),
            SearchKey::Not(inner) => !inner.matches(ctx),
        }
    }
}

fn date_of(message: &StoredMessage, field: &DateField) -> Option<NaiveDate> {
    match field {
        DateField::Received => Some(message.received_at.date_naive()),
        DateField::Sent => message.sent_date.map(|d| d.date_naive()),
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn header_contains(headers: &str, name: &str, needle: &str) -> bool {
    headers
        .lines()
        .filter(|line| line.to_lowercase().starts_with(&format!("{}:", name.to_lowercase())))
        .any(|line| line.to_lowercase().contains(&needle.to_lowercase()))
}

impl StoredMessage {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_range_handles_star_upper_bound() {
        let r = IdRange { start: 2, end: None };
        assert!(r.contains(5, 5));
        assert!(!r.contains(1, 5));
    }

    #[test]
    fn message_set_matches_any_range() {
        let set = MessageSet::Sequence(vec![IdRange::single(2), IdRange { start: 5, end: Some(7) }]);
        assert!(set.matches(2, 10));
        assert!(set.matches(6, 10));
        assert!(!set.matches(4, 10));
    }
}
