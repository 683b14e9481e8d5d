// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Parses the argument grammars `spec.md` §4.2/§4.7 require beyond the
//! shared line/literal framing in [`crate::protocol::framing`]: sequence
//! sets, `FETCH` attribute lists, `STORE` operations, and `SEARCH` keys.

use chrono::NaiveDate;

use crate::store::search::{DateField, IdRange, MessageSet, SearchKey};

/// Parses a sequence set like `1:3,5,7:*` into a [`MessageSet`]; `by_uid`
/// selects whether it is interpreted as sequence numbers or UIDs.
pub fn parse_message_set(raw: &str, by_uid: bool) -> Option<MessageSet> {
    let mut ranges = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let range = if let Some((start, end)) = part.split_once(':') {
            let start = parse_seq_token(start)?;
            let end = if end == "*" { None } else { Some(parse_seq_token(end)?) };
            IdRange { start, end }
        } else if part == "*" {
            IdRange { start: i64::MAX, end: None }
        } else {
            IdRange::single(parse_seq_token(part)?)
        };
        ranges.push(range);
    }
    if ranges.is_empty() {
        return None;
    }
    Some(if by_uid { MessageSet::Uid(ranges) } else { MessageSet::Sequence(ranges) })
}

fn parse_seq_token(token: &str) -> Option<i64> {
    if token == "*" {
        Some(i64::MAX)
    } else {
        token.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchAttr {
    Uid,
    Flags,
    InternalDate,
    Rfc822Size,
    Envelope,
    BodyStructure,
    Rfc822,
    Rfc822Header,
    Rfc822Text,
    Body { section: String, peek: bool },
}

/// Expands macro names (`ALL`, `FAST`, `FULL`) and parses an explicit
/// parenthesized attribute list, per `spec.md` §4.2 `fetch`.
pub fn parse_fetch_attrs(raw: &str) -> Vec<FetchAttr> {
    let raw = raw.trim();
    match raw.to_ascii_uppercase().as_str() {
        "ALL" => vec![FetchAttr::Flags, FetchAttr::InternalDate, FetchAttr::Rfc822Size, FetchAttr::Envelope],
        "FAST" => vec![FetchAttr::Flags, FetchAttr::InternalDate, FetchAttr::Rfc822Size],
        "FULL" => vec![
            FetchAttr::Flags,
            FetchAttr::InternalDate,
            FetchAttr::Rfc822Size,
            FetchAttr::Envelope,
            FetchAttr::BodyStructure,
        ],
        _ => {
            let inner = raw.trim_start_matches('(').trim_end_matches(')');
            split_top_level(inner).iter().filter_map(|tok| parse_single_attr(tok)).collect()
        }
    }
}

fn parse_single_attr(token: &str) -> Option<FetchAttr> {
    let upper = token.to_ascii_uppercase();
    if upper == "UID" {
        return Some(FetchAttr::Uid);
    }
    if upper == "FLAGS" {
        return Some(FetchAttr::Flags);
    }
    if upper == "INTERNALDATE" {
        return Some(FetchAttr::InternalDate);
    }
    if upper == "RFC822.SIZE" {
        return Some(FetchAttr::Rfc822Size);
    }
    if upper == "ENVELOPE" {
        return Some(FetchAttr::Envelope);
    }
    if upper == "BODYSTRUCTURE" {
        return Some(FetchAttr::BodyStructure);
    }
    if upper == "RFC822" {
        return Some(FetchAttr::Rfc822);
    }
    if upper == "RFC822.HEADER" {
        return Some(FetchAttr::Rfc822Header);
    }
    if upper == "RFC822.TEXT" {
        return Some(FetchAttr::Rfc822Text);
    }
    if let Some(section) = upper.strip_prefix("BODY.PEEK[").and_then(|s| s.strip_suffix(']')) {
        return Some(FetchAttr::Body { section: section.to_string(), peek: true });
    }
    if let Some(section) = upper.strip_prefix("BODY[").and_then(|s| s.strip_suffix(']')) {
        return Some(FetchAttr::Body { section: section.to_string(), peek: false });
    }
    None
}

/// Splits on spaces that are not nested inside `[...]` (section specifiers
/// like `BODY[HEADER.FIELDS (TO)]` contain spaces of their own).
fn split_top_level(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in input.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth -= 1;
                current.push(c);
            }
            ' ' if depth == 0 => {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOpKind {
    Replace,
    Add,
    Remove,
}

/// Parses `FLAGS`/`+FLAGS`/`-FLAGS` with an optional `.SILENT` suffix into
/// (`op`, `silent`); the flag list itself is parsed by the caller since it
/// shares the parenthesized-list grammar with `FETCH`.
pub fn parse_store_op(verb: &str) -> Option<(StoreOpKind, bool)> {
    let upper = verb.to_ascii_uppercase();
    let (base, silent) = match upper.strip_suffix(".SILENT") {
        Some(b) => (b, true),
        None => (upper.as_str(), false),
    };
    let op = match base {
        "FLAGS" => StoreOpKind::Replace,
        "+FLAGS" => StoreOpKind::Add,
        "-FLAGS" => StoreOpKind::Remove,
        _ => return None,
    };
    Some((op, silent))
}

pub fn parse_flag_list(raw: &str) -> Vec<String> {
    raw.trim().trim_start_matches('(').trim_end_matches(')').split_whitespace().map(|s| s.to_string()).collect()
}

/// Parses an IMAP `SEARCH` key list (`spec.md` §4.2 `search`). Supports a
/// conjunctive top-level list plus `OR`/`NOT`; unsupported tokens are
/// skipped rather than aborting the whole search.
pub fn parse_search_keys(tokens: &[String]) -> SearchKey {
    let mut keys = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let (key, consumed) = parse_one_search_key(tokens, i);
        if let Some(key) = key {
            keys.push(key);
        }
        i += consumed.max(1);
    }
    if keys.is_empty() {
        SearchKey::All
    } else if keys.len() == 1 {
        keys.into_iter().next().unwrap()
    } else {
        SearchKey::And(keys)
    }
}

fn parse_one_search_key(tokens: &[String], i: usize) -> (Option<SearchKey>, usize) {
    let tok = tokens[i].to_ascii_uppercase();
    match tok.as_str() {
        "ALL" => (Some(SearchKey::All), 1),
        "NOT" => {
            let (inner, consumed) = parse_one_search_key(tokens, i + 1);
            (inner.map(|k| SearchKey::Not(Box::new(k))), consumed + 1)
        }
        "OR" => {
            let (left, left_consumed) = parse_one_search_key(tokens, i + 1);
            let (right, right_consumed) = parse_one_search_key(tokens, i + 1 + left_consumed);
            match (left, right) {
                (Some(l), Some(r)) => (Some(SearchKey::Or(Box::new(l), Box::new(r))), 1 + left_consumed + right_consumed),
                _ => (None, 1 + left_consumed + right_consumed),
            }
        }
        "SUBJECT" | "FROM" | "TO" | "CC" | "BCC" | "BODY" | "TEXT" => {
            let arg = tokens.get(i + 1).cloned().unwrap_or_default();
            let key = match tok.as_str() {
                "SUBJECT" => SearchKey::Subject(arg),
                "FROM" => SearchKey::From(arg),
                "TO" => SearchKey::To(arg),
                "CC" => SearchKey::Cc(arg),
                "BCC" => SearchKey::Bcc(arg),
                "BODY" => SearchKey::Body(arg),
                _ => SearchKey::Text(arg),
            };
            (Some(key), 2)
        }
        "HEADER" => {
            let name = tokens.get(i + 1).cloned().unwrap_or_default();
            let value = tokens.get(i + 2).cloned().unwrap_or_default();
            (Some(SearchKey::Header(name, value)), 3)
        }
        "BEFORE" | "ON" | "SINCE" | "SENTBEFORE" | "SENTON" | "SENTSINCE" => {
            let date = tokens.get(i + 1).and_then(|s| parse_imap_date(s));
            let Some(date) = date else { return (None, 2) };
            let field = if tok.starts_with("SENT") { DateField::Sent } else { DateField::Received };
            let key = match tok.as_str() {
                "BEFORE" | "SENTBEFORE" => SearchKey::Before(field, date),
                "ON" | "SENTON" => SearchKey::On(field, date),
                _ => SearchKey::Since(field, date),
            };
            (Some(key), 2)
        }
        "LARGER" => (tokens.get(i + 1).and_then(|s| s.parse().ok()).map(SearchKey::Larger), 2),
        "SMALLER" => (tokens.get(i + 1).and_then(|s| s.parse().ok()).map(SearchKey::Smaller), 2),
        "SEEN" => (Some(SearchKey::FlagSet("\\Seen".to_string())), 1),
        "UNSEEN" => (Some(SearchKey::FlagUnset("\\Seen".to_string())), 1),
        "ANSWERED" => (Some(SearchKey::FlagSet("\\Answered".to_string())), 1),
        "UNANSWERED" => (Some(SearchKey::FlagUnset("\\Answered".to_string())), 1),
        "FLAGGED" => (Some(SearchKey::FlagSet("\\Flagged".to_string())), 1),
        "UNFLAGGED" => (Some(SearchKey::FlagUnset("\\Flagged".to_string())), 1),
        "DELETED" => (Some(SearchKey::FlagSet("\\Deleted".to_string())), 1),
        "UNDELETED" => (Some(SearchKey::FlagUnset("\\Deleted".to_string())), 1),
        _ => (None, 1),
    }
}

/// Parses an RFC 3501 `date` (`dd-Mon-yyyy`).
fn parse_imap_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%d-%b-%Y").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ranges_and_wildcards() {
        let set = parse_message_set("1:3,5,7:*", false).unwrap();
        assert!(!set.is_uid());
        assert!(set.matches(2, 10));
        assert!(set.matches(5, 10));
        assert!(set.matches(9, 10));
        assert!(!set.matches(4, 10));
    }

    #[test]
    fn expands_fetch_macros() {
        assert_eq!(parse_fetch_attrs("FAST"), vec![FetchAttr::Flags, FetchAttr::InternalDate, FetchAttr::Rfc822Size]);
    }

    #[test]
    fn parses_explicit_attr_list_with_section() {
        let attrs = parse_fetch_attrs("(UID FLAGS BODY.PEEK[HEADER])");
        assert!(attrs.contains(&FetchAttr::Uid));
        assert!(attrs.contains(&FetchAttr::Flags));
        assert!(attrs.iter().any(|a| matches!(a, FetchAttr::Body { peek: true, .. })));
    }

    #[test]
    fn parses_store_op_and_silent_suffix() {
        assert_eq!(parse_store_op("+FLAGS.SILENT"), Some((StoreOpKind::Add, true)));
        assert_eq!(parse_store_op("FLAGS"), Some((StoreOpKind::Replace, false)));
    }

    #[test]
    fn parses_conjunctive_search_keys() {
        let tokens: Vec<String> = vec!["UNSEEN".into(), "SUBJECT".into(), "hello".into()];
        let key = parse_search_keys(&tokens);
        assert!(matches!(key, SearchKey::And(_)));
    }
}
