// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Unified error handling for the mail server core.
//!
//! Every component returns a [`CoreResult`]. Protocol sessions are the only
//! place a [`CoreError`] is translated to wire bytes (SMTP numeric codes,
//! IMAP `BAD`/`NO`/`BYE`, POP3 `-ERR`); nothing upstream of a session
//! should format a response string itself.

use chrono::{DateTime, Utc};
use std::fmt;

/// Structured context attached to a [`CoreError`], useful for logging.
#[derive(Debug, Clone, Default)]
pub struct ErrorDetails {
    pub operation: Option<String>,
    pub context: Option<String>,
    pub source: Option<String>,
}

impl ErrorDetails {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            context: None,
            source: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Error taxonomy shared by every component (`spec.md` §9).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    /// Malformed command or command issued in the wrong session state.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Credentials did not verify.
    #[error("authentication failed")]
    AuthFailed,

    /// Account is locked out until the given time.
    #[error("account locked until {0}")]
    LockedOut(DateTime<Utc>),

    /// The requested folder/message/domain does not exist for this caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness invariant would be violated (e.g. a folder name already
    /// taken for this user).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Message exceeds size limit or user exceeds storage quota.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A transient failure (I/O, lock contention) that is safe to retry once.
    #[error("transient error: {0}")]
    Transient(String),

    /// Any other internal failure; the wire-facing message must stay generic.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn internal(msg: impl Into<String>) -> Self {
        CoreError::Internal(msg.into())
    }

    pub fn details(&self, operation: impl Into<String>) -> ErrorDetails {
        ErrorDetails::new(operation).with_source(self.to_string())
    }

    /// True if a caller may retry the same operation once before surfacing it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".to_string()),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Transient(err.to_string())
    }
}

/// Helper for sessions that need a one-line, client-safe rendering of an
/// internal failure without leaking internals onto the wire.
pub fn generic_wire_message(err: &CoreError) -> &'static str {
    match err {
        CoreError::Internal(_) | CoreError::Transient(_) => "internal server error",
        _ => "request failed",
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operation={:?} context={:?} source={:?}",
            self.operation, self.context, self.source
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_never_leaks_internal_detail() {
        let err = CoreError::Internal("sqlite disk I/O error on /var/lib/mail/t1.db".to_string());
        assert_eq!(generic_wire_message(&err), "internal server error");
    }

    #[test]
    fn transient_is_retryable_others_are_not() {
        assert!(CoreError::Transient("timeout".into()).is_retryable());
        assert!(!CoreError::AuthFailed.is_retryable());
    }
}
