//! Comment attached to MSB history records.
//!
//! # Responsibility
//! - Carry author, text, UTC date, status code and transaction correlation.
//!
//! # Invariants
//! - `text` is non-empty after trimming.
//! - Immutable after construction; history rows are append-only, so a
//!   status is fixed when the comment is recorded.

use crate::clock::now_epoch_ms;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Observer user identifier (case-insensitive, stored upper-case).
pub type UserId = String;

/// Status code recorded with each history comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsbStatus {
    /// MSB retrieved for observing.
    Fetched,
    /// One repeat of the MSB observed.
    Done,
    /// MSB administratively completed.
    AllDone,
    /// A previous done was reverted.
    Undone,
    /// Observing stopped part way through the MSB.
    Suspended,
    /// Observation attempt rejected by the observer.
    Rejected,
    /// Free-form annotation without state change.
    Comment,
    /// MSB aborted at the telescope.
    Aborted,
    /// Program submitted; the entry carries the MSB's submitted state.
    Stored,
    /// OR sibling removed when its group was satisfied.
    Removed,
    /// OR sibling restored by an undo.
    Restored,
}

impl MsbStatus {
    /// Stable storage label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::Done => "done",
            Self::AllDone => "all_done",
            Self::Undone => "undone",
            Self::Suspended => "suspended",
            Self::Rejected => "rejected",
            Self::Comment => "comment",
            Self::Aborted => "aborted",
            Self::Stored => "stored",
            Self::Removed => "removed",
            Self::Restored => "restored",
        }
    }

    /// Parses a storage label.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fetched" => Some(Self::Fetched),
            "done" => Some(Self::Done),
            "all_done" => Some(Self::AllDone),
            "undone" => Some(Self::Undone),
            "suspended" => Some(Self::Suspended),
            "rejected" => Some(Self::Rejected),
            "comment" => Some(Self::Comment),
            "aborted" => Some(Self::Aborted),
            "stored" => Some(Self::Stored),
            "removed" => Some(Self::Removed),
            "restored" => Some(Self::Restored),
            _ => None,
        }
    }
}

impl Display for MsbStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comment validation/mutation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommentError {
    EmptyText,
}

impl Display for CommentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyText => write!(f, "comment text cannot be empty"),
        }
    }
}

impl Error for CommentError {}

/// Immutable history annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    author: Option<UserId>,
    text: String,
    date: i64,
    status: MsbStatus,
    transaction_id: Option<String>,
}

impl Comment {
    /// Creates a comment dated now (UTC).
    pub fn new(text: impl Into<String>, status: MsbStatus) -> Result<Self, CommentError> {
        Self::with_date(text, status, now_epoch_ms())
    }

    /// Creates a comment with an explicit epoch-millisecond date.
    ///
    /// Used when rebuilding comments from persisted history.
    pub fn with_date(
        text: impl Into<String>,
        status: MsbStatus,
        date: i64,
    ) -> Result<Self, CommentError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(CommentError::EmptyText);
        }
        Ok(Self {
            author: None,
            text,
            date,
            status,
            transaction_id: None,
        })
    }

    /// Sets the author; blank ids are treated as absent.
    pub fn by(mut self, author: Option<&str>) -> Self {
        self.author = author
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_uppercase);
        self
    }

    /// Sets the transaction id; blank ids are treated as absent.
    pub fn in_transaction(mut self, transaction_id: Option<&str>) -> Self {
        self.transaction_id = transaction_id
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        self
    }

    /// Comment sharing this comment's author, date and transaction.
    pub fn derived(
        &self,
        text: impl Into<String>,
        status: MsbStatus,
    ) -> Result<Self, CommentError> {
        Ok(Self::with_date(text, status, self.date)?
            .by(self.author())
            .in_transaction(self.transaction_id()))
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Epoch milliseconds (UTC).
    pub fn date(&self) -> i64 {
        self.date
    }

    pub fn status(&self) -> MsbStatus {
        self.status
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::{Comment, CommentError, MsbStatus};

    #[test]
    fn blank_text_is_rejected() {
        assert_eq!(
            Comment::new("   ", MsbStatus::Done).unwrap_err(),
            CommentError::EmptyText
        );
    }

    #[test]
    fn author_and_transaction_are_normalized() {
        let comment = Comment::new("observed", MsbStatus::Done)
            .unwrap()
            .by(Some(" jdoe "))
            .in_transaction(Some(""));
        assert_eq!(comment.author(), Some("JDOE"));
        assert_eq!(comment.transaction_id(), None);
        assert!(comment.date() > 0);
    }

    #[test]
    fn derived_comment_shares_author_date_and_transaction() {
        let done = Comment::with_date("observed", MsbStatus::Done, 42)
            .unwrap()
            .by(Some("jdoe"))
            .in_transaction(Some("tx-7"));
        let removed = done.derived("Removed from OR group", MsbStatus::Removed).unwrap();
        assert_eq!(removed.status(), MsbStatus::Removed);
        assert_eq!(removed.author(), done.author());
        assert_eq!(removed.date(), 42);
        assert_eq!(removed.transaction_id(), Some("tx-7"));
        assert_eq!(done.status(), MsbStatus::Done);
        assert!(done.derived(" ", MsbStatus::Removed).is_err());
    }

    #[test]
    fn status_labels_round_trip() {
        for status in [
            MsbStatus::Fetched,
            MsbStatus::Done,
            MsbStatus::AllDone,
            MsbStatus::Undone,
            MsbStatus::Suspended,
            MsbStatus::Rejected,
            MsbStatus::Comment,
            MsbStatus::Aborted,
            MsbStatus::Stored,
            MsbStatus::Removed,
            MsbStatus::Restored,
        ] {
            assert_eq!(MsbStatus::parse(status.as_str()), Some(status));
        }
    }
}
