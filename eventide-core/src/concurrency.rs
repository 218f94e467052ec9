//! Optimistic concurrency primitives.
//!
//! Every append carries an [`ExpectedVersion`] precondition. The store
//! compares it with the stream's current version inside its single-writer
//! critical section and rejects the append with a [`ConcurrencyConflict`] when
//! another writer got there first.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::StreamId;

/// Optimistic-concurrency precondition of an append.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// The stream must not exist yet.
    NoStream,
    /// The stream's last event must have exactly this version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expectation matching a stream whose last known version is `version`.
    #[must_use]
    pub const fn from_current(version: Option<u64>) -> Self {
        match version {
            Some(version) => Self::Exact(version),
            None => Self::NoStream,
        }
    }

    /// The stream version this expectation describes (`None` for a stream
    /// with no events).
    #[must_use]
    pub const fn as_current(self) -> Option<u64> {
        match self {
            Self::NoStream => None,
            Self::Exact(version) => Some(version),
        }
    }

    /// Signed form used in diagnostics: `-1` for [`ExpectedVersion::NoStream`].
    #[must_use]
    pub fn effective(self) -> i128 {
        self.as_current().map_or(-1, i128::from)
    }

    #[must_use]
    pub fn matches(self, current: Option<u64>) -> bool {
        self.as_current() == current
    }

    /// Version the first appended event receives.
    #[must_use]
    pub const fn next_version(self) -> u64 {
        match self {
            Self::NoStream => 0,
            Self::Exact(version) => version + 1,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoStream => f.write_str("no stream"),
            Self::Exact(version) => write!(f, "version {version}"),
        }
    }
}

/// Error indicating a concurrency conflict during append.
///
/// Returned when the stream changed between the moment it was read and the
/// moment the append was attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(.stream_id, .expected, .actual.as_ref()))]
pub struct ConcurrencyConflict {
    pub stream_id: StreamId,
    /// What the writer believed the stream looked like.
    pub expected: ExpectedVersion,
    /// The stream's version at the time of the append (`None` when the stream
    /// has no events).
    pub actual: Option<u64>,
}

/// Build a human-readable message for a [`ConcurrencyConflict`], including an
/// actionable hint for the caller.
fn format_conflict(
    stream_id: &StreamId,
    expected: &ExpectedVersion,
    actual: Option<&u64>,
) -> String {
    match (*expected, actual.copied()) {
        (ExpectedVersion::NoStream, Some(actual)) => format!(
            "concurrency conflict on stream {stream_id}: expected new stream, found version \
             {actual} (hint: another process created this stream; reload and retry)"
        ),
        (ExpectedVersion::Exact(expected), Some(actual)) => format!(
            "concurrency conflict on stream {stream_id}: expected version {expected}, found \
             {actual} (hint: stream was modified; reload and retry)"
        ),
        (ExpectedVersion::Exact(expected), None) => format!(
            "concurrency conflict on stream {stream_id}: expected version {expected}, found no \
             events (hint: stream does not exist)"
        ),
        (ExpectedVersion::NoStream, None) => {
            format!("concurrency conflict on stream {stream_id}: unexpected empty state")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_stream_matches_only_empty_streams() {
        assert!(ExpectedVersion::NoStream.matches(None));
        assert!(!ExpectedVersion::NoStream.matches(Some(0)));
        assert_eq!(ExpectedVersion::NoStream.effective(), -1);
        assert_eq!(ExpectedVersion::NoStream.next_version(), 0);
    }

    #[test]
    fn exact_matches_only_that_version() {
        let expected = ExpectedVersion::Exact(3);
        assert!(expected.matches(Some(3)));
        assert!(!expected.matches(Some(4)));
        assert!(!expected.matches(None));
        assert_eq!(expected.next_version(), 4);
    }

    #[test]
    fn from_current_roundtrips() {
        assert_eq!(ExpectedVersion::from_current(None), ExpectedVersion::NoStream);
        assert_eq!(
            ExpectedVersion::from_current(Some(7)).as_current(),
            Some(7)
        );
    }

    #[test]
    fn conflict_expected_new_stream_mentions_hint() {
        let conflict = ConcurrencyConflict {
            stream_id: StreamId::new(),
            expected: ExpectedVersion::NoStream,
            actual: Some(42),
        };
        let msg = conflict.to_string();
        assert!(msg.contains("expected new stream"));
        assert!(msg.contains("reload and retry"));
    }

    #[test]
    fn conflict_expected_version_includes_versions() {
        let conflict = ConcurrencyConflict {
            stream_id: StreamId::new(),
            expected: ExpectedVersion::Exact(5),
            actual: Some(10),
        };
        let msg = conflict.to_string();
        assert!(msg.contains("expected version 5"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn conflict_missing_stream_formats() {
        let conflict = ConcurrencyConflict {
            stream_id: StreamId::new(),
            expected: ExpectedVersion::Exact(0),
            actual: None,
        };
        assert!(conflict.to_string().contains("found no events"));
    }
}
