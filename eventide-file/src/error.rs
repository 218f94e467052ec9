use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Filesystem operation failure.
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A record could not be encoded or a complete record could not be
    /// decoded.
    #[error("serialization error in {}: {source}", path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// The log violates its ordering invariants.
    #[error("corrupt event log at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
    /// A writer panicked while holding the store lock.
    #[error("file store lock poisoned")]
    Poisoned,
    /// A failed write could not be cut back from the log. The store refuses
    /// further work; reopening it recovers from the staging file.
    #[error("file store halted after an unrecoverable write failure; reopen it to recover")]
    Halted,
    /// The blocking file task panicked or was cancelled.
    #[error("file task failed: {0}")]
    Task(#[source] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub(crate) fn serialization(
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(serde_json::Error) -> Self {
        let path = path.into();
        move |source| Self::Serialization { path, source }
    }
}
