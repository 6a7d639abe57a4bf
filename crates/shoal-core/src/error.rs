use thiserror::Error;

/// Error taxonomy shared across the harness.
///
/// The categories drive control flow in the suite executor:
/// - [`Error::Config`] aborts before anything runs and is never retried.
/// - [`Error::TestFailure`] is recorded against the test; execution continues.
/// - [`Error::ServerFailure`] means the fixture is no longer in a known-good
///   state; no further tests run in the suite.
/// - [`Error::StopExecution`] abandons the suite immediately (e.g. an archive
///   completed but the fixture could not be restarted).
/// - [`Error::Internal`] is a harness bug (an illegal lifecycle transition, a
///   contract violation) and is always surfaced, never swallowed.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("test failure: {0}")]
    TestFailure(String),

    #[error("server failure: {0}")]
    ServerFailure(String),

    #[error("stopping execution: {0}")]
    StopExecution(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn test_failure(msg: impl Into<String>) -> Self {
        Self::TestFailure(msg.into())
    }

    pub fn server_failure(msg: impl Into<String>) -> Self {
        Self::ServerFailure(msg.into())
    }

    pub fn stop_execution(msg: impl Into<String>) -> Self {
        Self::StopExecution(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Promote a test failure to a server failure, keeping the message.
    ///
    /// Data-consistency hooks use this: a failing consistency probe means the
    /// fixture can no longer be trusted, so the whole suite must stop.
    #[must_use]
    pub fn promote_to_server_failure(self) -> Self {
        match self {
            Self::TestFailure(msg) => Self::ServerFailure(msg),
            other => other,
        }
    }
}
