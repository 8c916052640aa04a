//! Error types for fcp operations.

/// Alias for `Result<T, fcp::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the client and its engine.
///
/// Protocol-level outcomes (a failed insert, a closed connection) are not
/// errors: they resolve a command's result to `None`.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A command was built incorrectly; nothing was sent.
    #[error("invalid command: {0}")]
    Precondition(&'static str),

    /// The node refused the connection during the hello exchange.
    #[error("node refused connection: {0}")]
    Handshake(String),

    /// The engine stopped before resolving the command.
    #[error("engine dropped the command before it completed")]
    Dropped,

    /// An I/O error on the connection or a local payload source.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
