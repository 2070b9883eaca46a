use thiserror::Error;

/// Why a resume attempt was rejected. `InvalidSession` is recoverable:
/// the client must fall back to a fresh identify on the same socket.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResumeError {
    #[error("session is not awaiting resume")]
    NotDisconnected,
    #[error("requested sequence is no longer buffered")]
    InvalidSession,
}
