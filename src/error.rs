use std::io;

use thiserror::Error;

/// Everything a mailbox or submission operation can fail with.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("timed out while {0}")]
    Timeout(String),
    #[error("server refused {0}")]
    Protocol(String),
    #[error("malformed message: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("cannot build outbound message: {0}")]
    Compose(String),
    #[error("submission failed: {0}")]
    Submission(String),
    #[error("worker task failed: {0}")]
    Task(String),
}

pub type Result<T, E = MailError> = std::result::Result<T, E>;

impl MailError {
    /// Classify an I/O failure that happened while `phase` was in progress.
    pub fn from_io(err: io::Error, phase: &str) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                MailError::Timeout(phase.to_string())
            }
            _ => MailError::Connect(format!("{phase}: {err}")),
        }
    }

    /// The socket is unusable after this error, so no goodbye should be attempted.
    pub fn is_transport(&self) -> bool {
        matches!(self, MailError::Connect(_) | MailError::Timeout(_))
    }

    pub(crate) fn from_imap(err: imap::Error, phase: &str) -> Self {
        match err {
            imap::Error::Io(e) => MailError::from_io(e, phase),
            imap::Error::No(msg) | imap::Error::Bad(msg) => {
                MailError::Protocol(format!("{phase}: {}", msg.trim()))
            }
            other => MailError::Protocol(format!("{phase}: {other}")),
        }
    }
}
