//! Error taxonomy for ISI clients.

use std::io;

use thiserror::Error;

/// Errors surfaced synchronously by client operations.
///
/// The only asynchronous failure, a transaction timeout, is delivered
/// through the response callback instead (see [`crate::client::Message::is_timeout`]).
#[derive(Debug, Error)]
pub enum Error {
    /// Every transaction id of the client is in flight.
    #[error("transaction pool exhausted")]
    Busy,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The kernel accepted fewer bytes than the request frame holds.
    #[error("short write: {written} of {expected} bytes")]
    MessageTooLarge { written: usize, expected: usize },
    #[error("transaction timed out")]
    Timeout,
}

impl Error {
    /// Negative errno-style code for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Busy => -libc::EBUSY,
            Error::InvalidArgument(_) => -libc::EINVAL,
            Error::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            Error::MessageTooLarge { .. } => -libc::EMSGSIZE,
            Error::Timeout => -libc::ETIMEDOUT,
        }
    }

    /// Whether this is an I/O error that would have blocked.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
