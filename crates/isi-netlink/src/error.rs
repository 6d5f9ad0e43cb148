//! Error taxonomy for the link monitor and configuration requests.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The kernel flagged the datagram as truncated, or a record ran past
    /// the end of the buffer.
    #[error("netlink message truncated")]
    Truncated,
    #[error("netlink protocol error: {0}")]
    Protocol(&'static str),
    /// Negative errno carried by an `NLMSG_ERROR` record.
    #[error("kernel rejected request: {0}")]
    Kernel(i32),
    #[error("no such device")]
    NoDevice,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl Error {
    /// Negative errno-style code for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            Error::Truncated | Error::Protocol(_) => -libc::EIO,
            Error::Kernel(code) => *code,
            Error::NoDevice => -libc::ENODEV,
            Error::InvalidArgument(_) => -libc::EINVAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
