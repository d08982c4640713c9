// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.


use thiserror::Error;

/// Failure reported by the device itself, in POSIX terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    AlreadyExists,
    NotPermitted,
    NoSuchSlot,
    NotADirectory,
    NoSpace,
    Busy,
    Cancelled,
    Other(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::AlreadyExists => write!(f, "file exists"),
            Rejection::NotPermitted => write!(f, "operation not permitted"),
            Rejection::NoSuchSlot => write!(f, "no such file or slot"),
            Rejection::NotADirectory => write!(f, "not a directory"),
            Rejection::NoSpace => write!(f, "no space left on device"),
            Rejection::Busy => write!(f, "device busy"),
            Rejection::Cancelled => write!(f, "cancelled by device"),
            Rejection::Other(reason) => write!(f, "{}", reason),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("No device answered")]
    NoDevice,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for the device")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("Protocol desync: {0}")]
    Desync(String),

    #[error("Device rejected the request: {0}")]
    Rejected(Rejection),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Size mismatch: expected {expected} bytes, transferred {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

impl Error {
    /// Whether repeating the whole logical operation might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// User aborts are a normal terminal state, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub(crate) fn desync(msg: impl Into<String>) -> Self {
        Error::Desync(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
