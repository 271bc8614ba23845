//! Error taxonomy surfaced at the filesystem boundary (spec §7).
//!
//! Every public operation returns [`Result<T>`]. Errors are never silently
//! swallowed: a failure partway through a multi-step operation (allocating an
//! index chain, renaming across directories) always propagates, after the
//! caller has released whatever buffers and rolled back whatever bits it
//! claimed.

use thiserror::Error;

/// The crate-wide result type.
pub type Result<T> = core::result::Result<T, Error>;

/// An error produced by the filesystem core.
#[derive(Error, Debug)]
pub enum Error {
    /// The data or inode bitmap is exhausted, or a reservation window search
    /// failed to find any placement.
    #[error("no space left on device")]
    NoSpace,

    /// The block I/O shim reported a read/write failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// A name exceeds [`crate::NAME_MAX`].
    #[error("name too long")]
    NameTooLong,

    /// `rmdir` was attempted on a directory with live records other than
    /// "." and "..".
    #[error("directory not empty")]
    NotEmpty,

    /// `add_entry` collided with an existing live name.
    #[error("entry already exists")]
    Exists,

    /// `find_entry` found no record with the given name.
    #[error("no such entry")]
    NotFound,

    /// A reservation invariant was violated, or a verify-chain mismatch was
    /// found while reading on-disk structures. The reservation tree is
    /// dumped via [`log::error!`] before this is returned.
    #[error("filesystem corruption detected: {0}")]
    Corrupted(String),

    /// A per-inode structure allocation failed (host is out of memory).
    #[error("out of memory")]
    OutOfMemory,
}

impl Error {
    /// Wraps a [`std::io::Error`] as [`Error::Io`].
    pub fn from_io(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::from_io(e)
    }
}
