//! Package errors defines the error variables that may be returned
//! during buffer pool operations.

use std::io;
use thiserror::Error;

use crate::common::types::BatId;

#[derive(Debug, Error, PartialEq)]
pub enum PoolError {
    /// Returned when an io operation failed.
    #[error("io error: {0}")]
    Io(String),

    /// ErrUnexpected is returned on an unexpected internal condition.
    #[error("{0}")]
    Unexpected(&'static str),

    ///////////////////////////////////////////////////////////////////////////
    // These errors are fatal: the pool refuses to initialise.
    ///////////////////////////////////////////////////////////////////////////
    /// The BBP.dir manifest is malformed or inconsistent with the files on
    /// disk.
    #[error("corrupt BBP directory: {0}")]
    Corrupt(String),

    /// The manifest was written by an incompatible server generation.
    #[error("directory version {found} not supported (this server reads {expected} and the two generations before it); it was probably written by a different server version")]
    VersionMismatch { found: u32, expected: u32 },

    /// Pointer/oid/int sizes recorded in the manifest do not match this
    /// binary.
    #[error("directory word sizes do not match this binary")]
    WordSizeMismatch,

    /// More farms than the registry can hold.
    #[error("too many farms")]
    TooManyFarms,

    /// No farm was registered for a required storage role before init.
    #[error("no farm registered for the requested role")]
    NoFarm,

    /// The id space of the two-level slot table is exhausted.
    #[error("bat id overflow")]
    IdOverflow,

    ///////////////////////////////////////////////////////////////////////////
    // These errors can be returned by rename.
    ///////////////////////////////////////////////////////////////////////////
    /// The new logical name exceeds the name length limit.
    #[error("name too long")]
    NameTooLong,

    /// The new logical name is empty, contains separators, or claims a
    /// temporary name that is not the slot's own.
    #[error("illegal name: {0}")]
    NameIllegal(String),

    /// Another bat already carries the requested logical name.
    #[error("name already in use: {0}")]
    NameExists(String),

    ///////////////////////////////////////////////////////////////////////////
    // Programmer errors. These additionally assert in debug builds.
    ///////////////////////////////////////////////////////////////////////////
    /// The id does not denote a live bat.
    #[error("no such bat: {0}")]
    NoSuchBat(BatId),

    /// An unfix/release without a matching fix/retain.
    #[error("reference count balance violated on bat {0}")]
    RefBalance(BatId),

    /// A type name that the atom registry does not know.
    #[error("unknown atom type: {0}")]
    UnknownAtom(String),

    /// Allocation failed; the slot being created has been returned to the
    /// free list.
    #[error("allocation failed")]
    OutOfMemory,
}

impl From<io::Error> for PoolError {
    #[inline]
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<&'static str> for PoolError {
    #[inline]
    fn from(s: &'static str) -> Self {
        Self::Unexpected(s)
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
