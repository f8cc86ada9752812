use thiserror::Error;

/// Errors surfaced by the accounting core.
///
/// The variants double as control signals: `NotFound` ends the `list`
/// walk, `Exists` asks the caller to merge the on-disk state first, and
/// `Stale` tells the refresh timer that a rollover already triggered a
/// conntrack re-dump.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no space left in database")]
    NoSpace,

    #[error("invalid data: {0}")]
    Invalid(&'static str),

    #[error("not found")]
    NotFound,

    #[error("database file already exists")]
    Exists,

    #[error("accounting period rolled over")]
    Stale,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable numeric code reported over the control socket, matching
    /// the errno the condition corresponds to.
    pub fn code(&self) -> i32 {
        match self {
            Error::NoSpace => libc::ENOSPC,
            Error::Invalid(_) => libc::EINVAL,
            Error::NotFound => libc::ENOENT,
            Error::Exists => libc::EEXIST,
            Error::Stale => libc::ESTALE,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
